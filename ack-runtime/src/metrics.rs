use std::time::Duration;

use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter},
};

use crate::{errors::ControllerError, types::GroupKind};

const SERVICE_CONTROLLER: &str = "ack_service_controller";

pub(crate) fn metric_name(name: &str) -> String {
    format!("ack_{}", name)
}

/// Reconcile and backend API call instruments.
pub struct Metrics {
    reconcile_count: Counter<u64>,
    reconcile_errors: Counter<u64>,
    reconcile_duration: Histogram<u64>,
    api_call_count: Counter<u64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let meter: Meter = global::meter(SERVICE_CONTROLLER);
        let reconcile_count = meter
            .u64_counter(metric_name("reconcile_count"))
            .with_description("Count of reconcile invocations")
            .build();
        let reconcile_errors = meter
            .u64_counter(metric_name("reconcile_errors"))
            .with_description("Count of reconcile invocations which failed")
            .build();
        let reconcile_duration = meter
            .u64_histogram(metric_name("reconcile_duration_ms"))
            .with_description("Reconcile duration in milliseconds")
            .with_unit("ms")
            .build();
        let api_call_count = meter
            .u64_counter(metric_name("api_call_count"))
            .with_description("Count of backend API calls")
            .build();
        Self {
            reconcile_count,
            reconcile_errors,
            reconcile_duration,
            api_call_count,
        }
    }

    pub fn record_reconcile(&self, group_kind: &GroupKind, outcome: &str, duration: Duration) {
        let labels = &[
            KeyValue::new("kind", group_kind.to_string()),
            KeyValue::new("outcome", outcome.to_string()),
        ];
        self.reconcile_count.add(1, labels);
        self.reconcile_duration
            .record(duration.as_millis() as u64, labels);
    }

    pub fn record_reconcile_error(&self, group_kind: &GroupKind) {
        self.reconcile_errors
            .add(1, &[KeyValue::new("kind", group_kind.to_string())]);
    }

    /// Count a backend API call, e.g. `("READ_ONE", "DescribeBook")`.
    pub fn record_api_call<T>(&self, op_type: &'static str, op_id: &'static str, result: &Result<T, ControllerError>) {
        let status = match result {
            Ok(_) => "success",
            Err(e) => e.status_class(),
        };
        self.api_call_count.add(
            1,
            &[
                KeyValue::new("op_type", op_type),
                KeyValue::new("op_id", op_id),
                KeyValue::new("status", status),
            ],
        );
    }
}
