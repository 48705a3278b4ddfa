#[macro_use]
extern crate log;

pub mod adoption;
pub mod cache;
pub mod compare;
pub mod config;
pub mod descriptor;
pub mod errors;
pub mod hooks;
pub mod metrics;
pub mod prometheus_exporter;
pub mod reconciler;
pub mod registry;
pub mod requeue;
pub mod service_controller;
pub mod services;
pub mod session;
pub mod store;
pub mod tags;
pub mod types;

#[cfg(test)]
mod testing;

/// The K8s field manager name.
pub const MANAGER: &str = "ack-runtime";
