use std::{convert::Infallible, net::SocketAddr};

use http_body_util::Full;
use hyper::{
    Request, Response, StatusCode,
    body::{Bytes, Incoming},
    header::{CONTENT_TYPE, HeaderValue},
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use opentelemetry::global;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, Registry, TEXT_FORMAT, TextEncoder};
use tokio::net::TcpListener;

/// Install a global meter provider exporting into the returned registry.
pub fn init_prometheus_exporter() -> anyhow::Result<Registry> {
    let registry = Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let provider = SdkMeterProvider::builder().with_reader(exporter).build();
    global::set_meter_provider(provider);
    Ok(registry)
}

async fn serve_req(
    _req: Request<Incoming>,
    registry: Registry,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut result = Vec::new();
    let response = match encoder.encode(&metric_families, &mut result) {
        Ok(_) => {
            let mut response = Response::new(Full::new(Bytes::from(result)));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_FORMAT));
            response
        }
        Err(e) => {
            error!("{}", e);
            let mut response = Response::new(Full::new(Bytes::new()));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    };
    Ok(response)
}

pub async fn start_prometheus_metrics_server(addr: SocketAddr, registry: Registry) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("serving metrics on http://{}", addr);
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let registry = registry.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| serve_req(req, registry.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("metrics connection failed: {}", e);
            }
        });
    }
}
