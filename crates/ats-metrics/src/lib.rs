//! ---
//! ats_section: "03-persistence-logging"
//! ats_subsection: "module"
//! ats_type: "source"
//! ats_scope: "code"
//! ats_description: "Metrics collection and export utilities."
//! ats_version: "v0.0.0-prealpha"
//! ats_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{Encoder, IntGauge, Opts, Registry, TextEncoder, TEXT_FORMAT};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// One exported gauge: metric name, help text and the accessor reading it from a snapshot.
pub type GaugeSpec<T> = (&'static str, &'static str, fn(&T) -> i64);

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// A fixed set of gauges fed from one snapshot type, declared as a static
/// [`GaugeSpec`] slice next to the type it reads.
pub struct GaugeTable<T> {
    entries: Vec<(IntGauge, fn(&T) -> i64)>,
}

impl<T: 'static> GaugeTable<T> {
    /// Register every entry of `specs` with the registry.
    pub fn register(registry: &Registry, specs: &'static [GaugeSpec<T>]) -> Result<Self> {
        let mut entries = Vec::with_capacity(specs.len());
        for (name, help, read) in specs {
            let gauge = IntGauge::with_opts(Opts::new(*name, *help))
                .with_context(|| format!("invalid gauge definition {}", name))?;
            registry
                .register(Box::new(gauge.clone()))
                .with_context(|| format!("failed to register gauge {}", name))?;
            entries.push((gauge, *read));
        }
        Ok(Self { entries })
    }

    /// Refresh every gauge from the latest snapshot.
    pub fn update(&self, snapshot: &T) {
        for (gauge, read) in &self.entries {
            gauge.set(read(snapshot));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> std::fmt::Debug for GaugeTable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GaugeTable")
            .field("gauges", &self.entries.len())
            .finish()
    }
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, HeaderValue::from_static(TEXT_FORMAT))],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address for convenience.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;

    struct Sample {
        closed: bool,
        runtime: u64,
    }

    static SAMPLE_GAUGES: &[GaugeSpec<Sample>] = &[
        ("sample_closed", "Contactor closed flag", |s| s.closed as i64),
        ("sample_runtime_seconds", "Runtime in seconds", |s| {
            s.runtime as i64
        }),
    ];

    #[test]
    fn gauge_table_tracks_snapshot_values() {
        let registry = new_registry();
        let table = GaugeTable::register(&registry, SAMPLE_GAUGES).unwrap();
        assert_eq!(table.len(), 2);

        table.update(&Sample {
            closed: true,
            runtime: 42,
        });
        let families = registry.gather();
        let runtime = families
            .iter()
            .find(|f| f.get_name() == "sample_runtime_seconds")
            .unwrap();
        assert_eq!(runtime.get_metric()[0].get_gauge().get_value(), 42.0);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = new_registry();
        GaugeTable::register(&registry, SAMPLE_GAUGES).unwrap();
        assert!(GaugeTable::register(&registry, SAMPLE_GAUGES).is_err());
    }

    #[tokio::test]
    async fn exporter_serves_registered_gauges() {
        let registry = new_registry();
        let table = GaugeTable::register(&registry, SAMPLE_GAUGES).unwrap();
        table.update(&Sample {
            closed: false,
            runtime: 7,
        });
        let server = spawn_http_server(registry, SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();

        let response = reqwest::get(format!("http://{}/metrics", server.addr()))
            .await
            .unwrap();
        assert_eq!(
            response.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            TEXT_FORMAT
        );
        let body = response.text().await.unwrap();
        assert!(body.contains("sample_runtime_seconds 7"));

        server.shutdown().await.unwrap();
    }
}
