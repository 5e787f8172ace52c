//! HTTP statistics endpoint.
//!
//! Serves the aggregator's latest snapshot as JSON. The server runs a
//! current-thread tokio runtime on its own OS thread so the datapath stays
//! free of async machinery.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tracing::{error, info};

use crate::config::Config;
use crate::error::Result;
use crate::metric::{StatsHandle, StatsSnapshot};

/// The statistics HTTP server.
pub struct Api {
    bind: SocketAddr,
    stats: StatsHandle,
}

impl Api {
    pub fn new(cfg: &Config, stats: StatsHandle) -> Self {
        Self {
            bind: SocketAddr::new(cfg.stats_address.into(), cfg.stats_port),
            stats,
        }
    }

    /// Start serving on a dedicated thread.
    pub fn start(self, stop: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
        Ok(std::thread::Builder::new()
            .name("shroud-api".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Stats API runtime failed to start: {}", e);
                        return;
                    }
                };
                runtime.block_on(self.serve(stop));
            })?)
    }

    async fn serve(self, stop: Arc<AtomicBool>) {
        let app = Router::new()
            .route("/metrics", get(handle_metrics))
            .route("/health", get(handle_health))
            .with_state(self.stats);

        let listener = match tokio::net::TcpListener::bind(self.bind).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Stats API bind {} failed: {}", self.bind, e);
                return;
            }
        };
        info!("Stats API listening on {}", self.bind);

        let shutdown = async move {
            while !stop.load(Ordering::Relaxed) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("Stats API server error: {}", e);
        }
    }
}

async fn handle_metrics(State(stats): State<StatsHandle>) -> Json<StatsSnapshot> {
    Json(stats.read().unwrap().clone())
}

async fn handle_health() -> &'static str {
    "ok"
}
