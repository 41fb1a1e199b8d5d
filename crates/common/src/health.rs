//! Minimal liveness endpoint: `GET /` answers `<name> 1` while the owning
//! daemon reports itself healthy, `<name> 0` otherwise. The oracle flips
//! the flag on clean ticks; the keeper when a quorum is assemblable or the
//! contract is paused.

use axum::{extract::State, routing::get, Router};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{error, info};

#[derive(Clone)]
struct HealthState {
    name: &'static str,
    healthy: Arc<AtomicBool>,
}

async fn health(State(state): State<HealthState>) -> String {
    let flag = if state.healthy.load(Ordering::Relaxed) {
        1
    } else {
        0
    };
    format!("{} {flag}", state.name)
}

/// Spawns the health server in the background; the returned flag is flipped
/// by the daemon loop.
pub fn spawn(name: &'static str, addr: SocketAddr) -> Arc<AtomicBool> {
    let healthy = Arc::new(AtomicBool::new(false));
    let state = HealthState {
        name,
        healthy: healthy.clone(),
    };
    tokio::spawn(async move {
        let app = Router::new().route("/", get(health)).with_state(state);
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                info!("health endpoint listening on {addr}");
                if let Err(err) = axum::serve(listener, app).await {
                    error!("health endpoint failed: {err}");
                }
            }
            Err(err) => error!("failed to bind health endpoint on {addr}: {err}"),
        }
    });
    healthy
}
