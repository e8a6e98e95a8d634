//! HTTP + WebSocket control plane for the Trellis engine (axum).
//!
//! REST routes cover every engine operation; `GET /runs/{id}/events`
//! upgrades to a WebSocket that replays the run's event log and then tails
//! the live stream, one JSON envelope per message.
//!
//! **Public API**: [`run_serve`], [`run_serve_on_listener`].

mod app;
mod error;
mod events;
mod handlers;

pub use app::{router, AppState};

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use trellis::Engine;

pub const DEFAULT_ADDR: &str = "127.0.0.1:4517";

/// Serves the control plane on an existing listener. Used by tests (bind
/// to 127.0.0.1:0, then pass the listener in).
pub async fn run_serve_on_listener(
    listener: TcpListener,
    engine: Engine,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = listener.local_addr()?;
    let restored = engine.open_existing();
    if restored > 0 {
        info!(runs = restored, "restored persisted runs");
    }
    engine.start();
    info!("control plane listening on http://{}", addr);

    let state = Arc::new(AppState { engine });
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Binds `addr` (default `127.0.0.1:4517`) and serves the control plane.
pub async fn run_serve(
    addr: Option<&str>,
    engine: Engine,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = addr.unwrap_or(DEFAULT_ADDR);
    let listener = TcpListener::bind(addr).await?;
    run_serve_on_listener(listener, engine).await
}
