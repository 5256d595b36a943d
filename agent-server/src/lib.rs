//! HTTP/WebSocket host process for the agent runtime.
//!
//! The host registers one or more agent classes, then serves
//! `/<prefix>/<class>/<name>`: a WebSocket upgrade is admitted into the
//! duplex protocol (§4.2), every other request is forwarded to the
//! addressed instance's `on_request` hook (§6).

mod connection;
mod router;
mod state;

pub use connection::FrameSender;
pub use router::router;
pub use state::{AgentFactory, ServerState};

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Runs the server on an existing listener; returns once the listener
/// closes. Used directly by tests, which bind to `127.0.0.1:0` and read
/// back the assigned port.
pub async fn run_server_on_listener(
    listener: TcpListener,
    state: Arc<ServerState>,
) -> Result<(), std::io::Error> {
    let addr = listener.local_addr()?;
    info!(%addr, prefix = %state.prefix, "agent-server listening");
    let app = router::router(state);
    axum::serve(listener, app).await
}

/// Runs the server, binding `addr` (default `127.0.0.1:8080`).
pub async fn run_server(addr: Option<&str>, state: Arc<ServerState>) -> Result<(), std::io::Error> {
    let addr = addr.unwrap_or(DEFAULT_ADDR);
    let listener = TcpListener::bind(addr).await?;
    run_server_on_listener(listener, state).await
}

/// Builds a [`ServerState`] with its per-agent store directory resolved
/// from `AGENT_STORE_DIR` (falling back to `./agent-store`), after applying
/// `agent-config`'s `.env`/XDG precedence so that variable is honored the
/// same way any other provider credential would be.
pub fn default_state(app_name: &str) -> Arc<ServerState> {
    let _ = agent_config::load_and_apply(app_name, None);
    let store_dir = std::env::var("AGENT_STORE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./agent-store"));
    Arc::new(ServerState::new(store_dir))
}
