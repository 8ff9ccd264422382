//! JSON-RPC server implementation for marquee-daemon.

use anyhow::{Context, Result};
use jsonrpsee::server::{Server, ServerHandle};
use std::net::SocketAddr;
use tracing::info;

use super::handlers::{ApiImpl, MarqueeApiServer};

/// Start the JSON-RPC API server on `bind_address`.
///
/// Returns the handle that keeps the server running and the address it is
/// listening on (useful when binding port 0).
pub async fn start_server(bind_address: &str, api: ApiImpl) -> Result<(ServerHandle, SocketAddr)> {
    info!("Starting JSON-RPC server on {}", bind_address);

    let server = Server::builder()
        .build(bind_address)
        .await
        .with_context(|| format!("Failed to build JSON-RPC server on {}", bind_address))?;

    let addr = server
        .local_addr()
        .context("Failed to get server address")?;
    info!("JSON-RPC server listening on {}", addr);

    let handle = server.start(api.into_rpc());

    Ok((handle, addr))
}
