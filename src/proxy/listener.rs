use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use super::{AppContext, server};

/// Accept loop: each connection runs to completion on its own task.
pub async fn serve(listener: TcpListener, app: AppContext) -> Result<()> {
    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, "proxy listener started");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                error!(error = %err, "failed to accept incoming connection");
                continue;
            }
        };
        debug!(peer = %peer, "accepted connection");
        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %err, "failed to set TCP_NODELAY on client stream");
        }
        let connection_app = app.clone();
        tokio::spawn(async move {
            if let Err(err) = server::serve_plain(stream, peer, connection_app).await {
                debug!(peer = %peer, error = %err, "connection closed with error");
            }
        });
    }
}
