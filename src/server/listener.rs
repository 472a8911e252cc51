use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::engine::ContextManager;
use crate::http::connection::Connection;

/// Accepts connections until the listener fails, one task per connection.
pub async fn run(listener: TcpListener, manager: Arc<ContextManager>, secure: bool) -> anyhow::Result<()> {
    info!("Listening on {}", listener.local_addr()?);

    loop {
        let (socket, peer) = listener.accept().await?;
        tracing::debug!("Accepted connection from {}", peer);

        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            let mut conn = Connection::new(socket, peer, manager, secure);
            if let Err(e) = conn.run().await {
                tracing::error!("Connection error from {}: {}", peer, e);
            }
        });
    }
}
