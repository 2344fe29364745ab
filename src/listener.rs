//! TCP accept loop: binds once, spawns one task per accepted connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::TcpListener;
use tokio::sync::RwLock;

use crate::conn::Conn;
use crate::events::EventBus;
use crate::session::run_session;
use crate::upstream::UpstreamRegistry;

/// Binds `addr` and accepts connections forever, spawning [`run_session`] on
/// a fresh `tokio` task for each one. Returns only if the accept itself
/// cannot be retried (the listener socket is gone); per-connection errors
/// are logged and do not stop the loop.
pub async fn run(
    addr: &str,
    events: Arc<EventBus>,
    registry: Arc<RwLock<UpstreamRegistry>>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    log::info!("listening on {addr}");

    let next_id = Arc::new(AtomicU64::new(1));

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("accept failed: {e}");
                continue;
            }
        };

        let id = next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Conn::new_client(stream, id, peer, Arc::clone(&events));
        let events = Arc::clone(&events);
        let registry = Arc::clone(&registry);

        tokio::spawn(async move {
            run_session(conn, events, registry).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connection_ids_are_assigned_in_increasing_order() {
        let next_id = Arc::new(AtomicU64::new(1));
        let a = next_id.fetch_add(1, Ordering::Relaxed);
        let b = next_id.fetch_add(1, Ordering::Relaxed);
        let c = next_id.fetch_add(1, Ordering::Relaxed);
        assert_eq!((a, b, c), (1, 2, 3));
    }
}
