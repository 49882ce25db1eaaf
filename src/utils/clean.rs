use std::time::Duration;
use tokio::time;
use tracing::info;
use crate::state::SharedRegistry;

/// Purges unredeemed tokens every `ttl / 2` (at least once a second).
pub async fn task(registry: SharedRegistry, ttl: Duration) {
    let mut tick = time::interval((ttl / 2).max(Duration::from_secs(1)));
    loop {
        tick.tick().await;
        let purged = registry.purge_expired(ttl).await;
        if purged > 0 {
            info!(purged, "expired pending sessions");
        }
    }
}
