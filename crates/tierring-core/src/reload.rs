//! Background ring reloading.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::ring::Ring;

/// Spawns a task that checks `ring`'s file every `interval` and swaps in a
/// new snapshot when it changes. Abort the returned handle to stop it.
///
/// File reads run on the blocking pool. Failures are logged and the
/// previous snapshot stays in place.
pub fn spawn_reload_task(ring: Arc<Ring>, interval: Duration) -> JoinHandle<()> {
    let period = interval.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let ring = Arc::clone(&ring);
            match tokio::task::spawn_blocking(move || ring.reload_if_changed()).await {
                Ok(Ok(true)) => debug!("background check installed a new ring"),
                Ok(Ok(false)) => {}
                Ok(Err(e)) => warn!(error = %e, "background ring reload failed"),
                Err(e) => warn!(error = %e, "ring reload task did not complete"),
            }
        }
    })
}
