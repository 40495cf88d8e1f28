use std::{sync::Arc, time::Duration};

use tokio::{
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::debug;

use crate::MemoryLocationService;

/// Runs [`MemoryLocationService::expire`] every `period` until the task is aborted.
pub fn spawn_expiry_sweep(
    service: Arc<MemoryLocationService>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let now = ticker.tick().await;
            let removed = service.expire(now);
            if removed > 0 {
                debug!(removed, "expired bindings swept");
            }
        }
    })
}
