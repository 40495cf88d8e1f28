//! Cancellable one-shot timers.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::{runtime::Handle, sync::oneshot, time};

/// Identifies a scheduled timer so it can be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Runs an action once after a delay unless cancelled first.
pub trait TimerScheduler: Send + Sync {
    fn schedule(&self, delay: Duration, action: Box<dyn FnOnce() + Send>) -> TimerHandle;

    /// Cancels a pending timer. Cancelling a fired or unknown timer is a no-op.
    fn cancel(&self, handle: TimerHandle);
}

/// [`TimerScheduler`] backed by tokio tasks.
///
/// Each timer is a task racing `time::sleep` against a oneshot cancel signal.
#[derive(Clone)]
pub struct TokioScheduler {
    runtime: Handle,
    next_id: Arc<AtomicU64>,
    pending: Arc<DashMap<u64, oneshot::Sender<()>>>,
}

impl TokioScheduler {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            next_id: Arc::new(AtomicU64::new(1)),
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Number of timers that have neither fired nor been cancelled.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl TimerScheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, action: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        self.pending.insert(id, cancel_tx);

        let pending = Arc::clone(&self.pending);
        self.runtime.spawn(async move {
            tokio::select! {
                _ = time::sleep(delay) => {
                    if pending.remove(&id).is_some() {
                        action();
                    }
                }
                _ = &mut cancel_rx => {}
            }
        });
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        if let Some((_, cancel)) = self.pending.remove(&handle.0) {
            let _ = cancel.send(());
        }
    }
}
