use std::{collections::BTreeMap, time::Duration};

use parking_lot::Mutex;
use sip_transaction::{TimerHandle, TimerScheduler};

type Action = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Clock {
    now: Duration,
    next_id: u64,
    timers: BTreeMap<(Duration, u64), Action>,
}

/// Deterministic [`TimerScheduler`]: timers fire only from [`advance`](Self::advance).
///
/// Timers due at the same instant fire in scheduling order. Actions may
/// schedule or cancel further timers.
#[derive(Default)]
pub struct ManualScheduler {
    clock: Mutex<Clock>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the clock forward and runs every timer that became due.
    pub fn advance(&self, by: Duration) {
        let target = self.clock.lock().now + by;
        loop {
            let action = {
                let mut clock = self.clock.lock();
                let due = clock
                    .timers
                    .keys()
                    .next()
                    .copied()
                    .filter(|(deadline, _)| *deadline <= target);
                match due {
                    Some(key) => {
                        clock.now = key.0;
                        clock.timers.remove(&key)
                    }
                    None => {
                        clock.now = target;
                        None
                    }
                }
            };
            match action {
                Some(action) => action(),
                None => break,
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.clock.lock().timers.len()
    }

    /// Time elapsed since the scheduler was created.
    pub fn elapsed(&self) -> Duration {
        self.clock.lock().now
    }
}

impl TimerScheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, action: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let mut clock = self.clock.lock();
        clock.next_id += 1;
        let id = clock.next_id;
        let deadline = clock.now + delay;
        clock.timers.insert((deadline, id), action);
        TimerHandle::new(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        self.clock
            .lock()
            .timers
            .retain(|(_, id), _| *id != handle.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fires_in_deadline_order() {
        let scheduler = ManualScheduler::new();
        let fired = Arc::new(Mutex::new(Vec::new()));
        for (name, secs) in [("b", 20), ("a", 10), ("c", 20)] {
            let fired = Arc::clone(&fired);
            scheduler.schedule(
                Duration::from_secs(secs),
                Box::new(move || fired.lock().push(name)),
            );
        }

        scheduler.advance(Duration::from_secs(15));
        assert_eq!(*fired.lock(), vec!["a"]);
        scheduler.advance(Duration::from_secs(5));
        assert_eq!(*fired.lock(), vec!["a", "b", "c"]);
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(scheduler.elapsed(), Duration::from_secs(20));
    }

    #[test]
    fn cancel_removes_timer() {
        let scheduler = ManualScheduler::new();
        let handle = scheduler.schedule(Duration::from_secs(1), Box::new(|| panic!("fired")));
        scheduler.cancel(handle);
        scheduler.advance(Duration::from_secs(2));
        assert_eq!(scheduler.pending(), 0);
    }
}
