//! Timer C (RFC 3261 §16.6 step 11 and §16.8).
//!
//! Armed for every INVITE branch and restarted by each provisional other
//! than 100. When it fires on a branch that has seen a provisional the
//! branch is cancelled; a branch still waiting for its first response is
//! left to the transaction layer's own timeout.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use sip_transaction::{TimerHandle, TimerScheduler, TransactionId, TransactionState};
use tracing::debug;

use crate::{
    mapping::{SharedMapping, TransactionMapping},
    send_cancel, Counters,
};

pub(crate) fn arm(
    scheduler: &dyn TimerScheduler,
    delay: Duration,
    mapping: &SharedMapping,
    client: TransactionId,
    counters: &Arc<Counters>,
) -> TimerHandle {
    let mapping: Weak<Mutex<TransactionMapping>> = Arc::downgrade(mapping);
    let counters = Arc::clone(counters);
    scheduler.schedule(
        delay,
        Box::new(move || {
            if let Some(mapping) = mapping.upgrade() {
                fire(&mapping, &client, &counters);
            }
        }),
    )
}

fn fire(mapping: &SharedMapping, client: &TransactionId, counters: &Counters) {
    let claimed = {
        let mut mapping = mapping.lock();
        let provider = Arc::clone(mapping.provider());
        let Some(branch) = mapping.branch_mut(client) else {
            return;
        };
        branch.timer_c = None;
        if branch.tx().state() != TransactionState::Proceeding {
            debug!(client = %client, "Timer C fired before any provisional");
            return;
        }
        branch.claim_cancel().map(|tx| (provider, tx))
    };
    if let Some((provider, tx)) = claimed {
        debug!(client = %client, "Timer C fired, cancelling branch");
        send_cancel(provider.as_ref(), tx.as_ref(), counters);
    }
}
