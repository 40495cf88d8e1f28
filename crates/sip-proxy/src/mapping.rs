//! Links a server transaction to the client transactions it was forked to.
//!
//! A [`TransactionMapping`] is shared by the server transaction and every
//! branch. [`MappingTable`] indexes it by the server transaction id and by
//! each client transaction id; entries are dropped once the server
//! transaction and every branch have terminated.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use sip_core::{MessageError, Method, Response};
use sip_transaction::{
    ClientTransaction, ServerTransaction, SipProvider, TimerHandle, TransactionId,
    TransactionState,
};

use crate::context::ResponseContext;

pub type SharedMapping = Arc<Mutex<TransactionMapping>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pending,
    Final,
    TimedOut,
    Terminated,
}

pub struct Branch {
    tx: Arc<dyn ClientTransaction>,
    pub(crate) timer_c: Option<TimerHandle>,
    outcome: Outcome,
    /// A CANCEL is owed once the branch has seen a provisional response.
    cancel_pending: bool,
    cancelled: bool,
}

impl Branch {
    fn new(tx: Arc<dyn ClientTransaction>) -> Self {
        Self {
            tx,
            timer_c: None,
            outcome: Outcome::Pending,
            cancel_pending: false,
            cancelled: false,
        }
    }

    pub fn tx(&self) -> &Arc<dyn ClientTransaction> {
        &self.tx
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn is_done(&self) -> bool {
        self.outcome != Outcome::Pending || self.tx.state() >= TransactionState::Completed
    }

    fn is_cancellable(&self) -> bool {
        self.tx.request().method() == &Method::Invite && !self.cancelled && !self.is_done()
    }

    /// Marks the branch cancelled if a CANCEL may be sent for it now.
    pub(crate) fn claim_cancel(&mut self) -> Option<Arc<dyn ClientTransaction>> {
        if self.is_cancellable() && self.tx.state() == TransactionState::Proceeding {
            self.cancelled = true;
            self.cancel_pending = false;
            Some(Arc::clone(&self.tx))
        } else {
            None
        }
    }
}

pub struct TransactionMapping {
    server: Arc<dyn ServerTransaction>,
    provider: Arc<dyn SipProvider>,
    context: ResponseContext,
    branches: Vec<Branch>,
    final_forwarded: bool,
    server_terminated: bool,
}

impl TransactionMapping {
    pub fn new(server: Arc<dyn ServerTransaction>, provider: Arc<dyn SipProvider>) -> Self {
        Self {
            server,
            provider,
            context: ResponseContext::new(),
            branches: Vec::new(),
            final_forwarded: false,
            server_terminated: false,
        }
    }

    pub fn server(&self) -> &Arc<dyn ServerTransaction> {
        &self.server
    }

    pub fn provider(&self) -> &Arc<dyn SipProvider> {
        &self.provider
    }

    pub fn context(&self) -> &ResponseContext {
        &self.context
    }

    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    pub fn add_branch(&mut self, tx: Arc<dyn ClientTransaction>) {
        self.branches.push(Branch::new(tx));
    }

    pub fn branch_mut(&mut self, id: &TransactionId) -> Option<&mut Branch> {
        self.branches.iter_mut().find(|b| &b.tx.id() == id)
    }

    pub fn all_done(&self) -> bool {
        self.branches.iter().all(Branch::is_done)
    }

    /// True once a final response went upstream or the server transaction
    /// no longer accepts one.
    pub fn is_closed(&self) -> bool {
        self.final_forwarded || self.server.state() >= TransactionState::Completed
    }

    pub fn is_finished(&self) -> bool {
        self.server_terminated && self.all_done()
    }

    pub fn mark_server_terminated(&mut self) {
        self.server_terminated = true;
    }

    /// Records a final response of a still open request; a 2xx closes it.
    pub fn record_final(&mut self, response: Response) {
        if response.is_success() {
            self.final_forwarded = true;
        }
        self.context.add(response);
    }

    /// Ends a branch and hands back its Timer C, if armed.
    pub fn finish_branch(&mut self, id: &TransactionId, outcome: Outcome) -> Option<TimerHandle> {
        let branch = self.branch_mut(id)?;
        if branch.outcome == Outcome::Pending {
            branch.outcome = outcome;
        }
        branch.cancel_pending = false;
        branch.timer_c.take()
    }

    /// Claims the branches a CANCEL can be sent to right now.
    ///
    /// INVITE branches still waiting for their first provisional are only
    /// flagged; they are cancelled when that provisional arrives.
    pub fn take_cancellable(&mut self) -> Vec<Arc<dyn ClientTransaction>> {
        let mut ready = Vec::new();
        for branch in &mut self.branches {
            if let Some(tx) = branch.claim_cancel() {
                ready.push(tx);
            } else if branch.is_cancellable() {
                branch.cancel_pending = true;
            }
        }
        ready
    }

    /// Claims the CANCEL owed to `id` now that it sent a provisional.
    pub fn take_deferred_cancel(&mut self, id: &TransactionId) -> Option<Arc<dyn ClientTransaction>> {
        let branch = self.branch_mut(id)?;
        if !branch.cancel_pending || branch.cancelled || branch.outcome != Outcome::Pending {
            return None;
        }
        branch.cancel_pending = false;
        branch.cancelled = true;
        Some(Arc::clone(&branch.tx))
    }

    /// Once every branch is done, claims the response to send upstream.
    ///
    /// Returns `None` while branches are pending or after a final response
    /// already went upstream.
    pub fn take_best_response(&mut self) -> Result<Option<Response>, MessageError> {
        if self.is_closed() || !self.all_done() {
            return Ok(None);
        }
        let best = self.context.best_response(self.server.request())?;
        self.final_forwarded = true;
        Ok(Some(best))
    }

    /// Timer C handles still armed.
    fn take_timers(&mut self) -> Vec<TimerHandle> {
        self.branches
            .iter_mut()
            .filter_map(|branch| branch.timer_c.take())
            .collect()
    }
}

/// Mappings indexed by server transaction and by client transaction.
#[derive(Default)]
pub struct MappingTable {
    by_server: DashMap<TransactionId, SharedMapping>,
    by_client: DashMap<TransactionId, TransactionId>,
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_insert(
        &self,
        server: &Arc<dyn ServerTransaction>,
        provider: &Arc<dyn SipProvider>,
    ) -> SharedMapping {
        let entry = self.by_server.entry(server.id()).or_insert_with(|| {
            Arc::new(Mutex::new(TransactionMapping::new(
                Arc::clone(server),
                Arc::clone(provider),
            )))
        });
        Arc::clone(entry.value())
    }

    pub fn for_server(&self, id: &TransactionId) -> Option<SharedMapping> {
        self.by_server.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn for_client(&self, id: &TransactionId) -> Option<SharedMapping> {
        let server = self.by_client.get(id).map(|entry| entry.value().clone())?;
        self.for_server(&server)
    }

    pub fn link_client(&self, client: TransactionId, server: TransactionId) {
        self.by_client.insert(client, server);
    }

    /// Forgets a client transaction, returning its server transaction id.
    pub fn unlink_client(&self, client: &TransactionId) -> Option<TransactionId> {
        self.by_client.remove(client).map(|(_, server)| server)
    }

    /// Drops a mapping with its client links, returning timers to cancel.
    pub fn remove(&self, server: &TransactionId) -> Vec<TimerHandle> {
        let Some((_, mapping)) = self.by_server.remove(server) else {
            return Vec::new();
        };
        let (clients, timers) = {
            let mut mapping = mapping.lock();
            let clients: Vec<TransactionId> =
                mapping.branches.iter().map(|b| b.tx.id()).collect();
            (clients, mapping.take_timers())
        };
        for client in clients {
            self.by_client.remove(&client);
        }
        timers
    }

    pub fn len(&self) -> usize {
        self.by_server.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_server.is_empty()
    }
}
