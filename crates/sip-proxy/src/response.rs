//! Response path (§16.7) and transaction lifecycle events.

use std::sync::Arc;

use sip_core::{Method, Response};
use sip_parse::parse_via_header;
use sip_transaction::{
    ResponseEvent, SipProvider, TransactionId, TransactionRef, TransactionState,
};
use tracing::{debug, trace};

use crate::{
    mapping::{Outcome, SharedMapping, TransactionMapping},
    send_cancel, send_upstream, timer_c, Proxy, ProxyError,
};

impl Proxy {
    pub(crate) fn handle_response(&self, event: ResponseEvent) -> Result<(), ProxyError> {
        let ResponseEvent {
            provider,
            mut response,
            client_transaction,
        } = event;

        let mapped = client_transaction
            .filter(|_| self.config.is_stateful())
            .and_then(|tx| self.mappings.for_client(&tx.id()).map(|mapping| (tx, mapping)));
        let Some((client, mapping)) = mapped else {
            self.forward_response_statelessly(provider.as_ref(), response);
            return Ok(());
        };

        let id = client.id();
        let code = response.code();
        let is_invite = client.request().method() == &Method::Invite;

        let (server, upstream, deferred_cancel) = {
            let mut guard = mapping.lock();
            if is_invite && (101..=199).contains(&code) {
                self.restart_timer_c(&mapping, &mut *guard, &id);
            }
            let deferred = if response.is_provisional() {
                guard.take_deferred_cancel(&id)
            } else {
                None
            };
            (Arc::clone(guard.server()), Arc::clone(guard.provider()), deferred)
        };
        if let Some(tx) = deferred_cancel {
            debug!(client = %id, "branch answered, sending the CANCEL it was owed");
            send_cancel(provider.as_ref(), tx.as_ref(), &self.counters);
        }

        response.headers_mut().remove_first("Via");
        if !response.headers().contains("Via") {
            trace!(code, "response addressed to the proxy itself");
            return Ok(());
        }

        if response.is_provisional() {
            if code == 100 || server.state() >= TransactionState::Completed {
                trace!(code, "provisional response absorbed");
            } else {
                send_upstream(&server, upstream.as_ref(), response);
            }
            return Ok(());
        }

        let (forward, cancels, timer) = {
            let mut guard = mapping.lock();
            let timer = guard.finish_branch(&id, Outcome::Final);
            if guard.is_closed() {
                // only further 2xx to INVITE still go upstream (§16.7 step 5)
                let forward = (response.is_success() && is_invite).then_some(response);
                if forward.is_none() {
                    trace!(code, "final response after the request completed, dropped");
                }
                (forward, Vec::new(), timer)
            } else {
                let is_success = response.is_success();
                let is_global_failure = response.is_global_failure();
                guard.record_final(response.clone());
                if is_success {
                    (Some(response), guard.take_cancellable(), timer)
                } else {
                    let cancels = if is_global_failure {
                        guard.take_cancellable()
                    } else {
                        Vec::new()
                    };
                    (guard.take_best_response()?, cancels, timer)
                }
            }
        };
        if let Some(timer) = timer {
            self.scheduler.cancel(timer);
        }

        if let Some(response) = forward {
            debug!(code = response.code(), "forwarding final response");
            send_upstream(&server, upstream.as_ref(), response);
        }
        for tx in cancels {
            send_cancel(provider.as_ref(), tx.as_ref(), &self.counters);
        }
        self.release_if_finished(&server.id(), &mapping);
        Ok(())
    }

    /// Forwards a response that belongs to no known forwarding context.
    ///
    /// The removed Via must be one this proxy inserted; the response then
    /// travels to the next Via.
    fn forward_response_statelessly(&self, provider: &dyn SipProvider, mut response: Response) {
        let Some(via) = response.headers_mut().remove_first("Via") else {
            return;
        };
        let inserted_here = parse_via_header(&via)
            .map(|via| self.locality.is_local_endpoint(&via.host, via.port_or_default()))
            .unwrap_or(false);
        if !inserted_here {
            trace!(via = %via, "response did not pass through this proxy, dropped");
            return;
        }
        if !response.headers().contains("Via") {
            trace!(code = response.code(), "response addressed to the proxy itself");
            return;
        }
        match provider.send_response(response) {
            Ok(()) => trace!("response forwarded statelessly"),
            Err(e) => trace!(error = %e, "failed to forward response"),
        }
    }

    fn restart_timer_c(
        &self,
        mapping: &SharedMapping,
        guard: &mut TransactionMapping,
        id: &TransactionId,
    ) {
        let Some(branch) = guard.branch_mut(id) else {
            return;
        };
        if branch.is_done() || branch.is_cancelled() {
            return;
        }
        if let Some(old) = branch.timer_c.take() {
            self.scheduler.cancel(old);
        }
        branch.timer_c = Some(timer_c::arm(
            self.scheduler.as_ref(),
            self.config.timer_c,
            mapping,
            id.clone(),
            &self.counters,
        ));
        trace!(client = %id, "Timer C restarted");
    }

    pub(crate) fn handle_timeout(&self, transaction: TransactionRef) -> Result<(), ProxyError> {
        let tx = match transaction {
            TransactionRef::Client(tx) => tx,
            TransactionRef::Server(tx) => {
                debug!(server = %tx.id(), "server transaction timed out");
                return Ok(());
            }
        };
        self.counters.timeouts.inc();
        let id = tx.id();
        let Some(mapping) = self.mappings.for_client(&id) else {
            trace!(client = %id, "unmapped client transaction timed out");
            return Ok(());
        };
        debug!(client = %id, "branch timed out");
        let timer = mapping.lock().finish_branch(&id, Outcome::TimedOut);
        if let Some(timer) = timer {
            self.scheduler.cancel(timer);
        }
        self.conclude(&mapping)
    }

    pub(crate) fn handle_terminated(&self, transaction: TransactionRef) -> Result<(), ProxyError> {
        match transaction {
            TransactionRef::Client(tx) => {
                self.counters.client_transactions.dec();
                let id = tx.id();
                let mapping = self.mappings.for_client(&id);
                self.mappings.unlink_client(&id);
                let Some(mapping) = mapping else {
                    return Ok(());
                };
                let (timer, server) = {
                    let mut guard = mapping.lock();
                    (
                        guard.finish_branch(&id, Outcome::Terminated),
                        guard.server().id(),
                    )
                };
                if let Some(timer) = timer {
                    self.scheduler.cancel(timer);
                }
                self.conclude(&mapping)?;
                self.release_if_finished(&server, &mapping);
            }
            TransactionRef::Server(tx) => {
                self.counters.server_transactions.dec();
                let id = tx.id();
                if let Some(mapping) = self.mappings.for_server(&id) {
                    mapping.lock().mark_server_terminated();
                    self.release_if_finished(&id, &mapping);
                }
            }
        }
        Ok(())
    }

    /// Sends the best response upstream once every branch is done.
    fn conclude(&self, mapping: &SharedMapping) -> Result<(), ProxyError> {
        let (best, server, upstream) = {
            let mut guard = mapping.lock();
            (
                guard.take_best_response()?,
                Arc::clone(guard.server()),
                Arc::clone(guard.provider()),
            )
        };
        if let Some(best) = best {
            debug!(code = best.code(), "best response selected");
            send_upstream(&server, upstream.as_ref(), best);
        }
        Ok(())
    }

    fn release_if_finished(&self, server: &TransactionId, mapping: &SharedMapping) {
        if !mapping.lock().is_finished() {
            return;
        }
        for timer in self.mappings.remove(server) {
            self.scheduler.cancel(timer);
        }
        trace!(server = %server, "forwarding context released");
    }
}
