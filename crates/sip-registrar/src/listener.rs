use sip_core::Method;
use sip_observe::RemoteService;
use sip_transaction::{
    RequestEvent, ResponseEvent, SipListener, StackError, TransactionRef,
};
use tracing::{debug, trace};

use crate::Registrar;

impl SipListener for Registrar {
    fn process_request(&self, event: RequestEvent) {
        let RequestEvent {
            provider,
            request,
            server_transaction,
        } = event;
        if request.method() != &Method::Register {
            return;
        }

        let server_transaction = match server_transaction {
            Some(tx) => Some(tx),
            None => match provider.new_server_transaction(&request) {
                Ok(tx) => Some(tx),
                // retransmission, the stack replays our last response
                Err(StackError::TransactionExists(_)) => return,
                Err(e) => {
                    trace!(error = %e, "answering REGISTER statelessly");
                    None
                }
            },
        };

        let overridden_domain = request
            .sip_uri()
            .filter(|uri| self.is_local_address(&uri.host))
            .map(|_| self.default_domain().to_owned());

        let response = match self.handle_register(&request, overridden_domain.as_deref()) {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "cannot build REGISTER response");
                return;
            }
        };
        let sent = match server_transaction {
            Some(tx) => tx.send_response(response),
            None => provider.send_response(response),
        };
        if let Err(e) = sent {
            trace!(error = %e, "failed to send REGISTER response");
        }
    }

    fn process_response(&self, _event: ResponseEvent) {}

    fn process_timeout(&self, transaction: TransactionRef) {
        debug!(transaction = ?transaction, "transaction timed out");
    }

    fn process_transaction_terminated(&self, transaction: TransactionRef) {
        trace!(transaction = ?transaction, "transaction terminated");
    }
}

const HELP: &str = "\
help                   - Show help.
get numIncReqs         - Get the total number of incoming requests.
get numResOK           - Get the total number of successfully processed requests.
get numReqRejects      - Get the total number of rejected requests.
get numReqIntErrors    - Get the total number of dropped requests due to internal errors.
get numAuthFails       - Get the total number of failed authentications.
get numCancels         - Get the total number of bindings removed.
get numCompleteCancels - Get the total number of wildcard removals.
get numQueries         - Get the total number of binding list requests.
get numUpdates         - Get the total number of updated bindings.
get numNotFound        - Get the total number of requests for unknown subscribers.
";

impl RemoteService for Registrar {
    fn exec_cmd(&self, cmd: &str, params: &[&str]) -> Option<String> {
        if cmd.eq_ignore_ascii_case("get") {
            if let Some(name) = params.first() {
                let stats = self.stats();
                let value = match name.to_ascii_lowercase().as_str() {
                    "numincreqs" => stats.incoming_requests,
                    "numresok" => stats.responses_ok,
                    "numreqrejects" => stats.request_rejects,
                    "numreqinterrors" => stats.processing_errors,
                    "numauthfails" => stats.auth_failures,
                    "numcancels" => stats.binding_cancels,
                    "numcompletecancels" => stats.full_cancels,
                    "numqueries" => stats.binding_queries,
                    "numupdates" => stats.binding_updates,
                    "numnotfound" => stats.user_not_found,
                    _ => return None,
                };
                return Some(value.to_string());
            }
        }
        Some(HELP.to_owned())
    }
}
