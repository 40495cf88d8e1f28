use sip_observe::{request_span, response_span, RemoteService};
use sip_transaction::{RequestEvent, ResponseEvent, SipListener, TransactionRef};
use tracing::{debug, warn};

use crate::Proxy;

impl SipListener for Proxy {
    fn process_request(&self, event: RequestEvent) {
        let _span = request_span(event.request.call_id().unwrap_or_default()).entered();
        debug!(method = %event.request.method(), uri = %event.request.uri(), "incoming request");
        match self.handle_request(event) {
            Ok(()) => self.counters.requests_processed.inc(),
            Err(e) => {
                self.counters.request_errors.inc();
                warn!(error = %e, "request processing failed");
            }
        }
    }

    fn process_response(&self, event: ResponseEvent) {
        let _span = response_span(event.response.call_id().unwrap_or_default()).entered();
        debug!(
            code = event.response.code(),
            reason = event.response.reason(),
            "incoming response"
        );
        match self.handle_response(event) {
            Ok(()) => self.counters.responses_processed.inc(),
            Err(e) => {
                self.counters.response_errors.inc();
                warn!(error = %e, "response processing failed");
            }
        }
    }

    fn process_timeout(&self, transaction: TransactionRef) {
        if let Err(e) = self.handle_timeout(transaction) {
            warn!(error = %e, "timeout processing failed");
        }
    }

    fn process_transaction_terminated(&self, transaction: TransactionRef) {
        if let Err(e) = self.handle_terminated(transaction) {
            warn!(error = %e, "transaction cleanup failed");
        }
    }
}

const HELP: &str = "\
help                          - Show help.
get numRequestsProcessed      - Get the total number of successfully processed requests.
get numResponsesProcessed     - Get the total number of successfully processed responses.
get numRequestsNotProcessed   - Get the total number of requests dropped due to errors.
get numResponsesNotProcessed  - Get the total number of responses dropped due to errors.
get numServerTransactions     - Get the number of live server transactions.
get numClientTransactions     - Get the number of live client transactions.
";

impl RemoteService for Proxy {
    fn exec_cmd(&self, cmd: &str, params: &[&str]) -> Option<String> {
        if cmd.eq_ignore_ascii_case("get") {
            if let Some(name) = params.first() {
                let stats = self.stats();
                let value = match name.to_ascii_lowercase().as_str() {
                    "numrequestsprocessed" => stats.requests_processed.to_string(),
                    "numresponsesprocessed" => stats.responses_processed.to_string(),
                    "numrequestsnotprocessed" => stats.request_errors.to_string(),
                    "numresponsesnotprocessed" => stats.response_errors.to_string(),
                    "numservertransactions" => stats.server_transactions.to_string(),
                    "numclienttransactions" => stats.client_transactions.to_string(),
                    _ => return None,
                };
                return Some(value);
            }
        }
        Some(HELP.to_owned())
    }
}
