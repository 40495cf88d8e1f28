//! In-memory [`SipProvider`] that records traffic instead of sending it.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use sip_core::{Method, Request, Response};
use sip_transaction::{
    request_branch_id, ClientTransaction, ListeningPoint, ServerTransaction, SipProvider,
    StackError, TransactionId, TransactionState,
};
use smol_str::SmolStr;

/// Provider double for listener tests.
///
/// Server transactions are keyed by top-Via branch and method, so a second
/// `new_server_transaction` for the same request fails with
/// [`StackError::TransactionExists`] like a real stack does for retransmissions.
pub struct MockProvider {
    host: SmolStr,
    port: u16,
    fail_sends: AtomicBool,
    next_client: AtomicU64,
    sent_requests: Mutex<Vec<Request>>,
    sent_responses: Mutex<Vec<Response>>,
    servers: Mutex<Vec<Arc<MockServerTransaction>>>,
    clients: Mutex<Vec<Arc<MockClientTransaction>>>,
}

impl MockProvider {
    pub fn new(host: &str, port: u16) -> Arc<Self> {
        Arc::new(Self {
            host: SmolStr::new(host),
            port,
            fail_sends: AtomicBool::new(false),
            next_client: AtomicU64::new(1),
            sent_requests: Mutex::new(Vec::new()),
            sent_responses: Mutex::new(Vec::new()),
            servers: Mutex::new(Vec::new()),
            clients: Mutex::new(Vec::new()),
        })
    }

    /// Makes every subsequent send fail with a transport error.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Requests sent outside of a transaction.
    pub fn sent_requests(&self) -> Vec<Request> {
        self.sent_requests.lock().clone()
    }

    /// Responses sent outside of a transaction.
    pub fn sent_responses(&self) -> Vec<Response> {
        self.sent_responses.lock().clone()
    }

    pub fn server_transactions(&self) -> Vec<Arc<MockServerTransaction>> {
        self.servers.lock().clone()
    }

    pub fn client_transactions(&self) -> Vec<Arc<MockClientTransaction>> {
        self.clients.lock().clone()
    }

    /// The most recently created client transaction.
    pub fn last_client(&self) -> Option<Arc<MockClientTransaction>> {
        self.clients.lock().last().cloned()
    }

    /// Every response sent, statelessly or through a server transaction,
    /// in transaction creation order followed by stateless sends.
    pub fn all_responses(&self) -> Vec<Response> {
        let mut responses: Vec<Response> = self
            .servers
            .lock()
            .iter()
            .flat_map(|tx| tx.responses())
            .collect();
        responses.extend(self.sent_responses());
        responses
    }

    fn check_send(&self) -> Result<(), StackError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            Err(StackError::Transport("send failure injected".into()))
        } else {
            Ok(())
        }
    }

    fn find_server(&self, branch: &str, method: &Method) -> Option<Arc<MockServerTransaction>> {
        self.servers
            .lock()
            .iter()
            .find(|tx| tx.branch.eq_ignore_ascii_case(branch) && tx.request.method() == method)
            .cloned()
    }
}

impl SipProvider for MockProvider {
    fn listening_point(&self, transport: &str) -> Option<ListeningPoint> {
        if transport.eq_ignore_ascii_case("udp") || transport.eq_ignore_ascii_case("tcp") {
            Some(ListeningPoint::new(self.host.clone(), self.port, transport))
        } else {
            None
        }
    }

    fn send_request(&self, request: Request) -> Result<(), StackError> {
        self.check_send()?;
        self.sent_requests.lock().push(request);
        Ok(())
    }

    fn send_response(&self, response: Response) -> Result<(), StackError> {
        self.check_send()?;
        self.sent_responses.lock().push(response);
        Ok(())
    }

    fn new_server_transaction(
        &self,
        request: &Request,
    ) -> Result<Arc<dyn ServerTransaction>, StackError> {
        if request.method() == &Method::Ack {
            return Err(StackError::TransactionUnavailable(
                "ACK has no server transaction".into(),
            ));
        }
        let branch = request_branch_id(request)
            .ok_or_else(|| StackError::InvalidMessage("missing Via branch".into()))?;
        if let Some(existing) = self.find_server(&branch, request.method()) {
            return Err(StackError::TransactionExists(existing.id()));
        }

        let canceled = if request.method() == &Method::Cancel {
            self.find_server(&branch, &Method::Invite)
                .map(|tx| tx as Arc<dyn ServerTransaction>)
        } else {
            None
        };
        let tx = Arc::new(MockServerTransaction::new(request.clone(), branch, canceled));
        self.servers.lock().push(Arc::clone(&tx));
        Ok(tx)
    }

    fn new_client_transaction(
        &self,
        request: Request,
    ) -> Result<Arc<dyn ClientTransaction>, StackError> {
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        let tx = Arc::new(MockClientTransaction::new(
            TransactionId::new(format!("client-{}", id)),
            request,
        ));
        self.clients.lock().push(Arc::clone(&tx));
        Ok(tx)
    }
}

/// Server transaction double following the RFC 3261 §17.2 state progression.
pub struct MockServerTransaction {
    id: TransactionId,
    branch: SmolStr,
    request: Request,
    state: Mutex<TransactionState>,
    responses: Mutex<Vec<Response>>,
    canceled: Option<Arc<dyn ServerTransaction>>,
}

impl MockServerTransaction {
    pub fn new(
        request: Request,
        branch: SmolStr,
        canceled: Option<Arc<dyn ServerTransaction>>,
    ) -> Self {
        let initial = if request.method() == &Method::Invite {
            TransactionState::Proceeding
        } else {
            TransactionState::Trying
        };
        Self {
            id: TransactionId::new(format!("{}:{}", branch, request.method())),
            branch,
            request,
            state: Mutex::new(initial),
            responses: Mutex::new(Vec::new()),
            canceled,
        }
    }

    pub fn responses(&self) -> Vec<Response> {
        self.responses.lock().clone()
    }

    pub fn last_response(&self) -> Option<Response> {
        self.responses.lock().last().cloned()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }
}

impl ServerTransaction for MockServerTransaction {
    fn id(&self) -> TransactionId {
        self.id.clone()
    }

    fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    fn request(&self) -> &Request {
        &self.request
    }

    fn send_response(&self, response: Response) -> Result<(), StackError> {
        let mut state = self.state.lock();
        if *state >= TransactionState::Completed {
            return Err(StackError::TransactionUnavailable(format!(
                "{} is {}",
                self.id, *state
            )));
        }
        *state = match response.code() {
            100..=199 => TransactionState::Proceeding,
            200..=299 if self.request.method() == &Method::Invite => TransactionState::Terminated,
            _ => TransactionState::Completed,
        };
        self.responses.lock().push(response);
        Ok(())
    }

    fn canceled_invite_transaction(&self) -> Option<Arc<dyn ServerTransaction>> {
        self.canceled.clone()
    }
}

/// Client transaction double; counts sends and lets tests drive its state.
pub struct MockClientTransaction {
    id: TransactionId,
    request: Request,
    state: Mutex<TransactionState>,
    sends: AtomicUsize,
}

impl MockClientTransaction {
    pub fn new(id: TransactionId, request: Request) -> Self {
        let initial = if request.method() == &Method::Invite {
            TransactionState::Calling
        } else {
            TransactionState::Trying
        };
        Self {
            id,
            request,
            state: Mutex::new(initial),
            sends: AtomicUsize::new(0),
        }
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }
}

impl ClientTransaction for MockClientTransaction {
    fn id(&self) -> TransactionId {
        self.id.clone()
    }

    fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    fn request(&self) -> &Request {
        &self.request
    }

    fn send_request(&self) -> Result<(), StackError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{build_invite, response_to, RequestBuilder};

    #[test]
    fn retransmission_hits_existing_transaction() {
        let provider = MockProvider::new("10.0.0.1", 5060);
        let invite = build_invite("sip:bob@example.com", "z9hG4bKdup", "call-1");
        let first = provider.new_server_transaction(&invite).unwrap();
        match provider.new_server_transaction(&invite) {
            Err(StackError::TransactionExists(id)) => assert_eq!(id, first.id()),
            other => panic!("expected TransactionExists, got {:?}", other.map(|tx| tx.id())),
        }
    }

    #[test]
    fn cancel_finds_its_invite() {
        let provider = MockProvider::new("10.0.0.1", 5060);
        let invite = build_invite("sip:bob@example.com", "z9hG4bKc1", "call-2");
        let invite_tx = provider.new_server_transaction(&invite).unwrap();
        let cancel = RequestBuilder::new(Method::Cancel, "sip:bob@example.com")
            .branch("z9hG4bKc1")
            .call_id("call-2")
            .build();
        let cancel_tx = provider.new_server_transaction(&cancel).unwrap();
        assert_eq!(
            cancel_tx.canceled_invite_transaction().map(|tx| tx.id()),
            Some(invite_tx.id())
        );
    }

    #[test]
    fn final_response_completes() {
        let provider = MockProvider::new("10.0.0.1", 5060);
        let invite = build_invite("sip:bob@example.com", "z9hG4bKst", "call-3");
        let tx = provider.new_server_transaction(&invite).unwrap();
        tx.send_response(response_to(&invite, 180)).unwrap();
        assert_eq!(tx.state(), TransactionState::Proceeding);
        tx.send_response(response_to(&invite, 486)).unwrap();
        assert_eq!(tx.state(), TransactionState::Completed);
        assert!(tx.send_response(response_to(&invite, 500)).is_err());
        assert_eq!(provider.all_responses().len(), 2);
    }
}
