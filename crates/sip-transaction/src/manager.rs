// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Minimal in-process transaction layer for datagram transports.
//!
//! [`TransactionLayer`] implements [`SipProvider`] for one listening point.
//! It matches retransmitted requests to server transactions, replays the last
//! response, retransmits client requests with the RFC 3261 Timer A/E backoff,
//! generates the ACK for non-2xx INVITE responses and reports Timer B/F
//! expiry as a timeout. Bytes go out through a [`WireSender`].

use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock, Weak},
    time::Duration,
};

use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;
use sip_core::{Method, Request, Response, SipMessage, MAGIC_COOKIE};
use sip_parse::{
    parse_message, parse_name_addr, parse_via_header, serialize_request, serialize_response,
};
use smol_str::SmolStr;
use tracing::{debug, trace, warn};

use crate::{
    build_ack, request_branch_id, ClientTransaction, ListeningPoint, RequestEvent, ResponseEvent,
    ServerTransaction, SipListener, SipProvider, StackError, TimerHandle, TimerScheduler,
    TransactionId, TransactionRef, TransactionState,
};

/// RTT estimate.
pub const T1: Duration = Duration::from_millis(500);
/// Maximum retransmit interval for non-INVITE requests.
pub const T2: Duration = Duration::from_secs(4);
/// Maximum time a message stays in the network.
pub const T4: Duration = Duration::from_secs(5);
const TIMER_64T1: Duration = Duration::from_secs(32);

/// Where a serialized message should be delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireTarget {
    pub host: SmolStr,
    pub port: u16,
    pub transport: SmolStr,
}

impl WireTarget {
    /// Next hop of a request: the first Route when it is a loose router,
    /// otherwise the Request-URI (honouring `maddr`).
    pub fn for_request(request: &Request) -> Option<Self> {
        let loose_route = request
            .headers()
            .get("Route")
            .and_then(|route| parse_name_addr(route))
            .and_then(|route| route.sip_uri().cloned())
            .filter(|uri| uri.is_loose_route());
        let uri = match loose_route {
            Some(uri) => uri,
            None => request.sip_uri()?.clone(),
        };
        let host = uri
            .maddr()
            .map(SmolStr::new)
            .unwrap_or_else(|| uri.host.clone());
        let transport = uri
            .transport()
            .map(|t| SmolStr::new(t.to_ascii_uppercase()))
            .unwrap_or_else(|| SmolStr::new("UDP"));
        Some(Self {
            host,
            port: uri.port_or_default(),
            transport,
        })
    }

    /// Destination of a response per RFC 3261 §18.2.2 and RFC 3581.
    pub fn for_response(response: &Response) -> Option<Self> {
        let via = parse_via_header(response.headers().get("Via")?)?;
        let host = via
            .param("received")
            .and_then(|value| value.clone())
            .unwrap_or_else(|| via.host.clone());
        let port = via
            .param("rport")
            .and_then(|value| value.as_ref())
            .and_then(|value| value.parse().ok())
            .unwrap_or_else(|| via.port_or_default());
        Some(Self {
            host,
            port,
            transport: SmolStr::new(via.transport()),
        })
    }
}

/// Writes serialized messages to the network.
pub trait WireSender: Send + Sync {
    fn send(&self, target: WireTarget, payload: Bytes) -> Result<(), StackError>;
}

/// Transaction layer bound to a single listening point.
pub struct TransactionLayer {
    me: Weak<TransactionLayer>,
    listening_point: ListeningPoint,
    wire: Arc<dyn WireSender>,
    scheduler: Arc<dyn TimerScheduler>,
    listener: OnceLock<Weak<dyn SipListener>>,
    server: DashMap<TransactionId, Arc<LayerServerTransaction>>,
    client: DashMap<TransactionId, Arc<LayerClientTransaction>>,
}

impl TransactionLayer {
    pub fn new(
        listening_point: ListeningPoint,
        wire: Arc<dyn WireSender>,
        scheduler: Arc<dyn TimerScheduler>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            listening_point,
            wire,
            scheduler,
            listener: OnceLock::new(),
            server: DashMap::new(),
            client: DashMap::new(),
        })
    }

    /// Registers the listener that receives this layer's events.
    ///
    /// Only the first registration takes effect.
    pub fn set_listener(&self, listener: Weak<dyn SipListener>) {
        if self.listener.set(listener).is_err() {
            warn!("transaction layer listener already registered");
        }
    }

    pub fn server_transactions(&self) -> usize {
        self.server.len()
    }

    pub fn client_transactions(&self) -> usize {
        self.client.len()
    }

    /// Entry point for a datagram received from `source`.
    pub fn receive(&self, payload: &Bytes, source: SocketAddr) {
        match parse_message(payload) {
            Some(SipMessage::Request(mut request)) => {
                stamp_received(&mut request, source);
                self.on_request(request);
            }
            Some(SipMessage::Response(response)) => self.on_response(response),
            None => trace!(%source, len = payload.len(), "dropping unparsable datagram"),
        }
    }

    fn provider(&self) -> Option<Arc<dyn SipProvider>> {
        self.me.upgrade().map(|layer| layer as Arc<dyn SipProvider>)
    }

    fn listener(&self) -> Option<Arc<dyn SipListener>> {
        self.listener.get().and_then(Weak::upgrade)
    }

    fn on_request(&self, request: Request) {
        let (Some(provider), Some(listener)) = (self.provider(), self.listener()) else {
            return;
        };

        if request.method() == &Method::Ack {
            let absorbed = server_key(&request, &Method::Invite)
                .and_then(|key| self.server.get(&key).map(|e| Arc::clone(e.value())))
                .map(|tx| tx.absorb_ack())
                .unwrap_or(false);
            if absorbed {
                return;
            }
        } else if let Some(tx) = server_key(&request, request.method())
            .and_then(|key| self.server.get(&key).map(|e| Arc::clone(e.value())))
        {
            trace!(id = %tx.id, "request retransmission absorbed");
            tx.retransmit_last();
            return;
        }

        listener.process_request(RequestEvent {
            provider,
            request,
            server_transaction: None,
        });
    }

    fn on_response(&self, response: Response) {
        let (Some(provider), Some(listener)) = (self.provider(), self.listener()) else {
            return;
        };
        let tx = client_key(&response)
            .and_then(|key| self.client.get(&key).map(|e| Arc::clone(e.value())));

        let Some(tx) = tx else {
            listener.process_response(ResponseEvent {
                provider,
                response,
                client_transaction: None,
            });
            return;
        };

        let (deliver, after) = tx.on_response(self, &response);
        if deliver {
            listener.process_response(ResponseEvent {
                provider,
                response,
                client_transaction: Some(Arc::clone(&tx) as Arc<dyn ClientTransaction>),
            });
        }
        match after {
            After::Nothing => {}
            After::Terminate => self.terminate_client(&tx.id),
            After::Linger(delay) => self.schedule_client_termination(tx.id.clone(), delay),
        }
    }

    fn terminate_server(&self, id: &TransactionId) {
        let Some((_, tx)) = self.server.remove(id) else {
            return;
        };
        tx.inner.lock().state = TransactionState::Terminated;
        debug!(id = %id, "server transaction terminated");
        if let Some(listener) = self.listener() {
            listener.process_transaction_terminated(TransactionRef::Server(
                tx as Arc<dyn ServerTransaction>,
            ));
        }
    }

    fn terminate_client(&self, id: &TransactionId) {
        let Some((_, tx)) = self.client.remove(id) else {
            return;
        };
        let timers = {
            let mut inner = tx.inner.lock();
            inner.state = TransactionState::Terminated;
            [inner.retransmit.take(), inner.timeout.take()]
        };
        for handle in timers.into_iter().flatten() {
            self.scheduler.cancel(handle);
        }
        debug!(id = %id, "client transaction terminated");
        if let Some(listener) = self.listener() {
            listener.process_transaction_terminated(TransactionRef::Client(
                tx as Arc<dyn ClientTransaction>,
            ));
        }
    }

    fn schedule_server_termination(&self, id: TransactionId, delay: Duration) {
        let layer = self.me.clone();
        self.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(layer) = layer.upgrade() {
                    layer.terminate_server(&id);
                }
            }),
        );
    }

    fn schedule_client_termination(&self, id: TransactionId, delay: Duration) {
        let layer = self.me.clone();
        self.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(layer) = layer.upgrade() {
                    layer.terminate_client(&id);
                }
            }),
        );
    }

    fn schedule_retransmit(&self, id: TransactionId, interval: Duration) -> TimerHandle {
        let layer = self.me.clone();
        self.scheduler.schedule(
            interval,
            Box::new(move || {
                let Some(layer) = layer.upgrade() else {
                    return;
                };
                let tx = layer.client.get(&id).map(|e| Arc::clone(e.value()));
                if let Some(tx) = tx {
                    tx.on_retransmit_timer(&layer, interval);
                }
            }),
        )
    }

    fn schedule_timeout(&self, id: TransactionId) -> TimerHandle {
        let layer = self.me.clone();
        self.scheduler.schedule(
            TIMER_64T1,
            Box::new(move || {
                if let Some(layer) = layer.upgrade() {
                    layer.on_client_timeout(&id);
                }
            }),
        )
    }

    fn on_client_timeout(&self, id: &TransactionId) {
        let Some(tx) = self.client.get(id).map(|e| Arc::clone(e.value())) else {
            return;
        };
        if tx.state() >= TransactionState::Completed {
            return;
        }
        debug!(id = %id, "client transaction timed out");
        if let Some(listener) = self.listener() {
            let tx = Arc::clone(&tx) as Arc<dyn ClientTransaction>;
            listener.process_timeout(TransactionRef::Client(tx));
        }
        self.terminate_client(id);
    }
}

impl SipProvider for TransactionLayer {
    fn listening_point(&self, transport: &str) -> Option<ListeningPoint> {
        self.listening_point
            .transport
            .eq_ignore_ascii_case(transport)
            .then(|| self.listening_point.clone())
    }

    fn send_request(&self, request: Request) -> Result<(), StackError> {
        let target = WireTarget::for_request(&request)
            .ok_or_else(|| StackError::InvalidMessage("request has no SIP next hop".into()))?;
        self.wire.send(target, serialize_request(&request))
    }

    fn send_response(&self, response: Response) -> Result<(), StackError> {
        let target = WireTarget::for_response(&response)
            .ok_or_else(|| StackError::InvalidMessage("response has no Via".into()))?;
        self.wire.send(target, serialize_response(&response))
    }

    fn new_server_transaction(
        &self,
        request: &Request,
    ) -> Result<Arc<dyn ServerTransaction>, StackError> {
        if request.method() == &Method::Ack {
            return Err(StackError::InvalidMessage(
                "ACK does not create a server transaction".into(),
            ));
        }
        let key = server_key(request, request.method())
            .ok_or_else(|| StackError::InvalidMessage("request has no Via".into()))?;
        match self.server.entry(key.clone()) {
            Entry::Occupied(_) => Err(StackError::TransactionExists(key)),
            Entry::Vacant(slot) => {
                let state = if request.method() == &Method::Invite {
                    TransactionState::Proceeding
                } else {
                    TransactionState::Trying
                };
                let tx = Arc::new(LayerServerTransaction {
                    id: key,
                    request: request.clone(),
                    layer: self.me.clone(),
                    inner: Mutex::new(ServerInner {
                        state,
                        last_response: None,
                    }),
                });
                slot.insert(Arc::clone(&tx));
                Ok(tx as Arc<dyn ServerTransaction>)
            }
        }
    }

    fn new_client_transaction(
        &self,
        request: Request,
    ) -> Result<Arc<dyn ClientTransaction>, StackError> {
        let branch = request_branch_id(&request)
            .ok_or_else(|| StackError::InvalidMessage("request has no Via branch".into()))?;
        let key = TransactionId::new(format!("{}|{}", branch, request.method()));
        let target = WireTarget::for_request(&request)
            .ok_or_else(|| StackError::InvalidMessage("request has no SIP next hop".into()))?;
        match self.client.entry(key.clone()) {
            Entry::Occupied(_) => Err(StackError::TransactionExists(key)),
            Entry::Vacant(slot) => {
                let state = if request.method() == &Method::Invite {
                    TransactionState::Calling
                } else {
                    TransactionState::Trying
                };
                let tx = Arc::new(LayerClientTransaction {
                    id: key,
                    payload: serialize_request(&request),
                    request,
                    target,
                    layer: self.me.clone(),
                    inner: Mutex::new(ClientInner {
                        state,
                        retransmit: None,
                        timeout: None,
                    }),
                });
                slot.insert(Arc::clone(&tx));
                Ok(tx as Arc<dyn ClientTransaction>)
            }
        }
    }
}

struct ServerInner {
    state: TransactionState,
    last_response: Option<(WireTarget, Bytes)>,
}

struct LayerServerTransaction {
    id: TransactionId,
    request: Request,
    layer: Weak<TransactionLayer>,
    inner: Mutex<ServerInner>,
}

impl LayerServerTransaction {
    fn retransmit_last(&self) {
        let last = self.inner.lock().last_response.clone();
        if let (Some((target, payload)), Some(layer)) = (last, self.layer.upgrade()) {
            if let Err(e) = layer.wire.send(target, payload) {
                trace!(id = %self.id, error = %e, "response retransmission failed");
            }
        }
    }

    /// Returns true when the ACK belongs to this INVITE transaction.
    fn absorb_ack(&self) -> bool {
        let confirmed = {
            let mut inner = self.inner.lock();
            match inner.state {
                TransactionState::Completed => {
                    inner.state = TransactionState::Confirmed;
                    true
                }
                TransactionState::Confirmed => return true,
                _ => return false,
            }
        };
        if confirmed {
            if let Some(layer) = self.layer.upgrade() {
                layer.schedule_server_termination(self.id.clone(), T4);
            }
        }
        confirmed
    }
}

impl ServerTransaction for LayerServerTransaction {
    fn id(&self) -> TransactionId {
        self.id.clone()
    }

    fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    fn request(&self) -> &Request {
        &self.request
    }

    fn send_response(&self, response: Response) -> Result<(), StackError> {
        let layer = self
            .layer
            .upgrade()
            .ok_or_else(|| StackError::TransactionUnavailable(self.id.to_string()))?;
        let target = WireTarget::for_response(&response)
            .ok_or_else(|| StackError::InvalidMessage("response has no Via".into()))?;
        let payload = serialize_response(&response);
        let is_invite = self.request.method() == &Method::Invite;

        let next = {
            let mut inner = self.inner.lock();
            if inner.state >= TransactionState::Completed {
                return Err(StackError::TransactionUnavailable(format!(
                    "{} is {}",
                    self.id, inner.state
                )));
            }
            inner.state = match response.code() {
                100..=199 => TransactionState::Proceeding,
                200..=299 if is_invite => TransactionState::Terminated,
                _ => TransactionState::Completed,
            };
            inner.last_response = Some((target.clone(), payload.clone()));
            inner.state
        };

        let sent = layer.wire.send(target, payload);
        match next {
            TransactionState::Terminated => layer.terminate_server(&self.id),
            TransactionState::Completed => {
                layer.schedule_server_termination(self.id.clone(), TIMER_64T1)
            }
            _ => {}
        }
        sent
    }

    fn canceled_invite_transaction(&self) -> Option<Arc<dyn ServerTransaction>> {
        if self.request.method() != &Method::Cancel {
            return None;
        }
        let layer = self.layer.upgrade()?;
        let key = server_key(&self.request, &Method::Invite)?;
        let tx = layer.server.get(&key).map(|e| Arc::clone(e.value()))?;
        Some(tx as Arc<dyn ServerTransaction>)
    }
}

enum After {
    Nothing,
    Terminate,
    Linger(Duration),
}

struct ClientInner {
    state: TransactionState,
    retransmit: Option<TimerHandle>,
    timeout: Option<TimerHandle>,
}

struct LayerClientTransaction {
    id: TransactionId,
    request: Request,
    payload: Bytes,
    target: WireTarget,
    layer: Weak<TransactionLayer>,
    inner: Mutex<ClientInner>,
}

impl LayerClientTransaction {
    fn is_invite(&self) -> bool {
        self.request.method() == &Method::Invite
    }

    fn on_retransmit_timer(&self, layer: &TransactionLayer, interval: Duration) {
        let active = match self.inner.lock().state {
            TransactionState::Calling | TransactionState::Trying => true,
            TransactionState::Proceeding => !self.is_invite(),
            _ => false,
        };
        if !active {
            return;
        }
        if let Err(e) = layer.wire.send(self.target.clone(), self.payload.clone()) {
            trace!(id = %self.id, error = %e, "request retransmission failed");
        }
        let next = if self.is_invite() {
            interval * 2
        } else {
            (interval * 2).min(T2)
        };
        let handle = layer.schedule_retransmit(self.id.clone(), next);
        self.inner.lock().retransmit = Some(handle);
    }

    /// Applies a response; returns whether to deliver it and what happens next.
    fn on_response(&self, layer: &TransactionLayer, response: &Response) -> (bool, After) {
        let code = response.code();
        let invite = self.is_invite();
        let mut cancelled = Vec::new();

        let outcome = {
            let mut inner = self.inner.lock();
            match inner.state {
                TransactionState::Calling
                | TransactionState::Trying
                | TransactionState::Proceeding => {
                    if code < 200 {
                        inner.state = TransactionState::Proceeding;
                        if invite {
                            cancelled.extend(inner.retransmit.take());
                        }
                        (true, After::Nothing)
                    } else {
                        cancelled.extend(inner.retransmit.take());
                        cancelled.extend(inner.timeout.take());
                        if invite && code < 300 {
                            inner.state = TransactionState::Terminated;
                            (true, After::Terminate)
                        } else {
                            inner.state = TransactionState::Completed;
                            let linger = if invite { TIMER_64T1 } else { T4 };
                            (true, After::Linger(linger))
                        }
                    }
                }
                // retransmitted finals are absorbed
                _ => (false, After::Nothing),
            }
        };

        for handle in cancelled {
            layer.scheduler.cancel(handle);
        }
        if invite && code >= 300 {
            self.send_ack(layer, response);
        }
        outcome
    }

    fn send_ack(&self, layer: &TransactionLayer, response: &Response) {
        match build_ack(&self.request, response) {
            Ok(ack) => {
                if let Err(e) = layer.wire.send(self.target.clone(), serialize_request(&ack)) {
                    trace!(id = %self.id, error = %e, "ACK send failed");
                }
            }
            Err(e) => warn!(id = %self.id, error = %e, "could not build ACK"),
        }
    }
}

impl ClientTransaction for LayerClientTransaction {
    fn id(&self) -> TransactionId {
        self.id.clone()
    }

    fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    fn request(&self) -> &Request {
        &self.request
    }

    fn send_request(&self) -> Result<(), StackError> {
        let layer = self
            .layer
            .upgrade()
            .ok_or_else(|| StackError::TransactionUnavailable(self.id.to_string()))?;
        layer.wire.send(self.target.clone(), self.payload.clone())?;

        let retransmit = self
            .target
            .transport
            .eq_ignore_ascii_case("UDP")
            .then(|| layer.schedule_retransmit(self.id.clone(), T1));
        let timeout = layer.schedule_timeout(self.id.clone());
        let mut inner = self.inner.lock();
        inner.retransmit = retransmit;
        inner.timeout = Some(timeout);
        Ok(())
    }
}

fn server_key(request: &Request, method: &Method) -> Option<TransactionId> {
    let branch = request_branch_id(request)?;
    if branch.starts_with(MAGIC_COOKIE) {
        return Some(TransactionId::new(format!("{}|{}", branch, method)));
    }
    // RFC 2543 peers: fall back to the dialog and sequence identifiers
    let via = request.headers().get("Via")?;
    let (seq, _) = request.cseq()?;
    Some(TransactionId::new(format!(
        "{}|{}|{}|{}",
        request.call_id()?,
        seq,
        via,
        method
    )))
}

fn client_key(response: &Response) -> Option<TransactionId> {
    let via = parse_via_header(response.headers().get("Via")?)?;
    let branch = via.branch()?;
    let (_, method) = response.cseq()?;
    Some(TransactionId::new(format!("{}|{}", branch, method)))
}

/// Adds `received` to the top Via when the sent-by host differs from the source.
fn stamp_received(request: &mut Request, source: SocketAddr) {
    let Some(top) = request.headers().get("Via").cloned() else {
        return;
    };
    let Some(via) = parse_via_header(&top) else {
        return;
    };
    let source_ip = source.ip().to_string();
    if via.host == source_ip || via.param("received").is_some() {
        return;
    }
    let headers = request.headers_mut();
    headers.remove_first("Via");
    headers.prepend("Via", format!("{};received={}", top, source_ip));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TokioScheduler;
    use tokio::runtime::Handle;

    #[derive(Default)]
    struct RecordingWire {
        sent: Mutex<Vec<(WireTarget, Bytes)>>,
    }

    impl RecordingWire {
        fn sent_lines(&self) -> Vec<String> {
            self.sent
                .lock()
                .iter()
                .map(|(_, bytes)| {
                    String::from_utf8_lossy(bytes)
                        .lines()
                        .next()
                        .unwrap_or_default()
                        .to_owned()
                })
                .collect()
        }
    }

    impl WireSender for RecordingWire {
        fn send(&self, target: WireTarget, payload: Bytes) -> Result<(), StackError> {
            self.sent.lock().push((target, payload));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        requests: Mutex<Vec<RequestEvent>>,
        responses: Mutex<Vec<u16>>,
        timeouts: Mutex<Vec<TransactionId>>,
        terminated: Mutex<Vec<TransactionId>>,
    }

    impl SipListener for RecordingListener {
        fn process_request(&self, event: RequestEvent) {
            self.requests.lock().push(event);
        }

        fn process_response(&self, event: ResponseEvent) {
            self.responses.lock().push(event.response.code());
        }

        fn process_timeout(&self, transaction: TransactionRef) {
            self.timeouts.lock().push(transaction.id());
        }

        fn process_transaction_terminated(&self, transaction: TransactionRef) {
            self.terminated.lock().push(transaction.id());
        }
    }

    fn setup() -> (Arc<TransactionLayer>, Arc<RecordingWire>, Arc<RecordingListener>) {
        let wire = Arc::new(RecordingWire::default());
        let layer = TransactionLayer::new(
            ListeningPoint::new("10.0.0.1", 5060, "udp"),
            wire.clone(),
            Arc::new(TokioScheduler::new(Handle::current())),
        );
        let listener = Arc::new(RecordingListener::default());
        let weak: Weak<dyn SipListener> = Arc::downgrade(&listener) as Weak<dyn SipListener>;
        layer.set_listener(weak);
        (layer, wire, listener)
    }

    const OPTIONS: &str = "OPTIONS sip:bob@10.0.0.1 SIP/2.0\r\n\
Via: SIP/2.0/UDP 192.0.2.4:5062;branch=z9hG4bKopt1\r\n\
From: <sip:alice@example.com>;tag=a\r\n\
To: <sip:bob@example.com>\r\n\
Call-ID: opt-1\r\n\
CSeq: 1 OPTIONS\r\n\
Content-Length: 0\r\n\r\n";

    fn source() -> SocketAddr {
        "192.0.2.4:5062".parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn retransmitted_request_replays_last_response() {
        let (layer, wire, listener) = setup();
        let datagram = Bytes::from_static(OPTIONS.as_bytes());
        layer.receive(&datagram, source());
        assert_eq!(listener.requests.lock().len(), 1);

        let request = listener.requests.lock()[0].request.clone();
        let st = layer.new_server_transaction(&request).unwrap();
        assert!(matches!(
            layer.new_server_transaction(&request),
            Err(StackError::TransactionExists(_))
        ));
        st.send_response(sip_core::build_response(&request, 200).unwrap())
            .unwrap();
        assert_eq!(st.state(), TransactionState::Completed);

        layer.receive(&datagram, source());
        assert_eq!(listener.requests.lock().len(), 1);
        assert_eq!(wire.sent_lines(), vec!["SIP/2.0 200 OK", "SIP/2.0 200 OK"]);
        assert_eq!(wire.sent.lock()[0].0.port, 5062);

        tokio::time::sleep(TIMER_64T1 + Duration::from_secs(1)).await;
        assert_eq!(layer.server_transactions(), 0);
        assert_eq!(listener.terminated.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn received_is_stamped_when_host_differs() {
        let (layer, _wire, listener) = setup();
        let raw = OPTIONS.replace("192.0.2.4:5062", "ua.example.com:5062");
        layer.receive(&Bytes::from(raw), source());
        let request = listener.requests.lock()[0].request.clone();
        assert!(request
            .headers()
            .get("Via")
            .unwrap()
            .ends_with(";received=192.0.2.4"));
    }

    fn invite_out() -> Request {
        let raw = "INVITE sip:bob@192.0.2.9:5070 SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKout1\r\n\
Via: SIP/2.0/UDP 192.0.2.4:5062;branch=z9hG4bKin1\r\n\
From: <sip:alice@example.com>;tag=a\r\n\
To: <sip:bob@example.com>\r\n\
Call-ID: inv-1\r\n\
CSeq: 1 INVITE\r\n\
Content-Length: 0\r\n\r\n";
        sip_parse::parse_request(&Bytes::from(raw)).unwrap()
    }

    fn response_to(request: &Request, code: u16) -> Bytes {
        let mut response = sip_core::build_response(request, code).unwrap();
        response.headers_mut().set("To", "<sip:bob@example.com>;tag=b");
        serialize_response(&response)
    }

    #[tokio::test(start_paused = true)]
    async fn invite_client_acks_failure_and_absorbs_retransmission() {
        let (layer, wire, listener) = setup();
        let request = invite_out();
        let ct = layer.new_client_transaction(request.clone()).unwrap();
        ct.send_request().unwrap();
        assert_eq!(ct.state(), TransactionState::Calling);

        let peer: SocketAddr = "192.0.2.9:5070".parse().unwrap();
        layer.receive(&response_to(&request, 180), peer);
        assert_eq!(ct.state(), TransactionState::Proceeding);
        layer.receive(&response_to(&request, 486), peer);
        assert_eq!(ct.state(), TransactionState::Completed);
        layer.receive(&response_to(&request, 486), peer);

        assert_eq!(*listener.responses.lock(), vec![180, 486]);
        let acks = wire
            .sent_lines()
            .into_iter()
            .filter(|line| line.starts_with("ACK"))
            .count();
        assert_eq!(acks, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out() {
        let (layer, wire, listener) = setup();
        let ct = layer.new_client_transaction(invite_out()).unwrap();
        ct.send_request().unwrap();

        tokio::time::sleep(TIMER_64T1 + Duration::from_secs(1)).await;
        assert_eq!(listener.timeouts.lock().len(), 1);
        assert_eq!(listener.terminated.lock().len(), 1);
        assert_eq!(ct.state(), TransactionState::Terminated);
        // initial send plus Timer A retransmissions at 0.5, 1.5, 3.5, 7.5, 15.5 and 31.5 s
        assert_eq!(wire.sent_lines().len(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_response_is_delivered_without_transaction() {
        let (layer, _wire, listener) = setup();
        let request = invite_out();
        layer.receive(&response_to(&request, 200), "192.0.2.9:5070".parse().unwrap());
        assert_eq!(*listener.responses.lock(), vec![200]);
    }
}
