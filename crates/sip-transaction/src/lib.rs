// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The SIP stack contract consumed by the registrar and proxy cores.
//!
//! A [`SipProvider`] sends messages and creates transactions; the
//! application implements [`SipListener`] to receive requests, responses,
//! timeouts and transaction-terminated notifications. The crate also carries
//! the helpers every transaction user needs: branch generation, CANCEL
//! construction and a cancellable timer scheduler.

use std::{fmt, sync::Arc};

use rand::{distributions::Alphanumeric, Rng};
use sip_core::{Request, Response, MAGIC_COOKIE};
use smol_str::SmolStr;
use thiserror::Error;

pub mod cancel;
pub mod interface;
pub mod manager;
pub mod scheduler;

pub use cancel::{build_ack, build_cancel};
pub use interface::InterfaceConfig;
pub use manager::{TransactionLayer, WireSender, WireTarget};
pub use scheduler::{TimerHandle, TimerScheduler, TokioScheduler};

/// Transaction states from RFC 3261 §17, ordered by progression.
///
/// The ordering lets callers ask "has this transaction reached Completed?"
/// with a plain comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransactionState {
    Calling,
    Trying,
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Calling => "Calling",
            TransactionState::Trying => "Trying",
            TransactionState::Proceeding => "Proceeding",
            TransactionState::Completed => "Completed",
            TransactionState::Confirmed => "Confirmed",
            TransactionState::Terminated => "Terminated",
        };
        f.write_str(name)
    }
}

/// Stable identifier of a transaction, unique within one stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(SmolStr);

impl TransactionId {
    pub fn new(id: impl Into<SmolStr>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Address a provider listens on for one transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListeningPoint {
    pub host: SmolStr,
    pub port: u16,
    pub transport: SmolStr,
}

impl ListeningPoint {
    pub fn new(host: impl Into<SmolStr>, port: u16, transport: &str) -> Self {
        Self {
            host: host.into(),
            port,
            transport: SmolStr::new(transport.to_ascii_uppercase()),
        }
    }

    /// Renders the `host:port` sent-by used in Via headers.
    pub fn sent_by(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StackError {
    /// The request belongs to a transaction the stack already tracks.
    #[error("transaction already exists: {0}")]
    TransactionExists(TransactionId),
    #[error("transaction unavailable: {0}")]
    TransactionUnavailable(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

/// Sends messages and creates transactions on behalf of a listener.
pub trait SipProvider: Send + Sync {
    /// Returns the listening point for `transport` (case-insensitive).
    fn listening_point(&self, transport: &str) -> Option<ListeningPoint>;

    /// Sends a request outside of any transaction.
    fn send_request(&self, request: Request) -> Result<(), StackError>;

    /// Sends a response outside of any transaction, routed by its top Via.
    fn send_response(&self, response: Response) -> Result<(), StackError>;

    /// Creates a server transaction for a request received by this provider.
    ///
    /// Returns [`StackError::TransactionExists`] for retransmissions.
    fn new_server_transaction(
        &self,
        request: &Request,
    ) -> Result<Arc<dyn ServerTransaction>, StackError>;

    /// Creates a client transaction for `request`. The request is not sent
    /// until [`ClientTransaction::send_request`] is called.
    fn new_client_transaction(
        &self,
        request: Request,
    ) -> Result<Arc<dyn ClientTransaction>, StackError>;
}

pub trait ServerTransaction: Send + Sync {
    fn id(&self) -> TransactionId;

    fn state(&self) -> TransactionState;

    fn request(&self) -> &Request;

    fn send_response(&self, response: Response) -> Result<(), StackError>;

    /// For a CANCEL server transaction, the INVITE server transaction it
    /// targets, if the stack still knows it.
    fn canceled_invite_transaction(&self) -> Option<Arc<dyn ServerTransaction>>;
}

pub trait ClientTransaction: Send + Sync {
    fn id(&self) -> TransactionId;

    fn state(&self) -> TransactionState;

    fn request(&self) -> &Request;

    fn send_request(&self) -> Result<(), StackError>;

    /// Builds the CANCEL for this transaction's request.
    fn create_cancel(&self) -> Result<Request, StackError> {
        build_cancel(self.request()).map_err(|e| StackError::InvalidMessage(e.to_string()))
    }
}

/// Either side of a transaction, as carried by timeout and termination events.
#[derive(Clone)]
pub enum TransactionRef {
    Server(Arc<dyn ServerTransaction>),
    Client(Arc<dyn ClientTransaction>),
}

impl TransactionRef {
    pub fn id(&self) -> TransactionId {
        match self {
            TransactionRef::Server(tx) => tx.id(),
            TransactionRef::Client(tx) => tx.id(),
        }
    }
}

impl fmt::Debug for TransactionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionRef::Server(tx) => write!(f, "Server({})", tx.id()),
            TransactionRef::Client(tx) => write!(f, "Client({})", tx.id()),
        }
    }
}

/// A request delivered to the listener.
#[derive(Clone)]
pub struct RequestEvent {
    pub provider: Arc<dyn SipProvider>,
    pub request: Request,
    pub server_transaction: Option<Arc<dyn ServerTransaction>>,
}

/// A response delivered to the listener.
#[derive(Clone)]
pub struct ResponseEvent {
    pub provider: Arc<dyn SipProvider>,
    pub response: Response,
    pub client_transaction: Option<Arc<dyn ClientTransaction>>,
}

/// Receives events from one or more providers.
///
/// Events that belong to the same transaction are delivered one at a time.
pub trait SipListener: Send + Sync {
    fn process_request(&self, event: RequestEvent);

    fn process_response(&self, event: ResponseEvent);

    fn process_timeout(&self, transaction: TransactionRef);

    fn process_transaction_terminated(&self, transaction: TransactionRef);
}

/// Returns the top-most Via header value, if present.
pub fn top_via(req: &Request) -> Option<&SmolStr> {
    req.headers().get("Via")
}

/// Extracts the `branch=` parameter from a Via header string.
pub fn branch_from_via(via: &str) -> Option<&str> {
    via.split(';').skip(1).find_map(|part| {
        let mut split = part.splitn(2, '=');
        let name = split.next()?.trim();
        let value = split.next()?.trim();
        if name.eq_ignore_ascii_case("branch") {
            Some(value)
        } else {
            None
        }
    })
}

/// Returns the branch ID of the request's top Via, if one is present.
pub fn request_branch_id(req: &Request) -> Option<SmolStr> {
    let via = top_via(req)?;
    let branch = branch_from_via(via)?;
    Some(SmolStr::new(branch))
}

/// Generates a new RFC 3261 magic-cookie branch identifier.
pub fn generate_branch_id() -> SmolStr {
    let mut rng = rand::thread_rng();
    let suffix: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    SmolStr::new(format!("{}{}", MAGIC_COOKIE, suffix))
}
