// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 3261 §16 proxy core.
//!
//! [`Proxy`] validates incoming requests, resolves targets through the
//! location service and forwards them. In stateless mode each request goes
//! to a single target without transactions; in stateful mode it is forked
//! to every registered contact and the branch responses are collected into
//! a [`ResponseContext`] from which one final response is sent upstream.
//!
//! The proxy is driven by a [`SipListener`](sip_transaction::SipListener)
//! implementation, so any [`SipProvider`] can feed it.
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use sip_core::SipUri;
//! use sip_location::{LocationConnector, MemoryLocationService};
//! use sip_proxy::{Proxy, ProxyConfig};
//! use sip_testkit::ManualScheduler;
//! use sip_transaction::TimerScheduler;
//!
//! let ls = Arc::new(
//!     MemoryLocationService::builder("openjsip.net")
//!         .subscriber(SipUri::parse("sip:bob@openjsip.net").unwrap())
//!         .build(),
//! );
//! let connector: Arc<dyn LocationConnector> = Arc::new(ls);
//! let scheduler: Arc<dyn TimerScheduler> = Arc::new(ManualScheduler::new());
//! let proxy = Proxy::new(ProxyConfig::default(), connector, scheduler).unwrap();
//! assert_eq!(proxy.default_domain(), "openjsip.net");
//! ```

use std::{collections::HashMap, sync::Arc};

use serde::Serialize;
use sip_auth::DigestServerAuth;
use sip_core::{MessageError, Method, Response};
use sip_location::{LocationConnector, LocationError};
use sip_observe::{Counter, Gauge};
use sip_transaction::{
    ClientTransaction, ServerTransaction, SipProvider, StackError, TimerScheduler,
    TransactionState,
};
use thiserror::Error;
use tracing::{info, trace, warn};

mod config;
mod context;
mod forwarding;
mod listener;
mod mapping;
mod plugins;
mod request;
mod response;
mod routing;
mod timer_c;

pub use config::{PluginConfig, ProxyConfig, ProxyMode, DEFAULT_TIMER_C};
pub use context::{select_response, ResponseContext};
pub use forwarding::{postprocess_routes, prepare_forward, stateless_branch, DEFAULT_MAX_FORWARDS};
pub use plugins::{MethodPlugin, PluginError, RegisterPlugin};
pub use routing::{is_supported_scheme, Locality};

use mapping::MappingTable;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no served domains configured")]
    NoDomains,
    #[error("provider has no UDP or TCP listening point")]
    NoListeningPoint,
    #[error(transparent)]
    Location(#[from] LocationError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Stack(#[from] StackError),
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    requests_processed: Counter,
    responses_processed: Counter,
    request_errors: Counter,
    response_errors: Counter,
    timeouts: Counter,
    server_transactions: Gauge,
    client_transactions: Gauge,
}

/// Point-in-time copy of the proxy counters.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStats {
    pub requests_processed: u64,
    pub responses_processed: u64,
    pub request_errors: u64,
    pub response_errors: u64,
    pub timeouts: u64,
    pub server_transactions: i64,
    pub client_transactions: i64,
    pub forwarding_contexts: usize,
}

pub struct Proxy {
    config: ProxyConfig,
    locality: Locality,
    location: Arc<dyn LocationConnector>,
    auth: DigestServerAuth,
    scheduler: Arc<dyn TimerScheduler>,
    plugins: HashMap<Method, Arc<dyn MethodPlugin>>,
    mappings: MappingTable,
    counters: Arc<Counters>,
}

impl Proxy {
    /// Creates a proxy. Without configured domains the location service's
    /// domains are served; the first served domain is the default domain and
    /// the digest realm.
    pub fn new(
        config: ProxyConfig,
        location: Arc<dyn LocationConnector>,
        scheduler: Arc<dyn TimerScheduler>,
    ) -> Result<Self, ProxyError> {
        let (domains, default_domain) = if config.domains.is_empty() {
            warn!("no domains configured, using the location service's domains");
            let ls = location.connect()?;
            (ls.get_domains()?, ls.default_domain()?)
        } else {
            (
                config.domains.iter().cloned().collect(),
                config.domains[0].clone(),
            )
        };
        if domains.is_empty() {
            return Err(ProxyError::NoDomains);
        }

        info!(
            mode = ?config.mode,
            domains = ?domains,
            authentication = config.authentication,
            interfaces = config.interfaces.len(),
            "proxy ready"
        );
        Ok(Self {
            locality: Locality::new(config.interfaces.clone(), domains, default_domain.clone()),
            auth: DigestServerAuth::new(default_domain),
            config,
            location,
            scheduler,
            plugins: HashMap::new(),
            mappings: MappingTable::new(),
            counters: Arc::new(Counters::default()),
        })
    }

    /// Routes requests of the plugin's method to it, replacing any plugin
    /// registered for that method.
    pub fn register_plugin(&mut self, plugin: Arc<dyn MethodPlugin>) {
        let method = plugin.method();
        info!(method = %method, "method plugin registered");
        self.plugins.insert(method, plugin);
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn locality(&self) -> &Locality {
        &self.locality
    }

    pub fn default_domain(&self) -> &str {
        self.locality.default_domain()
    }

    pub fn is_domain_served(&self, domain: &str) -> bool {
        self.locality.is_domain_served(domain)
    }

    pub fn stats(&self) -> ProxyStats {
        let c = &self.counters;
        ProxyStats {
            requests_processed: c.requests_processed.get(),
            responses_processed: c.responses_processed.get(),
            request_errors: c.request_errors.get(),
            response_errors: c.response_errors.get(),
            timeouts: c.timeouts.get(),
            server_transactions: c.server_transactions.get(),
            client_transactions: c.client_transactions.get(),
            forwarding_contexts: self.mappings.len(),
        }
    }
}

/// Sends a response upstream, through the server transaction while it still
/// accepts one and statelessly otherwise.
pub(crate) fn send_upstream(
    server: &Arc<dyn ServerTransaction>,
    provider: &dyn SipProvider,
    response: Response,
) {
    let code = response.code();
    let sent = if server.state() < TransactionState::Completed {
        server.send_response(response)
    } else {
        provider.send_response(response)
    };
    match sent {
        Ok(()) => trace!(code, "response forwarded"),
        Err(e) => trace!(code, error = %e, "failed to forward response"),
    }
}

/// Sends a CANCEL for `branch` in a client transaction of its own.
pub(crate) fn send_cancel(
    provider: &dyn SipProvider,
    branch: &dyn ClientTransaction,
    counters: &Counters,
) {
    let cancel = match branch.create_cancel() {
        Ok(cancel) => cancel,
        Err(e) => {
            warn!(branch = %branch.id(), error = %e, "cannot build CANCEL");
            return;
        }
    };
    let tx = match provider.new_client_transaction(cancel) {
        Ok(tx) => tx,
        Err(e) => {
            trace!(branch = %branch.id(), error = %e, "cannot create CANCEL transaction");
            return;
        }
    };
    counters.client_transactions.inc();
    match tx.send_request() {
        Ok(()) => trace!(branch = %branch.id(), "CANCEL sent"),
        Err(e) => trace!(branch = %branch.id(), error = %e, "failed to send CANCEL"),
    }
}
