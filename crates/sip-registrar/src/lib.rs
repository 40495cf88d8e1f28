// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 3261 §10.3 registrar.
//!
//! [`Registrar::process_register`] validates a REGISTER, authenticates the
//! subscriber and applies the requested binding changes to a
//! [`LocationService`]. The registrar can answer REGISTER directly as a
//! [`SipListener`](sip_transaction::SipListener) or be called by the proxy's REGISTER plugin.
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use sip_core::SipUri;
//! use sip_location::{LocationConnector, MemoryLocationService};
//! use sip_registrar::{Registrar, RegistrarConfig};
//!
//! let ls = Arc::new(
//!     MemoryLocationService::builder("openjsip.net")
//!         .subscriber(SipUri::parse("sip:alice@openjsip.net").unwrap())
//!         .build(),
//! );
//! let connector: Arc<dyn LocationConnector> = Arc::new(ls);
//! let registrar = Registrar::new(RegistrarConfig::default(), connector).unwrap();
//! assert!(registrar.is_domain_served("openjsip.net"));
//! ```

use std::{collections::BTreeSet, sync::Arc};

use chrono::Utc;
use serde::Serialize;
use sip_auth::{credentials, ChallengeKind, DigestServerAuth};
use sip_core::{build_response, ContactHeader, MessageError, NameAddr, Request, Response, Uri};
use sip_location::{LocationConnector, LocationError, LocationService};
use sip_observe::{request_span, Counter};
use sip_parse::{
    parse_contact_header, parse_delta_seconds, parse_name_addr, parse_option_tags,
    split_quoted_commas,
};
use smol_str::SmolStr;
use thiserror::Error;
use tracing::{debug, info, warn};

mod config;
mod listener;

pub use config::{OperationMode, RegistrarConfig};

#[derive(Debug, Error)]
pub enum RegistrarError {
    #[error("no served domains configured")]
    NoDomains,
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error(transparent)]
    Location(#[from] LocationError),
    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Counters kept by the registrar.
#[derive(Debug, Default)]
struct Counters {
    incoming_requests: Counter,
    responses_ok: Counter,
    request_rejects: Counter,
    processing_errors: Counter,
    auth_failures: Counter,
    user_not_found: Counter,
    binding_queries: Counter,
    binding_updates: Counter,
    binding_cancels: Counter,
    full_cancels: Counter,
}

/// Point-in-time copy of the registrar counters.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegistrarStats {
    pub incoming_requests: u64,
    pub responses_ok: u64,
    pub request_rejects: u64,
    pub processing_errors: u64,
    pub auth_failures: u64,
    pub user_not_found: u64,
    pub binding_queries: u64,
    pub binding_updates: u64,
    pub binding_cancels: u64,
    pub full_cancels: u64,
}

pub struct Registrar {
    config: RegistrarConfig,
    domains: BTreeSet<SmolStr>,
    default_domain: SmolStr,
    location: Arc<dyn LocationConnector>,
    auth: DigestServerAuth,
    counters: Counters,
}

impl Registrar {
    /// Creates a registrar. Without configured domains the location
    /// service's domains are served.
    pub fn new(
        config: RegistrarConfig,
        location: Arc<dyn LocationConnector>,
    ) -> Result<Self, RegistrarError> {
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
            return Err(RegistrarError::NoDomains);
        }

        info!(
            domains = ?domains,
            authentication = config.authentication,
            bind_min = config.bind_min,
            bind_max = config.bind_max,
            "registrar ready"
        );
        Ok(Self {
            auth: DigestServerAuth::new(default_domain.clone()),
            config,
            domains,
            default_domain,
            location,
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &RegistrarConfig {
        &self.config
    }

    pub fn default_domain(&self) -> &str {
        &self.default_domain
    }

    pub fn is_domain_served(&self, domain: &str) -> bool {
        self.domains.contains(domain.to_ascii_lowercase().as_str())
    }

    /// True if `host` names one of the registrar's own interfaces.
    pub fn is_local_address(&self, host: &str) -> bool {
        self.config
            .interfaces
            .iter()
            .any(|interface| interface.matches_host(host))
    }

    pub fn stats(&self) -> RegistrarStats {
        let c = &self.counters;
        RegistrarStats {
            incoming_requests: c.incoming_requests.get(),
            responses_ok: c.responses_ok.get(),
            request_rejects: c.request_rejects.get(),
            processing_errors: c.processing_errors.get(),
            auth_failures: c.auth_failures.get(),
            user_not_found: c.user_not_found.get(),
            binding_queries: c.binding_queries.get(),
            binding_updates: c.binding_updates.get(),
            binding_cancels: c.binding_cancels.get(),
            full_cancels: c.full_cancels.get(),
        }
    }

    /// Processes a REGISTER and counts the outcome.
    ///
    /// Internal failures are counted and answered with 500.
    pub fn handle_register(
        &self,
        request: &Request,
        overridden_domain: Option<&str>,
    ) -> Result<Response, MessageError> {
        self.counters.incoming_requests.inc();
        let _span = request_span(request.call_id().unwrap_or_default()).entered();
        debug!(uri = %request.uri(), "incoming REGISTER");

        match self.process_register(request, overridden_domain) {
            Ok(response) => {
                if response.code() == 200 {
                    self.counters.responses_ok.inc();
                } else {
                    self.counters.request_rejects.inc();
                }
                debug!(code = response.code(), reason = response.reason(), "replied");
                Ok(response)
            }
            Err(e) => {
                self.counters.processing_errors.inc();
                warn!(error = %e, "REGISTER processing failed");
                build_response(request, 500)
            }
        }
    }

    /// Runs the RFC 3261 §10.3 procedure and returns the response to send.
    ///
    /// With `overridden_domain` the host of the Request-URI and To URI is
    /// replaced by that domain before the location service is consulted;
    /// the response still mirrors the original request.
    pub fn process_register(
        &self,
        request: &Request,
        overridden_domain: Option<&str>,
    ) -> Result<Response, RegistrarError> {
        match self.register(request, overridden_domain) {
            Err(RegistrarError::Location(LocationError::UserNotFound(key))) => {
                self.counters.user_not_found.inc();
                debug!(aor = %key, "subscriber not found");
                Ok(build_response(request, 404)?)
            }
            other => other,
        }
    }

    fn register(
        &self,
        request: &Request,
        overridden_domain: Option<&str>,
    ) -> Result<Response, RegistrarError> {
        let fixed = overridden_domain.map(|domain| with_domain(request, domain));
        let subject = fixed.as_ref().unwrap_or(request);

        let Some(request_uri) = subject.sip_uri().map(|uri| uri.canonical()) else {
            debug!("rejected: Request-URI is not a SIP URI");
            return Ok(build_response(request, 400)?);
        };

        if !self.is_domain_served(&request_uri.host) {
            let mut response = build_response(request, 403)?;
            response.set_reason(format!(
                "The registrar is not responsible for domain {}.",
                request_uri.host
            ))?;
            debug!(domain = %request_uri.host, "rejected: domain not served");
            return Ok(response);
        }

        if request.headers().contains("Proxy-Require") {
            debug!("rejected: no extensions supported");
            return Ok(bad_extension(request)?);
        }

        let ls = match self.location.connect() {
            Ok(ls) => ls,
            Err(e) => {
                warn!(error = %e, "cannot reach the location service");
                return Ok(build_response(request, 500)?);
            }
        };

        if self.config.authentication
            && !authorize(&self.auth, ChallengeKind::Www, subject, ls.as_ref())?
        {
            self.counters.auth_failures.inc();
            debug!("rejected: unauthorized");
            return Ok(self.auth.challenge(request, ChallengeKind::Www)?);
        }

        let Some(to_uri) = to_address(subject).and_then(|to| to.sip_uri().map(|uri| uri.canonical()))
        else {
            self.counters.user_not_found.inc();
            debug!("rejected: To is not a SIP URI");
            return Ok(build_response(request, 404)?);
        };
        if !to_uri.host.eq_ignore_ascii_case(&request_uri.host) {
            self.counters.user_not_found.inc();
            debug!("rejected: To and Request-URI domains differ");
            return Ok(build_response(request, 404)?);
        }
        let key = to_uri.aor_key();

        let Some(contacts) = contact_values(request) else {
            debug!("rejected: malformed Contact");
            return Ok(build_response(request, 400)?);
        };
        let expires_header = request
            .headers()
            .get("Expires")
            .and_then(|value| parse_delta_seconds(value));

        if contacts.iter().any(ContactHeader::is_wildcard) {
            if contacts.len() != 1 || expires_header != Some(0) {
                debug!("rejected: wildcard Contact needs Expires: 0 and no other contacts");
                return Ok(build_response(request, 400)?);
            }
            ls.remove_all_bindings(&key)?;
            self.counters.full_cancels.inc();
            info!(aor = %key, "all bindings removed");
        } else if contacts.is_empty() {
            self.counters.binding_queries.inc();
        } else {
            let call_id = request
                .call_id()
                .ok_or(RegistrarError::MissingHeader("Call-ID"))?;
            let (cseq, _) = request.cseq().ok_or(RegistrarError::MissingHeader("CSeq"))?;

            // every contact is checked before the first binding changes
            let mut changes = Vec::with_capacity(contacts.len());
            for header in &contacts {
                let Some(contact) = header.inner() else {
                    continue;
                };
                let requested = header
                    .expires()
                    .or(expires_header)
                    .unwrap_or(self.config.bind_max);
                let expires = self.config.clamp_expires(requested);

                if let Some(existing) = ls.get_binding(&key, contact)? {
                    if existing.call_id.as_str() == call_id && cseq <= existing.cseq {
                        debug!(
                            aor = %key,
                            cseq,
                            stored = existing.cseq,
                            "rejected: stale registration"
                        );
                        return Ok(build_response(request, 400)?);
                    }
                }
                changes.push((contact, expires));
            }

            for (contact, expires) in changes {
                if expires == 0 {
                    ls.remove_binding(&key, contact)?;
                    self.counters.binding_cancels.inc();
                    info!(aor = %key, contact = %contact, "binding removed");
                } else {
                    ls.update_registration(&key, contact, expires, call_id, cseq)?;
                    self.counters.binding_updates.inc();
                    info!(aor = %key, contact = %contact, expires, "binding updated");
                }
            }
        }

        let mut response = build_response(request, 200)?;
        for contact in ls.get_contact_headers(&key)? {
            response.headers_mut().push("Contact", contact.to_string());
        }
        response.headers_mut().push("Date", http_date());
        Ok(response)
    }
}

/// Verifies the digest credentials of `kind` carried by `request`.
///
/// The subscriber is looked up by the To URI; a request without credentials
/// is simply not authorized.
pub fn authorize(
    auth: &DigestServerAuth,
    kind: ChallengeKind,
    request: &Request,
    ls: &dyn LocationService,
) -> Result<bool, LocationError> {
    let Some(credentials) = credentials(request, kind) else {
        debug!(header = kind.credentials_header(), "authentication failed: credentials missing");
        return Ok(false);
    };
    let Some(key) = to_address(request).and_then(|to| to.sip_uri().map(|uri| uri.aor_key()))
    else {
        return Ok(false);
    };
    let username = ls.get_username(&key)?;
    let password = ls.get_password(&key)?;
    Ok(auth.authenticate(request.method(), &credentials, &username, &password))
}

/// Builds the 420 listing every option tag of `Proxy-Require` as unsupported.
pub fn bad_extension(request: &Request) -> Result<Response, MessageError> {
    let tags = parse_option_tags(request.headers(), "Proxy-Require");
    let mut response = build_response(request, 420)?;
    response.headers_mut().push("Unsupported", tags.join(", "));
    Ok(response)
}

/// Parsed To header of a request.
pub fn to_address(request: &Request) -> Option<NameAddr> {
    request
        .headers()
        .get("To")
        .and_then(|value| parse_name_addr(value))
}

/// Every Contact value, or `None` if one of them is malformed.
fn contact_values(request: &Request) -> Option<Vec<ContactHeader>> {
    request
        .headers()
        .get_all("Contact")
        .flat_map(|value| split_quoted_commas(value))
        .map(|part| parse_contact_header(&part))
        .collect()
}

/// Copy of `request` whose Request-URI and To URI hosts are `domain`.
pub fn with_domain(request: &Request, domain: &str) -> Request {
    let mut fixed = request.clone();
    if let Some(uri) = fixed.sip_uri_mut() {
        uri.host = SmolStr::new(domain.to_ascii_lowercase());
    }
    if let Some(mut to) = to_address(request) {
        if let Uri::Sip(uri) = &mut to.uri {
            uri.host = SmolStr::new(domain.to_ascii_lowercase());
        }
        fixed.headers_mut().set("To", to.to_string());
    }
    fixed
}

fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
