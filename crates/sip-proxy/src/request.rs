//! Request path: validation (§16.3), Route preprocessing (§16.4), target
//! determination (§16.5) and forwarding (§16.6).

use std::sync::Arc;

use sip_auth::ChallengeKind;
use sip_core::{build_response, Method, Request, Response, Uri};
use sip_location::LocationError;
use sip_registrar::{authorize, bad_extension, with_domain};
use sip_transaction::{
    generate_branch_id, ListeningPoint, RequestEvent, ServerTransaction, SipProvider, StackError,
};
use tracing::{debug, trace, warn};

use crate::{
    forwarding::{prepare_forward, stateless_branch},
    routing::is_supported_scheme,
    send_cancel, timer_c, Proxy, ProxyError,
};

/// What target determination decided for a request.
enum Resolution {
    /// Forward to `targets`; `stateless` forces a single stateless branch.
    Forward { targets: Vec<Uri>, stateless: bool },
    Reply(Response),
    /// Fully handled already.
    Done,
}

impl Proxy {
    pub(crate) fn handle_request(&self, event: RequestEvent) -> Result<(), ProxyError> {
        let RequestEvent {
            provider,
            mut request,
            server_transaction,
        } = event;

        loop {
            if let Some(response) = self.validate(&request)? {
                self.reply(provider.as_ref(), server_transaction.as_ref(), &request, response);
                return Ok(());
            }
            if !self.locality.undo_strict_route(&mut request) {
                break;
            }
        }
        self.locality.strip_local_maddr(&mut request, provider.as_ref());
        self.locality.pop_local_route(&mut request, provider.as_ref());

        let server = if self.config.is_stateful() && request.method() != &Method::Ack {
            let created = match server_transaction {
                Some(tx) => Ok(tx),
                None => provider.new_server_transaction(&request),
            };
            match created {
                Ok(tx) => {
                    self.counters.server_transactions.inc();
                    Some(tx)
                }
                Err(StackError::TransactionExists(id)) => {
                    trace!(transaction = %id, "retransmission of a known request");
                    return Ok(());
                }
                Err(e) => {
                    debug!(error = %e, "no server transaction, forwarding statelessly");
                    None
                }
            }
        } else {
            server_transaction
        };

        let (targets, forced_stateless) = match self.resolve(&provider, server.as_ref(), &request)? {
            Resolution::Forward { targets, stateless } => (targets, stateless),
            Resolution::Reply(response) => {
                self.reply(provider.as_ref(), server.as_ref(), &request, response);
                return Ok(());
            }
            Resolution::Done => return Ok(()),
        };

        let local = self
            .locality
            .local_hop(provider.as_ref())
            .ok_or(ProxyError::NoListeningPoint)?;
        match server {
            Some(server) if !forced_stateless => {
                self.fork(&provider, &server, &request, &targets, &local)
            }
            _ => {
                self.forward_statelessly(provider.as_ref(), &request, &targets, &local);
                Ok(())
            }
        }
    }

    /// Runs the §16.3 checks, returning the error response of the first
    /// one that fails.
    fn validate(&self, request: &Request) -> Result<Option<Response>, ProxyError> {
        if !is_supported_scheme(request.uri()) {
            debug!(scheme = %request.uri().scheme(), "unsupported URI scheme");
            return Ok(Some(build_response(request, 416)?));
        }

        if let Some(value) = request.headers().get("Max-Forwards") {
            match value.trim().parse::<i64>() {
                Ok(hops) if hops <= 0 => {
                    debug!("too many hops");
                    return Ok(Some(build_response(request, 483)?));
                }
                Ok(_) => {}
                Err(_) => {
                    debug!(value = %value, "malformed Max-Forwards");
                    return Ok(Some(build_response(request, 400)?));
                }
            }
        }

        if self.locality.is_looped(request) {
            debug!("loop detected");
            return Ok(Some(build_response(request, 482)?));
        }

        if request.headers().contains("Proxy-Require") {
            debug!("Proxy-Require present, no extensions supported");
            return Ok(Some(bad_extension(request)?));
        }

        // ACK and CANCEL cannot be challenged (RFC 3261 §22.1)
        if self.config.authentication
            && !matches!(request.method(), Method::Ack | Method::Cancel)
        {
            return self.check_credentials(request);
        }
        Ok(None)
    }

    fn check_credentials(&self, request: &Request) -> Result<Option<Response>, ProxyError> {
        let ls = match self.location.connect() {
            Ok(ls) => ls,
            Err(e) => {
                warn!(error = %e, "location service unreachable");
                return Ok(Some(build_response(request, 500)?));
            }
        };

        let addressed_here = request
            .sip_uri()
            .map(|uri| self.locality.is_local_host(&uri.host))
            .unwrap_or(false);
        let fixed;
        let checked = if addressed_here {
            fixed = with_domain(request, self.default_domain());
            &fixed
        } else {
            request
        };

        match authorize(&self.auth, ChallengeKind::Proxy, checked, ls.as_ref()) {
            Ok(true) => Ok(None),
            Ok(false) | Err(LocationError::UserNotFound(_)) => {
                debug!("proxy authentication required");
                Ok(Some(self.auth.challenge(request, ChallengeKind::Proxy)?))
            }
            Err(e) => {
                warn!(error = %e, "cannot authenticate request");
                Ok(Some(build_response(request, 500)?))
            }
        }
    }

    /// §16.5 target determination, including CANCEL and method plugins.
    fn resolve(
        &self,
        provider: &Arc<dyn SipProvider>,
        server: Option<&Arc<dyn ServerTransaction>>,
        request: &Request,
    ) -> Result<Resolution, ProxyError> {
        if let Some(uri) = request.sip_uri() {
            if uri.maddr().is_some() {
                trace!(uri = %uri, "maddr present, forwarding to the Request-URI");
                return Ok(Resolution::Forward {
                    targets: vec![request.uri().clone()],
                    stateless: false,
                });
            }
            if !self.locality.is_responsible_for(&uri.host) {
                trace!(host = %uri.host, "foreign domain, forwarding to the Request-URI");
                return Ok(Resolution::Forward {
                    targets: vec![request.uri().clone()],
                    stateless: false,
                });
            }
        }

        let mut stateless = false;
        if request.method() == &Method::Cancel {
            if let Some(cancel_tx) = server {
                if self.cancel_branches(provider, cancel_tx, request)? {
                    return Ok(Resolution::Done);
                }
            }
            stateless = true;
        }

        if let Some(plugin) = self.plugins.get(request.method()) {
            match plugin.process_request(request) {
                Ok(Some(response)) => return Ok(Resolution::Reply(response)),
                Ok(None) => {}
                Err(e) => {
                    warn!(method = %request.method(), error = %e, "method plugin failed");
                    return Ok(Resolution::Reply(build_response(request, 500)?));
                }
            }
        }

        let Some(key) = self.locality.location_key(request) else {
            debug!("no address to look up");
            return Ok(Resolution::Reply(build_response(request, 404)?));
        };
        let contacts = match self
            .location
            .connect()
            .and_then(|ls| ls.get_contact_headers(&key))
        {
            Ok(contacts) => contacts,
            Err(LocationError::UserNotFound(_)) => {
                debug!(aor = %key, "subscriber not found");
                return Ok(Resolution::Reply(build_response(request, 404)?));
            }
            Err(e) => {
                warn!(aor = %key, error = %e, "location lookup failed");
                return Ok(Resolution::Reply(build_response(request, 500)?));
            }
        };

        let targets: Vec<Uri> = contacts
            .iter()
            .filter_map(|contact| contact.sip_uri())
            .map(|uri| Uri::from(uri.without_params()))
            .collect();
        if targets.is_empty() {
            debug!(aor = %key, "no registered contacts");
            return Ok(Resolution::Reply(build_response(request, 480)?));
        }
        debug!(aor = %key, targets = targets.len(), "targets resolved");
        Ok(Resolution::Forward { targets, stateless })
    }

    /// Answers a CANCEL whose INVITE is being forwarded by this proxy and
    /// cancels the INVITE's branches. Returns `false` when the INVITE is
    /// unknown.
    fn cancel_branches(
        &self,
        provider: &Arc<dyn SipProvider>,
        cancel_tx: &Arc<dyn ServerTransaction>,
        request: &Request,
    ) -> Result<bool, ProxyError> {
        let Some(mapping) = cancel_tx
            .canceled_invite_transaction()
            .and_then(|invite| self.mappings.for_server(&invite.id()))
        else {
            debug!("CANCEL for an unknown INVITE, forwarding statelessly");
            return Ok(false);
        };

        self.reply(
            provider.as_ref(),
            Some(cancel_tx),
            request,
            build_response(request, 200)?,
        );
        let branches = mapping.lock().take_cancellable();
        debug!(branches = branches.len(), "cancelling forwarded INVITE");
        for branch in branches {
            send_cancel(provider.as_ref(), branch.as_ref(), &self.counters);
        }
        Ok(true)
    }

    /// Sends `request` to its first target without a client transaction.
    fn forward_statelessly(
        &self,
        provider: &dyn SipProvider,
        request: &Request,
        targets: &[Uri],
        local: &ListeningPoint,
    ) {
        let Some(target) = targets.first() else {
            return;
        };
        let branch = stateless_branch(request);
        let forwarded = prepare_forward(request, target, local, &branch);
        match provider.send_request(forwarded) {
            Ok(()) => debug!(target = %target, "forwarded statelessly"),
            Err(e) => trace!(target = %target, error = %e, "failed to forward request"),
        }
    }

    /// Forks `request` to every target in a client transaction of its own.
    fn fork(
        &self,
        provider: &Arc<dyn SipProvider>,
        server: &Arc<dyn ServerTransaction>,
        request: &Request,
        targets: &[Uri],
        local: &ListeningPoint,
    ) -> Result<(), ProxyError> {
        let mapping = self.mappings.get_or_insert(server, provider);
        let is_invite = request.method() == &Method::Invite;
        let mut branches = 0;

        for target in targets {
            let branch = generate_branch_id();
            let forwarded = prepare_forward(request, target, local, &branch);
            let client = match provider.new_client_transaction(forwarded) {
                Ok(tx) => tx,
                Err(e) => {
                    debug!(target = %target, error = %e, "cannot create client transaction");
                    continue;
                }
            };
            self.counters.client_transactions.inc();
            self.mappings.link_client(client.id(), server.id());
            {
                let mut guard = mapping.lock();
                guard.add_branch(Arc::clone(&client));
                if is_invite {
                    let timer = timer_c::arm(
                        self.scheduler.as_ref(),
                        self.config.timer_c,
                        &mapping,
                        client.id(),
                        &self.counters,
                    );
                    if let Some(branch) = guard.branch_mut(&client.id()) {
                        branch.timer_c = Some(timer);
                    }
                }
            }
            branches += 1;

            match client.send_request() {
                Ok(()) => debug!(target = %target, branch = %branch, "branch forwarded"),
                Err(e) => trace!(target = %target, error = %e, "failed to send branch"),
            }
        }

        if branches == 0 {
            self.reply(
                provider.as_ref(),
                Some(server),
                request,
                build_response(request, 500)?,
            );
        }
        Ok(())
    }

    /// Answers `request`, through its server transaction when there is one.
    /// ACK is never answered.
    pub(crate) fn reply(
        &self,
        provider: &dyn SipProvider,
        server: Option<&Arc<dyn ServerTransaction>>,
        request: &Request,
        response: Response,
    ) {
        if request.method() == &Method::Ack {
            trace!(code = response.code(), "not answering ACK");
            return;
        }
        debug!(code = response.code(), reason = response.reason(), "replying");
        let sent = match server {
            Some(tx) => tx.send_response(response),
            None => provider.send_response(response),
        };
        if let Err(e) = sent {
            trace!(error = %e, "failed to send response");
        }
    }
}
