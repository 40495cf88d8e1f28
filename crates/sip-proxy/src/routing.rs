//! Which hosts the proxy is responsible for, and RFC 3261 §16.4 Route
//! preprocessing.

use std::collections::BTreeSet;

use sip_core::{Request, SipUri, Uri};
use sip_parse::{parse_name_addr, parse_via_header};
use sip_transaction::{InterfaceConfig, ListeningPoint, SipProvider};
use smol_str::SmolStr;
use tracing::trace;

/// Interfaces and served domains of one proxy.
#[derive(Debug, Clone)]
pub struct Locality {
    interfaces: Vec<InterfaceConfig>,
    domains: BTreeSet<SmolStr>,
    default_domain: SmolStr,
}

impl Locality {
    pub fn new(
        interfaces: Vec<InterfaceConfig>,
        domains: BTreeSet<SmolStr>,
        default_domain: SmolStr,
    ) -> Self {
        Self {
            interfaces,
            domains,
            default_domain,
        }
    }

    pub fn interfaces(&self) -> &[InterfaceConfig] {
        &self.interfaces
    }

    pub fn domains(&self) -> &BTreeSet<SmolStr> {
        &self.domains
    }

    pub fn default_domain(&self) -> &str {
        &self.default_domain
    }

    pub fn is_domain_served(&self, domain: &str) -> bool {
        self.domains.contains(domain.to_ascii_lowercase().as_str())
    }

    /// True if `host` is the address or hostname of a local interface.
    pub fn is_local_host(&self, host: &str) -> bool {
        self.interfaces.iter().any(|i| i.matches_host(host))
    }

    pub fn is_local_endpoint(&self, host: &str, port: u16) -> bool {
        self.interfaces.iter().any(|i| i.matches(host, port))
    }

    /// True if the proxy resolves targets for `host` itself.
    pub fn is_responsible_for(&self, host: &str) -> bool {
        self.is_domain_served(host) || self.is_local_host(host)
    }

    /// The hop advertised in Record-Route and Via for `provider`.
    ///
    /// UDP is preferred; the host is the matching interface's hostname when
    /// one is configured.
    pub fn local_hop(&self, provider: &dyn SipProvider) -> Option<ListeningPoint> {
        let point = provider
            .listening_point("udp")
            .or_else(|| provider.listening_point("tcp"))?;
        let host = self
            .interfaces
            .iter()
            .find(|i| i.matches(&point.host, point.port))
            .map(|i| SmolStr::new(i.advertised_host()))
            .unwrap_or_else(|| point.host.clone());
        Some(ListeningPoint::new(host, point.port, &point.transport))
    }

    /// True if the top Via was inserted by this proxy.
    pub fn is_looped(&self, request: &Request) -> bool {
        request
            .headers()
            .get("Via")
            .and_then(|via| parse_via_header(via))
            .map(|via| self.is_local_endpoint(&via.host, via.port_or_default()))
            .unwrap_or(false)
    }

    /// Undoes a strict-routing previous hop (§16.4).
    ///
    /// When the Request-URI names this proxy and Routes are present, the last
    /// Route is the original Request-URI: it is moved back and removed.
    /// Returns `true` if the request was rewritten.
    pub fn undo_strict_route(&self, request: &mut Request) -> bool {
        if !request.headers().contains("Route") {
            return false;
        }
        let addressed_here = request
            .sip_uri()
            .map(|uri| self.is_local_endpoint(&uri.host, uri.port_or_default()))
            .unwrap_or(false);
        if !addressed_here {
            return false;
        }
        let Some(last) = request
            .headers()
            .get_last("Route")
            .and_then(|route| parse_name_addr(route))
        else {
            return false;
        };
        trace!(uri = %last.uri(), "previous hop was a strict router");
        request.set_uri(last.uri().clone());
        request.headers_mut().remove_last("Route");
        true
    }

    /// Drops a `maddr` that points at this proxy together with the port and
    /// transport it qualified, if the request arrived where they say.
    pub fn strip_local_maddr(&self, request: &mut Request, provider: &dyn SipProvider) {
        let Some(uri) = request.sip_uri() else {
            return;
        };
        let Some(maddr) = uri.maddr() else {
            return;
        };
        if !self.is_responsible_for(maddr) {
            return;
        }
        let transport = uri.transport().unwrap_or("udp");
        let received_here = provider
            .listening_point(transport)
            .map(|point| point.port == uri.port_or_default())
            .unwrap_or(false);
        if !received_here {
            return;
        }

        if let Some(uri) = request.sip_uri_mut() {
            uri.remove_param("maddr");
            uri.remove_param("transport");
            uri.port = None;
            trace!(uri = %uri, "removed maddr naming this proxy");
        }
    }

    /// Removes the first Route when it names this proxy.
    pub fn pop_local_route(&self, request: &mut Request, provider: &dyn SipProvider) {
        let Some(route) = request
            .headers()
            .get("Route")
            .and_then(|route| parse_name_addr(route))
            .and_then(|route| route.sip_uri().cloned())
        else {
            return;
        };
        let Some(point) = provider
            .listening_point(route.transport().unwrap_or("udp"))
            .or_else(|| provider.listening_point("udp"))
        else {
            return;
        };
        if self.is_local_host(&route.host) && route.port_or_default() == point.port {
            request.headers_mut().remove_first("Route");
            trace!(route = %route, "removed Route naming this proxy");
        }
    }

    /// Location service key for the request's target user.
    ///
    /// Taken from the To URI, or the Request-URI when To is not a SIP URI;
    /// a local interface host is replaced by the default domain.
    pub fn location_key(&self, request: &Request) -> Option<SmolStr> {
        let to = sip_registrar::to_address(request).and_then(|to| to.sip_uri().cloned());
        let mut uri: SipUri = to.or_else(|| request.sip_uri().cloned())?;
        if self.is_local_host(&uri.host) {
            uri.host = self.default_domain.clone();
        }
        Some(uri.aor_key())
    }
}

/// True for the URI schemes the proxy routes.
pub fn is_supported_scheme(uri: &Uri) -> bool {
    matches!(uri.scheme().to_ascii_lowercase().as_str(), "sip" | "sips" | "tel")
}
