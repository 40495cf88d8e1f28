// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::BTreeMap;
use std::fmt;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use smol_str::SmolStr;

/// Port assumed whenever a SIP URI or Via sent-by omits one.
pub const DEFAULT_SIP_PORT: u16 = 5060;

/// Characters escaped when a user or password is written back out.
const USERINFO: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'%')
    .add(b',')
    .add(b':')
    .add(b';')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'@');

/// Parsed representation of a SIP URI (RFC 3261 §19).
///
/// The user part and password are stored escape-decoded, the host is stored
/// lowercased and parameter names are lowercased. Rendering goes through
/// [`fmt::Display`], which re-escapes the userinfo.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SipUri {
    pub sips: bool,
    pub user: Option<SmolStr>,
    pub password: Option<SmolStr>,
    pub host: SmolStr,
    pub port: Option<u16>,
    pub params: BTreeMap<SmolStr, Option<SmolStr>>,
    pub headers: BTreeMap<SmolStr, SmolStr>,
}

impl SipUri {
    /// Constructs a `sip:` URI with the given host and default settings.
    pub fn new(host: impl Into<SmolStr>) -> Self {
        Self {
            sips: false,
            user: None,
            password: None,
            host: SmolStr::new(host.into().to_ascii_lowercase()),
            port: None,
            params: BTreeMap::new(),
            headers: BTreeMap::new(),
        }
    }

    /// Sets the user part, builder style.
    pub fn with_user(mut self, user: impl Into<SmolStr>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Sets the port, builder style.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Attempts to parse a SIP or SIPS URI from the provided string.
    pub fn parse(input: &str) -> Option<Self> {
        let (scheme, rest) = input.trim().split_once(':')?;
        let sips = scheme.eq_ignore_ascii_case("sips");
        if !sips && !scheme.eq_ignore_ascii_case("sip") {
            return None;
        }

        let (addr_part, headers_part) = match rest.split_once('?') {
            Some((addr, headers)) => (addr, Some(headers)),
            None => (rest, None),
        };

        let mut addr_iter = addr_part.split(';');
        let base = addr_iter.next()?.trim();
        let mut params = BTreeMap::new();
        for param in addr_iter {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }
            match param.split_once('=') {
                Some((k, v)) => params.insert(
                    SmolStr::new(k.trim().to_ascii_lowercase()),
                    Some(SmolStr::new(v.trim())),
                ),
                None => params.insert(SmolStr::new(param.to_ascii_lowercase()), None),
            };
        }

        let (userinfo, host_port) = match base.rsplit_once('@') {
            Some((userinfo, host)) => (Some(userinfo.trim()), host.trim()),
            None => (None, base),
        };

        let (user, password) = match userinfo {
            Some(info) => {
                let (user, password) = match info.split_once(':') {
                    Some((u, p)) => (u, Some(p)),
                    None => (info, None),
                };
                let password = match password {
                    Some(password) => Some(decode(password)?),
                    None => None,
                };
                (Some(decode(user)?), password)
            }
            None => (None, None),
        };

        if host_port.is_empty() {
            return None;
        }

        let (host, port) = split_host_port(host_port)?;
        let host = decode(host)?.to_ascii_lowercase();
        if host.is_empty() {
            return None;
        }

        let mut headers = BTreeMap::new();
        if let Some(headers_part) = headers_part {
            for pair in headers_part.split('&') {
                if let Some((k, v)) = pair.split_once('=') {
                    headers.insert(SmolStr::new(k.trim()), SmolStr::new(v.trim()));
                }
            }
        }

        Some(Self {
            sips,
            user,
            password,
            host: SmolStr::new(host),
            port,
            params,
            headers,
        })
    }

    /// Returns the scheme token, `sip` or `sips`.
    pub fn scheme(&self) -> &'static str {
        if self.sips {
            "sips"
        } else {
            "sip"
        }
    }

    /// Returns the explicit port, or 5060 when none was given.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SIP_PORT)
    }

    /// Returns `true` if the named parameter is present, with or without a value.
    pub fn has_param(&self, name: &str) -> bool {
        self.params
            .contains_key(&SmolStr::new(name.to_ascii_lowercase()))
    }

    /// Returns the value of the named parameter when it has one.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .get(&SmolStr::new(name.to_ascii_lowercase()))
            .and_then(|v| v.as_deref())
    }

    pub fn set_param(&mut self, name: &str, value: Option<&str>) {
        self.params.insert(
            SmolStr::new(name.to_ascii_lowercase()),
            value.map(SmolStr::new),
        );
    }

    pub fn remove_param(&mut self, name: &str) -> bool {
        self.params
            .remove(&SmolStr::new(name.to_ascii_lowercase()))
            .is_some()
    }

    /// Returns the `maddr` parameter value.
    pub fn maddr(&self) -> Option<&str> {
        self.param("maddr")
    }

    /// Returns the `transport` parameter value.
    pub fn transport(&self) -> Option<&str> {
        self.param("transport")
    }

    /// Returns `true` when the URI carries the loose-routing `lr` flag.
    pub fn is_loose_route(&self) -> bool {
        self.has_param("lr")
    }

    /// Returns a copy with every URI parameter removed.
    ///
    /// This is the form used to compare contact addresses and to build
    /// outbound Request-URIs from registered contacts.
    pub fn without_params(&self) -> Self {
        let mut uri = self.clone();
        uri.params.clear();
        uri
    }

    /// Returns the canonical address-of-record form of this URI.
    ///
    /// Parameters, password, port and header parameters are dropped; the
    /// host is already lowercased and the userinfo already decoded.
    pub fn canonical(&self) -> Self {
        Self {
            sips: self.sips,
            user: self.user.clone(),
            password: None,
            host: self.host.clone(),
            port: None,
            params: BTreeMap::new(),
            headers: BTreeMap::new(),
        }
    }

    /// Computes the directory key used by the location service.
    ///
    /// The key is the canonical form with the user part left unescaped,
    /// e.g. `sip:alice@example.com`.
    pub fn aor_key(&self) -> SmolStr {
        let canonical = self.canonical();
        let mut key = String::with_capacity(8 + canonical.host.len());
        key.push_str(canonical.scheme());
        key.push(':');
        if let Some(user) = &canonical.user {
            key.push_str(user);
            key.push('@');
        }
        key.push_str(&canonical.host);
        SmolStr::new(key)
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme())?;
        if let Some(user) = &self.user {
            write!(f, "{}", utf8_percent_encode(user, USERINFO))?;
            if let Some(password) = &self.password {
                write!(f, ":{}", utf8_percent_encode(password, USERINFO))?;
            }
            f.write_str("@")?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (name, value) in &self.params {
            match value {
                Some(value) => write!(f, ";{}={}", name, value)?,
                None => write!(f, ";{}", name)?,
            }
        }
        let mut first = true;
        for (name, value) in &self.headers {
            write!(f, "{}{}={}", if first { "?" } else { "&" }, name, value)?;
            first = false;
        }
        Ok(())
    }
}

/// Unified URI type covering SIP/SIPS, tel, and any other absolute URI.
///
/// Only SIP URIs are interpreted; tel and absolute URIs are carried opaquely
/// so that scheme checks can be made without rejecting them at parse time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Uri {
    /// SIP or SIPS URI (e.g., sip:user@example.com)
    Sip(SipUri),
    /// Telephone URI (e.g., tel:+1-555-123-4567), kept verbatim
    Tel(SmolStr),
    /// Absolute URI of any other scheme (e.g., http://example.com/info)
    Absolute(SmolStr),
}

impl Uri {
    /// Parses a URI string, detecting the scheme.
    ///
    /// # Examples
    /// ```
    /// use sip_core::Uri;
    ///
    /// assert_eq!(Uri::parse("sip:alice@example.com").unwrap().scheme(), "sip");
    /// assert_eq!(Uri::parse("tel:+1-555-123-4567").unwrap().scheme(), "tel");
    /// assert_eq!(Uri::parse("im:alice@example.com").unwrap().scheme(), "im");
    /// ```
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        let (scheme, _) = trimmed.split_once(':')?;
        if scheme.eq_ignore_ascii_case("sip") || scheme.eq_ignore_ascii_case("sips") {
            SipUri::parse(trimmed).map(Uri::Sip)
        } else if scheme.eq_ignore_ascii_case("tel") {
            Some(Uri::Tel(SmolStr::new(trimmed)))
        } else {
            parse_absolute_uri(trimmed).map(Uri::Absolute)
        }
    }

    /// Returns the lowercased scheme token.
    pub fn scheme(&self) -> SmolStr {
        match self {
            Uri::Sip(uri) => SmolStr::new(uri.scheme()),
            Uri::Tel(_) => SmolStr::new("tel"),
            Uri::Absolute(raw) => {
                let scheme = raw.split(':').next().unwrap_or_default();
                SmolStr::new(scheme.to_ascii_lowercase())
            }
        }
    }

    /// Returns true if this is a SIP or SIPS URI.
    pub fn is_sip(&self) -> bool {
        matches!(self, Uri::Sip(_))
    }

    /// Returns the inner SipUri if this is a SIP URI, None otherwise.
    pub fn as_sip(&self) -> Option<&SipUri> {
        match self {
            Uri::Sip(uri) => Some(uri),
            _ => None,
        }
    }

    /// Returns the inner SipUri mutably if this is a SIP URI.
    pub fn as_sip_mut(&mut self) -> Option<&mut SipUri> {
        match self {
            Uri::Sip(uri) => Some(uri),
            _ => None,
        }
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Uri::Sip(uri) => uri.fmt(f),
            Uri::Tel(raw) | Uri::Absolute(raw) => f.write_str(raw),
        }
    }
}

impl From<SipUri> for Uri {
    fn from(uri: SipUri) -> Self {
        Uri::Sip(uri)
    }
}

fn decode(input: &str) -> Option<SmolStr> {
    percent_decode_str(input)
        .decode_utf8()
        .ok()
        .map(|s| SmolStr::new(s.as_ref()))
}

fn parse_absolute_uri(input: &str) -> Option<SmolStr> {
    let (scheme, remainder) = input.split_once(':')?;
    let mut chars = scheme.chars();
    if !chars.next()?.is_ascii_alphabetic() {
        return None;
    }
    if !chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '+' || ch == '-' || ch == '.') {
        return None;
    }
    if remainder.is_empty() {
        return None;
    }
    Some(SmolStr::new(input))
}

/// Splits a host[:port] or IPv6 literal "[host]:port" string.
fn split_host_port(input: &str) -> Option<(&str, Option<u16>)> {
    if let Some(stripped) = input.strip_prefix('[') {
        let end = stripped.find(']')?;
        let host = &stripped[..end];
        match stripped[end + 1..].strip_prefix(':') {
            Some(port) => Some((host, Some(port.parse().ok()?))),
            None => Some((host, None)),
        }
    } else if let Some((host, port)) = input.split_once(':') {
        if port.contains(':') {
            return None;
        }
        Some((host, Some(port.parse().ok()?)))
    } else {
        Some((input, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_userinfo_port_and_params() {
        let uri = SipUri::parse("sip:Alice:s3cret@Example.COM:5070;transport=tcp;LR?subject=x")
            .unwrap();
        assert_eq!(uri.user.as_deref(), Some("Alice"));
        assert_eq!(uri.password.as_deref(), Some("s3cret"));
        assert_eq!(uri.host, "example.com");
        assert_eq!(uri.port, Some(5070));
        assert_eq!(uri.transport(), Some("tcp"));
        assert!(uri.is_loose_route());
        assert_eq!(uri.headers.get("subject").map(|v| v.as_str()), Some("x"));
    }

    #[test]
    fn password_is_optional_and_escape_decoded() {
        let uri = SipUri::parse("sip:bob:p%40ss@example.com").unwrap();
        assert_eq!(uri.password.as_deref(), Some("p@ss"));
        let uri = SipUri::parse("sip:bob@example.com").unwrap();
        assert_eq!(uri.password, None);
        assert!(SipUri::parse("sip:bob:%FF@example.com").is_none());
    }

    #[test]
    fn canonical_form_strips_everything_but_user_and_host() {
        let uri = SipUri::parse("sip:al%69ce:pw@EXAMPLE.com:5080;maddr=10.0.0.1?x=y").unwrap();
        let canonical = uri.canonical();
        assert_eq!(canonical.to_string(), "sip:alice@example.com");
        assert_eq!(uri.aor_key(), "sip:alice@example.com");
    }

    #[test]
    fn without_params_keeps_port() {
        let uri = SipUri::parse("sip:bob@10.0.0.2:5062;transport=udp;ob").unwrap();
        assert_eq!(uri.without_params().to_string(), "sip:bob@10.0.0.2:5062");
    }

    #[test]
    fn display_round_trips() {
        for raw in [
            "sip:alice@example.com",
            "sips:bob@example.com:5061",
            "sip:proxy.example.com;lr",
            "sip:a%40b@example.com",
            "sip:[2001:db8::1]:5060",
        ] {
            let uri = SipUri::parse(raw).unwrap();
            assert_eq!(uri.to_string(), raw);
            assert_eq!(SipUri::parse(&uri.to_string()).unwrap(), uri);
        }
    }

    #[test]
    fn uri_enum_schemes() {
        assert!(Uri::parse("SIP:alice@example.com").unwrap().is_sip());
        assert_eq!(Uri::parse("tel:+15551234567").unwrap().scheme(), "tel");
        assert_eq!(Uri::parse("Mailto:a@b.c").unwrap().scheme(), "mailto");
        assert!(Uri::parse("no-scheme").is_none());
    }

    #[test]
    fn rejects_unbracketed_ipv6_host() {
        assert!(SipUri::parse("sip:2001:db8::1").is_none());
    }

    proptest! {
        #[test]
        fn canonicalisation_is_idempotent(
            user in "[a-zA-Z0-9%@ ._-]{1,12}",
            host in "[a-zA-Z][a-zA-Z0-9.-]{0,15}",
            port in proptest::option::of(1u16..65535),
            lr in any::<bool>(),
        ) {
            let mut uri = SipUri::new(host.as_str()).with_user(user.as_str());
            uri.port = port;
            if lr {
                uri.set_param("lr", None);
            }
            let once = uri.canonical();
            prop_assert_eq!(once.canonical(), once.clone());
            prop_assert_eq!(once.aor_key(), uri.aor_key());
            let reparsed = SipUri::parse(&once.to_string()).unwrap();
            prop_assert_eq!(reparsed.aor_key(), uri.aor_key());
        }
    }
}
