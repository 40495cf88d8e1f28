use std::fmt;

use sip_core::{ContactHeader, NameAddr};
use smol_str::SmolStr;

/// Association of an address-of-record with one reachable contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub key: SmolStr,
    pub contact: NameAddr,
    pub call_id: SmolStr,
    pub cseq: u32,
    /// Remaining lifetime in seconds.
    pub expires: i64,
}

impl Binding {
    pub fn new(key: &str, contact: &NameAddr, call_id: &str, cseq: u32, expires: i64) -> Self {
        Self {
            key: SmolStr::new(key),
            contact: contact.clone(),
            call_id: SmolStr::new(call_id),
            cseq,
            expires,
        }
    }

    /// The stored contact with `expires` set to the remaining lifetime.
    pub fn contact_header(&self) -> ContactHeader {
        let mut contact = ContactHeader::Address(self.contact.clone());
        contact.set_expires(self.expires.max(0) as u64);
        contact
    }

    pub fn matches(&self, contact: &NameAddr) -> bool {
        contact_identity(&self.contact) == contact_identity(contact)
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (call-id={}, cseq={})",
            self.contact_header(),
            self.call_id,
            self.cseq
        )
    }
}

/// Contact addresses compare equal when their URIs match once URI
/// parameters are removed.
pub fn contact_identity(contact: &NameAddr) -> String {
    match contact.sip_uri() {
        Some(uri) => uri.without_params().to_string(),
        None => contact.uri().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sip_core::SipUri;

    fn contact(uri: &str) -> NameAddr {
        NameAddr::new(SipUri::parse(uri).unwrap())
    }

    #[test]
    fn identity_ignores_uri_and_header_params() {
        let mut with_expires = contact("sip:alice@10.0.0.7:5070;transport=udp");
        with_expires.set_param("expires", Some("60"));
        let binding = Binding::new("sip:alice@openjsip.net", &with_expires, "c", 1, 60);
        assert!(binding.matches(&contact("sip:alice@10.0.0.7:5070")));
        assert!(!binding.matches(&contact("sip:alice@10.0.0.7:5080")));
    }

    #[test]
    fn display_shows_remaining_time() {
        let binding = Binding::new(
            "sip:alice@openjsip.net",
            &contact("sip:alice@10.0.0.7"),
            "abc",
            4,
            120,
        );
        assert_eq!(
            binding.to_string(),
            "<sip:alice@10.0.0.7>;expires=120 (call-id=abc, cseq=4)"
        );
    }
}
