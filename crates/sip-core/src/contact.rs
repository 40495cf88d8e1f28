use std::fmt;

use smol_str::SmolStr;

use crate::{name_addr::NameAddr, SipUri};

/// Parsed representation of a Contact header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactHeader {
    /// The `*` form, only legal in REGISTER with `Expires: 0`.
    Wildcard,
    Address(NameAddr),
}

impl ContactHeader {
    /// Builds a contact for the given SIP URI.
    pub fn from_uri(uri: SipUri) -> Self {
        ContactHeader::Address(NameAddr::new(uri))
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, ContactHeader::Wildcard)
    }

    /// Returns the contact URI when it is a SIP URI.
    pub fn sip_uri(&self) -> Option<&SipUri> {
        match self {
            ContactHeader::Address(addr) => addr.sip_uri(),
            ContactHeader::Wildcard => None,
        }
    }

    pub fn inner(&self) -> Option<&NameAddr> {
        match self {
            ContactHeader::Address(addr) => Some(addr),
            ContactHeader::Wildcard => None,
        }
    }

    /// Returns the `expires` header parameter, if present and numeric.
    pub fn expires(&self) -> Option<u32> {
        self.inner()?
            .get_param("expires")?
            .as_ref()?
            .trim()
            .parse()
            .ok()
    }

    /// Sets the `expires` header parameter. No-op for the wildcard.
    pub fn set_expires(&mut self, seconds: u64) {
        if let ContactHeader::Address(addr) = self {
            addr.params
                .insert(SmolStr::new("expires"), Some(SmolStr::new(seconds.to_string())));
        }
    }
}

impl fmt::Display for ContactHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContactHeader::Wildcard => f.write_str("*"),
            ContactHeader::Address(addr) => addr.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_param_round_trip() {
        let uri = SipUri::parse("sip:alice@10.0.0.1:5070").unwrap();
        let mut contact = ContactHeader::from_uri(uri);
        assert_eq!(contact.expires(), None);
        contact.set_expires(120);
        assert_eq!(contact.expires(), Some(120));
        assert_eq!(contact.to_string(), "<sip:alice@10.0.0.1:5070>;expires=120");
    }

    #[test]
    fn wildcard_has_no_uri() {
        let mut contact = ContactHeader::Wildcard;
        contact.set_expires(10);
        assert!(contact.sip_uri().is_none());
        assert_eq!(contact.to_string(), "*");
    }
}
