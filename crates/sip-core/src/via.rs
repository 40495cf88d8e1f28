use std::collections::BTreeMap;
use std::fmt;

use smol_str::SmolStr;

use crate::uri::DEFAULT_SIP_PORT;

/// RFC 3261 magic cookie that prefixes every compliant branch parameter.
pub const MAGIC_COOKIE: &str = "z9hG4bK";

/// Parsed representation of a single Via header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViaHeader {
    pub transport: SmolStr,
    pub host: SmolStr,
    pub port: Option<u16>,
    pub params: BTreeMap<SmolStr, Option<SmolStr>>,
}

impl ViaHeader {
    /// Creates a Via for the given transport and sent-by carrying `branch`.
    pub fn new(transport: &str, host: &str, port: u16, branch: &str) -> Self {
        let mut params = BTreeMap::new();
        params.insert(SmolStr::new("branch"), Some(SmolStr::new(branch)));
        Self {
            transport: SmolStr::new(transport.to_ascii_uppercase()),
            host: SmolStr::new(host),
            port: Some(port),
            params,
        }
    }

    /// Returns the transport token (e.g. UDP/TCP/TLS) associated with this Via.
    pub fn transport(&self) -> &str {
        self.transport.as_str()
    }

    /// Returns the sent-by port, falling back to 5060.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SIP_PORT)
    }

    /// Looks up the provided parameter ignoring ASCII case.
    pub fn param(&self, name: &str) -> Option<&Option<SmolStr>> {
        self.params.get(&SmolStr::new(name.to_ascii_lowercase()))
    }

    pub fn branch(&self) -> Option<&str> {
        self.param("branch").and_then(|v| v.as_deref())
    }

    /// Returns `true` when the branch carries the RFC 3261 magic cookie.
    pub fn has_rfc3261_branch(&self) -> bool {
        self.branch()
            .map(|b| b.starts_with(MAGIC_COOKIE))
            .unwrap_or(false)
    }
}

impl fmt::Display for ViaHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} ", self.transport)?;
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
        Ok(())
    }
}

/// Validates a branch parameter: magic cookie plus at least one token char.
pub fn is_valid_branch(branch: &str) -> bool {
    branch.len() > MAGIC_COOKIE.len()
        && branch.len() <= 256
        && branch.starts_with(MAGIC_COOKIE)
        && branch
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '!' | '%' | '*' | '_' | '+' | '`' | '\'' | '~'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_sent_by_and_branch() {
        let via = ViaHeader::new("udp", "proxy.example.com", 5060, "z9hG4bKabc");
        assert_eq!(
            via.to_string(),
            "SIP/2.0/UDP proxy.example.com:5060;branch=z9hG4bKabc"
        );
        assert!(via.has_rfc3261_branch());
        assert_eq!(via.port_or_default(), 5060);
    }

    #[test]
    fn branch_validation() {
        assert!(is_valid_branch("z9hG4bK776asdhds"));
        assert!(!is_valid_branch("z9hG4bK"));
        assert!(!is_valid_branch("776asdhds"));
        assert!(!is_valid_branch("z9hG4bK;evil"));
    }
}
