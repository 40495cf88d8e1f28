use std::collections::BTreeMap;
use std::fmt;

use smol_str::SmolStr;

use crate::{SipUri, Uri};

/// Generic SIP name-addr structure used by many headers (From/To/Contact/Route).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<SmolStr>,
    pub uri: Uri,
    pub params: BTreeMap<SmolStr, Option<SmolStr>>,
}

impl NameAddr {
    /// Wraps a URI without display name or header parameters.
    pub fn new(uri: impl Into<Uri>) -> Self {
        Self {
            display_name: None,
            uri: uri.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn sip_uri(&self) -> Option<&SipUri> {
        self.uri.as_sip()
    }

    pub fn get_param(&self, name: &str) -> Option<&Option<SmolStr>> {
        self.params.get(&SmolStr::new(name.to_ascii_lowercase()))
    }

    pub fn set_param(&mut self, name: &str, value: Option<&str>) {
        self.params.insert(
            SmolStr::new(name.to_ascii_lowercase()),
            value.map(SmolStr::new),
        );
    }

    /// Returns the `tag` parameter (From/To).
    pub fn tag(&self) -> Option<&str> {
        self.get_param("tag").and_then(|v| v.as_deref())
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(display) = &self.display_name {
            write!(f, "\"{}\" ", display)?;
        }
        write!(f, "<{}>", self.uri)?;
        for (name, value) in &self.params {
            match value {
                Some(value) if needs_quotes(value) => write!(f, ";{}=\"{}\"", name, value)?,
                Some(value) => write!(f, ";{}={}", name, value)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

fn needs_quotes(value: &str) -> bool {
    value
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, ',' | ';' | '<' | '>' | '"'))
}
