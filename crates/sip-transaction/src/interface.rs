//! Network interfaces a service listens on, read from `<prefix>.interface.N.*`.

use sip_core::{ConfigError, Properties, DEFAULT_SIP_PORT};
use smol_str::SmolStr;

use crate::ListeningPoint;

const DEFAULT_TRANSPORTS: &str = "udp, tcp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub addr: SmolStr,
    /// Name advertised in Record-Route; defaults to `addr`.
    pub hostname: Option<SmolStr>,
    pub port: u16,
    pub transports: Vec<SmolStr>,
}

impl InterfaceConfig {
    pub fn new(addr: &str, port: u16) -> Self {
        Self {
            addr: SmolStr::new(addr.trim().to_ascii_lowercase()),
            hostname: None,
            port,
            transports: vec![SmolStr::new("udp")],
        }
    }

    pub fn with_hostname(mut self, hostname: &str) -> Self {
        self.hostname = Some(SmolStr::new(hostname.trim().to_ascii_lowercase()));
        self
    }

    /// Reads `interface.1`, `interface.2`, ... from `props` until an index has no `addr`.
    ///
    /// A malformed port falls back to 5060.
    pub fn load_all(props: &Properties) -> Result<Vec<Self>, ConfigError> {
        let mut interfaces = Vec::new();
        for index in 1.. {
            let section = props.subset(&format!("interface.{}", index));
            let Some(addr) = section.get("addr") else {
                break;
            };
            let port = section
                .get("port")
                .and_then(|port| port.trim().parse().ok())
                .unwrap_or(DEFAULT_SIP_PORT);
            let transports = section
                .get_or("transport", DEFAULT_TRANSPORTS)
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(|t| SmolStr::new(t.to_ascii_lowercase()))
                .collect::<Vec<_>>();
            if transports.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: format!("interface.{}.transport", index),
                    value: section.get_or("transport", "").to_owned(),
                });
            }
            let mut interface = Self::new(addr, port);
            interface.transports = transports;
            if let Some(hostname) = section.get("hostname") {
                interface = interface.with_hostname(hostname);
            }
            interfaces.push(interface);
        }
        Ok(interfaces)
    }

    /// Host placed in Record-Route and Via headers.
    pub fn advertised_host(&self) -> &str {
        self.hostname.as_deref().unwrap_or(&self.addr)
    }

    /// True if `host` names this interface by address or hostname.
    pub fn matches_host(&self, host: &str) -> bool {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        self.addr.eq_ignore_ascii_case(host)
            || self
                .hostname
                .as_deref()
                .map(|name| name.eq_ignore_ascii_case(host))
                .unwrap_or(false)
    }

    pub fn matches(&self, host: &str, port: u16) -> bool {
        self.port == port && self.matches_host(host)
    }

    pub fn supports(&self, transport: &str) -> bool {
        self.transports
            .iter()
            .any(|t| t.eq_ignore_ascii_case(transport))
    }

    pub fn listening_points(&self) -> Vec<ListeningPoint> {
        self.transports
            .iter()
            .map(|transport| ListeningPoint::new(self.addr.clone(), self.port, transport))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_indexed_interfaces() {
        let props = Properties::parse(
            "interface.1.addr = 10.0.0.1\n\
             interface.1.hostname = Proxy.Example.com\n\
             interface.2.addr = 192.168.1.1\n\
             interface.2.port = 5070\n\
             interface.2.transport = UDP\n\
             interface.4.addr = 172.16.0.1\n",
        );
        let interfaces = InterfaceConfig::load_all(&props).unwrap();
        assert_eq!(interfaces.len(), 2);
        assert_eq!(interfaces[0].port, 5060);
        assert_eq!(interfaces[0].transports, vec!["udp", "tcp"]);
        assert_eq!(interfaces[0].advertised_host(), "proxy.example.com");
        assert!(interfaces[0].matches_host("PROXY.example.com"));
        assert!(interfaces[1].matches("192.168.1.1", 5070));
        assert!(!interfaces[1].matches("192.168.1.1", 5060));
        assert!(!interfaces[1].supports("tcp"));
    }

    #[test]
    fn bad_port_defaults() {
        let props = Properties::parse("interface.1.addr = ::1\ninterface.1.port = x\n");
        let interfaces = InterfaceConfig::load_all(&props).unwrap();
        assert_eq!(interfaces[0].port, 5060);
        assert!(interfaces[0].matches_host("[::1]"));
        assert_eq!(interfaces[0].listening_points()[0].sent_by(), "[::1]:5060");
    }
}
