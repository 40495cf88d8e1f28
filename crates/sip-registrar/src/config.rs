use sip_core::{ConfigError, Properties};
use sip_transaction::InterfaceConfig;
use smol_str::SmolStr;

const MIN_EXPIRES_FLOOR: u32 = 5;
const EXPIRES_GAP: u32 = 5;

/// How REGISTER requests reach the registrar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationMode {
    /// The registrar listens on its own interfaces.
    Standalone,
    /// REGISTER arrives through the proxy's method plugin.
    #[default]
    ViaProxy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrarConfig {
    pub mode: OperationMode,
    pub interfaces: Vec<InterfaceConfig>,
    pub authentication: bool,
    /// Lower bound for binding lifetimes, in seconds.
    pub bind_min: u32,
    /// Upper bound for binding lifetimes and the default when none is requested.
    pub bind_max: u32,
    /// Served domains. Empty means "use the location service's domains".
    pub domains: Vec<SmolStr>,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            mode: OperationMode::ViaProxy,
            interfaces: Vec::new(),
            authentication: false,
            bind_min: 60,
            bind_max: 3600,
            domains: Vec::new(),
        }
    }
}

impl RegistrarConfig {
    /// Reads the `registrar.*` keys.
    pub fn from_properties(props: &Properties) -> Result<Self, ConfigError> {
        let props = props.subset("registrar");
        let defaults = Self::default();

        let mode = match props.get("operation.mode") {
            None => defaults.mode,
            Some(mode) if mode.eq_ignore_ascii_case("standalone") => OperationMode::Standalone,
            Some(mode) if mode.eq_ignore_ascii_case("viaproxy") => OperationMode::ViaProxy,
            Some(mode) => {
                return Err(ConfigError::InvalidValue {
                    key: "registrar.operation.mode".into(),
                    value: mode.into(),
                })
            }
        };

        // malformed bounds fall back to the defaults
        let bind_min = props
            .get("binding.expire.time.min")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.bind_min);
        let bind_max = props
            .get("binding.expire.time.max")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.bind_max);

        Ok(Self {
            mode,
            interfaces: InterfaceConfig::load_all(&props)?,
            authentication: props.get_flag("authentication.enabled")?.unwrap_or(false),
            domains: props
                .get_list("domains")
                .into_iter()
                .map(|domain| SmolStr::new(domain.to_ascii_lowercase()))
                .collect(),
            ..defaults
        }
        .with_expiry_bounds(bind_min, bind_max))
    }

    /// Sets the binding lifetime bounds, enforcing `min >= 5` and `max >= min + 5`.
    pub fn with_expiry_bounds(mut self, min: u32, max: u32) -> Self {
        self.bind_min = min.max(MIN_EXPIRES_FLOOR);
        self.bind_max = max.max(self.bind_min + EXPIRES_GAP);
        self
    }

    /// Clamps a requested lifetime; zero stays zero.
    pub fn clamp_expires(&self, requested: u32) -> u32 {
        if requested == 0 {
            0
        } else {
            requested.clamp(self.bind_min, self.bind_max)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_have_floors() {
        let config = RegistrarConfig::default().with_expiry_bounds(1, 2);
        assert_eq!((config.bind_min, config.bind_max), (5, 10));
        assert_eq!(config.clamp_expires(0), 0);
        assert_eq!(config.clamp_expires(3), 5);
        assert_eq!(config.clamp_expires(100), 10);
    }

    #[test]
    fn reads_registrar_keys() {
        let props = Properties::parse(
            "registrar.operation.mode = Standalone\n\
             registrar.authentication.enabled = yes\n\
             registrar.binding.expire.time.min = 30\n\
             registrar.binding.expire.time.max = oops\n\
             registrar.domains = OpenJSIP.net, example.com\n\
             registrar.interface.1.addr = 10.0.0.1\n\
             registrar.interface.1.port = 5061\n",
        );
        let config = RegistrarConfig::from_properties(&props).unwrap();
        assert_eq!(config.mode, OperationMode::Standalone);
        assert!(config.authentication);
        assert_eq!((config.bind_min, config.bind_max), (30, 3600));
        assert_eq!(config.domains, vec!["openjsip.net", "example.com"]);
        assert_eq!(config.interfaces.len(), 1);
        assert_eq!(config.interfaces[0].port, 5061);
    }

    #[test]
    fn defaults_without_keys() {
        let config = RegistrarConfig::from_properties(&Properties::default()).unwrap();
        assert_eq!(config, RegistrarConfig::default());

        let bad = Properties::parse("registrar.operation.mode = proxyless");
        assert!(RegistrarConfig::from_properties(&bad).is_err());
    }
}
