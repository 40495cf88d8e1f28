use std::time::Duration;

use sip_core::{ConfigError, Method, Properties};
use sip_transaction::InterfaceConfig;
use smol_str::SmolStr;

/// Timer C, RFC 3261 §16.6 step 11. Must exceed three minutes.
pub const DEFAULT_TIMER_C: Duration = Duration::from_secs(181);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyMode {
    /// Forward without transactions, one target per request.
    #[default]
    Stateless,
    /// Track transactions and fork to every registered contact.
    Stateful,
}

/// A `proxy.method.plugin.N` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginConfig {
    pub method: Method,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub mode: ProxyMode,
    pub interfaces: Vec<InterfaceConfig>,
    /// Served domains. Empty means "use the location service's domains".
    pub domains: Vec<SmolStr>,
    pub authentication: bool,
    pub plugins: Vec<PluginConfig>,
    pub timer_c: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            mode: ProxyMode::Stateless,
            interfaces: Vec::new(),
            domains: Vec::new(),
            authentication: false,
            plugins: Vec::new(),
            timer_c: DEFAULT_TIMER_C,
        }
    }
}

impl ProxyConfig {
    /// Reads the `proxy.*` keys.
    pub fn from_properties(props: &Properties) -> Result<Self, ConfigError> {
        let props = props.subset("proxy");

        let mode = match props.get("operation.mode").map(str::to_ascii_lowercase) {
            None => ProxyMode::Stateless,
            Some(mode) if mode == "stateless" => ProxyMode::Stateless,
            // older configuration files spell it "statefull"
            Some(mode) if mode == "stateful" || mode == "statefull" => ProxyMode::Stateful,
            Some(mode) => {
                return Err(ConfigError::InvalidValue {
                    key: "proxy.operation.mode".into(),
                    value: mode,
                })
            }
        };

        Ok(Self {
            mode,
            interfaces: InterfaceConfig::load_all(&props)?,
            domains: props
                .get_list("domains")
                .into_iter()
                .map(|domain| SmolStr::new(domain.to_ascii_lowercase()))
                .collect(),
            authentication: props.get_flag("authentication.enabled")?.unwrap_or(false),
            plugins: load_plugins(&props)?,
            timer_c: DEFAULT_TIMER_C,
        })
    }

    pub fn is_stateful(&self) -> bool {
        self.mode == ProxyMode::Stateful
    }

    pub fn plugin_enabled(&self, method: &Method) -> bool {
        self.plugins
            .iter()
            .any(|plugin| plugin.enabled && &plugin.method == method)
    }
}

fn load_plugins(props: &Properties) -> Result<Vec<PluginConfig>, ConfigError> {
    let mut plugins = Vec::new();
    for index in 1.. {
        let section = props.subset(&format!("method.plugin.{}", index));
        let Some(method) = section.get("method") else {
            break;
        };
        plugins.push(PluginConfig {
            method: Method::from_token(&method.to_ascii_uppercase()),
            enabled: section.get_flag("enabled")?.unwrap_or(true),
        });
    }
    Ok(plugins)
}
