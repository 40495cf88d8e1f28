use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;
use serde::Serialize;
use sip_core::{ConfigError, ContactHeader, NameAddr, SipUri};
use sip_observe::{Gauge, RemoteService};
use smol_str::SmolStr;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{Binding, LocationError, LocationService, LocationServiceConfig, Provisioning, Result};

/// A provisioned subscriber and its current bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    aor: SipUri,
    bindings: Vec<Binding>,
}

impl UserProfile {
    pub fn new(aor: SipUri) -> Self {
        Self {
            aor,
            bindings: Vec::new(),
        }
    }

    pub fn aor(&self) -> &SipUri {
        &self.aor
    }

    pub fn key(&self) -> SmolStr {
        self.aor.aor_key()
    }

    pub fn login(&self) -> SmolStr {
        self.aor.user.clone().unwrap_or_default()
    }

    pub fn password(&self) -> &str {
        self.aor.password.as_deref().unwrap_or("")
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn binding(&self, contact: &NameAddr) -> Option<&Binding> {
        self.bindings.iter().find(|binding| binding.matches(contact))
    }

    fn replace(&mut self, binding: Binding) {
        self.bindings.retain(|existing| !existing.matches(&binding.contact));
        self.bindings.push(binding);
    }

    fn remove(&mut self, contact: &NameAddr) -> Option<Binding> {
        let index = self
            .bindings
            .iter()
            .position(|binding| binding.matches(contact))?;
        Some(self.bindings.remove(index))
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocationStats {
    pub num_subscribers: i64,
    pub num_bindings: i64,
}

struct Registry {
    profiles: HashMap<SmolStr, UserProfile>,
    last_sweep: Instant,
}

impl Registry {
    fn profile(&self, key: &str) -> Result<&UserProfile> {
        self.profiles
            .get(key)
            .ok_or_else(|| LocationError::UserNotFound(SmolStr::new(key)))
    }

    fn profile_mut(&mut self, key: &str) -> Result<&mut UserProfile> {
        self.profiles
            .get_mut(key)
            .ok_or_else(|| LocationError::UserNotFound(SmolStr::new(key)))
    }
}

/// In-process location service.
///
/// One reader-writer lock guards every profile and binding. Mutators and
/// the expiry sweep take it exclusively, so a sweep tick never observes a
/// half-applied registration.
pub struct MemoryLocationService {
    default_domain: SmolStr,
    domains: BTreeSet<SmolStr>,
    registry: RwLock<Registry>,
    num_subscribers: Gauge,
    num_bindings: Gauge,
}

impl MemoryLocationService {
    pub fn builder(default_domain: &str) -> MemoryLocationServiceBuilder {
        MemoryLocationServiceBuilder {
            default_domain: SmolStr::new(default_domain.to_ascii_lowercase()),
            domains: BTreeSet::new(),
            profiles: Vec::new(),
        }
    }

    /// Builds the service from configuration, loading the subscriber database.
    pub fn from_config(config: &LocationServiceConfig) -> std::result::Result<Self, ConfigError> {
        let provisioning = config.provision()?;
        Ok(Self::builder(&config.default_domain)
            .provisioning(provisioning)
            .build())
    }

    /// Subtracts the whole seconds elapsed since the previous tick from every
    /// binding and drops those that reach zero. Returns the number removed.
    pub fn expire(&self, now: Instant) -> usize {
        let mut registry = self.registry.write();
        let elapsed = now.saturating_duration_since(registry.last_sweep);
        let dt = elapsed.as_secs();
        // keep the sub-second remainder for the next tick
        registry.last_sweep += std::time::Duration::from_secs(dt);
        let dt = dt as i64;

        let mut removed = 0;
        let mut bindings = 0;
        for profile in registry.profiles.values_mut() {
            for binding in profile.bindings.iter_mut() {
                binding.expires -= dt;
            }
            profile.bindings.retain(|binding| {
                let alive = binding.expires > 0;
                if !alive {
                    debug!(aor = %binding.key, binding = %binding, "binding expired");
                    removed += 1;
                }
                alive
            });
            bindings += profile.bindings.len();
        }
        self.num_subscribers.set(registry.profiles.len() as i64);
        self.num_bindings.set(bindings as i64);
        removed
    }

    /// Sorted keys of every provisioned subscriber.
    pub fn subscribers(&self) -> Vec<SmolStr> {
        let registry = self.registry.read();
        let mut keys: Vec<_> = registry.profiles.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Snapshot of the bindings of one subscriber, or of all subscribers.
    pub fn bindings(&self, key: Option<&str>) -> Result<Vec<Binding>> {
        let registry = self.registry.read();
        match key {
            Some(key) => Ok(registry.profile(key)?.bindings.clone()),
            None => {
                let mut keys: Vec<_> = registry.profiles.keys().collect();
                keys.sort();
                Ok(keys
                    .into_iter()
                    .filter_map(|key| registry.profiles.get(key))
                    .flat_map(|profile| profile.bindings.iter().cloned())
                    .collect())
            }
        }
    }

    /// Gauges as of the last sweep tick.
    pub fn stats(&self) -> LocationStats {
        LocationStats {
            num_subscribers: self.num_subscribers.get(),
            num_bindings: self.num_bindings.get(),
        }
    }

    fn show_bindings(&self, key: Option<&str>) -> String {
        match (key, self.bindings(key)) {
            (_, Err(e)) => e.to_string(),
            (Some(key), Ok(bindings)) => {
                let mut out = render(&bindings);
                out.push_str(&format!("Subscriber {} has {} bindings.", key, bindings.len()));
                out
            }
            (None, Ok(bindings)) => {
                let mut out = render(&bindings);
                out.push_str(&format!("Database contains {} bindings.", bindings.len()));
                out
            }
        }
    }
}

fn render(bindings: &[Binding]) -> String {
    bindings
        .iter()
        .map(|binding| format!("{}\n", binding))
        .collect()
}

const HELP: &str = "\
help                   - Show help.
show subscribers       - Show all subscribers.
show bindings          - Show all existing bindings.
show bindings <AOR>    - Show all bindings of specified subscriber.
get numSubscribers     - Get the total number of subscribers.
get numBindings        - Get the total number of existing bindings.
";

impl RemoteService for MemoryLocationService {
    fn exec_cmd(&self, cmd: &str, params: &[&str]) -> Option<String> {
        let first = params.first().copied().unwrap_or("");
        if cmd.eq_ignore_ascii_case("show") && first.eq_ignore_ascii_case("bindings") {
            return Some(self.show_bindings(params.get(1).copied()));
        }
        if cmd.eq_ignore_ascii_case("show") && first.eq_ignore_ascii_case("subscribers") {
            let subscribers = self.subscribers();
            let mut out: String = subscribers.iter().map(|key| format!("{}\n", key)).collect();
            out.push_str(&format!(
                "Database contains {} subscribers.",
                subscribers.len()
            ));
            return Some(out);
        }
        if cmd.eq_ignore_ascii_case("get") && !params.is_empty() {
            let stats = self.stats();
            return if first.eq_ignore_ascii_case("numSubscribers") {
                Some(stats.num_subscribers.to_string())
            } else if first.eq_ignore_ascii_case("numBindings") {
                Some(stats.num_bindings.to_string())
            } else {
                None
            };
        }
        Some(HELP.to_owned())
    }
}

impl LocationService for MemoryLocationService {
    fn get_username(&self, key: &str) -> Result<SmolStr> {
        Ok(self.registry.read().profile(key)?.login())
    }

    fn get_password(&self, key: &str) -> Result<SmolStr> {
        Ok(SmolStr::new(self.registry.read().profile(key)?.password()))
    }

    fn update_registration(
        &self,
        key: &str,
        contact: &NameAddr,
        expires: u32,
        call_id: &str,
        cseq: u32,
    ) -> Result<()> {
        let mut registry = self.registry.write();
        let profile = registry.profile_mut(key)?;
        let binding = Binding::new(key, contact, call_id, cseq, i64::from(expires));
        debug!(aor = %key, binding = %binding, "binding updated");
        profile.replace(binding);
        Ok(())
    }

    fn remove_binding(&self, key: &str, contact: &NameAddr) -> Result<()> {
        let mut registry = self.registry.write();
        if let Some(removed) = registry.profile_mut(key)?.remove(contact) {
            debug!(aor = %key, binding = %removed, "binding removed");
        }
        Ok(())
    }

    fn remove_all_bindings(&self, key: &str) -> Result<()> {
        let mut registry = self.registry.write();
        registry.profile_mut(key)?.bindings.clear();
        debug!(aor = %key, "all bindings removed");
        Ok(())
    }

    fn get_contact_headers(&self, key: &str) -> Result<Vec<ContactHeader>> {
        let registry = self.registry.read();
        Ok(registry
            .profile(key)?
            .bindings
            .iter()
            .map(Binding::contact_header)
            .collect())
    }

    fn get_binding(&self, key: &str, contact: &NameAddr) -> Result<Option<Binding>> {
        let registry = self.registry.read();
        Ok(registry.profile(key)?.binding(contact).cloned())
    }

    fn get_domains(&self) -> Result<BTreeSet<SmolStr>> {
        Ok(self.domains.clone())
    }

    fn is_domain_served(&self, domain: &str) -> Result<bool> {
        Ok(self.domains.contains(domain.to_ascii_lowercase().as_str()))
    }

    fn default_domain(&self) -> Result<SmolStr> {
        Ok(self.default_domain.clone())
    }
}

pub struct MemoryLocationServiceBuilder {
    default_domain: SmolStr,
    domains: BTreeSet<SmolStr>,
    profiles: Vec<UserProfile>,
}

impl MemoryLocationServiceBuilder {
    /// Adds a subscriber; its host becomes a served domain.
    pub fn subscriber(mut self, aor: SipUri) -> Self {
        self.domains.insert(aor.host.clone());
        self.profiles.push(UserProfile::new(aor));
        self
    }

    pub fn domain(mut self, domain: &str) -> Self {
        self.domains.insert(SmolStr::new(domain.to_ascii_lowercase()));
        self
    }

    pub fn provisioning(mut self, provisioning: Provisioning) -> Self {
        self.domains.extend(provisioning.domains);
        self.profiles.extend(provisioning.profiles);
        self
    }

    pub fn build(self) -> MemoryLocationService {
        let profiles: HashMap<_, _> = self
            .profiles
            .into_iter()
            .map(|profile| (profile.key(), profile))
            .collect();
        info!(
            default_domain = %self.default_domain,
            subscribers = profiles.len(),
            "location service ready"
        );
        let num_subscribers = Gauge::default();
        num_subscribers.set(profiles.len() as i64);
        MemoryLocationService {
            default_domain: self.default_domain,
            domains: self.domains,
            registry: RwLock::new(Registry {
                profiles,
                last_sweep: Instant::now(),
            }),
            num_subscribers,
            num_bindings: Gauge::default(),
        }
    }
}
