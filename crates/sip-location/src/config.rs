use std::{collections::BTreeSet, path::PathBuf, time::Duration};

use sip_core::{ConfigError, Properties, Uri};
use smol_str::SmolStr;
use tracing::{debug, info};

use crate::UserProfile;

const DEFAULT_DOMAIN: &str = "openjsip.net";
const DEFAULT_MAX_USERS: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationServiceConfig {
    pub default_domain: SmolStr,
    pub db_file: Option<PathBuf>,
    /// Interval of the binding expiry sweep.
    pub update_period: Duration,
}

impl Default for LocationServiceConfig {
    fn default() -> Self {
        Self {
            default_domain: SmolStr::new(DEFAULT_DOMAIN),
            db_file: None,
            update_period: Duration::from_secs(5),
        }
    }
}

impl LocationServiceConfig {
    /// Reads the `location.service.*` keys.
    pub fn from_properties(props: &Properties) -> Result<Self, ConfigError> {
        let props = props.subset("location.service");
        let defaults = Self::default();
        let update_period = props
            .get_parsed::<u64>("update-period")?
            .map(|secs| Duration::from_secs(secs.max(1)))
            .unwrap_or(defaults.update_period);

        Ok(Self {
            default_domain: props
                .get("default.domain")
                .map(|domain| SmolStr::new(domain.to_ascii_lowercase()))
                .unwrap_or(defaults.default_domain),
            db_file: props.get("db.file").map(PathBuf::from),
            update_period,
        })
    }

    /// Loads the subscriber database named by `db_file`; no file means no subscribers.
    pub fn provision(&self) -> Result<Provisioning, ConfigError> {
        let db = match &self.db_file {
            Some(path) => Properties::load(path)?,
            None => Properties::default(),
        };
        Ok(load_subscribers(&db, &self.default_domain))
    }
}

/// Subscribers read from the user database.
#[derive(Debug, Default)]
pub struct Provisioning {
    pub profiles: Vec<UserProfile>,
    pub domains: BTreeSet<SmolStr>,
    /// Entries that were not SIP URIs or failed to parse.
    pub skipped: usize,
}

/// Parses `user.N = sip:user[:password]@host` entries for N in `1..=user.max`.
///
/// Entries without a host part are completed with `default_domain`.
pub fn load_subscribers(db: &Properties, default_domain: &str) -> Provisioning {
    let max_users = db
        .get("user.max")
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(DEFAULT_MAX_USERS)
        .max(DEFAULT_MAX_USERS);

    let mut provisioning = Provisioning::default();
    for index in 1..=max_users {
        let Some(entry) = db.get(&format!("user.{}", index)) else {
            continue;
        };
        let mut entry = entry.trim().to_owned();
        if !entry.contains('@') {
            entry.push('@');
            entry.push_str(default_domain);
        }

        let aor = match Uri::parse(&entry) {
            Some(Uri::Sip(uri)) => uri,
            _ => {
                debug!(entry = %entry, "skipping non-SIP subscriber entry");
                provisioning.skipped += 1;
                continue;
            }
        };
        provisioning.domains.insert(aor.host.clone());
        provisioning.profiles.push(UserProfile::new(aor));
    }

    for domain in &provisioning.domains {
        let count = provisioning
            .profiles
            .iter()
            .filter(|profile| &profile.aor().host == domain)
            .count();
        info!(domain = %domain, count, "domain records loaded");
    }
    if provisioning.skipped > 0 {
        info!(skipped = provisioning.skipped, "skipped subscriber records");
    }
    provisioning
}
