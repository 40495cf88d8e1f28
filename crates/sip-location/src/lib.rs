// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Location service: maps addresses-of-record to registered contacts.
//!
//! Subscribers are provisioned once at startup; bindings are created by the
//! registrar and expire through a periodic sweep.
//!
//! # Example
//! ```
//! use sip_core::{NameAddr, SipUri};
//! use sip_location::{LocationService, MemoryLocationService};
//!
//! let ls = MemoryLocationService::builder("openjsip.net")
//!     .subscriber(SipUri::parse("sip:alice@openjsip.net").unwrap())
//!     .build();
//! let contact = NameAddr::new(SipUri::parse("sip:alice@10.0.0.7:5070").unwrap());
//! ls.update_registration("sip:alice@openjsip.net", &contact, 600, "call-1", 1).unwrap();
//! assert_eq!(ls.get_contact_headers("sip:alice@openjsip.net").unwrap().len(), 1);
//! ```

use std::{collections::BTreeSet, sync::Arc};

use sip_core::{ContactHeader, NameAddr};
use smol_str::SmolStr;
use thiserror::Error;

mod binding;
mod config;
mod memory;
mod sweep;

pub use binding::{contact_identity, Binding};
pub use config::{load_subscribers, LocationServiceConfig, Provisioning};
pub use memory::{LocationStats, MemoryLocationService, MemoryLocationServiceBuilder, UserProfile};
pub use sweep::spawn_expiry_sweep;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LocationError {
    /// No subscriber is provisioned under the key.
    #[error("user not found: {0}")]
    UserNotFound(SmolStr),
    /// The service could not be reached or failed internally.
    #[error("location service unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, LocationError>;

/// Operations the registrar and proxy need from a location service.
///
/// Keys are canonical address-of-record strings as produced by
/// [`sip_core::SipUri::aor_key`].
pub trait LocationService: Send + Sync {
    fn get_username(&self, key: &str) -> Result<SmolStr>;

    /// Returns the provisioned password, or an empty string if none was set.
    fn get_password(&self, key: &str) -> Result<SmolStr>;

    /// Adds a binding, replacing any binding with the same contact address.
    fn update_registration(
        &self,
        key: &str,
        contact: &NameAddr,
        expires: u32,
        call_id: &str,
        cseq: u32,
    ) -> Result<()>;

    fn remove_binding(&self, key: &str, contact: &NameAddr) -> Result<()>;

    fn remove_all_bindings(&self, key: &str) -> Result<()>;

    /// Returns every bound contact with its remaining lifetime as `expires`.
    fn get_contact_headers(&self, key: &str) -> Result<Vec<ContactHeader>>;

    fn get_binding(&self, key: &str, contact: &NameAddr) -> Result<Option<Binding>>;

    fn get_domains(&self) -> Result<BTreeSet<SmolStr>>;

    fn is_domain_served(&self, domain: &str) -> Result<bool> {
        Ok(self.get_domains()?.contains(&SmolStr::new(domain.to_ascii_lowercase())))
    }

    fn default_domain(&self) -> Result<SmolStr>;
}

/// Resolves a location service handle for every call.
///
/// Callers never cache the returned handle so that a restarted remote
/// service is picked up transparently.
pub trait LocationConnector: Send + Sync {
    fn connect(&self) -> Result<Arc<dyn LocationService>>;
}

impl<T: LocationService + 'static> LocationConnector for Arc<T> {
    fn connect(&self) -> Result<Arc<dyn LocationService>> {
        Ok(Arc::clone(self) as Arc<dyn LocationService>)
    }
}
