//! Method handlers that answer requests instead of forwarding them.

use std::sync::Arc;

use sip_core::{Method, Request, Response};
use sip_registrar::Registrar;
use thiserror::Error;

use crate::routing::Locality;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin backend unavailable: {0}")]
    Unavailable(String),
    #[error("plugin failed: {0}")]
    Failed(String),
}

/// Handler registered for one request method.
///
/// `Ok(Some(response))` answers the request, `Ok(None)` lets the proxy
/// continue with target determination and an error is answered with 500.
pub trait MethodPlugin: Send + Sync {
    fn method(&self) -> Method;

    fn process_request(&self, request: &Request) -> Result<Option<Response>, PluginError>;
}

/// Hands REGISTER requests to a co-located [`Registrar`].
pub struct RegisterPlugin {
    registrar: Arc<Registrar>,
    locality: Locality,
}

impl RegisterPlugin {
    pub fn new(registrar: Arc<Registrar>, locality: Locality) -> Self {
        Self {
            registrar,
            locality,
        }
    }
}

impl MethodPlugin for RegisterPlugin {
    fn method(&self) -> Method {
        Method::Register
    }

    fn process_request(&self, request: &Request) -> Result<Option<Response>, PluginError> {
        // a REGISTER sent to the proxy's address registers in the default domain
        let overridden = request
            .sip_uri()
            .filter(|uri| self.locality.is_local_host(&uri.host))
            .map(|_| self.locality.default_domain().to_owned());
        self.registrar
            .handle_register(request, overridden.as_deref())
            .map(Some)
            .map_err(|e| PluginError::Failed(e.to_string()))
    }
}
