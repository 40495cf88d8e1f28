// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Server-side SIP Digest authentication (RFC 2617 as profiled by RFC 3261 §22).
//!
//! Nonces are stateless: they are generated from the current time and a
//! random number and never tracked, so their lifetime is not enforced.
//!
//! # Examples
//!
//! ```
//! # use sip_auth::*;
//! let auth = DigestServerAuth::new("openjsip.net");
//! let challenge = auth.challenge_value();
//! assert!(challenge.starts_with("Digest realm=\"openjsip.net\""));
//! assert!(challenge.ends_with("algorithm=MD5"));
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use sha2::{Digest, Sha256, Sha512};
use sip_core::{build_response, MessageError, Method, Request, Response};
use sip_parse::{parse_authorization_header, AuthorizationHeader};
use smol_str::SmolStr;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("at least one digest algorithm must be enabled")]
    NoAlgorithms,
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

/// Digest algorithm per RFC 7616.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha512 => "SHA-512",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MD5" => Some(DigestAlgorithm::Md5),
            "SHA-256" => Some(DigestAlgorithm::Sha256),
            "SHA-512" => Some(DigestAlgorithm::Sha512),
            _ => None,
        }
    }

    /// Lowercase hex digest of `data`.
    pub fn hash(&self, data: &[u8]) -> String {
        match self {
            DigestAlgorithm::Md5 => format!("{:x}", md5::compute(data)),
            DigestAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
            DigestAlgorithm::Sha512 => hex::encode(Sha512::digest(data)),
        }
    }
}

impl std::str::FromStr for DigestAlgorithm {
    type Err = AuthError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| AuthError::UnsupportedAlgorithm(s.to_owned()))
    }
}

/// Which side of the authentication exchange a check is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    /// Registrar or UAS: `Authorization` / `WWW-Authenticate` / 401.
    Www,
    /// Proxy: `Proxy-Authorization` / `Proxy-Authenticate` / 407.
    Proxy,
}

impl ChallengeKind {
    pub fn credentials_header(&self) -> &'static str {
        match self {
            ChallengeKind::Www => "Authorization",
            ChallengeKind::Proxy => "Proxy-Authorization",
        }
    }

    pub fn challenge_header(&self) -> &'static str {
        match self {
            ChallengeKind::Www => "WWW-Authenticate",
            ChallengeKind::Proxy => "Proxy-Authenticate",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            ChallengeKind::Www => 401,
            ChallengeKind::Proxy => 407,
        }
    }
}

/// Digest verifier shared by the registrar and the proxy.
#[derive(Debug, Clone)]
pub struct DigestServerAuth {
    default_realm: SmolStr,
    // First entry is the preferred algorithm.
    algorithms: Vec<DigestAlgorithm>,
}

impl DigestServerAuth {
    /// Creates a verifier for `default_realm` that accepts MD5 only.
    pub fn new(default_realm: impl Into<SmolStr>) -> Self {
        Self {
            default_realm: default_realm.into(),
            algorithms: vec![DigestAlgorithm::Md5],
        }
    }

    /// Creates a verifier accepting the given algorithms, the first preferred.
    pub fn with_algorithms(
        default_realm: impl Into<SmolStr>,
        algorithms: Vec<DigestAlgorithm>,
    ) -> Result<Self, AuthError> {
        if algorithms.is_empty() {
            return Err(AuthError::NoAlgorithms);
        }
        Ok(Self {
            default_realm: default_realm.into(),
            algorithms,
        })
    }

    pub fn default_realm(&self) -> &str {
        &self.default_realm
    }

    pub fn preferred_algorithm(&self) -> DigestAlgorithm {
        // `with_algorithms` refuses an empty list
        self.algorithms
            .first()
            .copied()
            .unwrap_or(DigestAlgorithm::Md5)
    }

    /// Generates a fresh nonce: hex(H(now_ms ∥ random_i64)).
    pub fn generate_nonce(&self) -> String {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let pad: i64 = rand::thread_rng().gen();
        let seed = format!("{}{}", now_ms, pad);
        self.preferred_algorithm().hash(seed.as_bytes())
    }

    /// Builds a `WWW-Authenticate` / `Proxy-Authenticate` value with a new nonce.
    pub fn challenge_value(&self) -> String {
        format!(
            "Digest realm=\"{}\", nonce=\"{}\", opaque=\"\", stale=FALSE, algorithm={}",
            self.default_realm,
            self.generate_nonce(),
            self.preferred_algorithm().as_str()
        )
    }

    /// Builds the 401 or 407 response carrying a fresh challenge.
    pub fn challenge(&self, request: &Request, kind: ChallengeKind) -> Result<Response, MessageError> {
        let mut response = build_response(request, kind.status_code())?;
        response
            .headers_mut()
            .push(kind.challenge_header(), self.challenge_value());
        info!(
            realm = %self.default_realm,
            proxy = kind == ChallengeKind::Proxy,
            "issuing digest challenge"
        );
        Ok(response)
    }

    /// Verifies digest credentials against the provisioned user and password.
    ///
    /// The credentials must name `user`, carry a `uri` and use one of the
    /// enabled algorithms (the preferred one when absent). A missing realm
    /// falls back to the default realm.
    pub fn authenticate(
        &self,
        method: &Method,
        credentials: &AuthorizationHeader,
        user: &str,
        password: &str,
    ) -> bool {
        let Some(username) = credentials.param("username") else {
            return false;
        };
        // user agents may send the whole address-of-record as the username
        let username = username
            .split_once('@')
            .map_or(username.as_str(), |(name, _)| name);
        if username != user {
            debug!(username = %username, "digest username mismatch");
            return false;
        }

        let realm = credentials
            .param("realm")
            .map(|r| r.as_str())
            .unwrap_or(self.default_realm.as_str());

        let Some(uri) = credentials.param("uri") else {
            return false;
        };

        let algorithm = match credentials.param("algorithm") {
            Some(name) => match DigestAlgorithm::parse(name) {
                Some(alg) if self.algorithms.contains(&alg) => alg,
                _ => return false,
            },
            None => self.preferred_algorithm(),
        };

        let Some(response) = credentials.param("response") else {
            return false;
        };
        let nonce = credentials.param("nonce").map(|n| n.as_str()).unwrap_or("");
        let cnonce = credentials.param("cnonce");

        let expected = compute_response(
            algorithm,
            username,
            realm,
            password,
            method,
            uri,
            nonce,
            cnonce.map(|c| c.as_str()),
        );
        constant_time_eq(expected.as_bytes(), response.as_bytes())
    }
}

/// Extracts the digest credentials of the given kind from a request.
pub fn credentials(request: &Request, kind: ChallengeKind) -> Option<AuthorizationHeader> {
    request
        .headers()
        .get(kind.credentials_header())
        .and_then(|value| parse_authorization_header(value))
        .filter(|auth| auth.scheme.eq_ignore_ascii_case("Digest"))
}

/// Computes the expected `response` value.
///
/// `HA1 = H(user:realm:password)`, `HA2 = H(METHOD:uri)`,
/// `KD = HA1:nonce[:cnonce]:HA2`, result `H(KD)`.
#[allow(clippy::too_many_arguments)]
pub fn compute_response(
    algorithm: DigestAlgorithm,
    username: &str,
    realm: &str,
    password: &str,
    method: &Method,
    uri: &str,
    nonce: &str,
    cnonce: Option<&str>,
) -> String {
    let ha1 = algorithm.hash(format!("{}:{}:{}", username, realm, password).as_bytes());
    let ha2 = algorithm.hash(format!("{}:{}", method.as_str().to_ascii_uppercase(), uri).as_bytes());
    let kd = match cnonce {
        Some(cnonce) => format!("{}:{}:{}:{}", ha1, nonce, cnonce, ha2),
        None => format!("{}:{}:{}", ha1, nonce, ha2),
    };
    algorithm.hash(kd.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}
