// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Core SIP types, messages, headers, and URIs.
//!
//! - **Messages**: [`Request`], [`Response`], [`SipMessage`]
//! - **URIs**: [`SipUri`] with canonical address-of-record keys, [`Uri`] for any scheme
//! - **Headers**: [`Headers`] container plus typed Via, name-addr and Contact values
//! - **Responses**: [`build_response`] with RFC 3261 reason phrases
//!
//! # Examples
//!
//! ```
//! # use sip_core::*;
//! let uri = SipUri::parse("sip:Alice:pw@Example.com:5070;transport=tcp").unwrap();
//! assert_eq!(uri.aor_key(), "sip:Alice@example.com");
//! ```

pub mod contact;
pub mod headers;
pub mod method;
pub mod msg;
pub mod name_addr;
pub mod properties;
pub mod response;
pub mod uri;
pub mod via;

pub use contact::ContactHeader;
pub use headers::{Header, Headers};
pub use method::Method;
pub use msg::{MessageError, Request, RequestLine, Response, SipMessage, StatusLine, SIP_VERSION};
pub use name_addr::NameAddr;
pub use properties::{ConfigError, Properties};
pub use response::{build_response, ensure_to_tag, generate_tag, reason_phrase};
pub use uri::{SipUri, Uri, DEFAULT_SIP_PORT};
pub use via::{is_valid_branch, ViaHeader, MAGIC_COOKIE};
