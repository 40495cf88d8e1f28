// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use proptest::prelude::*;
use sip_core::SipUri;

proptest! {
    /// Rendering a parsed URI and parsing it again yields the same URI.
    #[test]
    fn uri_display_reparses(
        sips in prop::bool::ANY,
        user in proptest::option::of("[a-z0-9]{1,8}"),
        host in "[a-z0-9][a-z0-9\\-]{0,10}",
        port in proptest::option::of(1024u16..65535),
    ) {
        let scheme = if sips { "sips" } else { "sip" };
        let user_part = user.as_ref().map(|u| format!("{}@", u)).unwrap_or_default();
        let port_part = port.map(|p| format!(":{}", p)).unwrap_or_default();
        let input = format!("{}:{}{}{}", scheme, user_part, host, port_part);

        let parsed = SipUri::parse(&input);
        prop_assert!(parsed.is_some(), "Failed to parse: {}", input);
        let uri = parsed.unwrap();
        prop_assert_eq!(uri.sips, sips);
        prop_assert_eq!(uri.user.as_deref(), user.as_deref());
        prop_assert_eq!(uri.host.as_str(), host.as_str());
        prop_assert_eq!(uri.port, port);
        prop_assert_eq!(SipUri::parse(&uri.to_string()), Some(uri));
    }

    /// The directory key ignores case in the host, the port, the password
    /// and every parameter.
    #[test]
    fn aor_key_ignores_decorations(
        user in "[a-z0-9]{1,8}",
        host in "[a-z]{2,8}\\.(com|net|org)",
        port in 1024u16..65535,
        transport in prop::sample::select(vec!["udp", "tcp", "tls"]),
        lr in prop::bool::ANY,
    ) {
        let lr_part = if lr { ";lr" } else { "" };
        let decorated = format!(
            "sip:{}:secret@{}:{};transport={}{}",
            user,
            host.to_ascii_uppercase(),
            port,
            transport,
            lr_part
        );
        let plain = format!("sip:{}@{}", user, host);

        let decorated = SipUri::parse(&decorated).expect("parse");
        let plain = SipUri::parse(&plain).expect("parse");
        let key = decorated.aor_key();
        prop_assert_eq!(&key, &plain.aor_key());
        prop_assert_eq!(key.to_string(), format!("sip:{}@{}", user, host));
    }

    #[test]
    fn uri_host_formats(host_type in 0u8..3, octet in 1u8..255) {
        let host = match host_type {
            0 => format!("example{}.com", octet),
            1 => format!("192.168.1.{}", octet),
            _ => format!("[2001:db8::{}]", octet),
        };
        let input = format!("sip:{}", host);
        prop_assert!(SipUri::parse(&input).is_some(), "Failed to parse: {}", input);
    }

    #[test]
    fn uri_scheme_case(
        scheme in prop::sample::select(vec!["sip", "SIP", "Sip", "sIp"]),
        host in "[a-z]{3,8}",
    ) {
        let uri = SipUri::parse(&format!("{}:{}", scheme, host));
        prop_assert!(uri.is_some());
        prop_assert_eq!(uri.unwrap().scheme(), "sip");
    }
}

#[test]
fn uri_reject_invalid() {
    let invalid = [
        "",
        "example.com",
        "http://example.com",
        "sip:",
        "sip:user@",
        "sip:example.com:99999",
    ];
    for input in invalid {
        assert!(SipUri::parse(input).is_none(), "Should reject: {}", input);
    }
}

#[test]
fn uri_with_multiple_params() {
    let uri = SipUri::parse("sip:alice@example.com;transport=tcp;lr;maddr=192.168.1.1")
        .expect("parse");

    assert_eq!(uri.user.as_deref(), Some("alice"));
    assert_eq!(uri.transport(), Some("tcp"));
    assert_eq!(uri.maddr(), Some("192.168.1.1"));
    assert!(uri.is_loose_route());
    assert_eq!(uri.without_params().to_string(), "sip:alice@example.com");
}
