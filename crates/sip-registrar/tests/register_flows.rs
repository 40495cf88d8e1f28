// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::Arc;

use sip_core::{Method, Response, SipUri};
use sip_location::{LocationConnector, LocationService, MemoryLocationService};
use sip_observe::RemoteService;
use sip_parse::parse_authorization_header;
use sip_registrar::{Registrar, RegistrarConfig};
use sip_testkit::{build_register, MockProvider, RequestBuilder};
use sip_transaction::{InterfaceConfig, RequestEvent, SipListener, SipProvider};

const ALICE: &str = "sip:alice@openjsip.net";

fn setup(config: RegistrarConfig) -> (Registrar, Arc<MemoryLocationService>) {
    let ls = Arc::new(
        MemoryLocationService::builder("openjsip.net")
            .subscriber(SipUri::parse("sip:alice:s3cret@openjsip.net").unwrap())
            .subscriber(SipUri::parse("sip:bob@openjsip.net").unwrap())
            .build(),
    );
    let connector: Arc<dyn LocationConnector> = Arc::new(Arc::clone(&ls));
    (Registrar::new(config, connector).unwrap(), ls)
}

fn contacts(response: &Response) -> Vec<String> {
    response
        .headers()
        .get_all("Contact")
        .map(|c| c.to_string())
        .collect()
}

#[test]
fn requested_lifetimes_are_clamped() {
    let (registrar, ls) = setup(RegistrarConfig::default());

    let short = build_register(ALICE, &["<sip:alice@10.0.0.7>;expires=10"], "c1", 1);
    let response = registrar.handle_register(&short, None).unwrap();
    assert_eq!(response.code(), 200);
    assert_eq!(contacts(&response), vec!["<sip:alice@10.0.0.7>;expires=60"]);

    let long = build_register(ALICE, &["<sip:alice@10.0.0.7>;expires=100000"], "c1", 2);
    let response = registrar.handle_register(&long, None).unwrap();
    assert_eq!(contacts(&response), vec!["<sip:alice@10.0.0.7>;expires=3600"]);

    let remove = build_register(ALICE, &["<sip:alice@10.0.0.7>;expires=0"], "c1", 3);
    let response = registrar.handle_register(&remove, None).unwrap();
    assert_eq!(response.code(), 200);
    assert!(contacts(&response).is_empty());
    assert!(ls.get_contact_headers(ALICE).unwrap().is_empty());

    let stats = registrar.stats();
    assert_eq!(stats.binding_updates, 2);
    assert_eq!(stats.binding_cancels, 1);
    assert_eq!(stats.responses_ok, 3);
}

#[test]
fn expires_header_applies_to_contacts_without_param() {
    let (registrar, _) = setup(RegistrarConfig::default());
    let request = RequestBuilder::new(Method::Register, "sip:openjsip.net")
        .header("To", format!("<{}>", ALICE))
        .header("Expires", "120")
        .add_header("Contact", "<sip:alice@10.0.0.7>, <sip:alice@10.0.0.8>;expires=300")
        .build();
    let response = registrar.handle_register(&request, None).unwrap();
    assert_eq!(
        contacts(&response),
        vec![
            "<sip:alice@10.0.0.7>;expires=120",
            "<sip:alice@10.0.0.8>;expires=300"
        ]
    );
}

#[test]
fn stale_cseq_is_rejected_per_call_id() {
    let (registrar, ls) = setup(RegistrarConfig::default());
    let contact = "<sip:alice@10.0.0.7>";

    let first = build_register(ALICE, &[contact], "call-a", 5);
    assert_eq!(registrar.handle_register(&first, None).unwrap().code(), 200);

    let replay = build_register(ALICE, &[contact], "call-a", 5);
    assert_eq!(registrar.handle_register(&replay, None).unwrap().code(), 400);

    let newer = build_register(ALICE, &[contact], "call-a", 6);
    assert_eq!(registrar.handle_register(&newer, None).unwrap().code(), 200);

    // a new Call-ID restarts the sequence
    let other_call = build_register(ALICE, &[contact], "call-b", 1);
    assert_eq!(registrar.handle_register(&other_call, None).unwrap().code(), 200);

    let bindings = ls.bindings(Some(ALICE)).unwrap();
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0].call_id, "call-b");
    assert_eq!(bindings[0].cseq, 1);
}

#[test]
fn stale_contact_leaves_other_bindings_untouched() {
    let (registrar, ls) = setup(RegistrarConfig::default());
    let seed = build_register(ALICE, &["<sip:alice@10.0.0.7>"], "call-a", 5);
    registrar.handle_register(&seed, None).unwrap();

    let mixed = build_register(
        ALICE,
        &["<sip:alice@10.0.0.8>", "<sip:alice@10.0.0.7>"],
        "call-a",
        4,
    );
    assert_eq!(registrar.handle_register(&mixed, None).unwrap().code(), 400);
    assert_eq!(ls.get_contact_headers(ALICE).unwrap().len(), 1);
}

#[test]
fn wildcard_rules() {
    let (registrar, ls) = setup(RegistrarConfig::default());
    for (i, host) in ["10.0.0.7", "10.0.0.8"].iter().enumerate() {
        let contact = format!("<sip:alice@{}>", host);
        let request = build_register(ALICE, &[contact.as_str()], "seed", i as u32 + 1);
        registrar.handle_register(&request, None).unwrap();
    }
    assert_eq!(ls.get_contact_headers(ALICE).unwrap().len(), 2);

    let no_expires = build_register(ALICE, &["*"], "w", 1);
    assert_eq!(registrar.handle_register(&no_expires, None).unwrap().code(), 400);

    let with_other = RequestBuilder::new(Method::Register, "sip:openjsip.net")
        .header("To", format!("<{}>", ALICE))
        .header("Expires", "0")
        .add_header("Contact", "*")
        .add_header("Contact", "<sip:alice@10.0.0.9>")
        .build();
    assert_eq!(registrar.handle_register(&with_other, None).unwrap().code(), 400);

    let nonzero = RequestBuilder::new(Method::Register, "sip:openjsip.net")
        .header("To", format!("<{}>", ALICE))
        .header("Expires", "30")
        .add_header("Contact", "*")
        .build();
    assert_eq!(registrar.handle_register(&nonzero, None).unwrap().code(), 400);
    assert_eq!(ls.get_contact_headers(ALICE).unwrap().len(), 2);

    let clear = RequestBuilder::new(Method::Register, "sip:openjsip.net")
        .header("To", format!("<{}>", ALICE))
        .header("Expires", "0")
        .add_header("Contact", "*")
        .build();
    let response = registrar.handle_register(&clear, None).unwrap();
    assert_eq!(response.code(), 200);
    assert!(contacts(&response).is_empty());
    assert_eq!(registrar.stats().full_cancels, 1);
}

#[test]
fn digest_challenge_then_success() {
    let (registrar, _) = setup(RegistrarConfig {
        authentication: true,
        ..RegistrarConfig::default()
    });

    let request = build_register(ALICE, &["<sip:alice@10.0.0.7>"], "auth-1", 1);
    let challenge = registrar.handle_register(&request, None).unwrap();
    assert_eq!(challenge.code(), 401);
    let www = parse_authorization_header(challenge.headers().get("WWW-Authenticate").unwrap())
        .unwrap();
    assert_eq!(www.param("realm").unwrap(), "openjsip.net");
    let nonce = www.param("nonce").unwrap().to_string();
    assert_eq!(registrar.stats().auth_failures, 1);

    let ha1 = format!("{:x}", md5::compute("alice:openjsip.net:s3cret"));
    let ha2 = format!("{:x}", md5::compute("REGISTER:sip:openjsip.net"));
    let digest = format!("{:x}", md5::compute(format!("{}:{}:{}", ha1, nonce, ha2)));
    let authorization = format!(
        "Digest username=\"alice\", realm=\"openjsip.net\", nonce=\"{}\", \
         uri=\"sip:openjsip.net\", response=\"{}\", algorithm=MD5",
        nonce, digest
    );

    let retry = RequestBuilder::new(Method::Register, "sip:openjsip.net")
        .header("To", format!("<{}>", ALICE))
        .header("Call-ID", "auth-1")
        .header("CSeq", "2 REGISTER")
        .header("Authorization", authorization.clone())
        .add_header("Contact", "<sip:alice@10.0.0.7>")
        .build();
    assert_eq!(registrar.handle_register(&retry, None).unwrap().code(), 200);

    // the same credentials do not authorize another subscriber
    let bob = RequestBuilder::new(Method::Register, "sip:openjsip.net")
        .header("To", "<sip:bob@openjsip.net>")
        .header("Authorization", authorization)
        .build();
    assert_eq!(registrar.handle_register(&bob, None).unwrap().code(), 401);
}

#[test]
fn digest_username_may_carry_the_domain() {
    let (registrar, ls) = setup(RegistrarConfig {
        authentication: true,
        ..RegistrarConfig::default()
    });

    let ha1 = format!("{:x}", md5::compute("alice:openjsip.net:s3cret"));
    let ha2 = format!("{:x}", md5::compute("REGISTER:sip:openjsip.net"));
    let digest = format!("{:x}", md5::compute(format!("{}:n-1:{}", ha1, ha2)));
    let request = RequestBuilder::new(Method::Register, "sip:openjsip.net")
        .header("To", format!("<{}>", ALICE))
        .header("Call-ID", "auth-2")
        .header(
            "Authorization",
            format!(
                "Digest username=\"alice@openjsip.net\", realm=\"openjsip.net\", nonce=\"n-1\", \
                 uri=\"sip:openjsip.net\", response=\"{}\"",
                digest
            ),
        )
        .add_header("Contact", "<sip:alice@10.0.0.7>")
        .build();

    assert_eq!(registrar.handle_register(&request, None).unwrap().code(), 200);
    assert_eq!(ls.get_contact_headers(ALICE).unwrap().len(), 1);
    assert_eq!(registrar.stats().auth_failures, 0);
}

#[test]
fn listener_answers_through_server_transaction() {
    let (registrar, ls) = setup(RegistrarConfig {
        interfaces: vec![InterfaceConfig::new("10.0.0.1", 5060)],
        ..RegistrarConfig::default()
    });
    let provider = MockProvider::new("10.0.0.1", 5060);
    let request = RequestBuilder::new(Method::Register, "sip:10.0.0.1")
        .branch("z9hG4bKreg1")
        .header("To", "<sip:alice@10.0.0.1>")
        .add_header("Contact", "<sip:alice@10.0.0.7>")
        .build();

    for _ in 0..2 {
        registrar.process_request(RequestEvent {
            provider: Arc::clone(&provider) as Arc<dyn SipProvider>,
            request: request.clone(),
            server_transaction: None,
        });
    }
    let options = RequestBuilder::new(Method::Options, "sip:10.0.0.1")
        .branch("z9hG4bKopt")
        .build();
    registrar.process_request(RequestEvent {
        provider: Arc::clone(&provider) as Arc<dyn SipProvider>,
        request: options,
        server_transaction: None,
    });

    let codes: Vec<u16> = provider.all_responses().iter().map(|r| r.code()).collect();
    assert_eq!(codes, vec![200]);
    assert_eq!(ls.get_contact_headers(ALICE).unwrap().len(), 1);
    assert_eq!(registrar.exec_cmd("get", &["numIncReqs"]).as_deref(), Some("1"));
    assert_eq!(registrar.exec_cmd("get", &["numUpdates"]).as_deref(), Some("1"));
    assert!(registrar.exec_cmd("get", &["bogus"]).is_none());
    assert!(registrar.exec_cmd("help", &[]).unwrap().contains("numNotFound"));
}
