// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::{sync::Arc, time::Duration};

use sip_core::{Method, NameAddr, Request, SipUri};
use sip_location::{LocationConnector, LocationService, MemoryLocationService};
use sip_proxy::{Proxy, ProxyConfig, ProxyMode};
use sip_testkit::{
    build_invite, response_to, ManualScheduler, MockClientTransaction, MockProvider,
    RequestBuilder,
};
use sip_transaction::{
    ClientTransaction, InterfaceConfig, RequestEvent, ResponseEvent, ServerTransaction,
    SipListener, SipProvider, TimerScheduler, TransactionRef, TransactionState,
};

const BOB: &str = "sip:bob@openjsip.net";

struct Harness {
    proxy: Proxy,
    provider: Arc<MockProvider>,
    scheduler: Arc<ManualScheduler>,
}

impl Harness {
    fn new(bindings: &[&str]) -> Self {
        let ls = Arc::new(
            MemoryLocationService::builder("openjsip.net")
                .subscriber(SipUri::parse(BOB).unwrap())
                .build(),
        );
        for (i, contact) in bindings.iter().enumerate() {
            let contact = NameAddr::new(SipUri::parse(contact).unwrap());
            ls.update_registration(BOB, &contact, 600, "reg-1", i as u32 + 1)
                .unwrap();
        }
        let connector: Arc<dyn LocationConnector> = Arc::new(ls);
        let scheduler = Arc::new(ManualScheduler::new());
        let config = ProxyConfig {
            mode: ProxyMode::Stateful,
            interfaces: vec![InterfaceConfig::new("10.0.0.1", 5060)],
            domains: vec!["openjsip.net".into()],
            ..ProxyConfig::default()
        };
        let proxy = Proxy::new(
            config,
            connector,
            Arc::clone(&scheduler) as Arc<dyn TimerScheduler>,
        )
        .unwrap();
        Self {
            proxy,
            provider: MockProvider::new("10.0.0.1", 5060),
            scheduler,
        }
    }

    fn request(&self, request: Request) {
        self.proxy.process_request(RequestEvent {
            provider: Arc::clone(&self.provider) as Arc<dyn SipProvider>,
            request,
            server_transaction: None,
        });
    }

    fn respond(&self, client: &Arc<MockClientTransaction>, code: u16) {
        self.proxy.process_response(ResponseEvent {
            provider: Arc::clone(&self.provider) as Arc<dyn SipProvider>,
            response: response_to(client.request(), code),
            client_transaction: Some(Arc::clone(client) as Arc<dyn ClientTransaction>),
        });
    }

    fn invite(&self) {
        self.request(build_invite(BOB, "z9hG4bKup1", "call-1"));
    }

    fn upstream_codes(&self) -> Vec<u16> {
        self.provider.server_transactions()[0]
            .responses()
            .iter()
            .map(|r| r.code())
            .collect()
    }

    fn cancels(&self) -> Vec<Request> {
        self.provider
            .client_transactions()
            .iter()
            .filter(|tx| tx.request().method() == &Method::Cancel)
            .map(|tx| tx.request().clone())
            .collect()
    }
}

#[test]
fn invite_is_forked_to_every_binding() {
    let h = Harness::new(&["sip:bob@10.0.0.7:5070", "sip:bob@10.0.0.8", "sip:bob@10.0.0.9"]);
    h.invite();

    let clients = h.provider.client_transactions();
    assert_eq!(clients.len(), 3);
    let targets: Vec<String> = clients.iter().map(|c| c.request().uri().to_string()).collect();
    assert_eq!(
        targets,
        vec!["sip:bob@10.0.0.7:5070", "sip:bob@10.0.0.8", "sip:bob@10.0.0.9"]
    );
    for client in &clients {
        assert_eq!(client.sends(), 1);
        let via = client.request().headers().get("Via").unwrap();
        assert!(via.starts_with("SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK"));
        assert_eq!(client.request().headers().count("Via"), 2);
    }
    // one Timer C per INVITE branch
    assert_eq!(h.scheduler.pending(), 3);
    assert_eq!(h.proxy.stats().client_transactions, 3);
    assert_eq!(h.proxy.stats().forwarding_contexts, 1);
}

#[test]
fn best_response_waits_for_all_branches() {
    let h = Harness::new(&["sip:bob@10.0.0.7", "sip:bob@10.0.0.8", "sip:bob@10.0.0.9"]);
    h.invite();
    let clients = h.provider.client_transactions();

    h.respond(&clients[0], 486);
    h.respond(&clients[1], 404);
    assert!(h.upstream_codes().is_empty());
    h.respond(&clients[2], 408);

    assert_eq!(h.upstream_codes(), vec![486]);
    let forwarded = h.provider.server_transactions()[0].last_response().unwrap();
    assert_eq!(forwarded.headers().count("Via"), 1);
    // finals cancel their Timer C
    assert_eq!(h.scheduler.pending(), 0);
}

#[test]
fn success_is_forwarded_at_once_and_later_finals_dropped() {
    let h = Harness::new(&["sip:bob@10.0.0.7", "sip:bob@10.0.0.8", "sip:bob@10.0.0.9"]);
    h.invite();
    let clients = h.provider.client_transactions();
    clients[0].set_state(TransactionState::Proceeding);
    clients[2].set_state(TransactionState::Proceeding);

    h.respond(&clients[1], 200);
    assert_eq!(h.upstream_codes(), vec![200]);
    let cancels = h.cancels();
    assert_eq!(cancels.len(), 2);
    assert_eq!(cancels[0].uri().to_string(), "sip:bob@10.0.0.7");
    assert_eq!(cancels[1].uri().to_string(), "sip:bob@10.0.0.9");

    h.respond(&clients[0], 603);
    h.respond(&clients[2], 486);
    assert_eq!(h.upstream_codes(), vec![200]);
    assert!(h.provider.sent_responses().is_empty());
}

#[test]
fn global_failure_cancels_the_rest_and_wins() {
    let h = Harness::new(&["sip:bob@10.0.0.7", "sip:bob@10.0.0.8", "sip:bob@10.0.0.9"]);
    h.invite();
    let clients = h.provider.client_transactions();
    clients[1].set_state(TransactionState::Proceeding);
    clients[2].set_state(TransactionState::Proceeding);

    h.respond(&clients[0], 603);
    assert!(h.upstream_codes().is_empty());
    assert_eq!(h.cancels().len(), 2);

    h.respond(&clients[1], 487);
    h.respond(&clients[2], 487);
    assert_eq!(h.upstream_codes(), vec![603]);
}

#[test]
fn provisional_responses_go_upstream_except_trying() {
    let h = Harness::new(&["sip:bob@10.0.0.7"]);
    h.invite();
    let client = h.provider.last_client().unwrap();

    h.respond(&client, 100);
    h.respond(&client, 180);
    h.respond(&client, 183);
    assert_eq!(h.upstream_codes(), vec![180, 183]);
}

#[test]
fn cancel_is_answered_and_propagated() {
    let h = Harness::new(&["sip:bob@10.0.0.7", "sip:bob@10.0.0.8"]);
    h.invite();
    let clients = h.provider.client_transactions();
    clients[0].set_state(TransactionState::Proceeding);
    h.respond(&clients[0], 180);

    let cancel = RequestBuilder::new(Method::Cancel, BOB)
        .branch("z9hG4bKup1")
        .call_id("call-1")
        .build();
    h.request(cancel);

    let servers = h.provider.server_transactions();
    assert_eq!(servers.len(), 2);
    assert_eq!(servers[1].request().method(), &Method::Cancel);
    assert_eq!(servers[1].last_response().unwrap().code(), 200);

    // the silent branch is cancelled once it sends a provisional
    let cancels = h.cancels();
    assert_eq!(cancels.len(), 1);
    assert_eq!(cancels[0].uri(), clients[0].request().uri());
    assert_eq!(
        cancels[0].headers().get("Via"),
        clients[0].request().headers().get("Via")
    );

    clients[1].set_state(TransactionState::Proceeding);
    h.respond(&clients[1], 180);
    let cancels = h.cancels();
    assert_eq!(cancels.len(), 2);
    assert_eq!(cancels[1].uri(), clients[1].request().uri());

    h.respond(&clients[0], 487);
    h.respond(&clients[1], 487);
    assert_eq!(h.upstream_codes(), vec![180, 180, 487]);
}

#[test]
fn cancel_for_unknown_invite_is_forwarded_statelessly() {
    let h = Harness::new(&["sip:bob@10.0.0.7"]);
    let cancel = RequestBuilder::new(Method::Cancel, BOB)
        .branch("z9hG4bKlost")
        .call_id("call-9")
        .build();
    h.request(cancel);

    let sent = h.provider.sent_requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].method(), &Method::Cancel);
    assert_eq!(sent[0].uri().to_string(), "sip:bob@10.0.0.7");
    assert!(h.provider.client_transactions().is_empty());
}

#[test]
fn looped_request_is_rejected() {
    let h = Harness::new(&["sip:bob@10.0.0.7"]);
    let looped = RequestBuilder::new(Method::Invite, BOB)
        .header("Via", "SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKloop")
        .build();
    h.request(looped);

    let responses = h.provider.sent_responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].code(), 482);
    assert!(h.provider.client_transactions().is_empty());
}

#[test]
fn retransmission_is_absorbed() {
    let h = Harness::new(&["sip:bob@10.0.0.7"]);
    h.invite();
    h.invite();
    assert_eq!(h.provider.client_transactions().len(), 1);
    assert_eq!(h.proxy.stats().requests_processed, 2);
}

#[test]
fn timer_c_cancels_a_ringing_branch() {
    let h = Harness::new(&["sip:bob@10.0.0.7"]);
    h.invite();
    let client = h.provider.last_client().unwrap();
    client.set_state(TransactionState::Proceeding);

    h.scheduler.advance(Duration::from_secs(100));
    h.respond(&client, 180);
    h.scheduler.advance(Duration::from_secs(180));
    assert!(h.cancels().is_empty());

    h.scheduler.advance(Duration::from_secs(1));
    let cancels = h.cancels();
    assert_eq!(cancels.len(), 1);
    assert_eq!(cancels[0].uri(), client.request().uri());
    assert_eq!(h.scheduler.elapsed(), Duration::from_secs(281));
}

#[test]
fn timer_c_leaves_a_silent_branch_alone() {
    let h = Harness::new(&["sip:bob@10.0.0.7"]);
    h.invite();

    h.scheduler.advance(Duration::from_secs(181));
    assert!(h.cancels().is_empty());
    assert_eq!(h.scheduler.pending(), 0);
}

#[test]
fn timeouts_produce_request_timeout() {
    let h = Harness::new(&["sip:bob@10.0.0.7", "sip:bob@10.0.0.8"]);
    h.invite();
    let clients = h.provider.client_transactions();

    for client in &clients {
        h.proxy
            .process_timeout(TransactionRef::Client(Arc::clone(client) as Arc<dyn ClientTransaction>));
    }
    assert_eq!(h.upstream_codes(), vec![408]);
    assert_eq!(h.proxy.stats().timeouts, 2);
}

#[test]
fn timed_out_branch_does_not_mask_a_collected_final() {
    let h = Harness::new(&["sip:bob@10.0.0.7", "sip:bob@10.0.0.8"]);
    h.invite();
    let clients = h.provider.client_transactions();

    h.proxy.process_timeout(TransactionRef::Client(
        Arc::clone(&clients[0]) as Arc<dyn ClientTransaction>,
    ));
    assert!(h.upstream_codes().is_empty());
    h.respond(&clients[1], 486);
    assert_eq!(h.upstream_codes(), vec![486]);
    assert_eq!(h.proxy.stats().timeouts, 1);
}

#[test]
fn terminated_transactions_release_the_context() {
    let h = Harness::new(&["sip:bob@10.0.0.7"]);
    h.invite();
    let client = h.provider.last_client().unwrap();
    h.respond(&client, 486);
    assert_eq!(h.upstream_codes(), vec![486]);

    let server = Arc::clone(&h.provider.server_transactions()[0]) as Arc<dyn ServerTransaction>;
    h.proxy.process_transaction_terminated(TransactionRef::Client(
        Arc::clone(&client) as Arc<dyn ClientTransaction>,
    ));
    assert_eq!(h.proxy.stats().forwarding_contexts, 1);
    h.proxy
        .process_transaction_terminated(TransactionRef::Server(server));
    let stats = h.proxy.stats();
    assert_eq!(stats.forwarding_contexts, 0);
    assert_eq!(stats.client_transactions, 0);
    assert_eq!(stats.server_transactions, 0);
}
