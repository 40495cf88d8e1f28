use std::{sync::Arc, time::Duration};

use sip_core::{NameAddr, SipUri};
use sip_location::{spawn_expiry_sweep, LocationService, MemoryLocationService};

const ALICE: &str = "sip:alice@openjsip.net";

fn contact(uri: &str) -> NameAddr {
    NameAddr::new(SipUri::parse(uri).unwrap())
}

async fn settle() {
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn bindings_disappear_after_their_lifetime() {
    let ls = Arc::new(
        MemoryLocationService::builder("openjsip.net")
            .subscriber(SipUri::parse("sip:alice@openjsip.net").unwrap())
            .build(),
    );
    ls.update_registration(ALICE, &contact("sip:alice@10.0.0.7"), 12, "c1", 1)
        .unwrap();
    ls.update_registration(ALICE, &contact("sip:alice@10.0.0.8"), 600, "c1", 2)
        .unwrap();

    let sweep = spawn_expiry_sweep(Arc::clone(&ls), Duration::from_secs(5));

    tokio::time::sleep(Duration::from_secs(11)).await;
    settle().await;
    assert_eq!(ls.get_contact_headers(ALICE).unwrap().len(), 2);
    assert_eq!(ls.stats().num_bindings, 2);

    tokio::time::sleep(Duration::from_secs(5)).await;
    settle().await;
    let contacts = ls.get_contact_headers(ALICE).unwrap();
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].expires(), Some(585));
    assert_eq!(ls.stats().num_bindings, 1);

    sweep.abort();
}

#[tokio::test(start_paused = true)]
async fn refreshed_binding_survives_sweep() {
    let ls = Arc::new(
        MemoryLocationService::builder("openjsip.net")
            .subscriber(SipUri::parse("sip:alice@openjsip.net").unwrap())
            .build(),
    );
    ls.update_registration(ALICE, &contact("sip:alice@10.0.0.7"), 8, "c1", 1)
        .unwrap();
    let sweep = spawn_expiry_sweep(Arc::clone(&ls), Duration::from_secs(5));

    tokio::time::sleep(Duration::from_secs(6)).await;
    settle().await;
    ls.update_registration(ALICE, &contact("sip:alice@10.0.0.7;transport=udp"), 60, "c1", 2)
        .unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    settle().await;
    let binding = ls
        .get_binding(ALICE, &contact("sip:alice@10.0.0.7"))
        .unwrap()
        .unwrap();
    assert_eq!(binding.cseq, 2);
    assert_eq!(binding.expires, 50);

    sweep.abort();
}
