// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::HashSet;

use proptest::prelude::*;
use sip_core::is_valid_branch;
use sip_transaction::{branch_from_via, generate_branch_id};

proptest! {
    #[test]
    fn generated_branches_carry_magic_cookie(_iteration in 0..100) {
        let branch = generate_branch_id();
        prop_assert!(is_valid_branch(&branch), "branch: {}", branch);
        prop_assert_eq!(branch.len(), 7 + 16);
    }

    #[test]
    fn branch_survives_trailing_params(
        host in "[a-z]{3,10}",
        suffix in "[a-zA-Z0-9]{8,16}",
        rport in 1024u16..65535,
    ) {
        let branch = format!("z9hG4bK{}", suffix);
        let via = format!("SIP/2.0/UDP {};branch={};received=192.0.2.1;rport={}", host, branch, rport);
        prop_assert_eq!(branch_from_via(&via), Some(branch.as_str()));
    }
}

#[test]
fn via_without_branch() {
    assert_eq!(branch_from_via("SIP/2.0/UDP host.example.com:5060"), None);
}

#[test]
fn generated_branches_do_not_repeat() {
    let mut seen = HashSet::new();
    for _ in 0..1000 {
        assert!(seen.insert(generate_branch_id()));
    }
}
