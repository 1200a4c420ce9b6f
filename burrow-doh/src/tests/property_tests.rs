//! Property-based tests for the address set and EDNS padding.

use crate::ipmap::IpSet;
use crate::padding::{add_edns_padding, PADDING_BLOCK_SIZE};
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use hickory_proto::serialize::binary::BinDecodable;
use proptest::prelude::*;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

fn domain_strategy() -> impl Strategy<Value = String> {
    (
        "[a-z]{1,12}",
        prop::collection::vec("[a-z]{1,8}", 0..3),
        prop_oneof!["com", "org", "net", "io", "dev"],
    )
        .prop_map(|(prefix, parts, tld)| {
            let mut domain = prefix;
            for part in parts {
                domain.push('.');
                domain.push_str(&part);
            }
            domain.push('.');
            domain.push_str(&tld);
            domain.push('.');
            domain
        })
}

fn ipv4_strategy() -> impl Strategy<Value = IpAddr> {
    (0u8..=255, 0u8..=255, 0u8..=255, 0u8..=255)
        .prop_map(|(a, b, c, d)| IpAddr::V4(Ipv4Addr::new(a, b, c, d)))
}

fn query_bytes(domain: &str, id: u16) -> Vec<u8> {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(
        Name::from_str(domain).expect("generated domain is valid"),
        RecordType::A,
    ));
    msg.to_vec().expect("query packs")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// For any query, the padded form is a multiple of the block size and
    /// still parses to the same question and ID.
    #[test]
    fn padding_reaches_block_boundary(domain in domain_strategy(), id in any::<u16>()) {
        let raw = query_bytes(&domain, id);
        let padded = add_edns_padding(&raw).unwrap();
        prop_assert_eq!(padded.len() % PADDING_BLOCK_SIZE, 0);

        let msg = Message::from_bytes(&padded).unwrap();
        prop_assert_eq!(msg.id(), id);
        prop_assert_eq!(msg.queries().len(), 1);
        prop_assert_eq!(msg.queries()[0].name().to_string(), domain);
    }

    /// Padding an already padded message changes nothing.
    #[test]
    fn padding_is_idempotent(domain in domain_strategy(), id in any::<u16>()) {
        let once = add_edns_padding(&query_bytes(&domain, id)).unwrap();
        let twice = add_edns_padding(&once).unwrap();
        prop_assert_eq!(once, twice);
    }

    /// confirm() always leaves the confirmed address inside the set, and
    /// disconfirm() clears only an exact match.
    #[test]
    fn confirm_disconfirm_invariants(
        seed in prop::collection::vec(ipv4_strategy(), 0..8),
        confirmed in ipv4_strategy(),
        other in ipv4_strategy(),
    ) {
        let set = IpSet::new();
        for ip in &seed {
            set.add_addr(*ip);
        }
        set.confirm(confirmed);
        prop_assert_eq!(set.confirmed(), Some(confirmed));
        prop_assert!(set.all().contains(&confirmed));

        set.disconfirm(other);
        if other == confirmed {
            prop_assert_eq!(set.confirmed(), None);
        } else {
            prop_assert_eq!(set.confirmed(), Some(confirmed));
        }
        // Disconfirm never removes addresses.
        prop_assert!(set.all().contains(&confirmed));
    }

    /// The set is additive and ignores duplicates.
    #[test]
    fn set_is_additive(ips in prop::collection::vec(ipv4_strategy(), 0..16)) {
        let set = IpSet::new();
        for ip in &ips {
            set.add_addr(*ip);
            set.add_addr(*ip);
        }
        let mut unique = ips.clone();
        unique.dedup();
        unique.sort();
        unique.dedup();
        prop_assert_eq!(set.all().len(), unique.len());
    }
}
