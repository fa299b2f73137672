//! Property-based tests for response merging and wire codes.

use brickfs_mgmt::friend_sm::{transition, FriendEvent, FriendState};
use brickfs_mgmt::merge::{add_brick_profile, rebase_profile, split_index};
use brickfs_mgmt::op_ctx::ResponseDict;
use brickfs_mgmt::services::RebalanceStatus;
use proptest::prelude::*;

/// Profile payload of one node, one brick per counter
fn node_profile(host: &str, counters: &[u32]) -> ResponseDict {
    let mut rsp = ResponseDict::new();
    for (i, hits) in counters.iter().enumerate() {
        let mut payload = ResponseDict::new();
        payload.insert("read-count".into(), hits.to_string());
        add_brick_profile(&mut rsp, &format!("{}:/b{}", host, i), &payload);
    }
    rsp
}

fn any_state() -> impl Strategy<Value = FriendState> {
    prop_oneof![
        Just(FriendState::Unknown),
        Just(FriendState::ProbeSent),
        Just(FriendState::ProbeReceived),
        Just(FriendState::InitFriendReq),
        Just(FriendState::AwaitingPeerAccept),
        Just(FriendState::Connected),
        Just(FriendState::RemoveRequested),
        Just(FriendState::Disconnecting),
    ]
}

fn any_event() -> impl Strategy<Value = FriendEvent> {
    prop_oneof![
        Just(FriendEvent::ProbeRequested),
        Just(FriendEvent::FriendAddAccepted),
        Just(FriendEvent::FriendRemoveRequested),
        Just(FriendEvent::FriendRemoveReceived),
        Just(FriendEvent::FriendRemoveAcked),
        Just(FriendEvent::FriendUpdateReceived),
        Just(FriendEvent::TransportLost),
    ]
}

proptest! {
    #[test]
    fn prop_rebase_keeps_every_brick(
        local in proptest::collection::vec(0u32..1000, 0..6),
        peers in proptest::collection::vec(proptest::collection::vec(0u32..1000, 0..6), 0..4),
    ) {
        let mut merged = node_profile("node1", &local);
        let mut expected: Vec<(String, String)> = local
            .iter()
            .enumerate()
            .map(|(i, h)| (format!("node1:/b{}", i), h.to_string()))
            .collect();
        for (n, counters) in peers.iter().enumerate() {
            let host = format!("node{}", n + 2);
            rebase_profile(&mut merged, &node_profile(&host, counters));
            expected.extend(counters.iter().enumerate().map(|(i, h)| (format!("{}:/b{}", host, i), h.to_string())));
        }

        let count: usize = merged.get("count").map(|c| c.parse().unwrap()).unwrap_or(0);
        prop_assert_eq!(count, expected.len());
        for (idx, (brick, hits)) in expected.iter().enumerate() {
            prop_assert_eq!(&merged[&format!("{}-brick", idx + 1)], brick);
            prop_assert_eq!(&merged[&format!("{}-read-count", idx + 1)], hits);
        }
    }

    #[test]
    fn prop_split_index_inverts_format(n in 1usize..100_000, suffix in "-[a-z]{1,12}") {
        let key = format!("{}{}", n, suffix);
        prop_assert_eq!(split_index(&key), Some((n, suffix.as_str())));
    }

    #[test]
    fn prop_split_index_rejects_unnumbered(key in "[a-z][a-z0-9-]{0,12}") {
        prop_assert_eq!(split_index(&key), None);
    }

    #[test]
    fn prop_rebalance_code_mapping_is_total(code in any::<i64>()) {
        let status = RebalanceStatus::from_code(code);
        match status.code() {
            Some(back) => prop_assert_eq!(back, code),
            None => prop_assert!(!(0..=7).contains(&code)),
        }
    }

    #[test]
    fn prop_friend_transitions_never_panic(state in any_state(), event in any_event()) {
        // every pair either transitions or is refused with an error
        let _ = transition(state, &event);
    }
}
