//! Peer friendship state machine.
//!
//! [`transition`] is a pure function from (state, event) to the next state
//! and the side effects the daemon must carry out. Every applied transition
//! is recorded in the bounded [`FsmLog`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::{MgmtError, Result};

/// Number of transitions kept in the log
pub const FSM_LOG_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FriendState {
    Unknown,
    ProbeSent,
    ProbeReceived,
    InitFriendReq,
    AwaitingPeerAccept,
    Connected,
    RemoveRequested,
    Disconnecting,
}

impl fmt::Display for FriendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FriendState::Unknown => "Establishing Connection",
            FriendState::ProbeSent => "Probe Sent to Peer",
            FriendState::ProbeReceived => "Probe Received from Peer",
            FriendState::InitFriendReq => "Sent Peer Request",
            FriendState::AwaitingPeerAccept => "Accepted Peer Request",
            FriendState::Connected => "Peer in Cluster",
            FriendState::RemoveRequested => "Peer Remove Requested",
            FriendState::Disconnecting => "Peer Detach in Progress",
        };
        f.write_str(s)
    }
}

/// Why a remote refused a probe or handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeRejection {
    AnotherCluster,
    VolumeConflict,
    UnknownPeer,
    AddFailed,
}

impl ProbeRejection {
    /// Message reported for the probed host `host`
    pub fn message(self, host: &str) -> String {
        match self {
            ProbeRejection::AnotherCluster => format!("{} is already part of another cluster", host),
            ProbeRejection::VolumeConflict => format!(
                "Atleast one volume on {} conflicts with existing volumes in the cluster",
                host
            ),
            ProbeRejection::UnknownPeer => format!("{} is not a known peer", host),
            ProbeRejection::AddFailed => format!("Failed to add peer information on {}", host),
        }
    }

    /// Code carried in `op_errno` of a rejecting reply
    pub fn errno(self) -> i32 {
        match self {
            ProbeRejection::AnotherCluster => 1,
            ProbeRejection::VolumeConflict => 2,
            ProbeRejection::UnknownPeer => 3,
            ProbeRejection::AddFailed => 4,
        }
    }

    /// Inverse of [`ProbeRejection::errno`]; unknown codes count as add failures
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            1 => ProbeRejection::AnotherCluster,
            2 => ProbeRejection::VolumeConflict,
            3 => ProbeRejection::UnknownPeer,
            _ => ProbeRejection::AddFailed,
        }
    }
}

/// Outcome reported to the caller of a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeReply {
    Success,
    Localhost,
    AlreadyInList,
    Rejected(ProbeRejection),
}

impl ProbeReply {
    pub fn message(self, host: &str, port: u16) -> String {
        match self {
            ProbeReply::Success => "success".to_string(),
            ProbeReply::Localhost => "Probe on localhost not needed".to_string(),
            ProbeReply::AlreadyInList => format!("Probe on host {} port {} already in peer list", host, port),
            ProbeReply::Rejected(r) => r.message(host),
        }
    }

    /// Probing a localhost or an existing peer is not a failure
    pub fn op_ret(self) -> i32 {
        match self {
            ProbeReply::Rejected(_) => -1,
            _ => 0,
        }
    }
}

/// What came back from (or arrived as) a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The probed node answered with its uuid
    Success { uuid: Uuid },
    /// The answering uuid is already one of our peers
    AlreadyPeer,
    /// The probed node refused
    Rejected(ProbeRejection),
    /// A remote node probed us
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FriendEvent {
    ProbeRequested,
    ProbeReceived(ProbeOutcome),
    FriendAddRequested { conflict: Option<ProbeRejection> },
    FriendAddAccepted,
    FriendAddRejected(ProbeRejection),
    FriendRemoveRequested,
    FriendRemoveAcked,
    FriendRemoveReceived,
    FriendUpdateReceived,
    TransportLost,
}

impl fmt::Display for FriendEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FriendEvent::ProbeRequested => "PROBE",
            FriendEvent::ProbeReceived(ProbeOutcome::Inbound) => "RCVD_PROBE",
            FriendEvent::ProbeReceived(ProbeOutcome::Success { .. }) => "INIT_FRIEND_REQ",
            FriendEvent::ProbeReceived(ProbeOutcome::AlreadyPeer) => "LOCAL_ACC",
            FriendEvent::ProbeReceived(ProbeOutcome::Rejected(_)) => "RCVD_RJT",
            FriendEvent::FriendAddRequested { .. } => "RCVD_FRIEND_REQ",
            FriendEvent::FriendAddAccepted => "RCVD_ACC",
            FriendEvent::FriendAddRejected(_) => "RCVD_RJT",
            FriendEvent::FriendRemoveRequested => "INIT_REMOVE_FRIEND",
            FriendEvent::FriendRemoveAcked => "REMOVE_FRIEND_ACC",
            FriendEvent::FriendRemoveReceived => "RCVD_REMOVE_FRIEND",
            FriendEvent::FriendUpdateReceived => "FRIEND_UPDATE",
            FriendEvent::TransportLost => "TRANSPORT_LOST",
        };
        f.write_str(s)
    }
}

/// Side effects requested by a transition, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FriendAction {
    SendProbe,
    SendFriendAdd,
    /// Merge the remote volume set into ours
    ImportVolumes,
    ReplyAccept,
    ReplyReject(ProbeRejection),
    /// Announce the membership to every befriended peer
    BroadcastFriendUpdate,
    SendFriendRemove,
    AckRemove,
    RemovePeer,
    /// Complete the pending probe call
    NotifyCaller(ProbeReply),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: FriendState,
    pub actions: Vec<FriendAction>,
}

fn to(next: FriendState, actions: Vec<FriendAction>) -> Result<Transition> {
    Ok(Transition { next, actions })
}

/// Computes the transition for `event` in `state`
pub fn transition(state: FriendState, event: &FriendEvent) -> Result<Transition> {
    use FriendAction::*;
    use FriendState as S;

    match (state, *event) {
        (_, FriendEvent::TransportLost) => to(S::Unknown, vec![]),
        (_, FriendEvent::FriendRemoveReceived) => to(S::RemoveRequested, vec![AckRemove, RemovePeer]),

        (S::Unknown, FriendEvent::ProbeRequested) => to(S::ProbeSent, vec![SendProbe]),
        (S::ProbeSent, FriendEvent::ProbeReceived(ProbeOutcome::Success { .. })) => {
            to(S::InitFriendReq, vec![SendFriendAdd])
        }
        (S::ProbeSent, FriendEvent::ProbeReceived(ProbeOutcome::AlreadyPeer)) => {
            to(S::Unknown, vec![RemovePeer, NotifyCaller(ProbeReply::AlreadyInList)])
        }
        (S::ProbeSent, FriendEvent::ProbeReceived(ProbeOutcome::Rejected(r))) => {
            to(S::Unknown, vec![RemovePeer, NotifyCaller(ProbeReply::Rejected(r))])
        }
        (S::Unknown, FriendEvent::ProbeReceived(ProbeOutcome::Inbound)) => to(S::ProbeReceived, vec![ReplyAccept]),

        (S::ProbeReceived, FriendEvent::FriendAddRequested { conflict: None }) => {
            to(S::AwaitingPeerAccept, vec![ImportVolumes, SendFriendAdd, ReplyAccept])
        }
        (S::Unknown | S::ProbeReceived, FriendEvent::FriendAddRequested { conflict: Some(r) }) => {
            to(S::Unknown, vec![ReplyReject(r), RemovePeer])
        }
        // the remote's own handshake may arrive before our request completes
        (S::InitFriendReq | S::Connected, FriendEvent::FriendAddRequested { conflict: None }) => {
            to(state, vec![ImportVolumes, ReplyAccept])
        }
        (S::InitFriendReq | S::Connected, FriendEvent::FriendAddRequested { conflict: Some(r) }) => {
            to(state, vec![ReplyReject(r)])
        }

        (S::InitFriendReq, FriendEvent::FriendAddAccepted) => to(
            S::Connected,
            vec![ImportVolumes, BroadcastFriendUpdate, NotifyCaller(ProbeReply::Success)],
        ),
        (S::AwaitingPeerAccept, FriendEvent::FriendAddAccepted) => to(S::Connected, vec![BroadcastFriendUpdate]),
        (S::InitFriendReq, FriendEvent::FriendAddRejected(r)) => {
            to(S::Unknown, vec![RemovePeer, NotifyCaller(ProbeReply::Rejected(r))])
        }
        (S::AwaitingPeerAccept, FriendEvent::FriendAddRejected(_)) => to(S::Unknown, vec![RemovePeer]),

        (S::Connected, FriendEvent::FriendRemoveRequested) => to(S::Disconnecting, vec![SendFriendRemove]),
        (S::Unknown | S::ProbeSent | S::ProbeReceived, FriendEvent::FriendRemoveRequested) => {
            to(S::Unknown, vec![RemovePeer])
        }
        (S::Disconnecting, FriendEvent::FriendRemoveAcked) => to(S::Unknown, vec![RemovePeer]),

        (S::Connected | S::InitFriendReq | S::AwaitingPeerAccept, FriendEvent::FriendUpdateReceived) => {
            to(state, vec![])
        }

        (state, event) => Err(MgmtError::State(format!(
            "event {} is not valid in state {}",
            event, state
        ))),
    }
}

/// One recorded transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsmLogEntry {
    pub peer: String,
    pub old_state: FriendState,
    pub event: String,
    pub new_state: FriendState,
    pub timestamp: DateTime<Utc>,
}

/// Ring of the most recent friend transitions
#[derive(Debug)]
pub struct FsmLog {
    entries: Mutex<VecDeque<FsmLogEntry>>,
    capacity: usize,
}

impl Default for FsmLog {
    fn default() -> Self {
        Self::with_capacity(FSM_LOG_CAPACITY)
    }
}

impl FsmLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, peer: &str, old_state: FriendState, event: &FriendEvent, new_state: FriendState) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(FsmLogEntry {
            peer: peer.to_string(),
            old_state,
            event: event.to_string(),
            new_state,
            timestamp: Utc::now(),
        });
    }

    /// Oldest first
    pub fn entries(&self) -> Vec<FsmLogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}
