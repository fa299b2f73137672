//! Coordinator-side state machine of one cluster operation.
//!
//! The machine performs no I/O. Each [`OpStateMachine::step`] consumes one
//! event produced by an RPC callback (or by local staging/commit) and
//! returns the actions the driver must carry out next. A phase completes
//! only when every responder it waits on has answered; rejections are
//! recorded (first one wins) and turn the remaining phases into an unlock
//! of whatever was locked.
//!
//! Brick sub-operations run on every node in one phase: the coordinator
//! issues its own brick RPCs while each peer runs its local ones, and the
//! outcome is decided only once all of them have answered.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::merge;
use crate::op_ctx::{OpReply, OperationContext, OperationKind, ResponseDict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpPhase {
    Default,
    LockSent,
    StageSent,
    BrickOpSent,
    LocalCommit,
    CommitSent,
    UnlockSent,
    Success,
    Aborted,
}

impl OpPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, OpPhase::Success | OpPhase::Aborted)
    }
}

/// Who an event came from
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Responder {
    Local,
    Peer(Uuid),
    /// Brick identified by `host:path`
    Brick(String),
}

impl fmt::Display for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Responder::Local => f.write_str("local"),
            Responder::Peer(u) => write!(f, "{}", u),
            Responder::Brick(b) => f.write_str(b),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpEvent {
    Start,
    RcvdAcc {
        from: Responder,
        payload: ResponseDict,
    },
    RcvdRjt {
        from: Responder,
        op_ret: i32,
        op_errno: i32,
        op_errstr: Option<String>,
    },
    /// Brick sub-operations issued, identified by brick
    BricksDispatched(Vec<String>),
    None,
}

impl OpEvent {
    pub fn accept(from: Responder) -> Self {
        OpEvent::RcvdAcc {
            from,
            payload: ResponseDict::new(),
        }
    }

    pub fn reject(from: Responder, op_errno: i32, op_errstr: Option<String>) -> Self {
        OpEvent::RcvdRjt {
            from,
            op_ret: -1,
            op_errno,
            op_errstr,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpAction {
    SendLock(Vec<Uuid>),
    RunLocalStage,
    SendStage(Vec<Uuid>),
    RunBrickOps,
    SendBrickOp(Vec<Uuid>),
    RunLocalCommit,
    SendCommit(Vec<Uuid>),
    SendUnlock(Vec<Uuid>),
    ReleaseLocalLock,
    Reply(OpReply),
}

/// A participant of the operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTarget {
    pub uuid: Uuid,
    pub hostname: String,
}

#[derive(Debug)]
pub struct OpStateMachine {
    ctx: OperationContext,
    local_hostname: String,
    peers: Vec<PeerTarget>,
    phase: OpPhase,
    pending: BTreeSet<Responder>,
    locked: Vec<Uuid>,
    bricks_dispatched: bool,
}

impl OpStateMachine {
    /// The local cluster lock must already be held by the caller
    pub fn new(ctx: OperationContext, local_hostname: impl Into<String>, peers: Vec<PeerTarget>) -> Self {
        Self {
            ctx,
            local_hostname: local_hostname.into(),
            peers,
            phase: OpPhase::Default,
            pending: BTreeSet::new(),
            locked: Vec::new(),
            bricks_dispatched: false,
        }
    }

    pub fn phase(&self) -> OpPhase {
        self.phase
    }

    pub fn context(&self) -> &OperationContext {
        &self.ctx
    }

    pub fn into_context(self) -> OperationContext {
        self.ctx
    }

    /// Responders the current phase still waits on
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn step(&mut self, event: OpEvent) -> Vec<OpAction> {
        match event {
            OpEvent::Start => {
                if self.phase != OpPhase::Default {
                    warn!(op = %self.ctx.kind, phase = ?self.phase, "start event ignored");
                    return Vec::new();
                }
                self.start()
            }
            OpEvent::BricksDispatched(bricks) => {
                if self.phase != OpPhase::BrickOpSent || self.bricks_dispatched {
                    warn!(op = %self.ctx.kind, phase = ?self.phase, "unexpected brick dispatch");
                    return Vec::new();
                }
                self.bricks_dispatched = true;
                self.pending.extend(bricks.into_iter().map(Responder::Brick));
                self.advance()
            }
            OpEvent::RcvdAcc { from, payload } => {
                if !self.pending.remove(&from) {
                    warn!(op = %self.ctx.kind, from = %from, phase = ?self.phase, "late or unexpected accept ignored");
                    return Vec::new();
                }
                self.on_accept(from, payload);
                self.advance()
            }
            OpEvent::RcvdRjt {
                from,
                op_ret,
                op_errno,
                op_errstr,
            } => {
                if !self.pending.remove(&from) {
                    warn!(op = %self.ctx.kind, from = %from, phase = ?self.phase, "late or unexpected reject ignored");
                    return Vec::new();
                }
                self.on_reject(from, op_ret, op_errno, op_errstr);
                self.advance()
            }
            OpEvent::None => self.advance(),
        }
    }

    fn set_phase(&mut self, phase: OpPhase) {
        debug!(op = %self.ctx.kind, from = ?self.phase, to = ?phase, "op phase change");
        self.phase = phase;
    }

    fn peer_ids(&self) -> Vec<Uuid> {
        self.peers.iter().map(|p| p.uuid).collect()
    }

    fn hostname_of(&self, from: &Responder) -> String {
        match from {
            Responder::Local => self.local_hostname.clone(),
            Responder::Peer(uuid) => self
                .peers
                .iter()
                .find(|p| p.uuid == *uuid)
                .map(|p| p.hostname.clone())
                .unwrap_or_else(|| uuid.to_string()),
            Responder::Brick(id) => id.clone(),
        }
    }

    fn start(&mut self) -> Vec<OpAction> {
        if self.peers.is_empty() {
            return self.begin_stage();
        }
        self.set_phase(OpPhase::LockSent);
        let ids = self.peer_ids();
        self.pending = ids.iter().copied().map(Responder::Peer).collect();
        vec![OpAction::SendLock(ids)]
    }

    fn begin_stage(&mut self) -> Vec<OpAction> {
        self.set_phase(OpPhase::StageSent);
        let ids = self.peer_ids();
        self.pending = std::iter::once(Responder::Local)
            .chain(ids.iter().copied().map(Responder::Peer))
            .collect();
        let mut actions = vec![OpAction::RunLocalStage];
        if !ids.is_empty() {
            actions.push(OpAction::SendStage(ids));
        }
        actions
    }

    fn begin_unlock(&mut self) -> Vec<OpAction> {
        self.set_phase(OpPhase::UnlockSent);
        if self.locked.is_empty() {
            return self.finish();
        }
        let targets = self.locked.clone();
        self.pending = targets.iter().copied().map(Responder::Peer).collect();
        vec![OpAction::SendUnlock(targets)]
    }

    fn finish(&mut self) -> Vec<OpAction> {
        let phase = if self.ctx.failed() {
            OpPhase::Aborted
        } else {
            OpPhase::Success
        };
        self.set_phase(phase);
        vec![OpAction::ReleaseLocalLock, OpAction::Reply(self.ctx.reply())]
    }

    fn on_accept(&mut self, from: Responder, payload: ResponseDict) {
        if let Responder::Peer(uuid) = from {
            self.ctx.peer_results.push((uuid, 0));
        }
        match self.phase {
            OpPhase::LockSent => {
                if let Responder::Peer(uuid) = from {
                    self.locked.push(uuid);
                }
            }
            OpPhase::BrickOpSent if self.ctx.kind == OperationKind::Profile => match &from {
                Responder::Brick(id) => merge::add_brick_profile(&mut self.ctx.response, id, &payload),
                Responder::Peer(_) if !payload.is_empty() => merge::rebase_profile(&mut self.ctx.response, &payload),
                _ => {}
            },
            OpPhase::LocalCommit | OpPhase::CommitSent => {
                merge::merge_commit_response(self.ctx.kind, &mut self.ctx.response, &payload);
            }
            _ => {}
        }
    }

    fn on_reject(&mut self, from: Responder, op_ret: i32, op_errno: i32, op_errstr: Option<String>) {
        let host = self.hostname_of(&from);
        if let Responder::Peer(uuid) = from {
            self.ctx.peer_results.push((uuid, op_ret));
        }
        if self.phase == OpPhase::UnlockSent {
            warn!(op = %self.ctx.kind, peer = %host, "unlock failed");
            return;
        }
        let errstr = op_errstr
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("Operation failed on {}", host));
        warn!(op = %self.ctx.kind, phase = ?self.phase, peer = %host, error = %errstr, "rejected");
        if !self.ctx.record_failure(op_ret, op_errno, errstr) {
            debug!(op = %self.ctx.kind, peer = %host, "subsequent rejection not reported");
        }
    }

    fn advance(&mut self) -> Vec<OpAction> {
        if !self.pending.is_empty() {
            return Vec::new();
        }
        match self.phase {
            OpPhase::LockSent => {
                if self.ctx.failed() {
                    self.begin_unlock()
                } else {
                    self.begin_stage()
                }
            }
            OpPhase::StageSent => {
                if self.ctx.failed() {
                    self.begin_unlock()
                } else if self.ctx.request.needs_brick_op() {
                    self.begin_brick_ops()
                } else {
                    self.begin_local_commit()
                }
            }
            OpPhase::BrickOpSent => {
                if !self.bricks_dispatched {
                    Vec::new()
                } else if self.ctx.failed() {
                    self.begin_unlock()
                } else {
                    self.begin_local_commit()
                }
            }
            OpPhase::LocalCommit => {
                if self.ctx.failed() || self.peers.is_empty() {
                    self.begin_unlock()
                } else {
                    self.set_phase(OpPhase::CommitSent);
                    let ids = self.peer_ids();
                    self.pending = ids.iter().copied().map(Responder::Peer).collect();
                    vec![OpAction::SendCommit(ids)]
                }
            }
            OpPhase::CommitSent => self.begin_unlock(),
            OpPhase::UnlockSent => self.finish(),
            OpPhase::Default | OpPhase::Success | OpPhase::Aborted => Vec::new(),
        }
    }

    fn begin_brick_ops(&mut self) -> Vec<OpAction> {
        self.set_phase(OpPhase::BrickOpSent);
        let ids = self.peer_ids();
        self.pending = ids.iter().copied().map(Responder::Peer).collect();
        let mut actions = vec![OpAction::RunBrickOps];
        if !ids.is_empty() {
            actions.push(OpAction::SendBrickOp(ids));
        }
        actions
    }

    fn begin_local_commit(&mut self) -> Vec<OpAction> {
        self.set_phase(OpPhase::LocalCommit);
        self.pending = BTreeSet::from([Responder::Local]);
        vec![OpAction::RunLocalCommit]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::op_ctx::{OpRequest, ProfileCommand};

    fn peers(n: usize) -> Vec<PeerTarget> {
        (0..n)
            .map(|i| PeerTarget {
                uuid: Uuid::new_v4(),
                hostname: format!("node{}", i + 2),
            })
            .collect()
    }

    fn machine(request: OpRequest, peers: Vec<PeerTarget>) -> OpStateMachine {
        OpStateMachine::new(OperationContext::new(request), "node1", peers)
    }

    fn delete() -> OpRequest {
        OpRequest::DeleteVolume { name: "v".into() }
    }

    fn acc_all(sm: &mut OpStateMachine, peers: &[PeerTarget]) -> Vec<OpAction> {
        let mut last = Vec::new();
        for p in peers {
            last = sm.step(OpEvent::accept(Responder::Peer(p.uuid)));
        }
        last
    }

    fn has_commit(actions: &[OpAction]) -> bool {
        actions
            .iter()
            .any(|a| matches!(a, OpAction::RunLocalCommit | OpAction::SendCommit(_)))
    }

    #[test]
    fn test_happy_path() {
        let ps = peers(2);
        let mut sm = machine(delete(), ps.clone());
        assert!(matches!(sm.step(OpEvent::Start)[..], [OpAction::SendLock(_)]));
        assert_eq!(sm.phase(), OpPhase::LockSent);

        let actions = acc_all(&mut sm, &ps);
        assert_eq!(actions[0], OpAction::RunLocalStage);
        assert!(matches!(actions[1], OpAction::SendStage(_)));

        assert!(sm.step(OpEvent::accept(Responder::Local)).is_empty());
        let actions = acc_all(&mut sm, &ps);
        assert_eq!(actions, vec![OpAction::RunLocalCommit]);

        let actions = sm.step(OpEvent::accept(Responder::Local));
        assert!(matches!(actions[..], [OpAction::SendCommit(_)]));
        let actions = acc_all(&mut sm, &ps);
        assert!(matches!(actions[..], [OpAction::SendUnlock(ref t)] if t.len() == 2));

        let actions = acc_all(&mut sm, &ps);
        assert_eq!(actions[0], OpAction::ReleaseLocalLock);
        match &actions[1] {
            OpAction::Reply(r) => assert!(r.is_success()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(sm.phase(), OpPhase::Success);
    }

    #[test]
    fn test_single_node_skips_lock() {
        let mut sm = machine(delete(), Vec::new());
        assert_eq!(sm.step(OpEvent::Start), vec![OpAction::RunLocalStage]);
        assert_eq!(sm.step(OpEvent::accept(Responder::Local)), vec![OpAction::RunLocalCommit]);
        let actions = sm.step(OpEvent::accept(Responder::Local));
        assert_eq!(actions[0], OpAction::ReleaseLocalLock);
        assert_eq!(sm.phase(), OpPhase::Success);
    }

    #[test]
    fn test_lock_reject_unlocks_granted_only() {
        let ps = peers(3);
        let mut sm = machine(delete(), ps.clone());
        sm.step(OpEvent::Start);
        assert!(sm.step(OpEvent::accept(Responder::Peer(ps[0].uuid))).is_empty());
        assert!(sm.step(OpEvent::reject(Responder::Peer(ps[1].uuid), 16, None)).is_empty());
        let actions = sm.step(OpEvent::accept(Responder::Peer(ps[2].uuid)));
        assert_eq!(actions, vec![OpAction::SendUnlock(vec![ps[0].uuid, ps[2].uuid])]);
        assert!(!has_commit(&actions));

        sm.step(OpEvent::accept(Responder::Peer(ps[0].uuid)));
        let actions = sm.step(OpEvent::accept(Responder::Peer(ps[2].uuid)));
        match &actions[1] {
            OpAction::Reply(r) => {
                assert_eq!(r.op_errstr.as_deref(), Some("Operation failed on node3"));
                assert_eq!(r.op_errno, 16);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(sm.phase(), OpPhase::Aborted);
    }

    #[test]
    fn test_stage_reject_never_commits() {
        let ps = peers(2);
        let mut sm = machine(delete(), ps.clone());
        sm.step(OpEvent::Start);
        acc_all(&mut sm, &ps);

        let mut all = Vec::new();
        all.extend(sm.step(OpEvent::reject(Responder::Peer(ps[0].uuid), 22, Some("Volume v does not exist".into()))));
        all.extend(sm.step(OpEvent::reject(Responder::Local, 22, Some("local says no".into()))));
        all.extend(sm.step(OpEvent::accept(Responder::Peer(ps[1].uuid))));
        assert!(!has_commit(&all));
        assert!(matches!(all.last(), Some(OpAction::SendUnlock(t)) if t.len() == 2));

        let mut all = acc_all(&mut sm, &ps);
        assert!(!has_commit(&all));
        match all.pop() {
            Some(OpAction::Reply(r)) => assert_eq!(r.op_errstr.as_deref(), Some("Volume v does not exist")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_late_responses_ignored() {
        let ps = peers(1);
        let mut sm = machine(delete(), ps.clone());
        sm.step(OpEvent::Start);
        acc_all(&mut sm, &ps);
        // duplicate lock grant during stage
        assert!(sm.step(OpEvent::accept(Responder::Brick("x:/y".into()))).is_empty());
        sm.step(OpEvent::accept(Responder::Local));
        let before = sm.pending();
        assert!(sm.step(OpEvent::accept(Responder::Local)).is_empty());
        assert_eq!(sm.pending(), before);
    }

    #[test]
    fn test_unlock_failure_not_fatal() {
        let ps = peers(1);
        let mut sm = machine(delete(), ps.clone());
        sm.step(OpEvent::Start);
        acc_all(&mut sm, &ps);
        sm.step(OpEvent::accept(Responder::Local));
        acc_all(&mut sm, &ps);
        sm.step(OpEvent::accept(Responder::Local));
        acc_all(&mut sm, &ps);
        let actions = sm.step(OpEvent::reject(Responder::Peer(ps[0].uuid), 16, None));
        match &actions[1] {
            OpAction::Reply(r) => assert!(r.is_success()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_brick_phase_merges_profile() {
        let ps = peers(1);
        let req = OpRequest::Profile {
            name: "v".into(),
            command: ProfileCommand::Info,
        };
        let mut sm = machine(req, ps.clone());
        sm.step(OpEvent::Start);
        acc_all(&mut sm, &ps);
        sm.step(OpEvent::accept(Responder::Local));
        assert_eq!(
            acc_all(&mut sm, &ps),
            vec![OpAction::RunBrickOps, OpAction::SendBrickOp(vec![ps[0].uuid])]
        );
        assert!(sm.step(OpEvent::None).is_empty());

        assert!(sm
            .step(OpEvent::BricksDispatched(vec!["node1:/a".into(), "node1:/b".into()]))
            .is_empty());
        let mut payload = ResponseDict::new();
        payload.insert("read-hits".into(), "5".into());
        sm.step(OpEvent::RcvdAcc {
            from: Responder::Brick("node1:/a".into()),
            payload: payload.clone(),
        });
        assert!(sm
            .step(OpEvent::RcvdAcc {
                from: Responder::Brick("node1:/b".into()),
                payload,
            })
            .is_empty());

        let mut peer = ResponseDict::new();
        peer.insert("count".into(), "1".into());
        peer.insert("1-brick".into(), "node2:/c".into());
        let actions = sm.step(OpEvent::RcvdAcc {
            from: Responder::Peer(ps[0].uuid),
            payload: peer,
        });
        assert_eq!(actions, vec![OpAction::RunLocalCommit]);
        assert_eq!(sm.context().response["count"], "3");
        assert_eq!(sm.context().response["3-brick"], "node2:/c");
        assert_eq!(sm.context().response["2-read-hits"], "5");

        sm.step(OpEvent::accept(Responder::Local));
        acc_all(&mut sm, &ps);
        assert_eq!(sm.context().response["count"], "3");
    }

    #[test]
    fn test_brick_failure_waits_for_peer_bricks() {
        let ps = peers(1);
        let req = OpRequest::StopVolume {
            name: "v".into(),
            force: false,
        };
        let mut sm = machine(req, ps.clone());
        sm.step(OpEvent::Start);
        acc_all(&mut sm, &ps);
        sm.step(OpEvent::accept(Responder::Local));
        let actions = acc_all(&mut sm, &ps);
        assert!(actions.contains(&OpAction::SendBrickOp(vec![ps[0].uuid])));

        sm.step(OpEvent::BricksDispatched(vec!["node1:/a".into()]));
        let errno = ErrorKind::State.errno();
        assert!(sm
            .step(OpEvent::reject(Responder::Brick("node1:/a".into()), errno, Some("brick node1:/a is wedged".into())))
            .is_empty());
        assert_eq!(sm.pending(), 1);

        let actions = acc_all(&mut sm, &ps);
        assert!(!has_commit(&actions));
        assert_eq!(actions, vec![OpAction::SendUnlock(vec![ps[0].uuid])]);
        let mut all = acc_all(&mut sm, &ps);
        match all.pop() {
            Some(OpAction::Reply(r)) => {
                assert_eq!(r.op_errno, errno);
                assert_eq!(r.op_errstr.as_deref(), Some("brick node1:/a is wedged"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_brick_failure_aborts_before_commit() {
        let req = OpRequest::StopVolume {
            name: "v".into(),
            force: false,
        };
        let mut sm = machine(req, Vec::new());
        sm.step(OpEvent::Start);
        assert_eq!(sm.step(OpEvent::accept(Responder::Local)), vec![OpAction::RunBrickOps]);
        sm.step(OpEvent::BricksDispatched(vec!["a:/1".into(), "a:/2".into(), "a:/3".into()]));
        let mut all = Vec::new();
        all.extend(sm.step(OpEvent::accept(Responder::Brick("a:/1".into()))));
        all.extend(sm.step(OpEvent::reject(Responder::Brick("a:/2".into()), ErrorKind::Transport.errno(), None)));
        all.extend(sm.step(OpEvent::accept(Responder::Brick("a:/3".into()))));
        assert!(!has_commit(&all));
        match all.last() {
            Some(OpAction::Reply(r)) => {
                assert_eq!(r.op_ret, -1);
                assert_eq!(r.op_errstr.as_deref(), Some("Operation failed on a:/2"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_no_bricks_dispatched_advances() {
        let req = OpRequest::StopVolume {
            name: "v".into(),
            force: false,
        };
        let mut sm = machine(req, Vec::new());
        sm.step(OpEvent::Start);
        sm.step(OpEvent::accept(Responder::Local));
        assert_eq!(sm.step(OpEvent::BricksDispatched(Vec::new())), vec![OpAction::RunLocalCommit]);
    }
}
