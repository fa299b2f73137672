//! Runs a cluster operation from this node: lock, stage, brick ops, commit,
//! unlock.
//!
//! The phase logic lives in [`OpStateMachine`]; this file only turns its
//! actions into RPCs and local handler calls and feeds the results back.

use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::daemon::MgmtDaemon;
use crate::error::{ErrorKind, MgmtError, Result};
use crate::op_ctx::{OpReply, OpRequest, OperationContext, ResponseDict};
use crate::op_sm::{OpAction, OpEvent, OpStateMachine, PeerTarget, Responder};
use crate::peer::Peer;
use crate::transport::{PeerRequest, PeerResponse, TransportError};

fn failure(err: &MgmtError) -> OpReply {
    OpReply::failure(err.kind().errno(), err.to_string())
}

fn local_event(result: Result<ResponseDict>) -> OpEvent {
    match result {
        Ok(payload) => OpEvent::RcvdAcc {
            from: Responder::Local,
            payload,
        },
        Err(e) => OpEvent::reject(Responder::Local, e.kind().errno(), Some(e.to_string())),
    }
}

/// Maps a peer's answer (or its absence) to a state machine event
pub(crate) fn peer_event(uuid: Uuid, hostname: &str, result: std::result::Result<PeerResponse, TransportError>) -> OpEvent {
    let from = Responder::Peer(uuid);
    match result {
        Ok(resp) if resp.is_ok() => OpEvent::RcvdAcc {
            from,
            payload: resp.payload,
        },
        Ok(resp) => OpEvent::RcvdRjt {
            from,
            op_ret: resp.op_ret,
            op_errno: resp.op_errno,
            op_errstr: resp.op_errstr,
        },
        Err(TransportError::Decode { .. }) => OpEvent::reject(
            from,
            ErrorKind::ProtocolDecode.errno(),
            Some(format!("Unable to decode response from {}", hostname)),
        ),
        Err(_) => OpEvent::reject(from, ErrorKind::Transport.errno(), None),
    }
}

impl MgmtDaemon {
    /// Runs `request` across the cluster with this node as coordinator
    pub async fn submit(&self, mut request: OpRequest) -> OpReply {
        if let OpRequest::FsmLog { peer } = &request {
            return match self.fsm_log(peer.as_deref()).await {
                Ok(entries) => fsm_log_reply(&entries),
                Err(e) => failure(&e),
            };
        }
        let kind = request.kind();
        let handler = match self.handlers.get(kind) {
            Ok(handler) => handler,
            Err(e) => return failure(&e),
        };
        if let Err(e) = handler.prepare(&self.state, &mut request) {
            return failure(&e);
        }

        let peers: HashMap<Uuid, Peer> = self
            .state
            .peers
            .befriended()
            .into_iter()
            .filter_map(|p| p.uuid.map(|uuid| (uuid, p)))
            .collect();
        if let Some(down) = peers.values().find(|p| !p.connected) {
            return OpReply::failure(
                ErrorKind::State.errno(),
                format!("Host {} not connected", down.hostname),
            );
        }
        let local = self.state.uuid();
        if let Err(e) = self.state.op_lock.lock(local) {
            return failure(&e);
        }
        info!(op = %kind, volume = ?request.volume(), peers = peers.len(), "operation started");

        let targets = peers
            .iter()
            .map(|(uuid, p)| PeerTarget {
                uuid: *uuid,
                hostname: p.hostname.clone(),
            })
            .collect();
        let mut sm = OpStateMachine::new(
            OperationContext::new(request.clone()),
            self.state.local.hostname.clone(),
            targets,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut queue = VecDeque::from([OpEvent::Start]);

        let mut reply = loop {
            let event = match queue.pop_front() {
                Some(event) => event,
                None => match rx.recv().await {
                    Some(event) => event,
                    // tx lives in this frame, so the channel never closes first
                    None => break sm.context().reply(),
                },
            };
            let mut done = None;
            for action in sm.step(event) {
                match action {
                    OpAction::SendLock(ids) => self.fan_out(&peers, ids, PeerRequest::ClusterLock { uuid: local }, &tx),
                    OpAction::RunLocalStage => {
                        let result = handler.stage(&self.state, local, &request).map(|_| ResponseDict::new());
                        queue.push_back(local_event(result));
                    }
                    OpAction::SendStage(ids) => self.fan_out(
                        &peers,
                        ids,
                        PeerRequest::StageOp {
                            uuid: local,
                            request: request.clone(),
                        },
                        &tx,
                    ),
                    OpAction::RunBrickOps => match handler.select_bricks(&self.state, &request) {
                        Ok(bricks) => {
                            let ids = self.bricks.dispatch(kind, bricks, tx.clone());
                            queue.push_back(OpEvent::BricksDispatched(ids));
                        }
                        Err(e) => {
                            let id = self.state.local.hostname.clone();
                            queue.push_back(OpEvent::BricksDispatched(vec![id.clone()]));
                            queue.push_back(OpEvent::reject(Responder::Brick(id), e.kind().errno(), Some(e.to_string())));
                        }
                    },
                    OpAction::SendBrickOp(ids) => self.fan_out(
                        &peers,
                        ids,
                        PeerRequest::BrickOp {
                            uuid: local,
                            request: request.clone(),
                        },
                        &tx,
                    ),
                    OpAction::RunLocalCommit => {
                        queue.push_back(local_event(handler.commit(&self.state, local, &request)));
                    }
                    OpAction::SendCommit(ids) => self.fan_out(
                        &peers,
                        ids,
                        PeerRequest::CommitOp {
                            uuid: local,
                            request: request.clone(),
                        },
                        &tx,
                    ),
                    OpAction::SendUnlock(ids) => {
                        self.fan_out(&peers, ids, PeerRequest::ClusterUnlock { uuid: local }, &tx)
                    }
                    OpAction::ReleaseLocalLock => {
                        if let Err(e) = self.state.op_lock.unlock(local) {
                            warn!(op = %kind, error = %e, "failed to release local lock");
                        }
                    }
                    OpAction::Reply(reply) => done = Some(reply),
                }
            }
            if let Some(reply) = done {
                break reply;
            }
        };

        if reply.is_success() {
            if let Err(e) = handler.post_commit(&self.state, &request, &reply.response) {
                warn!(op = %kind, error = %e, "post-commit failed");
                reply = failure(&e);
            }
        }
        if reply.is_success() {
            info!(op = %kind, volume = ?request.volume(), "operation succeeded");
        } else {
            warn!(op = %kind, volume = ?request.volume(), error = ?reply.op_errstr, "operation failed");
        }
        reply
    }

    /// Sends `request` to each peer in `ids`; answers arrive on `events`
    fn fan_out(&self, peers: &HashMap<Uuid, Peer>, ids: Vec<Uuid>, request: PeerRequest, events: &mpsc::UnboundedSender<OpEvent>) {
        for uuid in ids {
            let Some(peer) = peers.get(&uuid).cloned() else {
                warn!(%uuid, "no address for peer");
                let _ = events.send(OpEvent::reject(Responder::Peer(uuid), ErrorKind::Transport.errno(), None));
                continue;
            };
            let sender = self.sender.clone();
            let request = request.clone();
            let events = events.clone();
            tokio::spawn(async move {
                let result = sender.send(&peer.hostname, peer.port, request).await;
                if events.send(peer_event(uuid, &peer.hostname, result)).is_err() {
                    debug!(peer = %peer.hostname, "operation finished before peer answered");
                }
            });
        }
    }
}

fn fsm_log_reply(entries: &[crate::friend_sm::FsmLogEntry]) -> OpReply {
    let mut rsp = ResponseDict::new();
    for (i, entry) in entries.iter().enumerate() {
        let n = i + 1;
        rsp.insert(format!("log{}.peer", n), entry.peer.clone());
        rsp.insert(format!("log{}.old-state", n), entry.old_state.to_string());
        rsp.insert(format!("log{}.event", n), entry.event.clone());
        rsp.insert(format!("log{}.new-state", n), entry.new_state.to_string());
        rsp.insert(format!("log{}.time", n), entry.timestamp.to_rfc3339());
    }
    rsp.insert("count".into(), entries.len().to_string());
    OpReply::success(rsp)
}
