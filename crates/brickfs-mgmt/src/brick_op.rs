//! Fan-out of brick sub-operations.
//!
//! Each selected running brick gets its own RPC; failures are recorded per
//! brick and never stop the others. For stop and remove operations the
//! brick connection is torn down only after a grace period so in-flight
//! traffic can drain, and the result is reported after the disconnect.

use brickfs_volgen::BrickInfo;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::op_ctx::{OperationKind, ResponseDict};
use crate::op_sm::{OpEvent, Responder};
use crate::transport::{BrickRequest, BrickTransport};

pub const DEFAULT_DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// A brick and the sub-operation to run on it
#[derive(Debug, Clone)]
pub struct BrickTarget {
    pub brick: BrickInfo,
    pub request: BrickRequest,
}

impl BrickTarget {
    pub fn new(brick: BrickInfo, request: BrickRequest) -> Self {
        Self { brick, request }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrickOutcome {
    /// `host:path`
    pub brick: String,
    pub op_ret: i32,
    pub op_errno: i32,
    pub op_errstr: Option<String>,
    pub payload: ResponseDict,
}

impl BrickOutcome {
    pub fn is_ok(&self) -> bool {
        self.op_ret == 0
    }

    pub fn into_event(self) -> OpEvent {
        if self.op_ret == 0 {
            OpEvent::RcvdAcc {
                from: Responder::Brick(self.brick),
                payload: self.payload,
            }
        } else {
            OpEvent::RcvdRjt {
                from: Responder::Brick(self.brick),
                op_ret: self.op_ret,
                op_errno: self.op_errno,
                op_errstr: self.op_errstr,
            }
        }
    }
}

type PendingDisconnects = Arc<DashMap<String, oneshot::Sender<()>>>;

pub struct BrickOpCoordinator {
    transport: Arc<dyn BrickTransport>,
    grace: Duration,
    pending: PendingDisconnects,
}

impl BrickOpCoordinator {
    pub fn new(transport: Arc<dyn BrickTransport>, grace: Duration) -> Self {
        Self {
            transport,
            grace,
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Whether responses for `kind` wait for the disconnect grace period
    pub fn defers_disconnect(kind: OperationKind) -> bool {
        matches!(kind, OperationKind::StopVolume | OperationKind::RemoveBrick)
    }

    fn running(targets: Vec<BrickTarget>) -> Vec<BrickTarget> {
        targets
            .into_iter()
            .filter(|t| {
                if !t.brick.started {
                    debug!(brick = %t.brick, "skipping brick that is not running");
                }
                t.brick.started
            })
            .collect()
    }

    /// Issues one RPC per running brick and feeds results into `events`.
    ///
    /// Returns the ids of the bricks a result will arrive for.
    pub fn dispatch(
        &self,
        kind: OperationKind,
        targets: Vec<BrickTarget>,
        events: mpsc::UnboundedSender<OpEvent>,
    ) -> Vec<String> {
        let targets = Self::running(targets);
        let ids = targets.iter().map(|t| t.brick.id()).collect();
        for target in targets {
            let transport = self.transport.clone();
            let pending = self.pending.clone();
            let grace = self.grace;
            let events = events.clone();
            tokio::spawn(async move {
                let outcome = run_one(transport, pending, grace, kind, target).await;
                if events.send(outcome.into_event()).is_err() {
                    debug!("operation finished before brick result arrived");
                }
            });
        }
        ids
    }

    /// Runs the sub-operation on every running brick and waits for all results
    pub async fn run_all(&self, kind: OperationKind, targets: Vec<BrickTarget>) -> Vec<BrickOutcome> {
        let futures = Self::running(targets).into_iter().map(|target| {
            run_one(
                self.transport.clone(),
                self.pending.clone(),
                self.grace,
                kind,
                target,
            )
        });
        join_all(futures).await
    }

    /// Number of bricks waiting for their grace period to end
    #[cfg(test)]
    pub(crate) fn pending_disconnects(&self) -> usize {
        self.pending.len()
    }

    /// Ends a brick's grace period now
    #[cfg(test)]
    pub(crate) fn flush(&self, brick: &str) -> bool {
        match self.pending.remove(brick) {
            Some((_, tx)) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

async fn run_one(
    transport: Arc<dyn BrickTransport>,
    pending: PendingDisconnects,
    grace: Duration,
    kind: OperationKind,
    target: BrickTarget,
) -> BrickOutcome {
    let id = target.brick.id();
    match transport.send(&target.brick, target.request).await {
        Ok(resp) if resp.op_ret == 0 => {
            if BrickOpCoordinator::defers_disconnect(kind) {
                let (tx, rx) = oneshot::channel();
                pending.insert(id.clone(), tx);
                tokio::select! {
                    _ = tokio::time::sleep(grace) => {}
                    _ = rx => {}
                }
                pending.remove(&id);
                transport.disconnect(&target.brick).await;
                debug!(brick = %id, "brick disconnected");
            }
            BrickOutcome {
                brick: id,
                op_ret: 0,
                op_errno: 0,
                op_errstr: None,
                payload: resp.payload,
            }
        }
        Ok(resp) => {
            warn!(brick = %id, error = ?resp.op_errstr, "brick op rejected");
            BrickOutcome {
                brick: id,
                op_ret: resp.op_ret,
                op_errno: ErrorKind::State.errno(),
                op_errstr: resp.op_errstr,
                payload: ResponseDict::new(),
            }
        }
        Err(e) => {
            warn!(brick = %id, error = %e, "brick op failed");
            BrickOutcome {
                brick: id,
                op_ret: -1,
                op_errno: ErrorKind::Transport.errno(),
                op_errstr: None,
                payload: ResponseDict::new(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{BrickResponse, TransportError};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBricks {
        fail: Vec<String>,
        sent: Mutex<Vec<String>>,
        disconnected: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BrickTransport for FakeBricks {
        async fn send(&self, brick: &BrickInfo, _request: BrickRequest) -> Result<BrickResponse, TransportError> {
            self.sent.lock().unwrap().push(brick.id());
            if self.fail.contains(&brick.id()) {
                return Err(TransportError::Unreachable {
                    addr: brick.id(),
                    reason: "down".into(),
                });
            }
            Ok(BrickResponse::default())
        }

        async fn disconnect(&self, brick: &BrickInfo) {
            self.disconnected.lock().unwrap().push(brick.id());
        }
    }

    fn started(path: &str) -> BrickTarget {
        let mut b = BrickInfo::new("node1", path);
        b.started = true;
        BrickTarget::new(b, BrickRequest::Terminate)
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_failures() {
        let fake = Arc::new(FakeBricks {
            fail: vec!["node1:/b".into()],
            ..Default::default()
        });
        let coord = BrickOpCoordinator::new(fake.clone(), DEFAULT_DISCONNECT_GRACE);
        let outcomes = coord
            .run_all(
                OperationKind::StopVolume,
                vec![started("/a"), started("/b"), started("/c")],
            )
            .await;
        assert_eq!(fake.sent.lock().unwrap().len(), 3);
        assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 2);
        assert_eq!(fake.disconnected.lock().unwrap().len(), 2);
        assert_eq!(coord.pending_disconnects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_stopped_bricks() {
        let fake = Arc::new(FakeBricks::default());
        let coord = BrickOpCoordinator::new(fake.clone(), DEFAULT_DISCONNECT_GRACE);
        let mut stopped = started("/b");
        stopped.brick.started = false;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ids = coord.dispatch(OperationKind::Profile, vec![started("/a"), stopped], tx);
        assert_eq!(ids, vec!["node1:/a".to_string()]);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, OpEvent::RcvdAcc { from: Responder::Brick(ref b), .. } if b == "node1:/a"));
        assert!(fake.disconnected.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_delays_result() {
        let fake = Arc::new(FakeBricks::default());
        let coord = BrickOpCoordinator::new(fake.clone(), Duration::from_secs(5));
        let (tx, mut rx) = mpsc::unbounded_channel();
        coord.dispatch(OperationKind::StopVolume, vec![started("/a")], tx);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(coord.pending_disconnects(), 1);
        assert!(fake.disconnected.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_ok());
        assert_eq!(fake.disconnected.lock().unwrap().len(), 1);
        assert_eq!(coord.pending_disconnects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_ends_grace_early() {
        let fake = Arc::new(FakeBricks::default());
        let coord = BrickOpCoordinator::new(fake.clone(), Duration::from_secs(3600));
        let (tx, mut rx) = mpsc::unbounded_channel();
        coord.dispatch(OperationKind::RemoveBrick, vec![started("/a")], tx);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(coord.flush("node1:/a"));
        assert!(rx.recv().await.is_some());
        assert!(!coord.flush("node1:/a"));
    }

    #[test]
    fn test_outcome_events() {
        let ok = BrickOutcome {
            brick: "n:/a".into(),
            op_ret: 0,
            op_errno: 0,
            op_errstr: None,
            payload: ResponseDict::new(),
        };
        assert!(matches!(ok.into_event(), OpEvent::RcvdAcc { .. }));
        let bad = BrickOutcome {
            brick: "n:/a".into(),
            op_ret: -1,
            op_errno: ErrorKind::Transport.errno(),
            op_errstr: None,
            payload: ResponseDict::new(),
        };
        match bad.into_event() {
            OpEvent::RcvdRjt { op_errno, .. } => assert_eq!(op_errno, ErrorKind::Transport.errno()),
            other => panic!("unexpected {:?}", other),
        }
    }
}
