//! Per-operation validation and mutation logic.
//!
//! Every node runs `stage` and `commit` against its own copy of the cluster
//! state; the coordinator additionally runs `prepare` before anything is
//! sent and `post_commit` once every peer committed.

use std::collections::HashMap;
use uuid::Uuid;

use crate::brick_op::BrickTarget;
use crate::error::{MgmtError, Result};
use crate::op_ctx::{OpRequest, OperationKind, ResponseDict};
use crate::state::ClusterState;

pub mod brick;
pub mod gsync;
pub mod options;
pub mod profile;
pub mod quota;
pub mod rebalance;
pub mod sync;
pub mod volume;

pub trait OpHandler: Send + Sync {
    fn kind(&self) -> OperationKind;

    /// Fills in values the coordinator picks for the whole cluster
    fn prepare(&self, _state: &ClusterState, _request: &mut OpRequest) -> Result<()> {
        Ok(())
    }

    /// Validates the request against this node's state without changing it.
    /// `origin` is the coordinating node.
    fn stage(&self, state: &ClusterState, origin: Uuid, request: &OpRequest) -> Result<()>;

    /// Local bricks that need a sub-operation before commit
    fn select_bricks(&self, _state: &ClusterState, _request: &OpRequest) -> Result<Vec<BrickTarget>> {
        Ok(Vec::new())
    }

    /// Applies the request and returns this node's share of the reply
    fn commit(&self, state: &ClusterState, origin: Uuid, request: &OpRequest) -> Result<ResponseDict>;

    /// Runs on the coordinator after every peer committed
    fn post_commit(&self, _state: &ClusterState, _request: &OpRequest, _response: &ResponseDict) -> Result<()> {
        Ok(())
    }
}

/// Error for a request routed to the wrong handler
pub(crate) fn mismatch(kind: OperationKind, request: &OpRequest) -> MgmtError {
    MgmtError::Validation(format!("{} handler cannot run {} requests", kind, request.kind()))
}

/// Handlers keyed by the operation they implement
pub struct HandlerRegistry {
    handlers: HashMap<OperationKind, Box<dyn OpHandler>>,
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Box<dyn OpHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn get(&self, kind: OperationKind) -> Result<&dyn OpHandler> {
        self.handlers
            .get(&kind)
            .map(|h| h.as_ref())
            .ok_or_else(|| MgmtError::Validation(format!("{} is not a cluster operation", kind)))
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(volume::CreateVolume));
        registry.register(Box::new(volume::DeleteVolume));
        registry.register(Box::new(volume::StartVolume));
        registry.register(Box::new(volume::StopVolume));
        registry.register(Box::new(brick::AddBrick));
        registry.register(Box::new(brick::RemoveBrick));
        registry.register(Box::new(brick::ReplaceBrick));
        registry.register(Box::new(options::SetOption));
        registry.register(Box::new(options::ResetOption));
        registry.register(Box::new(rebalance::Rebalance));
        registry.register(Box::new(profile::Profile));
        registry.register(Box::new(quota::Quota));
        registry.register(Box::new(gsync::GeoReplication));
        registry.register(Box::new(sync::SyncVolume));
        registry
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_covers_transactional_ops() {
        let registry = HandlerRegistry::default();
        for kind in [
            OperationKind::CreateVolume,
            OperationKind::DeleteVolume,
            OperationKind::StartVolume,
            OperationKind::StopVolume,
            OperationKind::AddBrick,
            OperationKind::RemoveBrick,
            OperationKind::ReplaceBrick,
            OperationKind::SetOption,
            OperationKind::ResetOption,
            OperationKind::Rebalance,
            OperationKind::Profile,
            OperationKind::Quota,
            OperationKind::GeoReplicationSet,
            OperationKind::Sync,
        ] {
            assert_eq!(registry.get(kind).unwrap().kind(), kind);
        }
        assert!(registry.get(OperationKind::FsmLog).is_err());
    }
}
