//! The management daemon: peer membership plus the receiving end of every
//! peer request.
//!
//! Cluster operations started on this node are driven from `driver.rs`.

use brickfs_volgen::VolumeInfo;
use futures::future::join_all;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::brick_op::BrickOpCoordinator;
use crate::error::{ErrorKind, MgmtError, Result};
use crate::friend_sm::{FriendAction, FriendEvent, FriendState, FsmLogEntry, ProbeOutcome, ProbeRejection, ProbeReply};
use crate::handlers::HandlerRegistry;
use crate::merge;
use crate::op_ctx::{OpReply, OpRequest, OperationKind, ResponseDict};
use crate::peer::{Peer, PeerRecord};
use crate::state::ClusterState;
use crate::transport::{BrickTransport, PeerRequest, PeerResponse, PeerTransport, TransportError};

/// How long a peer request may take before the peer counts as gone
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_secs(600);

/// Peer requests with the frame timeout applied and connectivity tracked
#[derive(Clone)]
pub(crate) struct PeerSender {
    transport: Arc<dyn PeerTransport>,
    state: Arc<ClusterState>,
    timeout: Duration,
}

impl PeerSender {
    pub(crate) async fn send(
        &self,
        hostname: &str,
        port: u16,
        request: PeerRequest,
    ) -> std::result::Result<PeerResponse, TransportError> {
        let name = request.name();
        let result = match tokio::time::timeout(self.timeout, self.transport.send(hostname, port, request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                addr: format!("{}:{}", hostname, port),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        };
        match &result {
            Ok(_) => self.mark(hostname, true),
            Err(e @ (TransportError::Unreachable { .. } | TransportError::Timeout { .. })) => {
                warn!(peer = %hostname, request = name, error = %e, "peer request failed");
                self.mark(hostname, false);
            }
            Err(e) => warn!(peer = %hostname, request = name, error = %e, "bad peer response"),
        }
        result
    }

    fn mark(&self, hostname: &str, up: bool) {
        let was = self.state.peers.find(hostname).map(|p| p.connected);
        if let Ok(peer) = self.state.peers.update(hostname, |p| p.connected = up) {
            match (was, up) {
                (Some(false), true) => info!(peer = %peer.hostname, "peer connected"),
                (Some(true), false) => info!(peer = %peer.hostname, "peer disconnected"),
                _ => {}
            }
        }
    }
}

/// Scratch state of one run of friend actions
#[derive(Default)]
struct Handshake {
    remote_volumes: Vec<VolumeInfo>,
    import_failed: bool,
    transport_error: Option<TransportError>,
    reply: Option<PeerResponse>,
    notify: Option<ProbeReply>,
}

/// One node's management daemon
pub struct MgmtDaemon {
    pub(crate) state: Arc<ClusterState>,
    pub(crate) handlers: HandlerRegistry,
    pub(crate) sender: PeerSender,
    pub(crate) bricks: BrickOpCoordinator,
}

impl MgmtDaemon {
    /// `frame_timeout` bounds every peer request; `disconnect_grace` delays
    /// brick disconnects after stop and remove-brick
    pub fn new(
        state: Arc<ClusterState>,
        peers: Arc<dyn PeerTransport>,
        bricks: Arc<dyn BrickTransport>,
        frame_timeout: Duration,
        disconnect_grace: Duration,
    ) -> Self {
        Self {
            sender: PeerSender {
                transport: peers,
                state: state.clone(),
                timeout: frame_timeout,
            },
            state,
            handlers: HandlerRegistry::default(),
            bricks: BrickOpCoordinator::new(bricks, disconnect_grace),
        }
    }

    pub fn state(&self) -> &Arc<ClusterState> {
        &self.state
    }

    fn hostname(&self) -> &str {
        &self.state.local.hostname
    }

    fn accept(&self) -> PeerResponse {
        PeerResponse::accept(self.state.uuid(), self.hostname())
    }

    fn reject(&self, rejection: ProbeRejection) -> PeerResponse {
        PeerResponse::reject(
            self.state.uuid(),
            self.hostname(),
            rejection.errno(),
            rejection.message(self.hostname()),
        )
    }

    fn reject_error(&self, err: &MgmtError) -> PeerResponse {
        PeerResponse::reject(self.state.uuid(), self.hostname(), err.kind().errno(), err.to_string())
    }

    /// Adds `host` to the cluster.
    ///
    /// Probing this node or a host already in the peer list succeeds
    /// without doing anything.
    pub async fn probe(&self, host: &str, port: u16) -> OpReply {
        if self.state.is_local_host(host) {
            return probe_reply(ProbeReply::Localhost, host, port);
        }
        if self.state.peers.find(host).is_some() {
            return probe_reply(ProbeReply::AlreadyInList, host, port);
        }
        if let Err(e) = self.state.peers.insert(Peer::new(host, port)) {
            return OpReply::failure(e.kind().errno(), e.to_string());
        }
        info!(peer = %host, port, "probing peer");
        let mut hs = Handshake::default();
        let result = match self.state.apply_friend_event(host, FriendEvent::ProbeRequested) {
            Ok(actions) => self.run_friend_actions(host, actions, &mut hs).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(peer = %host, error = %e, "probe failed");
            if let Err(e) = self.state.forget_peer(host) {
                warn!(peer = %host, error = %e, "failed to drop peer");
            }
            return OpReply::failure(e.kind().errno(), e.to_string());
        }
        if let Some(e) = hs.transport_error {
            return OpReply::failure(ErrorKind::Transport.errno(), e.to_string());
        }
        match hs.notify {
            Some(reply) => probe_reply(reply, host, port),
            None => OpReply::failure(
                ErrorKind::State.errno(),
                format!("Probe on host {} port {} did not complete", host, port),
            ),
        }
    }

    /// Removes `host` from the cluster.
    ///
    /// Refused while volumes have bricks on the host unless `force` is set.
    pub async fn detach(&self, host: &str, force: bool) -> OpReply {
        if self.state.is_local_host(host) {
            return OpReply::failure(ErrorKind::Validation.errno(), format!("{} is localhost", host));
        }
        let Some(peer) = self.state.peers.find(host) else {
            return OpReply::failure(
                ErrorKind::Validation.errno(),
                format!("{} is not part of cluster", host),
            );
        };
        let has_bricks = self
            .state
            .volumes()
            .iter()
            .any(|v| v.bricks.iter().any(|b| b.hostname == peer.hostname));
        if has_bricks && !force {
            return OpReply::failure(
                ErrorKind::State.errno(),
                format!("Brick(s) with the peer {} exist in cluster", host),
            );
        }
        info!(peer = %peer.hostname, force, "detaching peer");
        let mut hs = Handshake::default();
        let result = match self
            .state
            .apply_friend_event(&peer.hostname, FriendEvent::FriendRemoveRequested)
        {
            Ok(actions) => self.run_friend_actions(&peer.hostname, actions, &mut hs).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                let mut rsp = ResponseDict::new();
                rsp.insert("output".into(), "success".into());
                OpReply::success(rsp)
            }
            Err(e) => OpReply::failure(e.kind().errno(), e.to_string()),
        }
    }

    /// Recent friend transitions, read locally or from `peer`
    pub async fn fsm_log(&self, peer: Option<&str>) -> Result<Vec<FsmLogEntry>> {
        let host = match peer {
            Some(host) if !self.state.is_local_host(host) => host,
            _ => return Ok(self.state.fsm_log.entries()),
        };
        let peer = self
            .state
            .peers
            .find(host)
            .ok_or_else(|| MgmtError::Validation(format!("{} is not a known peer", host)))?;
        let resp = self.sender.send(&peer.hostname, peer.port, PeerRequest::FsmLog).await?;
        if !resp.is_ok() {
            return Err(MgmtError::State(resp.op_errstr.unwrap_or_else(|| {
                format!("fetching fsm log from {} failed", peer.hostname)
            })));
        }
        Ok(resp.fsm_log)
    }

    /// Records that the connection to `hostname` went away.
    ///
    /// Befriended peers stay in the list and reconnect on the next
    /// heartbeat; a handshake in progress falls back to `Unknown`.
    pub fn on_transport_lost(&self, hostname: &str) {
        let Some(peer) = self.state.peers.find(hostname) else {
            return;
        };
        self.sender.mark(hostname, false);
        if peer.state != FriendState::Connected {
            if let Err(e) = self.state.apply_friend_event(hostname, FriendEvent::TransportLost) {
                warn!(peer = %hostname, error = %e, "failed to reset peer state");
            }
        }
    }

    /// Pings every befriended peer, refreshing their connected flag
    pub async fn refresh_peers(&self) {
        let request = PeerRequest::Heartbeat {
            uuid: self.state.uuid(),
        };
        let pings = self.state.peers.befriended().into_iter().map(|peer| {
            let request = request.clone();
            async move {
                let result = self.sender.send(&peer.hostname, peer.port, request).await;
                (peer.hostname, result.is_ok())
            }
        });
        for (host, up) in join_all(pings).await {
            debug!(peer = %host, up, "heartbeat");
        }
    }

    /// Serves one request from another management daemon
    pub async fn handle_peer_request(&self, request: PeerRequest) -> PeerResponse {
        debug!(request = request.name(), "peer request");
        match request {
            PeerRequest::Probe { uuid, hostname, port } => self.on_probe(uuid, hostname, port).await,
            PeerRequest::FriendAdd {
                uuid,
                hostname,
                volumes,
                ..
            } => self.on_friend_add(uuid, &hostname, volumes).await,
            PeerRequest::FriendRemove { uuid, hostname } => self.on_friend_remove(uuid, &hostname).await,
            PeerRequest::FriendUpdate { uuid, peers, .. } => self.on_friend_update(uuid, peers),
            PeerRequest::ClusterLock { uuid } => self.respond(self.state.op_lock.lock(uuid).map(|_| ResponseDict::new())),
            PeerRequest::ClusterUnlock { uuid } => self.respond(self.state.op_lock.unlock(uuid).map(|_| ResponseDict::new())),
            PeerRequest::StageOp { uuid, request } => self.respond(self.on_stage(uuid, &request)),
            PeerRequest::BrickOp { uuid, request } => {
                let result = self.on_brick_op(uuid, &request).await;
                self.respond(result)
            }
            PeerRequest::CommitOp { uuid, request } => self.respond(self.on_commit(uuid, &request)),
            PeerRequest::FsmLog => {
                let mut resp = self.accept();
                resp.fsm_log = self.state.fsm_log.entries();
                resp
            }
            PeerRequest::Heartbeat { uuid } => {
                if let Some(peer) = self.state.peers.find_by_uuid(uuid) {
                    self.sender.mark(&peer.hostname, true);
                }
                self.accept()
            }
        }
    }

    fn respond(&self, result: Result<ResponseDict>) -> PeerResponse {
        match result {
            Ok(payload) => self.accept().with_payload(payload),
            Err(e) => {
                debug!(error = %e, "rejecting peer request");
                self.reject_error(&e)
            }
        }
    }

    fn require_lock_holder(&self, origin: Uuid) -> Result<()> {
        match self.state.op_lock.holder() {
            Some(entry) if entry.holder == origin => Ok(()),
            _ => Err(MgmtError::State(format!("Cluster lock not held by {}", origin))),
        }
    }

    fn on_stage(&self, origin: Uuid, request: &OpRequest) -> Result<ResponseDict> {
        self.require_lock_holder(origin)?;
        self.handlers.get(request.kind())?.stage(&self.state, origin, request)?;
        Ok(ResponseDict::new())
    }

    /// Runs every local brick sub-operation; one failing brick does not
    /// stop the others
    async fn on_brick_op(&self, origin: Uuid, request: &OpRequest) -> Result<ResponseDict> {
        self.require_lock_holder(origin)?;
        let handler = self.handlers.get(request.kind())?;
        let targets = handler.select_bricks(&self.state, request)?;
        let mut payload = ResponseDict::new();
        let mut failure = None;
        for outcome in self.bricks.run_all(request.kind(), targets).await {
            if !outcome.is_ok() {
                failure.get_or_insert_with(|| {
                    outcome
                        .op_errstr
                        .unwrap_or_else(|| format!("Operation failed on {}", outcome.brick))
                });
                continue;
            }
            if request.kind() == OperationKind::Profile {
                merge::add_brick_profile(&mut payload, &outcome.brick, &outcome.payload);
            }
        }
        match failure {
            Some(errstr) => Err(MgmtError::State(errstr)),
            None => Ok(payload),
        }
    }

    fn on_commit(&self, origin: Uuid, request: &OpRequest) -> Result<ResponseDict> {
        self.require_lock_holder(origin)?;
        self.handlers.get(request.kind())?.commit(&self.state, origin, request)
    }

    async fn on_probe(&self, uuid: Uuid, hostname: String, port: u16) -> PeerResponse {
        if uuid == self.state.uuid() || self.state.peers.find_by_uuid(uuid).is_some() {
            return self.accept();
        }
        if !self.state.peers.is_empty() {
            info!(peer = %hostname, "refusing probe from another cluster");
            return self.reject(ProbeRejection::AnotherCluster);
        }
        let mut peer = Peer::new(hostname.clone(), port);
        peer.uuid = Some(uuid);
        if let Err(e) = self.state.peers.insert(peer) {
            return self.reject_error(&e);
        }
        info!(peer = %hostname, %uuid, "probe received");
        self.run_inbound(&hostname, FriendEvent::ProbeReceived(ProbeOutcome::Inbound), Handshake::default())
            .await
    }

    async fn on_friend_add(&self, uuid: Uuid, hostname: &str, volumes: Vec<VolumeInfo>) -> PeerResponse {
        let Some(peer) = self.state.peers.find_by_uuid(uuid) else {
            info!(peer = %hostname, %uuid, "friend request from unknown peer");
            return self.reject(ProbeRejection::UnknownPeer);
        };
        let conflict = self.state.check_import(&volumes);
        let hs = Handshake {
            remote_volumes: volumes,
            ..Default::default()
        };
        self.run_inbound(&peer.hostname, FriendEvent::FriendAddRequested { conflict }, hs)
            .await
    }

    async fn on_friend_remove(&self, uuid: Uuid, hostname: &str) -> PeerResponse {
        match self.state.peers.find_by_uuid(uuid) {
            Some(peer) => {
                info!(peer = %peer.hostname, "removed from cluster by peer");
                self.run_inbound(&peer.hostname, FriendEvent::FriendRemoveReceived, Handshake::default())
                    .await
            }
            None => {
                debug!(peer = %hostname, "remove request from unknown peer");
                self.accept()
            }
        }
    }

    fn on_friend_update(&self, uuid: Uuid, records: Vec<PeerRecord>) -> PeerResponse {
        let Some(sender) = self.state.peers.find_by_uuid(uuid) else {
            return self.reject(ProbeRejection::UnknownPeer);
        };
        if let Err(e) = self
            .state
            .apply_friend_event(&sender.hostname, FriendEvent::FriendUpdateReceived)
        {
            return self.reject_error(&e);
        }
        for record in records {
            let known = record.uuid == self.state.uuid()
                || self.state.is_local_host(&record.hostname)
                || self.state.peers.find_by_uuid(record.uuid).is_some()
                || self.state.peers.find(&record.hostname).is_some();
            if known {
                continue;
            }
            let mut peer = Peer::from(record);
            peer.state = FriendState::Connected;
            peer.connected = true;
            let learned = self
                .state
                .peers
                .insert(peer.clone())
                .and_then(|_| self.state.persist_peer(&peer));
            match learned {
                Ok(()) => {
                    self.state.fsm_log.record(
                        &peer.hostname,
                        FriendState::Unknown,
                        &FriendEvent::FriendUpdateReceived,
                        FriendState::Connected,
                    );
                    info!(peer = %peer.hostname, via = %sender.hostname, "peer learned from update");
                }
                Err(e) => warn!(peer = %peer.hostname, error = %e, "failed to add peer from update"),
            }
        }
        self.accept()
    }

    async fn run_inbound(&self, hostname: &str, event: FriendEvent, mut hs: Handshake) -> PeerResponse {
        let result = match self.state.apply_friend_event(hostname, event) {
            Ok(actions) => self.run_friend_actions(hostname, actions, &mut hs).await,
            Err(e) => Err(e),
        };
        match (result, hs.reply) {
            (Err(e), _) => self.reject_error(&e),
            (Ok(()), Some(reply)) => reply,
            (Ok(()), None) => self.accept(),
        }
    }

    async fn run_friend_actions(&self, hostname: &str, actions: Vec<FriendAction>, hs: &mut Handshake) -> Result<()> {
        let mut queue: VecDeque<FriendAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                FriendAction::SendProbe => {
                    let event = self.send_probe(hostname, hs).await?;
                    queue.extend(self.state.apply_friend_event(hostname, event)?);
                }
                FriendAction::SendFriendAdd => {
                    let event = self.send_friend_add(hostname, hs).await?;
                    queue.extend(self.state.apply_friend_event(hostname, event)?);
                }
                FriendAction::ImportVolumes => {
                    let volumes = std::mem::take(&mut hs.remote_volumes);
                    match self.state.import_volumes(volumes) {
                        Ok(n) => debug!(peer = %hostname, imported = n, "volumes imported"),
                        Err(e) => {
                            warn!(peer = %hostname, error = %e, "volume import failed");
                            hs.import_failed = true;
                        }
                    }
                }
                FriendAction::ReplyAccept => {
                    hs.reply = Some(if hs.import_failed {
                        self.reject(ProbeRejection::AddFailed)
                    } else {
                        self.accept().with_volumes(self.state.volumes())
                    });
                }
                FriendAction::ReplyReject(rejection) => hs.reply = Some(self.reject(rejection)),
                FriendAction::BroadcastFriendUpdate => self.broadcast_friend_update().await,
                FriendAction::SendFriendRemove => {
                    self.send_friend_remove(hostname).await;
                    queue.extend(self.state.apply_friend_event(hostname, FriendEvent::FriendRemoveAcked)?);
                }
                FriendAction::AckRemove => hs.reply = Some(self.accept()),
                FriendAction::RemovePeer => {
                    self.state.forget_peer(hostname)?;
                }
                FriendAction::NotifyCaller(reply) => hs.notify = Some(reply),
            }
        }
        Ok(())
    }

    async fn send_probe(&self, hostname: &str, hs: &mut Handshake) -> Result<FriendEvent> {
        let peer = self
            .state
            .peers
            .find(hostname)
            .ok_or_else(|| MgmtError::State(format!("{} vanished during probe", hostname)))?;
        let request = PeerRequest::Probe {
            uuid: self.state.uuid(),
            hostname: self.hostname().to_string(),
            port: self.state.local.port,
        };
        let outcome = match self.sender.send(&peer.hostname, peer.port, request).await {
            Ok(resp) if resp.is_ok() => {
                let known = resp.uuid == self.state.uuid()
                    || self
                        .state
                        .peers
                        .find_by_uuid(resp.uuid)
                        .map(|p| p.hostname != peer.hostname)
                        .unwrap_or(false);
                if known {
                    ProbeOutcome::AlreadyPeer
                } else {
                    self.state.peers.assign_uuid(&peer.hostname, resp.uuid)?;
                    ProbeOutcome::Success { uuid: resp.uuid }
                }
            }
            Ok(resp) => ProbeOutcome::Rejected(ProbeRejection::from_errno(resp.op_errno)),
            Err(e) => {
                hs.transport_error = Some(e);
                ProbeOutcome::Rejected(ProbeRejection::AddFailed)
            }
        };
        Ok(FriendEvent::ProbeReceived(outcome))
    }

    async fn send_friend_add(&self, hostname: &str, hs: &mut Handshake) -> Result<FriendEvent> {
        let peer = self
            .state
            .peers
            .find(hostname)
            .ok_or_else(|| MgmtError::State(format!("{} vanished during handshake", hostname)))?;
        let request = PeerRequest::FriendAdd {
            uuid: self.state.uuid(),
            hostname: self.hostname().to_string(),
            port: self.state.local.port,
            volumes: self.state.volumes(),
        };
        Ok(match self.sender.send(&peer.hostname, peer.port, request).await {
            Ok(resp) if resp.is_ok() => {
                hs.remote_volumes = resp.volumes;
                FriendEvent::FriendAddAccepted
            }
            Ok(resp) => FriendEvent::FriendAddRejected(ProbeRejection::from_errno(resp.op_errno)),
            Err(_) => FriendEvent::FriendAddRejected(ProbeRejection::AddFailed),
        })
    }

    async fn send_friend_remove(&self, hostname: &str) {
        let Some(peer) = self.state.peers.find(hostname) else {
            return;
        };
        let request = PeerRequest::FriendRemove {
            uuid: self.state.uuid(),
            hostname: self.hostname().to_string(),
        };
        match self.sender.send(&peer.hostname, peer.port, request).await {
            Ok(resp) if resp.is_ok() => {}
            Ok(resp) => warn!(peer = %hostname, error = ?resp.op_errstr, "peer refused removal"),
            Err(e) => warn!(peer = %hostname, error = %e, "peer unreachable, removing anyway"),
        }
    }

    async fn broadcast_friend_update(&self) {
        let peers = self.state.peers.befriended();
        let records: Vec<PeerRecord> = peers.iter().filter_map(Peer::record).collect();
        let sends = peers.into_iter().map(|peer| {
            let request = PeerRequest::FriendUpdate {
                uuid: self.state.uuid(),
                hostname: self.hostname().to_string(),
                peers: records.clone(),
            };
            async move {
                let result = self.sender.send(&peer.hostname, peer.port, request).await;
                (peer.hostname, result)
            }
        });
        for (host, result) in join_all(sends).await {
            match result {
                Ok(resp) if resp.is_ok() => debug!(peer = %host, "friend update delivered"),
                Ok(resp) => warn!(peer = %host, error = ?resp.op_errstr, "friend update refused"),
                Err(e) => warn!(peer = %host, error = %e, "friend update not delivered"),
            }
        }
    }
}

fn probe_reply(reply: ProbeReply, host: &str, port: u16) -> OpReply {
    let message = reply.message(host, port);
    match reply {
        ProbeReply::Rejected(rejection) => OpReply::failure(rejection.errno(), message),
        _ => {
            let mut rsp = ResponseDict::new();
            rsp.insert("output".into(), message);
            OpReply::success(rsp)
        }
    }
}
