//! Transport abstraction for delivering envelopes between members.

use crate::cluster::Cluster;
use crate::config::ClusterConfig;
use crate::error::Result;
use crate::member::{Member, MemberId};
use crate::message::Envelope;
use crate::service::Registry;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{debug, trace};

/// Delivery failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Member unreachable: {0}")]
    Unreachable(MemberId),

    #[error("Timed out waiting for {0}")]
    TimedOut(MemberId),

    #[error("Remote failure: {0}")]
    Remote(String),
}

/// Moves envelopes to other members.
///
/// `send` is fire-and-forget from the caller's point of view: it resolves
/// once the envelope has been handed to the target. `send_and_await`
/// resolves with the encoded reply.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, target: &MemberId, envelope: Envelope) -> std::result::Result<(), TransportError>;

    async fn send_and_await(
        &self,
        target: &MemberId,
        envelope: Envelope,
    ) -> std::result::Result<Vec<u8>, TransportError>;
}

/// Delivery counters for a [`MemoryNetwork`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub operations: u64,
    pub requests: u64,
    pub dropped: u64,
}

/// Type alias for the member directory shared by every transport.
type SharedNodes = RwLock<HashMap<MemberId, Weak<Cluster>>>;

/// In-process network connecting clusters, for tests and simulation.
///
/// Members can be isolated (every envelope to or from them is dropped) or
/// stalled (operations still arrive, requests never answer).
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: SharedNodes,
    isolated: RwLock<HashSet<MemberId>>,
    stalled: RwLock<HashSet<MemberId>>,
    operations: AtomicU64,
    requests: AtomicU64,
    dropped: AtomicU64,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport sending on behalf of `local`.
    pub fn transport(self: &Arc<Self>, local: MemberId) -> MemoryTransport {
        MemoryTransport {
            local,
            network: Arc::clone(self),
        }
    }

    /// Start a cluster for `member` and attach it to the network.
    pub fn spawn_member(
        self: &Arc<Self>,
        member: Member,
        config: ClusterConfig,
        registry: Arc<Registry>,
    ) -> Result<Arc<Cluster>> {
        let transport = Arc::new(self.transport(member.id().clone()));
        let cluster = Cluster::new(member.clone(), config, registry, transport)?;
        self.nodes
            .write()
            .insert(member.id().clone(), Arc::downgrade(&cluster));
        debug!(member = %member, "member attached to memory network");
        Ok(cluster)
    }

    /// Start `count` fully meshed members named `member-0..count`.
    pub fn spawn_cluster(
        self: &Arc<Self>,
        count: usize,
        config: ClusterConfig,
        registry: Arc<Registry>,
    ) -> Result<Vec<Arc<Cluster>>> {
        let members: Vec<Member> = (0..count)
            .map(|i| {
                let id = format!("member-{}", i);
                Member::new(MemberId::new(id.clone()), format!("memory://{}", id))
            })
            .collect();

        let clusters = members
            .iter()
            .map(|member| self.spawn_member(member.clone(), config.clone(), Arc::clone(&registry)))
            .collect::<Result<Vec<_>>>()?;

        for cluster in &clusters {
            for member in &members {
                cluster.add_member(member.clone());
            }
        }
        Ok(clusters)
    }

    /// Cut a member off from everyone else.
    pub fn isolate(&self, id: &MemberId) {
        self.isolated.write().insert(id.clone());
    }

    /// Undo [`isolate`](Self::isolate) and [`stall`](Self::stall).
    pub fn heal(&self, id: &MemberId) {
        self.isolated.write().remove(id);
        self.stalled.write().remove(id);
    }

    /// Make a member accept requests but never answer them.
    pub fn stall(&self, id: &MemberId) {
        self.stalled.write().insert(id.clone());
    }

    pub fn is_isolated(&self, id: &MemberId) -> bool {
        self.isolated.read().contains(id)
    }

    pub fn is_stalled(&self, id: &MemberId) -> bool {
        self.stalled.read().contains(id)
    }

    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            operations: self.operations.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn route(&self, from: &MemberId, to: &MemberId) -> std::result::Result<Arc<Cluster>, TransportError> {
        if self.is_isolated(from) || self.is_isolated(to) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(%from, %to, "envelope dropped at partition");
            return Err(TransportError::Unreachable(to.clone()));
        }
        self.nodes
            .read()
            .get(to)
            .and_then(Weak::upgrade)
            .ok_or_else(|| {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                TransportError::Unreachable(to.clone())
            })
    }
}

/// One member's endpoint on a [`MemoryNetwork`].
pub struct MemoryTransport {
    local: MemberId,
    network: Arc<MemoryNetwork>,
}

impl MemoryTransport {
    pub fn local_id(&self) -> &MemberId {
        &self.local
    }

    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, target: &MemberId, envelope: Envelope) -> std::result::Result<(), TransportError> {
        let cluster = self.network.route(&self.local, target)?;
        self.network.operations.fetch_add(1, Ordering::Relaxed);
        cluster
            .dispatch_operation(&envelope)
            .map_err(|e| TransportError::Remote(e.to_string()))
    }

    async fn send_and_await(
        &self,
        target: &MemberId,
        envelope: Envelope,
    ) -> std::result::Result<Vec<u8>, TransportError> {
        let cluster = self.network.route(&self.local, target)?;
        self.network.requests.fetch_add(1, Ordering::Relaxed);
        if self.network.is_stalled(target) {
            trace!(%target, "request swallowed by stalled member");
            futures::future::pending::<()>().await;
        }
        cluster
            .dispatch_request(&envelope)
            .await
            .map_err(|e| TransportError::Remote(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MEMBERSHIP_SERVICE;
    use crate::heartbeat::{HeartbeatOperation, MembershipService};

    fn heartbeat_from(member: &Member) -> Envelope {
        Envelope::operation::<MembershipService, _>(
            MEMBERSHIP_SERVICE,
            &HeartbeatOperation::new(Some(member.clone()), false),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_spawn_cluster_is_fully_meshed() {
        let network = MemoryNetwork::new();
        let clusters = network
            .spawn_cluster(3, ClusterConfig::default(), Arc::new(Registry::new()))
            .unwrap();

        for cluster in &clusters {
            assert_eq!(cluster.members().len(), 3);
        }
    }

    #[tokio::test]
    async fn test_send_counts_deliveries() {
        let network = MemoryNetwork::new();
        let clusters = network
            .spawn_cluster(2, ClusterConfig::default(), Arc::new(Registry::new()))
            .unwrap();
        let sender = clusters[0].local_member().clone();
        let target = clusters[1].local_member().id().clone();

        clusters[0]
            .transport()
            .send(&target, heartbeat_from(&sender))
            .await
            .unwrap();

        assert_eq!(network.stats().operations, 1);
        assert_eq!(network.stats().dropped, 0);
    }

    #[tokio::test]
    async fn test_isolation_drops_and_heal_restores() {
        let network = MemoryNetwork::new();
        let clusters = network
            .spawn_cluster(2, ClusterConfig::default(), Arc::new(Registry::new()))
            .unwrap();
        let sender = clusters[0].local_member().clone();
        let target = clusters[1].local_member().id().clone();

        network.isolate(&target);
        let result = clusters[0].transport().send(&target, heartbeat_from(&sender)).await;
        assert_eq!(result, Err(TransportError::Unreachable(target.clone())));
        assert_eq!(network.stats().dropped, 1);

        network.heal(&target);
        assert!(clusters[0]
            .transport()
            .send(&target, heartbeat_from(&sender))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_dropped_cluster_is_unreachable() {
        let network = MemoryNetwork::new();
        let mut clusters = network
            .spawn_cluster(2, ClusterConfig::default(), Arc::new(Registry::new()))
            .unwrap();
        let gone = clusters.pop().unwrap();
        let gone_id = gone.local_member().id().clone();
        drop(gone);

        let sender = clusters[0].local_member().clone();
        let result = clusters[0].transport().send(&gone_id, heartbeat_from(&sender)).await;
        assert!(matches!(result, Err(TransportError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_remote_failure_is_reported() {
        let network = MemoryNetwork::new();
        let clusters = network
            .spawn_cluster(2, ClusterConfig::default(), Arc::new(Registry::new()))
            .unwrap();
        let target = clusters[1].local_member().id().clone();
        let envelope = Envelope {
            service: "ghost".to_string(),
            message_type: "cluster.heartbeat".to_string(),
            payload: b"{}".to_vec(),
        };

        let result = clusters[0].transport().send(&target, envelope).await;
        assert!(matches!(result, Err(TransportError::Remote(_))));
    }
}
