//! Generic replication engine.
//!
//! [`ReplicatedObject`] is the per-member replica state of a service.
//! [`ReplicaSet`] is how a caller reaches every replica of a named
//! service: operations are fired at all holders without waiting, requests
//! fan out and come back as [`PendingReplies`] to be reduced. Anti-entropy
//! ([`MergeOperation`], [`SnapshotRequest`]) exchanges whole replica values
//! and relies on the merge being a lattice join.

use crate::admission::AddServiceRequest;
use crate::cluster::{Broadcast, Cluster, MEMBERSHIP_SERVICE};
use crate::error::{ClusterError, Result};
use crate::heartbeat::MembershipService;
use crate::member::Member;
use crate::message::{decode, Envelope, MessageRegistry, Operation, OperationContext, Request};
use crate::service::ServiceKind;
use crate::transport::TransportError;
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use mdcs_core::lattice::Lattice;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// User-supplied merge function.
pub type MergeFn<V> = Arc<dyn Fn(V, V) -> V + Send + Sync>;

/// Local replica value together with its merge function.
pub struct ReplicatedObject<V> {
    value: V,
    merge: MergeFn<V>,
}

impl<V: Lattice + Send + 'static> ReplicatedObject<V> {
    /// Replica merged with the lattice join.
    pub fn new(initial: V) -> Self {
        Self::with_merge(initial, V::join)
    }

    /// Replica merged with a custom function, which must agree with `leq`.
    pub fn with_merge(initial: V, merge: impl Fn(V, V) -> V + Send + Sync + 'static) -> Self {
        Self {
            value: initial,
            merge: Arc::new(merge),
        }
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    /// Mutate the local value in place.
    pub fn update<R>(&mut self, f: impl FnOnce(&mut V) -> R) -> R {
        f(&mut self.value)
    }

    pub fn merge(&self, a: V, b: V) -> V {
        (self.merge)(a, b)
    }

    /// Fold `incoming` into the local value. Returns whether it changed.
    pub fn merge_in(&mut self, incoming: V) -> bool {
        if incoming.leq(&self.value) {
            return false;
        }
        let current = std::mem::replace(&mut self.value, V::bottom());
        self.value = (self.merge)(current, incoming);
        true
    }
}

impl<V: fmt::Debug> fmt::Debug for ReplicatedObject<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedObject")
            .field("value", &self.value)
            .finish_non_exhaustive()
    }
}

/// A service whose state is a single replicated lattice value.
pub trait Replicated: ServiceKind {
    type Value: Lattice + Clone + Serialize + DeserializeOwned + Send + 'static;

    fn replica(&self) -> &ReplicatedObject<Self::Value>;

    fn replica_mut(&mut self) -> &mut ReplicatedObject<Self::Value>;
}

/// Register the anti-entropy messages of `S`.
pub fn register_replication<S: Replicated>(messages: &mut MessageRegistry) {
    messages
        .register_operation::<S, MergeOperation<S>>()
        .register_request::<S, SnapshotRequest<S>>();
}

/// Carries a replica value to be merged into the receiver.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct MergeOperation<S: Replicated> {
    value: S::Value,
    #[serde(skip)]
    _service: PhantomData<fn() -> S>,
}

impl<S: Replicated> MergeOperation<S> {
    pub fn new(value: S::Value) -> Self {
        Self {
            value,
            _service: PhantomData,
        }
    }
}

impl<S: Replicated> Operation<S> for MergeOperation<S> {
    fn message_type() -> String {
        format!("{}.merge", S::kind())
    }

    fn run(self, service: &mut S) {
        let changed = service.replica_mut().merge_in(self.value);
        trace!(service = %service.context().name(), changed, "merged replica state");
    }
}

/// Asks a replica for its current value.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct SnapshotRequest<S: Replicated> {
    #[serde(skip)]
    _service: PhantomData<fn() -> S>,
}

impl<S: Replicated> SnapshotRequest<S> {
    pub fn new() -> Self {
        Self { _service: PhantomData }
    }
}

impl<S: Replicated> Default for SnapshotRequest<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Replicated> Request<S> for SnapshotRequest<S> {
    type Reply = S::Value;

    fn message_type() -> String {
        format!("{}.snapshot", S::kind())
    }

    fn run(self, service: &mut S, ctx: OperationContext<S::Value>) {
        ctx.reply(service.replica().value().clone());
    }
}

/// Replies still arriving from a request fan-out.
///
/// Each reply is bounded by the cluster's request timeout; replicas that
/// fail or time out are left out of the results.
pub struct PendingReplies<R> {
    service: String,
    replies: Vec<(Member, JoinHandle<Result<R>>)>,
}

impl<R: Send + 'static> PendingReplies<R> {
    /// Number of replicas the request was sent to.
    pub fn dispatched(&self) -> usize {
        self.replies.len()
    }

    /// Successful replies paired with the member that sent them, in arrival order.
    pub fn into_member_stream(self) -> impl Stream<Item = (Member, R)> {
        let service = self.service;
        self.replies
            .into_iter()
            .map(|(member, handle)| async move { (member, handle.await) })
            .collect::<FuturesUnordered<_>>()
            .filter_map(move |(member, joined)| {
                let service = service.clone();
                async move {
                    match joined {
                        Ok(Ok(reply)) => Some((member, reply)),
                        Ok(Err(err)) => {
                            debug!(%service, member = %member.id(), %err, "replica did not answer");
                            None
                        }
                        Err(err) => {
                            warn!(%service, member = %member.id(), %err, "reply task failed");
                            None
                        }
                    }
                }
            })
    }

    /// Successful replies, in arrival order.
    pub fn into_stream(self) -> impl Stream<Item = R> {
        self.into_member_stream().map(|(_, reply)| reply)
    }

    pub async fn collect(self) -> Vec<R> {
        self.into_stream().collect().await
    }

    pub async fn collect_by_member(self) -> Vec<(Member, R)> {
        self.into_member_stream().collect().await
    }

    /// Fold every reply with `f`. Fails if no replica answered.
    pub async fn reduce(self, f: impl FnMut(R, R) -> R) -> Result<R> {
        let service = self.service.clone();
        self.collect()
            .await
            .into_iter()
            .reduce(f)
            .ok_or(ClusterError::NoReplicasResponded(service))
    }
}

impl<R> fmt::Debug for PendingReplies<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReplies")
            .field("service", &self.service)
            .field("dispatched", &self.replies.len())
            .finish()
    }
}

/// Outcome of one anti-entropy round.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AntiEntropyReport {
    /// Whether pulling changed the local value.
    pub pulled: bool,
    /// Holders that were sent the merged value.
    pub pushed: usize,
}

/// Dispatch capability for every replica of one named service.
pub struct ReplicaSet<S> {
    cluster: Arc<Cluster>,
    name: String,
    replication_factor: usize,
    _service: PhantomData<fn() -> S>,
}

impl<S> Clone for ReplicaSet<S> {
    fn clone(&self) -> Self {
        Self {
            cluster: Arc::clone(&self.cluster),
            name: self.name.clone(),
            replication_factor: self.replication_factor,
            _service: PhantomData,
        }
    }
}

impl<S> fmt::Debug for ReplicaSet<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaSet")
            .field("name", &self.name)
            .field("replication_factor", &self.replication_factor)
            .finish()
    }
}

impl<S: ServiceKind> ReplicaSet<S> {
    /// Address `name` with the cluster's configured replication factor.
    pub fn new(cluster: Arc<Cluster>, name: impl Into<String>) -> Self {
        let replication_factor = cluster.config().replication_factor;
        Self {
            cluster,
            name: name.into(),
            replication_factor,
            _service: PhantomData,
        }
    }

    pub fn with_replication_factor(mut self, replication_factor: usize) -> Result<Self> {
        if replication_factor == 0 {
            return Err(ClusterError::InvalidArgument(
                "replication factor must be at least 1".to_string(),
            ));
        }
        self.replication_factor = replication_factor;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Members holding a replica, by the cluster's placement policy.
    pub fn holders(&self) -> Vec<Member> {
        self.cluster.replica_holders(&self.name, self.replication_factor)
    }

    pub fn is_local_replica(&self) -> bool {
        self.holders().contains(self.cluster.local_member())
    }

    /// Admit the service on every holder. Returns how many created a new instance.
    pub async fn create(&self) -> Result<usize> {
        let request = AddServiceRequest::new(self.name.clone(), S::kind());
        let envelope = Envelope::request::<MembershipService, _>(MEMBERSHIP_SERVICE, &request)?;
        let created: Vec<bool> = self.ask_members(&self.holders(), envelope).collect().await;
        if created.is_empty() {
            return Err(ClusterError::NoReplicasResponded(self.name.clone()));
        }
        let fresh = created.into_iter().filter(|created| *created).count();
        debug!(service = %self.name, kind = %S::kind(), fresh, "replicas created");
        Ok(fresh)
    }

    /// Fire `operation` at every holder without waiting.
    pub fn send_to_replicas<O: Operation<S>>(&self, operation: O) -> Result<Broadcast> {
        let envelope = Envelope::operation::<S, O>(self.name.clone(), &operation)?;
        let holders = self.holders();
        trace!(service = %self.name, message_type = %envelope.message_type, replicas = holders.len(), "send to replicas");
        Ok(self.cluster.broadcast(&holders, envelope))
    }

    /// Send `request` to every holder and return the pending replies.
    pub fn ask_replicas<Q: Request<S>>(&self, request: Q) -> Result<PendingReplies<Q::Reply>> {
        let envelope = Envelope::request::<S, Q>(self.name.clone(), &request)?;
        let holders = self.holders();
        trace!(service = %self.name, message_type = %envelope.message_type, replicas = holders.len(), "ask replicas");
        Ok(self.ask_members(&holders, envelope))
    }

    fn ask_members<R>(&self, members: &[Member], envelope: Envelope) -> PendingReplies<R>
    where
        R: DeserializeOwned + Send + 'static,
    {
        let timeout = self.cluster.config().request_timeout();
        let replies = members
            .iter()
            .map(|member| {
                let cluster = Arc::clone(&self.cluster);
                let target = member.id().clone();
                let envelope = envelope.clone();
                let handle = tokio::spawn(async move {
                    match tokio::time::timeout(timeout, cluster.ask(&target, envelope)).await {
                        Ok(reply) => decode::<R>(&reply?),
                        Err(_) => Err(TransportError::TimedOut(target).into()),
                    }
                });
                (member.clone(), handle)
            })
            .collect();

        PendingReplies {
            service: self.name.clone(),
            replies,
        }
    }
}

impl<S: Replicated> ReplicaSet<S> {
    /// The local replica's value, if this member hosts one.
    pub fn local_value(&self) -> Result<S::Value> {
        self.cluster
            .with_service::<S, _>(&self.name, |service| service.replica().value().clone())
    }

    /// Send the local value to every other holder.
    pub fn push_state(&self) -> Result<Broadcast> {
        let value = self.local_value()?;
        let local = self.cluster.local_member();
        let peers: Vec<Member> = self.holders().into_iter().filter(|m| m != local).collect();
        self.push_to(&peers, value)
    }

    /// Merge every holder's value into the local replica. Returns whether it changed.
    pub async fn pull_state(&self) -> Result<bool> {
        let snapshots = self.ask_replicas(SnapshotRequest::<S>::new())?.collect().await;
        self.merge_local(snapshots)
    }

    /// Pull from every holder, then push the merged value to those behind it.
    pub async fn anti_entropy(&self) -> Result<AntiEntropyReport> {
        let local = self.cluster.local_member().clone();
        let snapshots: Vec<(Member, S::Value)> = self
            .ask_replicas(SnapshotRequest::<S>::new())?
            .collect_by_member()
            .await
            .into_iter()
            .filter(|(member, _)| *member != local)
            .collect();

        let pulled = self.merge_local(snapshots.iter().map(|(_, value)| value.clone()))?;
        let merged = self.local_value()?;
        let stale: Vec<Member> = snapshots
            .into_iter()
            .filter(|(_, value)| !merged.leq(value))
            .map(|(member, _)| member)
            .collect();

        let pushed = stale.len();
        if pushed > 0 {
            self.push_to(&stale, merged)?;
        }
        debug!(service = %self.name, pulled, pushed, "anti-entropy round");
        Ok(AntiEntropyReport { pulled, pushed })
    }

    /// Run an anti-entropy round every `interval` until the handle is aborted.
    pub fn spawn_anti_entropy(&self, interval: Duration) -> JoinHandle<()> {
        let replicas = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = replicas.anti_entropy().await {
                    debug!(service = %replicas.name, %err, "anti-entropy round failed");
                }
            }
        })
    }

    fn merge_local(&self, values: impl IntoIterator<Item = S::Value>) -> Result<bool> {
        self.cluster.with_service::<S, _>(&self.name, |service| {
            values
                .into_iter()
                .fold(false, |changed, value| service.replica_mut().merge_in(value) | changed)
        })
    }

    fn push_to(&self, members: &[Member], value: S::Value) -> Result<Broadcast> {
        let envelope = Envelope::operation::<S, _>(self.name.clone(), &MergeOperation::<S>::new(value))?;
        Ok(self.cluster.broadcast(members, envelope))
    }
}
