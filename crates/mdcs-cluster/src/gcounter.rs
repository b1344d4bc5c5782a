//! Replicated grow-only counter.
//!
//! Every replica keeps one number and merges by taking the maximum, so a
//! replica that missed some increments converges as soon as it sees any
//! newer value. Increments are sent to every replica rather than counted
//! per member, which keeps the state a single integer.

use crate::cluster::{Broadcast, Cluster};
use crate::error::{ClusterError, Result};
use crate::message::{MessageRegistry, Operation, OperationContext, Request};
use crate::replicated::{register_replication, ReplicaSet, Replicated, ReplicatedObject};
use crate::service::{Service, ServiceContext, ServiceKind};
use mdcs_core::max::Max;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;

pub struct GCounterService {
    context: ServiceContext,
    counter: ReplicatedObject<Max<i64>>,
}

impl GCounterService {
    pub fn new(context: ServiceContext, initial: i64) -> Self {
        Self {
            context,
            counter: ReplicatedObject::new(Max::new(initial)),
        }
    }

    /// The local replica's count.
    pub fn value(&self) -> i64 {
        self.counter.value().get()
    }

    pub fn merge(a: i64, b: i64) -> i64 {
        a.max(b)
    }

    /// Merge a value seen elsewhere. Returns whether the count went up.
    pub fn merge_in(&mut self, value: i64) -> bool {
        self.counter.merge_in(Max::new(value))
    }

    fn add(&mut self, amount: i64) {
        self.counter
            .update(|count| count.assign(count.get().saturating_add(amount)));
    }
}

impl Service for GCounterService {
    fn context(&self) -> &ServiceContext {
        &self.context
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl ServiceKind for GCounterService {
    fn kind() -> String {
        "gcounter".to_string()
    }

    fn construct(context: ServiceContext) -> Self {
        Self::new(context, 0)
    }

    fn register_messages(messages: &mut MessageRegistry) {
        messages
            .register_operation::<Self, AddOperation>()
            .register_operation::<Self, SetOperation>()
            .register_request::<Self, ValueRequest>();
        register_replication::<Self>(messages);
    }
}

impl Replicated for GCounterService {
    type Value = Max<i64>;

    fn replica(&self) -> &ReplicatedObject<Max<i64>> {
        &self.counter
    }

    fn replica_mut(&mut self) -> &mut ReplicatedObject<Max<i64>> {
        &mut self.counter
    }
}

/// Add `amount` to each replica.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddOperation {
    amount: i64,
}

impl Operation<GCounterService> for AddOperation {
    fn message_type() -> String {
        "gcounter.add".to_string()
    }

    fn run(self, service: &mut GCounterService) {
        service.add(self.amount);
    }
}

/// Overwrite each replica's count.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetOperation {
    value: i64,
}

impl Operation<GCounterService> for SetOperation {
    fn message_type() -> String {
        "gcounter.set".to_string()
    }

    fn run(self, service: &mut GCounterService) {
        service.counter.update(|count| count.assign(self.value));
    }
}

/// Read one replica's count.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValueRequest;

impl Request<GCounterService> for ValueRequest {
    type Reply = i64;

    fn message_type() -> String {
        "gcounter.value".to_string()
    }

    fn run(self, service: &mut GCounterService, ctx: OperationContext<i64>) {
        ctx.reply(service.value());
    }
}

/// Client side of a replicated counter.
#[derive(Clone, Debug)]
pub struct GCounterHandle {
    replicas: ReplicaSet<GCounterService>,
}

impl GCounterHandle {
    /// Create the counter on its holders and return a handle to it.
    pub async fn create(cluster: Arc<Cluster>, name: impl Into<String>) -> Result<Self> {
        let handle = Self::attach(cluster, name);
        handle.replicas.create().await?;
        Ok(handle)
    }

    /// Address an existing counter.
    pub fn attach(cluster: Arc<Cluster>, name: impl Into<String>) -> Self {
        Self {
            replicas: ReplicaSet::new(cluster, name),
        }
    }

    pub fn from_replicas(replicas: ReplicaSet<GCounterService>) -> Self {
        Self { replicas }
    }

    pub fn replicas(&self) -> &ReplicaSet<GCounterService> {
        &self.replicas
    }

    /// Add a positive amount on every replica.
    pub fn add(&self, amount: i64) -> Result<Broadcast> {
        if amount <= 0 {
            return Err(ClusterError::InvalidArgument(format!(
                "amount must be positive, got {}",
                amount
            )));
        }
        self.replicas.send_to_replicas(AddOperation { amount })
    }

    pub fn increment(&self) -> Result<Broadcast> {
        self.add(1)
    }

    /// Overwrite the count on every replica.
    ///
    /// This is not a join: a replica that already saw a larger count drops
    /// back to `value`, and a later merge with a larger replica raises it
    /// again. Callers must not rely on reads being monotonic across a `set`.
    pub fn set(&self, value: i64) -> Result<Broadcast> {
        if value <= 0 {
            return Err(ClusterError::InvalidArgument(format!(
                "value must be positive, got {}",
                value
            )));
        }
        self.replicas.send_to_replicas(SetOperation { value })
    }

    /// The largest count any responding replica reports.
    pub async fn value(&self) -> Result<i64> {
        self.replicas
            .ask_replicas(ValueRequest)?
            .reduce(GCounterService::merge)
            .await
    }

    /// The count held by this member's replica.
    pub fn local_value(&self) -> Result<i64> {
        Ok(self.replicas.local_value()?.get())
    }
}
