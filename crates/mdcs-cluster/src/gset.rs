//! Replicated grow-only set.

use crate::cluster::{Broadcast, Cluster};
use crate::error::Result;
use crate::message::{MessageRegistry, Operation, OperationContext, Request};
use crate::replicated::{register_replication, ReplicaSet, Replicated, ReplicatedObject};
use crate::service::{Service, ServiceContext, ServiceKind};
use mdcs_core::gset::GSet;
use mdcs_core::lattice::Lattice;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

/// Element types a replicated set can hold.
///
/// The tag is part of the service kind and message types, so every member
/// must use the same tag for the same element type.
pub trait SetElement: Eq + Hash + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE_TAG: &'static str;
}

impl SetElement for String {
    const TYPE_TAG: &'static str = "string";
}

impl SetElement for u64 {
    const TYPE_TAG: &'static str = "u64";
}

impl SetElement for i64 {
    const TYPE_TAG: &'static str = "i64";
}

impl SetElement for u32 {
    const TYPE_TAG: &'static str = "u32";
}

impl SetElement for i32 {
    const TYPE_TAG: &'static str = "i32";
}

pub struct GSetService<T: SetElement> {
    context: ServiceContext,
    set: ReplicatedObject<GSet<T>>,
}

impl<T: SetElement> GSetService<T> {
    pub fn new(context: ServiceContext, initial: GSet<T>) -> Self {
        Self {
            context,
            set: ReplicatedObject::new(initial),
        }
    }

    pub fn value(&self) -> &GSet<T> {
        self.set.value()
    }

    pub fn size(&self) -> usize {
        self.set.value().len()
    }

    pub fn contains(&self, entry: &T) -> bool {
        self.set.value().contains(entry)
    }

    pub fn merge(a: GSet<T>, b: GSet<T>) -> GSet<T> {
        a.join(b)
    }

    /// Union `incoming` into the local replica. Returns whether it grew.
    pub fn merge_in(&mut self, incoming: GSet<T>) -> bool {
        self.set.merge_in(incoming)
    }
}

impl<T: SetElement> Service for GSetService<T> {
    fn context(&self) -> &ServiceContext {
        &self.context
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl<T: SetElement> ServiceKind for GSetService<T> {
    fn kind() -> String {
        format!("gset<{}>", T::TYPE_TAG)
    }

    fn construct(context: ServiceContext) -> Self {
        Self::new(context, GSet::new())
    }

    fn register_messages(messages: &mut MessageRegistry) {
        messages
            .register_operation::<Self, AddEntry<T>>()
            .register_request::<Self, SizeRequest<T>>()
            .register_request::<Self, ContainsRequest<T>>();
        register_replication::<Self>(messages);
    }
}

impl<T: SetElement> Replicated for GSetService<T> {
    type Value = GSet<T>;

    fn replica(&self) -> &ReplicatedObject<GSet<T>> {
        &self.set
    }

    fn replica_mut(&mut self) -> &mut ReplicatedObject<GSet<T>> {
        &mut self.set
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct AddEntry<T: SetElement> {
    entry: T,
}

impl<T: SetElement> Operation<GSetService<T>> for AddEntry<T> {
    fn message_type() -> String {
        format!("gset<{}>.add", T::TYPE_TAG)
    }

    fn run(self, service: &mut GSetService<T>) {
        service.set.update(|set| set.insert(self.entry));
    }
}

#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct SizeRequest<T: SetElement> {
    #[serde(skip)]
    _element: PhantomData<fn() -> T>,
}

impl<T: SetElement> Request<GSetService<T>> for SizeRequest<T> {
    type Reply = usize;

    fn message_type() -> String {
        format!("gset<{}>.size", T::TYPE_TAG)
    }

    fn run(self, service: &mut GSetService<T>, ctx: OperationContext<usize>) {
        ctx.reply(service.size());
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct ContainsRequest<T: SetElement> {
    entry: T,
}

impl<T: SetElement> Request<GSetService<T>> for ContainsRequest<T> {
    type Reply = bool;

    fn message_type() -> String {
        format!("gset<{}>.contains", T::TYPE_TAG)
    }

    fn run(self, service: &mut GSetService<T>, ctx: OperationContext<bool>) {
        ctx.reply(service.contains(&self.entry));
    }
}

/// Client side of a replicated set.
pub struct GSetHandle<T: SetElement> {
    replicas: ReplicaSet<GSetService<T>>,
}

impl<T: SetElement> Clone for GSetHandle<T> {
    fn clone(&self) -> Self {
        Self {
            replicas: self.replicas.clone(),
        }
    }
}

impl<T: SetElement> GSetHandle<T> {
    pub async fn create(cluster: Arc<Cluster>, name: impl Into<String>) -> Result<Self> {
        let handle = Self::attach(cluster, name);
        handle.replicas.create().await?;
        Ok(handle)
    }

    pub fn attach(cluster: Arc<Cluster>, name: impl Into<String>) -> Self {
        Self {
            replicas: ReplicaSet::new(cluster, name),
        }
    }

    pub fn from_replicas(replicas: ReplicaSet<GSetService<T>>) -> Self {
        Self { replicas }
    }

    pub fn replicas(&self) -> &ReplicaSet<GSetService<T>> {
        &self.replicas
    }

    pub fn add(&self, entry: T) -> Result<Broadcast> {
        self.replicas.send_to_replicas(AddEntry { entry })
    }

    /// The largest size any responding replica reports.
    pub async fn size(&self) -> Result<usize> {
        let request = SizeRequest {
            _element: PhantomData,
        };
        self.replicas.ask_replicas(request)?.reduce(usize::max).await
    }

    /// Whether any responding replica holds `entry`.
    pub async fn contains(&self, entry: &T) -> Result<bool> {
        let request = ContainsRequest { entry: entry.clone() };
        self.replicas.ask_replicas(request)?.reduce(|a, b| a || b).await
    }

    pub fn local_size(&self) -> Result<usize> {
        Ok(self.replicas.local_value()?.len())
    }

    pub fn local_contains(&self, entry: &T) -> Result<bool> {
        Ok(self.replicas.local_value()?.contains(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set() -> GSetService<String> {
        GSetService::new(ServiceContext::detached("tags"), GSet::new())
    }

    #[test]
    fn test_kind_and_messages_carry_element_tag() {
        assert_eq!(GSetService::<String>::kind(), "gset<string>");
        assert_eq!(<AddEntry<u64> as Operation<GSetService<u64>>>::message_type(), "gset<u64>.add");
        assert_ne!(GSetService::<u32>::kind(), GSetService::<i32>::kind());
    }

    #[test]
    fn test_add_entry_is_idempotent() {
        let mut service = set();
        AddEntry { entry: "a".to_string() }.run(&mut service);
        AddEntry { entry: "a".to_string() }.run(&mut service);
        AddEntry { entry: "b".to_string() }.run(&mut service);

        assert_eq!(service.size(), 2);
        assert!(service.contains(&"a".to_string()));
        assert!(!service.contains(&"c".to_string()));
    }

    #[test]
    fn test_merge_in_is_union() {
        let mut service = set();
        AddEntry { entry: "a".to_string() }.run(&mut service);

        assert!(service.merge_in(GSet::from_iter(["b".to_string()])));
        assert!(!service.merge_in(GSet::from_iter(["a".to_string()])));
        assert_eq!(service.size(), 2);
    }

    #[test]
    fn test_registry_accepts_several_element_types() {
        let mut registry = crate::service::Registry::new();
        registry
            .register::<GSetService<String>>()
            .register::<GSetService<u64>>();

        assert!(registry.messages().contains("gset<string>.size"));
        assert!(registry.messages().contains("gset<u64>.size"));
        assert!(registry.messages().contains("gset<u64>.merge"));
    }
}
