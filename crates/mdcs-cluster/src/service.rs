//! Hosted services, their construction context and the kind registry.

use crate::cluster::Cluster;
use crate::error::{ClusterError, Result};
use crate::heartbeat::MembershipService;
use crate::message::MessageRegistry;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// A stateful object hosted by a [`Cluster`] and driven by messages.
///
/// Services are owned by the cluster that admitted them; messages reach them
/// one at a time through the cluster's dispatcher.
pub trait Service: Any + Send {
    /// The context bound at construction.
    fn context(&self) -> &ServiceContext;

    /// Downcasting hook used by the message registry.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A service type that can be registered by kind and constructed remotely.
pub trait ServiceKind: Service + Sized {
    /// Stable kind identifier, shared by every member.
    fn kind() -> String;

    /// Build a fresh instance for the given slot.
    fn construct(context: ServiceContext) -> Self;

    /// Register every operation and request this service accepts.
    fn register_messages(messages: &mut MessageRegistry);
}

/// Immutable handle bound when a service is constructed.
#[derive(Clone, Debug)]
pub struct ServiceContext {
    cluster: Weak<Cluster>,
    index: usize,
    name: String,
}

impl ServiceContext {
    pub(crate) fn new(cluster: Weak<Cluster>, index: usize, name: impl Into<String>) -> Self {
        Self {
            cluster,
            index,
            name: name.into(),
        }
    }

    /// A context that belongs to no cluster, for driving a service by hand.
    pub fn detached(name: impl Into<String>) -> Self {
        Self::new(Weak::new(), 0, name)
    }

    /// The owning cluster, if it is still alive.
    pub fn cluster(&self) -> Result<Arc<Cluster>> {
        self.cluster.upgrade().ok_or(ClusterError::ClusterShutDown)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Factory closure invoked on admission.
pub type ServiceConstructor = Arc<dyn Fn(ServiceContext) -> Box<dyn Service> + Send + Sync>;

/// Explicit registry of service kinds and the messages they accept.
///
/// Built once at startup and shared by the clusters that use it.
pub struct Registry {
    constructors: HashMap<String, ServiceConstructor>,
    messages: MessageRegistry,
}

impl Registry {
    /// Create a registry holding the built-in membership service.
    pub fn new() -> Self {
        let mut registry = Self {
            constructors: HashMap::new(),
            messages: MessageRegistry::new(),
        };
        registry.register::<MembershipService>();
        registry
    }

    /// Register a service kind together with its messages.
    pub fn register<S: ServiceKind>(&mut self) -> &mut Self {
        let constructor: ServiceConstructor =
            Arc::new(|context: ServiceContext| -> Box<dyn Service> { Box::new(S::construct(context)) });
        self.constructors.insert(S::kind(), constructor);
        S::register_messages(&mut self.messages);
        self
    }

    pub fn constructor(&self, kind: &str) -> Result<ServiceConstructor> {
        self.constructors
            .get(kind)
            .cloned()
            .ok_or_else(|| ClusterError::UnknownServiceKind(kind.to_string()))
    }

    pub fn messages(&self) -> &MessageRegistry {
        &self.messages
    }

    /// All registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.constructors.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("kinds", &self.kinds())
            .field("messages", &self.messages.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gcounter::GCounterService;

    #[test]
    fn test_new_registry_knows_membership() {
        let registry = Registry::new();
        assert!(registry.constructor(&MembershipService::kind()).is_ok());
        assert!(!registry.messages().is_empty());
    }

    #[test]
    fn test_unknown_kind() {
        let registry = Registry::new();
        assert!(matches!(
            registry.constructor("nope"),
            Err(ClusterError::UnknownServiceKind(kind)) if kind == "nope"
        ));
    }

    #[test]
    fn test_register_adds_constructor_and_messages() {
        let mut registry = Registry::new();
        let before = registry.messages().len();
        registry.register::<GCounterService>();

        assert!(registry.kinds().contains(&GCounterService::kind()));
        assert!(registry.messages().len() > before);

        let constructor = registry.constructor(&GCounterService::kind()).unwrap();
        let service = constructor(ServiceContext::detached("hits"));
        assert_eq!(service.context().name(), "hits");
    }

    #[test]
    fn test_detached_context_has_no_cluster() {
        let context = ServiceContext::detached("orphan");
        assert!(matches!(context.cluster(), Err(ClusterError::ClusterShutDown)));
        assert_eq!(context.index(), 0);
    }
}
