//! Service admission through the membership service.

use crate::heartbeat::MembershipService;
use crate::message::{OperationContext, Request};
use crate::service::Service;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Ask a member to host a service of `kind`.
///
/// Replies `true` when a new instance was created and `false` when the
/// final name was already taken or construction failed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddServiceRequest {
    final_name: String,
    name: String,
    kind: String,
}

impl AddServiceRequest {
    /// Register under `name`, which is also the context name.
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            final_name: name.clone(),
            name,
            kind: kind.into(),
        }
    }

    /// Register under `final_name` while the service sees `name` in its context.
    pub fn with_final_name(mut self, final_name: impl Into<String>) -> Self {
        self.final_name = final_name.into();
        self
    }

    pub fn final_name(&self) -> &str {
        &self.final_name
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }
}

impl Request<MembershipService> for AddServiceRequest {
    type Reply = bool;

    fn message_type() -> String {
        "cluster.add_service".to_string()
    }

    fn run(self, service: &mut MembershipService, ctx: OperationContext<bool>) {
        let created = service
            .context()
            .cluster()
            .and_then(|cluster| cluster.admit(&self.final_name, &self.name, &self.kind));

        match created {
            Ok(created) => ctx.reply(created),
            Err(err) => {
                warn!(service = %self.final_name, kind = %self.kind, %err, "service admission failed");
                ctx.reply(false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MEMBERSHIP_SERVICE;
    use crate::config::ClusterConfig;
    use crate::gcounter::GCounterService;
    use crate::service::{Registry, ServiceKind};
    use crate::transport::MemoryNetwork;
    use std::sync::Arc;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_second_admission_replies_false() {
        let mut registry = Registry::new();
        registry.register::<GCounterService>();
        let clusters = MemoryNetwork::new()
            .spawn_cluster(1, ClusterConfig::default(), Arc::new(registry))
            .unwrap();
        let cluster = &clusters[0];

        assert!(assert_ok!(cluster.add_service("hits", &GCounterService::kind()).await));
        assert!(!assert_ok!(cluster.add_service("hits", &GCounterService::kind()).await));
        assert_eq!(cluster.service_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_kind_replies_false() {
        let clusters = MemoryNetwork::new()
            .spawn_cluster(1, ClusterConfig::default(), Arc::new(Registry::new()))
            .unwrap();

        let created = clusters[0]
            .request::<MembershipService, _>(MEMBERSHIP_SERVICE, AddServiceRequest::new("x", "missing"))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(clusters[0].service_count(), 1);
    }

    #[tokio::test]
    async fn test_final_name_override() {
        let mut registry = Registry::new();
        registry.register::<GCounterService>();
        let clusters = MemoryNetwork::new()
            .spawn_cluster(1, ClusterConfig::default(), Arc::new(registry))
            .unwrap();

        let request = AddServiceRequest::new("hits", GCounterService::kind()).with_final_name("tenant/hits");
        assert_eq!(request.final_name(), "tenant/hits");
        assert_eq!(request.name(), "hits");

        let created = clusters[0]
            .request::<MembershipService, _>(MEMBERSHIP_SERVICE, request)
            .await
            .unwrap();
        assert!(created);
        assert!(clusters[0].get_service("tenant/hits").is_some());
    }
}
