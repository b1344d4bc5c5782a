//! MDCS Cluster - replicated services on a membership-aware cluster
//!
//! Each process runs one [`Cluster`] per member. A cluster hosts named
//! services, delivers typed messages to them one at a time, tracks the
//! recognized master through heartbeats, and lets callers reach every
//! replica of a service through a [`ReplicaSet`]. Replica state is a
//! join-semilattice value from `mdcs-core`, so replicas converge no matter
//! how often or in which order they exchange it.
//!
//! # Quick Start
//!
//! ```rust
//! use mdcs_cluster::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ClusterError> {
//!     // Every member must know the same service kinds
//!     let mut registry = Registry::new();
//!     registry.register::<GCounterService>();
//!
//!     // Three fully meshed members in one process
//!     let network = MemoryNetwork::new();
//!     let clusters = network.spawn_cluster(3, ClusterConfig::default(), Arc::new(registry))?;
//!
//!     // Create a counter on its replica holders and bump it
//!     let hits = GCounterHandle::create(clusters[0].clone(), "hits").await?;
//!     hits.add(5)?.delivered().await;
//!
//!     assert_eq!(hits.value().await?, 5);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - [`cluster`] - members, service slots, master tracking and dispatch
//! - [`service`] - the service traits, construction context and kind registry
//! - [`message`] - operations, requests, envelopes and the message registry
//! - [`admission`] - idempotent service admission
//! - [`heartbeat`] - the membership service, heartbeats and liveness
//! - [`placement`] - which members hold a replica of a name
//! - [`transport`] - transport trait and the in-memory network
//! - [`replicated`] - replica state, fan-out and anti-entropy
//! - [`gcounter`] / [`gset`] - the replicated counter and set
//! - [`config`] / [`error`] - configuration and error types

pub mod admission;
pub mod cluster;
pub mod config;
pub mod error;
pub mod gcounter;
pub mod gset;
pub mod heartbeat;
pub mod member;
pub mod message;
pub mod placement;
pub mod replicated;
pub mod service;
pub mod transport;

// Re-exports for convenience
pub use admission::AddServiceRequest;
pub use cluster::{Broadcast, Cluster, ClusterEvent, MasterLiveness, ServiceHandle, MEMBERSHIP_SERVICE};
pub use config::{ClusterConfig, ClusterConfigBuilder};
pub use error::{ClusterError, Result};
pub use gcounter::{GCounterHandle, GCounterService};
pub use gset::{GSetHandle, GSetService, SetElement};
pub use heartbeat::{HeartbeatOperation, MembershipService};
pub use member::{Member, MemberId};
pub use message::{Envelope, MessageRegistry, Operation, OperationContext, Request};
pub use placement::{RendezvousPlacement, ReplicaPlacement};
pub use replicated::{
    AntiEntropyReport, MergeOperation, PendingReplies, ReplicaSet, Replicated, ReplicatedObject,
    SnapshotRequest,
};
pub use service::{Registry, Service, ServiceContext, ServiceKind};
pub use transport::{MemoryNetwork, MemoryTransport, NetworkStats, Transport, TransportError};

// Re-export the lattice types replicas are built from
pub use mdcs_core::{GSet, Lattice, Max};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::cluster::{Cluster, ClusterEvent, MasterLiveness};
    pub use crate::config::{ClusterConfig, ClusterConfigBuilder};
    pub use crate::error::ClusterError;
    pub use crate::gcounter::{GCounterHandle, GCounterService};
    pub use crate::gset::{GSetHandle, GSetService};
    pub use crate::member::{Member, MemberId};
    pub use crate::replicated::ReplicaSet;
    pub use crate::service::{Registry, ServiceKind};
    pub use crate::transport::MemoryNetwork;
}
