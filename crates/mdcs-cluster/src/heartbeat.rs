//! The built-in membership service, heartbeats and the emitter loop.

use crate::admission::AddServiceRequest;
use crate::cluster::{Broadcast, Cluster, ClusterEvent, MEMBERSHIP_SERVICE};
use crate::member::Member;
use crate::message::{Envelope, MessageRegistry, Operation};
use crate::service::{Service, ServiceContext, ServiceKind};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Receives heartbeats and admission requests for its cluster.
pub struct MembershipService {
    context: ServiceContext,
    heartbeats_seen: u64,
}

impl MembershipService {
    /// Heartbeats with a sender handled so far.
    pub fn heartbeats_seen(&self) -> u64 {
        self.heartbeats_seen
    }
}

impl Service for MembershipService {
    fn context(&self) -> &ServiceContext {
        &self.context
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl ServiceKind for MembershipService {
    fn kind() -> String {
        MEMBERSHIP_SERVICE.to_string()
    }

    fn construct(context: ServiceContext) -> Self {
        Self {
            context,
            heartbeats_seen: 0,
        }
    }

    fn register_messages(messages: &mut MessageRegistry) {
        messages
            .register_operation::<Self, HeartbeatOperation>()
            .register_request::<Self, AddServiceRequest>();
    }
}

/// Periodic liveness signal.
///
/// Only a heartbeat from the recognized master refreshes the master
/// contact time. A heartbeat whose sender claims mastership without
/// being the recognized master is reported, never accepted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatOperation {
    sender: Option<Member>,
    claims_master: bool,
}

impl HeartbeatOperation {
    pub fn new(sender: Option<Member>, claims_master: bool) -> Self {
        Self { sender, claims_master }
    }

    pub fn sender(&self) -> Option<&Member> {
        self.sender.as_ref()
    }

    pub fn claims_master(&self) -> bool {
        self.claims_master
    }
}

impl Operation<MembershipService> for HeartbeatOperation {
    fn message_type() -> String {
        "cluster.heartbeat".to_string()
    }

    fn run(self, service: &mut MembershipService) {
        let Some(sender) = self.sender else {
            trace!("heartbeat without sender ignored");
            return;
        };
        let Ok(cluster) = service.context().cluster() else {
            return;
        };
        service.heartbeats_seen += 1;

        if cluster.master().as_ref() == Some(sender.id()) {
            cluster.set_last_contacted_time_master(Instant::now());
            trace!(local = %cluster.local_member().id(), master = %sender.id(), "master heartbeat");
        } else if self.claims_master {
            let recognized = cluster.is_member(sender.id());
            if recognized {
                debug!(
                    local = %cluster.local_member().id(),
                    claimant = %sender,
                    master = ?cluster.master(),
                    "known member claims mastership"
                );
            } else {
                warn!(
                    local = %cluster.local_member().id(),
                    claimant = %sender,
                    master = ?cluster.master(),
                    "unrecognized member claims mastership, topology may be changing"
                );
            }
            cluster.emit(ClusterEvent::MasterClaimed {
                claimant: sender,
                recognized,
            });
        }
    }
}

impl Cluster {
    /// Send one heartbeat to every other member.
    pub fn emit_heartbeat(self: &Arc<Self>) -> Broadcast {
        let heartbeat = HeartbeatOperation::new(Some(self.local_member().clone()), self.is_master());
        let peers: Vec<Member> = self
            .members()
            .into_iter()
            .filter(|member| member.id() != self.local_member().id())
            .collect();

        match Envelope::operation::<MembershipService, _>(MEMBERSHIP_SERVICE, &heartbeat) {
            Ok(envelope) => self.broadcast(&peers, envelope),
            Err(err) => {
                warn!(%err, "failed to encode heartbeat");
                Broadcast::default()
            }
        }
    }

    /// Spawn the heartbeat emitter and liveness check.
    ///
    /// The task holds only a weak reference and ends once the cluster is dropped.
    pub fn start_heartbeats(self: &Arc<Self>) -> JoinHandle<()> {
        let cluster = Arc::downgrade(self);
        let period = self.config().heartbeat_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(cluster) = cluster.upgrade() else {
                    break;
                };
                drop(cluster.emit_heartbeat());
                cluster.check_master_liveness();
            }
            trace!("heartbeat emitter stopped");
        })
    }
}
