//! Process-wide membership registry and dispatcher for one member.
//!
//! A [`Cluster`] knows the members, hosts the local services (one slot per
//! admitted name, indices assigned in admission order), tracks the believed
//! master and when it was last heard from, and runs inbound envelopes
//! against the addressed service.

use crate::admission::AddServiceRequest;
use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::heartbeat::MembershipService;
use crate::member::{Member, MemberId};
use crate::message::{decode, DispatchStage, Envelope, Handler, Operation, PendingReply, Request};
use crate::placement::{RendezvousPlacement, ReplicaPlacement};
use crate::service::{Registry, Service, ServiceContext, ServiceKind};
use crate::transport::Transport;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Reserved name of the built-in membership service (always slot 0).
pub const MEMBERSHIP_SERVICE: &str = "cluster.membership";

/// Events emitted by a cluster.
#[derive(Clone, Debug)]
pub enum ClusterEvent {
    /// A member was added to the membership list.
    MemberJoined(Member),
    /// A member was removed from the membership list.
    MemberLeft(MemberId),
    /// The recognized master changed.
    MasterChanged(Option<MemberId>),
    /// A service was admitted locally.
    ServiceAdded { name: String, index: usize },
    /// A heartbeat claimed mastership for someone other than the recognized master.
    MasterClaimed { claimant: Member, recognized: bool },
    /// The recognized master has been silent longer than the master timeout.
    MasterUnreachable { master: MemberId, silent_for: Duration },
}

/// What the local member currently believes about the master.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MasterLiveness {
    NoMaster,
    Alive { master: MemberId, silent_for: Duration },
    Unreachable { master: MemberId, silent_for: Duration },
}

impl MasterLiveness {
    pub fn is_reachable(&self) -> bool {
        matches!(self, MasterLiveness::Alive { .. })
    }
}

/// A locally hosted service slot.
#[derive(Clone)]
pub struct ServiceHandle {
    name: String,
    kind: String,
    index: usize,
    instance: Arc<Mutex<Box<dyn Service>>>,
}

impl ServiceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Run `f` against the service while holding its slot exclusively.
    pub fn with<S: Service, R>(&self, f: impl FnOnce(&mut S) -> R) -> Result<R> {
        let mut guard = self.instance.lock();
        let service: &mut dyn Service = &mut **guard;
        let service = service
            .as_any_mut()
            .downcast_mut::<S>()
            .ok_or_else(|| ClusterError::ServiceTypeMismatch {
                service: self.name.clone(),
                message_type: std::any::type_name::<S>().to_string(),
            })?;
        Ok(f(service))
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("index", &self.index)
            .finish()
    }
}

/// The services list and the name map, guarded together.
#[derive(Default)]
struct ServiceTable {
    slots: Vec<ServiceHandle>,
    by_name: HashMap<String, usize>,
}

#[derive(Default)]
struct MasterState {
    master: Option<MemberId>,
    recognized_at: Option<Instant>,
    last_contacted: Option<Instant>,
    unreachable_signalled: bool,
}

/// Hand-off handle for a fire-and-forget fan-out.
///
/// Dropping it does not cancel delivery.
#[derive(Debug, Default)]
pub struct Broadcast {
    deliveries: Vec<JoinHandle<bool>>,
}

impl Broadcast {
    /// Number of members the message was dispatched to.
    pub fn targets(&self) -> usize {
        self.deliveries.len()
    }

    /// Wait for every hand-off and count the successful ones.
    pub async fn delivered(self) -> usize {
        join_all(self.deliveries)
            .await
            .into_iter()
            .filter(|outcome| matches!(outcome, Ok(true)))
            .count()
    }
}

/// One member's view of the cluster.
pub struct Cluster {
    local: Member,
    config: ClusterConfig,
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
    placement: Arc<dyn ReplicaPlacement>,
    members: RwLock<BTreeMap<MemberId, Member>>,
    services: RwLock<ServiceTable>,
    master: RwLock<MasterState>,
    event_tx: broadcast::Sender<ClusterEvent>,
    self_ref: Weak<Cluster>,
}

impl Cluster {
    /// Create a cluster using rendezvous placement.
    pub fn new(
        local: Member,
        config: ClusterConfig,
        registry: Arc<Registry>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>> {
        Self::with_placement(local, config, registry, transport, Arc::new(RendezvousPlacement))
    }

    /// Create a cluster with a custom placement policy.
    pub fn with_placement(
        local: Member,
        config: ClusterConfig,
        registry: Arc<Registry>,
        transport: Arc<dyn Transport>,
        placement: Arc<dyn ReplicaPlacement>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let (event_tx, _) = broadcast::channel(config.event_capacity);

        let mut members = BTreeMap::new();
        members.insert(local.id().clone(), local.clone());

        let cluster = Arc::new_cyclic(|self_ref| Cluster {
            local,
            config,
            registry,
            transport,
            placement,
            members: RwLock::new(members),
            services: RwLock::new(ServiceTable::default()),
            master: RwLock::new(MasterState::default()),
            event_tx,
            self_ref: self_ref.clone(),
        });

        cluster.admit(MEMBERSHIP_SERVICE, MEMBERSHIP_SERVICE, &MembershipService::kind())?;
        info!(member = %cluster.local, "cluster started");
        Ok(cluster)
    }

    pub fn local_member(&self) -> &Member {
        &self.local
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Subscribe to cluster events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.event_tx.subscribe()
    }

    pub(crate) fn emit(&self, event: ClusterEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// All known members, ordered by id. Includes the local member.
    pub fn members(&self) -> Vec<Member> {
        self.members.read().values().cloned().collect()
    }

    pub fn is_member(&self, id: &MemberId) -> bool {
        self.members.read().contains_key(id)
    }

    pub fn add_member(&self, member: Member) -> bool {
        let added = self
            .members
            .write()
            .insert(member.id().clone(), member.clone())
            .is_none();
        if added {
            info!(local = %self.local.id(), member = %member, "member joined");
            self.emit(ClusterEvent::MemberJoined(member));
        }
        added
    }

    /// Remove a member after confirmed departure. The local member stays.
    pub fn remove_member(&self, id: &MemberId) -> bool {
        if id == self.local.id() {
            return false;
        }
        let removed = self.members.write().remove(id).is_some();
        if !removed {
            return false;
        }
        info!(local = %self.local.id(), member = %id, "member left");
        self.emit(ClusterEvent::MemberLeft(id.clone()));

        if self.master().as_ref() == Some(id) {
            self.set_master(None);
        }
        true
    }

    // ------------------------------------------------------------------
    // Master tracking
    // ------------------------------------------------------------------

    pub fn master(&self) -> Option<MemberId> {
        self.master.read().master.clone()
    }

    pub fn is_master(&self) -> bool {
        self.master.read().master.as_ref() == Some(self.local.id())
    }

    /// Record which member is recognized as master.
    ///
    /// Choosing the master is up to the caller; this only stores the belief.
    pub fn set_master(&self, master: Option<MemberId>) {
        {
            let mut state = self.master.write();
            if state.master == master {
                return;
            }
            state.recognized_at = master.as_ref().map(|_| Instant::now());
            state.master = master.clone();
            state.last_contacted = None;
            state.unreachable_signalled = false;
        }
        info!(local = %self.local.id(), master = ?master, "master changed");
        self.emit(ClusterEvent::MasterChanged(master));
    }

    pub fn last_contacted_time_master(&self) -> Option<Instant> {
        self.master.read().last_contacted
    }

    /// Only called for heartbeats confirmed to come from the current master.
    pub fn set_last_contacted_time_master(&self, at: Instant) {
        let mut state = self.master.write();
        state.last_contacted = Some(at);
        state.unreachable_signalled = false;
    }

    pub fn master_liveness(&self) -> MasterLiveness {
        self.master_liveness_at(Instant::now())
    }

    /// Liveness as seen at `now`. Silence is measured from the last master
    /// heartbeat, or from recognition if none has arrived yet.
    pub fn master_liveness_at(&self, now: Instant) -> MasterLiveness {
        self.liveness_of(&self.master.read(), now)
    }

    fn liveness_of(&self, state: &MasterState, now: Instant) -> MasterLiveness {
        let Some(master) = state.master.clone() else {
            return MasterLiveness::NoMaster;
        };
        if &master == self.local.id() {
            return MasterLiveness::Alive {
                master,
                silent_for: Duration::ZERO,
            };
        }

        let since = state.last_contacted.or(state.recognized_at).unwrap_or(now);
        let silent_for = now.saturating_duration_since(since);
        if silent_for > self.config.master_timeout() {
            MasterLiveness::Unreachable { master, silent_for }
        } else {
            MasterLiveness::Alive { master, silent_for }
        }
    }

    /// Evaluate liveness and raise `MasterUnreachable` once per silence period.
    pub fn check_master_liveness(&self) -> MasterLiveness {
        self.check_master_liveness_at(Instant::now())
    }

    pub fn check_master_liveness_at(&self, now: Instant) -> MasterLiveness {
        // Check and flag update must share one write lock.
        let (liveness, first) = {
            let mut state = self.master.write();
            let liveness = self.liveness_of(&state, now);
            let first = matches!(liveness, MasterLiveness::Unreachable { .. })
                && !std::mem::replace(&mut state.unreachable_signalled, true);
            (liveness, first)
        };
        if first {
            if let MasterLiveness::Unreachable { master, silent_for } = &liveness {
                warn!(local = %self.local.id(), master = %master, ?silent_for, "master unreachable");
                self.emit(ClusterEvent::MasterUnreachable {
                    master: master.clone(),
                    silent_for: *silent_for,
                });
            }
        }
        liveness
    }

    // ------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------

    pub fn get_service(&self, name: &str) -> Option<ServiceHandle> {
        let table = self.services.read();
        table.by_name.get(name).map(|&index| table.slots[index].clone())
    }

    /// Snapshot of the hosted services in slot order.
    pub fn services(&self) -> Vec<ServiceHandle> {
        self.services.read().slots.clone()
    }

    pub fn service_count(&self) -> usize {
        self.services.read().slots.len()
    }

    /// Admit a service of `kind` under `final_name`.
    ///
    /// Returns `Ok(false)` without constructing anything if the name is
    /// taken. The check and the insertion happen under one write lock, so
    /// racing admissions of the same name produce exactly one instance.
    /// Constructors run under that lock and must not call back into the
    /// service table.
    pub fn admit(&self, final_name: &str, name: &str, kind: &str) -> Result<bool> {
        let constructor = self.registry.constructor(kind)?;

        let index = {
            let mut table = self.services.write();
            if table.by_name.contains_key(final_name) {
                debug!(local = %self.local.id(), service = %final_name, "service already hosted");
                return Ok(false);
            }

            let index = table.slots.len();
            let instance = constructor(ServiceContext::new(self.self_ref.clone(), index, name));
            table.slots.push(ServiceHandle {
                name: final_name.to_string(),
                kind: kind.to_string(),
                index,
                instance: Arc::new(Mutex::new(instance)),
            });
            table.by_name.insert(final_name.to_string(), index);
            index
        };

        info!(local = %self.local.id(), service = %final_name, kind = %kind, index, "service admitted");
        self.emit(ClusterEvent::ServiceAdded {
            name: final_name.to_string(),
            index,
        });
        Ok(true)
    }

    /// Admit a service through the membership service, as a remote peer would.
    pub async fn add_service(&self, name: &str, kind: &str) -> Result<bool> {
        self.request::<MembershipService, _>(MEMBERSHIP_SERVICE, AddServiceRequest::new(name, kind))
            .await
    }

    /// Run `f` against a local service of type `S`.
    pub fn with_service<S: Service, R>(&self, name: &str, f: impl FnOnce(&mut S) -> R) -> Result<R> {
        self.get_service(name)
            .ok_or_else(|| ClusterError::ServiceNotFound(name.to_string()))?
            .with(f)
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Run an inbound operation against the addressed local service.
    pub fn dispatch_operation(&self, envelope: &Envelope) -> Result<()> {
        trace!(service = %envelope.service, message_type = %envelope.message_type, stage = ?DispatchStage::Received);
        let run = match self.registry.messages().handler(&envelope.message_type)? {
            Handler::Operation(run) => run,
            Handler::Request(_) => return Err(ClusterError::NotAnOperation(envelope.message_type.clone())),
        };
        let slot = self
            .get_service(&envelope.service)
            .ok_or_else(|| ClusterError::ServiceNotFound(envelope.service.clone()))?;

        trace!(service = %envelope.service, index = slot.index, stage = ?DispatchStage::Dispatched);
        let mut instance = slot.instance.lock();
        run(&mut **instance, &envelope.payload)
    }

    /// Run an inbound request and wait for its encoded reply.
    pub async fn dispatch_request(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let pending = self.execute_request(envelope)?;
        pending.await
    }

    fn execute_request(&self, envelope: &Envelope) -> Result<PendingReply> {
        trace!(service = %envelope.service, message_type = %envelope.message_type, stage = ?DispatchStage::Received);
        let run = match self.registry.messages().handler(&envelope.message_type)? {
            Handler::Request(run) => run,
            Handler::Operation(_) => return Err(ClusterError::NotARequest(envelope.message_type.clone())),
        };
        let slot = self
            .get_service(&envelope.service)
            .ok_or_else(|| ClusterError::ServiceNotFound(envelope.service.clone()))?;

        trace!(service = %envelope.service, index = slot.index, stage = ?DispatchStage::Dispatched);
        let mut instance = slot.instance.lock();
        run(&mut **instance, &envelope.payload)
    }

    /// Apply a typed operation to a local service.
    pub fn apply<S: Service, O: Operation<S>>(&self, service: &str, operation: O) -> Result<()> {
        self.dispatch_operation(&Envelope::operation::<S, O>(service, &operation)?)
    }

    /// Send a typed request to a local service and decode the reply.
    pub async fn request<S: Service, Q: Request<S>>(&self, service: &str, request: Q) -> Result<Q::Reply> {
        let envelope = Envelope::request::<S, Q>(service, &request)?;
        let reply = self.dispatch_request(&envelope).await?;
        decode(&reply)
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    /// Members that should hold a replica of `service`.
    pub fn replica_holders(&self, service: &str, replication_factor: usize) -> Vec<Member> {
        self.placement.place(service, &self.members(), replication_factor)
    }

    /// Deliver an operation to `target`, short-circuiting the local member.
    pub async fn send_to(&self, target: &MemberId, envelope: Envelope) -> Result<()> {
        if target == self.local.id() {
            return self.dispatch_operation(&envelope);
        }
        Ok(self.transport.send(target, envelope).await?)
    }

    /// Deliver a request to `target` and wait for the encoded reply.
    pub async fn ask(&self, target: &MemberId, envelope: Envelope) -> Result<Vec<u8>> {
        if target == self.local.id() {
            return self.dispatch_request(&envelope).await;
        }
        Ok(self.transport.send_and_await(target, envelope).await?)
    }

    /// Fire `envelope` at every target without waiting for any of them.
    pub fn broadcast(self: &Arc<Self>, targets: &[Member], envelope: Envelope) -> Broadcast {
        let deliveries = targets
            .iter()
            .map(|target| {
                let cluster = Arc::clone(self);
                let target = target.id().clone();
                let envelope = envelope.clone();
                tokio::spawn(async move {
                    match cluster.send_to(&target, envelope).await {
                        Ok(()) => true,
                        Err(err) => {
                            debug!(local = %cluster.local.id(), %target, %err, "delivery failed");
                            false
                        }
                    }
                })
            })
            .collect();
        Broadcast { deliveries }
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("local", &self.local)
            .field("members", &self.members.read().len())
            .field("services", &self.services.read().slots.len())
            .field("master", &self.master.read().master)
            .finish()
    }
}
