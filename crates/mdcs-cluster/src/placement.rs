//! Deterministic replica placement.

use crate::member::Member;
use sha2::{Digest, Sha256};

/// Decides which members hold a replica of a named service.
///
/// Implementations must be pure: the same name, member list and factor
/// always yield the same holders, whatever the input order.
pub trait ReplicaPlacement: Send + Sync + 'static {
    fn place(&self, service: &str, members: &[Member], replication_factor: usize) -> Vec<Member>;
}

/// Highest-random-weight hashing.
///
/// Each member scores `SHA-256(service || 0x00 || member id)`; the
/// `replication_factor` highest scores win. Adding or removing one member
/// only moves the replicas that member gains or loses.
#[derive(Clone, Copy, Debug, Default)]
pub struct RendezvousPlacement;

impl RendezvousPlacement {
    fn score(service: &str, member: &Member) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(service.as_bytes());
        hasher.update([0u8]);
        hasher.update(member.id().as_str().as_bytes());
        hasher.finalize().into()
    }
}

impl ReplicaPlacement for RendezvousPlacement {
    fn place(&self, service: &str, members: &[Member], replication_factor: usize) -> Vec<Member> {
        let mut scored: Vec<([u8; 32], &Member)> = members
            .iter()
            .map(|member| (Self::score(service, member), member))
            .collect();
        // Ties are impossible in practice; the id keeps the order total anyway.
        scored.sort_by(|(a, ma), (b, mb)| b.cmp(a).then_with(|| ma.id().cmp(mb.id())));
        scored.dedup_by(|(_, a), (_, b)| a.id() == b.id());

        scored
            .into_iter()
            .take(replication_factor)
            .map(|(_, member)| member.clone())
            .collect()
    }
}
