//! Join-semilattice trait - the mathematical foundation of replicated values
//!
//! A join-semilattice (S, ⊔) satisfies:
//! - Commutativity: a ⊔ b = b ⊔ a
//! - Associativity: (a ⊔ b) ⊔ c = a ⊔ (b ⊔ c)
//! - Idempotence:  a ⊔ a = a
//!
//! These properties guarantee convergence regardless of message order,
//! duplication or partial divergence between replicas.

use std::cmp::Ordering;

/// The core trait implemented by every replica payload.
///
/// `join` consumes both sides so implementations can reuse whichever
/// container is cheaper to grow.
pub trait Lattice: Sized {
    /// The bottom element (identity for join)
    fn bottom() -> Self;

    /// Join operation (least upper bound)
    /// Must be commutative, associative, and idempotent
    fn join(self, other: Self) -> Self;

    /// Lattice order: a ≤ b iff a ⊔ b = b
    fn leq(&self, other: &Self) -> bool;

    /// Partial order derived from `leq` in both directions
    fn partial_cmp_lattice(&self, other: &Self) -> Option<Ordering> {
        match (self.leq(other), other.leq(self)) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (false, false) => None, // Concurrent/incomparable
        }
    }

    /// Join-assign: self = self ⊔ other.
    ///
    /// Returns `false` without touching `self` when `other` is already
    /// covered, which is what replicas use to avoid re-propagating state.
    fn join_in(&mut self, other: Self) -> bool {
        if other.leq(self) {
            return false;
        }
        let current = std::mem::replace(self, Self::bottom());
        *self = current.join(other);
        true
    }
}
