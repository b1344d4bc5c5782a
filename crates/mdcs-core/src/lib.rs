//! Core lattice types for the Carnelia replicated-service runtime.
//!
//! - [`lattice`] - the join-semilattice trait every replica payload implements
//! - [`max`] - max register, the payload of the grow-only counter
//! - [`gset`] - grow-only set
pub mod gset;
pub mod lattice;
pub mod max;

pub use gset::GSet;
pub use lattice::Lattice;
pub use max::{Bounded, Max};
