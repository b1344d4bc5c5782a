//! Max register - a single value whose join keeps the larger side.
//!
//! This is the payload of the replicated grow-only counter: every replica
//! holds one number and anti-entropy converges all of them to the maximum.

use crate::lattice::Lattice;
use serde::{Deserialize, Serialize};

/// Totally ordered values with a least element.
pub trait Bounded: Ord + Copy {
    const MIN: Self;
}

macro_rules! impl_bounded {
    ($($t:ty),*) => {
        $(impl Bounded for $t {
            const MIN: Self = <$t>::MIN;
        })*
    };
}

impl_bounded!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Max<T>(T);

impl<T: Bounded> Max<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    pub fn get(&self) -> T {
        self.0
    }

    /// Overwrite the register.
    ///
    /// Unlike `join`, this may move the value down the order.
    pub fn assign(&mut self, value: T) {
        self.0 = value;
    }
}

impl<T: Bounded> Default for Max<T> {
    fn default() -> Self {
        Self::bottom()
    }
}

impl<T: Bounded> Lattice for Max<T> {
    /// The least value of `T`, so negative registers survive a join with it.
    fn bottom() -> Self {
        Self(T::MIN)
    }

    fn join(self, other: Self) -> Self {
        if other.0 > self.0 {
            other
        } else {
            self
        }
    }

    fn leq(&self, other: &Self) -> bool {
        self.0 <= other.0
    }
}
