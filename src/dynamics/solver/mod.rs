//! The SIMD-batched constraint solver.

pub mod bundle;
pub mod kernels;

mod constraint_batch;
mod fallback;
#[cfg(feature = "parallel")]
mod parallel;
mod registry;
mod solver;
mod substep;
mod type_batch;

pub use constraint_batch::ConstraintBatch;
pub use fallback::{FallbackBatch, JacobiScratch};
pub use registry::ConstraintRegistry;
pub use solver::Solver;
pub(crate) use solver::SleepingConstraintSet;
pub use type_batch::{
    AnyTypeBatch, BatchIntegrationMode, StageContext, TwoBodyConstraint, TypeBatch,
    TypeBatchIntegrationFlags,
};

use crate::data::arena::Index;

/// The batch index identifying the fallback batch in a constraint location.
pub const FALLBACK_BATCH: u32 = u32::MAX;

/// The unique handle of a constraint, stable across every structural change
/// (batch transfers, swap-removals, sleeping and waking).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct ConstraintHandle(pub Index);

impl ConstraintHandle {
    /// Converts this handle into its (index, generation) raw parts.
    pub fn into_raw_parts(self) -> (u32, u32) {
        self.0.into_raw_parts()
    }

    /// Reconstructs a handle from raw parts returned by `into_raw_parts`.
    pub fn from_raw_parts(index: u32, generation: u32) -> Self {
        Self(Index::from_raw_parts(index, generation))
    }

    /// A handle that will never identify a live constraint.
    pub fn invalid() -> Self {
        Self(Index::invalid())
    }
}

/// Where a constraint currently lives: which set, batch, type batch and slot.
///
/// This is the single source of truth tying a stable [`ConstraintHandle`] to
/// the storage that physically holds the constraint right now.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct ConstraintLocation {
    /// 0 for the active set, otherwise the sleeping set id.
    pub set: u32,
    /// The constraint batch index within the set, or the fallback sentinel.
    pub batch: u32,
    /// The constraint type id.
    pub type_id: u32,
    /// The index of the constraint inside its type batch.
    pub index: u32,
}
