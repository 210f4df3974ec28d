//! Data structures modified for their use with the solver.

pub mod arena;
pub mod index_set;

pub use arena::{Arena, Index};
pub use index_set::IndexSet;
