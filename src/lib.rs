//! # Estoc
//!
//! Estoc is the constraint-solver core of a rigid-body physics engine. Given a
//! population of rigid bodies and the constraints between them (joints, motors,
//! contacts), it iteratively computes impulses that enforce the constraints
//! under a semi-implicit, sub-stepped time integration scheme.
//!
//! The solver stores constraints of each type in SIMD-friendly column batches,
//! partitions them into batches that never touch the same body twice (enabling
//! lock-free parallel solving), and threads pose integration through the solve
//! so every body is integrated exactly once per sub-step.
//!
//! Collision detection, broad-phase, shapes and rendering are external
//! collaborators: contact constraints are fed to the solver like any other
//! constraint type.

#![deny(bare_trait_objects)]
#![warn(missing_docs)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::needless_range_loop)]
#![allow(clippy::module_inception)]
#![cfg_attr(feature = "simd-nightly", feature(portable_simd))]

pub extern crate nalgebra as na;
#[cfg(feature = "serde-serialize")]
#[macro_use]
extern crate serde;

#[cfg(all(
    feature = "simd-is-enabled",
    not(feature = "simd-stable"),
    not(feature = "simd-nightly")
))]
std::compile_error!(
    "The `simd-is-enabled` feature should not be enabled explicitly. Please enable the `simd-stable` or the `simd-nightly` feature instead."
);

/// Gathers one value per SIMD lane into an array suitable for wide-type
/// construction. Degenerates to a single callback invocation without SIMD.
macro_rules! gather(
    ($callback: expr) => {
        {
            #[inline(always)]
            #[allow(dead_code)]
            #[cfg(not(feature = "simd-is-enabled"))]
            fn create_arr<T>(mut callback: impl FnMut(usize) -> T) -> T {
                callback(0usize)
            }

            #[inline(always)]
            #[allow(dead_code)]
            #[cfg(feature = "simd-is-enabled")]
            fn create_arr<T>(mut callback: impl FnMut(usize) -> T) -> [T; SIMD_WIDTH] {
                [callback(0usize), callback(1usize), callback(2usize), callback(3usize)]
            }

            create_arr($callback)
        }
    }
);

/// Builds a `[T; SIMD_WIDTH]` array from a per-lane callback, in both the
/// scalar and the SIMD configurations.
#[allow(unused_macros)]
macro_rules! array(
    ($callback: expr) => {
        {
            #[inline(always)]
            #[allow(dead_code)]
            fn create_arr<T>(mut callback: impl FnMut(usize) -> T) -> [T; SIMD_WIDTH] {
                #[cfg(not(feature = "simd-is-enabled"))]
                return [callback(0usize)];
                #[cfg(feature = "simd-is-enabled")]
                return [callback(0usize), callback(1usize), callback(2usize), callback(3usize)];
            }

            create_arr($callback)
        }
    }
);

pub mod data;
pub mod dynamics;
pub mod math;
pub mod utils;

/// An invalid `u32` index, used as a sentinel for empty constraint lanes.
pub(crate) const INVALID_U32: u32 = u32::MAX;

/// Elementary data structures and the most common types needed to drive the
/// solver.
pub mod prelude {
    pub use crate::dynamics::solver::kernels::{
        AngularAxisGearMotor, BallSocket, PointContact, Weld,
    };
    pub use crate::dynamics::solver::Solver;
    pub use crate::dynamics::{
        AngularIntegrationMode, BodyHandle, BodyInertia, BodySet, BodyVelocity, ConstraintHandle,
        IslandManager, PoseIntegratorCallbacks, RigidBody, SolverParameters, SpringSettings,
    };
    pub use crate::math::*;
}
