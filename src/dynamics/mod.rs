//! Structures related to the bodies, constraints and their resolution.

pub mod solver;

mod body;
mod body_set;
mod island_manager;
mod pose_integration;
mod solver_parameters;

pub use body::{BodyConstraintRef, BodyHandle, BodyInertia, BodyVelocity, RigidBody};
pub use body_set::{BodyLocation, BodySet, BodySubset, ACTIVE_SET};
pub use island_manager::IslandManager;
pub use pose_integration::{
    AngularIntegrationMode, Gravity, PoseIntegratorCallbacks, VelocityBundle,
};
pub use solver::{ConstraintHandle, Solver};
pub use solver_parameters::{SoftnessCoefficients, SolverParameters, SpringSettings};
