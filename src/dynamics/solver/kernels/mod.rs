//! The built-in constraint type catalogue.
//!
//! Each kernel recomputes its linearization (jacobians, effective mass, bias)
//! from the prestep data and the gathered body state on every call; nothing
//! ephemeral survives a sub-step besides the accumulated impulses.

mod ball_socket;
mod gear_motor;
mod point_contact;
mod weld;

pub use ball_socket::{BallSocket, BallSocketDescription};
pub use gear_motor::{AngularAxisGearMotor, AngularAxisGearMotorDescription};
pub use point_contact::{PointContact, PointContactDescription};
pub use weld::{Weld, WeldDescription};
