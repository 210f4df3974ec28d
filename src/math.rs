//! Type aliases for the scalar, SIMD and geometric types used by the solver.

/// The scalar type used throughout the solver.
pub type Real = f32;

/// The number of constraint lanes processed by one SIMD operation.
#[cfg(not(feature = "simd-is-enabled"))]
pub const SIMD_WIDTH: usize = 1;
/// The index of the last SIMD lane.
#[cfg(not(feature = "simd-is-enabled"))]
pub const SIMD_LAST_INDEX: usize = 0;

/// The number of constraint lanes processed by one SIMD operation.
#[cfg(feature = "simd-is-enabled")]
pub const SIMD_WIDTH: usize = 4;
/// The index of the last SIMD lane.
#[cfg(feature = "simd-is-enabled")]
pub const SIMD_LAST_INDEX: usize = 3;

/// A SIMD-widened `Real`, holding `SIMD_WIDTH` lanes.
#[cfg(not(feature = "simd-is-enabled"))]
pub type SimdReal = Real;
/// A SIMD-widened `Real`, holding `SIMD_WIDTH` lanes.
#[cfg(feature = "simd-stable")]
pub type SimdReal = simba::simd::WideF32x4;
/// A SIMD-widened `Real`, holding `SIMD_WIDTH` lanes.
#[cfg(all(feature = "simd-nightly", not(feature = "simd-stable")))]
pub type SimdReal = simba::simd::f32x4;

/// The boolean mask type paired with `SimdReal`.
pub type SimdBool = <SimdReal as na::SimdValue>::SimdBool;

/// A 3D vector.
pub type Vector<N = Real> = na::Vector3<N>;
/// An angular 3D vector (axis-scaled angular velocity or impulse).
pub type AngVector<N = Real> = na::Vector3<N>;
/// A 3D point.
pub type Point<N = Real> = na::Point3<N>;
/// A unit quaternion representing an orientation.
pub type Rotation<N = Real> = na::UnitQuaternion<N>;
/// A non-unit quaternion; the wide representation of gathered orientations.
pub type Quaternion<N = Real> = na::Quaternion<N>;
/// A rigid transformation (rotation followed by translation).
pub type Isometry<N = Real> = na::Isometry3<N>;
/// A 3×3 matrix.
pub type Matrix<N = Real> = na::Matrix3<N>;
