//! Miscellaneous SIMD-generic math utilities.

mod sdp_matrix;
mod simd_quat;

pub use sdp_matrix::SdpMatrix3;
pub use simd_quat::{
    quat_conjugate, quat_mul, quat_normalize, quat_rotate_vector, small_rotation_error,
};

use crate::math::Real;
use na::{Matrix3, SimdRealField, Vector3};

/// The trait for real numbers used by the solver.
///
/// This includes `f32` and its SIMD-widened counterparts.
pub trait SimdRealCopy: SimdRealField<Element = Real> + Copy {}
impl<T: SimdRealField<Element = Real> + Copy> SimdRealCopy for T {}

/// Trait for computing the cross product on widened 3D vectors.
pub trait SimdCross<Rhs = Self> {
    /// The result of the cross product.
    type Result;
    /// Computes the cross product of `self` with `rhs`.
    fn gcross(&self, rhs: Rhs) -> Self::Result;
}

impl<N: SimdRealCopy> SimdCross<Vector3<N>> for Vector3<N> {
    type Result = Self;

    #[inline]
    fn gcross(&self, rhs: Vector3<N>) -> Self::Result {
        self.cross(&rhs)
    }
}

/// Trait for computing the skew-symmetric cross-product matrix of a vector.
pub trait SimdCrossMatrix {
    /// The matrix `M` such that `M * v == self × v` for any vector `v`.
    type CrossMat;
    /// Computes the cross-product matrix of `self`.
    fn gcross_matrix(&self) -> Self::CrossMat;
}

impl<N: SimdRealCopy> SimdCrossMatrix for Vector3<N> {
    type CrossMat = Matrix3<N>;

    #[inline]
    fn gcross_matrix(&self) -> Matrix3<N> {
        Matrix3::new(
            N::zero(),
            -self.z,
            self.y,
            self.z,
            N::zero(),
            -self.x,
            -self.y,
            self.x,
            N::zero(),
        )
    }
}

const INV_EPSILON: Real = 1.0e-20;

/// Inverts `val`, returning zero instead of infinity when `val` is (almost) zero.
#[inline]
pub fn simd_inv<N: SimdRealCopy>(val: N) -> N {
    use na::{SimdPartialOrd, SimdValue};
    let eps = N::splat(INV_EPSILON);
    let is_small = val.simd_gt(-eps) & val.simd_lt(eps);
    N::zero().select(is_small, N::one() / val)
}
