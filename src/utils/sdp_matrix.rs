//! Symmetric positive (semi)definite 3×3 matrices, used for inverse inertia
//! tensors and constraint effective masses.

use crate::utils::SimdRealCopy;
use na::{Matrix3, Vector3};
use std::ops::{Add, Mul};

/// A symmetric 3×3 matrix storing only its upper triangle.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct SdpMatrix3<N> {
    /// The component at the first row and first column.
    pub m11: N,
    /// The component at the first row and second column.
    pub m12: N,
    /// The component at the first row and third column.
    pub m13: N,
    /// The component at the second row and second column.
    pub m22: N,
    /// The component at the second row and third column.
    pub m23: N,
    /// The component at the third row and third column.
    pub m33: N,
}

impl<N: SimdRealCopy> SdpMatrix3<N> {
    /// Builds the matrix from its upper-triangular components.
    pub fn new(m11: N, m12: N, m13: N, m22: N, m23: N, m33: N) -> Self {
        Self {
            m11,
            m12,
            m13,
            m22,
            m23,
            m33,
        }
    }

    /// The zero matrix.
    pub fn zero() -> Self {
        Self::new(
            N::zero(),
            N::zero(),
            N::zero(),
            N::zero(),
            N::zero(),
            N::zero(),
        )
    }

    /// The identity matrix.
    pub fn identity() -> Self {
        Self::new(
            N::one(),
            N::zero(),
            N::zero(),
            N::one(),
            N::zero(),
            N::one(),
        )
    }

    /// Builds a diagonal matrix.
    pub fn from_diagonal(diag: Vector3<N>) -> Self {
        Self::new(diag.x, N::zero(), N::zero(), diag.y, N::zero(), diag.z)
    }

    /// Adds `elt` to each diagonal component of `self`.
    #[must_use]
    pub fn add_diagonal(&self, elt: N) -> Self {
        Self {
            m11: self.m11 + elt,
            m22: self.m22 + elt,
            m33: self.m33 + elt,
            ..*self
        }
    }

    /// Computes `m.transpose() * self * m`, which is symmetric.
    #[must_use]
    pub fn quadform(&self, m: &Matrix3<N>) -> Self {
        let sm = self.into_matrix() * m;
        let t = m.transpose() * sm;
        Self::new(t.m11, t.m12, t.m13, t.m22, t.m23, t.m33)
    }

    /// Inverts this matrix without checking invertibility.
    ///
    /// The result is garbage (possibly non-finite) if the matrix is singular.
    #[must_use]
    pub fn inverse_unchecked(&self) -> Self {
        let c11 = self.m22 * self.m33 - self.m23 * self.m23;
        let c12 = self.m13 * self.m23 - self.m33 * self.m12;
        let c13 = self.m12 * self.m23 - self.m22 * self.m13;
        let inv_det = N::one() / (self.m11 * c11 + self.m12 * c12 + self.m13 * c13);

        Self {
            m11: c11 * inv_det,
            m12: c12 * inv_det,
            m13: c13 * inv_det,
            m22: (self.m11 * self.m33 - self.m13 * self.m13) * inv_det,
            m23: (self.m13 * self.m12 - self.m11 * self.m23) * inv_det,
            m33: (self.m11 * self.m22 - self.m12 * self.m12) * inv_det,
        }
    }

    /// Expands this matrix into a full (symmetric) `Matrix3`.
    pub fn into_matrix(self) -> Matrix3<N> {
        Matrix3::new(
            self.m11, self.m12, self.m13, self.m12, self.m22, self.m23, self.m13, self.m23,
            self.m33,
        )
    }

    /// Scales every component of `self`.
    #[must_use]
    pub fn scaled(&self, factor: N) -> Self {
        Self {
            m11: self.m11 * factor,
            m12: self.m12 * factor,
            m13: self.m13 * factor,
            m22: self.m22 * factor,
            m23: self.m23 * factor,
            m33: self.m33 * factor,
        }
    }
}

impl<N: SimdRealCopy + PartialEq> num_traits::Zero for SdpMatrix3<N> {
    fn zero() -> Self {
        SdpMatrix3::zero()
    }

    fn is_zero(&self) -> bool {
        *self == Self::zero()
    }
}

impl<N: SimdRealCopy> Add<SdpMatrix3<N>> for SdpMatrix3<N> {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Self) -> Self {
        Self {
            m11: self.m11 + rhs.m11,
            m12: self.m12 + rhs.m12,
            m13: self.m13 + rhs.m13,
            m22: self.m22 + rhs.m22,
            m23: self.m23 + rhs.m23,
            m33: self.m33 + rhs.m33,
        }
    }
}

impl<N: SimdRealCopy> Mul<Vector3<N>> for SdpMatrix3<N> {
    type Output = Vector3<N>;

    #[inline]
    fn mul(self, v: Vector3<N>) -> Vector3<N> {
        Vector3::new(
            self.m11 * v.x + self.m12 * v.y + self.m13 * v.z,
            self.m12 * v.x + self.m22 * v.y + self.m23 * v.z,
            self.m13 * v.x + self.m23 * v.y + self.m33 * v.z,
        )
    }
}

#[cfg(feature = "simd-is-enabled")]
impl From<[SdpMatrix3<crate::math::Real>; crate::math::SIMD_WIDTH]>
    for SdpMatrix3<crate::math::SimdReal>
{
    fn from(data: [SdpMatrix3<crate::math::Real>; crate::math::SIMD_WIDTH]) -> Self {
        use crate::math::SimdReal;
        SdpMatrix3 {
            m11: SimdReal::from([data[0].m11, data[1].m11, data[2].m11, data[3].m11]),
            m12: SimdReal::from([data[0].m12, data[1].m12, data[2].m12, data[3].m12]),
            m13: SimdReal::from([data[0].m13, data[1].m13, data[2].m13, data[3].m13]),
            m22: SimdReal::from([data[0].m22, data[1].m22, data[2].m22, data[3].m22]),
            m23: SimdReal::from([data[0].m23, data[1].m23, data[2].m23, data[3].m23]),
            m33: SimdReal::from([data[0].m33, data[1].m33, data[2].m33, data[3].m33]),
        }
    }
}

#[cfg(test)]
mod test {
    use super::SdpMatrix3;
    use approx::assert_relative_eq;
    use na::{Matrix3, Vector3};

    #[test]
    fn inverse_of_diagonal() {
        let m = SdpMatrix3::from_diagonal(Vector3::new(2.0f32, 4.0, 8.0));
        let inv = m.inverse_unchecked();
        assert_relative_eq!(inv.m11, 0.5);
        assert_relative_eq!(inv.m22, 0.25);
        assert_relative_eq!(inv.m33, 0.125);
        assert_relative_eq!(inv.m12, 0.0);
    }

    #[test]
    fn quadform_matches_dense_product() {
        let s = SdpMatrix3::new(2.0f32, 0.5, 0.0, 3.0, 0.25, 4.0);
        let m = Matrix3::new(1.0, 2.0, 0.0, 0.0, 1.0, 1.0, 2.0, 0.0, 1.0);
        let q = s.quadform(&m);
        let dense = m.transpose() * s.into_matrix() * m;
        assert_relative_eq!(q.into_matrix(), dense, epsilon = 1.0e-6);
    }

    #[test]
    fn inverse_roundtrip() {
        let s = SdpMatrix3::new(5.0f32, 1.0, 0.5, 4.0, 0.25, 3.0);
        let id = s.into_matrix() * s.inverse_unchecked().into_matrix();
        assert_relative_eq!(id, Matrix3::identity(), epsilon = 1.0e-5);
    }
}
