//! Quaternion operations on SIMD-widened coefficients.
//!
//! These operate on plain (non-unit) `Quaternion<N>` since gathered lanes are
//! re-normalized explicitly where needed.

use crate::utils::SimdRealCopy;
use na::{Quaternion, SimdComplexField, SimdPartialOrd, SimdValue, Vector3};

/// Hamilton product of two widened quaternions.
#[inline]
pub fn quat_mul<N: SimdRealCopy>(a: &Quaternion<N>, b: &Quaternion<N>) -> Quaternion<N> {
    Quaternion::new(
        a.w * b.w - a.i * b.i - a.j * b.j - a.k * b.k,
        a.w * b.i + a.i * b.w + a.j * b.k - a.k * b.j,
        a.w * b.j - a.i * b.k + a.j * b.w + a.k * b.i,
        a.w * b.k + a.i * b.j - a.j * b.i + a.k * b.w,
    )
}

/// The conjugate of a widened quaternion.
#[inline]
pub fn quat_conjugate<N: SimdRealCopy>(q: &Quaternion<N>) -> Quaternion<N> {
    Quaternion::new(q.w, -q.i, -q.j, -q.k)
}

/// Normalizes a widened quaternion lane-wise.
#[inline]
pub fn quat_normalize<N: SimdRealCopy>(q: &Quaternion<N>) -> Quaternion<N> {
    let sq_len = q.w * q.w + q.i * q.i + q.j * q.j + q.k * q.k;
    let inv_len = N::one() / sq_len.simd_sqrt();
    Quaternion::new(q.w * inv_len, q.i * inv_len, q.j * inv_len, q.k * inv_len)
}

/// Rotates a vector by a unit widened quaternion.
#[inline]
pub fn quat_rotate_vector<N: SimdRealCopy>(q: &Quaternion<N>, v: &Vector3<N>) -> Vector3<N> {
    // v + 2 w (im × v) + 2 im × (im × v)
    let im = Vector3::new(q.i, q.j, q.k);
    let t = im.cross(v);
    let two = N::splat(2.0);
    v + (t * q.w + im.cross(&t)) * two
}

/// An approximate rotation-error vector taking `target` to `actual`, expressed
/// in world space.
///
/// For small errors this is the axis of the relative rotation scaled by its
/// angle, which is the quantity constraint bias terms need.
#[inline]
pub fn small_rotation_error<N: SimdRealCopy>(
    target: &Quaternion<N>,
    actual: &Quaternion<N>,
) -> Vector3<N> {
    let rel = quat_mul(actual, &quat_conjugate(target));
    // Pick the short arc: flip the sign when w < 0.
    let flip = rel.w.simd_lt(N::zero());
    let sign = (-N::one()).select(flip, N::one());
    Vector3::new(rel.i, rel.j, rel.k) * (N::splat(2.0) * sign)
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;
    use na::{Quaternion, UnitQuaternion, Vector3};

    #[test]
    fn rotate_matches_unit_quaternion() {
        let uq = UnitQuaternion::from_euler_angles(0.3f32, -0.8, 1.1);
        let v = Vector3::new(1.0, -2.0, 0.5);
        let rotated = quat_rotate_vector(uq.quaternion(), &v);
        assert_relative_eq!(rotated, uq * v, epsilon = 1.0e-5);
    }

    #[test]
    fn mul_matches_nalgebra() {
        let a = UnitQuaternion::from_euler_angles(0.1f32, 0.2, 0.3);
        let b = UnitQuaternion::from_euler_angles(-0.5f32, 0.4, 0.9);
        let ours = quat_mul(a.quaternion(), b.quaternion());
        let theirs: Quaternion<f32> = (a * b).into_inner();
        assert_relative_eq!(ours.coords, theirs.coords, epsilon = 1.0e-6);
    }

    #[test]
    fn small_error_recovers_axis_angle() {
        let target = UnitQuaternion::from_euler_angles(0.0f32, 0.0, 0.0);
        let actual = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 1.0e-3);
        let err = small_rotation_error(target.quaternion(), actual.quaternion());
        assert_relative_eq!(err.y, 1.0e-3, epsilon = 1.0e-6);
    }
}
