//! AOSOA bundle layout primitives.
//!
//! Within a type batch every field is stored in bundles of `SIMD_WIDTH`
//! consecutive constraints: a wide struct holds one SIMD register per scalar
//! slot, so the stride between consecutive bundles is `SIMD_WIDTH *
//! size_of::<Real>()` per slot and lanes of one bundle are adjacent in memory.

use crate::math::{Quaternion, Real, SimdBool, SimdReal, Vector, SIMD_WIDTH};
use crate::utils::SdpMatrix3;
use na::SimdValue;

/// Returns the bundle containing the constraint at linear index `i`.
#[inline(always)]
pub fn bundle_index(i: usize) -> usize {
    i >> SIMD_WIDTH.trailing_zeros()
}

/// Returns the lane of the constraint at linear index `i` within its bundle.
#[inline(always)]
pub fn inner_index(i: usize) -> usize {
    i & (SIMD_WIDTH - 1)
}

/// The number of bundles needed to hold `count` constraints.
#[inline(always)]
pub fn bundle_count(count: usize) -> usize {
    count.div_ceil(SIMD_WIDTH)
}

/// A bundle of per-lane body indices for one body slot of a constraint type.
///
/// Unused lanes hold `u32::MAX`.
pub type BodyIndexLanes = [u32; SIMD_WIDTH];

/// The body-index value marking an unused lane.
pub const EMPTY_LANE: u32 = crate::INVALID_U32;

/// Lane-level operations every bundled field type must support: they are what
/// swap-removal, inter-batch transfer and sleep/wake copies are built from.
pub trait LaneOps: Copy + 'static {
    /// A bundle with every lane cleared.
    fn zeroed() -> Self;
    /// Copies lane `src_lane` of `src` into lane `dst_lane` of `dst`.
    fn copy_lane(src: &Self, src_lane: usize, dst: &mut Self, dst_lane: usize);
    /// Clears lane `lane` of `self`.
    fn clear_lane(&mut self, lane: usize) {
        let zero = Self::zeroed();
        Self::copy_lane(&zero, lane, self, lane);
    }
}

impl LaneOps for SimdReal {
    #[inline]
    fn zeroed() -> Self {
        SimdReal::splat(0.0)
    }

    #[inline]
    fn copy_lane(src: &Self, src_lane: usize, dst: &mut Self, dst_lane: usize) {
        dst.replace(dst_lane, src.extract(src_lane));
    }
}

impl LaneOps for Vector<SimdReal> {
    #[inline]
    fn zeroed() -> Self {
        Vector::repeat(SimdReal::splat(0.0))
    }

    #[inline]
    fn copy_lane(src: &Self, src_lane: usize, dst: &mut Self, dst_lane: usize) {
        for k in 0..3 {
            LaneOps::copy_lane(&src[k], src_lane, &mut dst[k], dst_lane);
        }
    }
}

impl LaneOps for Quaternion<SimdReal> {
    #[inline]
    fn zeroed() -> Self {
        Quaternion::from_parts(SimdReal::splat(0.0), Vector::repeat(SimdReal::splat(0.0)))
    }

    #[inline]
    fn copy_lane(src: &Self, src_lane: usize, dst: &mut Self, dst_lane: usize) {
        for k in 0..4 {
            LaneOps::copy_lane(&src.coords[k], src_lane, &mut dst.coords[k], dst_lane);
        }
    }
}

impl LaneOps for SdpMatrix3<SimdReal> {
    #[inline]
    fn zeroed() -> Self {
        SdpMatrix3::zero()
    }

    #[inline]
    fn copy_lane(src: &Self, src_lane: usize, dst: &mut Self, dst_lane: usize) {
        LaneOps::copy_lane(&src.m11, src_lane, &mut dst.m11, dst_lane);
        LaneOps::copy_lane(&src.m12, src_lane, &mut dst.m12, dst_lane);
        LaneOps::copy_lane(&src.m13, src_lane, &mut dst.m13, dst_lane);
        LaneOps::copy_lane(&src.m22, src_lane, &mut dst.m22, dst_lane);
        LaneOps::copy_lane(&src.m23, src_lane, &mut dst.m23, dst_lane);
        LaneOps::copy_lane(&src.m33, src_lane, &mut dst.m33, dst_lane);
    }
}

impl LaneOps for BodyIndexLanes {
    #[inline]
    fn zeroed() -> Self {
        [EMPTY_LANE; SIMD_WIDTH]
    }

    #[inline]
    fn copy_lane(src: &Self, src_lane: usize, dst: &mut Self, dst_lane: usize) {
        dst[dst_lane] = src[src_lane];
    }
}

/// Implements [`LaneOps`] for a wide struct whose fields all implement it.
#[macro_export]
#[doc(hidden)]
macro_rules! impl_lane_ops {
    ($t: ty { $($field: ident),* $(,)? }) => {
        impl $crate::dynamics::solver::bundle::LaneOps for $t {
            #[inline]
            fn zeroed() -> Self {
                Self {
                    $($field: $crate::dynamics::solver::bundle::LaneOps::zeroed(),)*
                }
            }

            #[inline]
            fn copy_lane(src: &Self, src_lane: usize, dst: &mut Self, dst_lane: usize) {
                $($crate::dynamics::solver::bundle::LaneOps::copy_lane(
                    &src.$field, src_lane, &mut dst.$field, dst_lane,
                );)*
            }
        }
    };
}

/// Writes one lane of a widened scalar. This is the primitive
/// description-level I/O is built from.
#[inline]
pub fn write_scalar_lane(dst: &mut SimdReal, lane: usize, value: Real) {
    dst.replace(lane, value);
}

/// Reads one lane of a widened scalar.
#[inline]
pub fn read_scalar_lane(src: &SimdReal, lane: usize) -> Real {
    src.extract(lane)
}

/// Writes one lane of a widened vector.
#[inline]
pub fn write_vector_lane(dst: &mut Vector<SimdReal>, lane: usize, value: Vector<Real>) {
    for k in 0..3 {
        dst[k].replace(lane, value[k]);
    }
}

/// Reads one lane of a widened vector.
#[inline]
pub fn read_vector_lane(src: &Vector<SimdReal>, lane: usize) -> Vector<Real> {
    src.extract(lane)
}

/// Writes one lane of a widened quaternion.
#[inline]
pub fn write_quat_lane(dst: &mut Quaternion<SimdReal>, lane: usize, value: Quaternion<Real>) {
    for k in 0..4 {
        dst.coords[k].replace(lane, value.coords[k]);
    }
}

/// Reads one lane of a widened quaternion.
#[inline]
pub fn read_quat_lane(src: &Quaternion<SimdReal>, lane: usize) -> Quaternion<Real> {
    src.extract(lane)
}

/// Which body-state fields a gather actually needs. Purely an
/// instruction-count optimization: correctness never depends on the filter.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BodyAccessFilter {
    /// Gather pose, velocity and inertia.
    All,
    /// Gather only the angular state (orientation, angular velocity, inertia).
    AngularOnly,
    /// Gather only the linear state (position, linear velocity, inverse mass)
    /// and the orientation needed to interpret local-frame data.
    LinearOnly,
}

/// The gathered state of `SIMD_WIDTH` bodies, one per lane.
#[derive(Copy, Clone, Debug)]
pub struct BodyBundle {
    /// Center-of-mass positions.
    pub position: Vector<SimdReal>,
    /// Orientations (unit quaternions, lane-wise).
    pub orientation: Quaternion<SimdReal>,
    /// Linear velocities.
    pub linvel: Vector<SimdReal>,
    /// Angular velocities.
    pub angvel: Vector<SimdReal>,
    /// Inverse masses. Zero lanes do not respond to impulses.
    pub inv_mass: SimdReal,
    /// Inverse inertia tensors. World-space unless a gather explicitly asked
    /// for the local tensors to feed pose integration.
    pub inv_inertia: SdpMatrix3<SimdReal>,
}

/// Expands a per-lane bitmask (bit `i` = lane `i`) into a SIMD boolean mask.
#[inline]
pub fn lane_mask(bits: u32) -> SimdBool {
    #[cfg(not(feature = "simd-is-enabled"))]
    {
        bits & 1 != 0
    }
    #[cfg(feature = "simd-is-enabled")]
    {
        let mut mask = SimdBool::splat(false);
        for ii in 0..SIMD_WIDTH {
            if bits & (1 << ii) != 0 {
                mask.replace(ii, true);
            }
        }
        mask
    }
}

const _: () = assert!(SIMD_WIDTH.is_power_of_two());
const _: () = assert!(SIMD_WIDTH <= 64);

#[cfg(test)]
mod test {
    use super::*;
    use crate::math::SIMD_WIDTH;

    #[test]
    fn bundle_and_inner_indices() {
        for i in 0..64usize {
            assert_eq!(bundle_index(i), i / SIMD_WIDTH);
            assert_eq!(inner_index(i), i % SIMD_WIDTH);
        }
        assert_eq!(bundle_count(0), 0);
        assert_eq!(bundle_count(1), 1);
        assert_eq!(bundle_count(SIMD_WIDTH), 1);
        assert_eq!(bundle_count(SIMD_WIDTH + 1), 2);
    }

    #[test]
    fn lane_copy_moves_a_single_lane() {
        use crate::math::SimdReal;
        let mut a = SimdReal::splat(1.0);
        let b = SimdReal::splat(2.0);
        LaneOps::copy_lane(&b, 0, &mut a, 0);
        use na::SimdValue;
        assert_eq!(a.extract(0), 2.0);
        if SIMD_WIDTH > 1 {
            assert_eq!(a.extract(1), 1.0);
        }
    }

    #[test]
    fn cleared_body_reference_lanes_are_empty() {
        let mut refs = BodyIndexLanes::zeroed();
        assert!(refs.iter().all(|r| *r == EMPTY_LANE));
        refs[0] = 7;
        LaneOps::clear_lane(&mut refs, 0);
        assert_eq!(refs[0], EMPTY_LANE);
    }
}
