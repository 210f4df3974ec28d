//! A 1-DOF angular gear motor: drives body B's angular velocity around an
//! axis to a multiple of body A's.

use crate::dynamics::solver::bundle::{
    read_scalar_lane, read_vector_lane, write_scalar_lane, write_vector_lane, BodyAccessFilter,
    BodyBundle,
};
use crate::dynamics::solver::type_batch::TwoBodyConstraint;
use crate::impl_lane_ops;
use crate::math::{Real, SimdReal, Vector};
use crate::utils::quat_rotate_vector;
use na::SimdPartialOrd;

/// The angular-axis gear motor constraint type.
pub enum AngularAxisGearMotor {}

/// Description of one gear motor.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct AngularAxisGearMotorDescription {
    /// The rotation axis, unit length, in body A's frame.
    pub local_axis: Vector<Real>,
    /// The target ratio: B's angular velocity around the axis should be A's
    /// times this scale.
    pub velocity_scale: Real,
    /// The maximum magnitude of the accumulated impulse.
    pub max_impulse: Real,
}

impl Default for AngularAxisGearMotorDescription {
    fn default() -> Self {
        Self {
            local_axis: Vector::y(),
            velocity_scale: 1.0,
            max_impulse: Real::MAX,
        }
    }
}

/// Wide prestep data of a gear motor bundle.
#[derive(Copy, Clone)]
pub struct AngularAxisGearMotorPrestep {
    local_axis: Vector<SimdReal>,
    velocity_scale: SimdReal,
    max_impulse: SimdReal,
}

impl_lane_ops!(AngularAxisGearMotorPrestep {
    local_axis,
    velocity_scale,
    max_impulse
});

/// Wide accumulated impulse of a gear motor bundle.
#[derive(Copy, Clone, PartialEq)]
pub struct AngularAxisGearMotorImpulse {
    total: SimdReal,
}

impl_lane_ops!(AngularAxisGearMotorImpulse { total });

#[inline(always)]
fn apply(
    body_a: &mut BodyBundle,
    body_b: &mut BodyBundle,
    axis: &Vector<SimdReal>,
    velocity_scale: SimdReal,
    impulse: SimdReal,
) {
    body_a.angvel -= (body_a.inv_inertia * *axis) * (impulse * velocity_scale);
    body_b.angvel += (body_b.inv_inertia * *axis) * impulse;
}

impl TwoBodyConstraint for AngularAxisGearMotor {
    type Prestep = AngularAxisGearMotorPrestep;
    type Impulse = AngularAxisGearMotorImpulse;
    type Description = AngularAxisGearMotorDescription;

    const NAME: &'static str = "AngularAxisGearMotor";
    const FILTER: BodyAccessFilter = BodyAccessFilter::AngularOnly;

    fn apply_description(
        prestep: &mut AngularAxisGearMotorPrestep,
        lane: usize,
        desc: &AngularAxisGearMotorDescription,
    ) {
        debug_assert!(
            (desc.local_axis.norm() - 1.0).abs() < 1.0e-4,
            "the motor axis must be unit length"
        );
        write_vector_lane(&mut prestep.local_axis, lane, desc.local_axis);
        write_scalar_lane(&mut prestep.velocity_scale, lane, desc.velocity_scale);
        write_scalar_lane(&mut prestep.max_impulse, lane, desc.max_impulse);
    }

    fn extract_description(
        prestep: &AngularAxisGearMotorPrestep,
        lane: usize,
    ) -> AngularAxisGearMotorDescription {
        AngularAxisGearMotorDescription {
            local_axis: read_vector_lane(&prestep.local_axis, lane),
            velocity_scale: read_scalar_lane(&prestep.velocity_scale, lane),
            max_impulse: read_scalar_lane(&prestep.max_impulse, lane),
        }
    }

    fn warm_start(
        prestep: &AngularAxisGearMotorPrestep,
        impulse: &AngularAxisGearMotorImpulse,
        body_a: &mut BodyBundle,
        body_b: &mut BodyBundle,
        _dt: SimdReal,
        _inv_dt: SimdReal,
    ) {
        let axis = quat_rotate_vector(&body_a.orientation, &prestep.local_axis);
        apply(body_a, body_b, &axis, prestep.velocity_scale, impulse.total);
    }

    fn solve(
        prestep: &AngularAxisGearMotorPrestep,
        impulse: &mut AngularAxisGearMotorImpulse,
        body_a: &mut BodyBundle,
        body_b: &mut BodyBundle,
        _dt: SimdReal,
        _inv_dt: SimdReal,
    ) {
        let axis = quat_rotate_vector(&body_a.orientation, &prestep.local_axis);
        let scale = prestep.velocity_scale;

        let effective_mass_inv = (body_a.inv_inertia * axis).dot(&axis) * scale * scale
            + (body_b.inv_inertia * axis).dot(&axis);
        let csv = body_b.angvel.dot(&axis) - body_a.angvel.dot(&axis) * scale;
        let unclamped = impulse.total - csv / effective_mass_inv;
        let clamped = unclamped.simd_clamp(-prestep.max_impulse, prestep.max_impulse);
        let delta = clamped - impulse.total;
        impulse.total = clamped;
        apply(body_a, body_b, &axis, scale, delta);
    }
}
