//! A 6-DOF weld: locks the relative pose of two bodies.

use crate::dynamics::solver::bundle::{
    read_quat_lane, read_scalar_lane, read_vector_lane, write_quat_lane, write_scalar_lane,
    write_vector_lane, BodyBundle,
};
use crate::dynamics::solver::type_batch::TwoBodyConstraint;
use crate::dynamics::{SoftnessCoefficients, SpringSettings};
use crate::impl_lane_ops;
use crate::math::{Quaternion, Real, Rotation, SimdReal, Vector};
use crate::utils::{quat_mul, quat_rotate_vector, small_rotation_error, SimdCrossMatrix};

/// The weld constraint type.
pub enum Weld {}

/// Description of one weld: the target pose of body B in body A's frame.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct WeldDescription {
    /// The offset from A's center to B's center, in A's frame.
    pub local_offset: Vector<Real>,
    /// B's orientation relative to A.
    pub local_orientation: Rotation<Real>,
    /// The constraint's stiffness.
    pub spring: SpringSettings,
}

impl Default for WeldDescription {
    fn default() -> Self {
        Self {
            local_offset: Vector::zeros(),
            local_orientation: Rotation::identity(),
            spring: SpringSettings::rigid(),
        }
    }
}

/// Wide prestep data of a weld bundle.
#[derive(Copy, Clone)]
pub struct WeldPrestep {
    local_offset: Vector<SimdReal>,
    local_orientation: Quaternion<SimdReal>,
    frequency: SimdReal,
    damping_ratio: SimdReal,
}

impl_lane_ops!(WeldPrestep {
    local_offset,
    local_orientation,
    frequency,
    damping_ratio
});

/// Wide accumulated impulses of a weld bundle.
#[derive(Copy, Clone, PartialEq)]
pub struct WeldImpulse {
    linear: Vector<SimdReal>,
    angular: Vector<SimdReal>,
}

impl_lane_ops!(WeldImpulse { linear, angular });

#[inline(always)]
fn apply(
    body_a: &mut BodyBundle,
    body_b: &mut BodyBundle,
    r: &Vector<SimdReal>,
    linear: &Vector<SimdReal>,
    angular: &Vector<SimdReal>,
) {
    body_a.linvel -= linear * body_a.inv_mass;
    body_a.angvel -= body_a.inv_inertia * (r.cross(linear) + angular);
    body_b.linvel += linear * body_b.inv_mass;
    body_b.angvel += body_b.inv_inertia * *angular;
}

impl TwoBodyConstraint for Weld {
    type Prestep = WeldPrestep;
    type Impulse = WeldImpulse;
    type Description = WeldDescription;

    const NAME: &'static str = "Weld";

    fn apply_description(prestep: &mut WeldPrestep, lane: usize, desc: &WeldDescription) {
        write_vector_lane(&mut prestep.local_offset, lane, desc.local_offset);
        write_quat_lane(
            &mut prestep.local_orientation,
            lane,
            *desc.local_orientation.quaternion(),
        );
        write_scalar_lane(&mut prestep.frequency, lane, desc.spring.frequency);
        write_scalar_lane(&mut prestep.damping_ratio, lane, desc.spring.damping_ratio);
    }

    fn extract_description(prestep: &WeldPrestep, lane: usize) -> WeldDescription {
        WeldDescription {
            local_offset: read_vector_lane(&prestep.local_offset, lane),
            local_orientation: Rotation::new_unchecked(read_quat_lane(
                &prestep.local_orientation,
                lane,
            )),
            spring: SpringSettings::new(
                read_scalar_lane(&prestep.frequency, lane),
                read_scalar_lane(&prestep.damping_ratio, lane),
            ),
        }
    }

    fn warm_start(
        prestep: &WeldPrestep,
        impulse: &WeldImpulse,
        body_a: &mut BodyBundle,
        body_b: &mut BodyBundle,
        _dt: SimdReal,
        _inv_dt: SimdReal,
    ) {
        let r = quat_rotate_vector(&body_a.orientation, &prestep.local_offset);
        apply(body_a, body_b, &r, &impulse.linear, &impulse.angular);
    }

    fn solve(
        prestep: &WeldPrestep,
        impulse: &mut WeldImpulse,
        body_a: &mut BodyBundle,
        body_b: &mut BodyBundle,
        dt: SimdReal,
        _inv_dt: SimdReal,
    ) {
        let softness =
            SoftnessCoefficients::new(prestep.frequency, prestep.damping_ratio, dt);
        let r = quat_rotate_vector(&body_a.orientation, &prestep.local_offset);

        // Angular DOFs first: identity jacobians on both angular velocities.
        let target = quat_mul(&body_a.orientation, &prestep.local_orientation);
        let angular_error = small_rotation_error(&target, &body_b.orientation);
        let angular_mass = (body_a.inv_inertia + body_b.inv_inertia).inverse_unchecked();
        let angular_csv = body_b.angvel - body_a.angvel;
        let angular_rhs = -(angular_csv + angular_error * softness.bias);
        let angular_delta = (angular_mass * angular_rhs) * softness.effective_mass_scale
            - impulse.angular * softness.impulse_scale;
        impulse.angular += angular_delta;
        body_a.angvel -= body_a.inv_inertia * angular_delta;
        body_b.angvel += body_b.inv_inertia * angular_delta;

        // Linear DOFs: B's center follows A's frame; only A carries an
        // angular jacobian.
        let rx = r.gcross_matrix();
        let linear_mass = body_a
            .inv_inertia
            .quadform(&rx)
            .add_diagonal(body_a.inv_mass + body_b.inv_mass)
            .inverse_unchecked();
        let linear_error = body_b.position - body_a.position - r;
        let linear_csv = body_b.linvel - body_a.linvel - body_a.angvel.cross(&r);
        let linear_rhs = -(linear_csv + linear_error * softness.bias);
        let linear_delta = (linear_mass * linear_rhs) * softness.effective_mass_scale
            - impulse.linear * softness.impulse_scale;
        impulse.linear += linear_delta;
        body_a.linvel -= linear_delta * body_a.inv_mass;
        body_a.angvel -= body_a.inv_inertia * r.cross(&linear_delta);
        body_b.linvel += linear_delta * body_b.inv_mass;
    }
}
