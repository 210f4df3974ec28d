//! A 3-DOF ball and socket: pins one anchor point of each body together.

use crate::dynamics::solver::bundle::{
    read_scalar_lane, read_vector_lane, write_scalar_lane, write_vector_lane, BodyBundle,
};
use crate::dynamics::solver::type_batch::TwoBodyConstraint;
use crate::dynamics::{SoftnessCoefficients, SpringSettings};
use crate::impl_lane_ops;
use crate::math::{Real, SimdReal, Vector};
use crate::utils::{quat_rotate_vector, SimdCrossMatrix};

/// The ball-and-socket constraint type.
pub enum BallSocket {}

/// Description of one ball-and-socket constraint.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct BallSocketDescription {
    /// The anchor point in body A's frame, relative to its center.
    pub local_anchor_a: Vector<Real>,
    /// The anchor point in body B's frame, relative to its center.
    pub local_anchor_b: Vector<Real>,
    /// The constraint's stiffness.
    pub spring: SpringSettings,
}

impl Default for BallSocketDescription {
    fn default() -> Self {
        Self {
            local_anchor_a: Vector::zeros(),
            local_anchor_b: Vector::zeros(),
            spring: SpringSettings::rigid(),
        }
    }
}

/// Wide prestep data of a ball-and-socket bundle.
#[derive(Copy, Clone)]
pub struct BallSocketPrestep {
    local_anchor_a: Vector<SimdReal>,
    local_anchor_b: Vector<SimdReal>,
    frequency: SimdReal,
    damping_ratio: SimdReal,
}

impl_lane_ops!(BallSocketPrestep {
    local_anchor_a,
    local_anchor_b,
    frequency,
    damping_ratio
});

/// Wide accumulated impulses of a ball-and-socket bundle.
#[derive(Copy, Clone, PartialEq)]
pub struct BallSocketImpulse {
    linear: Vector<SimdReal>,
}

impl_lane_ops!(BallSocketImpulse { linear });

#[inline(always)]
fn apply(
    body_a: &mut BodyBundle,
    body_b: &mut BodyBundle,
    r_a: &Vector<SimdReal>,
    r_b: &Vector<SimdReal>,
    linear: &Vector<SimdReal>,
) {
    body_a.linvel -= linear * body_a.inv_mass;
    body_a.angvel -= body_a.inv_inertia * r_a.cross(linear);
    body_b.linvel += linear * body_b.inv_mass;
    body_b.angvel += body_b.inv_inertia * r_b.cross(linear);
}

impl TwoBodyConstraint for BallSocket {
    type Prestep = BallSocketPrestep;
    type Impulse = BallSocketImpulse;
    type Description = BallSocketDescription;

    const NAME: &'static str = "BallSocket";

    fn apply_description(
        prestep: &mut BallSocketPrestep,
        lane: usize,
        desc: &BallSocketDescription,
    ) {
        write_vector_lane(&mut prestep.local_anchor_a, lane, desc.local_anchor_a);
        write_vector_lane(&mut prestep.local_anchor_b, lane, desc.local_anchor_b);
        write_scalar_lane(&mut prestep.frequency, lane, desc.spring.frequency);
        write_scalar_lane(&mut prestep.damping_ratio, lane, desc.spring.damping_ratio);
    }

    fn extract_description(prestep: &BallSocketPrestep, lane: usize) -> BallSocketDescription {
        BallSocketDescription {
            local_anchor_a: read_vector_lane(&prestep.local_anchor_a, lane),
            local_anchor_b: read_vector_lane(&prestep.local_anchor_b, lane),
            spring: SpringSettings::new(
                read_scalar_lane(&prestep.frequency, lane),
                read_scalar_lane(&prestep.damping_ratio, lane),
            ),
        }
    }

    fn warm_start(
        prestep: &BallSocketPrestep,
        impulse: &BallSocketImpulse,
        body_a: &mut BodyBundle,
        body_b: &mut BodyBundle,
        _dt: SimdReal,
        _inv_dt: SimdReal,
    ) {
        let r_a = quat_rotate_vector(&body_a.orientation, &prestep.local_anchor_a);
        let r_b = quat_rotate_vector(&body_b.orientation, &prestep.local_anchor_b);
        apply(body_a, body_b, &r_a, &r_b, &impulse.linear);
    }

    fn solve(
        prestep: &BallSocketPrestep,
        impulse: &mut BallSocketImpulse,
        body_a: &mut BodyBundle,
        body_b: &mut BodyBundle,
        dt: SimdReal,
        _inv_dt: SimdReal,
    ) {
        let softness =
            SoftnessCoefficients::new(prestep.frequency, prestep.damping_ratio, dt);
        let r_a = quat_rotate_vector(&body_a.orientation, &prestep.local_anchor_a);
        let r_b = quat_rotate_vector(&body_b.orientation, &prestep.local_anchor_b);

        let effective_mass = (body_a.inv_inertia.quadform(&r_a.gcross_matrix())
            + body_b.inv_inertia.quadform(&r_b.gcross_matrix()))
        .add_diagonal(body_a.inv_mass + body_b.inv_mass)
        .inverse_unchecked();

        let error = body_b.position + r_b - body_a.position - r_a;
        let csv = body_b.linvel + body_b.angvel.cross(&r_b)
            - body_a.linvel
            - body_a.angvel.cross(&r_a);
        let rhs = -(csv + error * softness.bias);
        let delta = (effective_mass * rhs) * softness.effective_mass_scale
            - impulse.linear * softness.impulse_scale;
        impulse.linear += delta;
        apply(body_a, body_b, &r_a, &r_b, &delta);
    }
}
