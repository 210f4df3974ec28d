//! A 1-DOF unilateral contact: a single point pushed apart along a normal.
//!
//! Collision detection is an external collaborator; it feeds contact points
//! in as constraints like any other type and refreshes their descriptions
//! between steps.

use crate::dynamics::solver::bundle::{
    read_scalar_lane, read_vector_lane, write_scalar_lane, write_vector_lane, BodyBundle,
};
use crate::dynamics::solver::type_batch::TwoBodyConstraint;
use crate::dynamics::{SoftnessCoefficients, SpringSettings};
use crate::impl_lane_ops;
use crate::math::{Real, SimdReal, Vector};
use crate::utils::quat_rotate_vector;
use na::{SimdPartialOrd, SimdValue};

/// The point-contact constraint type.
pub enum PointContact {}

/// Description of one contact point.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct PointContactDescription {
    /// The contact point in body A's frame, relative to its center.
    pub local_offset_a: Vector<Real>,
    /// The contact point in body B's frame, relative to its center.
    pub local_offset_b: Vector<Real>,
    /// The contact normal in body A's frame, unit length, pointing from A
    /// towards B.
    pub local_normal_a: Vector<Real>,
    /// The contact's softness.
    pub spring: SpringSettings,
}

impl Default for PointContactDescription {
    fn default() -> Self {
        Self {
            local_offset_a: Vector::zeros(),
            local_offset_b: Vector::zeros(),
            local_normal_a: Vector::y(),
            spring: SpringSettings::contact_defaults(),
        }
    }
}

/// Wide prestep data of a contact bundle.
#[derive(Copy, Clone)]
pub struct PointContactPrestep {
    local_offset_a: Vector<SimdReal>,
    local_offset_b: Vector<SimdReal>,
    local_normal_a: Vector<SimdReal>,
    frequency: SimdReal,
    damping_ratio: SimdReal,
}

impl_lane_ops!(PointContactPrestep {
    local_offset_a,
    local_offset_b,
    local_normal_a,
    frequency,
    damping_ratio
});

/// Wide accumulated normal impulse of a contact bundle. Never negative:
/// contacts push, they do not glue.
#[derive(Copy, Clone, PartialEq)]
pub struct PointContactImpulse {
    normal: SimdReal,
}

impl_lane_ops!(PointContactImpulse { normal });

#[inline(always)]
fn apply(
    body_a: &mut BodyBundle,
    body_b: &mut BodyBundle,
    normal: &Vector<SimdReal>,
    r_a: &Vector<SimdReal>,
    r_b: &Vector<SimdReal>,
    impulse: SimdReal,
) {
    let linear = normal * impulse;
    body_a.linvel -= linear * body_a.inv_mass;
    body_a.angvel -= body_a.inv_inertia * r_a.cross(&linear);
    body_b.linvel += linear * body_b.inv_mass;
    body_b.angvel += body_b.inv_inertia * r_b.cross(&linear);
}

impl TwoBodyConstraint for PointContact {
    type Prestep = PointContactPrestep;
    type Impulse = PointContactImpulse;
    type Description = PointContactDescription;

    const NAME: &'static str = "PointContact";

    fn apply_description(
        prestep: &mut PointContactPrestep,
        lane: usize,
        desc: &PointContactDescription,
    ) {
        debug_assert!(
            (desc.local_normal_a.norm() - 1.0).abs() < 1.0e-4,
            "the contact normal must be unit length"
        );
        write_vector_lane(&mut prestep.local_offset_a, lane, desc.local_offset_a);
        write_vector_lane(&mut prestep.local_offset_b, lane, desc.local_offset_b);
        write_vector_lane(&mut prestep.local_normal_a, lane, desc.local_normal_a);
        write_scalar_lane(&mut prestep.frequency, lane, desc.spring.frequency);
        write_scalar_lane(&mut prestep.damping_ratio, lane, desc.spring.damping_ratio);
    }

    fn extract_description(prestep: &PointContactPrestep, lane: usize) -> PointContactDescription {
        PointContactDescription {
            local_offset_a: read_vector_lane(&prestep.local_offset_a, lane),
            local_offset_b: read_vector_lane(&prestep.local_offset_b, lane),
            local_normal_a: read_vector_lane(&prestep.local_normal_a, lane),
            spring: SpringSettings::new(
                read_scalar_lane(&prestep.frequency, lane),
                read_scalar_lane(&prestep.damping_ratio, lane),
            ),
        }
    }

    fn warm_start(
        prestep: &PointContactPrestep,
        impulse: &PointContactImpulse,
        body_a: &mut BodyBundle,
        body_b: &mut BodyBundle,
        _dt: SimdReal,
        _inv_dt: SimdReal,
    ) {
        let normal = quat_rotate_vector(&body_a.orientation, &prestep.local_normal_a);
        let r_a = quat_rotate_vector(&body_a.orientation, &prestep.local_offset_a);
        let r_b = quat_rotate_vector(&body_b.orientation, &prestep.local_offset_b);
        apply(body_a, body_b, &normal, &r_a, &r_b, impulse.normal);
    }

    fn solve(
        prestep: &PointContactPrestep,
        impulse: &mut PointContactImpulse,
        body_a: &mut BodyBundle,
        body_b: &mut BodyBundle,
        dt: SimdReal,
        _inv_dt: SimdReal,
    ) {
        let softness =
            SoftnessCoefficients::new(prestep.frequency, prestep.damping_ratio, dt);
        let normal = quat_rotate_vector(&body_a.orientation, &prestep.local_normal_a);
        let r_a = quat_rotate_vector(&body_a.orientation, &prestep.local_offset_a);
        let r_b = quat_rotate_vector(&body_b.orientation, &prestep.local_offset_b);

        let angular_a = r_a.cross(&normal);
        let angular_b = r_b.cross(&normal);
        let effective_mass_inv = body_a.inv_mass
            + body_b.inv_mass
            + (body_a.inv_inertia * angular_a).dot(&angular_a)
            + (body_b.inv_inertia * angular_b).dot(&angular_b);

        let separation =
            (body_b.position + r_b - body_a.position - r_a).dot(&normal);
        let csv = (body_b.linvel + body_b.angvel.cross(&r_b)
            - body_a.linvel
            - body_a.angvel.cross(&r_a))
        .dot(&normal);

        let unclamped = impulse.normal
            + (-(csv + separation * softness.bias) / effective_mass_inv)
                * softness.effective_mass_scale
            - impulse.normal * softness.impulse_scale;
        // The accumulated normal impulse can only push.
        let clamped = unclamped.simd_max(SimdReal::splat(0.0));
        let delta = clamped - impulse.normal;
        impulse.normal = clamped;
        apply(body_a, body_b, &normal, &r_a, &r_b, delta);
    }
}
