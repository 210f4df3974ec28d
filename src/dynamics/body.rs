//! Rigid bodies and their dynamic properties.

use crate::data::arena::Index;
use crate::dynamics::ConstraintHandle;
use crate::math::{AngVector, Isometry, Real, Vector};
use crate::utils::SdpMatrix3;

/// The unique handle of a rigid body, stable across every structural change.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct BodyHandle(pub Index);

impl BodyHandle {
    /// Converts this handle into its (index, generation) raw parts.
    pub fn into_raw_parts(self) -> (u32, u32) {
        self.0.into_raw_parts()
    }

    /// Reconstructs a handle from raw parts returned by `into_raw_parts`.
    pub fn from_raw_parts(index: u32, generation: u32) -> Self {
        Self(Index::from_raw_parts(index, generation))
    }

    /// A handle that will never identify a live body.
    pub fn invalid() -> Self {
        Self(Index::invalid())
    }
}

/// The linear and angular velocity of a rigid body.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct BodyVelocity {
    /// The linear velocity of the center of mass.
    pub linvel: Vector,
    /// The angular velocity, as an axis scaled by the rotation rate.
    pub angvel: AngVector,
}

impl BodyVelocity {
    /// A zero velocity.
    pub fn zero() -> Self {
        Self {
            linvel: Vector::zeros(),
            angvel: AngVector::zeros(),
        }
    }

    /// The kinetic energy of a body with this velocity and the given inertia.
    pub fn kinetic_energy(&self, inertia: &BodyInertia) -> Real {
        let linear = if inertia.inv_mass > 0.0 {
            0.5 * self.linvel.norm_squared() / inertia.inv_mass
        } else {
            0.0
        };
        // Angular part through the inverse inertia is only meaningful for
        // invertible tensors; treat zero rows as massless.
        let ii = inertia.local_inv_inertia;
        let angular = if ii.m11 > 0.0 && ii.m22 > 0.0 && ii.m33 > 0.0 {
            0.5 * (ii.inverse_unchecked() * self.angvel).dot(&self.angvel)
        } else {
            0.0
        };
        linear + angular
    }
}

impl Default for BodyVelocity {
    fn default() -> Self {
        Self::zero()
    }
}

/// The inverse mass and local-space inverse inertia tensor of a rigid body.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct BodyInertia {
    /// The inverse of the body's mass. Zero makes the body translationally
    /// unresponsive.
    pub inv_mass: Real,
    /// The inverse of the body's inertia tensor in its local frame. Zero makes
    /// the body rotationally unresponsive.
    pub local_inv_inertia: SdpMatrix3<Real>,
}

impl BodyInertia {
    /// The inertia of a body that does not respond to any impulse.
    pub fn fixed() -> Self {
        Self {
            inv_mass: 0.0,
            local_inv_inertia: SdpMatrix3::zero(),
        }
    }

    /// Builds the inertia of a dynamic body from its mass and principal
    /// angular inertia.
    pub fn from_mass_and_principal_inertia(mass: Real, principal_inertia: Vector) -> Self {
        Self {
            inv_mass: crate::utils::simd_inv(mass),
            local_inv_inertia: SdpMatrix3::from_diagonal(principal_inertia.map(crate::utils::simd_inv)),
        }
    }
}

/// A reference from a body to one of the constraints attached to it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct BodyConstraintRef {
    /// The attached constraint.
    pub handle: ConstraintHandle,
    /// Which of the constraint's body slots refers to this body.
    pub index_in_constraint: u32,
}

/// A rigid body: pose, velocity, inertia, and its constraint adjacency list.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct RigidBody {
    /// The world-space pose of the body's center of mass.
    pub pose: Isometry,
    /// The body's velocity.
    pub vels: BodyVelocity,
    /// The body's mass properties.
    pub inertia: BodyInertia,
    /// The world-space inverse inertia tensor, refreshed at each sub-step the
    /// body is integrated.
    pub world_inv_inertia: SdpMatrix3<Real>,
    /// The constraints attached to this body.
    pub(crate) constraints: Vec<BodyConstraintRef>,
}

impl RigidBody {
    /// Creates a dynamic body at the given pose.
    pub fn dynamic(pose: Isometry, inertia: BodyInertia) -> Self {
        let world_inv_inertia = world_inv_inertia(&inertia.local_inv_inertia, &pose);
        Self {
            pose,
            vels: BodyVelocity::zero(),
            inertia,
            world_inv_inertia,
            constraints: Vec::new(),
        }
    }

    /// Creates a body that never responds to impulses nor integrates.
    pub fn fixed(pose: Isometry) -> Self {
        Self::dynamic(pose, BodyInertia::fixed())
    }

    /// Whether this body responds to impulses.
    #[inline]
    pub fn is_dynamic(&self) -> bool {
        let ii = &self.inertia.local_inv_inertia;
        self.inertia.inv_mass != 0.0 || ii.m11 != 0.0 || ii.m22 != 0.0 || ii.m33 != 0.0
    }

    /// The constraints currently attached to this body.
    pub fn attached_constraints(&self) -> &[BodyConstraintRef] {
        &self.constraints
    }

    /// Recomputes the world-space inverse inertia from the local inertia and
    /// the current orientation.
    pub fn refresh_world_inertia(&mut self) {
        self.world_inv_inertia = world_inv_inertia(&self.inertia.local_inv_inertia, &self.pose);
    }
}

/// Rotates a local-space inverse inertia tensor into world space.
pub(crate) fn world_inv_inertia(
    local_inv_inertia: &SdpMatrix3<Real>,
    pose: &Isometry,
) -> SdpMatrix3<Real> {
    let rot = pose.rotation.to_rotation_matrix();
    // R * I⁻¹ * Rᵀ, expressed through the quadratic form on Rᵀ.
    local_inv_inertia.quadform(&rot.matrix().transpose())
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;
    use na::Vector3;

    #[test]
    fn world_inertia_of_axis_aligned_body_is_local() {
        let inertia = BodyInertia::from_mass_and_principal_inertia(2.0, Vector3::new(1.0, 2.0, 3.0));
        let rb = RigidBody::dynamic(Isometry::translation(1.0, 2.0, 3.0), inertia);
        assert_relative_eq!(
            rb.world_inv_inertia.into_matrix(),
            inertia.local_inv_inertia.into_matrix(),
            epsilon = 1.0e-6
        );
    }

    #[test]
    fn world_inertia_follows_rotation() {
        let inertia = BodyInertia::from_mass_and_principal_inertia(1.0, Vector3::new(1.0, 2.0, 1.0));
        let pose = Isometry::rotation(Vector3::z() * std::f32::consts::FRAC_PI_2);
        let rb = RigidBody::dynamic(pose, inertia);
        // A quarter turn around z swaps the x and y principal axes.
        assert_relative_eq!(rb.world_inv_inertia.m11, 0.5, epsilon = 1.0e-5);
        assert_relative_eq!(rb.world_inv_inertia.m22, 1.0, epsilon = 1.0e-5);
    }

    #[test]
    fn fixed_body_is_not_dynamic() {
        let rb = RigidBody::fixed(Isometry::identity());
        assert!(!rb.is_dynamic());
        assert!(RigidBody::dynamic(
            Isometry::identity(),
            BodyInertia::from_mass_and_principal_inertia(1.0, Vector3::repeat(1.0))
        )
        .is_dynamic());
    }
}
