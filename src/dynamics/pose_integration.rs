//! Pose and velocity integration, including the variants fused into the
//! solver's warm-start stages.
//!
//! Orientation advances by the half-step quaternion of the angular velocity;
//! the world-space inverse inertia is re-derived from the new orientation at
//! every integration, so constraints always see fresh inertia.

use crate::data::IndexSet;
use crate::dynamics::solver::bundle::{BodyAccessFilter, BodyBundle, BodyIndexLanes, EMPTY_LANE};
use crate::dynamics::{BodySet, SolverParameters};
use crate::math::{Quaternion, Real, SimdBool, SimdReal, Vector, SIMD_WIDTH};
use crate::utils::{quat_mul, quat_normalize, quat_rotate_vector, SdpMatrix3, SimdRealCopy};
use na::{Matrix3, SimdValue};

/// How orientation integration treats angular momentum.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum AngularIntegrationMode {
    /// Angular velocity is integrated as-is. Cheapest, and what most games
    /// want.
    #[default]
    Nonconserving,
    /// Angular momentum is conserved across orientation changes.
    ConserveMomentum,
    /// Angular momentum is conserved and an implicit gyroscopic torque is
    /// applied.
    ConserveMomentumWithGyroscopicTorque,
}

/// The linear and angular velocity lanes handed to the velocity-integration
/// callback.
#[derive(Copy, Clone, Debug)]
pub struct VelocityBundle {
    /// Linear velocities.
    pub linear: Vector<SimdReal>,
    /// Angular velocities.
    pub angular: Vector<SimdReal>,
}

/// The user hook invoked for every body bundle when its velocities are
/// integrated (gravity, damping, user forces).
pub trait PoseIntegratorCallbacks {
    /// How orientation integration treats angular momentum.
    fn angular_integration_mode(&self) -> AngularIntegrationMode {
        AngularIntegrationMode::Nonconserving
    }

    /// Mutates `velocity` for the lanes selected by `integration_mask`.
    ///
    /// Changes written to unselected lanes are discarded by the caller, so an
    /// implementation is free to operate on the whole register.
    fn integrate_velocity(
        &self,
        body_indices: &BodyIndexLanes,
        position: &Vector<SimdReal>,
        orientation: &Quaternion<SimdReal>,
        inv_mass: SimdReal,
        local_inv_inertia: &SdpMatrix3<SimdReal>,
        integration_mask: SimdBool,
        worker_index: usize,
        dt: SimdReal,
        velocity: &mut VelocityBundle,
    );
}

/// A callback applying a uniform gravitational acceleration.
#[derive(Copy, Clone, Debug)]
pub struct Gravity {
    /// The gravitational acceleration.
    pub gravity: Vector<Real>,
    /// How orientation integration treats angular momentum.
    pub angular_mode: AngularIntegrationMode,
}

impl Gravity {
    /// A gravity callback with the default angular integration mode.
    pub fn new(gravity: Vector<Real>) -> Self {
        Self {
            gravity,
            angular_mode: AngularIntegrationMode::Nonconserving,
        }
    }
}

impl PoseIntegratorCallbacks for Gravity {
    fn angular_integration_mode(&self) -> AngularIntegrationMode {
        self.angular_mode
    }

    fn integrate_velocity(
        &self,
        _body_indices: &BodyIndexLanes,
        _position: &Vector<SimdReal>,
        _orientation: &Quaternion<SimdReal>,
        inv_mass: SimdReal,
        _local_inv_inertia: &SdpMatrix3<SimdReal>,
        _integration_mask: SimdBool,
        _worker_index: usize,
        dt: SimdReal,
        velocity: &mut VelocityBundle,
    ) {
        use na::SimdPartialOrd;
        // Bodies with zero inverse mass ignore gravity.
        let affected = inv_mass.simd_gt(SimdReal::splat(0.0));
        let gravity = Vector::<SimdReal>::splat(self.gravity);
        let new_linvel = velocity.linear + gravity * dt;
        velocity.linear = new_linvel.select(affected, velocity.linear);
    }
}

/// Advances `orientation` by the half-step quaternion of `angvel` over `dt`,
/// lane-wise, and re-normalizes.
#[inline]
pub fn integrate_orientation<N: SimdRealCopy>(
    orientation: &Quaternion<N>,
    angvel: &Vector<N>,
    dt: N,
) -> Quaternion<N> {
    let half = N::splat(0.5) * dt;
    let vel_quat = Quaternion::from_parts(N::zero(), angvel * half);
    let delta = quat_mul(&vel_quat, orientation);
    quat_normalize(&Quaternion::from_parts(
        orientation.w + delta.w,
        orientation.imag() + delta.imag(),
    ))
}

/// The rotation matrix of a unit widened quaternion.
#[inline]
fn rotation_matrix<N: SimdRealCopy>(q: &Quaternion<N>) -> Matrix3<N> {
    let two = N::splat(2.0);
    let (i, j, k, w) = (q.i, q.j, q.k, q.w);
    let (ii, jj, kk) = (i * i, j * j, k * k);
    let (ij, ik, jk) = (i * j, i * k, j * k);
    let (wi, wj, wk) = (w * i, w * j, w * k);
    Matrix3::new(
        N::one() - two * (jj + kk),
        two * (ij - wk),
        two * (ik + wj),
        two * (ij + wk),
        N::one() - two * (ii + kk),
        two * (jk - wi),
        two * (ik - wj),
        two * (jk + wi),
        N::one() - two * (ii + jj),
    )
}

/// Rotates a local-space inverse inertia tensor into world space, lane-wise.
#[inline]
pub fn rotate_inv_inertia<N: SimdRealCopy>(
    local_inv_inertia: &SdpMatrix3<N>,
    orientation: &Quaternion<N>,
) -> SdpMatrix3<N> {
    let rot = rotation_matrix(orientation);
    local_inv_inertia.quadform(&rot.transpose())
}

/// Inverts a 3×3 matrix by cofactor expansion, without an invertibility check.
#[inline]
fn inverse3_unchecked<N: SimdRealCopy>(m: &Matrix3<N>) -> Matrix3<N> {
    let c00 = m.m22 * m.m33 - m.m23 * m.m32;
    let c01 = m.m23 * m.m31 - m.m21 * m.m33;
    let c02 = m.m21 * m.m32 - m.m22 * m.m31;
    let inv_det = N::one() / (m.m11 * c00 + m.m12 * c01 + m.m13 * c02);
    Matrix3::new(
        c00 * inv_det,
        (m.m13 * m.m32 - m.m12 * m.m33) * inv_det,
        (m.m12 * m.m23 - m.m13 * m.m22) * inv_det,
        c01 * inv_det,
        (m.m11 * m.m33 - m.m13 * m.m31) * inv_det,
        (m.m13 * m.m21 - m.m11 * m.m23) * inv_det,
        c02 * inv_det,
        (m.m12 * m.m31 - m.m11 * m.m32) * inv_det,
        (m.m11 * m.m22 - m.m12 * m.m21) * inv_det,
    )
}

/// Adjusts the angular velocity so angular momentum is preserved across an
/// orientation change.
#[inline]
fn conserve_angular_momentum<N: SimdRealCopy>(
    local_inv_inertia: &SdpMatrix3<N>,
    prev_orientation: &Quaternion<N>,
    new_world_inv_inertia: &SdpMatrix3<N>,
    angvel: &Vector<N>,
) -> Vector<N> {
    let old_world_inv = rotate_inv_inertia(local_inv_inertia, prev_orientation);
    let momentum = old_world_inv.inverse_unchecked() * *angvel;
    *new_world_inv_inertia * momentum
}

/// Applies an implicit gyroscopic torque in the body's local frame.
///
/// Solves one Newton step of the implicit discretization of
/// `I ω̇ + ω × (I ω) = 0`, which stays stable where the explicit term
/// explodes.
#[inline]
fn apply_gyroscopic_torque<N: SimdRealCopy>(
    orientation: &Quaternion<N>,
    local_inv_inertia: &SdpMatrix3<N>,
    angvel: &Vector<N>,
    dt: N,
) -> Vector<N> {
    use crate::utils::{quat_conjugate, SimdCrossMatrix};
    let to_local = quat_conjugate(orientation);
    let local_w = quat_rotate_vector(&to_local, angvel);
    let local_inertia = local_inv_inertia.inverse_unchecked();
    let momentum = local_inertia * local_w;
    let residual = local_w.cross(&momentum) * dt;
    let jacobian = local_inertia.into_matrix()
        + (local_w.gcross_matrix() * local_inertia.into_matrix()
            - momentum.gcross_matrix())
            * dt;
    let delta = inverse3_unchecked(&jacobian) * residual;
    quat_rotate_vector(orientation, &(local_w - delta))
}

/// Integrates pose then velocity for the lanes selected by `mask`, leaving
/// other lanes bit-identical. Used by warm starts of every sub-step after the
/// first.
///
/// `bundle.inv_inertia` must hold the local-space tensors on input; on output
/// it holds the world-space tensors derived from the new orientations (for
/// every lane, flagged or not, since unflagged lanes keep their orientation).
pub fn integrate_pose_and_velocity(
    bundle: &mut BodyBundle,
    body_indices: &BodyIndexLanes,
    mask: SimdBool,
    mode: AngularIntegrationMode,
    callbacks: &dyn PoseIntegratorCallbacks,
    worker_index: usize,
    dt: SimdReal,
) {
    let local_inv_inertia = bundle.inv_inertia;

    let new_position = bundle.position + bundle.linvel * dt;
    bundle.position = new_position.select(mask, bundle.position);

    let prev_orientation = bundle.orientation;
    let new_orientation = integrate_orientation(&bundle.orientation, &bundle.angvel, dt);
    bundle.orientation = select_quat(mask, &new_orientation, &bundle.orientation);

    let world_inv_inertia = rotate_inv_inertia(&local_inv_inertia, &bundle.orientation);

    let adjusted_angvel = match mode {
        AngularIntegrationMode::Nonconserving => bundle.angvel,
        AngularIntegrationMode::ConserveMomentum => conserve_angular_momentum(
            &local_inv_inertia,
            &prev_orientation,
            &world_inv_inertia,
            &bundle.angvel,
        ),
        AngularIntegrationMode::ConserveMomentumWithGyroscopicTorque => apply_gyroscopic_torque(
            &bundle.orientation,
            &local_inv_inertia,
            &bundle.angvel,
            dt,
        ),
    };
    bundle.angvel = adjusted_angvel.select(mask, bundle.angvel);

    let mut velocity = VelocityBundle {
        linear: bundle.linvel,
        angular: bundle.angvel,
    };
    callbacks.integrate_velocity(
        body_indices,
        &bundle.position,
        &bundle.orientation,
        bundle.inv_mass,
        &local_inv_inertia,
        mask,
        worker_index,
        dt,
        &mut velocity,
    );
    bundle.linvel = velocity.linear.select(mask, bundle.linvel);
    bundle.angvel = velocity.angular.select(mask, bundle.angvel);

    bundle.inv_inertia = world_inv_inertia;
}

/// Integrates velocity only, for the first sub-step of a frame: poses were
/// already advanced at the end of the previous frame.
///
/// Same input/output contract as [`integrate_pose_and_velocity`] regarding
/// `bundle.inv_inertia`.
pub fn integrate_velocity_only(
    bundle: &mut BodyBundle,
    body_indices: &BodyIndexLanes,
    mask: SimdBool,
    mode: AngularIntegrationMode,
    callbacks: &dyn PoseIntegratorCallbacks,
    worker_index: usize,
    dt: SimdReal,
) {
    let local_inv_inertia = bundle.inv_inertia;
    let world_inv_inertia = rotate_inv_inertia(&local_inv_inertia, &bundle.orientation);

    let adjusted_angvel = match mode {
        AngularIntegrationMode::Nonconserving => bundle.angvel,
        AngularIntegrationMode::ConserveMomentum => {
            // The orientation the body had before its last pose integration.
            let prev_orientation =
                integrate_orientation(&bundle.orientation, &bundle.angvel, -dt);
            conserve_angular_momentum(
                &local_inv_inertia,
                &prev_orientation,
                &world_inv_inertia,
                &bundle.angvel,
            )
        }
        AngularIntegrationMode::ConserveMomentumWithGyroscopicTorque => apply_gyroscopic_torque(
            &bundle.orientation,
            &local_inv_inertia,
            &bundle.angvel,
            dt,
        ),
    };
    bundle.angvel = adjusted_angvel.select(mask, bundle.angvel);

    let mut velocity = VelocityBundle {
        linear: bundle.linvel,
        angular: bundle.angvel,
    };
    callbacks.integrate_velocity(
        body_indices,
        &bundle.position,
        &bundle.orientation,
        bundle.inv_mass,
        &local_inv_inertia,
        mask,
        worker_index,
        dt,
        &mut velocity,
    );
    bundle.linvel = velocity.linear.select(mask, bundle.linvel);
    bundle.angvel = velocity.angular.select(mask, bundle.angvel);

    bundle.inv_inertia = world_inv_inertia;
}

#[inline]
fn select_quat(
    mask: SimdBool,
    if_true: &Quaternion<SimdReal>,
    if_false: &Quaternion<SimdReal>,
) -> Quaternion<SimdReal> {
    Quaternion::from_parts(
        if_true.w.select(mask, if_false.w),
        if_true.imag().select(mask, if_false.imag()),
    )
}

/// Integrates the bodies that no constraint references: the same
/// `substep_count` sub-steps of velocity-then-pose integration the solver
/// applies to constrained bodies, run as one standalone pass.
pub(crate) fn integrate_unconstrained_bodies(
    bodies: &mut BodySet,
    constrained: &IndexSet,
    params: &SolverParameters,
    callbacks: &dyn PoseIntegratorCallbacks,
    dt: Real,
) {
    let active = bodies.active_mut();
    let unconstrained: Vec<u32> = (0..active.len() as u32)
        .filter(|i| {
            let handle = active.index_to_handle[*i as usize];
            !constrained.contains(handle.0.index()) && active.bodies[*i as usize].is_dynamic()
        })
        .collect();

    let h = params.substep_dt(dt);
    let h_wide = SimdReal::splat(h);
    let mode = callbacks.angular_integration_mode();

    for _ in 0..params.substep_count {
        for chunk in unconstrained.chunks(SIMD_WIDTH) {
            let mut lanes = [EMPTY_LANE; SIMD_WIDTH];
            lanes[..chunk.len()].copy_from_slice(chunk);

            let mask_bits = active.dynamic_lane_bits(&lanes);
            let mask = crate::dynamics::solver::bundle::lane_mask(mask_bits);
            let mut bundle = active.gather(&lanes, BodyAccessFilter::All, true);

            integrate_velocity_only(&mut bundle, &lanes, mask, mode, callbacks, 0, h_wide);
            // Advance the pose with the freshly integrated velocity.
            bundle.position += bundle.linvel * h_wide;
            bundle.orientation = integrate_orientation(&bundle.orientation, &bundle.angvel, h_wide);
            let world_inertia = rotate_inv_inertia(
                &SdpMatrix3::from(gather![|ii| match active.bodies.get(lanes[ii] as usize) {
                    Some(rb) => rb.inertia.local_inv_inertia,
                    None => SdpMatrix3::zero(),
                }]),
                &bundle.orientation,
            );

            active.scatter_pose_and_inertia(&lanes, &bundle, &world_inertia, mask_bits);
            active.scatter_velocities(&lanes, &bundle, BodyAccessFilter::All);
        }
    }
}

/// The trailing pose integration of a step: advances every constrained body's
/// pose by one sub-step using its final solved velocity.
pub(crate) fn integrate_poses_after_substepping(
    bodies: &mut BodySet,
    constrained: &IndexSet,
    h: Real,
) {
    let active = bodies.active_mut();
    let constrained_indices: Vec<u32> = (0..active.len() as u32)
        .filter(|i| {
            let handle = active.index_to_handle[*i as usize];
            constrained.contains(handle.0.index()) && active.bodies[*i as usize].is_dynamic()
        })
        .collect();

    let h_wide = SimdReal::splat(h);
    for chunk in constrained_indices.chunks(SIMD_WIDTH) {
        let mut lanes = [EMPTY_LANE; SIMD_WIDTH];
        lanes[..chunk.len()].copy_from_slice(chunk);

        let mask_bits = active.dynamic_lane_bits(&lanes);
        let mut bundle = active.gather(&lanes, BodyAccessFilter::All, true);
        bundle.position += bundle.linvel * h_wide;
        bundle.orientation = integrate_orientation(&bundle.orientation, &bundle.angvel, h_wide);
        let world_inertia = rotate_inv_inertia(&bundle.inv_inertia, &bundle.orientation);

        active.scatter_pose_and_inertia(&lanes, &bundle, &world_inertia, mask_bits);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;
    use na::UnitQuaternion;

    #[test]
    fn orientation_integration_matches_axis_angle_for_small_steps() {
        let q = Quaternion::<Real>::identity();
        let angvel = Vector::new(0.0, 2.0, 0.0);
        let dt = 1.0e-3;
        let integrated = integrate_orientation(&q, &angvel, dt);
        let expected = UnitQuaternion::from_axis_angle(&Vector::y_axis(), 2.0e-3);
        assert_relative_eq!(
            integrated.coords,
            expected.into_inner().coords,
            epsilon = 1.0e-6
        );
    }

    #[test]
    fn rotated_inertia_matches_body_store() {
        let local = SdpMatrix3::from_diagonal(Vector::new(1.0, 0.5, 0.25));
        let rot = UnitQuaternion::from_euler_angles(0.4f32, -0.2, 0.7);
        let wide = rotate_inv_inertia(&local, rot.quaternion());
        let dense = rot.to_rotation_matrix().matrix() * local.into_matrix()
            * rot.to_rotation_matrix().matrix().transpose();
        assert_relative_eq!(wide.into_matrix(), dense, epsilon = 1.0e-5);
    }

    #[test]
    fn momentum_is_conserved_by_the_conserving_mode() {
        let local = SdpMatrix3::from_diagonal(Vector::new(1.0, 0.5, 0.25));
        let q0 = Quaternion::<Real>::identity();
        let angvel = Vector::new(1.0, 2.0, 3.0);
        let q1 = integrate_orientation(&q0, &angvel, 0.01);
        let new_world = rotate_inv_inertia(&local, &q1);
        let adjusted = conserve_angular_momentum(&local, &q0, &new_world, &angvel);

        let momentum_before = rotate_inv_inertia(&local, &q0).inverse_unchecked() * angvel;
        let momentum_after = new_world.inverse_unchecked() * adjusted;
        assert_relative_eq!(momentum_before, momentum_after, epsilon = 1.0e-4);
    }
}
