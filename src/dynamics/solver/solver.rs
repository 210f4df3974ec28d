//! The solver: constraint storage, the batch builder, and the public API.

use crate::data::arena::Arena;
use crate::dynamics::pose_integration::integrate_unconstrained_bodies;
use crate::dynamics::solver::constraint_batch::ConstraintBatch;
use crate::dynamics::solver::fallback::{FallbackBatch, JacobiScratch};
use crate::dynamics::solver::registry::ConstraintRegistry;
use crate::dynamics::solver::substep::{compute_integration_plan, execute_substeps};
use crate::dynamics::solver::type_batch::{TwoBodyConstraint, TypeBatch};
use crate::dynamics::solver::{ConstraintHandle, ConstraintLocation, FALLBACK_BATCH};
use crate::dynamics::{
    BodyConstraintRef, BodyHandle, BodySet, PoseIntegratorCallbacks, RigidBody, SolverParameters,
    ACTIVE_SET,
};
use crate::math::Real;

/// A self-contained snapshot of the constraints of one sleeping island,
/// preserving the batch structure they had while awake. Body references in
/// sleeping type batches hold body handle slots instead of indices.
pub(crate) struct SleepingConstraintSet {
    pub batches: Vec<ConstraintBatch>,
    pub fallback: ConstraintBatch,
}

/// The constraint solver: owns every constraint, partitions them into
/// synchronized batches, and steps the simulation.
pub struct Solver {
    pub(crate) params: SolverParameters,
    pub(crate) registry: ConstraintRegistry,
    pub(crate) batches: Vec<ConstraintBatch>,
    pub(crate) fallback: FallbackBatch,
    pub(crate) sleeping: Vec<Option<SleepingConstraintSet>>,
    pub(crate) handle_to_constraint: Arena<ConstraintLocation>,
    scratch: JacobiScratch,
}

impl Default for Solver {
    fn default() -> Self {
        Self::new(SolverParameters::default())
    }
}

impl Solver {
    /// Creates a solver with the given parameters.
    pub fn new(params: SolverParameters) -> Self {
        Self {
            params,
            registry: ConstraintRegistry::new(),
            batches: Vec::new(),
            fallback: FallbackBatch::default(),
            sleeping: Vec::new(),
            handle_to_constraint: Arena::with_capacity(params.initial_capacity),
            scratch: JacobiScratch::default(),
        }
    }

    /// The solver's parameters.
    pub fn params(&self) -> &SolverParameters {
        &self.params
    }

    /// The solver's parameters, mutably.
    pub fn params_mut(&mut self) -> &mut SolverParameters {
        &mut self.params
    }

    /// The number of live constraints.
    pub fn len(&self) -> usize {
        self.handle_to_constraint.len()
    }

    /// Whether the solver holds no constraint.
    pub fn is_empty(&self) -> bool {
        self.handle_to_constraint.is_empty()
    }

    /// The number of active synchronized batches.
    pub fn num_batches(&self) -> usize {
        self.batches.len()
    }

    /// The number of constraints currently in the fallback batch.
    pub fn fallback_len(&self) -> usize {
        self.fallback.batch.len()
    }

    /// Registers a constraint type, assigning it the next dense type id.
    pub fn register_constraint_type<C: TwoBodyConstraint>(&mut self) -> u32 {
        self.registry.register::<C>()
    }

    /// Where the constraint identified by `handle` currently lives.
    pub fn location(&self, handle: ConstraintHandle) -> Option<ConstraintLocation> {
        self.handle_to_constraint.get(handle.0).copied()
    }

    /// The handle stored at a location, for invariant checks.
    pub fn handle_at(&self, location: ConstraintLocation) -> Option<ConstraintHandle> {
        let batch = self.batch_storage(location.set, location.batch)?;
        let tb = batch.type_batch(location.type_id)?;
        if (location.index as usize) < tb.len() {
            Some(tb.handle_at(location.index as usize))
        } else {
            None
        }
    }

    pub(crate) fn batch_storage(&self, set: u32, batch: u32) -> Option<&ConstraintBatch> {
        if set == ACTIVE_SET {
            if batch == FALLBACK_BATCH {
                Some(&self.fallback.batch)
            } else {
                self.batches.get(batch as usize)
            }
        } else {
            let sleeping = self.sleeping.get(set as usize)?.as_ref()?;
            if batch == FALLBACK_BATCH {
                Some(&sleeping.fallback)
            } else {
                sleeping.batches.get(batch as usize)
            }
        }
    }

    pub(crate) fn batch_storage_mut(&mut self, set: u32, batch: u32) -> &mut ConstraintBatch {
        if set == ACTIVE_SET {
            if batch == FALLBACK_BATCH {
                &mut self.fallback.batch
            } else {
                &mut self.batches[batch as usize]
            }
        } else {
            let sleeping = self.sleeping[set as usize]
                .as_mut()
                .expect("stale sleeping set id");
            if batch == FALLBACK_BATCH {
                &mut sleeping.fallback
            } else {
                &mut sleeping.batches[batch as usize]
            }
        }
    }

    /// Inserts a new constraint between the given bodies and returns its
    /// stable handle. Sleeping bodies involved are woken first.
    pub fn add_constraint<C: TwoBodyConstraint>(
        &mut self,
        bodies: &mut BodySet,
        body_handles: [BodyHandle; 2],
        desc: &C::Description,
    ) -> ConstraintHandle {
        let type_id = self
            .registry
            .id_of::<C>()
            .expect("constraint type was not registered");
        assert_ne!(
            body_handles[0], body_handles[1],
            "a constraint cannot reference the same body twice"
        );

        for handle in body_handles {
            let loc = bodies.location(handle).expect("unknown body handle");
            if loc.set != ACTIVE_SET {
                self.wake_set(bodies, loc.set);
            }
        }

        let body_indices = body_handles
            .map(|h| bodies.location(h).expect("unknown body handle").index);
        let dynamic_slots: Vec<u32> = body_handles
            .iter()
            .filter(|h| bodies.get(**h).is_some_and(|rb| rb.is_dynamic()))
            .map(|h| h.0.index() as u32)
            .collect();

        // Greedy batch scan: first batch whose referenced-body set is
        // disjoint from this constraint's dynamic bodies.
        let mut target = None;
        for (bi, batch) in self.batches.iter().enumerate() {
            if !batch.references_any(&dynamic_slots) {
                target = Some(bi as u32);
                break;
            }
        }
        let target = match target {
            Some(bi) => bi,
            None if self.batches.len() < self.params.fallback_batch_threshold => {
                self.batches.push(ConstraintBatch::new());
                (self.batches.len() - 1) as u32
            }
            None => {
                log::debug!(
                    "constraint of type {} overflowed to the fallback batch",
                    self.registry.name(type_id)
                );
                FALLBACK_BATCH
            }
        };

        let handle = ConstraintHandle(self.handle_to_constraint.insert(ConstraintLocation {
            set: ACTIVE_SET,
            batch: target,
            type_id,
            index: 0,
        }));

        let capacity = self.params.minimum_capacity_per_type_batch;
        let registry = &self.registry;
        let batch = if target == FALLBACK_BATCH {
            &mut self.fallback.batch
        } else {
            &mut self.batches[target as usize]
        };
        let tb = batch.type_batch_or_create(type_id, registry, capacity);
        let index = tb.allocate(handle, &body_indices);
        tb.downcast_mut::<TypeBatch<C>>()
            .expect("type id points at a batch of a different type")
            .set_description(index, desc);
        self.handle_to_constraint[handle.0].index = index as u32;

        if target == FALLBACK_BATCH {
            for slot in &dynamic_slots {
                self.fallback.add_body_reference(*slot);
            }
        } else {
            for slot in &dynamic_slots {
                self.batches[target as usize]
                    .referenced_bodies
                    .insert(*slot as usize);
            }
        }

        for (slot, body_handle) in body_handles.iter().enumerate() {
            bodies
                .get_mut(*body_handle)
                .unwrap()
                .constraints
                .push(BodyConstraintRef {
                    handle,
                    index_in_constraint: slot as u32,
                });
        }

        handle
    }

    /// Removes a constraint. If it was sleeping, its island is woken first.
    pub fn remove_constraint(&mut self, bodies: &mut BodySet, handle: ConstraintHandle) {
        let loc = *self
            .handle_to_constraint
            .get(handle.0)
            .expect("removing an unknown constraint");
        if loc.set != ACTIVE_SET {
            self.wake_set(bodies, loc.set);
        }
        let loc = self.handle_to_constraint[handle.0];

        // Detach from the bodies' adjacency lists and release referenced-set
        // bits.
        let mut body_indices = Vec::new();
        {
            let batch = self.batch_storage(ACTIVE_SET, loc.batch).unwrap();
            batch
                .type_batch(loc.type_id)
                .unwrap()
                .body_indices_at(loc.index as usize, &mut body_indices);
        }
        for body_index in &body_indices {
            let body_handle = bodies.active().index_to_handle[*body_index as usize];
            let rb = bodies.get_mut(body_handle).unwrap();
            let is_dynamic = rb.is_dynamic();
            rb.constraints.retain(|c| c.handle != handle);
            if is_dynamic {
                let slot = body_handle.0.index() as u32;
                if loc.batch == FALLBACK_BATCH {
                    self.fallback.remove_body_reference(slot);
                } else {
                    self.batches[loc.batch as usize]
                        .referenced_bodies
                        .remove(slot as usize);
                }
            }
        }

        self.detach_from_storage(loc);
        self.handle_to_constraint.remove(handle.0);

        // Trailing empty batches are popped so batch indices stay dense.
        while self.batches.last().is_some_and(|b| b.is_empty()) {
            self.batches.pop();
        }
    }

    /// Swap-removes the constraint at `loc` from active storage and fixes the
    /// location of the constraint moved into its slot. Does not touch body
    /// adjacency lists or referenced sets.
    pub(crate) fn detach_from_storage(&mut self, loc: ConstraintLocation) {
        let batch = self.batch_storage_mut(ACTIVE_SET, loc.batch);
        let tb = batch.type_batch_mut(loc.type_id).unwrap();
        if let Some(moved) = tb.swap_remove(loc.index as usize) {
            self.handle_to_constraint[moved.0].index = loc.index;
        }
        let batch = self.batch_storage_mut(ACTIVE_SET, loc.batch);
        batch.remove_type_batch_if_empty(loc.type_id);
    }

    /// Moves a constraint into another synchronized batch of the same set,
    /// preserving its prestep data and accumulated impulse.
    ///
    /// Panics in debug builds if the target batch already references one of
    /// the constraint's dynamic bodies.
    pub fn transfer_constraint(
        &mut self,
        bodies: &BodySet,
        handle: ConstraintHandle,
        target_batch: u32,
    ) {
        let loc = *self
            .handle_to_constraint
            .get(handle.0)
            .expect("transferring an unknown constraint");
        assert_eq!(loc.set, ACTIVE_SET, "only active constraints can transfer");
        assert_ne!(loc.batch, target_batch);
        assert_ne!(
            target_batch, FALLBACK_BATCH,
            "transfers into the fallback batch go through add/remove"
        );
        while self.batches.len() <= target_batch as usize {
            self.batches.push(ConstraintBatch::new());
        }

        let mut body_indices = Vec::new();
        self.batch_storage(ACTIVE_SET, loc.batch)
            .unwrap()
            .type_batch(loc.type_id)
            .unwrap()
            .body_indices_at(loc.index as usize, &mut body_indices);
        let dynamic_slots: Vec<u32> = body_indices
            .iter()
            .map(|i| bodies.active().index_to_handle[*i as usize])
            .filter(|h| bodies.get(*h).is_some_and(|rb| rb.is_dynamic()))
            .map(|h| h.0.index() as u32)
            .collect();
        debug_assert!(
            !self.batches[target_batch as usize].references_any(&dynamic_slots),
            "transfer target batch already references one of the constraint's bodies"
        );

        // Allocate in the target and copy the prestep + accumulated impulse
        // lanes; ephemeral projections are never part of a transfer.
        let capacity = self.params.minimum_capacity_per_type_batch;
        let (src_batch, dst_batch) = if loc.batch == FALLBACK_BATCH {
            let dst = &mut self.batches[target_batch as usize];
            (&self.fallback.batch, dst)
        } else {
            let (lo, hi) = (loc.batch.min(target_batch), loc.batch.max(target_batch));
            let (head, tail) = self.batches.split_at_mut(hi as usize);
            if loc.batch < target_batch {
                (&head[lo as usize], &mut tail[0])
            } else {
                let src: &ConstraintBatch = &tail[0];
                // Source and destination are distinct; reborrow immutably.
                (src, &mut head[lo as usize])
            }
        };
        let src_tb = src_batch.type_batch(loc.type_id).unwrap();
        let dst_tb = dst_batch.type_batch_or_create(loc.type_id, &self.registry, capacity);
        let new_index = src_tb.transfer_lane_to(loc.index as usize, handle, &body_indices, dst_tb);

        // Update referenced sets, the handle table, then free the old slot.
        for slot in &dynamic_slots {
            self.batches[target_batch as usize]
                .referenced_bodies
                .insert(*slot as usize);
        }
        if loc.batch == FALLBACK_BATCH {
            for slot in &dynamic_slots {
                self.fallback.remove_body_reference(*slot);
            }
        } else {
            for slot in &dynamic_slots {
                self.batches[loc.batch as usize]
                    .referenced_bodies
                    .remove(*slot as usize);
            }
        }
        self.handle_to_constraint[handle.0] = ConstraintLocation {
            set: ACTIVE_SET,
            batch: target_batch,
            type_id: loc.type_id,
            index: new_index as u32,
        };
        self.detach_from_storage(loc);
    }

    /// Reads the description of a constraint, wherever it lives.
    pub fn describe<C: TwoBodyConstraint>(&self, handle: ConstraintHandle) -> C::Description {
        let loc = self
            .location(handle)
            .expect("describing an unknown constraint");
        let tb = self
            .batch_storage(loc.set, loc.batch)
            .and_then(|b| b.type_batch(loc.type_id))
            .expect("constraint location points at no storage");
        tb.downcast_ref::<TypeBatch<C>>()
            .expect("constraint type mismatch")
            .description(loc.index as usize)
    }

    /// Overwrites the description of a constraint. The accumulated impulse is
    /// preserved.
    pub fn set_description<C: TwoBodyConstraint>(
        &mut self,
        handle: ConstraintHandle,
        desc: &C::Description,
    ) {
        let loc = self
            .location(handle)
            .expect("describing an unknown constraint");
        let tb = self
            .batch_storage_mut(loc.set, loc.batch)
            .type_batch_mut(loc.type_id)
            .expect("constraint location points at no storage");
        tb.downcast_mut::<TypeBatch<C>>()
            .expect("constraint type mismatch")
            .set_description(loc.index as usize, desc);
    }

    /// Calls `f` with the handle of every body the constraint references.
    pub fn for_each_connected_body(
        &self,
        bodies: &BodySet,
        handle: ConstraintHandle,
        mut f: impl FnMut(BodyHandle),
    ) {
        let loc = self
            .location(handle)
            .expect("enumerating an unknown constraint");
        let mut refs = Vec::new();
        self.batch_storage(loc.set, loc.batch)
            .and_then(|b| b.type_batch(loc.type_id))
            .expect("constraint location points at no storage")
            .body_indices_at(loc.index as usize, &mut refs);
        for r in refs {
            let body_handle = if loc.set == ACTIVE_SET {
                bodies.active().index_to_handle[r as usize]
            } else {
                // Sleeping constraints store handle slots.
                bodies.handle_of_slot(r).expect("stale sleeping body slot")
            };
            f(body_handle);
        }
    }

    /// Removes a body that no constraint references.
    pub fn remove_body(&mut self, bodies: &mut BodySet, handle: BodyHandle) -> RigidBody {
        let loc = bodies.location(handle).expect("removing an unknown body");
        if loc.set != ACTIVE_SET {
            self.wake_set(bodies, loc.set);
        }
        assert!(
            bodies.get(handle).unwrap().constraints.is_empty(),
            "remove the attached constraints before removing a body"
        );
        let (body, moved) = bodies.remove_active(handle);
        if let Some(moved) = moved {
            self.rewrite_body_index_refs(bodies, moved);
        }
        body
    }

    /// Rewrites the body-index lanes of every constraint attached to `moved`
    /// after the body changed dense index inside the active set.
    pub(crate) fn rewrite_body_index_refs(&mut self, bodies: &BodySet, moved: BodyHandle) {
        let new_index = bodies.location(moved).unwrap().index;
        let constraints = bodies.get(moved).unwrap().constraints.clone();
        for cref in constraints {
            let loc = self.handle_to_constraint[cref.handle.0];
            if loc.set != ACTIVE_SET {
                // Sleeping constraints reference bodies by handle slot, which
                // a dense-index move does not invalidate. This happens when a
                // not-yet-moved island body gets swapped mid-sleep.
                continue;
            }
            let batch = self.batch_storage_mut(ACTIVE_SET, loc.batch);
            batch
                .type_batch_mut(loc.type_id)
                .unwrap()
                .replace_body_index(
                    loc.index as usize,
                    cref.index_in_constraint as usize,
                    new_index,
                );
        }
    }

    /// Advances the simulation by `dt`, running the configured number of
    /// sub-steps and solver iterations.
    #[profiling::function]
    pub fn step(
        &mut self,
        bodies: &mut BodySet,
        callbacks: &dyn PoseIntegratorCallbacks,
        dt: Real,
    ) {
        assert!(dt > 0.0, "the timestep must be positive");
        assert!(self.params.substep_count > 0);

        let plan = compute_integration_plan(&self.batches, &self.fallback, bodies);
        execute_substeps(
            &mut self.batches,
            &mut self.fallback,
            &mut self.scratch,
            &plan,
            &self.params,
            bodies,
            callbacks,
            dt,
        );
        integrate_unconstrained_bodies(bodies, &plan.constrained, &self.params, callbacks, dt);
    }

    /// Advances the simulation by `dt`, dispatching bundle blocks across the
    /// rayon thread pool. Stage ordering and results match [`Solver::step`].
    #[cfg(feature = "parallel")]
    #[profiling::function]
    pub fn step_parallel(
        &mut self,
        bodies: &mut BodySet,
        callbacks: &(dyn PoseIntegratorCallbacks + Sync),
        dt: Real,
    ) {
        assert!(dt > 0.0, "the timestep must be positive");
        assert!(self.params.substep_count > 0);

        let plan = compute_integration_plan(&self.batches, &self.fallback, bodies);
        crate::dynamics::solver::parallel::execute_substeps_parallel(
            &mut self.batches,
            &mut self.fallback,
            &mut self.scratch,
            &plan,
            &self.params,
            bodies,
            callbacks,
            dt,
        );
        integrate_unconstrained_bodies(bodies, &plan.constrained, &self.params, callbacks, dt);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::data::IndexSet;
    use crate::dynamics::solver::kernels::{
        AngularAxisGearMotor, AngularAxisGearMotorDescription, BallSocket, BallSocketDescription,
        PointContact, PointContactDescription, Weld, WeldDescription,
    };
    use crate::dynamics::{
        AngularIntegrationMode, BodyInertia, Gravity, IslandManager, SpringSettings,
    };
    use crate::math::{Isometry, Quaternion, SimdBool, SimdReal, Vector, SIMD_WIDTH};
    use crate::utils::SdpMatrix3;
    use crate::dynamics::pose_integration::{PoseIntegratorCallbacks, VelocityBundle};
    use crate::dynamics::solver::bundle::{BodyIndexLanes, EMPTY_LANE};
    use std::cell::RefCell;
    use std::collections::HashMap;

    fn unit_body(x: f32, y: f32, z: f32) -> RigidBody {
        RigidBody::dynamic(
            Isometry::translation(x, y, z),
            BodyInertia {
                inv_mass: 1.0,
                local_inv_inertia: SdpMatrix3::identity(),
            },
        )
    }

    fn zero_gravity() -> Gravity {
        Gravity::new(Vector::zeros())
    }

    fn weld_solver() -> Solver {
        let mut solver = Solver::default();
        solver.register_constraint_type::<Weld>();
        solver
    }

    #[test]
    fn two_body_weld_converges() {
        let mut bodies = BodySet::new();
        let mut solver = weld_solver();
        let a = bodies.insert(unit_body(0.0, 0.0, 0.0));
        let b = bodies.insert(unit_body(1.0, 0.0, 0.0));
        solver.add_constraint::<Weld>(&mut bodies, [a, b], &WeldDescription::default());

        for _ in 0..16 {
            solver.step(&mut bodies, &zero_gravity(), 1.0 / 60.0);
        }

        let pa = bodies.get(a).unwrap().pose;
        let pb = bodies.get(b).unwrap().pose;
        assert!((pb.translation.vector - pa.translation.vector).norm() < 1.0e-4);
        assert!(pa.rotation.angle_to(&pb.rotation) < 1.0e-4);
    }

    #[test]
    fn gear_motor_reaches_the_velocity_ratio() {
        let mut bodies = BodySet::new();
        let mut solver = Solver::default();
        solver.register_constraint_type::<AngularAxisGearMotor>();
        let a = bodies.insert(unit_body(0.0, 0.0, 0.0));
        let b = bodies.insert(unit_body(2.0, 0.0, 0.0));
        bodies.get_mut(a).unwrap().vels.angvel = Vector::new(0.0, 1.0, 0.0);

        solver.add_constraint::<AngularAxisGearMotor>(
            &mut bodies,
            [a, b],
            &AngularAxisGearMotorDescription {
                local_axis: Vector::y(),
                velocity_scale: 2.0,
                max_impulse: 1.0e30,
            },
        );
        solver.step(&mut bodies, &zero_gravity(), 1.0 / 60.0);

        let wa = bodies.get(a).unwrap().vels.angvel.y;
        let wb = bodies.get(b).unwrap().vels.angvel.y;
        assert!((wb - 2.0 * wa).abs() < 1.0e-5, "ratio violated: {wa} vs {wb}");
    }

    #[test]
    fn ball_socket_pendulum_stays_pinned() {
        let mut bodies = BodySet::new();
        let mut solver = Solver::default();
        solver.params_mut().substep_count = 2;
        solver.register_constraint_type::<BallSocket>();

        let pivot = bodies.insert(RigidBody::fixed(Isometry::identity()));
        let bob = bodies.insert(unit_body(0.0, -1.0, 0.0));
        bodies.get_mut(bob).unwrap().vels.linvel = Vector::new(1.0, 0.0, 0.0);

        solver.add_constraint::<BallSocket>(
            &mut bodies,
            [pivot, bob],
            &BallSocketDescription {
                local_anchor_a: Vector::zeros(),
                local_anchor_b: Vector::new(0.0, 1.0, 0.0),
                spring: SpringSettings::rigid(),
            },
        );

        let gravity = Gravity::new(Vector::new(0.0, -10.0, 0.0));
        let mut max_error: f32 = 0.0;
        let mut swung = false;
        for _ in 0..1000 {
            solver.step(&mut bodies, &gravity, 1.0 / 60.0);
            let rb = bodies.get(bob).unwrap();
            let anchor = rb.pose * na::Point3::new(0.0, 1.0, 0.0);
            max_error = max_error.max(anchor.coords.norm());
            if rb.pose.translation.x.abs() > 0.1 {
                swung = true;
            }
        }
        assert!(swung, "the pendulum never left its rest position");
        assert!(max_error < 1.0e-3, "anchor drifted by {max_error}");
    }

    #[test]
    fn batch_overflow_lands_in_the_fallback() {
        let mut bodies = BodySet::new();
        let mut solver = weld_solver();
        solver.params_mut().fallback_batch_threshold = 4;

        let hub = bodies.insert(unit_body(0.0, 0.0, 0.0));
        let mut satellites = Vec::new();
        for i in 0..5 {
            let x = i as f32 + 1.0;
            let s = bodies.insert(unit_body(x, 0.0, 0.0));
            satellites.push((s, x));
            solver.add_constraint::<Weld>(
                &mut bodies,
                [hub, s],
                &WeldDescription {
                    local_offset: Vector::new(x, 0.0, 0.0),
                    ..WeldDescription::default()
                },
            );
        }
        assert_eq!(solver.num_batches(), 4);
        assert_eq!(solver.fallback_len(), 1);

        let gravity = Gravity::new(Vector::new(0.0, -10.0, 0.0));
        for _ in 0..10 {
            solver.step(&mut bodies, &gravity, 1.0 / 60.0);
        }
        let hub_pos = bodies.get(hub).unwrap().pose.translation.vector;
        for (s, x) in satellites {
            let rel = bodies.get(s).unwrap().pose.translation.vector - hub_pos;
            assert!(
                (rel - Vector::new(x, 0.0, 0.0)).norm() < 1.0e-2,
                "weld to satellite at {x} drifted to {rel:?}"
            );
        }
    }

    fn build_chain(bodies: &mut BodySet, solver: &mut Solver, n: usize) -> Vec<BodyHandle> {
        let handles: Vec<_> = (0..n)
            .map(|i| bodies.insert(unit_body(i as f32, 0.0, 0.0)))
            .collect();
        for i in 0..n - 1 {
            solver.add_constraint::<Weld>(
                bodies,
                [handles[i], handles[i + 1]],
                &WeldDescription {
                    local_offset: Vector::new(1.0, 0.0, 0.0),
                    ..WeldDescription::default()
                },
            );
        }
        handles
    }

    #[test]
    fn sleep_wake_roundtrip_matches_a_never_slept_control() {
        let gravity = Gravity::new(Vector::new(0.0, -10.0, 0.0));

        let mut control_bodies = BodySet::new();
        let mut control_solver = weld_solver();
        let control = build_chain(&mut control_bodies, &mut control_solver, 20);

        let mut bodies = BodySet::new();
        let mut solver = weld_solver();
        let chain = build_chain(&mut bodies, &mut solver, 20);

        let mut islands = IslandManager::new();
        let set_id = islands
            .sleep_island(&mut bodies, &mut solver, chain[0])
            .expect("the chain should form an island");
        for h in &chain {
            let loc = bodies.location(*h).unwrap();
            assert_ne!(loc.set, ACTIVE_SET);
        }
        // Handle -> location round-trips while asleep.
        for h in &chain {
            for cref in bodies.get(*h).unwrap().attached_constraints() {
                let loc = solver.location(cref.handle).unwrap();
                assert_eq!(solver.handle_at(loc), Some(cref.handle));
            }
        }

        solver.wake_set(&mut bodies, set_id);
        for h in &chain {
            assert!(bodies.is_active(*h));
        }

        for _ in 0..5 {
            control_solver.step(&mut control_bodies, &gravity, 1.0 / 60.0);
            solver.step(&mut bodies, &gravity, 1.0 / 60.0);
        }
        for (h, ch) in chain.iter().zip(control.iter()) {
            let v = bodies.get(*h).unwrap().vels;
            let cv = control_bodies.get(*ch).unwrap().vels;
            assert_eq!(v.linvel, cv.linvel, "linear velocity diverged after wake");
            assert_eq!(v.angvel, cv.angvel, "angular velocity diverged after wake");
        }
    }

    #[test]
    fn swap_removal_redirects_the_moved_handle() {
        let mut bodies = BodySet::new();
        let mut solver = weld_solver();
        let mut handles = Vec::new();
        for i in 0..100 {
            let a = bodies.insert(unit_body(i as f32 * 2.0, 0.0, 0.0));
            let b = bodies.insert(unit_body(i as f32 * 2.0 + 1.0, 0.0, 0.0));
            handles.push(solver.add_constraint::<Weld>(
                &mut bodies,
                [a, b],
                &WeldDescription {
                    local_offset: Vector::new(1.0 + i as f32 * 1.0e-3, 0.0, 0.0),
                    ..WeldDescription::default()
                },
            ));
        }
        // Everything is disjoint: one batch, one type batch, indices 0..100.
        assert_eq!(solver.num_batches(), 1);
        for (i, h) in handles.iter().enumerate() {
            assert_eq!(solver.location(*h).unwrap().index, i as u32);
        }

        // Accumulate impulses so the preservation check is not vacuous.
        let gravity = Gravity::new(Vector::new(0.0, -10.0, 0.0));
        solver.step(&mut bodies, &gravity, 1.0 / 60.0);

        let desc_before = solver.describe::<Weld>(handles[99]);
        let impulse_before = {
            let tb = solver.batch_storage(ACTIVE_SET, 0).unwrap().type_batch(0).unwrap();
            tb.downcast_ref::<TypeBatch<Weld>>().unwrap().impulse_snapshot(99)
        };

        solver.remove_constraint(&mut bodies, handles[50]);

        let loc = solver.location(handles[99]).unwrap();
        assert_eq!(loc.index, 50);
        assert_eq!(solver.handle_at(loc), Some(handles[99]));
        assert_eq!(solver.describe::<Weld>(handles[99]), desc_before);
        let impulse_after = {
            let tb = solver.batch_storage(ACTIVE_SET, 0).unwrap().type_batch(0).unwrap();
            tb.downcast_ref::<TypeBatch<Weld>>().unwrap().impulse_snapshot(50)
        };
        assert!(impulse_after == impulse_before, "impulse not preserved by swap");
    }

    #[test]
    fn impulse_is_zero_on_allocation_and_preserved_by_transfer() {
        let mut bodies = BodySet::new();
        let mut solver = weld_solver();
        let a = bodies.insert(unit_body(0.0, 0.0, 0.0));
        let b = bodies.insert(unit_body(1.0, 0.0, 0.0));
        let h = solver.add_constraint::<Weld>(&mut bodies, [a, b], &WeldDescription::default());

        let snapshot = |solver: &Solver| {
            let loc = solver.location(h).unwrap();
            solver
                .batch_storage(ACTIVE_SET, loc.batch)
                .unwrap()
                .type_batch(loc.type_id)
                .unwrap()
                .downcast_ref::<TypeBatch<Weld>>()
                .unwrap()
                .impulse_snapshot(loc.index as usize)
        };
        use crate::dynamics::solver::bundle::LaneOps;
        let zero = <Weld as TwoBodyConstraint>::Impulse::zeroed();
        assert!(snapshot(&solver) == zero, "impulse not cleared on allocation");

        let gravity = Gravity::new(Vector::new(0.0, -10.0, 0.0));
        solver.step(&mut bodies, &gravity, 1.0 / 60.0);
        let accumulated = snapshot(&solver);
        assert!(accumulated != zero, "the step should accumulate an impulse");

        solver.transfer_constraint(&bodies, h, 3);
        assert_eq!(solver.location(h).unwrap().batch, 3);
        assert!(
            snapshot(&solver) == accumulated,
            "transfer must preserve the accumulated impulse bit-identically"
        );
    }

    #[test]
    fn batch_invariants_hold_after_churn() {
        let mut bodies = BodySet::new();
        let mut solver = weld_solver();
        let handles: Vec<_> = (0..40)
            .map(|i| bodies.insert(unit_body(i as f32, 0.0, 0.0)))
            .collect();

        // Deterministic pseudo-random add/remove churn.
        let mut state = 0x9e3779b9u64;
        let mut rand = move || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) as usize
        };
        let mut live = Vec::new();
        for _ in 0..300 {
            if live.len() < 30 && (live.is_empty() || rand() % 3 != 0) {
                let a = handles[rand() % 40];
                let b = handles[rand() % 40];
                if a != b {
                    live.push(solver.add_constraint::<Weld>(
                        &mut bodies,
                        [a, b],
                        &WeldDescription::default(),
                    ));
                }
            } else {
                let h = live.swap_remove(rand() % live.len());
                solver.remove_constraint(&mut bodies, h);
            }
        }

        // Disjointness and referenced-set agreement, batch by batch.
        for bi in 0..solver.num_batches() {
            let batch = solver.batch_storage(ACTIVE_SET, bi as u32).unwrap();
            let mut seen = IndexSet::new();
            let mut expected = IndexSet::new();
            let mut refs = Vec::new();
            for tb in &batch.type_batches {
                for i in 0..tb.len() {
                    refs.clear();
                    tb.body_indices_at(i, &mut refs);
                    for r in &refs {
                        let handle = bodies.active().index_to_handle[*r as usize];
                        assert!(
                            seen.insert(handle.0.index()),
                            "body appears twice in batch {bi}"
                        );
                        expected.insert(handle.0.index());
                    }
                }
            }
            for slot in expected.iter() {
                assert!(batch.referenced_bodies.contains(slot));
            }
            for slot in batch.referenced_bodies.iter() {
                assert!(expected.contains(slot), "stale referenced bit in batch {bi}");
            }
        }

        // Handle table round-trips for every live constraint.
        for h in &live {
            let loc = solver.location(*h).unwrap();
            assert_eq!(solver.handle_at(loc), Some(*h));
        }
    }

    struct CountingCallbacks {
        counts: RefCell<HashMap<u32, usize>>,
    }

    impl CountingCallbacks {
        fn mask_lane(mask: SimdBool, ii: usize) -> bool {
            #[cfg(not(feature = "simd-is-enabled"))]
            {
                let _ = ii;
                mask
            }
            #[cfg(feature = "simd-is-enabled")]
            {
                use na::SimdValue;
                mask.extract(ii)
            }
        }
    }

    impl PoseIntegratorCallbacks for CountingCallbacks {
        fn angular_integration_mode(&self) -> AngularIntegrationMode {
            AngularIntegrationMode::Nonconserving
        }

        fn integrate_velocity(
            &self,
            body_indices: &BodyIndexLanes,
            _position: &Vector<SimdReal>,
            _orientation: &Quaternion<SimdReal>,
            _inv_mass: SimdReal,
            _local_inv_inertia: &SdpMatrix3<SimdReal>,
            integration_mask: SimdBool,
            _worker_index: usize,
            _dt: SimdReal,
            _velocity: &mut VelocityBundle,
        ) {
            let mut counts = self.counts.borrow_mut();
            for ii in 0..SIMD_WIDTH {
                if body_indices[ii] != EMPTY_LANE && Self::mask_lane(integration_mask, ii) {
                    *counts.entry(body_indices[ii]).or_insert(0) += 1;
                }
            }
        }
    }

    #[test]
    fn every_body_is_velocity_integrated_once_per_substep() {
        let mut bodies = BodySet::new();
        let mut solver = weld_solver();
        solver.params_mut().substep_count = 4;
        solver.params_mut().fallback_batch_threshold = 2;

        // A hub with enough welds to overflow into the fallback, plus one
        // unconstrained bystander.
        let hub = bodies.insert(unit_body(0.0, 0.0, 0.0));
        for i in 0..3 {
            let s = bodies.insert(unit_body(i as f32 + 1.0, 0.0, 0.0));
            solver.add_constraint::<Weld>(
                &mut bodies,
                [hub, s],
                &WeldDescription {
                    local_offset: Vector::new(i as f32 + 1.0, 0.0, 0.0),
                    ..WeldDescription::default()
                },
            );
        }
        let bystander = bodies.insert(unit_body(100.0, 0.0, 0.0));

        let callbacks = CountingCallbacks {
            counts: RefCell::new(HashMap::new()),
        };
        solver.step(&mut bodies, &callbacks, 1.0 / 60.0);

        let counts = callbacks.counts.borrow();
        for i in 0..bodies.active().len() as u32 {
            let handle = bodies.active().handle(i);
            let expected = 4;
            assert_eq!(
                counts.get(&i).copied().unwrap_or(0),
                expected,
                "body {handle:?} was not integrated exactly once per sub-step"
            );
        }
        let _ = bystander;
    }

    #[test]
    fn identical_runs_are_bit_identical() {
        let run = || {
            let mut bodies = BodySet::new();
            let mut solver = Solver::default();
            solver.register_constraint_type::<Weld>();
            solver.register_constraint_type::<BallSocket>();
            let chain = build_chain(&mut bodies, &mut solver, 8);
            let pivot = bodies.insert(RigidBody::fixed(Isometry::translation(0.0, 5.0, 0.0)));
            solver.add_constraint::<BallSocket>(
                &mut bodies,
                [pivot, chain[0]],
                &BallSocketDescription {
                    local_anchor_a: Vector::new(0.0, -2.0, 0.0),
                    local_anchor_b: Vector::zeros(),
                    spring: SpringSettings::rigid(),
                },
            );

            let gravity = Gravity::new(Vector::new(0.0, -9.81, 0.0));
            for _ in 0..30 {
                solver.step(&mut bodies, &gravity, 1.0 / 60.0);
            }
            chain
                .iter()
                .map(|h| {
                    let p = bodies.get(*h).unwrap().pose.translation.vector;
                    [p.x.to_bits(), p.y.to_bits(), p.z.to_bits()]
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn box_stack_comes_to_rest() {
        let mut bodies = BodySet::new();
        let mut solver = Solver::default();
        solver.params_mut().substep_count = 4;
        solver.params_mut().iteration_count = 4;
        solver.register_constraint_type::<PointContact>();

        let box_inertia = BodyInertia::from_mass_and_principal_inertia(
            1.0,
            Vector::repeat(1.0 / 6.0),
        );
        let ground = bodies.insert(RigidBody::fixed(Isometry::translation(0.0, -0.5, 0.0)));
        let mut boxes = vec![ground];
        for i in 0..10 {
            boxes.push(bodies.insert(RigidBody::dynamic(
                Isometry::translation(0.0, 0.5 + i as f32, 0.0),
                box_inertia,
            )));
        }

        // Four corner contacts per interface; collision detection is
        // external, so the test plays its role with a static manifold.
        for pair in boxes.windows(2) {
            for (cx, cz) in [(-0.5, -0.5), (-0.5, 0.5), (0.5, -0.5), (0.5, 0.5)] {
                solver.add_constraint::<PointContact>(
                    &mut bodies,
                    [pair[0], pair[1]],
                    &PointContactDescription {
                        local_offset_a: Vector::new(cx, 0.5, cz),
                        local_offset_b: Vector::new(cx, -0.5, cz),
                        local_normal_a: Vector::y(),
                        spring: SpringSettings::contact_defaults(),
                    },
                );
            }
        }

        let gravity = Gravity::new(Vector::new(0.0, -10.0, 0.0));
        for _ in 0..60 {
            solver.step(&mut bodies, &gravity, 1.0 / 60.0);
        }

        let energy: f32 = boxes[1..]
            .iter()
            .map(|h| {
                let rb = bodies.get(*h).unwrap();
                rb.vels.kinetic_energy(&rb.inertia)
            })
            .sum();
        assert!(energy < 2.0e-2, "the stack is still moving: E = {energy}");
        // The stack neither sank nor exploded.
        for (i, h) in boxes[1..].iter().enumerate() {
            let y = bodies.get(*h).unwrap().pose.translation.y;
            assert!((y - (0.5 + i as f32)).abs() < 0.05, "box {i} ended at y = {y}");
        }
    }

    #[test]
    fn removing_a_body_rewrites_the_swapped_references() {
        let mut bodies = BodySet::new();
        let mut solver = weld_solver();
        let a = bodies.insert(unit_body(0.0, 0.0, 0.0));
        let lone = bodies.insert(unit_body(5.0, 0.0, 0.0));
        let b = bodies.insert(unit_body(1.0, 0.0, 0.0));
        let h = solver.add_constraint::<Weld>(&mut bodies, [a, b], &WeldDescription::default());

        // Removing `lone` swaps `b` into its slot; the weld's body reference
        // must follow.
        solver.remove_body(&mut bodies, lone);
        let mut refs = Vec::new();
        let loc = solver.location(h).unwrap();
        solver
            .batch_storage(ACTIVE_SET, loc.batch)
            .unwrap()
            .type_batch(loc.type_id)
            .unwrap()
            .body_indices_at(loc.index as usize, &mut refs);
        let b_index = bodies.location(b).unwrap().index;
        assert_eq!(refs[1], b_index);

        // The weld still behaves.
        for _ in 0..4 {
            solver.step(&mut bodies, &zero_gravity(), 1.0 / 60.0);
        }
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn parallel_step_matches_sequential() {
        let build = || {
            let mut bodies = BodySet::new();
            let mut solver = weld_solver();
            build_chain(&mut bodies, &mut solver, 12);
            (bodies, solver)
        };
        let gravity = Gravity::new(Vector::new(0.0, -10.0, 0.0));

        let (mut b1, mut s1) = build();
        let (mut b2, mut s2) = build();
        for _ in 0..10 {
            s1.step(&mut b1, &gravity, 1.0 / 60.0);
            s2.step_parallel(&mut b2, &gravity, 1.0 / 60.0);
        }
        for i in 0..b1.active().len() as u32 {
            let p1 = b1.active().body(i).pose.translation.vector;
            let p2 = b2.active().body(i).pose.translation.vector;
            assert_eq!(p1, p2, "parallel solve diverged at body {i}");
        }
    }
}
