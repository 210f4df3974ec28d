//! Sleeping and waking islands.
//!
//! A sleeping island is a self-contained snapshot of a body subset and their
//! mutual constraints, moved out of the active set. The crucial layout
//! difference: sleeping constraints store body handle slots in their
//! body-reference lanes, active constraints store dense body indices. Waking
//! converts slots back to indices through the body store; sleeping does the
//! reverse. The batch structure constraints had while awake is preserved, so
//! waking does not have to re-run the batch builder.

use crate::data::IndexSet;
use crate::dynamics::solver::SleepingConstraintSet;
use crate::dynamics::solver::{ConstraintBatch, ConstraintLocation, FALLBACK_BATCH};
use crate::dynamics::{BodyHandle, BodySet, Solver, ACTIVE_SET};

/// Discovers islands: connected components of dynamic bodies linked by
/// constraints.
#[derive(Default)]
pub struct IslandManager {
    stack: Vec<BodyHandle>, // Workspace.
    visited: IndexSet,      // Workspace.
}

impl IslandManager {
    /// Creates a new island manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Collects the connected component of dynamic bodies reachable from
    /// `seed` through constraints. Non-dynamic bodies act as boundaries: they
    /// are traversed through but never included.
    pub fn collect_island(
        &mut self,
        bodies: &BodySet,
        solver: &Solver,
        seed: BodyHandle,
    ) -> Vec<BodyHandle> {
        let mut island = Vec::new();
        self.stack.clear();
        self.visited.clear();

        if !bodies.get(seed).is_some_and(|rb| rb.is_dynamic()) {
            return island;
        }
        self.stack.push(seed);
        self.visited.insert(seed.0.index());

        while let Some(handle) = self.stack.pop() {
            island.push(handle);
            let rb = bodies.get(handle).unwrap();
            for cref in &rb.constraints {
                solver.for_each_connected_body(bodies, cref.handle, |other| {
                    if other != handle
                        && bodies.get(other).is_some_and(|o| o.is_dynamic())
                        && self.visited.insert(other.0.index())
                    {
                        self.stack.push(other);
                    }
                });
            }
        }
        island
    }

    /// Puts the island containing `seed` to sleep and returns its set id, or
    /// `None` if the seed is not an active dynamic body.
    pub fn sleep_island(
        &mut self,
        bodies: &mut BodySet,
        solver: &mut Solver,
        seed: BodyHandle,
    ) -> Option<u32> {
        if !bodies.is_active(seed) {
            return None;
        }
        let island = self.collect_island(bodies, solver, seed);
        if island.is_empty() {
            return None;
        }
        Some(solver.sleep_bodies(bodies, &island))
    }
}

impl Solver {
    /// Moves the given bodies and every constraint between them into a new
    /// sleeping set. The island must be self-contained: every dynamic body
    /// referenced by a constraint attached to an island body must belong to
    /// the island.
    pub fn sleep_bodies(&mut self, bodies: &mut BodySet, island: &[BodyHandle]) -> u32 {
        let mut island_slots = IndexSet::new();
        for handle in island {
            let loc = bodies.location(*handle).expect("sleeping an unknown body");
            assert_eq!(loc.set, ACTIVE_SET, "body is already sleeping");
            assert!(
                bodies.get(*handle).unwrap().is_dynamic(),
                "non-dynamic bodies do not sleep"
            );
            island_slots.insert(handle.0.index());
        }

        let set_id = bodies.allocate_sleeping_set();
        if self.sleeping.len() <= set_id as usize {
            self.sleeping.resize_with(set_id as usize + 1, || None);
        }
        let mut sleeping = SleepingConstraintSet {
            batches: Vec::new(),
            fallback: ConstraintBatch::new(),
        };

        // Deterministic constraint collection: island order, then each body's
        // adjacency order, first occurrence wins.
        let mut seen = IndexSet::new();
        let mut constraints = Vec::new();
        for handle in island {
            for cref in &bodies.get(*handle).unwrap().constraints {
                if seen.insert(cref.handle.0.index()) {
                    constraints.push(cref.handle);
                }
            }
        }

        let capacity = self.params.minimum_capacity_per_type_batch;
        let mut body_indices = Vec::new();
        for handle in constraints {
            let loc = self.handle_to_constraint[handle.0];
            debug_assert_eq!(loc.set, ACTIVE_SET);

            body_indices.clear();
            self.batch_storage(ACTIVE_SET, loc.batch)
                .unwrap()
                .type_batch(loc.type_id)
                .unwrap()
                .body_indices_at(loc.index as usize, &mut body_indices);

            // Handle slots replace dense indices in the sleeping copy.
            let mut slots = Vec::with_capacity(body_indices.len());
            for index in &body_indices {
                let body_handle = bodies.active().index_to_handle[*index as usize];
                let is_dynamic = bodies.get(body_handle).unwrap().is_dynamic();
                debug_assert!(
                    !is_dynamic || island_slots.contains(body_handle.0.index()),
                    "sleeping island is not self-contained"
                );
                slots.push(body_handle.0.index() as u32);

                // Release the active referenced-set bits.
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

            let registry = &self.registry;
            let target = if loc.batch == FALLBACK_BATCH {
                &mut sleeping.fallback
            } else {
                if sleeping.batches.len() <= loc.batch as usize {
                    sleeping
                        .batches
                        .resize_with(loc.batch as usize + 1, ConstraintBatch::new);
                }
                &mut sleeping.batches[loc.batch as usize]
            };
            let dst_tb = target.type_batch_or_create(loc.type_id, registry, capacity);
            let src_tb = if loc.batch == FALLBACK_BATCH {
                self.fallback.batch.type_batch(loc.type_id).unwrap()
            } else {
                self.batches[loc.batch as usize]
                    .type_batch(loc.type_id)
                    .unwrap()
            };
            let new_index = src_tb.transfer_lane_to(loc.index as usize, handle, &slots, dst_tb);

            self.handle_to_constraint[handle.0] = ConstraintLocation {
                set: set_id,
                batch: loc.batch,
                type_id: loc.type_id,
                index: new_index as u32,
            };
            self.detach_from_storage(loc);
        }

        while self.batches.last().is_some_and(|b| b.is_empty()) {
            self.batches.pop();
        }

        // Bodies move last: the constraint copies above read active indices.
        for handle in island {
            if let Some(moved) = bodies.move_to_sleeping(*handle, set_id) {
                self.rewrite_body_index_refs(bodies, moved);
            }
        }

        log::debug!("put an island of {} bodies to sleep", island.len());
        self.sleeping[set_id as usize] = Some(sleeping);
        set_id
    }

    /// Wakes the sleeping set `set_id`: moves its bodies back into the active
    /// set and re-inserts its constraints into the batches they occupied
    /// before sleeping, converting stored handle slots back to body indices.
    pub fn wake_set(&mut self, bodies: &mut BodySet, set_id: u32) {
        let sleeping = self.sleeping[set_id as usize]
            .take()
            .expect("waking an unknown sleeping set");
        let island_len = bodies.sets[set_id as usize].len();
        bodies.move_set_to_active(set_id);

        for (b, sbatch) in sleeping.batches.iter().enumerate() {
            while self.batches.len() <= b {
                self.batches.push(ConstraintBatch::new());
            }
            self.wake_batch(bodies, sbatch, b as u32);
        }
        self.wake_batch(bodies, &sleeping.fallback, FALLBACK_BATCH);

        log::debug!("woke an island of {island_len} bodies");
    }

    /// Re-inserts one sleeping batch's constraints into the active batch of
    /// the same index, with the bulk lane-copy fast path and a bulk rebuild
    /// of the referenced-handles bits.
    fn wake_batch(&mut self, bodies: &BodySet, sbatch: &ConstraintBatch, batch_index: u32) {
        let capacity = self.params.minimum_capacity_per_type_batch;
        for src_tb in &sbatch.type_batches {
            let type_id = crate::dynamics::solver::AnyTypeBatch::type_id(&**src_tb);
            let len = src_tb.len();
            let registry = &self.registry;
            let dst_tb = if batch_index == FALLBACK_BATCH {
                self.fallback
                    .batch
                    .type_batch_or_create(type_id, registry, capacity)
            } else {
                self.batches[batch_index as usize].type_batch_or_create(
                    type_id,
                    registry,
                    capacity,
                )
            };
            // Bulk lane copy with slot→index conversion.
            let dst_start = dst_tb.append_from(&**src_tb, 0, len, &mut |slot| {
                let handle = bodies
                    .handle_of_slot(slot)
                    .expect("stale sleeping body slot");
                bodies.location(handle).unwrap().index
            });

            let mut slots = Vec::new();
            for k in 0..len {
                let handle = src_tb.handle_at(k);
                self.handle_to_constraint[handle.0] = ConstraintLocation {
                    set: ACTIVE_SET,
                    batch: batch_index,
                    type_id,
                    index: (dst_start + k) as u32,
                };

                slots.clear();
                src_tb.body_indices_at(k, &mut slots);
                for slot in &slots {
                    let body_handle = bodies
                        .handle_of_slot(*slot)
                        .expect("stale sleeping body slot");
                    if bodies.get(body_handle).unwrap().is_dynamic() {
                        if batch_index == FALLBACK_BATCH {
                            self.fallback.add_body_reference(*slot);
                        } else {
                            self.batches[batch_index as usize]
                                .referenced_bodies
                                .insert(*slot as usize);
                        }
                    }
                }
            }
        }
    }

    /// Wakes the island containing `body`, if it is asleep.
    pub fn wake_island_of(&mut self, bodies: &mut BodySet, body: BodyHandle) {
        if let Some(loc) = bodies.location(body) {
            if loc.set != ACTIVE_SET {
                self.wake_set(bodies, loc.set);
            }
        }
    }
}
