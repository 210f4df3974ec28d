//! The fallback batch and its Jacobi solving scratch.
//!
//! When a body is referenced by more constraints than fit in the synchronized
//! batches, the surplus lands here. Since a body may then appear in several
//! constraints of the same batch, velocities cannot be written directly:
//! every body's inverse inertia is scaled down by its constraint multiplicity,
//! each constraint computes its velocity delta independently, and the deltas
//! are summed before a single scatter. The scaled inertias make that sum an
//! average.

use crate::dynamics::solver::bundle::{BodyBundle, BodyIndexLanes, EMPTY_LANE};
use crate::dynamics::solver::constraint_batch::ConstraintBatch;
use crate::dynamics::{BodySubset, BodyVelocity};
use crate::math::{Real, SimdReal, Vector, SIMD_WIDTH};
use na::SimdValue;
use vec_map::VecMap;

/// The last constraint batch, exempt from the disjoint-body invariant.
#[derive(Default)]
pub struct FallbackBatch {
    /// The underlying storage; its referenced set answers conflict queries
    /// like any other batch.
    pub(crate) batch: ConstraintBatch,
    /// How many fallback constraints reference each body handle slot. The
    /// referenced bit is cleared when the count returns to zero.
    pub(crate) ref_counts: VecMap<u32>,
}

impl FallbackBatch {
    /// Registers one more fallback constraint referencing the body with the
    /// given handle slot.
    pub fn add_body_reference(&mut self, handle_slot: u32) {
        let count = self.ref_counts.entry(handle_slot as usize).or_insert(0);
        *count += 1;
        self.batch.referenced_bodies.insert(handle_slot as usize);
    }

    /// Unregisters one fallback constraint referencing the body.
    pub fn remove_body_reference(&mut self, handle_slot: u32) {
        let count = self
            .ref_counts
            .get_mut(handle_slot as usize)
            .expect("removing an untracked fallback body reference");
        *count -= 1;
        if *count == 0 {
            self.ref_counts.remove(handle_slot as usize);
            self.batch.referenced_bodies.remove(handle_slot as usize);
        }
    }

    /// Whether the fallback holds no constraint.
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}

/// Per-step scratch for Jacobi solving: per-body constraint multiplicities
/// and accumulated velocity deltas, keyed by dense slots.
#[derive(Default)]
pub struct JacobiScratch {
    slot_of_body: VecMap<usize>,
    bodies: Vec<u32>,
    inv_counts: Vec<Real>,
    deltas: Vec<BodyVelocity>,
}

impl JacobiScratch {
    /// Rebuilds the scratch from the fallback batch's current contents.
    pub fn rebuild(&mut self, fallback: &FallbackBatch, set: &BodySubset) {
        self.slot_of_body.clear();
        self.bodies.clear();
        self.inv_counts.clear();
        self.deltas.clear();

        let mut counts: Vec<u32> = Vec::new();
        let mut indices = Vec::new();
        for tb in &fallback.batch.type_batches {
            for i in 0..tb.len() {
                indices.clear();
                tb.body_indices_at(i, &mut indices);
                for &body_index in &indices {
                    if body_index == EMPTY_LANE
                        || !set.bodies[body_index as usize].is_dynamic()
                    {
                        continue;
                    }
                    let slot = *self.slot_of_body.entry(body_index as usize).or_insert_with(
                        || {
                            self.bodies.push(body_index);
                            counts.push(0);
                            self.bodies.len() - 1
                        },
                    );
                    counts[slot] += 1;
                }
            }
        }

        self.inv_counts
            .extend(counts.iter().map(|c| 1.0 / (*c).max(1) as Real));
        self.deltas
            .resize(self.bodies.len(), BodyVelocity::zero());
    }

    /// Scales the bundle's inverse mass and inertia lanes by the inverse of
    /// each body's fallback constraint multiplicity.
    pub fn scale_inertia(&self, indices: &BodyIndexLanes, bundle: &mut BodyBundle) {
        let scale = SimdReal::from(gather![|ii| {
            match self.slot_of_body.get(indices[ii] as usize) {
                Some(slot) => self.inv_counts[*slot],
                None => 1.0,
            }
        }]);
        bundle.inv_mass *= scale;
        bundle.inv_inertia = bundle.inv_inertia.scaled(scale);
    }

    /// Accumulates per-lane velocity deltas into the scratch.
    pub fn accumulate(
        &mut self,
        set: &BodySubset,
        indices: &BodyIndexLanes,
        linear_delta: &Vector<SimdReal>,
        angular_delta: &Vector<SimdReal>,
    ) {
        for ii in 0..SIMD_WIDTH {
            if indices[ii] == EMPTY_LANE || !set.bodies[indices[ii] as usize].is_dynamic() {
                continue;
            }
            if let Some(slot) = self.slot_of_body.get(indices[ii] as usize) {
                self.deltas[*slot].linvel += linear_delta.extract(ii);
                self.deltas[*slot].angvel += angular_delta.extract(ii);
            }
        }
    }

    /// Applies the accumulated deltas to the bodies and clears them for the
    /// next iteration.
    pub fn apply_and_clear(&mut self, set: &mut BodySubset) {
        for (slot, body_index) in self.bodies.iter().enumerate() {
            let rb = &mut set.bodies[*body_index as usize];
            rb.vels.linvel += self.deltas[slot].linvel;
            rb.vels.angvel += self.deltas[slot].angvel;
            self.deltas[slot] = BodyVelocity::zero();
        }
    }
}
