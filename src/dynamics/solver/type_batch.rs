//! Type batches: the type-homogeneous AOSOA column stores holding constraint
//! data, and the object-safe processor interface the solver dispatches
//! through.
//!
//! A `TypeBatch<C>` owns three parallel bundle arrays (body references,
//! prestep data, accumulated impulses) plus the index→handle column. The
//! solver only ever sees `dyn AnyTypeBatch`; one trait object per registered
//! type per constraint batch, dispatched once per stage and amortized over
//! every bundle in the range.

use crate::data::IndexSet;
use crate::dynamics::pose_integration::{
    integrate_pose_and_velocity, integrate_velocity_only, AngularIntegrationMode,
    PoseIntegratorCallbacks,
};
use crate::dynamics::solver::bundle::{
    bundle_count, bundle_index, inner_index, lane_mask, BodyAccessFilter, BodyBundle,
    BodyIndexLanes, LaneOps, EMPTY_LANE,
};
use crate::dynamics::solver::fallback::JacobiScratch;
use crate::dynamics::solver::ConstraintHandle;
use crate::dynamics::BodySubset;
use crate::math::{Real, SimdReal, SIMD_WIDTH};
use downcast_rs::{impl_downcast, Downcast};
use na::SimdValue;
use std::ops::Range;

/// Everything a warm-start or solve stage needs besides the storage itself.
pub struct StageContext<'a> {
    /// The sub-step length.
    pub dt: Real,
    /// The inverse sub-step length.
    pub inv_dt: Real,
    /// The user's velocity-integration hook.
    pub callbacks: &'a dyn PoseIntegratorCallbacks,
    /// How orientation integration treats angular momentum.
    pub angular_mode: AngularIntegrationMode,
    /// False on the first sub-step of a frame: poses were already advanced at
    /// the end of the previous frame, only velocities integrate.
    pub allow_pose_integration: bool,
    /// The index of the worker running the stage.
    pub worker_index: usize,
}

/// The coarse integration responsibility of one type batch for the current
/// frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BatchIntegrationMode {
    /// Every lane integrates: the type batch lives in batch 0, where every
    /// referenced body is seen for the first time.
    Always,
    /// No lane integrates; the integration machinery is skipped entirely.
    Never,
    /// Some lanes integrate; each bundle derives a mask from the flag bits.
    Conditional,
}

/// Per-frame integration responsibilities of one type batch: the coarse mode
/// plus, for the conditional case, one flag bitset per body slot keyed by
/// constraint index.
pub struct TypeBatchIntegrationFlags {
    /// The coarse dispatch mode.
    pub mode: BatchIntegrationMode,
    /// `flags[slot]` holds a bit per constraint whose body in that slot must
    /// be integrated by this type batch.
    pub flags: Vec<IndexSet>,
}

impl TypeBatchIntegrationFlags {
    /// Responsibilities of a batch-0 type batch.
    pub fn always() -> Self {
        Self {
            mode: BatchIntegrationMode::Always,
            flags: Vec::new(),
        }
    }

    /// No responsibility at all.
    pub fn never() -> Self {
        Self {
            mode: BatchIntegrationMode::Never,
            flags: Vec::new(),
        }
    }

    /// The flag bits of `bundle` for `slot`, one bit per lane.
    #[inline]
    pub fn bundle_bits(&self, slot: usize, bundle: usize) -> u32 {
        let constraint_start = bundle * SIMD_WIDTH;
        // SIMD_WIDTH divides 64, so a bundle's bits never straddle a word.
        let word = self.flags[slot].word(constraint_start >> 6);
        ((word >> (constraint_start & 63)) as u32) & ((1u32 << SIMD_WIDTH) - 1)
    }
}

/// A two-body constraint type: its bundled data layout and its wide kernels.
///
/// The prestep bundle is the persistent user-provided definition (anchors,
/// axes, spring settings); the impulse bundle is the accumulated impulse
/// preserved across sub-steps for warm starting. Linearization (jacobians,
/// effective mass, bias) is recomputed inside `warm_start`/`solve` from the
/// prestep data and the gathered body state; nothing ephemeral is persisted.
pub trait TwoBodyConstraint: 'static {
    /// The wide per-bundle prestep data.
    type Prestep: LaneOps;
    /// The wide per-bundle accumulated impulse.
    type Impulse: LaneOps + PartialEq;
    /// The scalar description used by the public API.
    type Description: Copy + 'static;

    /// Diagnostic name of the constraint type.
    const NAME: &'static str;

    /// Which body-state fields the kernels read. Purely an instruction-count
    /// hint; `All` is always correct.
    const FILTER: BodyAccessFilter = BodyAccessFilter::All;

    /// Writes a description into one lane of a prestep bundle.
    fn apply_description(prestep: &mut Self::Prestep, lane: usize, desc: &Self::Description);

    /// Reads one lane of a prestep bundle back into a description.
    fn extract_description(prestep: &Self::Prestep, lane: usize) -> Self::Description;

    /// Applies the accumulated impulse as a velocity change.
    fn warm_start(
        prestep: &Self::Prestep,
        impulse: &Self::Impulse,
        body_a: &mut BodyBundle,
        body_b: &mut BodyBundle,
        dt: SimdReal,
        inv_dt: SimdReal,
    );

    /// Runs one solve iteration over the bundle: computes the
    /// constraint-space velocity error, turns it into a corrective impulse
    /// through the effective mass and softness, clamps, updates the
    /// accumulated impulse and applies the velocity change.
    fn solve(
        prestep: &Self::Prestep,
        impulse: &mut Self::Impulse,
        body_a: &mut BodyBundle,
        body_b: &mut BodyBundle,
        dt: SimdReal,
        inv_dt: SimdReal,
    );
}

/// The AOSOA column store for all constraints of one type inside one
/// constraint batch.
pub struct TypeBatch<C: TwoBodyConstraint> {
    pub(crate) body_refs: Vec<[BodyIndexLanes; 2]>,
    pub(crate) prestep: Vec<C::Prestep>,
    pub(crate) impulses: Vec<C::Impulse>,
    pub(crate) index_to_handle: Vec<ConstraintHandle>,
    len: usize,
    type_id: u32,
}

impl<C: TwoBodyConstraint> TypeBatch<C> {
    /// Creates an empty type batch with room for `capacity` constraints.
    pub fn with_capacity(type_id: u32, capacity: usize) -> Self {
        let bundles = bundle_count(capacity);
        Self {
            body_refs: Vec::with_capacity(bundles),
            prestep: Vec::with_capacity(bundles),
            impulses: Vec::with_capacity(bundles),
            index_to_handle: Vec::with_capacity(capacity),
            len: 0,
            type_id,
        }
    }

    /// Writes `desc` into the constraint at `index`.
    pub fn set_description(&mut self, index: usize, desc: &C::Description) {
        assert!(index < self.len, "constraint index out of bounds");
        C::apply_description(
            &mut self.prestep[bundle_index(index)],
            inner_index(index),
            desc,
        );
    }

    /// Reads the description of the constraint at `index`.
    pub fn description(&self, index: usize) -> C::Description {
        assert!(index < self.len, "constraint index out of bounds");
        C::extract_description(&self.prestep[bundle_index(index)], inner_index(index))
    }

    /// A canonical single-lane snapshot of the accumulated impulse at
    /// `index`, comparable across storage moves.
    pub fn impulse_snapshot(&self, index: usize) -> C::Impulse {
        assert!(index < self.len, "constraint index out of bounds");
        let mut out = C::Impulse::zeroed();
        LaneOps::copy_lane(
            &self.impulses[bundle_index(index)],
            inner_index(index),
            &mut out,
            0,
        );
        out
    }

    /// Gathers a body bundle for one slot, running the integration
    /// responsibilities of this bundle if any. Returns the bundle and the
    /// filter the final velocity scatter must use.
    fn gather_slot(
        &self,
        set: &mut BodySubset,
        ctx: &StageContext<'_>,
        integration: &TypeBatchIntegrationFlags,
        bundle: usize,
        slot: usize,
    ) -> (BodyBundle, BodyAccessFilter) {
        let refs = &self.body_refs[bundle][slot];
        let bits = match integration.mode {
            BatchIntegrationMode::Never => 0,
            BatchIntegrationMode::Always => set.dynamic_lane_bits(refs),
            BatchIntegrationMode::Conditional => integration.bundle_bits(slot, bundle),
        };

        if bits == 0 {
            return (set.gather(refs, C::FILTER, false), C::FILTER);
        }

        let mask = lane_mask(bits);
        let mut body = set.gather(refs, BodyAccessFilter::All, true);
        let dt = SimdReal::splat(ctx.dt);
        if ctx.allow_pose_integration {
            integrate_pose_and_velocity(
                &mut body,
                refs,
                mask,
                ctx.angular_mode,
                ctx.callbacks,
                ctx.worker_index,
                dt,
            );
            let world_inertia = body.inv_inertia;
            set.scatter_pose_and_inertia(refs, &body, &world_inertia, bits);
        } else {
            integrate_velocity_only(
                &mut body,
                refs,
                mask,
                ctx.angular_mode,
                ctx.callbacks,
                ctx.worker_index,
                dt,
            );
            let world_inertia = body.inv_inertia;
            set.scatter_inertia(refs, &world_inertia, bits);
        }
        (body, BodyAccessFilter::All)
    }
}

/// The object-safe interface of a type batch: slot bookkeeping plus the
/// bundle-range stage kernels.
pub trait AnyTypeBatch: Downcast {
    /// The constraint type id this batch stores.
    fn type_id(&self) -> u32;

    /// The exact number of constraints stored.
    fn len(&self) -> usize;

    /// Whether the batch stores no constraint.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of live bundles.
    fn bundle_count(&self) -> usize;

    /// The handle of the constraint stored at `index`.
    fn handle_at(&self, index: usize) -> ConstraintHandle;

    /// Appends one constraint, growing storage geometrically when full. The
    /// accumulated impulse of the new slot is cleared.
    fn allocate(&mut self, handle: ConstraintHandle, body_indices: &[u32]) -> usize;

    /// Removes the constraint at `index`, swapping the last constraint into
    /// the freed slot to keep storage dense. Returns the handle of the moved
    /// constraint, whose location entry must be updated by the caller.
    fn swap_remove(&mut self, index: usize) -> Option<ConstraintHandle>;

    /// Appends the body indices of the constraint at `index` to `out`.
    fn body_indices_at(&self, index: usize, out: &mut Vec<u32>);

    /// Rewrites one body reference of the constraint at `index`, after a body
    /// moved in memory.
    fn replace_body_index(&mut self, index: usize, slot: usize, new_index: u32);

    /// Copies the prestep and accumulated-impulse lanes of the constraint at
    /// `index` into a newly allocated slot of `target`, which must store the
    /// same constraint type. Returns the index in the target.
    fn transfer_lane_to(
        &self,
        index: usize,
        handle: ConstraintHandle,
        body_indices: &[u32],
        target: &mut dyn AnyTypeBatch,
    ) -> usize;

    /// Appends `count` constraints copied from `src`, remapping each body
    /// reference through `remap`. Uses whole-bundle copies when both ranges
    /// start on bundle boundaries; per-lane copies otherwise. Returns the
    /// index the copied range starts at.
    fn append_from(
        &mut self,
        src: &dyn AnyTypeBatch,
        src_start: usize,
        count: usize,
        remap: &mut dyn FnMut(u32) -> u32,
    ) -> usize;

    /// Warm-starts the bundle range: runs integration responsibilities, then
    /// applies accumulated impulses to body velocities.
    fn warm_start(
        &mut self,
        set: &mut BodySubset,
        ctx: &StageContext<'_>,
        integration: &TypeBatchIntegrationFlags,
        bundles: Range<usize>,
    );

    /// Runs one solve iteration over the bundle range.
    fn solve(&mut self, set: &mut BodySubset, ctx: &StageContext<'_>, bundles: Range<usize>);

    /// Runs only the integration responsibilities of the bundle range,
    /// without touching impulses. Used by the fallback batch, whose warm
    /// start is folded into its solve.
    fn integrate_flagged(
        &mut self,
        set: &mut BodySubset,
        ctx: &StageContext<'_>,
        integration: &TypeBatchIntegrationFlags,
        bundles: Range<usize>,
    );

    /// Runs one Jacobi solve iteration over the bundle range: body inertias
    /// are pre-scaled by the fallback multiplicity, velocity deltas are
    /// accumulated into `scratch` instead of being written to the bodies.
    fn solve_jacobi(
        &mut self,
        set: &BodySubset,
        scratch: &mut JacobiScratch,
        ctx: &StageContext<'_>,
        warm_start: bool,
        bundles: Range<usize>,
    );
}

impl_downcast!(AnyTypeBatch);

impl<C: TwoBodyConstraint> AnyTypeBatch for TypeBatch<C> {
    fn type_id(&self) -> u32 {
        self.type_id
    }

    fn len(&self) -> usize {
        self.len
    }

    fn bundle_count(&self) -> usize {
        bundle_count(self.len)
    }

    fn handle_at(&self, index: usize) -> ConstraintHandle {
        self.index_to_handle[index]
    }

    fn allocate(&mut self, handle: ConstraintHandle, body_indices: &[u32]) -> usize {
        assert_eq!(body_indices.len(), 2, "{} is a two-body constraint", C::NAME);
        let index = self.len;
        let (bundle, lane) = (bundle_index(index), inner_index(index));
        if bundle == self.body_refs.len() {
            self.body_refs.push([BodyIndexLanes::zeroed(); 2]);
            self.prestep.push(C::Prestep::zeroed());
            self.impulses.push(C::Impulse::zeroed());
        }
        self.body_refs[bundle][0][lane] = body_indices[0];
        self.body_refs[bundle][1][lane] = body_indices[1];
        self.impulses[bundle].clear_lane(lane);
        self.index_to_handle.push(handle);
        self.len += 1;
        index
    }

    fn swap_remove(&mut self, index: usize) -> Option<ConstraintHandle> {
        assert!(index < self.len, "constraint index out of bounds");
        let last = self.len - 1;
        let (lb, ll) = (bundle_index(last), inner_index(last));

        let moved = if index != last {
            let (ib, il) = (bundle_index(index), inner_index(index));
            let src_refs = self.body_refs[lb];
            self.body_refs[ib][0][il] = src_refs[0][ll];
            self.body_refs[ib][1][il] = src_refs[1][ll];
            let src_prestep = self.prestep[lb];
            LaneOps::copy_lane(&src_prestep, ll, &mut self.prestep[ib], il);
            let src_impulse = self.impulses[lb];
            LaneOps::copy_lane(&src_impulse, ll, &mut self.impulses[ib], il);
            self.index_to_handle[index] = self.index_to_handle[last];
            Some(self.index_to_handle[index])
        } else {
            None
        };

        // Clear the vacated tail lane so kernels see it as inert.
        self.body_refs[lb][0][ll] = EMPTY_LANE;
        self.body_refs[lb][1][ll] = EMPTY_LANE;
        self.impulses[lb].clear_lane(ll);
        self.prestep[lb].clear_lane(ll);
        self.index_to_handle.pop();
        self.len -= 1;

        // Drop a fully emptied tail bundle; capacity is retained.
        if bundle_count(self.len) < self.body_refs.len() {
            self.body_refs.pop();
            self.prestep.pop();
            self.impulses.pop();
        }
        moved
    }

    fn body_indices_at(&self, index: usize, out: &mut Vec<u32>) {
        assert!(index < self.len, "constraint index out of bounds");
        let (bundle, lane) = (bundle_index(index), inner_index(index));
        out.push(self.body_refs[bundle][0][lane]);
        out.push(self.body_refs[bundle][1][lane]);
    }

    fn replace_body_index(&mut self, index: usize, slot: usize, new_index: u32) {
        assert!(index < self.len, "constraint index out of bounds");
        let (bundle, lane) = (bundle_index(index), inner_index(index));
        self.body_refs[bundle][slot][lane] = new_index;
    }

    fn transfer_lane_to(
        &self,
        index: usize,
        handle: ConstraintHandle,
        body_indices: &[u32],
        target: &mut dyn AnyTypeBatch,
    ) -> usize {
        let target = target
            .downcast_mut::<TypeBatch<C>>()
            .expect("transfer between type batches of different types");
        let target_index = target.allocate(handle, body_indices);
        let (sb, sl) = (bundle_index(index), inner_index(index));
        let (tb, tl) = (bundle_index(target_index), inner_index(target_index));
        LaneOps::copy_lane(&self.prestep[sb], sl, &mut target.prestep[tb], tl);
        LaneOps::copy_lane(&self.impulses[sb], sl, &mut target.impulses[tb], tl);
        target_index
    }

    fn append_from(
        &mut self,
        src: &dyn AnyTypeBatch,
        src_start: usize,
        count: usize,
        remap: &mut dyn FnMut(u32) -> u32,
    ) -> usize {
        let src = src
            .downcast_ref::<TypeBatch<C>>()
            .expect("append between type batches of different types");
        assert!(src_start + count <= src.len);
        let dst_start = self.len;
        if count == 0 {
            return dst_start;
        }

        if inner_index(dst_start) == 0 && inner_index(src_start) == 0 {
            // Bulk path: whole-bundle copies.
            let first_bundle = bundle_index(src_start);
            for k in 0..bundle_count(count) {
                self.body_refs.push(src.body_refs[first_bundle + k]);
                self.prestep.push(src.prestep[first_bundle + k]);
                self.impulses.push(src.impulses[first_bundle + k]);
            }
            self.index_to_handle
                .extend_from_slice(&src.index_to_handle[src_start..src_start + count]);
            self.len += count;

            // Clear the lanes of the last bundle past the copied range.
            if count % SIMD_WIDTH != 0 {
                let last_bundle = self.body_refs.len() - 1;
                for lane in inner_index(count - 1) + 1..SIMD_WIDTH {
                    self.body_refs[last_bundle][0][lane] = EMPTY_LANE;
                    self.body_refs[last_bundle][1][lane] = EMPTY_LANE;
                    self.impulses[last_bundle].clear_lane(lane);
                    self.prestep[last_bundle].clear_lane(lane);
                }
            }

            // Remap the copied body references.
            for i in 0..count {
                let (b, l) = (bundle_index(dst_start + i), inner_index(dst_start + i));
                for slot in 0..2 {
                    let old = self.body_refs[b][slot][l];
                    self.body_refs[b][slot][l] = remap(old);
                }
            }
        } else {
            for i in 0..count {
                let (sb, sl) = (bundle_index(src_start + i), inner_index(src_start + i));
                let body_indices = [
                    remap(src.body_refs[sb][0][sl]),
                    remap(src.body_refs[sb][1][sl]),
                ];
                let handle = src.index_to_handle[src_start + i];
                let t = self.allocate(handle, &body_indices);
                let (tb, tl) = (bundle_index(t), inner_index(t));
                LaneOps::copy_lane(&src.prestep[sb], sl, &mut self.prestep[tb], tl);
                LaneOps::copy_lane(&src.impulses[sb], sl, &mut self.impulses[tb], tl);
            }
        }
        dst_start
    }

    #[inline(never)]
    fn warm_start(
        &mut self,
        set: &mut BodySubset,
        ctx: &StageContext<'_>,
        integration: &TypeBatchIntegrationFlags,
        bundles: Range<usize>,
    ) {
        let dt = SimdReal::splat(ctx.dt);
        let inv_dt = SimdReal::splat(ctx.inv_dt);
        for b in bundles {
            let (mut body_a, filter_a) = self.gather_slot(set, ctx, integration, b, 0);
            let (mut body_b, filter_b) = self.gather_slot(set, ctx, integration, b, 1);
            C::warm_start(
                &self.prestep[b],
                &self.impulses[b],
                &mut body_a,
                &mut body_b,
                dt,
                inv_dt,
            );
            let refs = &self.body_refs[b];
            set.scatter_velocities(&refs[0], &body_a, filter_a);
            set.scatter_velocities(&refs[1], &body_b, filter_b);
        }
    }

    #[inline(never)]
    fn solve(&mut self, set: &mut BodySubset, ctx: &StageContext<'_>, bundles: Range<usize>) {
        let dt = SimdReal::splat(ctx.dt);
        let inv_dt = SimdReal::splat(ctx.inv_dt);
        for b in bundles {
            let refs = self.body_refs[b];
            let mut body_a = set.gather(&refs[0], C::FILTER, false);
            let mut body_b = set.gather(&refs[1], C::FILTER, false);
            C::solve(
                &self.prestep[b],
                &mut self.impulses[b],
                &mut body_a,
                &mut body_b,
                dt,
                inv_dt,
            );
            set.scatter_velocities(&refs[0], &body_a, C::FILTER);
            set.scatter_velocities(&refs[1], &body_b, C::FILTER);
        }
    }

    fn integrate_flagged(
        &mut self,
        set: &mut BodySubset,
        ctx: &StageContext<'_>,
        integration: &TypeBatchIntegrationFlags,
        bundles: Range<usize>,
    ) {
        if integration.mode == BatchIntegrationMode::Never {
            return;
        }
        for b in bundles {
            for slot in 0..2 {
                let bits = match integration.mode {
                    BatchIntegrationMode::Always => {
                        set.dynamic_lane_bits(&self.body_refs[b][slot])
                    }
                    BatchIntegrationMode::Conditional => integration.bundle_bits(slot, b),
                    BatchIntegrationMode::Never => 0,
                };
                if bits == 0 {
                    continue;
                }
                let refs = self.body_refs[b][slot];
                let mask = lane_mask(bits);
                let mut body = set.gather(&refs, BodyAccessFilter::All, true);
                let dt = SimdReal::splat(ctx.dt);
                if ctx.allow_pose_integration {
                    integrate_pose_and_velocity(
                        &mut body,
                        &refs,
                        mask,
                        ctx.angular_mode,
                        ctx.callbacks,
                        ctx.worker_index,
                        dt,
                    );
                    let world_inertia = body.inv_inertia;
                    set.scatter_pose_and_inertia(&refs, &body, &world_inertia, bits);
                } else {
                    integrate_velocity_only(
                        &mut body,
                        &refs,
                        mask,
                        ctx.angular_mode,
                        ctx.callbacks,
                        ctx.worker_index,
                        dt,
                    );
                    let world_inertia = body.inv_inertia;
                    set.scatter_inertia(&refs, &world_inertia, bits);
                }
                set.scatter_velocities_masked(&refs, &body, bits);
            }
        }
    }

    fn solve_jacobi(
        &mut self,
        set: &BodySubset,
        scratch: &mut JacobiScratch,
        ctx: &StageContext<'_>,
        warm_start: bool,
        bundles: Range<usize>,
    ) {
        let dt = SimdReal::splat(ctx.dt);
        let inv_dt = SimdReal::splat(ctx.inv_dt);
        for b in bundles {
            let refs = self.body_refs[b];
            let mut body_a = set.gather(&refs[0], BodyAccessFilter::All, false);
            let mut body_b = set.gather(&refs[1], BodyAccessFilter::All, false);
            scratch.scale_inertia(&refs[0], &mut body_a);
            scratch.scale_inertia(&refs[1], &mut body_b);

            let initial_a = (body_a.linvel, body_a.angvel);
            let initial_b = (body_b.linvel, body_b.angvel);

            if warm_start {
                C::warm_start(
                    &self.prestep[b],
                    &self.impulses[b],
                    &mut body_a,
                    &mut body_b,
                    dt,
                    inv_dt,
                );
            }
            C::solve(
                &self.prestep[b],
                &mut self.impulses[b],
                &mut body_a,
                &mut body_b,
                dt,
                inv_dt,
            );

            scratch.accumulate(
                set,
                &refs[0],
                &(body_a.linvel - initial_a.0),
                &(body_a.angvel - initial_a.1),
            );
            scratch.accumulate(
                set,
                &refs[1],
                &(body_b.linvel - initial_b.0),
                &(body_b.angvel - initial_b.1),
            );
        }
    }
}
