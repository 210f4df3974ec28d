//! The sub-stepping driver: per-frame integration responsibilities and the
//! sequential sub-step loop.
//!
//! A step of length `dt` runs `substep_count` sub-steps of length `h`.
//! Velocity integration happens inside the warm start of the first batch that
//! touches each body; pose integration is folded into the warm starts of
//! sub-steps after the first, and a trailing pass advances poses once more at
//! the end of the step. Every constrained body is therefore integrated
//! exactly once per sub-step, before any constraint referencing it is solved.

use crate::data::IndexSet;
use crate::dynamics::pose_integration::integrate_poses_after_substepping;
use crate::dynamics::solver::constraint_batch::ConstraintBatch;
use crate::dynamics::solver::fallback::{FallbackBatch, JacobiScratch};
use crate::dynamics::solver::type_batch::{
    BatchIntegrationMode, StageContext, TypeBatchIntegrationFlags,
};
use crate::dynamics::{BodySet, PoseIntegratorCallbacks, SolverParameters};
use crate::math::Real;

/// Integration responsibilities of one constraint batch for the current
/// frame.
pub(crate) struct BatchIntegrationPlan {
    pub type_batches: Vec<TypeBatchIntegrationFlags>,
}

/// The per-frame integration plan: which constraint slot integrates which
/// body, plus the set of all constrained bodies.
pub(crate) struct IntegrationPlan {
    pub batches: Vec<BatchIntegrationPlan>,
    pub fallback: BatchIntegrationPlan,
    /// Handle slots of every dynamic body referenced by any constraint.
    pub constrained: IndexSet,
}

/// Flags the first occurrence of every first-observed body among the
/// constraints of one batch.
fn plan_batch_conditional(
    batch: &ConstraintBatch,
    bodies: &BodySet,
    first_observed: &IndexSet,
    handled: &mut IndexSet,
) -> BatchIntegrationPlan {
    let active = bodies.active();
    let mut type_batches = Vec::with_capacity(batch.type_batches.len());
    let mut indices = Vec::new();

    for tb in &batch.type_batches {
        let mut flags = vec![IndexSet::with_capacity(tb.len()), IndexSet::with_capacity(tb.len())];
        let mut flagged = 0usize;
        for i in 0..tb.len() {
            indices.clear();
            tb.body_indices_at(i, &mut indices);
            for (slot, body_index) in indices.iter().enumerate() {
                if *body_index == crate::dynamics::solver::bundle::EMPTY_LANE {
                    continue;
                }
                let handle_slot = active.index_to_handle[*body_index as usize].0.index();
                if first_observed.contains(handle_slot) && handled.insert(handle_slot) {
                    flags[slot].insert(i);
                    flagged += 1;
                }
            }
        }
        type_batches.push(TypeBatchIntegrationFlags {
            mode: if flagged == 0 {
                BatchIntegrationMode::Never
            } else {
                BatchIntegrationMode::Conditional
            },
            flags,
        });
    }
    BatchIntegrationPlan { type_batches }
}

/// Computes the integration responsibilities for the whole frame.
///
/// For each batch after the first, the bodies it is responsible for are those
/// it references that no earlier batch references. Batch 0 integrates every
/// body it touches; the fallback, always last, only integrates bodies no
/// synchronized batch references, and flags at most one of its slots per
/// body.
pub(crate) fn compute_integration_plan(
    batches: &[ConstraintBatch],
    fallback: &FallbackBatch,
    bodies: &BodySet,
) -> IntegrationPlan {
    let mut union = IndexSet::new();
    let mut handled = IndexSet::new();
    let mut plans = Vec::with_capacity(batches.len());

    for (bi, batch) in batches.iter().enumerate() {
        if bi == 0 {
            plans.push(BatchIntegrationPlan {
                type_batches: batch
                    .type_batches
                    .iter()
                    .map(|_| TypeBatchIntegrationFlags::always())
                    .collect(),
            });
        } else {
            let mut first_observed = batch.referenced_bodies.clone();
            first_observed.subtract(&union);
            handled.clear();
            plans.push(plan_batch_conditional(
                batch,
                bodies,
                &first_observed,
                &mut handled,
            ));
        }
        union.union_with(&batch.referenced_bodies);
    }

    // The fallback may reference a body several times, so it always goes
    // through the flagged path, deduplicated by `handled`.
    let mut first_observed = fallback.batch.referenced_bodies.clone();
    first_observed.subtract(&union);
    handled.clear();
    let fallback_plan =
        plan_batch_conditional(&fallback.batch, bodies, &first_observed, &mut handled);
    union.union_with(&fallback.batch.referenced_bodies);

    IntegrationPlan {
        batches: plans,
        fallback: fallback_plan,
        constrained: union,
    }
}

/// Runs every sub-step of one frame, sequentially.
pub(crate) fn execute_substeps(
    batches: &mut [ConstraintBatch],
    fallback: &mut FallbackBatch,
    scratch: &mut JacobiScratch,
    plan: &IntegrationPlan,
    params: &SolverParameters,
    bodies: &mut BodySet,
    callbacks: &dyn PoseIntegratorCallbacks,
    dt: Real,
) {
    let h = params.substep_dt(dt);
    let inv_h = 1.0 / h;
    let angular_mode = callbacks.angular_integration_mode();

    scratch.rebuild(fallback, bodies.active());

    for substep in 0..params.substep_count {
        let ctx = StageContext {
            dt: h,
            inv_dt: inv_h,
            callbacks,
            angular_mode,
            allow_pose_integration: substep > 0,
            worker_index: 0,
        };
        let active = bodies.active_mut();

        // Warm-start stages, in batch order. Each one runs this batch's
        // integration responsibilities before applying accumulated impulses.
        for (bi, batch) in batches.iter_mut().enumerate() {
            for (ti, tb) in batch.type_batches.iter_mut().enumerate() {
                let bundles = 0..tb.bundle_count();
                tb.warm_start(active, &ctx, &plan.batches[bi].type_batches[ti], bundles);
            }
        }

        // The fallback never warm-starts standalone, but bodies it alone
        // references still integrate exactly once, here.
        for (ti, tb) in fallback.batch.type_batches.iter_mut().enumerate() {
            let bundles = 0..tb.bundle_count();
            tb.integrate_flagged(active, &ctx, &plan.fallback.type_batches[ti], bundles);
        }

        // Solve stages: every synchronized batch in order, then the fallback
        // with Jacobi averaging, its warm start folded into the first
        // iteration.
        for iteration in 0..params.iteration_count {
            for batch in batches.iter_mut() {
                for tb in batch.type_batches.iter_mut() {
                    let bundles = 0..tb.bundle_count();
                    tb.solve(active, &ctx, bundles);
                }
            }

            if !fallback.is_empty() {
                for tb in fallback.batch.type_batches.iter_mut() {
                    let bundles = 0..tb.bundle_count();
                    tb.solve_jacobi(active, scratch, &ctx, iteration == 0, bundles);
                }
                scratch.apply_and_clear(active);
            }
        }
    }

    integrate_poses_after_substepping(bodies, &plan.constrained, h);
}
