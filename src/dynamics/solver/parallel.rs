//! The parallel work scheduler.
//!
//! The unit of work is a block: a contiguous bundle range within one type
//! batch of one constraint batch. A stage is one function applied to one
//! batch; stages execute in strict order with a barrier between them, and
//! within a stage workers claim blocks through a monotonically increasing
//! atomic index. The disjoint-body invariant of synchronized batches makes
//! block execution order within a stage unobservable.
//!
//! Workers never block on locks: a stage barrier is a spin on a completion
//! counter, like the rest of this solver's ancestry.

use crate::dynamics::pose_integration::PoseIntegratorCallbacks;
use crate::dynamics::solver::constraint_batch::ConstraintBatch;
use crate::dynamics::solver::fallback::{FallbackBatch, JacobiScratch};
use crate::dynamics::solver::substep::IntegrationPlan;
use crate::dynamics::solver::type_batch::StageContext;
use crate::dynamics::{BodySet, BodySubset, SolverParameters};
use crate::math::Real;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Target number of bundles per block, to amortize claim overhead.
const BLOCK_BUNDLES: usize = 8;

#[derive(Copy, Clone)]
struct WorkBlock {
    type_batch: usize,
    start_bundle: usize,
    end_bundle: usize,
}

#[derive(Copy, Clone)]
enum StageOp {
    WarmStart { batch: u32, substep: usize },
    FallbackIntegrate { substep: usize },
    Solve { batch: u32, substep: usize },
    FallbackSolve { substep: usize, first_iteration: bool },
}

struct StageDesc {
    op: StageOp,
    num_blocks: usize,
}

struct ThreadContext {
    claim: Vec<AtomicUsize>,
    done: Vec<AtomicUsize>,
}

impl ThreadContext {
    fn new(num_stages: usize) -> Self {
        Self {
            claim: (0..num_stages).map(|_| AtomicUsize::new(0)).collect(),
            done: (0..num_stages).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    fn lock_until_ge(val: &AtomicUsize, target: usize) {
        if target > 0 {
            std::sync::atomic::fence(Ordering::SeqCst);
            while val.load(Ordering::Relaxed) < target {
                std::hint::spin_loop();
            }
        }
    }
}

fn blocks_of_batch(batch: &ConstraintBatch, out: &mut Vec<WorkBlock>) {
    out.clear();
    for (ti, tb) in batch.type_batches.iter().enumerate() {
        let bundles = tb.bundle_count();
        let mut start = 0;
        while start < bundles {
            let end = (start + BLOCK_BUNDLES).min(bundles);
            out.push(WorkBlock {
                type_batch: ti,
                start_bundle: start,
                end_bundle: end,
            });
            start = end;
        }
    }
}

/// Runs every sub-step of one frame across the rayon thread pool, preserving
/// the exact stage ordering of the sequential driver.
pub(crate) fn execute_substeps_parallel(
    batches: &mut Vec<ConstraintBatch>,
    fallback: &mut FallbackBatch,
    scratch: &mut JacobiScratch,
    plan: &IntegrationPlan,
    params: &SolverParameters,
    bodies: &mut BodySet,
    callbacks: &(dyn PoseIntegratorCallbacks + Sync),
    dt: Real,
) {
    let h = params.substep_dt(dt);
    let inv_h = 1.0 / h;
    let angular_mode = callbacks.angular_integration_mode();

    scratch.rebuild(fallback, bodies.active());

    // Per-batch block lists; type batch shapes are frozen during a step.
    let mut batch_blocks: Vec<Vec<WorkBlock>> = Vec::with_capacity(batches.len());
    for batch in batches.iter() {
        let mut blocks = Vec::new();
        blocks_of_batch(batch, &mut blocks);
        batch_blocks.push(blocks);
    }
    let mut fallback_blocks = Vec::new();
    blocks_of_batch(&fallback.batch, &mut fallback_blocks);
    let has_fallback = !fallback.batch.is_empty();

    // The full stage program of the step.
    let mut program = Vec::new();
    for substep in 0..params.substep_count {
        for (bi, blocks) in batch_blocks.iter().enumerate() {
            program.push(StageDesc {
                op: StageOp::WarmStart {
                    batch: bi as u32,
                    substep,
                },
                num_blocks: blocks.len(),
            });
        }
        if has_fallback {
            program.push(StageDesc {
                op: StageOp::FallbackIntegrate { substep },
                num_blocks: fallback_blocks.len(),
            });
        }
        for iteration in 0..params.iteration_count {
            for (bi, blocks) in batch_blocks.iter().enumerate() {
                program.push(StageDesc {
                    op: StageOp::Solve {
                        batch: bi as u32,
                        substep,
                    },
                    num_blocks: blocks.len(),
                });
            }
            if has_fallback {
                // Jacobi accumulation shares per-body slots, so the whole
                // fallback solve is a single block.
                program.push(StageDesc {
                    op: StageOp::FallbackSolve {
                        substep,
                        first_iteration: iteration == 0,
                    },
                    num_blocks: 1,
                });
            }
        }
    }

    let thread = ThreadContext::new(program.len());
    let num_workers = rayon::current_num_threads();

    {
        let active: *mut BodySubset = bodies.active_mut();
        let batches_ptr = AtomicPtr::new(batches as *mut Vec<ConstraintBatch>);
        let fallback_ptr = AtomicPtr::new(fallback as *mut FallbackBatch);
        let scratch_ptr = AtomicPtr::new(scratch as *mut JacobiScratch);
        let active_ptr = AtomicPtr::new(active);
        let program = &program;
        let batch_blocks = &batch_blocks;
        let fallback_blocks = &fallback_blocks;
        let thread = &thread;

        rayon::scope(|scope| {
            for worker_index in 0..num_workers {
                let batches_ptr = &batches_ptr;
                let fallback_ptr = &fallback_ptr;
                let scratch_ptr = &scratch_ptr;
                let active_ptr = &active_ptr;

                scope.spawn(move |_| {
                    // The pointer round-trip hands each worker mutable access
                    // to storage whose blocks it claims exclusively.
                    let batches: &mut Vec<ConstraintBatch> =
                        unsafe { &mut *batches_ptr.load(Ordering::Relaxed) };
                    let fallback: &mut FallbackBatch =
                        unsafe { &mut *fallback_ptr.load(Ordering::Relaxed) };
                    let scratch: &mut JacobiScratch =
                        unsafe { &mut *scratch_ptr.load(Ordering::Relaxed) };
                    let active: &mut BodySubset =
                        unsafe { &mut *active_ptr.load(Ordering::Relaxed) };

                    for (si, stage) in program.iter().enumerate() {
                        let ctx = |substep: usize| StageContext {
                            dt: h,
                            inv_dt: inv_h,
                            callbacks,
                            angular_mode,
                            allow_pose_integration: substep > 0,
                            worker_index,
                        };

                        loop {
                            let claimed = thread.claim[si].fetch_add(1, Ordering::SeqCst);
                            if claimed >= stage.num_blocks {
                                break;
                            }
                            match stage.op {
                                StageOp::WarmStart { batch, substep } => {
                                    let block = batch_blocks[batch as usize][claimed];
                                    let b = &mut batches[batch as usize];
                                    let flags = &plan.batches[batch as usize].type_batches
                                        [block.type_batch];
                                    b.type_batches[block.type_batch].warm_start(
                                        active,
                                        &ctx(substep),
                                        flags,
                                        block.start_bundle..block.end_bundle,
                                    );
                                }
                                StageOp::Solve { batch, substep } => {
                                    let block = batch_blocks[batch as usize][claimed];
                                    let b = &mut batches[batch as usize];
                                    b.type_batches[block.type_batch].solve(
                                        active,
                                        &ctx(substep),
                                        block.start_bundle..block.end_bundle,
                                    );
                                }
                                StageOp::FallbackIntegrate { substep } => {
                                    let block = fallback_blocks[claimed];
                                    let flags =
                                        &plan.fallback.type_batches[block.type_batch];
                                    fallback.batch.type_batches[block.type_batch]
                                        .integrate_flagged(
                                            active,
                                            &ctx(substep),
                                            flags,
                                            block.start_bundle..block.end_bundle,
                                        );
                                }
                                StageOp::FallbackSolve {
                                    substep,
                                    first_iteration,
                                } => {
                                    for tb in fallback.batch.type_batches.iter_mut() {
                                        let bundles = 0..tb.bundle_count();
                                        tb.solve_jacobi(
                                            active,
                                            scratch,
                                            &ctx(substep),
                                            first_iteration,
                                            bundles,
                                        );
                                    }
                                    scratch.apply_and_clear(active);
                                }
                            }
                            thread.done[si].fetch_add(1, Ordering::SeqCst);
                        }

                        ThreadContext::lock_until_ge(&thread.done[si], stage.num_blocks);
                    }
                });
            }
        });
    }

    crate::dynamics::pose_integration::integrate_poses_after_substepping(
        bodies,
        &plan.constrained,
        h,
    );
}
