//! Constraint batches: groups of type batches whose constraints collectively
//! touch each body at most once.

use crate::data::IndexSet;
use crate::dynamics::solver::registry::ConstraintRegistry;
use crate::dynamics::solver::type_batch::AnyTypeBatch;
use vec_map::VecMap;

/// One synchronized constraint batch.
///
/// The referenced-bodies set contains the handle slot of every dynamic body
/// referenced by any constraint of the batch, which makes "does this batch
/// conflict with these bodies?" one bitwise test per body. Non-dynamic bodies
/// do not transmit impulses, so they never count as conflicts and are not
/// tracked.
#[derive(Default)]
pub struct ConstraintBatch {
    pub(crate) referenced_bodies: IndexSet,
    pub(crate) type_batches: Vec<Box<dyn AnyTypeBatch>>,
    pub(crate) type_to_index: VecMap<usize>,
}

impl ConstraintBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this batch references any of the given body handle slots.
    pub fn references_any(&self, handle_slots: &[u32]) -> bool {
        handle_slots
            .iter()
            .any(|slot| self.referenced_bodies.contains(*slot as usize))
    }

    /// The type batch storing constraints of `type_id`, if any.
    pub fn type_batch(&self, type_id: u32) -> Option<&dyn AnyTypeBatch> {
        self.type_to_index
            .get(type_id as usize)
            .map(|i| &*self.type_batches[*i])
    }

    /// The type batch storing constraints of `type_id`, mutably, if any.
    pub fn type_batch_mut(&mut self, type_id: u32) -> Option<&mut (dyn AnyTypeBatch + 'static)> {
        match self.type_to_index.get(type_id as usize) {
            Some(i) => Some(&mut *self.type_batches[*i]),
            None => None,
        }
    }

    /// The type batch for `type_id`, created through the registry on first
    /// use.
    pub fn type_batch_or_create(
        &mut self,
        type_id: u32,
        registry: &ConstraintRegistry,
        capacity: usize,
    ) -> &mut (dyn AnyTypeBatch + 'static) {
        if let Some(i) = self.type_to_index.get(type_id as usize).copied() {
            return &mut *self.type_batches[i];
        }
        let index = self.type_batches.len();
        self.type_batches
            .push(registry.make_type_batch(type_id, capacity));
        self.type_to_index.insert(type_id as usize, index);
        &mut *self.type_batches[index]
    }

    /// Drops the type batch for `type_id` if it became empty, keeping the
    /// type→batch map consistent.
    pub fn remove_type_batch_if_empty(&mut self, type_id: u32) {
        if let Some(i) = self.type_to_index.get(type_id as usize).copied() {
            if self.type_batches[i].is_empty() {
                self.type_batches.swap_remove(i);
                self.type_to_index.remove(type_id as usize);
                if i < self.type_batches.len() {
                    let moved_type = AnyTypeBatch::type_id(&*self.type_batches[i]);
                    self.type_to_index.insert(moved_type as usize, i);
                }
            }
        }
    }

    /// The number of constraints stored across every type batch.
    pub fn len(&self) -> usize {
        self.type_batches.iter().map(|tb| tb.len()).sum()
    }

    /// Whether this batch stores no constraint at all.
    pub fn is_empty(&self) -> bool {
        self.type_batches.iter().all(|tb| tb.is_empty())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dynamics::solver::kernels::Weld;

    #[test]
    fn type_batches_are_created_once_per_type() {
        let mut registry = ConstraintRegistry::new();
        let weld_id = registry.register::<Weld>();
        let mut batch = ConstraintBatch::new();
        assert!(batch.type_batch(weld_id).is_none());
        batch.type_batch_or_create(weld_id, &registry, 16);
        batch.type_batch_or_create(weld_id, &registry, 16);
        assert_eq!(batch.type_batches.len(), 1);
        assert_eq!(AnyTypeBatch::type_id(batch.type_batch(weld_id).unwrap()), weld_id);
    }

    #[test]
    fn conflict_query_matches_referenced_set() {
        let mut batch = ConstraintBatch::new();
        batch.referenced_bodies.insert(3);
        batch.referenced_bodies.insert(100);
        assert!(batch.references_any(&[3]));
        assert!(batch.references_any(&[1, 100]));
        assert!(!batch.references_any(&[2, 99, 101]));
    }
}
