//! Registration of constraint types.
//!
//! Type ids are dense and assigned in registration order, which is part of
//! the determinism contract: two runs registering the same types in the same
//! order store and iterate constraints identically.

use crate::dynamics::solver::type_batch::{AnyTypeBatch, TwoBodyConstraint, TypeBatch};
use std::any::TypeId;
use std::collections::HashMap;

struct TypeEntry {
    name: &'static str,
    bodies_per_constraint: usize,
    make: fn(u32, usize) -> Box<dyn AnyTypeBatch>,
}

/// The set of constraint types known to a solver.
#[derive(Default)]
pub struct ConstraintRegistry {
    entries: Vec<TypeEntry>,
    by_rust_type: HashMap<TypeId, u32>,
}

fn make_batch<C: TwoBodyConstraint>(type_id: u32, capacity: usize) -> Box<dyn AnyTypeBatch> {
    Box::new(TypeBatch::<C>::with_capacity(type_id, capacity))
}

impl ConstraintRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constraint type and returns its dense id. Registering the
    /// same type twice returns the id assigned the first time.
    pub fn register<C: TwoBodyConstraint>(&mut self) -> u32 {
        if let Some(id) = self.by_rust_type.get(&TypeId::of::<C>()) {
            return *id;
        }
        let id = self.entries.len() as u32;
        self.entries.push(TypeEntry {
            name: C::NAME,
            bodies_per_constraint: 2,
            make: make_batch::<C>,
        });
        self.by_rust_type.insert(TypeId::of::<C>(), id);
        id
    }

    /// The id assigned to `C`, if it was registered.
    pub fn id_of<C: TwoBodyConstraint>(&self) -> Option<u32> {
        self.by_rust_type.get(&TypeId::of::<C>()).copied()
    }

    /// The number of registered types.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no type was registered yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The diagnostic name of a type.
    pub fn name(&self, type_id: u32) -> &'static str {
        self.entries[type_id as usize].name
    }

    /// The number of bodies referenced by each constraint of a type.
    pub fn bodies_per_constraint(&self, type_id: u32) -> usize {
        self.entries[type_id as usize].bodies_per_constraint
    }

    /// Creates an empty type batch for `type_id`.
    pub fn make_type_batch(&self, type_id: u32, capacity: usize) -> Box<dyn AnyTypeBatch> {
        (self.entries[type_id as usize].make)(type_id, capacity)
    }
}
