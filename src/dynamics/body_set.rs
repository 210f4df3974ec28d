//! The body store: dense per-set storage, a stable handle map, and the wide
//! gather/scatter primitives the solver kernels consume.

use crate::data::arena::Arena;
use crate::dynamics::body::world_inv_inertia;
use crate::dynamics::solver::bundle::{
    BodyAccessFilter, BodyBundle, BodyIndexLanes, EMPTY_LANE,
};
use crate::dynamics::{BodyHandle, RigidBody};
use crate::math::{Quaternion, SimdReal, Vector, SIMD_WIDTH};
use crate::utils::SdpMatrix3;
use na::SimdValue;

/// The id of the set holding awake bodies.
pub const ACTIVE_SET: u32 = 0;

/// Where a body currently lives: which set, and at which dense index inside
/// that set.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct BodyLocation {
    /// [`ACTIVE_SET`] for awake bodies, otherwise the sleeping island id.
    pub set: u32,
    /// The dense index of the body inside its set.
    pub index: u32,
}

/// One densely-packed set of bodies: the active set, or one sleeping island.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct BodySubset {
    pub(crate) bodies: Vec<RigidBody>,
    pub(crate) index_to_handle: Vec<BodyHandle>,
}

impl BodySubset {
    /// The number of bodies in this set.
    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    /// Whether this set holds no body.
    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    /// The handle of the body at `index`.
    pub fn handle(&self, index: u32) -> BodyHandle {
        self.index_to_handle[index as usize]
    }

    /// The body at `index`.
    pub fn body(&self, index: u32) -> &RigidBody {
        &self.bodies[index as usize]
    }

    /// The body at `index`, mutably.
    pub fn body_mut(&mut self, index: u32) -> &mut RigidBody {
        &mut self.bodies[index as usize]
    }

    /// Gathers the state of up to `SIMD_WIDTH` bodies into wide registers.
    ///
    /// Lanes holding [`EMPTY_LANE`] read as an inert body: zero inverse mass
    /// and inertia, identity orientation, zero velocity. Kernels may compute
    /// garbage in those lanes; every scatter masks them out.
    ///
    /// When `local_inertia` is true the bundle's inertia field holds the
    /// local-space tensors (pose integration rotates them itself); otherwise
    /// it holds the cached world-space tensors.
    pub fn gather(
        &self,
        indices: &BodyIndexLanes,
        filter: BodyAccessFilter,
        local_inertia: bool,
    ) -> BodyBundle {
        let angular_only = filter == BodyAccessFilter::AngularOnly;

        let position = if angular_only {
            Vector::repeat(SimdReal::splat(0.0))
        } else {
            Vector::from(gather![|ii| match self.bodies.get(indices[ii] as usize) {
                Some(rb) => rb.pose.translation.vector,
                None => Vector::zeros(),
            }])
        };
        let orientation = Quaternion::from(gather![|ii| match self
            .bodies
            .get(indices[ii] as usize)
        {
            Some(rb) => *rb.pose.rotation.quaternion(),
            None => Quaternion::identity(),
        }]);
        let linvel = if angular_only {
            Vector::repeat(SimdReal::splat(0.0))
        } else {
            Vector::from(gather![|ii| match self.bodies.get(indices[ii] as usize) {
                Some(rb) => rb.vels.linvel,
                None => Vector::zeros(),
            }])
        };
        let angvel = if filter == BodyAccessFilter::LinearOnly {
            Vector::repeat(SimdReal::splat(0.0))
        } else {
            Vector::from(gather![|ii| match self.bodies.get(indices[ii] as usize) {
                Some(rb) => rb.vels.angvel,
                None => Vector::zeros(),
            }])
        };
        let inv_mass = SimdReal::from(gather![|ii| match self.bodies.get(indices[ii] as usize) {
            Some(rb) => rb.inertia.inv_mass,
            None => 0.0,
        }]);
        let inv_inertia =
            SdpMatrix3::from(gather![|ii| match self.bodies.get(indices[ii] as usize) {
                Some(rb) if local_inertia => rb.inertia.local_inv_inertia,
                Some(rb) => rb.world_inv_inertia,
                None => SdpMatrix3::zero(),
            }]);

        BodyBundle {
            position,
            orientation,
            linvel,
            angvel,
            inv_mass,
            inv_inertia,
        }
    }

    /// Scatters the bundle's velocities back to the bodies.
    ///
    /// Empty lanes and non-dynamic bodies are skipped, so garbage computed in
    /// inactive lanes never escapes and fixed bodies stay immovable. The
    /// filter skips the components the kernel never touched.
    pub fn scatter_velocities(
        &mut self,
        indices: &BodyIndexLanes,
        bundle: &BodyBundle,
        filter: BodyAccessFilter,
    ) {
        for ii in 0..SIMD_WIDTH {
            if indices[ii] == EMPTY_LANE {
                continue;
            }
            let rb = &mut self.bodies[indices[ii] as usize];
            if rb.is_dynamic() {
                if filter != BodyAccessFilter::AngularOnly {
                    rb.vels.linvel = bundle.linvel.extract(ii);
                }
                if filter != BodyAccessFilter::LinearOnly {
                    rb.vels.angvel = bundle.angvel.extract(ii);
                }
            }
        }
    }

    /// Scatters the bundle's velocities only for the lanes selected by
    /// `mask_bits`.
    pub fn scatter_velocities_masked(
        &mut self,
        indices: &BodyIndexLanes,
        bundle: &BodyBundle,
        mask_bits: u32,
    ) {
        for ii in 0..SIMD_WIDTH {
            if mask_bits & (1 << ii) == 0 || indices[ii] == EMPTY_LANE {
                continue;
            }
            let rb = &mut self.bodies[indices[ii] as usize];
            if rb.is_dynamic() {
                rb.vels.linvel = bundle.linvel.extract(ii);
                rb.vels.angvel = bundle.angvel.extract(ii);
            }
        }
    }

    /// Scatters only the world inverse inertia for the lanes selected by
    /// `mask_bits`.
    pub fn scatter_inertia(
        &mut self,
        indices: &BodyIndexLanes,
        world_inertia: &SdpMatrix3<SimdReal>,
        mask_bits: u32,
    ) {
        for ii in 0..SIMD_WIDTH {
            if mask_bits & (1 << ii) == 0 || indices[ii] == EMPTY_LANE {
                continue;
            }
            self.bodies[indices[ii] as usize].world_inv_inertia = world_inertia.extract_lane(ii);
        }
    }

    /// The bitmask of lanes referring to live, dynamic bodies.
    pub(crate) fn dynamic_lane_bits(&self, indices: &BodyIndexLanes) -> u32 {
        let mut bits = 0;
        for ii in 0..SIMD_WIDTH {
            if let Some(rb) = self.bodies.get(indices[ii] as usize) {
                if rb.is_dynamic() {
                    bits |= 1 << ii;
                }
            }
        }
        bits
    }

    /// Scatters the bundle's pose and world inverse inertia for the lanes
    /// selected by `mask_bits` (bit `i` = lane `i`).
    pub fn scatter_pose_and_inertia(
        &mut self,
        indices: &BodyIndexLanes,
        bundle: &BodyBundle,
        world_inertia: &SdpMatrix3<SimdReal>,
        mask_bits: u32,
    ) {
        for ii in 0..SIMD_WIDTH {
            if mask_bits & (1 << ii) == 0 || indices[ii] == EMPTY_LANE {
                continue;
            }
            let rb = &mut self.bodies[indices[ii] as usize];
            rb.pose.translation.vector = bundle.position.extract(ii);
            let q = bundle.orientation.extract(ii);
            rb.pose.rotation = na::UnitQuaternion::new_unchecked(q);
            rb.world_inv_inertia = world_inertia.extract_lane(ii);
        }
    }
}

/// The body store: pose, velocity and inertia per body, a stable handle map,
/// and the active/sleeping partition.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct BodySet {
    pub(crate) handle_map: Arena<BodyLocation>,
    pub(crate) sets: Vec<BodySubset>,
    pub(crate) free_sets: Vec<u32>,
}

impl Default for BodySet {
    fn default() -> Self {
        Self::new()
    }
}

impl BodySet {
    /// Creates an empty body store.
    pub fn new() -> Self {
        Self::with_capacity(4, 4)
    }

    /// Creates an empty body store with room for `body_capacity` bodies and
    /// `island_capacity` sleeping islands.
    pub fn with_capacity(body_capacity: usize, island_capacity: usize) -> Self {
        let mut active = BodySubset::default();
        active.bodies.reserve(body_capacity);
        active.index_to_handle.reserve(body_capacity);
        let mut sets = Vec::with_capacity(island_capacity + 1);
        sets.push(active);
        Self {
            handle_map: Arena::with_capacity(body_capacity),
            sets,
            free_sets: Vec::new(),
        }
    }

    /// The number of live bodies, across all sets.
    pub fn len(&self) -> usize {
        self.handle_map.len()
    }

    /// Whether the store holds no body.
    pub fn is_empty(&self) -> bool {
        self.handle_map.is_empty()
    }

    /// The set of awake bodies.
    pub fn active(&self) -> &BodySubset {
        &self.sets[ACTIVE_SET as usize]
    }

    /// The set of awake bodies, mutably.
    pub fn active_mut(&mut self) -> &mut BodySubset {
        &mut self.sets[ACTIVE_SET as usize]
    }

    /// Inserts a new body into the active set and returns its handle.
    pub fn insert(&mut self, body: RigidBody) -> BodyHandle {
        let active = &mut self.sets[ACTIVE_SET as usize];
        let index = active.bodies.len() as u32;
        let handle = BodyHandle(self.handle_map.insert(BodyLocation {
            set: ACTIVE_SET,
            index,
        }));
        active.bodies.push(body);
        active.index_to_handle.push(handle);
        handle
    }

    /// Maps a handle to the set and dense index currently holding the body.
    pub fn location(&self, handle: BodyHandle) -> Option<BodyLocation> {
        self.handle_map.get(handle.0).copied()
    }

    /// Whether `handle` refers to a live body in the active set.
    pub fn is_active(&self, handle: BodyHandle) -> bool {
        self.location(handle).is_some_and(|loc| loc.set == ACTIVE_SET)
    }

    /// Gets a body by handle, regardless of the set holding it.
    pub fn get(&self, handle: BodyHandle) -> Option<&RigidBody> {
        let loc = self.location(handle)?;
        self.sets
            .get(loc.set as usize)
            .and_then(|set| set.bodies.get(loc.index as usize))
    }

    /// Gets a body by handle, mutably.
    pub fn get_mut(&mut self, handle: BodyHandle) -> Option<&mut RigidBody> {
        let loc = self.location(handle)?;
        self.sets
            .get_mut(loc.set as usize)
            .and_then(|set| set.bodies.get_mut(loc.index as usize))
    }

    /// Recovers the full handle stored in arena slot `slot`, if it is live.
    ///
    /// Sleeping constraints store only the slot part of body handles; this is
    /// the reverse mapping used when waking them.
    pub(crate) fn handle_of_slot(&self, slot: u32) -> Option<BodyHandle> {
        self.handle_map.get_unknown_gen(slot).map(|(i, _)| BodyHandle(i))
    }

    /// Removes a body from the active set.
    ///
    /// Returns the removed body and, when the removal moved another body into
    /// the freed slot, the handle of that moved body. The caller is
    /// responsible for rewriting any constraint body-reference that pointed
    /// at the moved body's old index.
    pub(crate) fn remove_active(
        &mut self,
        handle: BodyHandle,
    ) -> (RigidBody, Option<BodyHandle>) {
        let loc = self.location(handle).expect("removing an unknown body");
        assert_eq!(
            loc.set, ACTIVE_SET,
            "sleeping bodies must be woken before removal"
        );
        let active = &mut self.sets[ACTIVE_SET as usize];
        let removed = active.bodies.swap_remove(loc.index as usize);
        active.index_to_handle.swap_remove(loc.index as usize);
        self.handle_map.remove(handle.0);

        let moved = if (loc.index as usize) < active.bodies.len() {
            let moved_handle = active.index_to_handle[loc.index as usize];
            self.handle_map[moved_handle.0].index = loc.index;
            Some(moved_handle)
        } else {
            None
        };
        (removed, moved)
    }

    /// Moves an active body into the sleeping set `set`. Returns the handle
    /// of the body moved into the freed active slot, if any; the caller must
    /// rewrite the constraint body-references of that moved body.
    pub(crate) fn move_to_sleeping(&mut self, handle: BodyHandle, set: u32) -> Option<BodyHandle> {
        let loc = self.location(handle).expect("sleeping an unknown body");
        assert_eq!(loc.set, ACTIVE_SET, "body is already sleeping");
        debug_assert_ne!(set, ACTIVE_SET);

        let active = &mut self.sets[ACTIVE_SET as usize];
        let body = active.bodies.swap_remove(loc.index as usize);
        active.index_to_handle.swap_remove(loc.index as usize);
        let moved = if (loc.index as usize) < active.bodies.len() {
            let moved_handle = active.index_to_handle[loc.index as usize];
            self.handle_map[moved_handle.0].index = loc.index;
            Some(moved_handle)
        } else {
            None
        };

        let island = &mut self.sets[set as usize];
        self.handle_map[handle.0] = BodyLocation {
            set,
            index: island.bodies.len() as u32,
        };
        island.bodies.push(body);
        island.index_to_handle.push(handle);
        moved
    }

    /// Moves every body of the sleeping set `set` back into the active set,
    /// in island order, and releases the set.
    pub(crate) fn move_set_to_active(&mut self, set: u32) {
        debug_assert_ne!(set, ACTIVE_SET);
        let island = std::mem::take(&mut self.sets[set as usize]);
        let active = &mut self.sets[ACTIVE_SET as usize];
        for (body, handle) in island.bodies.into_iter().zip(island.index_to_handle) {
            self.handle_map[handle.0] = BodyLocation {
                set: ACTIVE_SET,
                index: active.bodies.len() as u32,
            };
            active.bodies.push(body);
            active.index_to_handle.push(handle);
        }
        self.release_sleeping_set(set);
    }

    /// Allocates an empty sleeping set and returns its id.
    pub(crate) fn allocate_sleeping_set(&mut self) -> u32 {
        if let Some(id) = self.free_sets.pop() {
            id
        } else {
            self.sets.push(BodySubset::default());
            (self.sets.len() - 1) as u32
        }
    }

    /// Releases an emptied sleeping set for reuse.
    pub(crate) fn release_sleeping_set(&mut self, set: u32) {
        debug_assert_ne!(set, ACTIVE_SET);
        debug_assert!(self.sets[set as usize].is_empty());
        self.free_sets.push(set);
    }

    /// Refreshes the cached world-space inverse inertia of every active body.
    pub fn refresh_world_inertias(&mut self) {
        for rb in &mut self.sets[ACTIVE_SET as usize].bodies {
            rb.world_inv_inertia = world_inv_inertia(&rb.inertia.local_inv_inertia, &rb.pose);
        }
    }
}

impl SdpMatrix3<SimdReal> {
    /// Extracts the scalar matrix stored in lane `lane`.
    pub(crate) fn extract_lane(&self, lane: usize) -> SdpMatrix3<crate::math::Real> {
        SdpMatrix3 {
            m11: self.m11.extract(lane),
            m12: self.m12.extract(lane),
            m13: self.m13.extract(lane),
            m22: self.m22.extract(lane),
            m23: self.m23.extract(lane),
            m33: self.m33.extract(lane),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dynamics::BodyInertia;
    use crate::math::Isometry;
    use na::SimdValue;

    fn dynamic_body(x: f32) -> RigidBody {
        RigidBody::dynamic(
            Isometry::translation(x, 0.0, 0.0),
            BodyInertia::from_mass_and_principal_inertia(1.0, Vector::repeat(1.0)),
        )
    }

    #[test]
    fn insert_locate_get() {
        let mut bodies = BodySet::new();
        let a = bodies.insert(dynamic_body(1.0));
        let b = bodies.insert(dynamic_body(2.0));
        assert_eq!(bodies.location(a).unwrap().index, 0);
        assert_eq!(bodies.location(b).unwrap().index, 1);
        assert_eq!(bodies.get(b).unwrap().pose.translation.x, 2.0);
    }

    #[test]
    fn swap_removal_updates_the_moved_location() {
        let mut bodies = BodySet::new();
        let a = bodies.insert(dynamic_body(1.0));
        let b = bodies.insert(dynamic_body(2.0));
        let c = bodies.insert(dynamic_body(3.0));
        let (_, moved) = bodies.remove_active(a);
        assert_eq!(moved, Some(c));
        assert_eq!(bodies.location(c).unwrap().index, 0);
        assert_eq!(bodies.location(b).unwrap().index, 1);
        assert_eq!(bodies.get(c).unwrap().pose.translation.x, 3.0);
    }

    #[test]
    fn gather_pads_empty_lanes_with_inert_state() {
        let mut bodies = BodySet::new();
        let a = bodies.insert(dynamic_body(5.0));
        let idx = bodies.location(a).unwrap().index;
        let mut lanes = [EMPTY_LANE; SIMD_WIDTH];
        lanes[0] = idx;
        let bundle = bodies
            .active()
            .gather(&lanes, BodyAccessFilter::All, false);
        assert_eq!(bundle.position.x.extract(0), 5.0);
        assert_eq!(bundle.inv_mass.extract(0), 1.0);
        if SIMD_WIDTH > 1 {
            assert_eq!(bundle.inv_mass.extract(1), 0.0);
        }
    }
}
