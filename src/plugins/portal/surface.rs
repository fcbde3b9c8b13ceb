//! One of the two linked portal openings: placement state, validity checks and the cache of
//! colliders a crossing body must pass through.

use bevy::{prelude::*, utils::HashSet};

use crate::plugins::physics::{PortalPhysics, QueryBox};

use super::{
    config::{LayerConfig, SurfaceConfig},
    geometry,
};

/// Maximum tilt of the surface normal off the horizontal plane for a wall portal, degrees.
const VERTICAL_TOLERANCE_DEGREES: f32 = 45.1;
/// Minimum tilt off vertical for an upward facing (floor) portal, degrees.
const UPWARD_TILT_DEGREES: f32 = 30.1;
/// Thickness of the bounds used for visibility tests.
const BOUNDS_HALF_DEPTH: f32 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Reflect, FromReflect)]
pub enum PortalId {
    A,
    B,
}

impl Default for PortalId {
    fn default() -> Self {
        PortalId::A
    }
}

impl PortalId {
    pub const BOTH: [PortalId; 2] = [PortalId::A, PortalId::B];

    pub const fn other(self) -> PortalId {
        match self {
            PortalId::A => PortalId::B,
            PortalId::B => PortalId::A,
        }
    }

    pub const fn index(self) -> usize {
        match self {
            PortalId::A => 0,
            PortalId::B => 1,
        }
    }
}

/// Visual state of a surface: active only if both surfaces are placed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Reflect, FromReflect)]
pub enum SurfaceAppearance {
    Active,
    #[default]
    Inactive,
}

/// Query volumes derived from the surface pose.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryBoxes {
    pub entry: QueryBox,
    pub deep: QueryBox,
    pub guard: QueryBox,
    pub footprint: QueryBox,
    pub bounds: QueryBox,
}

impl QueryBoxes {
    fn new(pose: &Transform, config: &SurfaceConfig) -> Self {
        let half = config.half_extents();
        let deep_half = config.blocking_depth / 2.;
        let guard_half = config.guard_depth / 2.;
        let overlap_half = config.overlap_depth / 2.;
        QueryBoxes {
            entry: QueryBox::in_frame(
                pose,
                Vec3::ZERO,
                half.extend(config.entry_half_depth),
            ),
            deep: QueryBox::in_frame(pose, Vec3::new(0., 0., -deep_half), half.extend(deep_half)),
            guard: QueryBox::in_frame(pose, Vec3::new(0., 0., guard_half), half.extend(guard_half)),
            footprint: QueryBox::in_frame(
                pose,
                Vec3::new(0., 0., config.placement_clearance + overlap_half),
                half.extend(overlap_half),
            ),
            bounds: QueryBox::in_frame(pose, Vec3::ZERO, half.extend(BOUNDS_HALF_DEPTH)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PortalSurface {
    id: PortalId,
    pose: Transform,
    config: SurfaceConfig,
    layers: LayerConfig,
    boxes: QueryBoxes,
    placed: bool,
    wall: Option<Entity>,
    volume: Option<Entity>,
    appearance: SurfaceAppearance,
    blocking: HashSet<Entity>,
    blocking_age: f32,
    blocking_valid: bool,
    entered: HashSet<Entity>,
}

impl PortalSurface {
    pub fn new(id: PortalId, config: SurfaceConfig, layers: LayerConfig) -> Self {
        let pose = Transform::IDENTITY;
        PortalSurface {
            id,
            boxes: QueryBoxes::new(&pose, &config),
            pose,
            config,
            layers,
            placed: false,
            wall: None,
            volume: None,
            appearance: SurfaceAppearance::Inactive,
            blocking: HashSet::default(),
            blocking_age: 0.,
            blocking_valid: false,
            entered: HashSet::default(),
        }
    }

    pub fn id(&self) -> PortalId {
        self.id
    }

    pub fn pose(&self) -> &Transform {
        &self.pose
    }

    pub fn half_extents(&self) -> Vec2 {
        self.config.half_extents()
    }

    pub fn normal(&self) -> Vec3 {
        self.pose.back()
    }

    pub fn query_boxes(&self) -> &QueryBoxes {
        &self.boxes
    }

    pub fn is_placed(&self) -> bool {
        self.placed
    }

    pub fn wall(&self) -> Option<Entity> {
        self.wall
    }

    pub fn volume(&self) -> Option<Entity> {
        self.volume
    }

    /// The surface's own sensor collider, excluded from all of its queries.
    pub fn set_volume(&mut self, volume: Option<Entity>) {
        self.volume = volume;
    }

    pub fn appearance(&self) -> SurfaceAppearance {
        self.appearance
    }

    pub(super) fn set_appearance(&mut self, appearance: SurfaceAppearance) {
        self.appearance = appearance;
    }

    pub fn entered_objects(&self) -> &HashSet<Entity> {
        &self.entered
    }

    pub(super) fn entered_objects_mut(&mut self) -> &mut HashSet<Entity> {
        &mut self.entered
    }

    pub fn blocking_colliders(&self) -> &HashSet<Entity> {
        &self.blocking
    }

    /// Move the surface. Derived query volumes follow; the blocking cache is invalidated.
    pub fn set_pose(&mut self, pose: Transform) {
        self.pose = pose;
        self.boxes = QueryBoxes::new(&self.pose, &self.config);
        self.invalidate_blocking_colliders();
    }

    pub fn local_point(&self, point: Vec3) -> Vec3 {
        geometry::to_local(&self.pose, point)
    }

    pub fn world_point(&self, local: Vec3) -> Vec3 {
        geometry::to_world(&self.pose, local)
    }

    /// Whether a local point projects inside the opening.
    pub fn contains_laterally(&self, local: Vec3) -> bool {
        let half = self.half_extents();
        local.x.abs() <= half.x && local.y.abs() <= half.y
    }

    fn exclusions(&self) -> Vec<Entity> {
        self.volume.into_iter().collect()
    }

    /// Cast one short ray per corner toward the mounting wall. True if the opening would hang off
    /// the edge of its mount or sit on a material which doesn't take portals.
    pub fn is_placement_overhang(&self, physics: &dyn PortalPhysics) -> bool {
        let half = self.half_extents();
        let inward = self.pose.forward();
        let clearance = self.config.placement_clearance;
        let reach = clearance + self.config.overhang_ray_length;
        let corners = [
            Vec3::new(-half.x, -half.y, clearance),
            Vec3::new(half.x, -half.y, clearance),
            Vec3::new(-half.x, half.y, clearance),
            Vec3::new(half.x, half.y, clearance),
        ];
        corners.iter().any(|corner| {
            let origin = self.world_point(*corner);
            match physics.cast_ray(origin, inward, reach, self.layers.placement()) {
                Some(hit) => !self.is_receptive(physics.surface_material(hit.collider)),
                None => true,
            }
        })
    }

    fn is_receptive(&self, material: Option<&str>) -> bool {
        material.map_or(false, |name| {
            name.starts_with(self.config.receptive_material_prefix.as_str())
        })
    }

    /// True if anything relevant to placement, including the other portal, intersects the
    /// opening's footprint.
    pub fn is_placement_overlap(&self, physics: &dyn PortalPhysics) -> bool {
        !physics
            .overlap_box(&self.boxes.footprint, self.layers.overlap(), &self.exclusions())
            .is_empty()
    }

    /// Mount the surface on `wall` at its current pose. Returns true if it was not placed before.
    pub fn activate(&mut self, wall: Option<Entity>) -> bool {
        self.wall = wall;
        self.boxes = QueryBoxes::new(&self.pose, &self.config);
        self.invalidate_blocking_colliders();
        if self.placed {
            false
        } else {
            self.placed = true;
            true
        }
    }

    /// Final step of a removal, once the entered objects have been evicted.
    pub(super) fn mark_removed(&mut self) {
        self.invalidate_blocking_colliders();
        self.wall = None;
        self.placed = false;
        self.appearance = SurfaceAppearance::Inactive;
        self.blocking.clear();
    }

    pub fn advance(&mut self, dt: f32) {
        self.blocking_age += dt;
    }

    pub fn invalidate_blocking_colliders(&mut self) {
        self.blocking_valid = false;
    }

    pub fn is_blocking_colliders_up_to_date(&self) -> bool {
        self.blocking_valid && self.blocking_age < self.config.blocking_cache_duration
    }

    /// Recompute the colliders behind the surface, minus those also reaching the guard volume in
    /// front of it. The mounting wall is always blocking.
    pub fn update_blocking_colliders(&mut self, physics: &dyn PortalPhysics) {
        let exclude = self.exclusions();
        let groups = self.layers.blocking();
        let guarded: HashSet<Entity> = physics
            .overlap_box(&self.boxes.guard, groups, &exclude)
            .into_iter()
            .collect();
        self.blocking = physics
            .overlap_box(&self.boxes.deep, groups, &exclude)
            .into_iter()
            .filter(|collider| !guarded.contains(collider))
            .collect();
        if let Some(wall) = self.wall {
            self.blocking.insert(wall);
        }
        self.blocking_age = 0.;
        self.blocking_valid = true;
        debug!(
            "Portal {:?} blocking colliders: {:?}",
            self.id, self.blocking
        );
    }

    /// Whether a surface with this rotation is a wall portal, its normal within 45.1° of the
    /// horizontal plane.
    pub fn is_vertical(rotation: Quat) -> bool {
        let normal = rotation * Vec3::Z;
        normal.y.clamp(-1., 1.).asin().abs().to_degrees() <= VERTICAL_TOLERANCE_DEGREES
    }

    /// Whether a surface with this rotation faces upward, tilted at least 30.1° from vertical.
    pub fn points_upwards(rotation: Quat) -> bool {
        let normal = rotation * Vec3::Z;
        normal.y > 0. && normal.y.clamp(-1., 1.).asin().to_degrees() >= UPWARD_TILT_DEGREES
    }
}
