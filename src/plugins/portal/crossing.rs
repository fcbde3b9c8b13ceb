//! Per-object portal membership and the collision exclusions that go with it.
//!
//! An object entering a surface's entry volume stops colliding with everything behind that
//! surface (its blocking colliders), so it can move through the wall the surface is mounted on.
//! The exclusions are reconciled against the surface's blocking cache every tick and released
//! on exit, except for colliders the object still ignores through the other surface.

use bevy::{
    prelude::*,
    utils::{HashMap, HashSet},
};
use bevy_rapier3d::prelude::{Group, Velocity};
use euclid::Angle;

use crate::plugins::physics::PortalPhysics;

use super::surface::{PortalId, PortalSurface};

/// Which velocity rules apply to a body when it exits a portal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Reflect, FromReflect)]
pub enum BodyKind {
    /// Dynamic rigid body.
    #[default]
    Rigid,
    /// Upright capsule driven by a character controller.
    Character,
}

/// Pitch and roll of a viewpoint attached to a body which only yaws.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewpoint {
    pub pitch: Angle<f32>,
    pub roll: Angle<f32>,
}

impl Default for Viewpoint {
    fn default() -> Self {
        Viewpoint {
            pitch: Angle::zero(),
            roll: Angle::zero(),
        }
    }
}

impl Viewpoint {
    pub fn rotation(&self) -> Quat {
        Quat::from_rotation_x(self.pitch.radians) * Quat::from_rotation_z(self.roll.radians)
    }
}

/// A body which can travel through portals.
#[derive(Debug, Clone)]
pub struct TrackedObject {
    /// Primary collision volume.
    pub collider: Entity,
    pub body: Transform,
    /// Point whose crossing triggers the teleport, in body space.
    pub tracked_offset: Vec3,
    /// Height of the tracked point above the feet, zero for bodies without feet.
    pub tracked_height: f32,
    pub viewpoint: Option<Viewpoint>,
    pub velocity: Option<Velocity>,
    pub kind: BodyKind,
    pub grounded: bool,
    entered: [bool; 2],
    ignored: [Option<HashSet<Entity>>; 2],
}

impl TrackedObject {
    pub fn new(collider: Entity, body: Transform, kind: BodyKind) -> Self {
        TrackedObject {
            collider,
            body,
            tracked_offset: Vec3::ZERO,
            tracked_height: 0.,
            viewpoint: None,
            velocity: None,
            kind,
            grounded: false,
            entered: [false; 2],
            ignored: [None, None],
        }
    }

    pub fn with_tracked_offset(mut self, offset: Vec3) -> Self {
        self.tracked_offset = offset;
        self
    }

    pub fn with_tracked_height(mut self, height: f32) -> Self {
        self.tracked_height = height;
        self
    }

    pub fn with_viewpoint(mut self, viewpoint: Viewpoint) -> Self {
        self.viewpoint = Some(viewpoint);
        self
    }

    pub fn with_velocity(mut self, velocity: Velocity) -> Self {
        self.velocity = Some(velocity);
        self
    }

    pub fn tracked_point(&self) -> Vec3 {
        self.body.translation + self.body.rotation * self.tracked_offset
    }

    /// Full rotation of the viewpoint if there is one, of the body otherwise.
    pub fn view_rotation(&self) -> Quat {
        match self.viewpoint {
            Some(viewpoint) => self.body.rotation * viewpoint.rotation(),
            None => self.body.rotation,
        }
    }

    pub fn is_entered(&self, portal: PortalId) -> bool {
        self.entered[portal.index()]
    }

    pub fn ignored_colliders(&self, portal: PortalId) -> Option<&HashSet<Entity>> {
        self.ignored[portal.index()].as_ref()
    }
}

/// A teleport re-check run one tick after an object left an entry volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredCheck {
    pub object: Entity,
    pub portal: PortalId,
}

/// Whether `this` surface is the one to teleport through for a tracked point: it is, unless
/// `other` is strictly closer both in straight line and in distance to its plane.
pub fn nearer_surface(point: Vec3, this: &PortalSurface, other: &PortalSurface) -> bool {
    let this_distance = point.distance(this.pose().translation);
    let other_distance = point.distance(other.pose().translation);
    let this_plane = this.local_point(point).z.abs();
    let other_plane = other.local_point(point).z.abs();
    !(other_distance < this_distance && other_plane < this_plane)
}

#[derive(Debug, Default)]
pub struct CrossingTracker {
    objects: HashMap<Entity, TrackedObject>,
    /// Collider to owning object.
    colliders: HashMap<Entity, Entity>,
    deferred: Vec<DeferredCheck>,
    /// Objects teleported during the current tick. Physics queries still see them at their old
    /// position, so they are not evicted by the membership poll.
    teleported: HashSet<Entity>,
}

impl CrossingTracker {
    /// Start tracking an object. Returns false if it was already tracked.
    pub fn register(&mut self, entity: Entity, object: TrackedObject) -> bool {
        if self.objects.contains_key(&entity) {
            return false;
        }
        self.colliders.insert(object.collider, entity);
        self.objects.insert(entity, object);
        true
    }

    /// Stop tracking an object, exiting every portal and clearing every collision exclusion.
    pub fn unregister(
        &mut self,
        entity: Entity,
        surfaces: &mut [PortalSurface; 2],
        physics: &mut dyn PortalPhysics,
    ) -> Option<TrackedObject> {
        for portal in PortalId::BOTH {
            self.exit_portal(entity, portal, surfaces, physics);
        }
        let mut object = self.objects.remove(&entity)?;
        self.colliders.remove(&object.collider);
        for ignored in object.ignored.iter_mut() {
            for collider in ignored.take().unwrap_or_default() {
                physics.set_collision_ignored(object.collider, collider, false);
            }
        }
        Some(object)
    }

    pub fn get(&self, entity: Entity) -> Option<&TrackedObject> {
        self.objects.get(&entity)
    }

    pub fn get_mut(&mut self, entity: Entity) -> Option<&mut TrackedObject> {
        self.objects.get_mut(&entity)
    }

    pub fn contains(&self, entity: Entity) -> bool {
        self.objects.contains_key(&entity)
    }

    pub fn objects(&self) -> impl Iterator<Item = (Entity, &TrackedObject)> {
        self.objects.iter().map(|(entity, object)| (*entity, object))
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Record that an object entered a surface and ignore everything blocking it. Idempotent,
    /// returns true if the object was not entered before.
    pub fn enter_portal(
        &mut self,
        entity: Entity,
        portal: PortalId,
        surfaces: &mut [PortalSurface; 2],
        physics: &mut dyn PortalPhysics,
    ) -> bool {
        let object = match self.objects.get_mut(&entity) {
            Some(object) => object,
            None => return false,
        };
        let index = portal.index();
        if object.entered[index] {
            return false;
        }

        let blocking = surfaces[index].blocking_colliders().clone();
        for collider in &blocking {
            physics.set_collision_ignored(object.collider, *collider, true);
        }
        object.ignored[index] = Some(blocking);
        object.ignored[portal.other().index()].get_or_insert_with(HashSet::default);
        object.entered[index] = true;
        surfaces[index].entered_objects_mut().insert(entity);
        debug!("{:?} entered portal {:?}", entity, portal);
        true
    }

    /// Record that an object left a surface, restoring collisions it no longer needs to ignore.
    /// Idempotent, returns true if the object was entered before.
    pub fn exit_portal(
        &mut self,
        entity: Entity,
        portal: PortalId,
        surfaces: &mut [PortalSurface; 2],
        physics: &mut dyn PortalPhysics,
    ) -> bool {
        let object = match self.objects.get_mut(&entity) {
            Some(object) => object,
            None => return false,
        };
        let index = portal.index();
        if !object.entered[index] {
            return false;
        }

        object.entered[index] = false;
        surfaces[index].entered_objects_mut().remove(&entity);
        let released = object.ignored[index]
            .replace(HashSet::default())
            .unwrap_or_default();
        // Both surfaces may sit on the same wall.
        let still_ignored = object.ignored[portal.other().index()].as_ref();
        for collider in released {
            if !still_ignored.map_or(false, |ignored| ignored.contains(&collider)) {
                physics.set_collision_ignored(object.collider, collider, false);
            }
        }
        debug!("{:?} exited portal {:?}", entity, portal);
        true
    }

    /// Exit every object entered in a surface.
    pub fn exit_all(
        &mut self,
        portal: PortalId,
        surfaces: &mut [PortalSurface; 2],
        physics: &mut dyn PortalPhysics,
    ) {
        let entered: Vec<Entity> = surfaces[portal.index()]
            .entered_objects()
            .iter()
            .copied()
            .collect();
        for entity in entered {
            self.exit_portal(entity, portal, surfaces, physics);
        }
    }

    /// Bring an entered object's exclusions in line with the surface's current blocking set.
    pub fn reconcile(
        &mut self,
        entity: Entity,
        portal: PortalId,
        surfaces: &[PortalSurface; 2],
        physics: &mut dyn PortalPhysics,
    ) {
        let object = match self.objects.get_mut(&entity) {
            Some(object) => object,
            None => return,
        };
        let index = portal.index();
        if !object.entered[index] {
            return;
        }

        let blocking = surfaces[index].blocking_colliders();
        let previous = object.ignored[index].take().unwrap_or_default();
        for collider in blocking.difference(&previous) {
            physics.set_collision_ignored(object.collider, *collider, true);
        }
        {
            let still_ignored = object.ignored[portal.other().index()].as_ref();
            for collider in previous.difference(blocking) {
                if !still_ignored.map_or(false, |ignored| ignored.contains(collider)) {
                    physics.set_collision_ignored(object.collider, *collider, false);
                }
            }
        }
        object.ignored[index] = Some(blocking.clone());
    }

    /// Query a surface's entry volume and update membership. Objects which left are scheduled for
    /// a teleport re-check on the next tick, in case they went straight through the plane.
    pub fn poll_membership(
        &mut self,
        portal: PortalId,
        surfaces: &mut [PortalSurface; 2],
        groups: Group,
        physics: &mut dyn PortalPhysics,
    ) {
        let index = portal.index();
        let exclude: Vec<Entity> = surfaces[index].volume().into_iter().collect();
        let inside: HashSet<Entity> = physics
            .overlap_box(&surfaces[index].query_boxes().entry, groups, &exclude)
            .into_iter()
            .filter_map(|collider| self.colliders.get(&collider).copied())
            .collect();
        let entered: Vec<Entity> = surfaces[index].entered_objects().iter().copied().collect();

        for entity in inside.iter().copied() {
            if !entered.contains(&entity) {
                self.enter_portal(entity, portal, surfaces, physics);
            }
        }
        for entity in entered {
            if inside.contains(&entity) || self.teleported.contains(&entity) {
                continue;
            }
            if self.exit_portal(entity, portal, surfaces, physics) {
                self.deferred.push(DeferredCheck {
                    object: entity,
                    portal,
                });
            }
        }
    }

    pub fn begin_tick(&mut self) {
        self.teleported.clear();
    }

    pub fn mark_teleported(&mut self, entity: Entity) {
        self.teleported.insert(entity);
    }

    pub fn schedule_check(&mut self, object: Entity, portal: PortalId) {
        self.deferred.push(DeferredCheck { object, portal });
    }

    /// Drain the re-checks scheduled on the previous tick, dropping those whose object is gone.
    pub fn take_deferred(&mut self) -> Vec<DeferredCheck> {
        let objects = &self.objects;
        self.deferred
            .drain(..)
            .filter(|check| {
                let known = objects.contains_key(&check.object);
                if !known {
                    debug!("Dropping deferred check of removed object {:?}", check.object);
                }
                known
            })
            .collect()
    }

    pub fn pending_checks(&self) -> &[DeferredCheck] {
        &self.deferred
    }

    /// Whether an object's tracked point is at or behind a surface's plane, and that surface is
    /// the nearer of the two.
    pub fn has_crossed(
        &self,
        entity: Entity,
        portal: PortalId,
        surfaces: &[PortalSurface; 2],
    ) -> bool {
        let object = match self.objects.get(&entity) {
            Some(object) => object,
            None => return false,
        };
        let this = &surfaces[portal.index()];
        let other = &surfaces[portal.other().index()];
        let point = object.tracked_point();
        this.local_point(point).z <= 0. && nearer_surface(point, this, other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{
        physics::{test_world::TestWorld, *},
        portal::config::{LayerConfig, SurfaceConfig},
    };

    struct Fixture {
        world: TestWorld,
        surfaces: [PortalSurface; 2],
        tracker: CrossingTracker,
        wall: Entity,
        pillar: Entity,
        object: Entity,
        collider: Entity,
    }

    /// Both surfaces on one wall; a pillar embedded in the wall only blocks surface A.
    fn fixture() -> Fixture {
        let mut world = TestWorld::new();
        let wall = world.add_box(
            Vec3::new(0., 2., -0.5),
            Vec3::new(5., 2., 0.5),
            WALLS_GROUP,
            Some("portalable"),
        );
        let pillar = world.add_box(
            Vec3::new(-1.5, 2., -0.5),
            Vec3::splat(0.2),
            WALLS_GROUP,
            None,
        );
        let collider = world.add_box(Vec3::new(0., 2., 3.), Vec3::splat(0.25), PROPS_GROUP, None);
        let object = world.spawn_entity();

        let mut surfaces = [
            PortalSurface::new(PortalId::A, SurfaceConfig::default(), LayerConfig::default()),
            PortalSurface::new(PortalId::B, SurfaceConfig::default(), LayerConfig::default()),
        ];
        surfaces[0].set_pose(Transform::from_xyz(-1.5, 2., 0.001));
        surfaces[1].set_pose(Transform::from_xyz(1.5, 2., 0.001));
        for surface in surfaces.iter_mut() {
            surface.activate(Some(wall));
            surface.update_blocking_colliders(&world);
        }

        let mut tracker = CrossingTracker::default();
        tracker.register(
            object,
            TrackedObject::new(collider, Transform::from_xyz(0., 2., 3.), BodyKind::Rigid),
        );
        Fixture {
            world,
            surfaces,
            tracker,
            wall,
            pillar,
            object,
            collider,
        }
    }

    #[test]
    fn enter_ignores_blocking_and_prepares_other_set() {
        let mut f = fixture();
        assert!(f.surfaces[0].blocking_colliders().contains(&f.pillar));
        assert!(!f.surfaces[1].blocking_colliders().contains(&f.pillar));

        assert!(f
            .tracker
            .enter_portal(f.object, PortalId::A, &mut f.surfaces, &mut f.world));
        assert!(!f
            .tracker
            .enter_portal(f.object, PortalId::A, &mut f.surfaces, &mut f.world));

        assert!(f.world.is_ignored(f.collider, f.wall));
        assert!(f.world.is_ignored(f.collider, f.pillar));
        assert!(f.surfaces[0].entered_objects().contains(&f.object));
        let object = f.tracker.get(f.object).unwrap();
        assert_eq!(object.ignored_colliders(PortalId::A).unwrap().len(), 2);
        assert!(object.ignored_colliders(PortalId::B).unwrap().is_empty());
    }

    #[test]
    fn exit_keeps_colliders_still_ignored_through_other_portal() {
        let mut f = fixture();
        f.tracker
            .enter_portal(f.object, PortalId::A, &mut f.surfaces, &mut f.world);
        f.tracker
            .enter_portal(f.object, PortalId::B, &mut f.surfaces, &mut f.world);
        f.tracker
            .exit_portal(f.object, PortalId::A, &mut f.surfaces, &mut f.world);

        assert!(f.world.is_ignored(f.collider, f.wall));
        assert!(!f.world.is_ignored(f.collider, f.pillar));
        assert!(f
            .tracker
            .get(f.object)
            .unwrap()
            .ignored_colliders(PortalId::A)
            .unwrap()
            .is_empty());

        f.tracker
            .exit_portal(f.object, PortalId::B, &mut f.surfaces, &mut f.world);
        assert!(f.world.ignored.is_empty());
    }

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Enter(PortalId),
        Exit(PortalId),
    }

    #[test]
    fn exclusions_follow_membership_for_every_sequence() {
        const STEPS: [Step; 4] = [
            Step::Enter(PortalId::A),
            Step::Exit(PortalId::A),
            Step::Enter(PortalId::B),
            Step::Exit(PortalId::B),
        ];
        const LENGTH: u32 = 6;

        for mut code in 0..STEPS.len().pow(LENGTH) {
            let mut f = fixture();
            for _ in 0..LENGTH {
                let step = STEPS[code % STEPS.len()];
                code /= STEPS.len();
                match step {
                    Step::Enter(portal) => {
                        f.tracker
                            .enter_portal(f.object, portal, &mut f.surfaces, &mut f.world);
                    }
                    Step::Exit(portal) => {
                        f.tracker
                            .exit_portal(f.object, portal, &mut f.surfaces, &mut f.world);
                    }
                }

                let object = f.tracker.get(f.object).unwrap();
                let (in_a, in_b) = (object.is_entered(PortalId::A), object.is_entered(PortalId::B));
                assert_eq!(f.world.is_ignored(f.collider, f.wall), in_a || in_b);
                assert_eq!(f.world.is_ignored(f.collider, f.pillar), in_a);
                assert_eq!(f.surfaces[0].entered_objects().contains(&f.object), in_a);
                assert_eq!(f.surfaces[1].entered_objects().contains(&f.object), in_b);
            }
        }
    }

    #[test]
    fn reconcile_tracks_blocking_changes() {
        let mut f = fixture();
        f.tracker
            .enter_portal(f.object, PortalId::A, &mut f.surfaces, &mut f.world);

        // A crate slides in behind portal A.
        let crate_behind = f.world.add_box(
            Vec3::new(-1.5, 2., -2.),
            Vec3::splat(0.5),
            WALLS_GROUP,
            None,
        );
        f.world.move_collider(crate_behind, Vec3::new(-1.5, 2., -0.6));
        f.surfaces[0].update_blocking_colliders(&f.world);
        f.tracker
            .reconcile(f.object, PortalId::A, &f.surfaces, &mut f.world);
        assert!(f.world.is_ignored(f.collider, crate_behind));

        f.world.remove_collider(crate_behind);
        f.world.remove_collider(f.pillar);
        f.surfaces[0].update_blocking_colliders(&f.world);
        f.tracker
            .reconcile(f.object, PortalId::A, &f.surfaces, &mut f.world);
        assert!(!f.world.is_ignored(f.collider, crate_behind));
        assert!(!f.world.is_ignored(f.collider, f.pillar));
        assert!(f.world.is_ignored(f.collider, f.wall));
        let ignored = f
            .tracker
            .get(f.object)
            .unwrap()
            .ignored_colliders(PortalId::A)
            .unwrap();
        assert!(ignored.is_subset(f.surfaces[0].blocking_colliders()));
    }

    #[test]
    fn reconcile_keeps_collider_ignored_through_other_portal() {
        let mut f = fixture();
        f.tracker
            .enter_portal(f.object, PortalId::A, &mut f.surfaces, &mut f.world);
        f.tracker
            .enter_portal(f.object, PortalId::B, &mut f.surfaces, &mut f.world);

        // The wall somehow stops blocking A, but B still needs it ignored.
        f.surfaces[0].activate(None);
        f.world.remove_collider(f.wall);
        f.surfaces[0].update_blocking_colliders(&f.world);
        f.tracker
            .reconcile(f.object, PortalId::A, &f.surfaces, &mut f.world);
        assert!(f.world.is_ignored(f.collider, f.wall));
    }

    #[test]
    fn unregister_clears_every_exclusion() {
        let mut f = fixture();
        f.tracker
            .enter_portal(f.object, PortalId::A, &mut f.surfaces, &mut f.world);
        f.tracker
            .enter_portal(f.object, PortalId::B, &mut f.surfaces, &mut f.world);
        assert!(f
            .tracker
            .unregister(f.object, &mut f.surfaces, &mut f.world)
            .is_some());
        assert!(f.world.ignored.is_empty());
        assert!(f.surfaces[0].entered_objects().is_empty());
        assert!(f.surfaces[1].entered_objects().is_empty());
        assert!(f.tracker.is_empty());
    }

    #[test]
    fn membership_poll_enters_and_schedules_exit_checks() {
        let mut f = fixture();
        let groups = LayerConfig::default().tracked();

        f.world.move_collider(f.collider, Vec3::new(-1.5, 2., 0.3));
        f.tracker
            .poll_membership(PortalId::A, &mut f.surfaces, groups, &mut f.world);
        assert!(f.tracker.get(f.object).unwrap().is_entered(PortalId::A));
        assert!(f.tracker.pending_checks().is_empty());

        f.world.move_collider(f.collider, Vec3::new(-1.5, 2., 3.));
        f.tracker
            .poll_membership(PortalId::A, &mut f.surfaces, groups, &mut f.world);
        assert!(!f.tracker.get(f.object).unwrap().is_entered(PortalId::A));
        assert_eq!(
            f.tracker.pending_checks(),
            &[DeferredCheck {
                object: f.object,
                portal: PortalId::A
            }]
        );
        assert_eq!(f.tracker.take_deferred().len(), 1);
        assert!(f.tracker.pending_checks().is_empty());
    }

    #[test]
    fn deferred_checks_of_removed_objects_are_dropped() {
        let mut f = fixture();
        f.tracker.schedule_check(f.object, PortalId::A);
        f.tracker
            .unregister(f.object, &mut f.surfaces, &mut f.world);
        assert!(f.tracker.take_deferred().is_empty());
    }

    #[test]
    fn querying_surface_wins_ties() {
        let config = SurfaceConfig::default();
        let layers = LayerConfig::default();
        let mut a = PortalSurface::new(PortalId::A, config.clone(), layers.clone());
        let mut b = PortalSurface::new(PortalId::B, config, layers);

        // Same straight-line distance, different plane distance.
        a.set_pose(Transform::from_xyz(0., 0., 0.));
        b.set_pose(Transform::from_xyz(0.6, 0., 1.8));
        let point = Vec3::new(0., 0., 1.);
        assert!(
            (point.distance(a.pose().translation) - point.distance(b.pose().translation)).abs()
                < 1e-6
        );
        assert!(nearer_surface(point, &a, &b));
        assert!(nearer_surface(point, &b, &a));

        // B strictly better on both counts.
        b.set_pose(Transform::from_xyz(0., 0., 0.9));
        assert!(!nearer_surface(point, &a, &b));
        assert!(nearer_surface(point, &b, &a));

        // B closer in a straight line only.
        let point = Vec3::new(2., 0., 0.1);
        b.set_pose(Transform::from_xyz(2., 0., 1.));
        assert!(point.distance(b.pose().translation) < point.distance(a.pose().translation));
        assert!(nearer_surface(point, &a, &b));
    }

    #[test]
    fn crossing_requires_tracked_point_behind_plane() {
        let mut f = fixture();
        let object = f.tracker.get_mut(f.object).unwrap();
        object.body.translation = Vec3::new(-1.5, 1., 0.1);
        object.tracked_offset = Vec3::new(0., 1., -0.2);
        assert!(f.tracker.has_crossed(f.object, PortalId::A, &f.surfaces));

        f.tracker.get_mut(f.object).unwrap().tracked_offset = Vec3::new(0., 1., 0.);
        assert!(!f.tracker.has_crossed(f.object, PortalId::A, &f.surfaces));
    }
}
