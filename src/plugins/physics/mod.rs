use bevy::{ecs::system::SystemParam, prelude::*, utils::HashSet};
use bevy_rapier3d::prelude::*;

use crate::plugins::portal::Teleportable;

#[cfg(test)]
pub(crate) mod test_world;

pub const WALLS_GROUP: Group = Group::GROUP_1;
pub const PROPS_GROUP: Group = Group::GROUP_2;
pub const PORTAL_GROUP: Group = Group::GROUP_3;
pub const PLAYER_GROUP: Group = Group::GROUP_4;
pub const RAYCAST_GROUP: Group = Group::GROUP_5;
pub const GROUND_GROUP: Group = Group::GROUP_6;
pub const ALL_GROUPS: Group = Group::ALL;

/// What may be hit when firing or placing a portal.
pub const PLACEMENT_GROUPS: Group = WALLS_GROUP.union(GROUND_GROUP);
/// Bodies which can travel through portals.
pub const TRACKED_GROUPS: Group = PLAYER_GROUP.union(PROPS_GROUP);

pub struct PhysicsPlugin;

impl Plugin for PhysicsPlugin {
    fn build(&self, app: &mut App) {
        app.register_type::<SurfaceMaterial>()
            .init_resource::<IgnoredCollisionPairs>()
            .add_plugin(RapierPhysicsPlugin::<PortalCollisionFilter>::default())
            .add_startup_system(configure_rapier);
    }
}

fn configure_rapier(mut config: ResMut<RapierConfiguration>) {
    // Extra CCD substeps because them portals can go fast
    config.timestep_mode = TimestepMode::Variable {
        max_dt: 1. / 20.,
        time_scale: 1.,
        substeps: 4,
    }
}

/// Name of the physical material of a collider. Portals only mount on materials carrying the
/// configured portal-receptive prefix.
#[derive(Debug, Clone, Default, Component, Reflect, FromReflect)]
#[reflect(Component)]
pub struct SurfaceMaterial(pub String);

/// A ray cast result, in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    pub collider: Entity,
    pub point: Vec3,
    pub normal: Vec3,
    pub distance: f32,
}

/// An oriented box used for overlap queries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryBox {
    pub center: Vec3,
    pub rotation: Quat,
    pub half_extents: Vec3,
}

impl QueryBox {
    /// Build a box expressed in the local frame of `frame`.
    pub fn in_frame(frame: &Transform, local_center: Vec3, half_extents: Vec3) -> Self {
        QueryBox {
            center: frame.translation + frame.rotation * local_center,
            rotation: frame.rotation,
            half_extents,
        }
    }

    pub fn corners(&self) -> [Vec3; 8] {
        let h = self.half_extents;
        let mut corners = [Vec3::ZERO; 8];
        for (i, corner) in corners.iter_mut().enumerate() {
            let local = Vec3::new(
                if i & 1 == 0 { -h.x } else { h.x },
                if i & 2 == 0 { -h.y } else { h.y },
                if i & 4 == 0 { -h.z } else { h.z },
            );
            *corner = self.center + self.rotation * local;
        }
        corners
    }
}

/// The spatial queries and collision controls the portal core needs from the physics engine.
pub trait PortalPhysics {
    /// Cast a solid ray and return the closest hit among colliders in `groups`.
    fn cast_ray(&self, origin: Vec3, direction: Vec3, max_distance: f32, groups: Group)
        -> Option<RayHit>;

    /// All colliders in `groups` intersecting `query`, minus `exclude`.
    fn overlap_box(&self, query: &QueryBox, groups: Group, exclude: &[Entity]) -> Vec<Entity>;

    fn surface_material(&self, collider: Entity) -> Option<&str>;

    /// Enable or disable contacts between two colliders. Idempotent.
    fn set_collision_ignored(&mut self, a: Entity, b: Entity, ignored: bool);
}

/// Collider pairs whose contacts are discarded by [`PortalCollisionFilter`].
#[derive(Debug, Default, Resource)]
pub struct IgnoredCollisionPairs {
    pairs: HashSet<(Entity, Entity)>,
}

impl IgnoredCollisionPairs {
    fn key(a: Entity, b: Entity) -> (Entity, Entity) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    pub fn set(&mut self, a: Entity, b: Entity, ignored: bool) {
        if ignored {
            self.pairs.insert(Self::key(a, b));
        } else {
            self.pairs.remove(&Self::key(a, b));
        }
    }

    pub fn contains(&self, a: Entity, b: Entity) -> bool {
        self.pairs.contains(&Self::key(a, b))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Contact filter dropping the pairs listed in [`IgnoredCollisionPairs`]. Tracked colliders need
/// `ActiveHooks::FILTER_CONTACT_PAIRS` for rapier to consult it.
#[derive(SystemParam)]
pub struct PortalCollisionFilter<'w, 's> {
    ignored: Res<'w, IgnoredCollisionPairs>,
    tracked: Query<'w, 's, (), With<Teleportable>>,
}

impl BevyPhysicsHooks for PortalCollisionFilter<'_, '_> {
    fn filter_contact_pair(&self, context: PairFilterContextView) -> Option<SolverFlags> {
        let (a, b) = (context.collider1(), context.collider2());
        if (self.tracked.contains(a) || self.tracked.contains(b)) && self.ignored.contains(a, b) {
            None
        } else {
            Some(SolverFlags::COMPUTE_IMPULSES)
        }
    }
}

/// [`PortalPhysics`] backed by the rapier context of the running app.
pub struct RapierPortalPhysics<'a, 'w, 's, 'm> {
    rapier: &'a RapierContext,
    ignored: &'a mut IgnoredCollisionPairs,
    materials: &'a Query<'w, 's, &'m SurfaceMaterial>,
}

impl<'a, 'w, 's, 'm> RapierPortalPhysics<'a, 'w, 's, 'm> {
    pub fn new(
        rapier: &'a RapierContext,
        ignored: &'a mut IgnoredCollisionPairs,
        materials: &'a Query<'w, 's, &'m SurfaceMaterial>,
    ) -> Self {
        RapierPortalPhysics {
            rapier,
            ignored,
            materials,
        }
    }
}

impl PortalPhysics for RapierPortalPhysics<'_, '_, '_, '_> {
    fn cast_ray(
        &self,
        origin: Vec3,
        direction: Vec3,
        max_distance: f32,
        groups: Group,
    ) -> Option<RayHit> {
        let (collider, intersection) = self.rapier.cast_ray_and_get_normal(
            origin,
            direction,
            max_distance,
            true,
            QueryFilter::new().groups(CollisionGroups::new(RAYCAST_GROUP, groups)),
        )?;
        Some(RayHit {
            collider,
            point: intersection.point,
            normal: intersection.normal,
            distance: intersection.toi,
        })
    }

    fn overlap_box(&self, query: &QueryBox, groups: Group, exclude: &[Entity]) -> Vec<Entity> {
        let shape = Collider::cuboid(
            query.half_extents.x,
            query.half_extents.y,
            query.half_extents.z,
        );
        let predicate = |entity: Entity| !exclude.contains(&entity);
        let mut hits = Vec::new();
        self.rapier.intersections_with_shape(
            query.center,
            query.rotation,
            &shape,
            QueryFilter::new()
                .groups(CollisionGroups::new(RAYCAST_GROUP, groups))
                .predicate(&predicate),
            |entity| {
                hits.push(entity);
                true
            },
        );
        hits
    }

    fn surface_material(&self, collider: Entity) -> Option<&str> {
        self.materials
            .get(collider)
            .ok()
            .map(|material| material.0.as_str())
    }

    fn set_collision_ignored(&mut self, a: Entity, b: Entity, ignored: bool) {
        self.ignored.set(a, b, ignored);
    }
}
