//! A small oriented-box world standing in for rapier in unit tests.

use bevy::prelude::*;
use bevy_rapier3d::prelude::Group;

use super::{IgnoredCollisionPairs, PortalPhysics, QueryBox, RayHit};

#[derive(Debug, Clone)]
pub struct TestCollider {
    pub entity: Entity,
    pub shape: QueryBox,
    pub groups: Group,
    pub material: Option<String>,
}

#[derive(Debug, Default)]
pub struct TestWorld {
    colliders: Vec<TestCollider>,
    pub ignored: IgnoredCollisionPairs,
    next_id: u32,
}

impl TestWorld {
    pub fn new() -> Self {
        TestWorld {
            next_id: 1000,
            ..Default::default()
        }
    }

    pub fn spawn_entity(&mut self) -> Entity {
        self.next_id += 1;
        Entity::from_raw(self.next_id)
    }

    pub fn add_box(
        &mut self,
        center: Vec3,
        half_extents: Vec3,
        groups: Group,
        material: Option<&str>,
    ) -> Entity {
        self.add_oriented_box(center, Quat::IDENTITY, half_extents, groups, material)
    }

    pub fn add_oriented_box(
        &mut self,
        center: Vec3,
        rotation: Quat,
        half_extents: Vec3,
        groups: Group,
        material: Option<&str>,
    ) -> Entity {
        let entity = self.spawn_entity();
        self.colliders.push(TestCollider {
            entity,
            shape: QueryBox {
                center,
                rotation,
                half_extents,
            },
            groups,
            material: material.map(str::to_string),
        });
        entity
    }

    pub fn move_collider(&mut self, entity: Entity, center: Vec3) {
        if let Some(collider) = self.colliders.iter_mut().find(|c| c.entity == entity) {
            collider.shape.center = center;
        }
    }

    pub fn remove_collider(&mut self, entity: Entity) {
        self.colliders.retain(|c| c.entity != entity);
    }

    pub fn is_ignored(&self, a: Entity, b: Entity) -> bool {
        self.ignored.contains(a, b)
    }
}

fn axes(rotation: Quat) -> [Vec3; 3] {
    [rotation * Vec3::X, rotation * Vec3::Y, rotation * Vec3::Z]
}

/// Separating axis test between two oriented boxes. Touching boxes don't overlap.
pub fn boxes_overlap(a: &QueryBox, b: &QueryBox) -> bool {
    let a_axes = axes(a.rotation);
    let b_axes = axes(b.rotation);
    let offset = b.center - a.center;

    let mut candidates: Vec<Vec3> = Vec::with_capacity(15);
    candidates.extend_from_slice(&a_axes);
    candidates.extend_from_slice(&b_axes);
    for a_axis in a_axes {
        for b_axis in b_axes {
            let cross = a_axis.cross(b_axis);
            if cross.length_squared() > 1e-8 {
                candidates.push(cross.normalize());
            }
        }
    }

    let radius = |axes: &[Vec3; 3], half: Vec3, axis: Vec3| {
        half.x * axes[0].dot(axis).abs()
            + half.y * axes[1].dot(axis).abs()
            + half.z * axes[2].dot(axis).abs()
    };

    candidates.into_iter().all(|axis| {
        offset.dot(axis).abs()
            < radius(&a_axes, a.half_extents, axis) + radius(&b_axes, b.half_extents, axis)
    })
}

/// Slab test of a ray against an oriented box. Returns the distance and world normal.
pub fn ray_box(origin: Vec3, direction: Vec3, shape: &QueryBox) -> Option<(f32, Vec3)> {
    let inverse = shape.rotation.inverse();
    let local_origin = inverse * (origin - shape.center);
    let local_dir = inverse * direction;
    let half = shape.half_extents;

    let mut t_enter = f32::NEG_INFINITY;
    let mut t_exit = f32::INFINITY;
    let mut enter_normal = -direction;
    for axis in 0..3 {
        let (o, d, h) = (local_origin[axis], local_dir[axis], half[axis]);
        if d.abs() < 1e-9 {
            if o.abs() > h {
                return None;
            }
            continue;
        }
        let t1 = (-h - o) / d;
        let t2 = (h - o) / d;
        let (near, far) = if t1 < t2 { (t1, t2) } else { (t2, t1) };
        if near > t_enter {
            t_enter = near;
            let mut normal = Vec3::ZERO;
            normal[axis] = -d.signum();
            enter_normal = shape.rotation * normal;
        }
        t_exit = t_exit.min(far);
    }
    if t_enter > t_exit || t_exit < 0.0 {
        return None;
    }
    if t_enter < 0.0 {
        // Solid cast from inside the box.
        return Some((0.0, -direction));
    }
    Some((t_enter, enter_normal))
}

impl PortalPhysics for TestWorld {
    fn cast_ray(
        &self,
        origin: Vec3,
        direction: Vec3,
        max_distance: f32,
        groups: Group,
    ) -> Option<RayHit> {
        let direction = direction.normalize();
        self.colliders
            .iter()
            .filter(|c| c.groups.intersects(groups))
            .filter_map(|c| {
                let (distance, normal) = ray_box(origin, direction, &c.shape)?;
                (distance <= max_distance).then_some(RayHit {
                    collider: c.entity,
                    point: origin + direction * distance,
                    normal,
                    distance,
                })
            })
            .min_by(|a, b| a.distance.total_cmp(&b.distance))
    }

    fn overlap_box(&self, query: &QueryBox, groups: Group, exclude: &[Entity]) -> Vec<Entity> {
        self.colliders
            .iter()
            .filter(|c| c.groups.intersects(groups) && !exclude.contains(&c.entity))
            .filter(|c| boxes_overlap(query, &c.shape))
            .map(|c| c.entity)
            .collect()
    }

    fn surface_material(&self, collider: Entity) -> Option<&str> {
        self.colliders
            .iter()
            .find(|c| c.entity == collider)
            .and_then(|c| c.material.as_deref())
    }

    fn set_collision_ignored(&mut self, a: Entity, b: Entity, ignored: bool) {
        self.ignored.set(a, b, ignored);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotated_boxes_overlap_only_when_close() {
        let a = QueryBox {
            center: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            half_extents: Vec3::ONE,
        };
        let mut b = QueryBox {
            center: Vec3::new(2.3, 0., 0.),
            rotation: Quat::from_rotation_z(std::f32::consts::FRAC_PI_4),
            half_extents: Vec3::ONE,
        };
        // The rotated box reaches sqrt(2) along x.
        assert!(boxes_overlap(&a, &b));
        b.center.x = 2.5;
        assert!(!boxes_overlap(&a, &b));
    }

    #[test]
    fn ray_reports_entry_face_normal() {
        let shape = QueryBox {
            center: Vec3::new(0., 0., -1.),
            rotation: Quat::IDENTITY,
            half_extents: Vec3::splat(0.5),
        };
        let (distance, normal) = ray_box(Vec3::ZERO, Vec3::NEG_Z, &shape).unwrap();
        assert!((distance - 0.5).abs() < 1e-6);
        assert!(normal.abs_diff_eq(Vec3::Z, 1e-6));
        assert!(ray_box(Vec3::new(2., 0., 0.), Vec3::NEG_Z, &shape).is_none());
    }
}
