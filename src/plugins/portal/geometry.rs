use std::f32::consts::PI;

use bevy::prelude::*;
use bevy_rapier3d::prelude::Group;

use crate::plugins::physics::PortalPhysics;

/// Offset of a new portal off its wall, prevents Z fighting with the wall mesh.
pub const Z_FIGHTING_OFFSET: f32 = 0.001;

/// Rotate a portal-local vector half a turn about the local up axis. Exact, unlike the matching
/// quaternion product.
pub fn flip(local: Vec3) -> Vec3 {
    Vec3::new(-local.x, local.y, -local.z)
}

pub fn to_local(portal: &Transform, point: Vec3) -> Vec3 {
    portal.rotation.inverse() * (point - portal.translation)
}

pub fn to_world(portal: &Transform, local: Vec3) -> Vec3 {
    portal.translation + portal.rotation * local
}

/// Map a point in front of (or behind) `from` to the matching point relative to `to`.
pub fn map_point(from: &Transform, to: &Transform, point: Vec3) -> Vec3 {
    to_world(to, flip(to_local(from, point)))
}

/// Map a direction or velocity through the portal pair.
pub fn map_vector(from: &Transform, to: &Transform, vector: Vec3) -> Vec3 {
    to.rotation * flip(from.rotation.inverse() * vector)
}

/// The rigid transformation taking the space around `from` to the space around `to`: express in
/// `from`'s frame, turn half a turn about up, re-express in `to`'s frame.
pub fn portal_to_portal(from: &Transform, to: &Transform) -> Transform {
    let rotation = (to.rotation * Quat::from_rotation_y(PI) * from.rotation.inverse()).normalize();
    Transform {
        translation: to.translation - rotation * from.translation,
        rotation,
        scale: Vec3::ONE,
    }
}

/// Apply a portal mapping to a full pose.
pub fn map_pose(from: &Transform, to: &Transform, pose: &Transform) -> Transform {
    Transform {
        translation: map_point(from, to, pose.translation),
        rotation: (portal_to_portal(from, to).rotation * pose.rotation).normalize(),
        scale: pose.scale,
    }
}

/// Homogeneous plane of the portal surface, positive on its outward side.
pub fn portal_plane(portal: &Transform) -> Vec4 {
    let normal = portal.back();
    Vec4::from((normal, -normal.dot(portal.translation)))
}

/// Compute a portal pose from a ray impact. The outward normal (local +Z) follows the impact
/// normal. Wall portals stay upright, floor and ceiling portals point their up axis along the
/// shooter's horizontal facing.
pub fn location_from_impact(point: Vec3, normal: Vec3, shooter_forward: Vec3) -> Transform {
    let normal = normal.normalize();
    let up_hint = if normal.dot(Vec3::Y).abs() > 0.99 {
        let horizontal = Vec3::new(shooter_forward.x, 0., shooter_forward.z);
        if horizontal.length_squared() > 1e-6 {
            // Looking down at a floor portal, its top edge is away from the shooter.
            horizontal.normalize() * normal.y.signum()
        } else {
            Vec3::NEG_Z
        }
    } else {
        Vec3::Y
    };
    let right = up_hint.cross(normal).normalize();
    let up = normal.cross(right);
    Transform {
        // We place the portal at the ray intersection point, plus a small offset
        // along the surface normal to prevent Z fighting.
        translation: point + normal * Z_FIGHTING_OFFSET,
        rotation: Quat::from_mat3(&Mat3::from_cols(right, up, normal)),
        scale: Vec3::ONE,
    }
}

/// Push a tentative portal center away from obstacles which would cut the opening, such as the
/// floor under a wall portal placed too low. Rays start just off the wall and run along the
/// surface's up/down and left/right axes for one half extent.
pub fn adjust_portal_origin_to_obstacles(
    pose: &Transform,
    half_extents: Vec2,
    clearance: f32,
    groups: Group,
    physics: &dyn PortalPhysics,
) -> Vec3 {
    let normal = pose.back();
    let up = pose.up();
    let right = pose.right();
    let mut corrected_position = pose.translation;

    let mut push_along = |axis: Vec3, reach: f32| {
        let origin = corrected_position + normal * clearance;
        if let Some(hit) = physics.cast_ray(origin, -axis, reach, groups) {
            corrected_position += axis * (reach - hit.distance);
            true
        } else {
            false
        }
    };

    if !push_along(up, half_extents.y) {
        push_along(-up, half_extents.y);
    }
    if !push_along(right, half_extents.x) {
        push_along(-right, half_extents.x);
    }
    corrected_position
}

#[cfg(test)]
mod tests {
    use std::f32::consts::FRAC_PI_2;

    use super::*;

    fn pose(translation: Vec3, rotation: Quat) -> Transform {
        Transform {
            translation,
            rotation,
            scale: Vec3::ONE,
        }
    }

    #[test]
    fn mapped_point_matches_matrix_product() {
        let from = pose(Vec3::new(1., 2., 3.), Quat::from_euler(EulerRot::YXZ, 0.4, 0.2, -0.1));
        let to = pose(Vec3::new(-4., 0.5, 7.), Quat::from_euler(EulerRot::YXZ, -1.3, 0.9, 0.3));
        let point = Vec3::new(1.2, 2.5, 2.7);

        let matrix = to.compute_matrix()
            * Mat4::from_rotation_y(PI)
            * from.compute_matrix().inverse();
        let expected = matrix.transform_point3(point);

        assert!(map_point(&from, &to, point).abs_diff_eq(expected, 1e-4));
        assert!(portal_to_portal(&from, &to)
            .mul_vec3(point)
            .abs_diff_eq(expected, 1e-4));
    }

    #[test]
    fn flip_negates_depth_and_lateral() {
        assert_eq!(flip(Vec3::new(1., 2., 3.)), Vec3::new(-1., 2., -3.));
    }

    #[test]
    fn wall_impact_gives_upright_portal() {
        let transform = location_from_impact(Vec3::new(0., 1., -5.), Vec3::Z, Vec3::NEG_Z);
        assert!(transform.back().abs_diff_eq(Vec3::Z, 1e-5));
        assert!(transform.up().abs_diff_eq(Vec3::Y, 1e-5));
        assert!((transform.translation.z - (-5. + Z_FIGHTING_OFFSET)).abs() < 1e-6);
    }

    #[test]
    fn floor_impact_faces_up_and_points_away_from_shooter() {
        let transform = location_from_impact(Vec3::ZERO, Vec3::Y, Vec3::new(1., -1., 0.));
        assert!(transform.back().abs_diff_eq(Vec3::Y, 1e-5));
        assert!(transform.up().abs_diff_eq(Vec3::X, 1e-5));
    }

    #[test]
    fn portal_plane_is_positive_in_front() {
        let portal = pose(Vec3::new(0., 0., 2.), Quat::from_rotation_y(FRAC_PI_2));
        let plane = portal_plane(&portal);
        let in_front = portal.translation + portal.back();
        assert!(plane.dot(in_front.extend(1.)) > 0.);
        assert!(plane.dot(portal.translation.extend(1.)).abs() < 1e-6);
    }
}
