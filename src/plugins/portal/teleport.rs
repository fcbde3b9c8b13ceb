use bevy::prelude::*;
use euclid::Angle;

use super::{
    config::TeleportConfig,
    crossing::{BodyKind, TrackedObject, Viewpoint},
    geometry::{flip, map_vector, portal_to_portal},
    surface::PortalSurface,
};

/// Move an object from behind `from` to just in front of `to`, carrying its orientation and
/// velocity through. Only call once the crossing is confirmed.
pub fn teleport(
    object: &mut TrackedObject,
    from: &PortalSurface,
    to: &PortalSurface,
    config: &TeleportConfig,
) {
    let mut local = flip(from.local_point(object.tracked_point()));
    // Never land on or behind the destination plane, or the object would cross right back.
    local.z = local.z.max(config.hysteresis_offset);

    if object.tracked_height > 0.
        && !PortalSurface::is_vertical(from.pose().rotation)
        && PortalSurface::is_vertical(to.pose().rotation)
    {
        // Coming out of a floor into a wall, keep the feet above the bottom edge.
        local.y = local.y.max(-to.half_extents().y + object.tracked_height);
    }
    let tracked_point = to.world_point(local);

    let mapping = portal_to_portal(from.pose(), to.pose()).rotation;
    match object.viewpoint {
        Some(_) => {
            let view = (mapping * object.view_rotation()).normalize();
            let (yaw, pitch, roll) = view.to_euler(EulerRot::YXZ);
            object.body.rotation = Quat::from_rotation_y(yaw);
            object.viewpoint = Some(Viewpoint {
                pitch: Angle::radians(pitch),
                roll: Angle::radians(roll),
            });
        }
        None => object.body.rotation = (mapping * object.body.rotation).normalize(),
    }
    object.body.translation = tracked_point - object.body.rotation * object.tracked_offset;

    let (kind, grounded) = (object.kind, object.grounded);
    if let Some(velocity) = object.velocity.as_mut() {
        let mut linvel = velocity.linvel;
        if grounded && linvel.y < 0. && linvel.y >= -config.grounded_bias {
            // Ground snapping bias, not actual motion.
            linvel.y = 0.;
        }
        linvel = map_vector(from.pose(), to.pose(), linvel);
        velocity.angvel = map_vector(from.pose(), to.pose(), velocity.angvel);

        if PortalSurface::points_upwards(to.pose().rotation) {
            let minimum = match kind {
                BodyKind::Rigid => config.min_exit_speed,
                BodyKind::Character if grounded => {
                    config.character_min_exit_speed + config.grounded_exit_bonus
                }
                BodyKind::Character => config.character_min_exit_speed,
            };
            let normal = to.normal();
            let mut speed = linvel.dot(normal);
            if speed < 0. {
                linvel -= normal * speed;
                speed = 0.;
            }
            if speed < minimum {
                linvel += normal * (minimum - speed);
            }
        }
        velocity.linvel = linvel;
    }
}
