//! This module contains the first person controller plugin.
//!
//! The player body only ever yaws. Pitch and roll live on the camera anchor, so that going through
//! a portal can hand the tilt of the view over to the camera while the body stays upright.

use std::f32::consts::{FRAC_PI_2, FRAC_PI_4};

use bevy::{prelude::*, reflect::FromReflect, render::camera::Projection};
use bevy_rapier3d::prelude::*;
use euclid::Angle;
use leafwing_input_manager::prelude::*;

use crate::plugins::{
    input::{default_input_map, Actions},
    physics::*,
    portal::{
        crossing::{BodyKind, Viewpoint},
        pair::PortalFireRequest,
        surface::PortalId,
        Teleportable,
    },
};

#[derive(Debug)]
/// First person controller plugin, which registers the required systems to use the first person
/// controller also provided by this module.
pub struct FirstPersonControllerPlugin;

impl Plugin for FirstPersonControllerPlugin {
    fn build(&self, app: &mut App) {
        app.register_type::<FirstPersonCamera>()
            .add_system(spawn_controller.label(FirstPersonLabels::SpawnControllers))
            .add_system(
                detect_ground
                    .label(FirstPersonLabels::DetectGround)
                    .after(FirstPersonLabels::SpawnControllers),
            )
            .add_system(
                process_controller_inputs
                    .label(FirstPersonLabels::ProcessInputs)
                    .after(FirstPersonLabels::DetectGround),
            );
    }
}

#[derive(Debug, SystemLabel)]
/// Labels for the first person controller systems.
pub enum FirstPersonLabels {
    SpawnControllers,
    DetectGround,
    ProcessInputs,
}

#[derive(Debug, Component)]
/// First person controller component.
pub struct FirstPersonController {
    pub pitch: Angle<f32>,
    /// Left over from portals with a tilted up axis, recovers over time.
    pub roll: Angle<f32>,
    pub camera_anchor: Entity,
    pub grounded: bool,
}

impl FirstPersonController {
    pub fn viewpoint(&self) -> Viewpoint {
        Viewpoint {
            pitch: self.pitch,
            roll: self.roll,
        }
    }

    pub fn set_viewpoint(&mut self, viewpoint: Viewpoint) {
        self.pitch = clamp_pitch(viewpoint.pitch);
        self.roll = viewpoint.roll.signed();
    }
}

#[derive(Debug, Default, Component, Reflect, FromReflect)]
#[reflect(Component)]
/// Marker trait for first person cameras
pub struct FirstPersonCamera;

#[derive(Debug, Component, Default, Reflect, FromReflect)]
#[reflect(Component)]
pub struct FirstPersonControllerSpawner {}

#[derive(Debug, Bundle, Default)]
pub struct FirstPersonControllerBundle {
    #[bundle]
    pub spatial: SpatialBundle,
    pub spawner: FirstPersonControllerSpawner,
}

pub const PLAYER_HEIGHT: f32 = 1.8;
const PLAYER_RADIUS: f32 = 0.4;
/// Eye height above the feet.
pub const EYE_HEIGHT: f32 = 1.6;
/// Eye position relative to the body origin, which sits halfway up the capsule.
pub const CAMERA_OFFSET: Vec3 = Vec3::new(0., EYE_HEIGHT - PLAYER_HEIGHT / 2., 0.);
const GROUND_PROBE_MARGIN: f32 = 0.05;

fn spawn_controller(
    mut commands: Commands,
    spawners_query: Query<(&FirstPersonControllerSpawner, Entity)>,
) {
    for (_spawner, id) in &spawners_query {
        let player_root = commands
            .entity(id)
            .insert(InputManagerBundle {
                action_state: ActionState::default(),
                input_map: default_input_map(),
            })
            .insert((
                RigidBody::Dynamic,
                Collider::capsule_y(PLAYER_HEIGHT / 2. - PLAYER_RADIUS, PLAYER_RADIUS),
                LockedAxes::ROTATION_LOCKED_X | LockedAxes::ROTATION_LOCKED_Z,
                Velocity::default(),
                Ccd::enabled(),
                Name::from("Player"),
                CollisionGroups::new(PLAYER_GROUP, ALL_GROUPS),
                Teleportable {
                    kind: BodyKind::Character,
                    tracked_offset: CAMERA_OFFSET,
                    tracked_height: EYE_HEIGHT,
                },
            ))
            .id();

        let camera_anchor = commands
            .spawn(SpatialBundle::from(Transform::from_translation(
                CAMERA_OFFSET,
            )))
            .insert(Name::from("Camera anchor"))
            .id();

        let camera = commands
            .spawn(Camera3dBundle {
                projection: Projection::Perspective(PerspectiveProjection {
                    fov: FRAC_PI_4,
                    aspect_ratio: 16. / 9.,
                    near: 0.1,
                    far: 1000.,
                }),
                ..default()
            })
            .insert((Name::from("Player camera"), FirstPersonCamera))
            .id();

        commands.entity(camera_anchor).push_children(&[camera]);

        commands
            .entity(player_root)
            .add_child(camera_anchor)
            .insert(FirstPersonController {
                pitch: Angle::zero(),
                roll: Angle::zero(),
                camera_anchor,
                grounded: false,
            });

        commands.entity(id).remove::<FirstPersonControllerSpawner>();
    }
}

fn clamp_pitch(pitch: Angle<f32>) -> Angle<f32> {
    Angle::radians(pitch.signed().radians.clamp(-FRAC_PI_2, FRAC_PI_2))
}

/// Whether `collider` can hold `body` up. Surfaces a portal opens up under the body don't.
fn can_stand_on(ignored: &IgnoredCollisionPairs, body: Entity, collider: Entity) -> bool {
    !ignored.contains(body, collider)
}

/// Look for something to stand on right under the capsule.
fn detect_ground(
    rapier: Res<RapierContext>,
    ignored: Res<IgnoredCollisionPairs>,
    mut player_query: Query<(Entity, &Transform, &mut FirstPersonController)>,
) {
    for (entity, transform, mut controller) in &mut player_query {
        let standable = |collider| can_stand_on(&ignored, entity, collider);
        let grounded = rapier
            .cast_ray(
                transform.translation,
                Vec3::NEG_Y,
                PLAYER_HEIGHT / 2. + GROUND_PROBE_MARGIN,
                true,
                QueryFilter::new()
                    .exclude_collider(entity)
                    .groups(CollisionGroups::new(
                        RAYCAST_GROUP,
                        WALLS_GROUP | GROUND_GROUP | PROPS_GROUP,
                    ))
                    .predicate(&standable),
            )
            .is_some();
        if controller.grounded != grounded {
            controller.grounded = grounded;
        }
    }
}

const PLAYER_SPEED: f32 = 3.;
const JUMP_SPEED: f32 = 4.5;
const MOUSE_SENSITIVITY: f32 = 0.004;
const MOUSE_ANGVEL_MULTIPLIER: f32 = -75.;
const SPRINT_MULTIPLIER: f32 = 2.;
/// Fraction of the roll recovered per second.
const ROLL_RECOVERY_RATE: f32 = 4.;

fn process_controller_inputs(
    time: Res<Time>,
    mut player_query: Query<(
        &ActionState<Actions>,
        &mut FirstPersonController,
        &mut Velocity,
        &Transform,
    )>,
    mut camera_query: Query<&mut Transform, Without<FirstPersonController>>,
    eyes_query: Query<&GlobalTransform, With<FirstPersonCamera>>,
    mut fire_requests: EventWriter<PortalFireRequest>,
) {
    for (input_state, mut controller, mut velocity, transform) in &mut player_query {
        let k = if input_state.pressed(Actions::Sprint) {
            SPRINT_MULTIPLIER
        } else {
            1.
        };
        let mut direction = Vec3::ZERO;
        let forward = transform.forward();
        let left = transform.left();
        match (
            input_state.pressed(Actions::Forward),
            input_state.pressed(Actions::Backwards),
        ) {
            (true, false) => direction += forward,
            (false, true) => direction -= forward,
            _ => {}
        }
        match (
            input_state.pressed(Actions::StrafeLeft),
            input_state.pressed(Actions::StrafeRight),
        ) {
            (true, false) => direction += left,
            (false, true) => direction -= left,
            _ => {}
        }

        // Keep momentum in the air, portals fling people around.
        if controller.grounded {
            velocity.linvel.x = PLAYER_SPEED * k * direction.x;
            velocity.linvel.z = PLAYER_SPEED * k * direction.z;
            if input_state.just_pressed(Actions::Jump) {
                velocity.linvel.y = JUMP_SPEED;
            }
        }

        // Process mouse movement. We handle the rotation components separately:
        // * Rotation around the vertical axis (e.g. aiming left or right) is applied to the
        //   player root node.
        // * Rotation around the horizontal axis (e.g. aiming up or down) is applied directly to
        //   the camera anchor in order to keep the vertical orientation neutral on the root
        //   node.
        if let Some(mouse_movement) = input_state.axis_pair(Actions::Aim) {
            let pitch = controller.pitch - Angle::radians(mouse_movement.y() * MOUSE_SENSITIVITY);
            controller.pitch = clamp_pitch(pitch);
            velocity.angvel.y = mouse_movement.x() * MOUSE_SENSITIVITY * MOUSE_ANGVEL_MULTIPLIER;
        } else {
            velocity.angvel.y = 0.;
        }
        let recovery = (1. - ROLL_RECOVERY_RATE * time.delta_seconds()).max(0.);
        controller.roll.radians *= recovery;

        if let Ok(mut camera_transform) = camera_query.get_mut(controller.camera_anchor) {
            camera_transform.rotation = controller.viewpoint().rotation();
        }

        if let Ok(eye) = eyes_query.get_single() {
            let origin = eye.translation();
            let direction = eye.forward();
            let mut fire = |portal, remove| {
                fire_requests.send(PortalFireRequest {
                    portal,
                    origin,
                    direction,
                    remove,
                })
            };
            if input_state.just_pressed(Actions::FirePortalA) {
                fire(PortalId::A, false);
            }
            if input_state.just_pressed(Actions::FirePortalB) {
                fire(PortalId::B, false);
            }
            if input_state.just_pressed(Actions::RemovePortals) {
                fire(PortalId::A, true);
                fire(PortalId::B, true);
            }
        }
    }
}
