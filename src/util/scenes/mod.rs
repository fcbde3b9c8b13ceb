use std::f32::consts::FRAC_PI_2;

use bevy::prelude::*;
use bevy_rapier3d::prelude::*;

use crate::plugins::{
    physics::*,
    portal::{crossing::BodyKind, Teleportable},
};

/// Physical material of the surfaces portals can be shot at.
pub const PORTALABLE_MATERIAL: &str = "portalable_concrete";
/// Physical material of the surfaces portals can't be shot at.
pub const GLASS_MATERIAL: &str = "glass";

/// Setup a test room in a square flate arena format of specified size.
/// 6 cubes for the walls, floor and ceiling, with physics colliders. The last wall is glass, the
/// other surfaces accept portals.
pub fn make_test_arena(
    commands: &mut Commands,
    meshes: &mut ResMut<Assets<Mesh>>,
    materials: &mut ResMut<Assets<StandardMaterial>>,
    length: f32,
    height: f32,
) {
    const WALL_THICKNESS: f32 = 1.;

    let walls_materials = [
        materials.add(StandardMaterial::from(Color::RED)),
        materials.add(StandardMaterial::from(Color::GREEN)),
        materials.add(StandardMaterial::from(Color::BLUE)),
        materials.add(StandardMaterial {
            base_color: Color::rgba(0.8, 0.9, 1., 0.3),
            alpha_mode: AlphaMode::Blend,
            ..default()
        }),
    ];
    let ground_material = materials.add(StandardMaterial::from(Color::DARK_GRAY));

    let half_len = length / 2.;
    let wall_mesh = meshes.add(
        shape::Box {
            min_x: -half_len,
            max_x: half_len,
            min_y: -height / 2.,
            max_y: height / 2.,
            min_z: -WALL_THICKNESS / 2.,
            max_z: WALL_THICKNESS / 2.,
        }
        .into(),
    );
    let ground_mesh = meshes.add(
        shape::Box {
            min_x: -half_len * 1.1,
            max_x: half_len * 1.1,
            min_y: -WALL_THICKNESS / 2.,
            max_y: WALL_THICKNESS / 2.,
            min_z: -half_len * 1.1,
            max_z: half_len * 1.1,
        }
        .into(),
    );

    let mut ground = commands.spawn(PbrBundle {
        mesh: ground_mesh.clone(),
        material: ground_material.clone(),
        transform: Transform::from_xyz(0., -WALL_THICKNESS / 2., 0.),
        ..default()
    });
    ground.insert((
        Name::from("Ground"),
        RigidBody::Fixed,
        Collider::cuboid(half_len * 1.1, WALL_THICKNESS / 2., half_len * 1.1),
        CollisionGroups::new(GROUND_GROUP, ALL_GROUPS),
        SurfaceMaterial(PORTALABLE_MATERIAL.to_string()),
    ));

    ground.with_children(|parent| {
        let wall_count = walls_materials.len();
        for (i, mat) in walls_materials.into_iter().enumerate() {
            let surface = if i + 1 == wall_count {
                GLASS_MATERIAL
            } else {
                PORTALABLE_MATERIAL
            };
            let mut transform =
                Transform::from_xyz(0., height / 2., -(half_len + WALL_THICKNESS / 2.));
            transform.rotate_around(
                Vec3::new(0., height / 2., 0.),
                Quat::from_axis_angle(Vec3::Y, i as f32 * FRAC_PI_2),
            );
            parent
                .spawn(PbrBundle {
                    mesh: wall_mesh.clone(),
                    material: mat,
                    transform,
                    ..default()
                })
                .insert((
                    Name::from(format!("Wall_{}", i)),
                    RigidBody::Fixed,
                    Collider::cuboid(half_len, height / 2., WALL_THICKNESS / 2.),
                    CollisionGroups::new(WALLS_GROUP, ALL_GROUPS),
                    SurfaceMaterial(surface.to_string()),
                ));
        }
        parent
            .spawn(PbrBundle {
                mesh: ground_mesh,
                material: ground_material,
                transform: Transform::from_translation(Vec3::Y * height),
                ..default()
            })
            .insert((
                Name::from("Ceiling"),
                RigidBody::Fixed,
                Collider::cuboid(half_len * 1.1, WALL_THICKNESS / 2., half_len * 1.1),
                CollisionGroups::new(GROUND_GROUP, ALL_GROUPS),
                SurfaceMaterial(PORTALABLE_MATERIAL.to_string()),
            ));
    });
}

/// Drop a few crates which can go through portals.
pub fn spawn_props(
    commands: &mut Commands,
    meshes: &mut ResMut<Assets<Mesh>>,
    materials: &mut ResMut<Assets<StandardMaterial>>,
    positions: &[Vec3],
) {
    const PROP_HALF_SIZE: f32 = 0.25;

    let mesh = meshes.add(shape::Cube::new(PROP_HALF_SIZE * 2.).into());
    let material = materials.add(StandardMaterial::from(Color::ORANGE_RED));
    for (i, position) in positions.iter().enumerate() {
        commands.spawn((
            PbrBundle {
                mesh: mesh.clone(),
                material: material.clone(),
                transform: Transform::from_translation(*position),
                ..default()
            },
            Name::from(format!("Prop_{}", i)),
            RigidBody::Dynamic,
            Collider::cuboid(PROP_HALF_SIZE, PROP_HALF_SIZE, PROP_HALF_SIZE),
            CollisionGroups::new(PROPS_GROUP, ALL_GROUPS),
            Velocity::zero(),
            Ccd::enabled(),
            Teleportable {
                kind: BodyKind::Rigid,
                tracked_offset: Vec3::ZERO,
                tracked_height: 0.,
            },
        ));
    }
}
