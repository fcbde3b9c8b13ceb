use std::f32::consts::*;

use crate::{
    plugins::{
        first_person_controller::{FirstPersonControllerBundle, FirstPersonControllerPlugin},
        input::InputPlugin,
        physics::PhysicsPlugin,
        portal::{
            config::PortalConfig,
            pair::{PortalFireRequest, PortalPair},
            surface::PortalId,
            PortalPlugin,
        },
    },
    util::scenes::{make_test_arena, spawn_props},
};

use bevy::prelude::*;

/// Portal configuration, relative to the working directory.
pub const PORTAL_CONFIG_PATH: &str = "assets/portal.json";

const ARENA_LENGTH: f32 = 20.;
const ARENA_HEIGHT: f32 = 5.;
/// Where the floor and ceiling demo portals are shot, in the horizontal plane.
const DEMO_PORTALS_SPOT: Vec3 = Vec3::new(5., 0., 5.);

#[derive(Debug)]
/// Main game plugin, responsible for loading the other game plugins and bootstrapping the game.
pub struct GamePlugin;

impl Plugin for GamePlugin {
    fn build(&self, app: &mut App) {
        app.add_plugins(DefaultPlugins.set(WindowPlugin {
            window: WindowDescriptor {
                title: "Linked portals".to_string(),
                ..default()
            },
            ..default()
        }));

        // After the log plugin is up, so a broken config gets reported.
        let config = PortalConfig::load_or_default(PORTAL_CONFIG_PATH);

        #[cfg(feature = "devel")]
        {
            app.add_plugin(bevy_prototype_debug_lines::DebugLinesPlugin::default());
            app.add_plugin(crate::plugins::debug::PortalDebugPlugin);
        }

        app.add_plugin(PhysicsPlugin);
        app.add_plugin(InputPlugin);
        app.add_plugin(FirstPersonControllerPlugin);
        app.add_plugin(PortalPlugin { config });

        app.add_startup_system(setup);
        app.add_system(place_demo_portals);
    }
}

/// Perform game initialization
fn setup(
    mut commands: Commands,
    mut meshes: ResMut<Assets<Mesh>>,
    mut materials: ResMut<Assets<StandardMaterial>>,
) {
    make_test_arena(
        &mut commands,
        &mut meshes,
        &mut materials,
        ARENA_LENGTH,
        ARENA_HEIGHT,
    );
    spawn_props(
        &mut commands,
        &mut meshes,
        &mut materials,
        &[
            Vec3::new(-3., 2., -4.),
            Vec3::new(-2.5, 3., -4.),
            DEMO_PORTALS_SPOT + Vec3::new(0.2, 2., -0.1),
        ],
    );

    // Light
    commands.spawn(DirectionalLightBundle {
        directional_light: DirectionalLight {
            color: Color::ANTIQUE_WHITE,
            illuminance: 20_000.,
            shadows_enabled: true,
            ..default()
        },
        transform: Transform {
            translation: Vec3::Y * 5.,
            rotation: Quat::from_euler(EulerRot::YXZ, FRAC_PI_4, -FRAC_PI_4, 0.),
            scale: Vec3::ONE,
        },
        ..default()
    });

    // Spawn player
    commands.spawn(FirstPersonControllerBundle {
        spatial: SpatialBundle::from(Transform::from_xyz(0., 1.5, 0.)),
        ..default()
    });
}

/// Shoot a floor portal and a ceiling portal on top of each other once the level colliders
/// are in, so props dropped in loop forever.
fn place_demo_portals(
    pair: Res<PortalPair>,
    mut requests: EventWriter<PortalFireRequest>,
    mut done: Local<bool>,
) {
    if *done {
        return;
    }
    if PortalId::BOTH.iter().all(|portal| pair.is_placed(*portal)) {
        info!("Demo portals in place");
        *done = true;
        return;
    }
    let origin = DEMO_PORTALS_SPOT + Vec3::Y * ARENA_HEIGHT / 4.;
    if !pair.is_placed(PortalId::A) {
        requests.send(PortalFireRequest {
            portal: PortalId::A,
            origin,
            direction: Vec3::NEG_Y,
            remove: false,
        });
    }
    if !pair.is_placed(PortalId::B) {
        requests.send(PortalFireRequest {
            portal: PortalId::B,
            origin,
            direction: Vec3::Y,
            remove: false,
        });
    }
}
