//! Development overlays, only built with the `devel` feature.

pub mod draw;

use bevy::prelude::*;
use bevy_prototype_debug_lines::DebugLines;

use super::portal::{camera_projection::PortalCameraProjection, pair::PortalPair, PortalCamera};
use draw::{draw_camera_frustum, draw_query_box};

#[derive(Debug, Default, Resource)]
pub struct PortalDebugSettings {
    pub draw_volumes: bool,
    pub draw_frusta: bool,
}

#[derive(Debug)]
/// Draws the portal query volumes (F1) and the portal camera frusta (F2).
pub struct PortalDebugPlugin;

impl Plugin for PortalDebugPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<PortalDebugSettings>()
            .add_system(toggle_overlays)
            .add_system(draw_portal_volumes)
            .add_system(draw_portal_frusta);
    }
}

fn toggle_overlays(keys: Res<Input<KeyCode>>, mut settings: ResMut<PortalDebugSettings>) {
    if keys.just_pressed(KeyCode::F1) {
        settings.draw_volumes = !settings.draw_volumes;
    }
    if keys.just_pressed(KeyCode::F2) {
        settings.draw_frusta = !settings.draw_frusta;
    }
}

fn draw_portal_volumes(
    settings: Res<PortalDebugSettings>,
    pair: Res<PortalPair>,
    mut lines: ResMut<DebugLines>,
) {
    if !settings.draw_volumes {
        return;
    }
    for surface in pair.surfaces().iter().filter(|surface| surface.is_placed()) {
        let boxes = surface.query_boxes();
        draw_query_box(&boxes.entry, Color::GREEN, &mut lines);
        draw_query_box(&boxes.deep, Color::RED, &mut lines);
        draw_query_box(&boxes.guard, Color::YELLOW, &mut lines);
    }
}

fn draw_portal_frusta(
    settings: Res<PortalDebugSettings>,
    cameras: Query<(&Camera, &GlobalTransform, &PortalCameraProjection), With<PortalCamera>>,
    mut lines: ResMut<DebugLines>,
) {
    if !settings.draw_frusta {
        return;
    }
    for (camera, transform, projection) in &cameras {
        if camera.is_active {
            draw_camera_frustum(&transform.compute_transform(), projection, &mut lines);
        }
    }
}
