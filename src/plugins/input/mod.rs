use bevy::{prelude::*, window::CursorGrabMode};
use leafwing_input_manager::prelude::*;

#[derive(Debug)]
pub struct InputPlugin;

impl Plugin for InputPlugin {
    fn build(&self, app: &mut App) {
        app.add_plugin(InputManagerPlugin::<Actions>::default())
            .add_startup_system(toggle_on_start)
            .add_system(toggle_mouse_capture);
    }
}

#[derive(Actionlike, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Actions {
    Forward,
    Backwards,
    StrafeLeft,
    StrafeRight,
    Sprint,
    Jump,
    Aim,
    FirePortalA,
    FirePortalB,
    RemovePortals,
}

pub fn default_input_map() -> InputMap<Actions> {
    let mut input_map = InputMap::default();
    input_map
        .insert(KeyCode::W, Actions::Forward)
        .insert(KeyCode::Z, Actions::Forward)
        .insert(KeyCode::S, Actions::Backwards)
        .insert(KeyCode::A, Actions::StrafeLeft)
        .insert(KeyCode::Q, Actions::StrafeLeft)
        .insert(KeyCode::D, Actions::StrafeRight)
        .insert(KeyCode::LShift, Actions::Sprint)
        .insert(KeyCode::Space, Actions::Jump)
        .insert(DualAxis::mouse_motion(), Actions::Aim)
        .insert(MouseButton::Left, Actions::FirePortalA)
        .insert(MouseButton::Right, Actions::FirePortalB)
        .insert(KeyCode::R, Actions::RemovePortals);
    input_map
}

fn set_cursor_captured(window: &mut Window, captured: bool) {
    window.set_cursor_visibility(!captured);
    window.set_cursor_grab_mode(if captured {
        CursorGrabMode::Locked
    } else {
        CursorGrabMode::None
    });
}

fn toggle_on_start(mut windows: ResMut<Windows>) {
    if let Some(window) = windows.get_primary_mut() {
        set_cursor_captured(window, true);
    }
}

fn toggle_mouse_capture(mut windows: ResMut<Windows>, keys: Res<Input<KeyCode>>) {
    if !keys.just_pressed(KeyCode::Tab) {
        return;
    }
    if let Some(window) = windows.get_primary_mut() {
        let captured = window.cursor_grab_mode() != CursorGrabMode::None;
        set_cursor_captured(window, !captured);
    }
}
