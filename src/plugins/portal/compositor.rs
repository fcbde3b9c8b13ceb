//! Recursive portal views.
//!
//! Portal P owns one virtual camera per recursion level. Camera level `k` sits behind P, where
//! the viewer would be after walking through the other surface O `k` times, and renders into the
//! image displayed on O at level `k - 1`. Deeper levels are rendered first since every shallower
//! level samples the image the level below it just wrote.

use bevy::{
    math::Vec3A,
    prelude::*,
    render::primitives::{Aabb, Frustum},
    utils::HashSet,
};

use crate::plugins::physics::QueryBox;

use super::{
    camera_projection::oblique_projection,
    geometry::{portal_plane, portal_to_portal},
    pair::PortalPair,
    surface::PortalId,
};

/// Far distance used for visibility tests; the projections themselves are infinite.
const VISIBILITY_FAR: f32 = 1000.;

/// What the compositor needs to know about the viewer each frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameInfo {
    pub viewer: Transform,
    pub fov: f32,
    pub near: f32,
    pub viewport: UVec2,
    pub delta_seconds: f32,
}

impl FrameInfo {
    pub fn aspect_ratio(&self) -> f32 {
        self.viewport.x.max(1) as f32 / self.viewport.y.max(1) as f32
    }
}

/// One virtual camera render.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecursionFrame {
    pub depth: u32,
    pub camera: Transform,
    /// Plane of the surface the camera looks out of, in camera space.
    pub clip_plane: Vec4,
    pub projection: Mat4,
    pub deepest: bool,
}

/// Where portal views end up.
pub trait PortalRenderer {
    /// The render targets of `portal` must match the new viewport size.
    fn resize_target(&mut self, portal: PortalId, size: UVec2);
    /// Show `surface` closed at recursion `level` instead of sampling the level below.
    fn set_inactive_override(&mut self, surface: PortalId, level: u32, inactive: bool);
    fn render_level(&mut self, portal: PortalId, frame: &RecursionFrame);
    /// Nothing of `portal`'s view is visible this frame.
    fn skip(&mut self, portal: PortalId);
}

#[derive(Debug, Clone, Copy, Default)]
struct PortalView {
    last_viewport: Option<UVec2>,
    /// View-projection and pose of the level 1 camera last frame.
    previous_level_one: Option<(Mat4, Transform)>,
}

#[derive(Debug, Default, Resource)]
pub struct RecursiveViewCompositor {
    views: [PortalView; 2],
}

pub fn view_frustum(view_projection: &Mat4, camera: &Transform) -> Frustum {
    Frustum::from_view_projection(
        view_projection,
        &camera.translation,
        &camera.back(),
        VISIBILITY_FAR,
    )
}

/// Conservative oriented box test, may report boxes just outside a frustum corner as visible.
pub fn is_box_visible(frustum: &Frustum, query: &QueryBox) -> bool {
    let aabb = Aabb {
        center: Vec3A::ZERO,
        half_extents: Vec3A::from(query.half_extents),
    };
    let model = Mat4::from_rotation_translation(query.rotation, query.center);
    frustum.intersects_obb(&aabb, &model, true)
}

/// Express a world space plane in a camera's space, normalized.
pub fn camera_space_plane(camera: &Transform, world_plane: Vec4) -> Vec4 {
    // Inverse transpose of the view matrix = inverse inverse transpose of camera matrix = transpose
    let plane = camera.compute_matrix().transpose() * world_plane;
    plane * plane.truncate().length_recip()
}

impl RecursiveViewCompositor {
    pub fn render(
        &mut self,
        pair: &PortalPair,
        frame: &FrameInfo,
        renderer: &mut dyn PortalRenderer,
    ) {
        if frame.delta_seconds <= 0. {
            return;
        }
        let aspect_ratio = frame.aspect_ratio();
        let viewer_projection =
            Mat4::perspective_infinite_reverse_rh(frame.fov, aspect_ratio, frame.near);
        let viewer_frustum = view_frustum(
            &(viewer_projection * frame.viewer.compute_matrix().inverse()),
            &frame.viewer,
        );
        let max_depth = pair.config().view.recursion_limit();

        for portal in PortalId::BOTH {
            let view = &mut self.views[portal.index()];
            if view.last_viewport != Some(frame.viewport) {
                debug!("Resizing portal {:?} targets to {}", portal, frame.viewport);
                renderer.resize_target(portal, frame.viewport);
                view.last_viewport = Some(frame.viewport);
            }

            let source = pair.surface(portal);
            let displayed = pair.surface(portal.other());
            let bounds = &displayed.query_boxes().bounds;
            if !pair.is_active() || !is_box_visible(&viewer_frustum, bounds) {
                view.previous_level_one = None;
                renderer.skip(portal);
                continue;
            }

            // No point recursing if the first virtual camera didn't see the displayed surface
            // last frame.
            let depth = match view.previous_level_one {
                Some((view_projection, camera))
                    if !is_box_visible(&view_frustum(&view_projection, &camera), bounds) =>
                {
                    1
                }
                _ => max_depth,
            };

            let step = portal_to_portal(displayed.pose(), source.pose());
            let mut cameras = Vec::with_capacity(depth as usize);
            let mut camera = frame.viewer;
            for _ in 0..depth {
                camera = step * camera;
                cameras.push(camera);
            }

            let world_plane = portal_plane(source.pose());
            let mut level_one = None;
            for level in (1..=depth).rev() {
                let camera = cameras[level as usize - 1];
                let clip_plane = camera_space_plane(&camera, world_plane);
                let recursion_frame = RecursionFrame {
                    depth: level,
                    camera,
                    clip_plane,
                    projection: oblique_projection(
                        frame.fov,
                        aspect_ratio,
                        frame.near,
                        clip_plane,
                    ),
                    deepest: level == depth,
                };
                if recursion_frame.deepest {
                    renderer.set_inactive_override(portal.other(), level, true);
                }
                renderer.render_level(portal, &recursion_frame);
                if recursion_frame.deepest {
                    renderer.set_inactive_override(portal.other(), level, false);
                }
                if level == 1 {
                    let view_projection =
                        recursion_frame.projection * camera.compute_matrix().inverse();
                    level_one = Some((view_projection, camera));
                }
            }
            view.previous_level_one = level_one;
        }
    }
}

/// One recorded call to a [`PortalRenderer`].
#[derive(Debug, Clone, PartialEq)]
pub enum ViewCommand {
    Resize {
        portal: PortalId,
        size: UVec2,
    },
    InactiveOverride {
        surface: PortalId,
        level: u32,
        inactive: bool,
    },
    Render {
        portal: PortalId,
        frame: RecursionFrame,
        /// Whether the surface seen through this level was overridden to closed while it rendered.
        counterpart_inactive: bool,
    },
    Skip {
        portal: PortalId,
    },
}

/// A [`PortalRenderer`] which records the calls, to be applied to the render world later.
#[derive(Debug, Default, Resource)]
pub struct ViewRecorder {
    commands: Vec<ViewCommand>,
    overrides: HashSet<(PortalId, u32)>,
}

impl ViewRecorder {
    pub fn commands(&self) -> &[ViewCommand] {
        &self.commands
    }

    pub fn take_commands(&mut self) -> Vec<ViewCommand> {
        std::mem::take(&mut self.commands)
    }
}

impl PortalRenderer for ViewRecorder {
    fn resize_target(&mut self, portal: PortalId, size: UVec2) {
        self.commands.push(ViewCommand::Resize { portal, size });
    }

    fn set_inactive_override(&mut self, surface: PortalId, level: u32, inactive: bool) {
        if inactive {
            self.overrides.insert((surface, level));
        } else {
            self.overrides.remove(&(surface, level));
        }
        self.commands.push(ViewCommand::InactiveOverride {
            surface,
            level,
            inactive,
        });
    }

    fn render_level(&mut self, portal: PortalId, frame: &RecursionFrame) {
        self.commands.push(ViewCommand::Render {
            portal,
            frame: *frame,
            counterpart_inactive: self.overrides.contains(&(portal.other(), frame.depth)),
        });
    }

    fn skip(&mut self, portal: PortalId) {
        self.commands.push(ViewCommand::Skip { portal });
    }
}

#[cfg(test)]
mod tests {
    use std::f32::consts::FRAC_PI_4;

    use super::*;
    use crate::plugins::{
        physics::{test_world::TestWorld, WALLS_GROUP},
        portal::pair::PlacementOutcome,
    };

    /// Portals on the z = 0 face of a wall, at the given x.
    fn placed_pair(portals: &[(PortalId, f32)]) -> PortalPair {
        let mut world = TestWorld::new();
        world.add_box(
            Vec3::new(0., 1.5, -0.5),
            Vec3::new(10., 1.5, 0.5),
            WALLS_GROUP,
            Some("portalable"),
        );
        let mut pair = PortalPair::default();
        for (portal, x) in portals {
            let pose = Transform::from_xyz(*x, 1.5, 0.001);
            assert_eq!(
                pair.try_place(*portal, pose, None, &mut world),
                PlacementOutcome::Placed
            );
        }
        pair
    }

    fn side_by_side() -> PortalPair {
        placed_pair(&[(PortalId::A, -3.), (PortalId::B, 3.)])
    }

    fn frame(viewer: Transform) -> FrameInfo {
        FrameInfo {
            viewer,
            fov: FRAC_PI_4,
            near: 0.1,
            viewport: UVec2::new(1280, 720),
            delta_seconds: 1. / 60.,
        }
    }

    fn rendered_levels(commands: &[ViewCommand], of: PortalId) -> Vec<u32> {
        commands
            .iter()
            .filter_map(|command| match command {
                ViewCommand::Render { portal, frame, .. } if *portal == of => Some(frame.depth),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn renders_deepest_level_first() {
        let pair = side_by_side();
        let mut compositor = RecursiveViewCompositor::default();
        let mut recorder = ViewRecorder::default();
        compositor.render(&pair, &frame(Transform::from_xyz(0., 1.5, 6.)), &mut recorder);

        let commands = recorder.take_commands();
        assert_eq!(rendered_levels(&commands, PortalId::A), vec![5, 4, 3, 2, 1]);
        assert_eq!(rendered_levels(&commands, PortalId::B), vec![5, 4, 3, 2, 1]);

        assert_eq!(
            commands[0],
            ViewCommand::Resize {
                portal: PortalId::A,
                size: UVec2::new(1280, 720)
            }
        );
        assert_eq!(
            commands[1],
            ViewCommand::InactiveOverride {
                surface: PortalId::B,
                level: 5,
                inactive: true
            }
        );
        match &commands[2] {
            ViewCommand::Render {
                portal,
                frame,
                counterpart_inactive,
            } => {
                assert_eq!(*portal, PortalId::A);
                assert!(frame.deepest);
                assert!(*counterpart_inactive);
            }
            other => panic!("Unexpected command {:?}", other),
        }
        assert_eq!(
            commands[3],
            ViewCommand::InactiveOverride {
                surface: PortalId::B,
                level: 5,
                inactive: false
            }
        );
        match &commands[4] {
            ViewCommand::Render {
                frame,
                counterpart_inactive,
                ..
            } => {
                assert_eq!(frame.depth, 4);
                assert!(!frame.deepest);
                assert!(!*counterpart_inactive);
            }
            other => panic!("Unexpected command {:?}", other),
        }
    }

    #[test]
    fn level_one_camera_sits_behind_source_portal() {
        let pair = side_by_side();
        let mut compositor = RecursiveViewCompositor::default();
        let mut recorder = ViewRecorder::default();
        compositor.render(&pair, &frame(Transform::from_xyz(0., 1.5, 6.)), &mut recorder);

        let level_one = recorder
            .commands()
            .iter()
            .find_map(|command| match command {
                ViewCommand::Render { portal, frame, .. }
                    if *portal == PortalId::A && frame.depth == 1 =>
                {
                    Some(*frame)
                }
                _ => None,
            })
            .unwrap();
        // Seen from B at (3, 0, 6), mirrored behind A.
        assert!(level_one
            .camera
            .translation
            .abs_diff_eq(Vec3::new(0., 1.5, -5.998), 1e-4));
        assert!(level_one.camera.forward().abs_diff_eq(Vec3::Z, 1e-5));
        assert!(level_one.clip_plane.w < 0.);
        assert!((level_one.clip_plane.truncate().length() - 1.).abs() < 1e-5);
        assert_eq!(
            level_one.projection,
            oblique_projection(FRAC_PI_4, 1280. / 720., 0.1, level_one.clip_plane)
        );
    }

    #[test]
    fn skips_without_counterpart() {
        let pair = placed_pair(&[(PortalId::A, -3.)]);
        let mut compositor = RecursiveViewCompositor::default();
        let mut recorder = ViewRecorder::default();
        compositor.render(&pair, &frame(Transform::from_xyz(0., 1.5, 6.)), &mut recorder);
        let skips = recorder
            .commands()
            .iter()
            .filter(|command| matches!(command, ViewCommand::Skip { .. }))
            .count();
        assert_eq!(skips, 2);
        assert!(rendered_levels(recorder.commands(), PortalId::A).is_empty());
    }

    #[test]
    fn skips_when_looking_away() {
        let pair = side_by_side();
        let mut compositor = RecursiveViewCompositor::default();
        let mut recorder = ViewRecorder::default();
        let viewer =
            Transform::from_xyz(0., 1.5, 6.).looking_at(Vec3::new(0., 1.5, 20.), Vec3::Y);
        compositor.render(&pair, &frame(viewer), &mut recorder);
        assert!(rendered_levels(recorder.commands(), PortalId::A).is_empty());
        assert!(rendered_levels(recorder.commands(), PortalId::B).is_empty());
    }

    #[test]
    fn resizes_only_when_viewport_changes() {
        let pair = side_by_side();
        let mut compositor = RecursiveViewCompositor::default();
        let mut recorder = ViewRecorder::default();
        let mut info = frame(Transform::from_xyz(0., 1.5, 6.));
        let resizes = |commands: &[ViewCommand]| {
            commands
                .iter()
                .filter(|command| matches!(command, ViewCommand::Resize { .. }))
                .count()
        };

        compositor.render(&pair, &info, &mut recorder);
        assert_eq!(resizes(&recorder.take_commands()), 2);
        compositor.render(&pair, &info, &mut recorder);
        assert_eq!(resizes(&recorder.take_commands()), 0);
        info.viewport = UVec2::new(800, 600);
        compositor.render(&pair, &info, &mut recorder);
        assert_eq!(resizes(&recorder.take_commands()), 2);
    }

    #[test]
    fn paused_frame_renders_nothing() {
        let pair = side_by_side();
        let mut compositor = RecursiveViewCompositor::default();
        let mut recorder = ViewRecorder::default();
        let mut info = frame(Transform::from_xyz(0., 1.5, 6.));
        info.delta_seconds = 0.;
        compositor.render(&pair, &info, &mut recorder);
        assert!(recorder.commands().is_empty());
    }

    #[test]
    fn depth_drops_when_first_camera_missed_counterpart() {
        let pair = side_by_side();
        let mut compositor = RecursiveViewCompositor::default();
        let mut recorder = ViewRecorder::default();
        // Facing A; B is out of view.
        let info = frame(Transform::from_xyz(-3., 1.5, 5.));

        compositor.render(&pair, &info, &mut recorder);
        let commands = recorder.take_commands();
        assert!(commands.contains(&ViewCommand::Skip {
            portal: PortalId::A
        }));
        assert_eq!(rendered_levels(&commands, PortalId::B), vec![5, 4, 3, 2, 1]);

        // B's first camera looks out of B from behind, A is far off to its side.
        compositor.render(&pair, &info, &mut recorder);
        let commands = recorder.take_commands();
        assert_eq!(rendered_levels(&commands, PortalId::B), vec![1]);
        assert!(commands.contains(&ViewCommand::InactiveOverride {
            surface: PortalId::A,
            level: 1,
            inactive: true
        }));
    }
}
