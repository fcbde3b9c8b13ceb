use bevy::{math::Vec4Swizzles, prelude::*, render::camera::CameraProjection};
use bevy_prototype_debug_lines::DebugLines;

use crate::plugins::physics::QueryBox;

/// NDC depth the far corners are drawn at, the portal projections have no far plane.
const FAR_DEPTH: f32 = 0.02;

pub fn draw_camera_frustum<P: CameraProjection>(
    cam_transform: &Transform,
    projection: &P,
    lines: &mut DebugLines,
) {
    const NEAR_COLOR: Color = Color::BLACK;
    const FAR_COLOR: Color = Color::WHITE;

    let inv_viewprojection = (projection.get_projection_matrix()
        * cam_transform.compute_matrix().inverse())
    .inverse();

    // Reversed depth, the near plane is at 1.
    let corners = [
        Vec4::new(-1., -1., 1., 1.),
        Vec4::new(1., -1., 1., 1.),
        Vec4::new(-1., 1., 1., 1.),
        Vec4::new(1., 1., 1., 1.),
        Vec4::new(-1., -1., FAR_DEPTH, 1.),
        Vec4::new(1., -1., FAR_DEPTH, 1.),
        Vec4::new(-1., 1., FAR_DEPTH, 1.),
        Vec4::new(1., 1., FAR_DEPTH, 1.),
    ]
    .map(|v| {
        let vh = inv_viewprojection * v;
        vh.xyz() / vh.w
    });

    // Depth lines
    for i in 0..4 {
        lines.line_gradient(corners[i], corners[i + 4], 0., NEAR_COLOR, FAR_COLOR);
    }
    // Near and far planes
    for (offset, color) in [(0, NEAR_COLOR), (4, FAR_COLOR)] {
        for (a, b) in [(0, 1), (0, 2), (1, 3), (2, 3)] {
            lines.line_colored(corners[a + offset], corners[b + offset], 0., color);
        }
    }
}

pub fn draw_query_box(query: &QueryBox, color: Color, lines: &mut DebugLines) {
    let corners = query.corners();
    // Corners differing by exactly one bit of their index share an edge.
    for a in 0..8 {
        for bit in [1, 2, 4] {
            let b = a | bit;
            if b != a {
                lines.line_colored(corners[a], corners[b], 0., color);
            }
        }
    }
}
