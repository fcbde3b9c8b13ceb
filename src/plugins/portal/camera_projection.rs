use std::f32::consts::FRAC_PI_4;

use bevy::{prelude::*, render::camera::CameraProjection};

const DEGENERATE_PLANE_EPSILON: f32 = 1e-6;

/// Camera projection which allows for an oblique near clipping plane, used for rendering portal
/// virtual cameras.
#[derive(Debug, Component, Clone, Reflect)]
#[reflect(Component)]
pub struct PortalCameraProjection {
    pub fov: f32,
    pub aspect_ratio: f32,
    pub near: f32,
    pub far: f32,
    /// Camera space plane, normalized. Nothing on its negative side is rendered.
    #[reflect(ignore)]
    pub clip_plane: Option<Vec4>,
}

impl Default for PortalCameraProjection {
    fn default() -> Self {
        PortalCameraProjection {
            fov: FRAC_PI_4,
            aspect_ratio: 16. / 9.,
            near: 0.1,
            far: 1000.,
            clip_plane: None,
        }
    }
}

impl CameraProjection for PortalCameraProjection {
    fn get_projection_matrix(&self) -> Mat4 {
        match self.clip_plane {
            Some(plane) => oblique_projection(self.fov, self.aspect_ratio, self.near, plane),
            None => Mat4::perspective_infinite_reverse_rh(self.fov, self.aspect_ratio, self.near),
        }
    }

    fn update(&mut self, width: f32, height: f32) {
        self.aspect_ratio = width / height;
    }

    fn far(&self) -> f32 {
        self.far
    }
}

/// Reversed-Z infinite perspective whose near plane is `clip_plane`, a normalized camera space
/// plane. Falls back to the regular projection if the camera isn't on the plane's negative side.
pub fn oblique_projection(fov: f32, aspect_ratio: f32, near: f32, clip_plane: Vec4) -> Mat4 {
    // Math taken from https://www.terathon.com/lengyel/Lengyel-Oblique.pdf, adapted to a reversed
    // depth range where the near plane maps to 1.
    let proj_mat = Mat4::perspective_infinite_reverse_rh(fov, aspect_ratio, near);
    let c = clip_plane;
    if c.w >= 0. {
        return proj_mat;
    }

    // Frustum edge direction opposite the plane, it gets depth 0.
    let tan = (fov / 2.).tan();
    let q = Vec4::new(c.x.signum() * tan * aspect_ratio, c.y.signum() * tan, -1., 0.);
    let c_dot_q = c.dot(q);
    if c_dot_q <= DEGENERATE_PLANE_EPSILON {
        return proj_mat;
    }
    let m4 = proj_mat.row(3);
    let a = m4.dot(q) / c_dot_q;
    let new_m3 = m4 - a * c;

    let mut oblique_proj_mat = proj_mat;
    oblique_proj_mat.x_axis.z = new_m3.x;
    oblique_proj_mat.y_axis.z = new_m3.y;
    oblique_proj_mat.z_axis.z = new_m3.z;
    oblique_proj_mat.w_axis.z = new_m3.w;
    oblique_proj_mat
}
