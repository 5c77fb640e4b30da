//! Camera, per-frame camera uniform and the lightfield camera grid

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3, Vec4};

/// Number of virtual cameras the lightfield forward pass renders
pub const LIGHTFIELD_VIEWS: usize = 9;

/// Perspective projection of the base camera
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    pub fov_y: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Projection {
    fn default() -> Self {
        Self::perspective(45.0, 1.0, 0.1, 100.0)
    }
}

impl Projection {
    pub fn perspective(fov_y_degrees: f32, aspect: f32, near: f32, far: f32) -> Self {
        Self {
            fov_y: fov_y_degrees.to_radians(),
            aspect,
            near,
            far,
        }
    }

    pub fn matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, self.aspect, self.near, self.far)
    }
}

/// Camera for viewing the scene
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub projection: Projection,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 3.0),
            target: Vec3::ZERO,
            up: Vec3::Y,
            projection: Projection::default(),
        }
    }
}

impl Camera {
    pub fn new(position: Vec3, target: Vec3) -> Self {
        Self {
            position,
            target,
            ..Default::default()
        }
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    pub fn projection_matrix(&self) -> Mat4 {
        self.projection.matrix()
    }

    /// Build camera uniform data for shaders
    pub fn uniform_data(&self) -> CameraUniform {
        let view = self.view_matrix();
        let proj = self.projection_matrix();
        CameraUniform {
            view,
            proj,
            view_proj: proj * view,
            position: self.position.extend(1.0),
        }
    }

    /// Update aspect ratio for perspective projection
    pub fn set_aspect(&mut self, width: u32, height: u32) {
        if height > 0 {
            self.projection.aspect = width as f32 / height as f32;
        }
    }
}

/// Per-frame camera data, one copy per frame-ring slot
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, PartialEq)]
pub struct CameraUniform {
    pub view: Mat4,
    pub proj: Mat4,
    pub view_proj: Mat4,
    pub position: Vec4,
}

/// Static table of lightfield camera offsets, indexed by push constant
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, PartialEq)]
pub struct CameraOffsets {
    /// `xy` is the view-space offset, `zw` is unused
    pub offsets: [Vec4; LIGHTFIELD_VIEWS],
}

impl CameraOffsets {
    pub fn from_grid(baseline: f32) -> Self {
        let grid = camera_grid(baseline);
        Self {
            offsets: grid.map(|o| o.extend(0.0).extend(0.0)),
        }
    }

    pub fn offset(&self, camera: usize) -> Vec2 {
        self.offsets[camera].truncate().truncate()
    }
}

/// View-space offsets of the 3x3 camera grid in row-major order.
///
/// Camera `i` sits at column `i % 3` and row `i / 3`; the center camera
/// (index 4) has no offset.
pub fn camera_grid(baseline: f32) -> [Vec2; LIGHTFIELD_VIEWS] {
    std::array::from_fn(|i| {
        Vec2::new(
            ((i % 3) as f32 - 1.0) * baseline,
            ((i / 3) as f32 - 1.0) * baseline,
        )
    })
}

/// View-projection of an offset camera.
///
/// The offset is a translation in view space, applied after the view matrix
/// and before the unmodified projection: `proj * T(dx, dy, 0) * view`.
pub fn offset_view_projection(view: Mat4, proj: Mat4, offset: Vec2) -> Mat4 {
    proj * Mat4::from_translation(offset.extend(0.0)) * view
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_is_row_major_and_centered() {
        let grid = camera_grid(0.5);
        assert_eq!(grid[0], Vec2::new(-0.5, -0.5));
        assert_eq!(grid[2], Vec2::new(0.5, -0.5));
        assert_eq!(grid[4], Vec2::ZERO);
        assert_eq!(grid[8], Vec2::new(0.5, 0.5));
        let sum: Vec2 = grid.iter().sum();
        assert!(sum.length() < 1e-6);
    }

    #[test]
    fn test_offset_applied_in_view_space() {
        let camera = Camera::new(Vec3::new(1.0, 2.0, 4.0), Vec3::ZERO);
        let view = camera.view_matrix();
        let proj = camera.projection_matrix();
        let offset = Vec2::new(0.25, -0.1);
        let point = Vec4::new(0.3, -0.2, 0.1, 1.0);

        let expected = {
            let mut v = view * point;
            v.x += offset.x;
            v.y += offset.y;
            proj * v
        };
        let actual = offset_view_projection(view, proj, offset) * point;
        assert!((expected - actual).abs().max_element() < 1e-5);

        // Translating in world space before the view is a different camera.
        let wrong = proj * view * Mat4::from_translation(offset.extend(0.0)) * point;
        assert!((wrong - actual).abs().max_element() > 1e-4);
    }

    #[test]
    fn test_offsets_table_matches_grid() {
        let table = CameraOffsets::from_grid(0.2);
        let grid = camera_grid(0.2);
        for (i, expected) in grid.iter().enumerate() {
            assert_eq!(table.offset(i), *expected);
        }
        assert_eq!(std::mem::size_of::<CameraOffsets>(), LIGHTFIELD_VIEWS * 16);
    }

    #[test]
    fn test_aspect_follows_extent() {
        let mut camera = Camera::default();
        camera.set_aspect(1600, 800);
        assert_eq!(camera.projection.aspect, 2.0);
        camera.set_aspect(640, 0);
        assert_eq!(camera.projection.aspect, 2.0);
    }

    #[test]
    fn test_uniform_view_proj_is_product() {
        let camera = Camera::default();
        let data = camera.uniform_data();
        assert_eq!(data.view_proj, data.proj * data.view);
        assert_eq!(std::mem::size_of::<CameraUniform>(), 3 * 64 + 16);
    }
}
