use glam::{Mat4, Vec3, Vec4};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    pub fn aspect(&self) -> f32 {
        self.width.max(1) as f32 / self.height.max(1) as f32
    }
}

/// Camera of one frame. Projection maps depth to `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderView {
    pub view: Mat4,
    pub proj: Mat4,
    pub viewport: Viewport,
    pub near: f32,
    pub far: f32,
}

impl RenderView {
    pub fn look_at(
        eye: Vec3,
        target: Vec3,
        up: Vec3,
        fov_y: f32,
        viewport: Viewport,
        near: f32,
        far: f32,
    ) -> Self {
        Self {
            view: Mat4::look_at_rh(eye, target, up),
            proj: Mat4::perspective_rh(fov_y, viewport.aspect(), near, far),
            viewport,
            near,
            far,
        }
    }

    pub fn view_proj(&self) -> Mat4 {
        self.proj * self.view
    }

    pub fn position(&self) -> Vec3 {
        self.view.inverse().w_axis.truncate()
    }

    /// World-space corners of the slice of the view frustum between view
    /// distances `near` and `far`: four near corners then four far corners.
    pub fn frustum_corners(&self, near: f32, far: f32) -> [Vec3; 8] {
        let inv_view_proj = self.view_proj().inverse();
        let unproject = |x: f32, y: f32, z: f32| {
            let p = inv_view_proj * Vec4::new(x, y, z, 1.0);
            p.truncate() / p.w
        };

        let span = (self.far - self.near).max(f32::EPSILON);
        let t_near = (near - self.near) / span;
        let t_far = (far - self.near) / span;

        let mut corners = [Vec3::ZERO; 8];
        for (i, (x, y)) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)]
            .into_iter()
            .enumerate()
        {
            let on_near = unproject(x, y, 0.0);
            let on_far = unproject(x, y, 1.0);
            corners[i] = on_near.lerp(on_far, t_near);
            corners[i + 4] = on_near.lerp(on_far, t_far);
        }
        corners
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> RenderView {
        RenderView::look_at(
            Vec3::new(0.0, 0.0, 5.0),
            Vec3::ZERO,
            Vec3::Y,
            std::f32::consts::FRAC_PI_2,
            Viewport::new(100, 100),
            1.0,
            11.0,
        )
    }

    #[test]
    fn position_recovers_eye() {
        assert!(view().position().abs_diff_eq(Vec3::new(0.0, 0.0, 5.0), 1e-4));
    }

    #[test]
    fn frustum_slice_lies_at_requested_distances() {
        let corners = view().frustum_corners(1.0, 11.0);
        for corner in &corners[..4] {
            assert!((corner.z - 4.0).abs() < 1e-3, "{corner:?}");
        }
        for corner in &corners[4..] {
            assert!((corner.z + 6.0).abs() < 1e-2, "{corner:?}");
        }
        // 90 degree fov: half extent equals distance.
        assert!((corners[6].x - 11.0).abs() < 1e-2);
    }
}
