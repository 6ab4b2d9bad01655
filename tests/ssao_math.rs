//! Screen-space position math used by SSAO.
//!
//! Right-handed view space (camera looks down -Z), depth in [0, 1] and
//! screen UVs with the origin at the top-left.

use glam::{Mat4, Vec2, Vec3};

use wgpu_passes::renderer::ssao::{
    generate_kernel, project_to_screen, reconstruct_view_position, SSAO_SEED,
};

fn projection(far: f32) -> Mat4 {
    Mat4::perspective_rh(60f32.to_radians(), 16.0 / 9.0, 0.1, far)
}

#[test]
fn screen_origin_is_top_left() {
    let proj = projection(100.0);
    let (center, _) = project_to_screen(proj, Vec3::new(0.0, 0.0, -5.0));
    assert!((center - Vec2::splat(0.5)).abs().max_element() < 1e-6);

    let (upper, _) = project_to_screen(proj, Vec3::new(0.0, 1.0, -5.0));
    let (left, _) = project_to_screen(proj, Vec3::new(-1.0, 0.0, -5.0));
    assert!(upper.y < 0.5);
    assert!(left.x < 0.5);
}

#[test]
fn near_and_far_map_to_the_depth_range() {
    let proj = projection(100.0);
    let (_, depth_near) = project_to_screen(proj, Vec3::new(0.0, 0.0, -0.1));
    let (_, depth_far) = project_to_screen(proj, Vec3::new(0.0, 0.0, -100.0));
    assert!(depth_near.abs() < 1e-5, "near -> {depth_near}");
    assert!((depth_far - 1.0).abs() < 1e-5, "far -> {depth_far}");
}

#[test]
fn reconstruction_inverts_projection() {
    let proj = projection(50.0);
    let inverse = proj.inverse();
    let points = [
        Vec3::new(0.0, 0.0, -1.0),
        Vec3::new(0.2, -0.1, -2.5),
        Vec3::new(1.0, 0.5, -3.0),
        Vec3::new(-0.75, 0.25, -5.0),
    ];

    for point in points {
        let (uv, depth) = project_to_screen(proj, point);
        assert!(depth > 0.0 && depth < 1.0, "depth {depth} for {point:?}");
        let reconstructed = reconstruct_view_position(inverse, uv, depth);
        assert!(
            (reconstructed - point).abs().max_element() < 1e-4,
            "{point:?} -> {reconstructed:?}"
        );
    }
}

#[test]
fn kernel_samples_around_a_surface_stay_in_front_of_it() {
    // Offsetting a point on a camera-facing surface by any kernel sample
    // must not put it behind that surface.
    let proj = projection(50.0);
    let origin = Vec3::new(0.0, 0.0, -4.0);
    let (_, surface_depth) = project_to_screen(proj, origin);
    for sample in generate_kernel(64, SSAO_SEED) {
        let (_, depth) = project_to_screen(proj, origin + sample * 0.5);
        assert!(depth <= surface_depth + 1e-6);
    }
}
