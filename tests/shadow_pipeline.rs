use glam::{Mat4, Vec3};

use wgpu_passes::renderer::shadows::{
    directional_cascades, point_face_index, point_face_view_projs, shadow_coords, spot_view_proj,
};
use wgpu_passes::{RenderView, Viewport};

const EPSILON: f32 = 1e-4;

fn camera() -> RenderView {
    RenderView::look_at(
        Vec3::new(8.0, 10.0, 8.0),
        Vec3::ZERO,
        Vec3::Y,
        45_f32.to_radians(),
        Viewport::new(1280, 720),
        0.1,
        100.0,
    )
}

fn assert_inside(coords: Vec3) {
    assert!(coords.x >= -EPSILON && coords.x <= 1.0 + EPSILON, "{coords:?}");
    assert!(coords.y >= -EPSILON && coords.y <= 1.0 + EPSILON, "{coords:?}");
    assert!(coords.z >= -EPSILON && coords.z <= 1.0 + EPSILON, "{coords:?}");
}

#[test]
fn every_cascade_contains_its_view_slice() {
    let view = camera();
    let light_direction = Vec3::new(0.4, -1.0, 0.2);
    let cascades = directional_cascades(&view, light_direction, 4);
    assert_eq!(cascades.len(), 4);

    let mut start = view.near;
    for cascade in &cascades {
        for corner in view.frustum_corners(start, cascade.split_far) {
            let coords = shadow_coords(cascade.view_proj, corner).expect("in front of the light");
            assert_inside(coords);
        }
        start = cascade.split_far;
    }
    assert!((cascades[3].split_far - view.far).abs() < 1e-3);
}

#[test]
fn shadow_texture_v_axis_is_flipped_from_clip_space() {
    let view = camera();
    let cascades = directional_cascades(&view, Vec3::NEG_Y, 1);
    let corners = view.frustum_corners(view.near, cascades[0].split_far);
    let center = corners.iter().copied().sum::<Vec3>() / 8.0;

    // Straight-down lights use +Z as the light-space up axis.
    let top = center + Vec3::Z;
    let bottom = center - Vec3::Z;
    let matrix = cascades[0].view_proj;

    let ndc_top = matrix.project_point3(top);
    let ndc_bottom = matrix.project_point3(bottom);
    assert!(ndc_top.y > ndc_bottom.y);

    let tex_top = shadow_coords(matrix, top).unwrap();
    let tex_bottom = shadow_coords(matrix, bottom).unwrap();
    assert!(tex_top.y < tex_bottom.y);
    assert!((tex_top.z - ndc_top.z).abs() < EPSILON);
}

#[test]
fn spot_projection_rejects_points_behind_the_light() {
    let matrix = spot_view_proj(Vec3::new(0.0, 10.0, 0.0), Vec3::NEG_Y, 0.5, 30.0);

    assert_eq!(shadow_coords(matrix, Vec3::new(0.0, 15.0, 0.0)), None);
    assert_inside(shadow_coords(matrix, Vec3::ZERO).unwrap());
}

#[test]
fn point_faces_cover_the_direction_they_are_selected_for() {
    let position = Vec3::new(1.0, 2.0, -1.0);
    let matrices = point_face_view_projs(position, 20.0);
    let offsets = [
        Vec3::new(3.0, 1.0, -0.5),
        Vec3::new(-4.0, 0.5, 2.0),
        Vec3::new(0.3, 5.0, 1.0),
        Vec3::new(-0.2, -6.0, 0.4),
        Vec3::new(1.0, -2.0, 7.0),
        Vec3::new(0.5, 0.5, -2.0),
    ];

    for (expected, offset) in offsets.into_iter().enumerate() {
        let face = point_face_index(offset);
        assert_eq!(face, expected, "offset {offset:?}");
        let coords = shadow_coords(matrices[face], position + offset).unwrap();
        assert_inside(coords);
    }
}

#[test]
fn point_face_matrices_share_one_projection() {
    let matrices = point_face_view_projs(Vec3::ZERO, 10.0);
    let right = matrices[0] * Mat4::look_at_rh(Vec3::ZERO, Vec3::X, Vec3::NEG_Y).inverse();
    let front = matrices[4] * Mat4::look_at_rh(Vec3::ZERO, Vec3::Z, Vec3::NEG_Y).inverse();
    assert!(right.abs_diff_eq(front, EPSILON));
}
