mod common;

use common::{at, pass_commands, small_settings, Harness};
use glam::Vec3;
use wgpu_passes::renderer::device::ProgramDesc;
use wgpu_passes::renderer::{BindGroup, Command, Material};
use wgpu_passes::{Light, MeshInstance, ShadowQuality};

fn lit_scene(h: &mut Harness) {
    let quad = h.quad();
    let material = h
        .renderer
        .create_material(Material::blinn_phong(Vec3::ONE, Vec3::ONE, 16.0));
    h.scene.add_instance(MeshInstance::new(quad, material, at(0.0)));
    h.scene.add_instance(MeshInstance::new(quad, material, at(1.0)));

    h.scene.add_light(
        Light::directional(Vec3::new(-1.0, -1.0, -0.5), Vec3::ONE, 1.0)
            .with_shadows(ShadowQuality::Medium),
    );
    h.scene
        .add_light(Light::point(Vec3::new(0.0, 2.0, 0.0), 8.0, Vec3::ONE, 1.0));
    h.scene.add_light(
        Light::spot(Vec3::new(0.0, 4.0, 2.0), Vec3::NEG_Y, 10.0, 0.3, 0.5)
            .with_shadows(ShadowQuality::Low),
    );
}

fn shadow_framebuffer_labels(h: &Harness, commands: &[Command]) -> Vec<String> {
    pass_commands(commands, "ShadowPass")
        .iter()
        .filter_map(|pass| match &pass[0] {
            Command::BeginPass { framebuffer, .. } => h
                .device
                .framebuffer_label(*framebuffer)
                .map(str::to_owned),
            _ => None,
        })
        .collect()
}

#[test]
fn lights_without_shadows_get_no_shadow_pass() {
    let mut h = Harness::new(small_settings());
    lit_scene(&mut h);
    let commands = h.render_commands();
    let stats = h.renderer.last_frame_stats().unwrap();

    // Two cascades for the directional light, one layer for the spot.
    assert_eq!(stats.shadow_passes, 3);
    assert_eq!(stats.shadow_draw_calls, 3);
    let labels = shadow_framebuffer_labels(&h, &commands);
    assert_eq!(
        labels,
        ["ShadowMap0Layer0", "ShadowMap0Layer1", "ShadowMap2Layer0"]
    );
}

#[test]
fn non_casting_light_samples_the_fallback_shadow_map() {
    let mut h = Harness::new(small_settings());
    lit_scene(&mut h);
    let commands = h.render_commands();
    let fallback = h.renderer.context().unwrap().fallbacks.shadow;

    let lighting = pass_commands(&commands, "Lighting");
    let shadow_maps: Vec<_> = lighting[0]
        .iter()
        .filter_map(|command| match command {
            Command::SetBindGroup(BindGroup::Light { shadow_map, .. }) => Some(*shadow_map),
            _ => None,
        })
        .collect();

    // Ambient, then one binding per light.
    assert_eq!(shadow_maps.len(), 4);
    assert_eq!(shadow_maps[0], fallback);
    assert_ne!(shadow_maps[1], fallback);
    assert_eq!(shadow_maps[2], fallback);
    assert_ne!(shadow_maps[3], fallback);
}

#[test]
fn point_light_renders_six_linear_depth_faces() {
    let mut h = Harness::new(small_settings());
    let quad = h.quad();
    let material = h.renderer.create_material(Material::flat(Vec3::ONE));
    h.scene.add_instance(MeshInstance::new(quad, material, at(0.0)));
    h.scene.add_light(
        Light::point(Vec3::new(0.0, 1.0, 1.0), 5.0, Vec3::ONE, 1.0)
            .with_shadows(ShadowQuality::Low),
    );

    let commands = h.render_commands();
    let passes = pass_commands(&commands, "ShadowPass");
    assert_eq!(passes.len(), 6);
    for pass in passes {
        assert!(pass.iter().any(|command| matches!(
            command,
            Command::SetProgram {
                desc: ProgramDesc::ShadowLinearDepth,
                ..
            }
        )));
    }
}

#[test]
fn turning_shadows_off_releases_the_map() {
    let mut h = Harness::new(small_settings());
    lit_scene(&mut h);
    h.render().unwrap();
    let textures = h.device.live_texture_count();

    for light in h.scene.lights_mut() {
        light.casts_shadows = false;
    }
    let stats = h.render().unwrap();
    assert_eq!(stats.shadow_passes, 0);
    assert_eq!(h.device.live_texture_count(), textures - 2);
}
