mod common;

use common::{at, globals_binding, pass_commands, small_settings, Harness};
use glam::Vec3;
use wgpu_passes::renderer::material::BlinnPhongParams;
use wgpu_passes::renderer::uniforms::GlobalsUniform;
use wgpu_passes::renderer::{BindGroup, Command, Material, MaterialKind, RenderState, TextureId};
use wgpu_passes::{MeshInstance, RenderSettings, Texture};

fn light_occlusion(commands: &[Command]) -> Vec<TextureId> {
    commands
        .iter()
        .filter_map(|command| match command {
            Command::SetBindGroup(BindGroup::Light { occlusion, .. }) => Some(*occlusion),
            _ => None,
        })
        .collect()
}

#[test]
fn no_lights_renders_the_ambient_term_only() {
    let settings = RenderSettings {
        ambient_strength: 0.2,
        ..small_settings()
    };
    let mut h = Harness::new(settings);
    let quad = h.quad();
    let material = h
        .renderer
        .create_material(Material::blinn_phong(Vec3::new(0.5, 0.25, 1.0), Vec3::ONE, 8.0));
    h.scene.add_instance(MeshInstance::new(quad, material, at(0.0)));

    let commands = h.render_commands();
    assert!(!commands.iter().any(|command| matches!(
        command,
        Command::SetProgram { state, .. } if *state == RenderState::ADDITIVE
    )));
    assert_eq!(light_occlusion(&commands).len(), 1);

    let globals = globals_binding(&commands).unwrap();
    let bytes = h.device.buffer_contents(globals.buffer).unwrap();
    let size = std::mem::size_of::<GlobalsUniform>();
    let uniform: GlobalsUniform = bytemuck::pod_read_unaligned(&bytes[..size]);
    assert_eq!(uniform.params[0], 0.2);
    assert_eq!(uniform.flags[3], 0);

    // The lighting program scales this diffuse color by the ambient strength.
    let slot = h.renderer.materials().get(material).unwrap().slot.unwrap();
    let buffer = h
        .renderer
        .material_buffers()
        .unwrap()
        .buffer(MaterialKind::BlinnPhongSolid)
        .unwrap()
        .buffer();
    let bytes = h.device.buffer_contents(buffer).unwrap();
    let size = std::mem::size_of::<BlinnPhongParams>();
    let start = slot as usize * size;
    let params: BlinnPhongParams = bytemuck::pod_read_unaligned(&bytes[start..start + size]);
    assert_eq!(params.diffuse, [0.5, 0.25, 1.0, 1.0]);
    assert_eq!(params.specular_shininess, [1.0, 1.0, 1.0, 8.0]);
}

#[test]
fn missing_and_streaming_textures_use_the_white_fallback() {
    let mut h = Harness::new(small_settings());
    let quad = h.quad();
    let streaming = h.assets.textures.insert(Texture {
        id: TextureId(10_000),
        width: 4,
        height: 4,
        ready: false,
    });
    let removed = h.assets.textures.insert(Texture {
        id: TextureId(10_001),
        width: 4,
        height: 4,
        ready: true,
    });
    h.assets.textures.remove(removed);

    for (index, map) in [streaming, removed].into_iter().enumerate() {
        let material = h.renderer.create_material(Material::textured(Some(map), 8.0));
        h.scene
            .add_instance(MeshInstance::new(quad, material, at(index as f32)));
    }

    let commands = h.render_commands();
    let stats = h.renderer.last_frame_stats().unwrap();
    assert_eq!(stats.substituted_resources, 2);

    let white = h.renderer.context().unwrap().fallbacks.white;
    let diffuse: Vec<TextureId> = commands
        .iter()
        .filter_map(|command| match command {
            Command::SetBindGroup(BindGroup::Material { diffuse, .. }) => Some(*diffuse),
            _ => None,
        })
        .collect();
    assert!(!diffuse.is_empty());
    assert!(diffuse.iter().all(|texture| *texture == white));
}

#[test]
fn destroyed_material_draws_with_the_fallback() {
    let mut h = Harness::new(small_settings());
    let quad = h.quad();
    let material = h.renderer.create_material(Material::flat(Vec3::ONE));
    h.scene.add_instance(MeshInstance::new(quad, material, at(0.0)));
    h.render().unwrap();

    h.renderer.destroy_material(material).unwrap();
    let stats = h.render().unwrap();
    assert_eq!(stats.substituted_resources, 1);
    assert_eq!(stats.instance_count, 1);

    let fallback = h.renderer.context().unwrap().fallbacks.material;
    assert!(h.renderer.materials().get(fallback).unwrap().slot.is_some());
}

#[test]
fn ssao_is_disabled_without_the_prepass() {
    let mut settings = small_settings();
    settings.depth_prepass = false;
    settings.ssao.enabled = true;
    let mut h = Harness::new(settings);
    assert!(!h.renderer.settings().ssao.enabled);

    let quad = h.quad();
    let material = h.renderer.create_material(Material::flat(Vec3::ONE));
    h.scene.add_instance(MeshInstance::new(quad, material, at(0.0)));
    let commands = h.render_commands();
    let stats = h.renderer.last_frame_stats().unwrap();

    assert_eq!(stats.prepass_draw_calls, 0);
    assert_eq!(stats.ssao_draw_calls, 0);
    assert!(pass_commands(&commands, "DepthPrepass").is_empty());
    assert!(pass_commands(&commands, "Ssao").is_empty());

    let white = h.renderer.context().unwrap().fallbacks.white;
    assert!(light_occlusion(&commands)
        .iter()
        .all(|texture| *texture == white));
}

#[test]
fn ssao_runs_and_blurs_in_both_directions() {
    let mut h = Harness::new(small_settings());
    let quad = h.quad();
    let material = h.renderer.create_material(Material::flat(Vec3::ONE));
    h.scene.add_instance(MeshInstance::new(quad, material, at(0.0)));
    let commands = h.render_commands();
    let stats = h.renderer.last_frame_stats().unwrap();

    assert_eq!(stats.ssao_draw_calls, 3);
    for label in ["Ssao", "SsaoBlurH", "SsaoBlurV"] {
        assert_eq!(pass_commands(&commands, label).len(), 1, "{label}");
    }
    let white = h.renderer.context().unwrap().fallbacks.white;
    assert!(light_occlusion(&commands)
        .iter()
        .all(|texture| *texture != white));
}

#[test]
fn unready_skybox_is_replaced_with_black() {
    let mut h = Harness::new(small_settings());
    let sky = h.assets.textures.insert(Texture {
        id: TextureId(20_000),
        width: 8,
        height: 4,
        ready: false,
    });
    h.scene.set_skybox(Some(sky));

    let commands = h.render_commands();
    let stats = h.renderer.last_frame_stats().unwrap();
    assert_eq!(stats.substituted_resources, 1);

    let black = h.renderer.context().unwrap().fallbacks.black;
    assert!(commands.iter().any(|command| matches!(
        command,
        Command::SetBindGroup(BindGroup::Skybox { texture }) if *texture == black
    )));
    assert!(commands.contains(&Command::DrawFullscreen));
}

#[test]
fn passes_run_in_order() {
    let mut h = Harness::new(small_settings());
    let quad = h.quad();
    let material = h.renderer.create_material(Material::flat(Vec3::ONE));
    h.scene.add_instance(MeshInstance::new(quad, material, at(0.0)));
    h.scene.add_light(
        wgpu_passes::Light::directional(Vec3::NEG_Y, Vec3::ONE, 1.0)
            .with_shadows(wgpu_passes::ShadowQuality::Low),
    );

    let commands = h.render_commands();
    let labels: Vec<&str> = commands
        .iter()
        .filter_map(|command| match command {
            Command::BeginPass { label, .. } => Some(label.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(
        labels,
        [
            "DepthPrepass",
            "ShadowPass",
            "Ssao",
            "SsaoBlurH",
            "SsaoBlurV",
            "Lighting",
            "PostProcess"
        ]
    );
}
