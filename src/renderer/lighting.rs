//! Lighting accumulation into the HDR target: one ambient draw of every
//! batch, the optional skybox, then one additive draw per light.

use glam::Vec3;

use crate::error::RenderResult;
use crate::renderer::batch::PreparedFrame;
use crate::renderer::context::RenderContext;
use crate::renderer::device::{
    BindGroup, BufferSlice, PassDesc, RenderDevice, RenderState, TextureId,
};
use crate::renderer::shadows::LightShadowViews;
use crate::renderer::targets::FrameTargets;
use crate::renderer::uniforms::{
    LightUniform, LIGHT_KIND_DIRECTIONAL, LIGHT_KIND_POINT, LIGHT_KIND_SPOT, MAX_SHADOW_LAYERS,
};
use crate::scene::{Light, LightKind};

/// Constant depth bias applied when comparing against a shadow map.
pub const SHADOW_DEPTH_BIAS: f32 = 0.005;

/// Ambient contribution of a surface: `strength * base_color * occlusion`.
pub fn ambient_term(strength: f32, base_color: Vec3, occlusion: f32) -> Vec3 {
    base_color * strength * occlusion.clamp(0.0, 1.0)
}

/// Packs a light for the surface programs. `shadows` carries the light-space
/// views when the light casts shadows this frame.
pub fn light_uniform(
    light: &Light,
    shadows: Option<&LightShadowViews>,
    shadow_map_size: u32,
) -> LightUniform {
    let mut uniform = LightUniform {
        color_intensity: light.color.extend(light.intensity).to_array(),
        ..LightUniform::ambient()
    };

    match light.kind {
        LightKind::Directional { direction } => {
            uniform.kind_flags[0] = LIGHT_KIND_DIRECTIONAL;
            uniform.direction = direction.extend(0.0).to_array();
        }
        LightKind::Spot {
            position,
            direction,
            range,
            inner_angle,
            outer_angle,
        } => {
            uniform.kind_flags[0] = LIGHT_KIND_SPOT;
            uniform.position_range = position.extend(range).to_array();
            uniform.direction = direction.extend(0.0).to_array();
            uniform.cone_bias[0] = inner_angle.cos();
            uniform.cone_bias[1] = outer_angle.cos();
        }
        LightKind::Point { position, range } => {
            uniform.kind_flags[0] = LIGHT_KIND_POINT;
            uniform.position_range = position.extend(range).to_array();
        }
    }

    if let Some(views) = shadows {
        let layers = views.matrices.len().min(MAX_SHADOW_LAYERS);
        uniform.kind_flags[1] = 1;
        uniform.kind_flags[2] = layers as u32;
        uniform.cone_bias[2] = SHADOW_DEPTH_BIAS;
        uniform.cone_bias[3] = 1.0 / shadow_map_size.max(1) as f32;
        for (slot, matrix) in uniform.view_proj.iter_mut().zip(&views.matrices) {
            *slot = matrix.to_cols_array_2d();
        }
        for (slot, split) in uniform.cascade_splits.iter_mut().zip(&views.splits) {
            *slot = *split;
        }
    }
    uniform
}

/// Uniform block and shadow map bound for one light draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightBinding {
    pub light: BufferSlice,
    /// The light's shadow map or the fallback depth layer.
    pub shadow_map: TextureId,
}

#[derive(Debug, Clone, Copy)]
pub struct LightingInputs<'a> {
    /// Ambient light block, bound for the base draw.
    pub ambient: BufferSlice,
    pub lights: &'a [LightBinding],
    pub skybox: Option<TextureId>,
    /// Final occlusion texture, or white when occlusion is off.
    pub occlusion: TextureId,
}

fn draw_batches(
    device: &mut dyn RenderDevice,
    prepared: &PreparedFrame,
    state: RenderState,
) -> u32 {
    let mut draw_calls = 0;
    for batch in &prepared.batches {
        device.set_program(batch.program, state);
        for run in &batch.texture_runs {
            device.set_bind_group(&BindGroup::Material {
                params: batch.material_buffer,
                diffuse: run.diffuse,
                specular: run.specular,
            });
            device.draw_geometry(batch.geometry, run.instances.clone());
            draw_calls += 1;
        }
    }
    draw_calls
}

/// Returns the number of draw calls.
pub fn record_lighting(
    device: &mut dyn RenderDevice,
    context: &RenderContext,
    frame_group: &BindGroup,
    prepared: &PreparedFrame,
    targets: &FrameTargets,
    inputs: &LightingInputs<'_>,
) -> RenderResult<u32> {
    device.begin_pass(&PassDesc {
        label: "Lighting",
        framebuffer: targets.lighting,
        clear_color: Some([0.0, 0.0, 0.0, 1.0]),
        clear_depth: Some(1.0),
    })?;
    device.set_bind_group(frame_group);

    device.set_bind_group(&BindGroup::Light {
        light: inputs.ambient,
        shadow_map: context.fallbacks.shadow,
        occlusion: inputs.occlusion,
    });
    let mut draw_calls = draw_batches(device, prepared, RenderState::OPAQUE);

    if let Some(texture) = inputs.skybox {
        device.set_program(context.shaders.skybox, RenderState::SKYBOX);
        device.set_bind_group(&BindGroup::Skybox { texture });
        device.draw_fullscreen();
        draw_calls += 1;
    }

    for light in inputs.lights {
        device.set_bind_group(&BindGroup::Light {
            light: light.light,
            shadow_map: light.shadow_map,
            occlusion: inputs.occlusion,
        });
        draw_calls += draw_batches(device, prepared, RenderState::ADDITIVE);
    }

    device.end_pass()?;
    log::debug!(
        "Lighting: {} lights, {} draw calls",
        inputs.lights.len(),
        draw_calls
    );
    Ok(draw_calls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::shadows::light_shadow_views;
    use crate::scene::{RenderView, ShadowQuality, Viewport};

    #[test]
    fn ambient_scales_base_color_by_strength_and_occlusion() {
        let base = Vec3::new(1.0, 0.5, 0.25);
        assert_eq!(ambient_term(0.2, base, 1.0), Vec3::new(0.2, 0.1, 0.05));
        assert_eq!(ambient_term(0.2, base, 0.5), Vec3::new(0.1, 0.05, 0.025));
        assert_eq!(ambient_term(0.2, base, 2.0), ambient_term(0.2, base, 1.0));
    }

    #[test]
    fn spot_light_packs_cone_cosines() {
        let light = Light::spot(Vec3::Y, Vec3::NEG_Y, 10.0, 0.3, 0.5);
        let uniform = light_uniform(&light, None, 1024);
        assert_eq!(uniform.kind_flags, [LIGHT_KIND_SPOT, 0, 0, 0]);
        assert_eq!(uniform.position_range, [0.0, 1.0, 0.0, 10.0]);
        assert!((uniform.cone_bias[0] - 0.3f32.cos()).abs() < 1e-6);
        assert!((uniform.cone_bias[1] - 0.5f32.cos()).abs() < 1e-6);
    }

    #[test]
    fn shadowed_directional_light_carries_cascades() {
        let view = RenderView::look_at(
            Vec3::new(0.0, 2.0, 5.0),
            Vec3::ZERO,
            Vec3::Y,
            1.0,
            Viewport::new(64, 64),
            0.1,
            50.0,
        );
        let light = Light::directional(Vec3::new(-1.0, -1.0, 0.0), Vec3::ONE, 2.0)
            .with_shadows(ShadowQuality::High);
        let views = light_shadow_views(&light, &view);
        let uniform = light_uniform(&light, Some(&views), 2048);

        assert_eq!(uniform.kind_flags[0], LIGHT_KIND_DIRECTIONAL);
        assert_eq!(uniform.kind_flags[1], 1);
        assert_eq!(uniform.kind_flags[2], 4);
        assert_eq!(uniform.color_intensity[3], 2.0);
        assert_eq!(uniform.view_proj[3], views.matrices[3].to_cols_array_2d());
        assert!((uniform.cascade_splits[3] - 50.0).abs() < 1e-3);
    }
}
