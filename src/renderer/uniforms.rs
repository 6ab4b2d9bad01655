// renderer/uniforms.rs
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

use crate::scene::RenderView;
use crate::settings::{DebugOverlays, RenderSettings, MAX_SSAO_SAMPLES};

/// Offset alignment of uniform bindings inside a shared buffer.
pub const UNIFORM_ALIGNMENT: u64 = 256;

pub const LIGHT_KIND_AMBIENT: u32 = 0;
pub const LIGHT_KIND_DIRECTIONAL: u32 = 1;
pub const LIGHT_KIND_SPOT: u32 = 2;
pub const LIGHT_KIND_POINT: u32 = 3;

/// Light-space matrices per light: cascades, one spot frustum or six cube faces.
pub const MAX_SHADOW_LAYERS: usize = 6;

pub fn align_uniform(size: u64) -> u64 {
    size.div_ceil(UNIFORM_ALIGNMENT) * UNIFORM_ALIGNMENT
}

/// Group 0, binding 0 of every program.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq)]
pub struct GlobalsUniform {
    pub view: [[f32; 4]; 4],
    pub proj: [[f32; 4]; 4],
    pub view_proj: [[f32; 4]; 4],
    pub inverse_proj: [[f32; 4]; 4],
    pub camera_position: [f32; 4],
    /// width, height, 1/width, 1/height
    pub viewport: [f32; 4],
    /// ambient strength, gamma, near, far
    pub params: [f32; 4],
    /// ssao active, debug overlay bits, pcf samples, light count
    pub flags: [u32; 4],
}

impl GlobalsUniform {
    pub fn new(view: &RenderView, settings: &RenderSettings, light_count: u32) -> Self {
        // Targets are sized by the settings; the view only contributes matrices.
        let width = settings.resolution.width.max(1) as f32;
        let height = settings.resolution.height.max(1) as f32;
        Self {
            view: view.view.to_cols_array_2d(),
            proj: view.proj.to_cols_array_2d(),
            view_proj: view.view_proj().to_cols_array_2d(),
            inverse_proj: view.proj.inverse().to_cols_array_2d(),
            camera_position: view.position().extend(1.0).to_array(),
            viewport: [width, height, 1.0 / width, 1.0 / height],
            params: [settings.ambient_strength, settings.gamma, view.near, view.far],
            flags: [
                settings.ssao_active() as u32,
                settings.debug_overlays.bits(),
                settings.shadow_pcf_samples,
                light_count,
            ],
        }
    }
}

/// Per scene instance transform record.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq)]
pub struct ActorData {
    pub model: [[f32; 4]; 4],
    pub normal: [[f32; 4]; 4],
}

impl ActorData {
    pub fn new(model: Mat4) -> Self {
        Self {
            model: model.to_cols_array_2d(),
            normal: model.inverse().transpose().to_cols_array_2d(),
        }
    }
}

/// Per drawn instance record, indexed by the instance index of a draw.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq, Eq)]
pub struct InstanceData {
    pub actor: u32,
    pub material_slot: u32,
    pub _padding: [u32; 2],
}

impl InstanceData {
    pub fn new(actor: u32, material_slot: u32) -> Self {
        Self {
            actor,
            material_slot,
            _padding: [0; 2],
        }
    }
}

/// Group 2 of surface programs: the light being accumulated.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq)]
pub struct LightUniform {
    /// kind, casts shadows, shadow layer count, unused
    pub kind_flags: [u32; 4],
    pub color_intensity: [f32; 4],
    pub position_range: [f32; 4],
    pub direction: [f32; 4],
    /// cos inner, cos outer, depth bias, shadow texel size
    pub cone_bias: [f32; 4],
    /// View distances where each directional cascade ends.
    pub cascade_splits: [f32; 4],
    pub view_proj: [[[f32; 4]; 4]; MAX_SHADOW_LAYERS],
}

impl LightUniform {
    pub fn ambient() -> Self {
        let mut uniform = Self::zeroed();
        uniform.kind_flags[0] = LIGHT_KIND_AMBIENT;
        uniform
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq)]
pub struct ShadowViewUniform {
    pub view_proj: [[f32; 4]; 4],
    /// Light position and range for linear point-light depth.
    pub light_position_range: [f32; 4],
}

impl ShadowViewUniform {
    pub fn new(view_proj: Mat4, light_position: Vec3, range: f32) -> Self {
        Self {
            view_proj: view_proj.to_cols_array_2d(),
            light_position_range: light_position.extend(range).to_array(),
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq)]
pub struct SsaoUniform {
    pub kernel: [[f32; 4]; MAX_SSAO_SAMPLES as usize],
    /// radius, bias, sample count, unused
    pub params: [f32; 4],
    /// Viewport size over noise tile size.
    pub noise_scale: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq)]
pub struct BlurUniform {
    /// Texel step of this blur direction.
    pub direction: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq)]
pub struct PostUniform {
    /// x: gamma
    pub params: [f32; 4],
    pub overlays: [u32; 4],
}

impl PostUniform {
    pub fn new(gamma: f32, overlays: DebugOverlays) -> Self {
        Self {
            params: [gamma, 0.0, 0.0, 0.0],
            overlays: [overlays.bits(), 0, 0, 0],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_sizes_match_shader_layouts() {
        assert_eq!(std::mem::size_of::<GlobalsUniform>(), 320);
        assert_eq!(std::mem::size_of::<ActorData>(), 128);
        assert_eq!(std::mem::size_of::<InstanceData>(), 16);
        assert_eq!(std::mem::size_of::<LightUniform>(), 480);
        assert_eq!(std::mem::size_of::<ShadowViewUniform>(), 80);
        assert_eq!(std::mem::size_of::<SsaoUniform>(), 1056);
    }

    #[test]
    fn alignment_rounds_up() {
        assert_eq!(align_uniform(1), 256);
        assert_eq!(align_uniform(256), 256);
        assert_eq!(align_uniform(480), 512);
    }
}
