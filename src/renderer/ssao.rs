//! Screen-space ambient occlusion over the prepass normals and positions,
//! followed by a separable blur.

use glam::{Mat4, Vec2, Vec3};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::error::RenderResult;
use crate::renderer::context::RenderContext;
use crate::renderer::device::{
    BindGroup, BufferSlice, RenderDevice, TextureDesc, TextureFormat, TextureId, TextureUsage,
};
use crate::renderer::postprocess::fullscreen_pass;
use crate::renderer::targets::FrameTargets;
use crate::renderer::uniforms::{BlurUniform, SsaoUniform};
use crate::settings::{SsaoSettings, MAX_SSAO_SAMPLES};

pub const NOISE_SIZE: u32 = 4;
/// Fixed so the occlusion pattern is stable between runs.
pub const SSAO_SEED: u64 = 0x55a0_c0de;

/// Tangent-space hemisphere samples around +Z. Samples are pulled towards
/// the origin so nearby occluders weigh more.
pub fn generate_kernel(sample_count: u32, seed: u64) -> Vec<Vec3> {
    let count = sample_count.clamp(1, MAX_SSAO_SAMPLES);
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..count)
        .map(|i| {
            let sample = Vec3::new(
                rng.gen_range(-1.0f32..1.0),
                rng.gen_range(-1.0f32..1.0),
                rng.gen_range(0.0f32..1.0),
            )
            .try_normalize()
            .unwrap_or(Vec3::Z);
            let t = i as f32 / count as f32;
            let scale = 0.1 + (1.0 - 0.1) * t * t;
            sample * rng.gen_range(0.0f32..1.0) * scale
        })
        .collect()
}

/// Random rotations around +Z tiled over the screen, as RGBA32F texels.
pub fn generate_noise(seed: u64) -> Vec<[f32; 4]> {
    let mut rng = SmallRng::seed_from_u64(seed ^ 0x9e37_79b9);
    (0..NOISE_SIZE * NOISE_SIZE)
        .map(|_| {
            [
                rng.gen_range(-1.0f32..1.0),
                rng.gen_range(-1.0f32..1.0),
                0.0,
                0.0,
            ]
        })
        .collect()
}

/// Screen UV (origin top-left) and depth of a view-space point, as the SSAO
/// shader projects kernel samples.
pub fn project_to_screen(proj: Mat4, view_position: Vec3) -> (Vec2, f32) {
    let ndc = proj.project_point3(view_position);
    (Vec2::new(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5), ndc.z)
}

/// Inverse of [`project_to_screen`].
pub fn reconstruct_view_position(inverse_proj: Mat4, uv: Vec2, depth: f32) -> Vec3 {
    inverse_proj.project_point3(Vec3::new(uv.x * 2.0 - 1.0, 1.0 - uv.y * 2.0, depth))
}

pub fn ssao_uniform(
    settings: &SsaoSettings,
    kernel: &[Vec3],
    width: u32,
    height: u32,
) -> SsaoUniform {
    let mut uniform = SsaoUniform {
        kernel: [[0.0; 4]; MAX_SSAO_SAMPLES as usize],
        params: [
            settings.radius,
            settings.bias,
            kernel.len().min(MAX_SSAO_SAMPLES as usize) as f32,
            0.0,
        ],
        noise_scale: [
            width as f32 / NOISE_SIZE as f32,
            height as f32 / NOISE_SIZE as f32,
            0.0,
            0.0,
        ],
    };
    for (slot, sample) in uniform.kernel.iter_mut().zip(kernel) {
        *slot = sample.extend(0.0).to_array();
    }
    uniform
}

pub fn blur_uniforms(width: u32, height: u32) -> [BlurUniform; 2] {
    [
        BlurUniform {
            direction: [1.0 / width.max(1) as f32, 0.0, 0.0, 0.0],
        },
        BlurUniform {
            direction: [0.0, 1.0 / height.max(1) as f32, 0.0, 0.0],
        },
    ]
}

/// Kernel and noise shared by every frame.
pub struct SsaoResources {
    pub noise: TextureId,
    kernel: Vec<Vec3>,
}

impl SsaoResources {
    pub fn create(device: &mut dyn RenderDevice, settings: &SsaoSettings) -> RenderResult<Self> {
        let noise = device.create_texture(&TextureDesc {
            label: "SsaoNoise",
            width: NOISE_SIZE,
            height: NOISE_SIZE,
            layers: 1,
            format: TextureFormat::Rgba32Float,
            usage: TextureUsage::SAMPLED | TextureUsage::COPY_DST,
        })?;
        let texels = generate_noise(SSAO_SEED);
        if let Err(err) = device.write_texture(noise, bytemuck::cast_slice(&texels)) {
            device.destroy_texture(noise);
            return Err(err.into());
        }
        Ok(Self {
            noise,
            kernel: generate_kernel(settings.sample_count, SSAO_SEED),
        })
    }

    pub fn kernel(&self) -> &[Vec3] {
        &self.kernel
    }

    /// Regenerates the kernel when the sample count changed.
    pub fn configure(&mut self, settings: &SsaoSettings) {
        let count = settings.sample_count.clamp(1, MAX_SSAO_SAMPLES) as usize;
        if count != self.kernel.len() {
            log::debug!("Regenerating SSAO kernel with {} samples", count);
            self.kernel = generate_kernel(settings.sample_count, SSAO_SEED);
        }
    }

    pub fn destroy(self, device: &mut dyn RenderDevice) {
        device.destroy_texture(self.noise);
    }
}

/// Uniform blocks of one frame's occlusion passes.
#[derive(Debug, Clone, Copy)]
pub struct SsaoPassParams {
    pub ssao: BufferSlice,
    /// Horizontal then vertical; `None` skips the blur.
    pub blur: Option<[BufferSlice; 2]>,
}

/// Writes occlusion into `targets.ao`, blurring through the scratch target
/// and back. Returns the number of draw calls.
pub fn record_ssao(
    device: &mut dyn RenderDevice,
    context: &RenderContext,
    frame_group: &BindGroup,
    resources: &SsaoResources,
    targets: &FrameTargets,
    params: &SsaoPassParams,
) -> RenderResult<u32> {
    let shaders = &context.shaders;
    fullscreen_pass(
        device,
        "Ssao",
        targets.ao.framebuffer,
        shaders.ssao,
        frame_group,
        params.ssao,
        [targets.normals, targets.positions, resources.noise],
    )?;
    let Some([horizontal, vertical]) = params.blur else {
        return Ok(1);
    };

    let unused = context.fallbacks.white;
    fullscreen_pass(
        device,
        "SsaoBlurH",
        targets.ao_scratch.framebuffer,
        shaders.ssao_blur,
        frame_group,
        horizontal,
        [targets.ao.texture, unused, unused],
    )?;
    fullscreen_pass(
        device,
        "SsaoBlurV",
        targets.ao.framebuffer,
        shaders.ssao_blur,
        frame_group,
        vertical,
        [targets.ao_scratch.texture, unused, unused],
    )?;
    Ok(3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_lies_in_the_upper_unit_hemisphere() {
        let kernel = generate_kernel(32, SSAO_SEED);
        assert_eq!(kernel.len(), 32);
        for sample in &kernel {
            assert!(sample.z >= 0.0);
            assert!(sample.length() <= 1.0 + 1e-5);
        }
        assert_eq!(kernel, generate_kernel(32, SSAO_SEED));
    }

    #[test]
    fn early_samples_stay_close_to_the_origin() {
        let kernel = generate_kernel(64, 7);
        for (i, sample) in kernel.iter().enumerate() {
            let t = i as f32 / 64.0;
            assert!(sample.length() <= 0.1 + 0.9 * t * t + 1e-5);
        }
    }

    #[test]
    fn sample_count_is_capped() {
        assert_eq!(generate_kernel(500, 1).len(), MAX_SSAO_SAMPLES as usize);
        assert_eq!(generate_kernel(0, 1).len(), 1);
    }

    #[test]
    fn noise_rotates_in_the_tangent_plane() {
        let noise = generate_noise(SSAO_SEED);
        assert_eq!(noise.len(), 16);
        assert!(noise.iter().all(|texel| texel[2] == 0.0 && texel[3] == 0.0));
    }

    #[test]
    fn uniform_carries_parameters() {
        let settings = SsaoSettings::default();
        let kernel = generate_kernel(settings.sample_count, SSAO_SEED);
        let uniform = ssao_uniform(&settings, &kernel, 1280, 720);
        assert_eq!(uniform.params[0], settings.radius);
        assert_eq!(uniform.params[2], settings.sample_count as f32);
        assert_eq!(uniform.noise_scale[0], 320.0);
        assert_eq!(uniform.kernel[0], kernel[0].extend(0.0).to_array());
    }
}
