//! Final pass: tone the HDR lighting result into the frame's result target
//! and draw the enabled debug overlays on top.

use glam::Vec3;

use crate::error::RenderResult;
use crate::renderer::context::RenderContext;
use crate::renderer::device::{
    BindGroup, BufferSlice, FramebufferId, PassDesc, ProgramId, RenderDevice, RenderState,
    TextureId,
};
use crate::renderer::targets::{ColorTarget, FrameTargets};

/// Linear to display space, clamped to `[0, 1]`. Non-positive gamma leaves
/// the color untouched apart from the clamp.
pub fn gamma_correct(linear: Vec3, gamma: f32) -> Vec3 {
    let clamped = linear.clamp(Vec3::ZERO, Vec3::ONE);
    if gamma <= 0.0 {
        return clamped;
    }
    clamped.powf(1.0 / gamma)
}

/// One fullscreen draw into `framebuffer` reading up to three inputs.
pub(crate) fn fullscreen_pass(
    device: &mut dyn RenderDevice,
    label: &str,
    framebuffer: FramebufferId,
    program: ProgramId,
    frame_group: &BindGroup,
    params: BufferSlice,
    inputs: [TextureId; 3],
) -> RenderResult<()> {
    device.begin_pass(&PassDesc {
        label,
        framebuffer,
        clear_color: Some([0.0, 0.0, 0.0, 1.0]),
        clear_depth: None,
    })?;
    device.set_program(program, RenderState::FULLSCREEN);
    device.set_bind_group(frame_group);
    device.set_bind_group(&BindGroup::Post { params, inputs });
    device.draw_fullscreen();
    device.end_pass()?;
    Ok(())
}

/// Inputs are the HDR color, the occlusion used this frame and the prepass
/// normals, the last two standing in as white when not produced.
#[allow(clippy::too_many_arguments)]
pub fn record_post(
    device: &mut dyn RenderDevice,
    context: &RenderContext,
    frame_group: &BindGroup,
    targets: &FrameTargets,
    result: ColorTarget,
    params: BufferSlice,
    occlusion: TextureId,
    normals: Option<TextureId>,
) -> RenderResult<u32> {
    fullscreen_pass(
        device,
        "PostProcess",
        result.framebuffer,
        context.shaders.post_process,
        frame_group,
        params,
        [
            targets.hdr,
            occlusion,
            normals.unwrap_or(context.fallbacks.white),
        ],
    )?;
    Ok(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gamma_brightens_mid_tones() {
        let out = gamma_correct(Vec3::splat(0.5), 2.2);
        assert!((out.x - 0.5f32.powf(1.0 / 2.2)).abs() < 1e-6);
        assert!(out.x > 0.5);
    }

    #[test]
    fn output_is_clamped() {
        assert_eq!(gamma_correct(Vec3::new(4.0, -1.0, 1.0), 2.2), Vec3::new(1.0, 0.0, 1.0));
        assert_eq!(gamma_correct(Vec3::splat(0.25), 0.0), Vec3::splat(0.25));
    }
}
