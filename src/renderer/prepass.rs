use crate::error::RenderResult;
use crate::renderer::batch::PreparedFrame;
use crate::renderer::context::RenderContext;
use crate::renderer::device::{BindGroup, PassDesc, RenderDevice, RenderState};
use crate::renderer::targets::FrameTargets;

/// Fills scene depth plus the view-space normal and position targets that
/// SSAO reads. Returns the number of draw calls.
pub fn record_prepass(
    device: &mut dyn RenderDevice,
    context: &RenderContext,
    frame_group: &BindGroup,
    prepared: &PreparedFrame,
    targets: &FrameTargets,
) -> RenderResult<u32> {
    device.begin_pass(&PassDesc {
        label: "DepthPrepass",
        framebuffer: targets.prepass,
        clear_color: Some([0.0, 0.0, 0.0, 0.0]),
        clear_depth: Some(1.0),
    })?;
    device.set_program(context.shaders.depth_prepass, RenderState::OPAQUE);
    device.set_bind_group(frame_group);

    let mut draw_calls = 0;
    for batch in &prepared.batches {
        device.draw_geometry(batch.geometry, batch.instances());
        draw_calls += 1;
    }
    device.end_pass()?;
    Ok(draw_calls)
}
