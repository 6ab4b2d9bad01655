use crate::error::RenderResult;
use crate::renderer::device::{
    Attachment, FramebufferDesc, FramebufferId, RenderDevice, TextureDesc, TextureFormat,
    TextureId, TextureUsage,
};

pub const HDR_FORMAT: TextureFormat = TextureFormat::Rgba16Float;
pub const GBUFFER_FORMAT: TextureFormat = TextureFormat::Rgba16Float;
pub const AO_FORMAT: TextureFormat = TextureFormat::R8Unorm;
pub const RESULT_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;

/// A color texture and the framebuffer that renders into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorTarget {
    pub texture: TextureId,
    pub framebuffer: FramebufferId,
}

/// Screen-sized render targets of the pass sequence.
#[derive(Debug)]
pub struct FrameTargets {
    pub width: u32,
    pub height: u32,
    pub prepass_depth: TextureId,
    /// View-space normals written by the prepass.
    pub normals: TextureId,
    /// View-space positions written by the prepass.
    pub positions: TextureId,
    pub prepass: FramebufferId,
    pub hdr: TextureId,
    pub hdr_depth: TextureId,
    pub lighting: FramebufferId,
    pub ao: ColorTarget,
    pub ao_scratch: ColorTarget,
    /// Post-process outputs, one per frame in flight.
    pub results: Vec<ColorTarget>,
    textures: Vec<TextureId>,
    framebuffers: Vec<FramebufferId>,
}

struct Builder<'a> {
    device: &'a mut dyn RenderDevice,
    width: u32,
    height: u32,
    textures: Vec<TextureId>,
    framebuffers: Vec<FramebufferId>,
}

impl Builder<'_> {
    fn texture(&mut self, label: &str, format: TextureFormat) -> RenderResult<TextureId> {
        let texture = self.device.create_texture(&TextureDesc {
            label,
            width: self.width,
            height: self.height,
            layers: 1,
            format,
            usage: TextureUsage::RENDER_TARGET | TextureUsage::SAMPLED | TextureUsage::COPY_SRC,
        })?;
        self.textures.push(texture);
        Ok(texture)
    }

    fn framebuffer(
        &mut self,
        label: &str,
        colors: &[TextureId],
        depth: Option<TextureId>,
    ) -> RenderResult<FramebufferId> {
        let colors: Vec<Attachment> = colors.iter().copied().map(Attachment::new).collect();
        let framebuffer = self.device.create_framebuffer(&FramebufferDesc {
            label,
            colors: &colors,
            depth: depth.map(Attachment::new),
        })?;
        self.framebuffers.push(framebuffer);
        Ok(framebuffer)
    }

    fn color_target(&mut self, label: &str, format: TextureFormat) -> RenderResult<ColorTarget> {
        let texture = self.texture(label, format)?;
        let framebuffer = self.framebuffer(label, &[texture], None)?;
        Ok(ColorTarget {
            texture,
            framebuffer,
        })
    }

    fn release(self) {
        for framebuffer in self.framebuffers {
            self.device.destroy_framebuffer(framebuffer);
        }
        for texture in self.textures {
            self.device.destroy_texture(texture);
        }
    }
}

impl FrameTargets {
    pub fn create(
        device: &mut dyn RenderDevice,
        width: u32,
        height: u32,
        result_count: usize,
    ) -> RenderResult<Self> {
        let mut builder = Builder {
            device,
            width: width.max(1),
            height: height.max(1),
            textures: Vec::new(),
            framebuffers: Vec::new(),
        };
        match Self::build(&mut builder, result_count) {
            Ok(targets) => {
                log::info!(
                    "Created frame targets {}x{} with {} results",
                    width,
                    height,
                    result_count
                );
                Ok(targets)
            }
            Err(err) => {
                builder.release();
                Err(err)
            }
        }
    }

    fn build(builder: &mut Builder<'_>, result_count: usize) -> RenderResult<Self> {
        let prepass_depth = builder.texture("PrepassDepth", TextureFormat::Depth32Float)?;
        let normals = builder.texture("PrepassNormals", GBUFFER_FORMAT)?;
        let positions = builder.texture("PrepassPositions", GBUFFER_FORMAT)?;
        let prepass = builder.framebuffer("Prepass", &[normals, positions], Some(prepass_depth))?;

        let hdr = builder.texture("LightingHdr", HDR_FORMAT)?;
        let hdr_depth = builder.texture("LightingDepth", TextureFormat::Depth32Float)?;
        let lighting = builder.framebuffer("Lighting", &[hdr], Some(hdr_depth))?;

        let ao = builder.color_target("Occlusion", AO_FORMAT)?;
        let ao_scratch = builder.color_target("OcclusionBlur", AO_FORMAT)?;

        let results = (0..result_count.max(1))
            .map(|index| builder.color_target(&format!("Result{index}"), RESULT_FORMAT))
            .collect::<RenderResult<Vec<_>>>()?;

        Ok(Self {
            width: builder.width,
            height: builder.height,
            prepass_depth,
            normals,
            positions,
            prepass,
            hdr,
            hdr_depth,
            lighting,
            ao,
            ao_scratch,
            results,
            textures: std::mem::take(&mut builder.textures),
            framebuffers: std::mem::take(&mut builder.framebuffers),
        })
    }

    pub fn result(&self, frame: u64) -> ColorTarget {
        self.results[(frame % self.results.len() as u64) as usize]
    }

    pub fn destroy(self, device: &mut dyn RenderDevice) {
        for framebuffer in self.framebuffers {
            device.destroy_framebuffer(framebuffer);
        }
        for texture in self.textures {
            device.destroy_texture(texture);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::headless::HeadlessDevice;

    #[test]
    fn results_rotate_with_frame_number() {
        let mut device = HeadlessDevice::new();
        let targets = FrameTargets::create(&mut device, 64, 32, 3).unwrap();
        assert_eq!(targets.results.len(), 3);
        assert_eq!(targets.result(4), targets.results[1]);
        assert_eq!(device.framebuffer_label(targets.result(0).framebuffer), Some("Result0"));

        let live = device.live_texture_count();
        targets.destroy(&mut device);
        assert_eq!(device.live_texture_count(), live - 10);
    }
}
