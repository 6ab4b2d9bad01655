use crate::renderer::device::{BlendMode, CompareOp, RenderState};

const ADDITIVE_BLEND: wgpu::BlendState = wgpu::BlendState {
    color: wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::One,
        dst_factor: wgpu::BlendFactor::One,
        operation: wgpu::BlendOperation::Add,
    },
    alpha: wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::One,
        dst_factor: wgpu::BlendFactor::One,
        operation: wgpu::BlendOperation::Add,
    },
};

/// Rasterizer bias of shadow map pipelines.
const SHADOW_DEPTH_BIAS: wgpu::DepthBiasState = wgpu::DepthBiasState {
    constant: 2,
    slope_scale: 2.0,
    clamp: 0.0,
};

pub fn compare_function(op: CompareOp) -> wgpu::CompareFunction {
    match op {
        CompareOp::Always => wgpu::CompareFunction::Always,
        CompareOp::Less => wgpu::CompareFunction::Less,
        CompareOp::LessEqual => wgpu::CompareFunction::LessEqual,
    }
}

/// Replace is a plain overwrite: float32 targets are not blendable.
pub fn blend_state(mode: BlendMode) -> Option<wgpu::BlendState> {
    match mode {
        BlendMode::Replace => None,
        BlendMode::Additive => Some(ADDITIVE_BLEND),
    }
}

/// Builds the render pipeline of one program for one pass layout.
///
/// Starts as a back-face culled triangle list with `vs_main`/`fs_main`
/// entry points, [`RenderState::OPAQUE`] and no attachments.
pub struct PipelineBuilder<'a> {
    device: &'a wgpu::Device,
    label: &'a str,
    layout: &'a wgpu::PipelineLayout,
    shader: &'a wgpu::ShaderModule,
    fragment_entry: Option<&'static str>,
    vertex_buffers: Vec<wgpu::VertexBufferLayout<'a>>,
    state: RenderState,
    color_formats: &'a [wgpu::TextureFormat],
    depth_format: Option<wgpu::TextureFormat>,
    depth_bias: wgpu::DepthBiasState,
    cull_mode: Option<wgpu::Face>,
}

impl<'a> PipelineBuilder<'a> {
    pub fn new(
        device: &'a wgpu::Device,
        label: &'a str,
        layout: &'a wgpu::PipelineLayout,
        shader: &'a wgpu::ShaderModule,
    ) -> Self {
        Self {
            device,
            label,
            layout,
            shader,
            fragment_entry: Some("fs_main"),
            vertex_buffers: Vec::new(),
            state: RenderState::OPAQUE,
            color_formats: &[],
            depth_format: None,
            depth_bias: wgpu::DepthBiasState::default(),
            cull_mode: Some(wgpu::Face::Back),
        }
    }

    pub fn fragment_entry(mut self, entry: &'static str) -> Self {
        self.fragment_entry = Some(entry);
        self
    }

    /// No fragment stage and no color output.
    pub fn depth_only(mut self) -> Self {
        self.fragment_entry = None;
        self
    }

    pub fn vertex_buffer(mut self, layout: wgpu::VertexBufferLayout<'a>) -> Self {
        self.vertex_buffers.push(layout);
        self
    }

    /// Attachment formats of the pass the pipeline is drawn in.
    pub fn targets(
        mut self,
        colors: &'a [wgpu::TextureFormat],
        depth: Option<wgpu::TextureFormat>,
    ) -> Self {
        self.color_formats = colors;
        self.depth_format = depth;
        self
    }

    pub fn render_state(mut self, state: RenderState) -> Self {
        self.state = state;
        self
    }

    pub fn shadow_bias(mut self) -> Self {
        self.depth_bias = SHADOW_DEPTH_BIAS;
        self
    }

    pub fn double_sided(mut self) -> Self {
        self.cull_mode = None;
        self
    }

    pub fn build(self) -> wgpu::RenderPipeline {
        let blend = blend_state(self.state.blend);
        let color_targets: Vec<Option<wgpu::ColorTargetState>> = self
            .color_formats
            .iter()
            .map(|format| {
                Some(wgpu::ColorTargetState {
                    format: *format,
                    blend,
                    write_mask: wgpu::ColorWrites::ALL,
                })
            })
            .collect();
        let depth_stencil = self.depth_format.map(|format| wgpu::DepthStencilState {
            format,
            depth_write_enabled: self.state.depth_write,
            depth_compare: compare_function(self.state.depth_compare),
            stencil: wgpu::StencilState::default(),
            bias: self.depth_bias,
        });

        self.device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(self.label),
                layout: Some(self.layout),
                vertex: wgpu::VertexState {
                    module: self.shader,
                    entry_point: Some("vs_main"),
                    buffers: &self.vertex_buffers,
                    compilation_options: Default::default(),
                },
                fragment: self.fragment_entry.map(|entry| wgpu::FragmentState {
                    module: self.shader,
                    entry_point: Some(entry),
                    targets: &color_targets,
                    compilation_options: Default::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: self.cull_mode,
                    polygon_mode: wgpu::PolygonMode::Fill,
                    ..Default::default()
                },
                depth_stencil,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn light_accumulation_adds_and_base_passes_overwrite() {
        assert_eq!(blend_state(RenderState::OPAQUE.blend), None);
        assert_eq!(blend_state(RenderState::ADDITIVE.blend), Some(ADDITIVE_BLEND));
        assert_eq!(
            compare_function(RenderState::SKYBOX.depth_compare),
            wgpu::CompareFunction::LessEqual
        );
    }
}
