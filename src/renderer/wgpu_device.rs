//! [`RenderDevice`] over a wgpu device and queue.
//!
//! Commands are recorded into one encoder per submission. Pipelines are
//! built lazily from the formats of the pass they are first used in, and
//! bind groups are cached by their [`BindGroup`] description until any
//! buffer or texture they might reference is destroyed.

use std::collections::HashMap;
use std::num::NonZeroU64;
use std::ops::Range;
use std::sync::mpsc;
use std::time::Duration;

use wgpu::util::DeviceExt;

use crate::error::{DeviceError, RenderResult};
use crate::renderer::device::{
    Attachment, BindGroup, BufferDesc, BufferId, BufferSlice, BufferUsage,
    FramebufferDesc, FramebufferId, GeometryDesc, GeometryId, PassDesc, ProgramDesc, ProgramId,
    RenderDevice, RenderState, ShaderFeatures, TextureDesc, TextureFormat, TextureId,
    TextureUsage,
};
use crate::renderer::fence::{wait_for_fence, GpuFence};
use crate::renderer::gpu::GpuContext;
use crate::renderer::pipeline_builder::PipelineBuilder;
use crate::renderer::vertex::Vertex;

const FRAME_WGSL: &str = include_str!("../shader/frame.wgsl");
const MIN_BUFFER_SIZE: u64 = 16;

fn texture_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        TextureFormat::R8Unorm => wgpu::TextureFormat::R8Unorm,
        TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
    }
}

fn texture_usages(usage: TextureUsage) -> wgpu::TextureUsages {
    let mut usages = wgpu::TextureUsages::empty();
    if usage.contains(TextureUsage::RENDER_TARGET) {
        usages |= wgpu::TextureUsages::RENDER_ATTACHMENT;
    }
    if usage.contains(TextureUsage::SAMPLED) {
        usages |= wgpu::TextureUsages::TEXTURE_BINDING;
    }
    if usage.contains(TextureUsage::COPY_DST) {
        usages |= wgpu::TextureUsages::COPY_DST;
    }
    if usage.contains(TextureUsage::COPY_SRC) {
        usages |= wgpu::TextureUsages::COPY_SRC;
    }
    usages
}

fn invalid(kind: &'static str, index: u32) -> DeviceError {
    DeviceError::InvalidHandle { kind, index }
}

/// WGSL source of a program: the shared group 0 declarations plus the
/// program body, with surface variants specialised through constants.
pub fn shader_source(desc: &ProgramDesc) -> String {
    let body = match desc {
        ProgramDesc::DepthPrepass => include_str!("../shader/prepass.wgsl"),
        ProgramDesc::ShadowDepth | ProgramDesc::ShadowLinearDepth => {
            include_str!("../shader/shadow.wgsl")
        }
        ProgramDesc::Surface { .. } => include_str!("../shader/surface.wgsl"),
        ProgramDesc::Skybox => include_str!("../shader/skybox.wgsl"),
        ProgramDesc::Ssao => include_str!("../shader/ssao.wgsl"),
        ProgramDesc::SsaoBlur => include_str!("../shader/blur.wgsl"),
        ProgramDesc::PostProcess => include_str!("../shader/post.wgsl"),
    };
    let constants = match desc {
        ProgramDesc::Surface { kind, features } => format!(
            "const MATERIAL_KIND: u32 = {}u;\nconst PARAM_VEC4S: u32 = {}u;\nconst DOUBLE_SIDED: bool = {};\n",
            kind.shader_index(),
            kind.params_size() / 16,
            features.contains(ShaderFeatures::DOUBLE_SIDED)
        ),
        _ => String::new(),
    };
    format!("{}{}\n{}", constants, FRAME_WGSL, body)
}

fn program_label(desc: &ProgramDesc) -> String {
    match desc {
        ProgramDesc::Surface { kind, features } if features.is_empty() => {
            format!("Surface{}", kind.label())
        }
        ProgramDesc::Surface { kind, .. } => format!("Surface{}DoubleSided", kind.label()),
        other => format!("{other:?}"),
    }
}

struct BufferEntry {
    buffer: wgpu::Buffer,
    size: u64,
}

struct TextureEntry {
    texture: wgpu::Texture,
    /// View bound in bind groups: every layer of depth textures, the first
    /// layer otherwise.
    view: wgpu::TextureView,
    format: TextureFormat,
    width: u32,
    height: u32,
}

struct FramebufferEntry {
    colors: Vec<wgpu::TextureView>,
    color_formats: Vec<wgpu::TextureFormat>,
    depth: Option<(wgpu::TextureView, wgpu::TextureFormat)>,
}

struct GeometryEntry {
    vertices: wgpu::Buffer,
    indices: wgpu::Buffer,
    index_count: u32,
}

struct ProgramEntry {
    desc: ProgramDesc,
    label: String,
    module: wgpu::ShaderModule,
    layout: wgpu::PipelineLayout,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    program: ProgramId,
    state: RenderState,
    colors: Vec<wgpu::TextureFormat>,
    depth: Option<wgpu::TextureFormat>,
}

/// Program state of the open pass. Draws are dropped unless a pipeline
/// was bound successfully.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum BoundProgram {
    #[default]
    None,
    Ready(ProgramId),
    Failed(ProgramId),
}

impl BoundProgram {
    fn can_draw(self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

struct OpenPass {
    label: String,
    pass: wgpu::RenderPass<'static>,
    color_formats: Vec<wgpu::TextureFormat>,
    depth_format: Option<wgpu::TextureFormat>,
    program: BoundProgram,
}

impl OpenPass {
    fn drawable(&self) -> bool {
        if !self.program.can_draw() {
            log::debug!("Dropping draw in {}: {:?}", self.label, self.program);
        }
        self.program.can_draw()
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn storage_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: true },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn texture_entry(
    binding: u32,
    sample_type: wgpu::TextureSampleType,
    view_dimension: wgpu::TextureViewDimension,
) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            sample_type,
            view_dimension,
            multisampled: false,
        },
        count: None,
    }
}

fn sampler_entry(binding: u32, ty: wgpu::SamplerBindingType) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Sampler(ty),
        count: None,
    }
}

/// One layout per [`BindGroup`] variant.
struct BindLayouts {
    frame: wgpu::BindGroupLayout,
    shadow_view: wgpu::BindGroupLayout,
    material: wgpu::BindGroupLayout,
    light: wgpu::BindGroupLayout,
    skybox: wgpu::BindGroupLayout,
    post: wgpu::BindGroupLayout,
}

impl BindLayouts {
    fn new(device: &wgpu::Device) -> Self {
        let layout = |label: &str, entries: &[wgpu::BindGroupLayoutEntry]| {
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(label),
                entries,
            })
        };
        let filterable = wgpu::TextureSampleType::Float { filterable: true };
        let loaded = wgpu::TextureSampleType::Float { filterable: false };
        let d2 = wgpu::TextureViewDimension::D2;

        Self {
            frame: layout(
                "FrameBindLayout",
                &[uniform_entry(0), storage_entry(1), storage_entry(2)],
            ),
            shadow_view: layout("ShadowViewBindLayout", &[uniform_entry(0)]),
            material: layout(
                "MaterialBindLayout",
                &[
                    storage_entry(0),
                    texture_entry(1, filterable, d2),
                    texture_entry(2, filterable, d2),
                    sampler_entry(3, wgpu::SamplerBindingType::Filtering),
                ],
            ),
            light: layout(
                "LightBindLayout",
                &[
                    uniform_entry(0),
                    texture_entry(
                        1,
                        wgpu::TextureSampleType::Depth,
                        wgpu::TextureViewDimension::D2Array,
                    ),
                    texture_entry(2, loaded, d2),
                    sampler_entry(3, wgpu::SamplerBindingType::Comparison),
                ],
            ),
            skybox: layout(
                "SkyboxBindLayout",
                &[
                    texture_entry(0, filterable, d2),
                    sampler_entry(1, wgpu::SamplerBindingType::Filtering),
                ],
            ),
            post: layout(
                "PostBindLayout",
                &[
                    uniform_entry(0),
                    texture_entry(1, loaded, d2),
                    texture_entry(2, loaded, d2),
                    texture_entry(3, loaded, d2),
                ],
            ),
        }
    }

    fn for_program(&self, desc: &ProgramDesc) -> Vec<&wgpu::BindGroupLayout> {
        match desc {
            ProgramDesc::DepthPrepass => vec![&self.frame],
            ProgramDesc::ShadowDepth | ProgramDesc::ShadowLinearDepth => {
                vec![&self.frame, &self.shadow_view]
            }
            ProgramDesc::Surface { .. } => vec![&self.frame, &self.material, &self.light],
            ProgramDesc::Skybox => vec![&self.frame, &self.skybox],
            ProgramDesc::Ssao | ProgramDesc::SsaoBlur | ProgramDesc::PostProcess => {
                vec![&self.frame, &self.post]
            }
        }
    }
}

struct Samplers {
    material: wgpu::Sampler,
    skybox: wgpu::Sampler,
    shadow: wgpu::Sampler,
}

impl Samplers {
    fn new(device: &wgpu::Device) -> Self {
        Self {
            material: device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some("MaterialSampler"),
                address_mode_u: wgpu::AddressMode::Repeat,
                address_mode_v: wgpu::AddressMode::Repeat,
                address_mode_w: wgpu::AddressMode::Repeat,
                mag_filter: wgpu::FilterMode::Linear,
                min_filter: wgpu::FilterMode::Linear,
                ..Default::default()
            }),
            skybox: device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some("SkyboxSampler"),
                address_mode_u: wgpu::AddressMode::Repeat,
                address_mode_v: wgpu::AddressMode::ClampToEdge,
                mag_filter: wgpu::FilterMode::Linear,
                min_filter: wgpu::FilterMode::Linear,
                ..Default::default()
            }),
            shadow: device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some("ShadowSampler"),
                address_mode_u: wgpu::AddressMode::ClampToEdge,
                address_mode_v: wgpu::AddressMode::ClampToEdge,
                mag_filter: wgpu::FilterMode::Linear,
                min_filter: wgpu::FilterMode::Linear,
                compare: Some(wgpu::CompareFunction::LessEqual),
                ..Default::default()
            }),
        }
    }
}

pub struct WgpuDevice {
    context: GpuContext,
    layouts: BindLayouts,
    samplers: Samplers,
    next_id: u32,
    buffers: HashMap<u32, BufferEntry>,
    textures: HashMap<u32, TextureEntry>,
    framebuffers: HashMap<u32, FramebufferEntry>,
    geometries: HashMap<u32, GeometryEntry>,
    programs: HashMap<u32, ProgramEntry>,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
    bind_groups: HashMap<BindGroup, wgpu::BindGroup>,
    encoder: Option<wgpu::CommandEncoder>,
    pass: Option<OpenPass>,
    next_submission: u64,
}

impl WgpuDevice {
    pub fn new(context: GpuContext) -> Self {
        let layouts = BindLayouts::new(&context.device);
        let samplers = Samplers::new(&context.device);
        Self {
            context,
            layouts,
            samplers,
            next_id: 1,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            geometries: HashMap::new(),
            programs: HashMap::new(),
            pipelines: HashMap::new(),
            bind_groups: HashMap::new(),
            encoder: None,
            pass: None,
            next_submission: 0,
        }
    }

    /// Opens a surfaceless device on the default adapter.
    pub fn headless() -> Result<Self, DeviceError> {
        Ok(Self::new(GpuContext::headless()?))
    }

    pub fn context(&self) -> &GpuContext {
        &self.context
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Copies the first layer of `texture` back to the CPU, tightly packed.
    /// Submits everything recorded so far.
    pub fn read_texture(&mut self, texture: TextureId, timeout: Duration) -> RenderResult<Vec<u8>> {
        let entry = self
            .textures
            .get(&texture.0)
            .ok_or_else(|| invalid("texture", texture.0))?;
        let row_bytes = entry.width * entry.format.bytes_per_texel();
        let padded_row_bytes = row_bytes.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let staging = self.context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("ReadbackBuffer"),
            size: padded_row_bytes as u64 * entry.height as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let encoder = self.encoder.get_or_insert_with(|| {
            self.context
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("FrameEncoder"),
                })
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &entry.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: if entry.format.is_depth() {
                    wgpu::TextureAspect::DepthOnly
                } else {
                    wgpu::TextureAspect::All
                },
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row_bytes),
                    rows_per_image: Some(entry.height),
                },
            },
            wgpu::Extent3d {
                width: entry.width,
                height: entry.height,
                depth_or_array_layers: 1,
            },
        );
        self.submit();

        let fence = GpuFence::new(self.next_submission);
        let signal = fence.clone();
        let (sender, receiver) = mpsc::channel();
        staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = sender.send(result);
                signal.signal();
            });
        wait_for_fence(self, &fence, timeout, 0)?;
        receiver
            .recv()
            .map_err(|_| DeviceError::Backend("readback callback dropped".into()))?
            .map_err(|err| DeviceError::Backend(format!("readback failed: {err}")))?;

        let mapped = staging.slice(..).get_mapped_range();
        let mut pixels = Vec::with_capacity(mapped.len());
        for row in mapped.chunks(padded_row_bytes as usize) {
            pixels.extend_from_slice(&row[..row_bytes as usize]);
        }
        drop(mapped);
        staging.unmap();
        Ok(pixels)
    }

    fn buffer_binding(&self, slice: BufferSlice) -> Result<wgpu::BindingResource<'_>, DeviceError> {
        let entry = self
            .buffers
            .get(&slice.buffer.0)
            .ok_or_else(|| invalid("buffer", slice.buffer.0))?;
        if slice.offset + slice.size > entry.size {
            return Err(DeviceError::Backend(format!(
                "binding {}..{} outside buffer of {} bytes",
                slice.offset,
                slice.offset + slice.size,
                entry.size
            )));
        }
        Ok(wgpu::BindingResource::Buffer(wgpu::BufferBinding {
            buffer: &entry.buffer,
            offset: slice.offset,
            size: NonZeroU64::new(slice.size),
        }))
    }

    fn texture_binding(&self, texture: TextureId) -> Result<wgpu::BindingResource<'_>, DeviceError> {
        self.textures
            .get(&texture.0)
            .map(|entry| wgpu::BindingResource::TextureView(&entry.view))
            .ok_or_else(|| invalid("texture", texture.0))
    }

    fn create_bind_group(&self, group: &BindGroup) -> Result<wgpu::BindGroup, DeviceError> {
        let (layout, resources) = match *group {
            BindGroup::Frame {
                globals,
                actors,
                instances,
            } => (
                &self.layouts.frame,
                vec![
                    self.buffer_binding(globals)?,
                    self.buffer_binding(actors)?,
                    self.buffer_binding(instances)?,
                ],
            ),
            BindGroup::ShadowView { view } => {
                (&self.layouts.shadow_view, vec![self.buffer_binding(view)?])
            }
            BindGroup::Material {
                params,
                diffuse,
                specular,
            } => (
                &self.layouts.material,
                vec![
                    self.buffer_binding(params)?,
                    self.texture_binding(diffuse)?,
                    self.texture_binding(specular)?,
                    wgpu::BindingResource::Sampler(&self.samplers.material),
                ],
            ),
            BindGroup::Light {
                light,
                shadow_map,
                occlusion,
            } => (
                &self.layouts.light,
                vec![
                    self.buffer_binding(light)?,
                    self.texture_binding(shadow_map)?,
                    self.texture_binding(occlusion)?,
                    wgpu::BindingResource::Sampler(&self.samplers.shadow),
                ],
            ),
            BindGroup::Skybox { texture } => (
                &self.layouts.skybox,
                vec![
                    self.texture_binding(texture)?,
                    wgpu::BindingResource::Sampler(&self.samplers.skybox),
                ],
            ),
            BindGroup::Post { params, inputs } => {
                let mut resources = vec![self.buffer_binding(params)?];
                for input in inputs {
                    resources.push(self.texture_binding(input)?);
                }
                (&self.layouts.post, resources)
            }
        };

        let entries: Vec<wgpu::BindGroupEntry<'_>> = resources
            .into_iter()
            .enumerate()
            .map(|(binding, resource)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource,
            })
            .collect();
        Ok(self
            .context
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: None,
                layout,
                entries: &entries,
            }))
    }

    fn build_pipeline(&self, key: &PipelineKey) -> Result<wgpu::RenderPipeline, DeviceError> {
        let program = self
            .programs
            .get(&key.program.0)
            .ok_or_else(|| invalid("program", key.program.0))?;

        let mut builder = PipelineBuilder::new(
            &self.context.device,
            &program.label,
            &program.layout,
            &program.module,
        )
        .render_state(key.state)
        .targets(&key.colors, key.depth);
        builder = match program.desc {
            ProgramDesc::DepthPrepass => builder.vertex_buffer(Vertex::layout()),
            ProgramDesc::ShadowDepth => builder
                .vertex_buffer(Vertex::layout())
                .depth_only()
                .shadow_bias(),
            ProgramDesc::ShadowLinearDepth => builder
                .vertex_buffer(Vertex::layout())
                .fragment_entry("fs_linear")
                .shadow_bias(),
            ProgramDesc::Surface { features, .. } => {
                let builder = builder.vertex_buffer(Vertex::layout());
                if features.contains(ShaderFeatures::DOUBLE_SIDED) {
                    builder.double_sided()
                } else {
                    builder
                }
            }
            ProgramDesc::Skybox
            | ProgramDesc::Ssao
            | ProgramDesc::SsaoBlur
            | ProgramDesc::PostProcess => builder.double_sided(),
        };

        self.context
            .device
            .push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = builder.build();
        match pollster::block_on(self.context.device.pop_error_scope()) {
            Some(err) => Err(DeviceError::Backend(format!(
                "pipeline {} rejected: {err}",
                program.label
            ))),
            None => Ok(pipeline),
        }
    }
}

impl RenderDevice for WgpuDevice {
    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<BufferId, DeviceError> {
        let size = desc.size.max(MIN_BUFFER_SIZE).div_ceil(wgpu::COPY_BUFFER_ALIGNMENT)
            * wgpu::COPY_BUFFER_ALIGNMENT;
        let limits = self.context.device.limits();
        let max = match desc.usage {
            BufferUsage::Uniform => limits.max_buffer_size,
            BufferUsage::Storage => limits
                .max_buffer_size
                .min(limits.max_storage_buffer_binding_size as u64),
        };
        if size > max {
            log::warn!("Buffer {} of {} bytes exceeds device limit {}", desc.label, size, max);
            return Err(DeviceError::OutOfMemory {
                requested: desc.size,
            });
        }

        let usage = match desc.usage {
            BufferUsage::Uniform => wgpu::BufferUsages::UNIFORM,
            BufferUsage::Storage => wgpu::BufferUsages::STORAGE,
        } | wgpu::BufferUsages::COPY_DST
            | wgpu::BufferUsages::COPY_SRC;

        self.context
            .device
            .push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(desc.label),
            size,
            usage,
            mapped_at_creation: false,
        });
        if pollster::block_on(self.context.device.pop_error_scope()).is_some() {
            return Err(DeviceError::OutOfMemory {
                requested: desc.size,
            });
        }

        let id = self.allocate_id();
        self.buffers.insert(id, BufferEntry { buffer, size });
        Ok(BufferId(id))
    }

    fn write_buffer(
        &mut self,
        buffer: BufferId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        let entry = self
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| invalid("buffer", buffer.0))?;
        let padded_len = (data.len() as u64).div_ceil(wgpu::COPY_BUFFER_ALIGNMENT)
            * wgpu::COPY_BUFFER_ALIGNMENT;
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 || offset + padded_len > entry.size {
            return Err(DeviceError::Backend(format!(
                "write of {} bytes at {} does not fit buffer of {} bytes",
                data.len(),
                offset,
                entry.size
            )));
        }
        if padded_len == data.len() as u64 {
            self.context.queue.write_buffer(&entry.buffer, offset, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize(padded_len as usize, 0);
            self.context.queue.write_buffer(&entry.buffer, offset, &padded);
        }
        Ok(())
    }

    /// Submitted on its own right away, so staged writes land before the copy
    /// and later writes after it.
    fn copy_buffer(&mut self, src: BufferId, dst: BufferId, size: u64) -> Result<(), DeviceError> {
        let source = self.buffers.get(&src.0).ok_or_else(|| invalid("buffer", src.0))?;
        let target = self.buffers.get(&dst.0).ok_or_else(|| invalid("buffer", dst.0))?;
        let size = size.div_ceil(wgpu::COPY_BUFFER_ALIGNMENT) * wgpu::COPY_BUFFER_ALIGNMENT;
        if size > source.size || size > target.size {
            return Err(DeviceError::Backend(format!(
                "copy of {} bytes exceeds buffers of {} and {} bytes",
                size, source.size, target.size
            )));
        }

        let mut encoder =
            self.context
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("CopyEncoder"),
                });
        encoder.copy_buffer_to_buffer(&source.buffer, 0, &target.buffer, 0, size);
        self.context.queue.submit([encoder.finish()]);
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        // Dropping keeps the buffer alive until in-flight submissions finish.
        if self.buffers.remove(&buffer.0).is_some() {
            self.bind_groups.clear();
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc<'_>) -> Result<TextureId, DeviceError> {
        let max_dimension = self.context.device.limits().max_texture_dimension_2d;
        if desc.width > max_dimension || desc.height > max_dimension {
            return Err(DeviceError::Backend(format!(
                "texture {} of {}x{} exceeds {}",
                desc.label, desc.width, desc.height, max_dimension
            )));
        }

        let format = texture_format(desc.format);
        self.context
            .device
            .push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let texture = self.context.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(desc.label),
            size: wgpu::Extent3d {
                width: desc.width.max(1),
                height: desc.height.max(1),
                depth_or_array_layers: desc.layers.max(1),
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: texture_usages(desc.usage),
            view_formats: &[],
        });
        if pollster::block_on(self.context.device.pop_error_scope()).is_some() {
            return Err(DeviceError::OutOfMemory {
                requested: desc.width as u64
                    * desc.height as u64
                    * desc.layers.max(1) as u64
                    * desc.format.bytes_per_texel() as u64,
            });
        }

        let view = if desc.format.is_depth() {
            texture.create_view(&wgpu::TextureViewDescriptor {
                label: Some(desc.label),
                dimension: Some(wgpu::TextureViewDimension::D2Array),
                aspect: wgpu::TextureAspect::DepthOnly,
                ..Default::default()
            })
        } else {
            texture.create_view(&wgpu::TextureViewDescriptor {
                label: Some(desc.label),
                dimension: Some(wgpu::TextureViewDimension::D2),
                base_array_layer: 0,
                array_layer_count: Some(1),
                ..Default::default()
            })
        };

        let id = self.allocate_id();
        self.textures.insert(
            id,
            TextureEntry {
                texture,
                view,
                format: desc.format,
                width: desc.width.max(1),
                height: desc.height.max(1),
            },
        );
        Ok(TextureId(id))
    }

    fn write_texture(&mut self, texture: TextureId, data: &[u8]) -> Result<(), DeviceError> {
        let entry = self
            .textures
            .get(&texture.0)
            .ok_or_else(|| invalid("texture", texture.0))?;
        if entry.format.is_depth() {
            return Err(DeviceError::Backend("depth textures cannot be written".into()));
        }
        let row_bytes = entry.width * entry.format.bytes_per_texel();
        let expected = row_bytes as usize * entry.height as usize;
        if data.len() < expected {
            return Err(DeviceError::Backend(format!(
                "texture upload of {} bytes, {} needed",
                data.len(),
                expected
            )));
        }

        self.context.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &entry.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &data[..expected],
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(row_bytes),
                rows_per_image: Some(entry.height),
            },
            wgpu::Extent3d {
                width: entry.width,
                height: entry.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        if self.textures.remove(&texture.0).is_some() {
            self.bind_groups.clear();
        }
    }

    fn create_framebuffer(
        &mut self,
        desc: &FramebufferDesc<'_>,
    ) -> Result<FramebufferId, DeviceError> {
        let attachment_view = |textures: &HashMap<u32, TextureEntry>, attachment: &Attachment| {
            let entry = textures
                .get(&attachment.texture.0)
                .ok_or_else(|| invalid("texture", attachment.texture.0))?;
            let view = entry.texture.create_view(&wgpu::TextureViewDescriptor {
                label: Some(desc.label),
                dimension: Some(wgpu::TextureViewDimension::D2),
                base_array_layer: attachment.layer,
                array_layer_count: Some(1),
                ..Default::default()
            });
            Ok::<_, DeviceError>((view, texture_format(entry.format)))
        };

        let mut colors = Vec::with_capacity(desc.colors.len());
        let mut color_formats = Vec::with_capacity(desc.colors.len());
        for attachment in desc.colors {
            let (view, format) = attachment_view(&self.textures, attachment)?;
            colors.push(view);
            color_formats.push(format);
        }
        let depth = desc
            .depth
            .as_ref()
            .map(|attachment| attachment_view(&self.textures, attachment))
            .transpose()?;

        let id = self.allocate_id();
        self.framebuffers.insert(
            id,
            FramebufferEntry {
                colors,
                color_formats,
                depth,
            },
        );
        Ok(FramebufferId(id))
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferId) {
        self.framebuffers.remove(&framebuffer.0);
    }

    fn create_geometry(&mut self, desc: &GeometryDesc<'_>) -> Result<GeometryId, DeviceError> {
        let vertices =
            self.context
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some(desc.label),
                    contents: bytemuck::cast_slice(desc.vertices),
                    usage: wgpu::BufferUsages::VERTEX,
                });
        let indices =
            self.context
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some(desc.label),
                    contents: bytemuck::cast_slice(desc.indices),
                    usage: wgpu::BufferUsages::INDEX,
                });

        let id = self.allocate_id();
        self.geometries.insert(
            id,
            GeometryEntry {
                vertices,
                indices,
                index_count: desc.indices.len() as u32,
            },
        );
        Ok(GeometryId(id))
    }

    fn destroy_geometry(&mut self, geometry: GeometryId) {
        self.geometries.remove(&geometry.0);
    }

    fn create_program(&mut self, desc: &ProgramDesc) -> Result<ProgramId, DeviceError> {
        let label = program_label(desc);
        let device = &self.context.device;

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&label),
            source: wgpu::ShaderSource::Wgsl(shader_source(desc).into()),
        });
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(&label),
            bind_group_layouts: &self.layouts.for_program(desc),
            push_constant_ranges: &[],
        });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            log::error!("Program {} failed to compile: {}", label, err);
            return Err(DeviceError::Backend(format!("program {label}: {err}")));
        }

        let id = self.allocate_id();
        log::debug!("Created program {} ({})", label, id);
        self.programs.insert(
            id,
            ProgramEntry {
                desc: *desc,
                label,
                module,
                layout,
            },
        );
        Ok(ProgramId(id))
    }

    fn destroy_program(&mut self, program: ProgramId) {
        self.programs.remove(&program.0);
        self.pipelines.retain(|key, _| key.program != program);
    }

    fn begin_pass(&mut self, desc: &PassDesc<'_>) -> Result<(), DeviceError> {
        if let Some(open) = &self.pass {
            return Err(DeviceError::PassAlreadyOpen(open.label.clone()));
        }
        let framebuffer = self
            .framebuffers
            .get(&desc.framebuffer.0)
            .ok_or_else(|| invalid("framebuffer", desc.framebuffer.0))?;

        let color_load = match desc.clear_color {
            Some([r, g, b, a]) => wgpu::LoadOp::Clear(wgpu::Color {
                r: r as f64,
                g: g as f64,
                b: b as f64,
                a: a as f64,
            }),
            None => wgpu::LoadOp::Load,
        };
        let depth_load = match desc.clear_depth {
            Some(depth) => wgpu::LoadOp::Clear(depth),
            None => wgpu::LoadOp::Load,
        };
        let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment<'_>>> = framebuffer
            .colors
            .iter()
            .map(|view| {
                Some(wgpu::RenderPassColorAttachment {
                    view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: color_load,
                        store: wgpu::StoreOp::Store,
                    },
                })
            })
            .collect();
        let depth_stencil_attachment =
            framebuffer
                .depth
                .as_ref()
                .map(|(view, _)| wgpu::RenderPassDepthStencilAttachment {
                    view,
                    depth_ops: Some(wgpu::Operations {
                        load: depth_load,
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                });

        let device = &self.context.device;
        let encoder = self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("FrameEncoder"),
            })
        });
        let pass = encoder
            .begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(desc.label),
                color_attachments: &color_attachments,
                depth_stencil_attachment,
                timestamp_writes: None,
                occlusion_query_set: None,
            })
            .forget_lifetime();

        self.pass = Some(OpenPass {
            label: desc.label.to_string(),
            pass,
            color_formats: framebuffer.color_formats.clone(),
            depth_format: framebuffer.depth.as_ref().map(|(_, format)| *format),
            program: BoundProgram::None,
        });
        Ok(())
    }

    fn set_program(&mut self, program: ProgramId, state: RenderState) {
        let Some(open) = &self.pass else {
            log::warn!("set_program outside of a render pass");
            return;
        };
        let key = PipelineKey {
            program,
            state,
            colors: open.color_formats.clone(),
            depth: open.depth_format,
        };

        let pipeline = match self.pipelines.get(&key) {
            Some(pipeline) => pipeline.clone(),
            None => match self.build_pipeline(&key) {
                Ok(pipeline) => {
                    self.pipelines.insert(key, pipeline.clone());
                    pipeline
                }
                Err(err) => {
                    log::warn!("Skipping program {:?}: {}", program, err);
                    if let Some(open) = self.pass.as_mut() {
                        open.program = BoundProgram::Failed(program);
                    }
                    return;
                }
            },
        };
        if let Some(open) = self.pass.as_mut() {
            open.pass.set_pipeline(&pipeline);
            open.program = BoundProgram::Ready(program);
        }
    }

    fn set_bind_group(&mut self, group: &BindGroup) {
        if self.pass.is_none() {
            log::warn!("set_bind_group outside of a render pass");
            return;
        }
        let bind_group = match self.bind_groups.get(group) {
            Some(bind_group) => bind_group.clone(),
            None => match self.create_bind_group(group) {
                Ok(bind_group) => {
                    self.bind_groups.insert(*group, bind_group.clone());
                    bind_group
                }
                Err(err) => {
                    log::warn!("Skipping bind group {:?}: {}", group, err);
                    return;
                }
            },
        };
        if let Some(open) = self.pass.as_mut() {
            open.pass.set_bind_group(group.slot(), &bind_group, &[]);
        }
    }

    fn draw_geometry(&mut self, geometry: GeometryId, instances: Range<u32>) {
        let (Some(open), Some(entry)) = (self.pass.as_mut(), self.geometries.get(&geometry.0))
        else {
            log::warn!("Dropping draw of geometry {:?}", geometry);
            return;
        };
        if entry.index_count == 0 || instances.is_empty() || !open.drawable() {
            return;
        }
        open.pass.set_vertex_buffer(0, entry.vertices.slice(..));
        open.pass
            .set_index_buffer(entry.indices.slice(..), wgpu::IndexFormat::Uint32);
        open.pass.draw_indexed(0..entry.index_count, 0, instances);
    }

    fn draw_fullscreen(&mut self) {
        match self.pass.as_mut() {
            Some(open) => {
                if open.drawable() {
                    open.pass.draw(0..3, 0..1);
                }
            }
            None => log::warn!("draw_fullscreen outside of a render pass"),
        }
    }

    fn end_pass(&mut self) -> Result<(), DeviceError> {
        // Dropping the pass ends it on the encoder.
        self.pass.take().map(drop).ok_or(DeviceError::NoOpenPass)
    }

    fn submit(&mut self) -> GpuFence {
        if let Some(open) = self.pass.take() {
            log::warn!("Submitting with pass {} still open", open.label);
        }
        self.next_submission += 1;
        let fence = GpuFence::new(self.next_submission);

        let command_buffers: Vec<wgpu::CommandBuffer> =
            self.encoder.take().map(|encoder| encoder.finish()).into_iter().collect();
        self.context.queue.submit(command_buffers);

        let signal = fence.clone();
        self.context
            .queue
            .on_submitted_work_done(move || signal.signal());
        fence
    }

    fn poll(&mut self) {
        if let Err(err) = self.context.device.poll(wgpu::PollType::Poll) {
            log::warn!("Device poll failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::material::MaterialKind;

    #[test]
    fn surface_sources_carry_variant_constants() {
        let source = shader_source(&ProgramDesc::Surface {
            kind: MaterialKind::BlinnPhongTextured,
            features: ShaderFeatures::DOUBLE_SIDED,
        });
        assert!(source.starts_with("const MATERIAL_KIND: u32 = 2u;"));
        assert!(source.contains("const PARAM_VEC4S: u32 = 3u;"));
        assert!(source.contains("const DOUBLE_SIDED: bool = true;"));
        assert!(source.contains("struct Globals"));

        let post = shader_source(&ProgramDesc::PostProcess);
        assert!(!post.contains("MATERIAL_KIND: u32 ="));
    }

    #[test]
    fn program_labels_name_the_variant() {
        assert_eq!(
            program_label(&ProgramDesc::Surface {
                kind: MaterialKind::Flat,
                features: ShaderFeatures::DOUBLE_SIDED,
            }),
            "SurfaceFlatDoubleSided"
        );
        assert_eq!(program_label(&ProgramDesc::Ssao), "Ssao");
    }

    #[test]
    fn only_a_successfully_bound_program_draws() {
        let program = ProgramId(7);
        assert!(!BoundProgram::default().can_draw());
        assert!(BoundProgram::Ready(program).can_draw());
        assert!(!BoundProgram::Failed(program).can_draw());
    }

    #[test]
    fn usages_map_to_wgpu_flags() {
        let usages = texture_usages(TextureUsage::RENDER_TARGET | TextureUsage::SAMPLED);
        assert_eq!(
            usages,
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING
        );
    }

    #[test]
    #[ignore] // Requires a GPU adapter
    fn every_program_compiles() {
        let mut device = WgpuDevice::headless().expect("adapter");
        let mut materials = crate::renderer::material::MaterialRegistry::new();
        let context =
            crate::renderer::context::RenderContext::create(&mut device, &mut materials)
                .expect("programs compile");
        context.destroy(&mut device, &mut materials);
    }

    #[test]
    #[ignore]
    fn texture_round_trips_through_readback() {
        let mut device = WgpuDevice::headless().expect("adapter");
        let texture = device
            .create_texture(&TextureDesc {
                label: "Readback",
                width: 3,
                height: 2,
                layers: 1,
                format: TextureFormat::Rgba8Unorm,
                usage: TextureUsage::COPY_DST | TextureUsage::COPY_SRC,
            })
            .unwrap();
        let texels: Vec<u8> = (0..24).collect();
        device.write_texture(texture, &texels).unwrap();
        let read = device.read_texture(texture, Duration::from_secs(5)).unwrap();
        assert_eq!(read, texels);
    }
}
