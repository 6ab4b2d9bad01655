//! Device primitives consumed by the frame renderer.
//!
//! The renderer only ever talks to the GPU through [`RenderDevice`]. Objects
//! are referenced by small `Copy` ids owned by the device, never by pointer,
//! so nothing the renderer holds can dangle across a frame boundary.

use std::ops::Range;

use bitflags::bitflags;

use crate::error::DeviceError;
use crate::renderer::fence::GpuFence;
use crate::renderer::material::MaterialKind;
use crate::renderer::vertex::Vertex;

macro_rules! device_id {
    ($($name:ident),* $(,)?) => {
        $(
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u32);
        )*
    };
}

device_id!(BufferId, TextureId, FramebufferId, ProgramId, GeometryId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    Uniform,
    Storage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    pub size: u64,
    pub usage: BufferUsage,
}

/// A bound range of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferSlice {
    pub buffer: BufferId,
    pub offset: u64,
    pub size: u64,
}

impl BufferSlice {
    pub fn whole(buffer: BufferId, size: u64) -> Self {
        Self {
            buffer,
            offset: 0,
            size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba16Float,
    Rgba32Float,
    R8Unorm,
    Depth32Float,
}

impl TextureFormat {
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            Self::R8Unorm => 1,
            Self::Rgba8Unorm | Self::Depth32Float => 4,
            Self::Rgba16Float => 8,
            Self::Rgba32Float => 16,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, Self::Depth32Float)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const RENDER_TARGET = 1 << 0;
        const SAMPLED = 1 << 1;
        const COPY_DST = 1 << 2;
        const COPY_SRC = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc<'a> {
    pub label: &'a str,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

/// One layer of a texture used as a render target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Attachment {
    pub texture: TextureId,
    pub layer: u32,
}

impl Attachment {
    pub fn new(texture: TextureId) -> Self {
        Self { texture, layer: 0 }
    }

    pub fn layer(texture: TextureId, layer: u32) -> Self {
        Self { texture, layer }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferDesc<'a> {
    pub label: &'a str,
    pub colors: &'a [Attachment],
    pub depth: Option<Attachment>,
}

pub struct GeometryDesc<'a> {
    pub label: &'a str,
    pub vertices: &'a [Vertex],
    pub indices: &'a [u32],
}

bitflags! {
    /// Surface shader variants that need a separate pipeline.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct ShaderFeatures: u32 {
        const DOUBLE_SIDED = 1 << 0;
    }
}

/// The closed set of GPU programs the pass sequence uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramDesc {
    /// Scene depth plus view-space normal and position targets.
    DepthPrepass,
    /// Depth-only render from a light-space matrix.
    ShadowDepth,
    /// Point light faces: distance to the light over its range, written as depth.
    ShadowLinearDepth,
    /// Material shading, used for the ambient term and each light contribution.
    Surface {
        kind: MaterialKind,
        features: ShaderFeatures,
    },
    Skybox,
    Ssao,
    SsaoBlur,
    PostProcess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Always,
    Less,
    LessEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendMode {
    Replace,
    Additive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderState {
    pub depth_compare: CompareOp,
    pub depth_write: bool,
    pub blend: BlendMode,
}

impl RenderState {
    pub const OPAQUE: Self = Self {
        depth_compare: CompareOp::Less,
        depth_write: true,
        blend: BlendMode::Replace,
    };

    /// Light contributions on top of the ambient term.
    pub const ADDITIVE: Self = Self {
        depth_compare: CompareOp::LessEqual,
        depth_write: false,
        blend: BlendMode::Additive,
    };

    /// Background drawn at the far plane behind opaque geometry.
    pub const SKYBOX: Self = Self {
        depth_compare: CompareOp::LessEqual,
        depth_write: false,
        blend: BlendMode::Replace,
    };

    pub const FULLSCREEN: Self = Self {
        depth_compare: CompareOp::Always,
        depth_write: false,
        blend: BlendMode::Replace,
    };
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassDesc<'a> {
    pub label: &'a str,
    pub framebuffer: FramebufferId,
    /// `None` keeps the previous contents.
    pub clear_color: Option<[f32; 4]>,
    pub clear_depth: Option<f32>,
}

/// Resources bound for the following draws. Each variant maps to one bind
/// group slot of the programs that consume it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindGroup {
    /// Group 0 for every program.
    Frame {
        globals: BufferSlice,
        actors: BufferSlice,
        instances: BufferSlice,
    },
    /// Group 1 of the shadow programs.
    ShadowView { view: BufferSlice },
    /// Group 1 of surface programs.
    Material {
        params: BufferSlice,
        diffuse: TextureId,
        specular: TextureId,
    },
    /// Group 2 of surface programs.
    Light {
        light: BufferSlice,
        shadow_map: TextureId,
        occlusion: TextureId,
    },
    /// Group 1 of the skybox program.
    Skybox { texture: TextureId },
    /// Group 1 of the fullscreen programs.
    Post {
        params: BufferSlice,
        inputs: [TextureId; 3],
    },
}

impl BindGroup {
    pub fn slot(&self) -> u32 {
        match self {
            Self::Frame { .. } => 0,
            Self::ShadowView { .. }
            | Self::Material { .. }
            | Self::Skybox { .. }
            | Self::Post { .. } => 1,
            Self::Light { .. } => 2,
        }
    }
}

/// Capability object over the graphics backend.
///
/// All commands are issued from one thread in program order; the only
/// concurrency is between the CPU recording and the GPU consuming what
/// [`submit`](RenderDevice::submit) hands over.
pub trait RenderDevice {
    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<BufferId, DeviceError>;
    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8])
        -> Result<(), DeviceError>;
    /// GPU-side copy, ordered with the passes recorded around it.
    fn copy_buffer(
        &mut self,
        src: BufferId,
        dst: BufferId,
        size: u64,
    ) -> Result<(), DeviceError>;
    fn destroy_buffer(&mut self, buffer: BufferId);

    fn create_texture(&mut self, desc: &TextureDesc<'_>) -> Result<TextureId, DeviceError>;
    /// Uploads the full first layer of `texture`.
    fn write_texture(&mut self, texture: TextureId, data: &[u8]) -> Result<(), DeviceError>;
    fn destroy_texture(&mut self, texture: TextureId);

    fn create_framebuffer(
        &mut self,
        desc: &FramebufferDesc<'_>,
    ) -> Result<FramebufferId, DeviceError>;
    fn destroy_framebuffer(&mut self, framebuffer: FramebufferId);

    fn create_geometry(&mut self, desc: &GeometryDesc<'_>) -> Result<GeometryId, DeviceError>;
    fn destroy_geometry(&mut self, geometry: GeometryId);

    fn create_program(&mut self, desc: &ProgramDesc) -> Result<ProgramId, DeviceError>;
    fn destroy_program(&mut self, program: ProgramId);

    fn begin_pass(&mut self, desc: &PassDesc<'_>) -> Result<(), DeviceError>;
    fn set_program(&mut self, program: ProgramId, state: RenderState);
    fn set_bind_group(&mut self, group: &BindGroup);
    fn draw_geometry(&mut self, geometry: GeometryId, instances: Range<u32>);
    fn draw_fullscreen(&mut self);
    fn end_pass(&mut self) -> Result<(), DeviceError>;

    /// Hands everything recorded so far to the GPU. The returned fence
    /// signals once the GPU has consumed it.
    fn submit(&mut self) -> GpuFence;
    /// Lets the backend make progress on completion callbacks.
    fn poll(&mut self);
}
