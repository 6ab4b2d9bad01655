pub mod batch;
pub mod context;
pub mod device;
pub mod fence;
pub mod frames;
pub mod gpu;
pub mod headless;
pub mod lighting;
pub mod material;
pub mod material_buffers;
pub mod pipeline_builder;
pub mod postprocess;
pub mod prepass;
#[allow(clippy::module_inception)]
pub mod renderer;
pub mod shadows;
pub mod ssao;
pub mod targets;
pub mod uniforms;
pub mod vertex;
pub mod wgpu_device;

pub use context::{Fallbacks, RenderContext, ShaderRegistry};
pub use device::{
    BindGroup, BufferId, FramebufferId, GeometryDesc, GeometryId, ProgramId, RenderDevice,
    RenderState, TextureDesc, TextureFormat, TextureId, TextureUsage,
};
pub use fence::GpuFence;
pub use gpu::GpuContext;
pub use headless::{Command, FenceMode, HeadlessDevice};
pub use material::{Material, MaterialId, MaterialKind};
pub use renderer::{Renderer, RendererStats};
pub use vertex::Vertex;
pub use wgpu_device::WgpuDevice;
