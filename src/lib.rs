//! Frame rendering core: batches mesh instances by material, keeps
//! per-material parameter buffers, renders shadow maps, SSAO, lighting and
//! post-processing through a [`RenderDevice`](renderer::RenderDevice), and
//! paces frames in flight against GPU fences.

pub mod asset;
pub mod error;
pub mod renderer;
pub mod scene;
pub mod settings;

pub use asset::{Assets, Geometry, Handle, Texture};
pub use error::{DeviceError, RenderError, RenderResult};
pub use renderer::{HeadlessDevice, Renderer, RendererStats, WgpuDevice};
pub use scene::{Light, LightKind, MeshInstance, RenderScene, RenderView, ShadowQuality, Viewport};
pub use settings::{DebugOverlays, RenderSettings};

/// Installs `env_logger` at `info` level. Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .try_init();
}
