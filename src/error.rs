use std::time::Duration;

use thiserror::Error;

use crate::renderer::material::MaterialKind;

/// Failures reported by a [`RenderDevice`](crate::renderer::device::RenderDevice)
/// implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device allocation of {requested} bytes failed")]
    OutOfMemory { requested: u64 },
    #[error("invalid {kind} handle {index}")]
    InvalidHandle { kind: &'static str, index: u32 },
    #[error("a render pass is already open ({0})")]
    PassAlreadyOpen(String),
    #[error("no render pass is open")]
    NoOpenPass,
    #[error("backend error: {0}")]
    Backend(String),
}

/// Error taxonomy of the frame renderer.
///
/// Resource- and parameter-level problems are normally absorbed where they
/// happen (a warning plus a fallback resource); the variants that reach the
/// caller from [`Renderer::render`](crate::renderer::Renderer::render) abort the
/// current frame only.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RenderError {
    #[error("resource missing: {0}")]
    ResourceMissing(String),
    #[error("material buffer for {kind:?} exhausted at {capacity} entries")]
    BufferExhausted { kind: MaterialKind, capacity: u32 },
    #[error("fence for frame {frame} did not signal within {timeout:?}")]
    SyncTimeout { frame: u64, timeout: Duration },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("renderer used before setup")]
    NotSetUp,
    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl RenderError {
    /// Returns true when the error aborts the remaining passes of the current
    /// frame rather than being recovered locally.
    pub fn is_frame_fatal(&self) -> bool {
        !matches!(self, Self::ResourceMissing(_))
    }
}

pub type RenderResult<T> = Result<T, RenderError>;
