//! Resource registry: geometry and textures that already live on the GPU.
//!
//! The renderer never loads anything from disk. Callers upload through the
//! device and register the resulting ids here; scenes refer to them by
//! [`Handle`].

pub mod cache;
pub mod handle;

pub use cache::AssetCache;
pub use handle::Handle;

use crate::renderer::device::{GeometryId, TextureId};

/// Vertex/index data uploaded to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub id: GeometryId,
    pub index_count: u32,
}

/// A sampled texture. `ready` is false while an upload is still streaming in;
/// such textures are treated like missing ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Texture {
    pub id: TextureId,
    pub width: u32,
    pub height: u32,
    pub ready: bool,
}

pub struct Assets {
    pub geometries: AssetCache<Geometry>,
    pub textures: AssetCache<Texture>,
}

impl Assets {
    pub fn new() -> Self {
        Self {
            geometries: AssetCache::new(),
            textures: AssetCache::new(),
        }
    }

    /// Resolves a texture handle to a device texture that is safe to sample.
    pub fn ready_texture(&self, handle: Option<Handle<Texture>>) -> Option<TextureId> {
        let texture = self.textures.get(handle?)?;
        texture.ready.then_some(texture.id)
    }
}

impl Default for Assets {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unready_and_null_textures_do_not_resolve() {
        let mut assets = Assets::new();
        let ready = assets.textures.insert(Texture {
            id: TextureId(1),
            width: 4,
            height: 4,
            ready: true,
        });
        let streaming = assets.textures.insert(Texture {
            id: TextureId(2),
            width: 4,
            height: 4,
            ready: false,
        });

        assert_eq!(assets.ready_texture(Some(ready)), Some(TextureId(1)));
        assert_eq!(assets.ready_texture(Some(streaming)), None);
        assert_eq!(assets.ready_texture(None), None);
    }
}
