// renderer/material.rs (Blinn-Phong variants)

use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};
use serde::{Deserialize, Serialize};

use crate::asset::{AssetCache, Handle, Texture};
use crate::error::{RenderError, RenderResult};

/// Type tag of a [`Material`]. Every kind has its own parameter block layout,
/// its own material data buffer and its own surface program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterialKind {
    Flat,
    BlinnPhongSolid,
    BlinnPhongTextured,
}

impl MaterialKind {
    pub const ALL: [MaterialKind; 3] = [
        MaterialKind::Flat,
        MaterialKind::BlinnPhongSolid,
        MaterialKind::BlinnPhongTextured,
    ];

    /// Size in bytes of one packed parameter block.
    pub const fn params_size(self) -> usize {
        match self {
            Self::Flat => std::mem::size_of::<FlatParams>(),
            Self::BlinnPhongSolid => std::mem::size_of::<BlinnPhongParams>(),
            Self::BlinnPhongTextured => std::mem::size_of::<TexturedParams>(),
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Flat => "Flat",
            Self::BlinnPhongSolid => "BlinnPhongSolid",
            Self::BlinnPhongTextured => "BlinnPhongTextured",
        }
    }

    /// Matches the `MATERIAL_KIND` constant the surface shader is built with.
    pub const fn shader_index(self) -> u32 {
        match self {
            Self::Flat => 0,
            Self::BlinnPhongSolid => 1,
            Self::BlinnPhongTextured => 2,
        }
    }
}

/// Slot layout of a material data buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterialParamsLayout {
    pub kind: MaterialKind,
    /// Bytes between consecutive slots.
    pub stride: u32,
}

impl MaterialParamsLayout {
    pub const fn packed(kind: MaterialKind) -> Self {
        Self {
            kind,
            stride: kind.params_size() as u32,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq)]
pub struct FlatParams {
    pub color: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq)]
pub struct BlinnPhongParams {
    pub diffuse: [f32; 4],
    pub specular_shininess: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq)]
pub struct TexturedParams {
    pub tint: [f32; 4],
    pub specular_shininess: [f32; 4],
    /// x: diffuse map present, y: specular map present.
    pub map_flags: [u32; 4],
}

/// Surface description of a mesh instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Material {
    Flat {
        color: Vec4,
    },
    BlinnPhongSolid {
        diffuse: Vec3,
        specular: Vec3,
        shininess: f32,
    },
    BlinnPhongTextured {
        diffuse_map: Option<Handle<Texture>>,
        specular_map: Option<Handle<Texture>>,
        tint: Vec3,
        shininess: f32,
    },
}

impl Material {
    pub fn flat(color: Vec3) -> Self {
        Self::Flat {
            color: color.extend(1.0),
        }
    }

    pub fn blinn_phong(diffuse: Vec3, specular: Vec3, shininess: f32) -> Self {
        Self::BlinnPhongSolid {
            diffuse,
            specular,
            shininess,
        }
    }

    pub fn textured(diffuse_map: Option<Handle<Texture>>, shininess: f32) -> Self {
        Self::BlinnPhongTextured {
            diffuse_map,
            specular_map: None,
            tint: Vec3::ONE,
            shininess,
        }
    }

    pub fn kind(&self) -> MaterialKind {
        match self {
            Self::Flat { .. } => MaterialKind::Flat,
            Self::BlinnPhongSolid { .. } => MaterialKind::BlinnPhongSolid,
            Self::BlinnPhongTextured { .. } => MaterialKind::BlinnPhongTextured,
        }
    }

    /// Untextured base color; textured materials multiply this with the map.
    pub fn base_color(&self) -> Vec3 {
        match *self {
            Self::Flat { color } => color.truncate(),
            Self::BlinnPhongSolid { diffuse, .. } => diffuse,
            Self::BlinnPhongTextured { tint, .. } => tint,
        }
    }

    /// Diffuse and specular maps sampled by this material.
    pub fn texture_maps(&self) -> [Option<Handle<Texture>>; 2] {
        match *self {
            Self::BlinnPhongTextured {
                diffuse_map,
                specular_map,
                ..
            } => [diffuse_map, specular_map],
            _ => [None, None],
        }
    }

    /// Packs the parameter block of this material into `dst`, which must be at
    /// least [`MaterialKind::params_size`] bytes.
    pub fn write_parameters(&self, dst: &mut [u8]) -> RenderResult<()> {
        let size = self.kind().params_size();
        let Some(dst) = dst.get_mut(..size) else {
            return Err(RenderError::Configuration(format!(
                "{} parameter block needs {} bytes, slot has {}",
                self.kind().label(),
                size,
                dst.len()
            )));
        };

        match *self {
            Self::Flat { color } => {
                dst.copy_from_slice(bytemuck::bytes_of(&FlatParams {
                    color: color.to_array(),
                }));
            }
            Self::BlinnPhongSolid {
                diffuse,
                specular,
                shininess,
            } => {
                dst.copy_from_slice(bytemuck::bytes_of(&BlinnPhongParams {
                    diffuse: diffuse.extend(1.0).to_array(),
                    specular_shininess: specular.extend(shininess).to_array(),
                }));
            }
            Self::BlinnPhongTextured {
                diffuse_map,
                specular_map,
                tint,
                shininess,
            } => {
                dst.copy_from_slice(bytemuck::bytes_of(&TexturedParams {
                    tint: tint.extend(1.0).to_array(),
                    specular_shininess: Vec3::splat(0.5).extend(shininess).to_array(),
                    map_flags: [
                        diffuse_map.is_some() as u32,
                        specular_map.is_some() as u32,
                        0,
                        0,
                    ],
                }));
            }
        }
        Ok(())
    }
}

impl Default for Material {
    fn default() -> Self {
        Self::flat(Vec3::ONE)
    }
}

/// A live material and the data-buffer slot it currently owns.
#[derive(Debug, Clone, Copy)]
pub struct MaterialInstance {
    pub material: Material,
    pub slot: Option<u32>,
    /// Parameters changed since they were last written into the slot.
    pub dirty: bool,
}

pub type MaterialId = Handle<MaterialInstance>;

/// Owner of all material instances referenced by scenes.
#[derive(Default)]
pub struct MaterialRegistry {
    instances: AssetCache<MaterialInstance>,
}

impl MaterialRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, material: Material) -> MaterialId {
        self.instances.insert(MaterialInstance {
            material,
            slot: None,
            dirty: true,
        })
    }

    /// Replaces the parameters of `id`. When the kind changes the old slot is
    /// returned so the caller can release it.
    pub fn update(
        &mut self,
        id: MaterialId,
        material: Material,
    ) -> RenderResult<Option<(MaterialKind, u32)>> {
        let instance = self
            .instances
            .get_mut(id)
            .ok_or_else(|| RenderError::ResourceMissing(format!("material {id:?}")))?;

        let previous_kind = instance.material.kind();
        instance.material = material;
        instance.dirty = true;

        if previous_kind != material.kind() {
            return Ok(instance.slot.take().map(|slot| (previous_kind, slot)));
        }
        Ok(None)
    }

    /// Removes `id`, returning the slot it held.
    pub fn destroy(&mut self, id: MaterialId) -> Option<(MaterialKind, u32)> {
        let instance = self.instances.remove(id)?;
        instance.slot.map(|slot| (instance.material.kind(), slot))
    }

    /// Forgets every slot assignment, for when the material buffers are
    /// recreated. Parameters are rewritten on next use.
    pub fn clear_slots(&mut self) {
        for instance in self.instances.iter_mut() {
            instance.slot = None;
            instance.dirty = true;
        }
    }

    pub fn get(&self, id: MaterialId) -> Option<&MaterialInstance> {
        self.instances.get(id)
    }

    pub fn get_mut(&mut self, id: MaterialId) -> Option<&mut MaterialInstance> {
        self.instances.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
