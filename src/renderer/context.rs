use std::collections::BTreeMap;

use glam::Vec3;

use crate::error::{RenderError, RenderResult};
use crate::renderer::device::{
    ProgramDesc, ProgramId, RenderDevice, ShaderFeatures, TextureDesc, TextureFormat, TextureId,
    TextureUsage,
};
use crate::renderer::material::{Material, MaterialId, MaterialKind, MaterialRegistry};

/// Every program the pass sequence binds, created once per renderer.
pub struct ShaderRegistry {
    pub depth_prepass: ProgramId,
    pub shadow_depth: ProgramId,
    pub shadow_linear_depth: ProgramId,
    pub skybox: ProgramId,
    pub ssao: ProgramId,
    pub ssao_blur: ProgramId,
    pub post_process: ProgramId,
    surfaces: BTreeMap<(MaterialKind, ShaderFeatures), ProgramId>,
}

impl ShaderRegistry {
    pub fn create(device: &mut dyn RenderDevice) -> RenderResult<Self> {
        let mut surfaces = BTreeMap::new();
        for kind in MaterialKind::ALL {
            for features in [ShaderFeatures::empty(), ShaderFeatures::DOUBLE_SIDED] {
                let program = device.create_program(&ProgramDesc::Surface { kind, features })?;
                surfaces.insert((kind, features), program);
            }
        }

        Ok(Self {
            depth_prepass: device.create_program(&ProgramDesc::DepthPrepass)?,
            shadow_depth: device.create_program(&ProgramDesc::ShadowDepth)?,
            shadow_linear_depth: device.create_program(&ProgramDesc::ShadowLinearDepth)?,
            skybox: device.create_program(&ProgramDesc::Skybox)?,
            ssao: device.create_program(&ProgramDesc::Ssao)?,
            ssao_blur: device.create_program(&ProgramDesc::SsaoBlur)?,
            post_process: device.create_program(&ProgramDesc::PostProcess)?,
            surfaces,
        })
    }

    /// Surface program for a material kind and feature set.
    pub fn surface(&self, kind: MaterialKind, features: ShaderFeatures) -> RenderResult<ProgramId> {
        self.surfaces.get(&(kind, features)).copied().ok_or_else(|| {
            RenderError::Configuration(format!(
                "no surface program for {} with {:?}",
                kind.label(),
                features
            ))
        })
    }

    fn destroy(self, device: &mut dyn RenderDevice) {
        for program in [
            self.depth_prepass,
            self.shadow_depth,
            self.shadow_linear_depth,
            self.skybox,
            self.ssao,
            self.ssao_blur,
            self.post_process,
        ]
        .into_iter()
        .chain(self.surfaces.into_values())
        {
            device.destroy_program(program);
        }
    }
}

/// Reserved resources substituted for anything missing or not yet ready.
#[derive(Debug, Clone, Copy)]
pub struct Fallbacks {
    /// 1x1 white: missing diffuse/specular maps and "no occlusion".
    pub white: TextureId,
    /// 1x1 black: missing skybox.
    pub black: TextureId,
    /// 1x1 depth layer bound for lights without a shadow map.
    pub shadow: TextureId,
    /// Flat magenta, for instances whose material was destroyed.
    pub material: MaterialId,
}

impl Fallbacks {
    fn create(device: &mut dyn RenderDevice, materials: &mut MaterialRegistry) -> RenderResult<Self> {
        let white = solid_texture(device, "FallbackWhite", [255, 255, 255, 255])?;
        let black = solid_texture(device, "FallbackBlack", [0, 0, 0, 255])?;
        let shadow = device.create_texture(&TextureDesc {
            label: "FallbackShadow",
            width: 1,
            height: 1,
            layers: 1,
            format: TextureFormat::Depth32Float,
            usage: TextureUsage::SAMPLED | TextureUsage::RENDER_TARGET,
        })?;
        let material = materials.create(Material::flat(Vec3::new(1.0, 0.0, 1.0)));
        Ok(Self {
            white,
            black,
            shadow,
            material,
        })
    }

    fn destroy(self, device: &mut dyn RenderDevice, materials: &mut MaterialRegistry) {
        device.destroy_texture(self.white);
        device.destroy_texture(self.black);
        device.destroy_texture(self.shadow);
        materials.destroy(self.material);
    }
}

fn solid_texture(
    device: &mut dyn RenderDevice,
    label: &str,
    rgba: [u8; 4],
) -> RenderResult<TextureId> {
    let texture = device.create_texture(&TextureDesc {
        label,
        width: 1,
        height: 1,
        layers: 1,
        format: TextureFormat::Rgba8Unorm,
        usage: TextureUsage::SAMPLED | TextureUsage::COPY_DST,
    })?;
    device.write_texture(texture, &rgba)?;
    Ok(texture)
}

/// Renderer-wide state passed explicitly into setup and every frame.
pub struct RenderContext {
    pub shaders: ShaderRegistry,
    pub fallbacks: Fallbacks,
}

impl RenderContext {
    pub fn create(
        device: &mut dyn RenderDevice,
        materials: &mut MaterialRegistry,
    ) -> RenderResult<Self> {
        let shaders = ShaderRegistry::create(device)?;
        let fallbacks = Fallbacks::create(device, materials)?;
        log::info!("Render context ready");
        Ok(Self { shaders, fallbacks })
    }

    pub fn destroy(self, device: &mut dyn RenderDevice, materials: &mut MaterialRegistry) {
        self.shaders.destroy(device);
        self.fallbacks.destroy(device, materials);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::headless::HeadlessDevice;

    #[test]
    fn every_material_kind_has_surface_programs() {
        let mut device = HeadlessDevice::new();
        let mut materials = MaterialRegistry::new();
        let context = RenderContext::create(&mut device, &mut materials).unwrap();

        for kind in MaterialKind::ALL {
            let single = context.shaders.surface(kind, ShaderFeatures::empty()).unwrap();
            let double = context
                .shaders
                .surface(kind, ShaderFeatures::DOUBLE_SIDED)
                .unwrap();
            assert_ne!(single, double);
            assert_eq!(
                device.program_desc(single),
                Some(ProgramDesc::Surface {
                    kind,
                    features: ShaderFeatures::empty()
                })
            );
        }
        assert_eq!(
            device.texture_contents(context.fallbacks.white),
            Some(&[255u8, 255, 255, 255][..])
        );
        assert_eq!(materials.len(), 1);
    }
}
