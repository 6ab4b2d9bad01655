//! Read-only frame input: what to draw, how it is lit and where it is seen from.

pub mod light;
pub mod view;

pub use light::{Light, LightKind, ShadowQuality};
pub use view::{RenderView, Viewport};

use glam::Mat4;

use crate::asset::{Geometry, Handle, Texture};
use crate::renderer::material::MaterialId;

/// One placement of a geometry with a material.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshInstance {
    pub geometry: Handle<Geometry>,
    pub material: MaterialId,
    pub transform: Mat4,
    pub double_sided: bool,
}

impl MeshInstance {
    pub fn new(geometry: Handle<Geometry>, material: MaterialId, transform: Mat4) -> Self {
        Self {
            geometry,
            material,
            transform,
            double_sided: false,
        }
    }

    pub fn double_sided(mut self) -> Self {
        self.double_sided = true;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RenderScene {
    instances: Vec<MeshInstance>,
    lights: Vec<Light>,
    skybox: Option<Handle<Texture>>,
}

impl RenderScene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_instance(&mut self, instance: MeshInstance) -> usize {
        self.instances.push(instance);
        self.instances.len() - 1
    }

    pub fn add_light(&mut self, light: Light) -> usize {
        self.lights.push(light);
        self.lights.len() - 1
    }

    pub fn set_skybox(&mut self, skybox: Option<Handle<Texture>>) {
        self.skybox = skybox;
    }

    pub fn instances(&self) -> &[MeshInstance] {
        &self.instances
    }

    pub fn instances_mut(&mut self) -> &mut [MeshInstance] {
        &mut self.instances
    }

    pub fn lights(&self) -> &[Light] {
        &self.lights
    }

    pub fn lights_mut(&mut self) -> &mut [Light] {
        &mut self.lights
    }

    pub fn skybox(&self) -> Option<Handle<Texture>> {
        self.skybox
    }

    pub fn clear(&mut self) {
        self.instances.clear();
        self.lights.clear();
        self.skybox = None;
    }
}
