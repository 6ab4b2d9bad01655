//! Groups scene instances into draw batches sharing program, geometry and
//! material kind.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use crate::asset::{Assets, Geometry, Handle};
use crate::error::{RenderError, RenderResult};
use crate::renderer::context::RenderContext;
use crate::renderer::device::{
    BufferSlice, GeometryId, ProgramId, RenderDevice, ShaderFeatures, TextureId,
};
use crate::renderer::material::{MaterialId, MaterialKind, MaterialRegistry};
use crate::renderer::material_buffers::MaterialBufferManager;
use crate::renderer::uniforms::{ActorData, InstanceData};
use crate::scene::RenderScene;

/// Identity of a batch. Ordering is the draw order of batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchKey {
    pub program: ProgramId,
    pub geometry: Handle<Geometry>,
    pub material_kind: MaterialKind,
}

/// Contiguous instances of a batch that sample the same textures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureRun {
    /// Absolute instance indices, ready to pass to a draw.
    pub instances: Range<u32>,
    pub diffuse: TextureId,
    pub specular: TextureId,
}

#[derive(Debug, Clone)]
pub struct MeshBatch {
    pub key: BatchKey,
    pub geometry: GeometryId,
    pub program: ProgramId,
    /// Parameter buffer of the batch's material kind.
    pub material_buffer: BufferSlice,
    pub first_instance: u32,
    /// Material of every instance in draw order.
    pub materials: Vec<MaterialId>,
    pub texture_runs: Vec<TextureRun>,
}

impl MeshBatch {
    pub fn instance_count(&self) -> u32 {
        self.materials.len() as u32
    }

    pub fn instances(&self) -> Range<u32> {
        self.first_instance..self.first_instance + self.instance_count()
    }
}

/// Frame-local draw data built from a [`RenderScene`].
#[derive(Debug, Default)]
pub struct PreparedFrame {
    pub batches: Vec<MeshBatch>,
    pub actors: Vec<ActorData>,
    pub instances: Vec<InstanceData>,
    /// Instances dropped because their geometry is gone.
    pub skipped_instances: u32,
    /// Material or texture references replaced by a fallback.
    pub substituted_resources: u32,
}

impl PreparedFrame {
    pub fn instance_count(&self) -> u32 {
        self.instances.len() as u32
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingInstance {
    actor: u32,
    material: MaterialId,
    textures: (TextureId, TextureId),
}

#[derive(Default)]
pub struct MeshBatcher {
    groups: BTreeMap<BatchKey, Vec<PendingInstance>>,
}

impl MeshBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds this frame's batches. Every material referenced by the scene
    /// ends up with a slot in its kind's buffer holding current parameters.
    ///
    /// Missing geometry skips the instance; missing materials and textures are
    /// replaced by the context fallbacks. A kind without a registered buffer
    /// is a configuration error and exhausted buffers abort the frame.
    pub fn prepare(
        &mut self,
        device: &mut dyn RenderDevice,
        context: &RenderContext,
        assets: &Assets,
        scene: &RenderScene,
        materials: &mut MaterialRegistry,
        buffers: &mut MaterialBufferManager,
    ) -> RenderResult<PreparedFrame> {
        self.groups.clear();
        let mut frame = PreparedFrame::default();
        let fallbacks = &context.fallbacks;

        for (actor, instance) in scene.instances().iter().enumerate() {
            if assets.geometries.get(instance.geometry).is_none() {
                log::warn!(
                    "Skipping instance {}: geometry {:?} is not loaded",
                    actor,
                    instance.geometry
                );
                frame.skipped_instances += 1;
                continue;
            }

            let material_id = if materials.get(instance.material).is_some() {
                instance.material
            } else {
                log::warn!(
                    "Instance {} uses missing material {:?}, using fallback",
                    actor,
                    instance.material
                );
                frame.substituted_resources += 1;
                fallbacks.material
            };
            let Some(material) = materials.get(material_id).map(|m| m.material) else {
                return Err(RenderError::Configuration("fallback material was destroyed".into()));
            };

            let kind = material.kind();
            if !buffers.is_registered(kind) {
                return Err(RenderError::Configuration(format!(
                    "no material buffer registered for {}",
                    kind.label()
                )));
            }

            let features = if instance.double_sided {
                ShaderFeatures::DOUBLE_SIDED
            } else {
                ShaderFeatures::empty()
            };
            let program = context.shaders.surface(kind, features)?;

            let [diffuse, specular] = material.texture_maps();
            let mut resolve = |handle, name: &str| match assets.ready_texture(handle) {
                Some(texture) => texture,
                None => {
                    if kind == MaterialKind::BlinnPhongTextured {
                        log::warn!(
                            "Instance {} {} map {:?} is missing, using fallback",
                            actor,
                            name,
                            handle
                        );
                        frame.substituted_resources += 1;
                    }
                    fallbacks.white
                }
            };
            // Textured materials without a specular map read the white fallback.
            let textures = (
                resolve(diffuse, "diffuse"),
                match specular {
                    Some(_) => resolve(specular, "specular"),
                    None => fallbacks.white,
                },
            );

            let key = BatchKey {
                program,
                geometry: instance.geometry,
                material_kind: kind,
            };
            self.groups.entry(key).or_default().push(PendingInstance {
                actor: actor as u32,
                material: material_id,
                textures,
            });
        }

        assign_slots(device, &self.groups, materials, buffers)?;

        frame.actors = scene
            .instances()
            .iter()
            .map(|instance| ActorData::new(instance.transform))
            .collect();

        for (key, group) in self.groups.iter_mut() {
            let Some(geometry) = assets.geometries.get(key.geometry) else {
                continue;
            };
            let material_buffer = buffers.binding(key.material_kind).ok_or_else(|| {
                RenderError::Configuration(format!(
                    "no material buffer registered for {}",
                    key.material_kind.label()
                ))
            })?;

            // Stable, so instances keep scene order within a texture set.
            group.sort_by_key(|pending| pending.textures);

            let first_instance = frame.instances.len() as u32;
            let mut texture_runs: Vec<TextureRun> = Vec::new();
            let mut batch_materials = Vec::with_capacity(group.len());

            for pending in group.iter() {
                let slot = materials
                    .get(pending.material)
                    .and_then(|instance| instance.slot)
                    .ok_or_else(|| {
                        RenderError::Configuration(format!(
                            "material {:?} has no buffer slot",
                            pending.material
                        ))
                    })?;
                let index = frame.instances.len() as u32;
                frame.instances.push(InstanceData::new(pending.actor, slot));
                batch_materials.push(pending.material);

                let (diffuse, specular) = pending.textures;
                match texture_runs.last_mut() {
                    Some(run) if run.diffuse == diffuse && run.specular == specular => {
                        run.instances.end = index + 1;
                    }
                    _ => texture_runs.push(TextureRun {
                        instances: index..index + 1,
                        diffuse,
                        specular,
                    }),
                }
            }

            frame.batches.push(MeshBatch {
                key: *key,
                geometry: geometry.id,
                program: key.program,
                material_buffer,
                first_instance,
                materials: batch_materials,
                texture_runs,
            });
        }

        buffers.flush(device)?;
        log::debug!(
            "Prepared {} batches, {} instances",
            frame.batches.len(),
            frame.instances.len()
        );
        Ok(frame)
    }
}

/// Gives every referenced material a slot and writes stale parameters.
fn assign_slots(
    device: &mut dyn RenderDevice,
    groups: &BTreeMap<BatchKey, Vec<PendingInstance>>,
    materials: &mut MaterialRegistry,
    buffers: &mut MaterialBufferManager,
) -> RenderResult<()> {
    let mut seen = BTreeSet::new();
    for pending in groups.values().flatten() {
        if !seen.insert(pending.material) {
            continue;
        }
        let Some(instance) = materials.get_mut(pending.material) else {
            continue;
        };

        let slot = match instance.slot {
            Some(slot) => slot,
            None => {
                let slot = buffers.allocate(device, instance.material.kind())?;
                instance.slot = Some(slot);
                instance.dirty = true;
                slot
            }
        };
        if instance.dirty {
            buffers.write(slot, &instance.material)?;
            instance.dirty = false;
        }
    }
    Ok(())
}
