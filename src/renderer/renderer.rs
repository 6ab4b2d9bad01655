// renderer/renderer.rs
use std::mem::size_of;

use crate::asset::Assets;
use crate::error::{RenderError, RenderResult};
use crate::renderer::batch::{MeshBatcher, PreparedFrame};
use crate::renderer::context::RenderContext;
use crate::renderer::device::{BindGroup, BufferSlice, FramebufferId, RenderDevice, TextureId};
use crate::renderer::frames::FrameMultiplexer;
use crate::renderer::lighting::{light_uniform, record_lighting, LightBinding, LightingInputs};
use crate::renderer::material::{
    Material, MaterialId, MaterialKind, MaterialParamsLayout, MaterialRegistry,
};
use crate::renderer::material_buffers::MaterialBufferManager;
use crate::renderer::postprocess::record_post;
use crate::renderer::prepass::record_prepass;
use crate::renderer::shadows::{
    light_shadow_views, record_shadow_passes, ShadowMaps, ShadowPassViews,
};
use crate::renderer::ssao::{
    blur_uniforms, record_ssao, ssao_uniform, SsaoPassParams, SsaoResources,
};
use crate::renderer::targets::{ColorTarget, FrameTargets};
use crate::renderer::uniforms::{
    BlurUniform, GlobalsUniform, LightUniform, PostUniform, ShadowViewUniform, SsaoUniform,
};
use crate::scene::{RenderScene, RenderView};
use crate::settings::RenderSettings;

/// Counters of one rendered frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RendererStats {
    pub frame: u64,
    pub batch_count: u32,
    pub instance_count: u32,
    pub prepass_draw_calls: u32,
    pub shadow_passes: u32,
    pub shadow_draw_calls: u32,
    pub ssao_draw_calls: u32,
    pub lighting_draw_calls: u32,
    pub post_draw_calls: u32,
    /// Material buffers that had to grow while preparing the frame.
    pub material_buffer_growths: u32,
    pub substituted_resources: u32,
    pub skipped_instances: u32,
}

impl RendererStats {
    pub fn total_draw_calls(&self) -> u32 {
        self.prepass_draw_calls
            + self.shadow_draw_calls
            + self.ssao_draw_calls
            + self.lighting_draw_calls
            + self.post_draw_calls
    }
}

/// Device resources that exist between `setup` and `cleanup`.
struct RendererState {
    context: RenderContext,
    buffers: MaterialBufferManager,
    frames: FrameMultiplexer,
    targets: FrameTargets,
    shadow_maps: ShadowMaps,
    ssao: SsaoResources,
    batcher: MeshBatcher,
}

impl RendererState {
    fn create(
        device: &mut dyn RenderDevice,
        settings: &RenderSettings,
        context: RenderContext,
    ) -> Result<Self, (RenderContext, RenderError)> {
        let mut buffers =
            MaterialBufferManager::new(&settings.material_buffers, settings.fence_timeout());
        for kind in MaterialKind::ALL {
            let layout = MaterialParamsLayout::packed(kind);
            let capacity = settings.material_buffers.initial_capacity;
            if let Err(err) = buffers.register(device, layout, capacity) {
                buffers.destroy(device);
                return Err((context, err));
            }
        }

        let count = settings.frames_in_flight as usize;
        let mut frames = match FrameMultiplexer::new(device, count, settings.fence_timeout()) {
            Ok(frames) => frames,
            Err(err) => {
                buffers.destroy(device);
                return Err((context, err));
            }
        };
        let resolution = settings.resolution;
        let targets =
            match FrameTargets::create(device, resolution.width, resolution.height, count) {
                Ok(targets) => targets,
                Err(err) => {
                    frames.destroy(device);
                    buffers.destroy(device);
                    return Err((context, err));
                }
            };
        let ssao = match SsaoResources::create(device, &settings.ssao) {
            Ok(ssao) => ssao,
            Err(err) => {
                targets.destroy(device);
                frames.destroy(device);
                buffers.destroy(device);
                return Err((context, err));
            }
        };

        Ok(Self {
            context,
            buffers,
            frames,
            targets,
            shadow_maps: ShadowMaps::new(),
            ssao,
            batcher: MeshBatcher::new(),
        })
    }

    fn destroy(mut self, device: &mut dyn RenderDevice, materials: &mut MaterialRegistry) {
        self.shadow_maps.destroy(device);
        self.ssao.destroy(device);
        self.targets.destroy(device);
        self.frames.destroy(device);
        self.buffers.destroy(device);
        self.context.destroy(device, materials);
        materials.clear_slots();
    }

    /// Everything between `begin_frame` and submission. Errors leave the
    /// remaining passes unrecorded.
    #[allow(clippy::too_many_arguments)]
    fn record_frame(
        &mut self,
        device: &mut dyn RenderDevice,
        settings: &RenderSettings,
        materials: &mut MaterialRegistry,
        assets: &Assets,
        scene: &RenderScene,
        view: &RenderView,
        frame: u64,
    ) -> RenderResult<RendererStats> {
        self.shadow_maps
            .sync(device, scene.lights(), settings.shadow_map_size)?;
        let prepared = self.batcher.prepare(
            device,
            &self.context,
            assets,
            scene,
            materials,
            &mut self.buffers,
        )?;

        let mut stats = RendererStats {
            frame,
            batch_count: prepared.batches.len() as u32,
            instance_count: prepared.instance_count(),
            material_buffer_growths: self.buffers.take_growths(),
            substituted_resources: prepared.substituted_resources,
            skipped_instances: prepared.skipped_instances,
            ..RendererStats::default()
        };

        let uniforms = self.upload_frame(device, settings, &prepared, scene, view, frame)?;
        let context = &self.context;
        let frame_group = uniforms.frame_group;

        if settings.depth_prepass {
            stats.prepass_draw_calls =
                record_prepass(device, context, &frame_group, &prepared, &self.targets)?;
        }

        let shadows = record_shadow_passes(
            device,
            context,
            &frame_group,
            &prepared,
            &self.shadow_maps,
            &uniforms.shadow_views,
        )?;
        stats.shadow_passes = shadows.passes;
        stats.shadow_draw_calls = shadows.draw_calls;

        let occlusion = match uniforms.ssao {
            Some(params) => {
                stats.ssao_draw_calls = record_ssao(
                    device,
                    context,
                    &frame_group,
                    &self.ssao,
                    &self.targets,
                    &params,
                )?;
                self.targets.ao.texture
            }
            None => context.fallbacks.white,
        };

        let skybox = scene.skybox().map(|handle| {
            assets.ready_texture(Some(handle)).unwrap_or_else(|| {
                log::warn!("Skybox {:?} is not ready, using fallback", handle);
                stats.substituted_resources += 1;
                context.fallbacks.black
            })
        });
        stats.lighting_draw_calls = record_lighting(
            device,
            context,
            &frame_group,
            &prepared,
            &self.targets,
            &LightingInputs {
                ambient: uniforms.ambient,
                lights: &uniforms.lights,
                skybox,
                occlusion,
            },
        )?;

        let normals = settings.depth_prepass.then_some(self.targets.normals);
        stats.post_draw_calls = record_post(
            device,
            context,
            &frame_group,
            &self.targets,
            self.targets.result(frame),
            uniforms.post,
            occlusion,
            normals,
        )?;

        Ok(stats)
    }

    /// Writes the frame slot: globals, actor and instance data, then every
    /// uniform block the passes bind.
    fn upload_frame(
        &mut self,
        device: &mut dyn RenderDevice,
        settings: &RenderSettings,
        prepared: &PreparedFrame,
        scene: &RenderScene,
        view: &RenderView,
        frame: u64,
    ) -> RenderResult<FrameUniforms> {
        let slot = self.frames.slot_mut(frame);
        let globals = GlobalsUniform::new(view, settings, scene.lights().len() as u32);
        slot.globals.upload(device, bytemuck::bytes_of(&globals))?;
        slot.actors
            .upload(device, bytemuck::cast_slice(&prepared.actors))?;
        slot.instances
            .upload(device, bytemuck::cast_slice(&prepared.instances))?;

        let ambient = slot.lights.push(bytemuck::bytes_of(&LightUniform::ambient()));
        let mut lights = Vec::with_capacity(scene.lights().len());
        let mut shadow_layers = Vec::new();
        for (index, light) in scene.lights().iter().enumerate() {
            let target = self.shadow_maps.target(index);
            let views = target.map(|_| light_shadow_views(light, view));
            let map_size = target.map_or(0, |target| target.size);

            let uniform = light_uniform(light, views.as_ref(), map_size);
            let offset = slot.lights.push(bytemuck::bytes_of(&uniform));
            let shadow_map = target.map_or(self.context.fallbacks.shadow, |t| t.texture);
            lights.push((offset, shadow_map));

            if let Some(views) = views {
                let offsets: Vec<u64> = views
                    .matrices
                    .iter()
                    .map(|matrix| {
                        let block = ShadowViewUniform::new(*matrix, views.position, views.range);
                        slot.lights.push(bytemuck::bytes_of(&block))
                    })
                    .collect();
                shadow_layers.push((index, views.linear_depth, offsets));
            }
        }

        let ssao = settings.ssao_active().then(|| {
            let uniform = ssao_uniform(
                &settings.ssao,
                self.ssao.kernel(),
                self.targets.width,
                self.targets.height,
            );
            let ssao = slot.passes.push(bytemuck::bytes_of(&uniform));
            let blur = settings.ssao.blur.then(|| {
                blur_uniforms(self.targets.width, self.targets.height)
                    .map(|block| slot.passes.push(bytemuck::bytes_of(&block)))
            });
            (ssao, blur)
        });
        let post = PostUniform::new(settings.gamma, settings.debug_overlays);
        let post = slot.passes.push(bytemuck::bytes_of(&post));

        slot.lights.upload(device)?;
        slot.passes.upload(device)?;

        // Arena offsets turn into bindings only after the upload, which may
        // have replaced the buffers.
        let light_size = size_of::<LightUniform>() as u64;
        let view_size = size_of::<ShadowViewUniform>() as u64;
        let blur_size = size_of::<BlurUniform>() as u64;
        Ok(FrameUniforms {
            frame_group: BindGroup::Frame {
                globals: slot.globals.binding(),
                actors: slot.actors.binding(),
                instances: slot.instances.binding(),
            },
            ambient: slot.lights.slice(ambient, light_size),
            lights: lights
                .into_iter()
                .map(|(offset, shadow_map)| LightBinding {
                    light: slot.lights.slice(offset, light_size),
                    shadow_map,
                })
                .collect(),
            shadow_views: shadow_layers
                .into_iter()
                .map(|(light_index, linear_depth, offsets)| ShadowPassViews {
                    light_index,
                    linear_depth,
                    layers: offsets
                        .into_iter()
                        .map(|offset| slot.lights.slice(offset, view_size))
                        .collect(),
                })
                .collect(),
            ssao: ssao.map(|(ssao, blur)| SsaoPassParams {
                ssao: slot.passes.slice(ssao, size_of::<SsaoUniform>() as u64),
                blur: blur
                    .map(|offsets| offsets.map(|offset| slot.passes.slice(offset, blur_size))),
            }),
            post: slot
                .passes
                .slice(post, size_of::<PostUniform>() as u64),
        })
    }
}

struct FrameUniforms {
    frame_group: BindGroup,
    ambient: BufferSlice,
    lights: Vec<LightBinding>,
    shadow_views: Vec<ShadowPassViews>,
    ssao: Option<SsaoPassParams>,
    post: BufferSlice,
}

/// Turns a [`RenderScene`] seen through a [`RenderView`] into a finished
/// frame: depth prepass, shadow maps, ambient occlusion, lighting and post,
/// all in one submission.
pub struct Renderer {
    settings: RenderSettings,
    materials: MaterialRegistry,
    state: Option<RendererState>,
    frame_count: u64,
    /// The two most recent frames that completed every pass, newest first.
    completed: [Option<u64>; 2],
    last_stats: Option<RendererStats>,
}

impl Renderer {
    pub fn new(settings: RenderSettings) -> Self {
        Self {
            settings: settings.validate(),
            materials: MaterialRegistry::new(),
            state: None,
            frame_count: 0,
            completed: [None, None],
            last_stats: None,
        }
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    pub fn is_set_up(&self) -> bool {
        self.state.is_some()
    }

    /// Number of frames submitted so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn last_frame_stats(&self) -> Option<RendererStats> {
        self.last_stats
    }

    pub fn context(&self) -> Option<&RenderContext> {
        self.state.as_ref().map(|state| &state.context)
    }

    pub fn material_buffers(&self) -> Option<&MaterialBufferManager> {
        self.state.as_ref().map(|state| &state.buffers)
    }

    pub fn materials(&self) -> &MaterialRegistry {
        &self.materials
    }

    /// Acquires every device resource the pass sequence needs.
    pub fn setup(&mut self, device: &mut dyn RenderDevice) -> RenderResult<()> {
        if self.state.is_some() {
            log::warn!("Renderer is already set up");
            return Ok(());
        }

        let context = RenderContext::create(device, &mut self.materials)?;
        match RendererState::create(device, &self.settings, context) {
            Ok(state) => {
                self.state = Some(state);
                log::info!(
                    "Renderer set up: {}x{}, {} frames in flight",
                    self.settings.resolution.width,
                    self.settings.resolution.height,
                    self.settings.frames_in_flight
                );
                Ok(())
            }
            Err((context, err)) => {
                context.destroy(device, &mut self.materials);
                Err(err)
            }
        }
    }

    /// Waits (bounded) for the GPU and releases every device resource.
    pub fn cleanup(&mut self, device: &mut dyn RenderDevice) {
        let Some(mut state) = self.state.take() else {
            return;
        };
        if let Err(err) = state.frames.wait_idle(device) {
            log::warn!("Releasing renderer resources without GPU idle: {}", err);
        }
        state.destroy(device, &mut self.materials);
        self.completed = [None, None];
        log::info!("Renderer cleaned up after {} frames", self.frame_count);
    }

    /// Renders one frame.
    ///
    /// A [`SyncTimeout`](RenderError::SyncTimeout) from the frame slot wait
    /// drops the frame before anything is recorded; the frame number is
    /// reused by the next call. Any later error aborts the remaining passes,
    /// but what was recorded is still submitted so fences and pending frees
    /// stay consistent.
    pub fn render(
        &mut self,
        device: &mut dyn RenderDevice,
        assets: &Assets,
        scene: &RenderScene,
        view: &RenderView,
    ) -> RenderResult<RendererStats> {
        let state = self.state.as_mut().ok_or(RenderError::NotSetUp)?;
        let frame = self.frame_count;

        state.buffers.reclaim(device);
        if let Err(err) = state.frames.begin_frame(device, frame) {
            log::warn!("Dropping frame {}: {}", frame, err);
            return Err(err);
        }

        let result = state.record_frame(
            device,
            &self.settings,
            &mut self.materials,
            assets,
            scene,
            view,
            frame,
        );

        let fence = device.submit();
        state.buffers.seal_frame(frame, &fence);
        state.frames.end_frame(frame, fence);
        self.frame_count += 1;

        match result {
            Ok(stats) => {
                self.completed = [Some(frame), self.completed[0]];
                self.last_stats = Some(stats);
                log::debug!(
                    "Frame {}: {} batches, {} draw calls",
                    frame,
                    stats.batch_count,
                    stats.total_draw_calls()
                );
                Ok(stats)
            }
            Err(err) => {
                log::error!("Frame {} aborted: {}", frame, err);
                Err(err)
            }
        }
    }

    /// The frame whose result the accessors expose: the newest completed
    /// frame other than the one just submitted, so readers never see a
    /// target the GPU may still be writing. With a single result target
    /// there is nothing to skip to.
    pub fn result_frame(&self) -> Option<u64> {
        let state = self.state.as_ref()?;
        let newest = self.completed[0]?;
        if state.targets.results.len() == 1 || newest + 1 < self.frame_count {
            return Some(newest);
        }
        self.completed[1]
    }

    fn result_target(&self) -> Option<ColorTarget> {
        let frame = self.result_frame()?;
        self.state.as_ref().map(|state| state.targets.result(frame))
    }

    pub fn result_framebuffer(&self) -> Option<FramebufferId> {
        self.result_target().map(|target| target.framebuffer)
    }

    pub fn result_texture(&self) -> Option<TextureId> {
        self.result_target().map(|target| target.texture)
    }

    /// Applies new settings between frames. A new frame count or resolution
    /// waits for the GPU and recreates the affected resources. On error the
    /// previous settings and resources stay in effect.
    pub fn update_settings(
        &mut self,
        device: &mut dyn RenderDevice,
        settings: RenderSettings,
    ) -> RenderResult<()> {
        let settings = settings.validate();
        let Some(state) = self.state.as_mut() else {
            self.settings = settings;
            return Ok(());
        };

        let count = settings.frames_in_flight as usize;
        let (width, height) = (
            settings.resolution.width.max(1),
            settings.resolution.height.max(1),
        );
        let recount = count != state.frames.len();
        let resize = (width, height) != (state.targets.width, state.targets.height)
            || count != state.targets.results.len();
        if recount || resize {
            state.frames.wait_idle(device)?;
            let targets = FrameTargets::create(device, width, height, count)?;
            if recount {
                if let Err(err) = state.frames.rebuild(device, count) {
                    targets.destroy(device);
                    return Err(err);
                }
            }
            std::mem::replace(&mut state.targets, targets).destroy(device);
            self.completed = [None, None];
        }

        state
            .buffers
            .set_limits(&settings.material_buffers, settings.fence_timeout());
        state.frames.set_timeout(settings.fence_timeout());
        state.ssao.configure(&settings.ssao);
        self.settings = settings;
        Ok(())
    }

    pub fn create_material(&mut self, material: Material) -> MaterialId {
        self.materials.create(material)
    }

    /// Replaces a material's parameters. Changing its kind releases the old
    /// slot; the new one is assigned the next time the material is drawn.
    pub fn update_material(&mut self, id: MaterialId, material: Material) -> RenderResult<()> {
        if let Some((kind, slot)) = self.materials.update(id, material)? {
            if let Some(state) = self.state.as_mut() {
                state.buffers.free(kind, slot);
            }
        }
        Ok(())
    }

    /// Destroys a material. Its slot returns to the free list once the
    /// frames that may read it have finished on the GPU.
    pub fn destroy_material(&mut self, id: MaterialId) -> RenderResult<()> {
        if let Some(state) = &self.state {
            if state.context.fallbacks.material == id {
                return Err(RenderError::Configuration(
                    "the fallback material cannot be destroyed".into(),
                ));
            }
        }
        if self.materials.get(id).is_none() {
            return Err(RenderError::ResourceMissing(format!("material {id:?}")));
        }
        if let Some((kind, slot)) = self.materials.destroy(id) {
            if let Some(state) = self.state.as_mut() {
                state.buffers.free(kind, slot);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::headless::HeadlessDevice;
    use glam::Vec3;

    fn view() -> RenderView {
        RenderView::look_at(
            Vec3::new(0.0, 1.0, 4.0),
            Vec3::ZERO,
            Vec3::Y,
            1.0,
            crate::scene::Viewport::new(64, 64),
            0.1,
            100.0,
        )
    }

    #[test]
    fn render_before_setup_fails() {
        let mut device = HeadlessDevice::new();
        let mut renderer = Renderer::new(RenderSettings::default());
        let result = renderer.render(&mut device, &Assets::new(), &RenderScene::new(), &view());
        assert_eq!(result, Err(RenderError::NotSetUp));
    }

    #[test]
    fn result_skips_the_frame_just_submitted() {
        let mut device = HeadlessDevice::new();
        let mut renderer = Renderer::new(RenderSettings::default());
        renderer.setup(&mut device).unwrap();
        let (assets, scene) = (Assets::new(), RenderScene::new());

        renderer.render(&mut device, &assets, &scene, &view()).unwrap();
        assert_eq!(renderer.result_frame(), None);

        renderer.render(&mut device, &assets, &scene, &view()).unwrap();
        assert_eq!(renderer.result_frame(), Some(0));
        let first = renderer.result_texture();

        renderer.render(&mut device, &assets, &scene, &view()).unwrap();
        assert_eq!(renderer.result_frame(), Some(1));
        assert_ne!(renderer.result_texture(), first);
    }

    #[test]
    fn destroying_a_material_twice_reports_it_missing() {
        let mut renderer = Renderer::new(RenderSettings::default());
        let id = renderer.create_material(Material::flat(Vec3::ONE));
        renderer.destroy_material(id).unwrap();
        assert!(matches!(
            renderer.destroy_material(id),
            Err(RenderError::ResourceMissing(_))
        ));
    }

    #[test]
    fn cleanup_releases_device_resources() {
        let mut device = HeadlessDevice::new();
        let mut renderer = Renderer::new(RenderSettings::default());
        renderer.setup(&mut device).unwrap();
        renderer
            .render(&mut device, &Assets::new(), &RenderScene::new(), &view())
            .unwrap();
        renderer.cleanup(&mut device);

        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_texture_count(), 0);
        assert!(renderer.materials().is_empty());
    }
}
