#![allow(dead_code)]

use glam::{Mat4, Vec3};
use wgpu_passes::renderer::device::BufferSlice;
use wgpu_passes::renderer::{BindGroup, Command, FenceMode, GeometryDesc, RenderDevice, Vertex};
use wgpu_passes::settings::Resolution;
use wgpu_passes::{
    Assets, Geometry, Handle, HeadlessDevice, RenderScene, RenderSettings, RenderView, Renderer,
    Viewport,
};

/// Settings small enough that headless targets stay cheap.
pub fn small_settings() -> RenderSettings {
    RenderSettings {
        resolution: Resolution {
            width: 32,
            height: 32,
        },
        shadow_map_size: 256,
        fence_timeout_ms: 20,
        ..RenderSettings::default()
    }
}

pub fn view() -> RenderView {
    RenderView::look_at(
        Vec3::new(0.0, 2.0, 6.0),
        Vec3::ZERO,
        Vec3::Y,
        1.0,
        Viewport::new(32, 32),
        0.1,
        50.0,
    )
}

pub struct Harness {
    pub device: HeadlessDevice,
    pub renderer: Renderer,
    pub assets: Assets,
    pub scene: RenderScene,
    pub view: RenderView,
}

impl Harness {
    pub fn new(settings: RenderSettings) -> Self {
        Self::with_fence_mode(settings, FenceMode::Immediate)
    }

    pub fn with_fence_mode(settings: RenderSettings, fence_mode: FenceMode) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut device = HeadlessDevice::with_fence_mode(fence_mode);
        let mut renderer = Renderer::new(settings);
        renderer.setup(&mut device).unwrap();
        Self {
            device,
            renderer,
            assets: Assets::new(),
            scene: RenderScene::new(),
            view: view(),
        }
    }

    /// Uploads a unit quad and registers it.
    pub fn quad(&mut self) -> Handle<Geometry> {
        let normal = [0.0, 0.0, 1.0];
        let vertices = [
            Vertex::new([-0.5, -0.5, 0.0], normal, [0.0, 1.0]),
            Vertex::new([0.5, -0.5, 0.0], normal, [1.0, 1.0]),
            Vertex::new([0.5, 0.5, 0.0], normal, [1.0, 0.0]),
            Vertex::new([-0.5, 0.5, 0.0], normal, [0.0, 0.0]),
        ];
        let indices = [0, 1, 2, 0, 2, 3];
        let id = self
            .device
            .create_geometry(&GeometryDesc {
                label: "Quad",
                vertices: &vertices,
                indices: &indices,
            })
            .unwrap();
        self.assets.geometries.insert(Geometry {
            id,
            index_count: indices.len() as u32,
        })
    }

    pub fn render(&mut self) -> wgpu_passes::RenderResult<wgpu_passes::RendererStats> {
        self.renderer
            .render(&mut self.device, &self.assets, &self.scene, &self.view)
    }

    /// Renders one frame and returns the commands it recorded.
    pub fn render_commands(&mut self) -> Vec<Command> {
        self.device.take_commands();
        self.render().unwrap();
        self.device.take_commands()
    }
}

pub fn at(x: f32) -> Mat4 {
    Mat4::from_translation(Vec3::new(x, 0.0, 0.0))
}

/// Commands between the `BeginPass` labelled `label` and its `EndPass`.
pub fn pass_commands<'a>(commands: &'a [Command], label: &str) -> Vec<&'a [Command]> {
    let mut passes = Vec::new();
    let mut start = None;
    for (index, command) in commands.iter().enumerate() {
        match command {
            Command::BeginPass { label: name, .. } if name == label => start = Some(index),
            Command::EndPass => {
                if let Some(begin) = start.take() {
                    passes.push(&commands[begin..=index]);
                }
            }
            _ => {}
        }
    }
    passes
}

pub fn globals_binding(commands: &[Command]) -> Option<BufferSlice> {
    commands.iter().find_map(|command| match command {
        Command::SetBindGroup(BindGroup::Frame { globals, .. }) => Some(*globals),
        _ => None,
    })
}
