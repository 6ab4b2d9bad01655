//! Shadow map generation: light-space matrices, per-light depth targets and
//! the depth passes that fill them.

use glam::{Mat4, Vec3};

use crate::error::RenderResult;
use crate::renderer::batch::PreparedFrame;
use crate::renderer::context::RenderContext;
use crate::renderer::device::{
    Attachment, BindGroup, BufferSlice, FramebufferDesc, FramebufferId, PassDesc, RenderDevice,
    RenderState, TextureDesc, TextureFormat, TextureId, TextureUsage,
};
use crate::scene::{Light, LightKind, RenderView, ShadowQuality};

pub const POINT_SHADOW_FACE_COUNT: usize = 6;
/// Weight of the logarithmic term in the cascade split scheme.
const CASCADE_SPLIT_LAMBDA: f32 = 0.75;
const SHADOW_NEAR: f32 = 0.05;

/// Uniform/logarithmic blend of split distances. Returns the far distance of
/// each cascade; the last one equals `far`.
pub fn cascade_splits(near: f32, far: f32, count: usize, lambda: f32) -> Vec<f32> {
    let count = count.max(1);
    (1..=count)
        .map(|i| {
            let t = i as f32 / count as f32;
            let log = near * (far / near).powf(t);
            let uniform = near + (far - near) * t;
            lambda * log + (1.0 - lambda) * uniform
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cascade {
    pub view_proj: Mat4,
    /// View distance where this cascade ends.
    pub split_far: f32,
}

/// Orthographic light-space matrices, one per slice of the view frustum.
pub fn directional_cascades(view: &RenderView, light_dir: Vec3, count: usize) -> Vec<Cascade> {
    let direction = light_dir.try_normalize().unwrap_or(Vec3::NEG_Y);
    let up = if direction.abs().dot(Vec3::Y) > 0.95 {
        Vec3::Z
    } else {
        Vec3::Y
    };

    let mut start = view.near;
    cascade_splits(view.near, view.far, count, CASCADE_SPLIT_LAMBDA)
        .into_iter()
        .map(|split_far| {
            let corners = view.frustum_corners(start, split_far);
            start = split_far;

            let center = corners.iter().copied().sum::<Vec3>() / corners.len() as f32;
            let radius = corners
                .iter()
                .map(|corner| corner.distance(center))
                .fold(0.0f32, f32::max)
                .max(0.01);

            // Leave room behind the slice for casters outside the view.
            let eye = center - direction * radius * 2.0;
            let light_view = Mat4::look_at_rh(eye, center, up);
            let projection =
                Mat4::orthographic_rh(-radius, radius, -radius, radius, SHADOW_NEAR, radius * 4.0);

            Cascade {
                view_proj: projection * light_view,
                split_far,
            }
        })
        .collect()
}

pub fn spot_view_proj(position: Vec3, direction: Vec3, outer_angle: f32, range: f32) -> Mat4 {
    let direction = direction.try_normalize().unwrap_or(Vec3::NEG_Y);
    let up = if direction.abs().dot(Vec3::Y) > 0.95 {
        Vec3::Z
    } else {
        Vec3::Y
    };
    let fov = (outer_angle * 2.0).clamp(0.1, std::f32::consts::PI - 0.1);
    let view = Mat4::look_at_rh(position, position + direction, up);
    Mat4::perspective_rh(fov, 1.0, SHADOW_NEAR, range.max(SHADOW_NEAR * 2.0)) * view
}

/// Cube face directions and up vectors, in layer order +X -X +Y -Y +Z -Z.
pub const POINT_FACES: [(Vec3, Vec3); POINT_SHADOW_FACE_COUNT] = [
    (Vec3::X, Vec3::NEG_Y),
    (Vec3::NEG_X, Vec3::NEG_Y),
    (Vec3::Y, Vec3::Z),
    (Vec3::NEG_Y, Vec3::NEG_Z),
    (Vec3::Z, Vec3::NEG_Y),
    (Vec3::NEG_Z, Vec3::NEG_Y),
];

pub fn point_face_view_projs(position: Vec3, range: f32) -> [Mat4; POINT_SHADOW_FACE_COUNT] {
    let projection = Mat4::perspective_rh(
        std::f32::consts::FRAC_PI_2,
        1.0,
        SHADOW_NEAR,
        range.max(SHADOW_NEAR * 2.0),
    );
    POINT_FACES.map(|(direction, up)| projection * Mat4::look_at_rh(position, position + direction, up))
}

/// Layer of a point shadow map that covers `to_fragment` (fragment minus
/// light position): the face of its major axis.
pub fn point_face_index(to_fragment: Vec3) -> usize {
    let a = to_fragment.abs();
    if a.x >= a.y && a.x >= a.z {
        if to_fragment.x >= 0.0 {
            0
        } else {
            1
        }
    } else if a.y >= a.z {
        if to_fragment.y >= 0.0 {
            2
        } else {
            3
        }
    } else if to_fragment.z >= 0.0 {
        4
    } else {
        5
    }
}

/// Shadow map coordinates of `world` under `matrix`: uv with origin top-left
/// and depth in `[0, 1]`. `None` behind the light.
pub fn shadow_coords(matrix: Mat4, world: Vec3) -> Option<Vec3> {
    let clip = matrix * world.extend(1.0);
    if clip.w <= 0.0 {
        return None;
    }
    let ndc = clip.truncate() / clip.w;
    Some(Vec3::new(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5, ndc.z))
}

/// Light-space views of one shadow-casting light for the current frame.
#[derive(Debug, Clone, PartialEq)]
pub struct LightShadowViews {
    pub matrices: Vec<Mat4>,
    /// Far distance of each directional cascade.
    pub splits: Vec<f32>,
    /// Point lights store distance over range instead of projected depth.
    pub linear_depth: bool,
    pub position: Vec3,
    pub range: f32,
}

pub fn light_shadow_views(light: &Light, view: &RenderView) -> LightShadowViews {
    match light.kind {
        LightKind::Directional { direction } => {
            let cascades =
                directional_cascades(view, direction, light.shadow_quality.cascade_count());
            LightShadowViews {
                matrices: cascades.iter().map(|c| c.view_proj).collect(),
                splits: cascades.iter().map(|c| c.split_far).collect(),
                linear_depth: false,
                position: Vec3::ZERO,
                range: 0.0,
            }
        }
        LightKind::Spot {
            position,
            direction,
            range,
            outer_angle,
            ..
        } => LightShadowViews {
            matrices: vec![spot_view_proj(position, direction, outer_angle, range)],
            splits: Vec::new(),
            linear_depth: false,
            position,
            range,
        },
        LightKind::Point { position, range } => LightShadowViews {
            matrices: point_face_view_projs(position, range).to_vec(),
            splits: Vec::new(),
            linear_depth: true,
            position,
            range,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetShape {
    Directional(ShadowQuality),
    Spot(ShadowQuality),
    Point(ShadowQuality),
}

impl TargetShape {
    fn of(light: &Light) -> Self {
        match light.kind {
            LightKind::Directional { .. } => Self::Directional(light.shadow_quality),
            LightKind::Spot { .. } => Self::Spot(light.shadow_quality),
            LightKind::Point { .. } => Self::Point(light.shadow_quality),
        }
    }
}

/// Depth array of one light, one framebuffer per layer.
#[derive(Debug)]
pub struct ShadowTarget {
    shape: TargetShape,
    pub texture: TextureId,
    pub framebuffers: Vec<FramebufferId>,
    pub size: u32,
}

impl ShadowTarget {
    fn create(
        device: &mut dyn RenderDevice,
        light_index: usize,
        light: &Light,
        base_size: u32,
    ) -> RenderResult<Self> {
        let size = light.shadow_quality.map_size(base_size);
        let layers = light.shadow_layers() as u32;
        let label = format!("ShadowMap{light_index}");
        let texture = device.create_texture(&TextureDesc {
            label: &label,
            width: size,
            height: size,
            layers,
            format: TextureFormat::Depth32Float,
            usage: TextureUsage::RENDER_TARGET | TextureUsage::SAMPLED,
        })?;

        let mut framebuffers = Vec::with_capacity(layers as usize);
        for layer in 0..layers {
            let framebuffer = device.create_framebuffer(&FramebufferDesc {
                label: &format!("{label}Layer{layer}"),
                colors: &[],
                depth: Some(Attachment::layer(texture, layer)),
            });
            match framebuffer {
                Ok(framebuffer) => framebuffers.push(framebuffer),
                Err(err) => {
                    for framebuffer in framebuffers {
                        device.destroy_framebuffer(framebuffer);
                    }
                    device.destroy_texture(texture);
                    return Err(err.into());
                }
            }
        }

        log::debug!(
            "Created shadow map for light {}: {}x{} x{}",
            light_index,
            size,
            size,
            layers
        );
        Ok(Self {
            shape: TargetShape::of(light),
            texture,
            framebuffers,
            size,
        })
    }

    fn destroy(self, device: &mut dyn RenderDevice) {
        for framebuffer in self.framebuffers {
            device.destroy_framebuffer(framebuffer);
        }
        device.destroy_texture(self.texture);
    }
}

/// Shadow targets cached by light index.
#[derive(Default)]
pub struct ShadowMaps {
    targets: Vec<Option<ShadowTarget>>,
}

impl ShadowMaps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the cached targets match `lights`: shadow casters get a target
    /// of the right shape and size, everything else gets none.
    pub fn sync(
        &mut self,
        device: &mut dyn RenderDevice,
        lights: &[Light],
        base_size: u32,
    ) -> RenderResult<()> {
        while self.targets.len() > lights.len() {
            if let Some(Some(target)) = self.targets.pop() {
                target.destroy(device);
            }
        }
        self.targets.resize_with(lights.len(), || None);

        for (index, light) in lights.iter().enumerate() {
            let wanted = light.casts_shadows.then(|| {
                (
                    TargetShape::of(light),
                    light.shadow_quality.map_size(base_size),
                )
            });
            let current = self.targets[index]
                .as_ref()
                .map(|target| (target.shape, target.size));
            if wanted == current {
                continue;
            }

            if let Some(stale) = self.targets[index].take() {
                stale.destroy(device);
            }
            if wanted.is_some() {
                self.targets[index] = Some(ShadowTarget::create(device, index, light, base_size)?);
            }
        }
        Ok(())
    }

    pub fn target(&self, light_index: usize) -> Option<&ShadowTarget> {
        self.targets.get(light_index).and_then(Option::as_ref)
    }

    pub fn destroy(&mut self, device: &mut dyn RenderDevice) {
        for target in self.targets.drain(..).flatten() {
            target.destroy(device);
        }
    }
}

/// Shadow view uniforms of one light, one per target layer.
#[derive(Debug, Clone)]
pub struct ShadowPassViews {
    pub light_index: usize,
    pub linear_depth: bool,
    pub layers: Vec<BufferSlice>,
}

/// Renders scene depth into the target of every shadow-casting light.
/// Returns the number of draw calls.
pub fn record_shadow_passes(
    device: &mut dyn RenderDevice,
    context: &RenderContext,
    frame_group: &BindGroup,
    prepared: &PreparedFrame,
    maps: &ShadowMaps,
    views: &[ShadowPassViews],
) -> RenderResult<ShadowPassCounts> {
    let mut counts = ShadowPassCounts::default();
    for light in views {
        let Some(target) = maps.target(light.light_index) else {
            log::warn!("Light {} has no shadow target", light.light_index);
            continue;
        };
        let program = if light.linear_depth {
            context.shaders.shadow_linear_depth
        } else {
            context.shaders.shadow_depth
        };

        for (framebuffer, view) in target.framebuffers.iter().zip(&light.layers) {
            device.begin_pass(&PassDesc {
                label: "ShadowPass",
                framebuffer: *framebuffer,
                clear_color: None,
                clear_depth: Some(1.0),
            })?;
            device.set_program(program, RenderState::OPAQUE);
            device.set_bind_group(frame_group);
            device.set_bind_group(&BindGroup::ShadowView { view: *view });
            for batch in &prepared.batches {
                device.draw_geometry(batch.geometry, batch.instances());
                counts.draw_calls += 1;
            }
            device.end_pass()?;
            counts.passes += 1;
        }
    }
    Ok(counts)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShadowPassCounts {
    pub passes: u32,
    pub draw_calls: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::headless::HeadlessDevice;

    #[test]
    fn splits_are_increasing_and_end_at_far() {
        let splits = cascade_splits(0.1, 100.0, 4, CASCADE_SPLIT_LAMBDA);
        assert_eq!(splits.len(), 4);
        assert!(splits.windows(2).all(|w| w[0] < w[1]));
        assert!((splits[3] - 100.0).abs() < 1e-3);
    }

    #[test]
    fn face_index_follows_major_axis() {
        assert_eq!(point_face_index(Vec3::new(2.0, 1.0, -1.0)), 0);
        assert_eq!(point_face_index(Vec3::new(0.0, -3.0, 1.0)), 3);
        assert_eq!(point_face_index(Vec3::new(0.5, 0.5, -0.9)), 5);
    }

    #[test]
    fn targets_follow_shadow_flags() {
        let mut device = HeadlessDevice::new();
        let mut maps = ShadowMaps::new();
        let mut lights = vec![
            Light::point(Vec3::ZERO, 5.0, Vec3::ONE, 1.0).with_shadows(ShadowQuality::Low),
            Light::directional(Vec3::NEG_Y, Vec3::ONE, 1.0),
        ];

        maps.sync(&mut device, &lights, 1024).unwrap();
        let point = maps.target(0).unwrap();
        assert_eq!(point.framebuffers.len(), 6);
        assert_eq!(point.size, 256);
        assert!(maps.target(1).is_none());

        let texture = point.texture;
        maps.sync(&mut device, &lights, 1024).unwrap();
        assert_eq!(maps.target(0).unwrap().texture, texture, "unchanged lights keep targets");

        lights[0].casts_shadows = false;
        maps.sync(&mut device, &lights, 1024).unwrap();
        assert!(maps.target(0).is_none());
        assert!(device.texture_label(texture).is_none());
    }
}
