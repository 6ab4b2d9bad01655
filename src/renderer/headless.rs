//! CPU-side [`RenderDevice`] that records every command instead of drawing.
//!
//! Buffer and texture contents are kept in memory so callers can inspect
//! exactly what the renderer uploaded, and submissions return fences that are
//! either signaled right away or left pending until the caller signals them.

use std::collections::HashMap;
use std::ops::Range;

use crate::error::DeviceError;
use crate::renderer::device::{
    Attachment, BindGroup, BufferDesc, BufferId, BufferUsage, FramebufferDesc, FramebufferId,
    GeometryDesc, GeometryId, PassDesc, ProgramDesc, ProgramId, RenderDevice, RenderState,
    TextureDesc, TextureId,
};
use crate::renderer::fence::GpuFence;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    WriteBuffer {
        buffer: BufferId,
        offset: u64,
        len: u64,
    },
    CopyBuffer {
        src: BufferId,
        dst: BufferId,
        size: u64,
    },
    BeginPass {
        label: String,
        framebuffer: FramebufferId,
        clear_color: Option<[f32; 4]>,
        clear_depth: Option<f32>,
    },
    SetProgram {
        program: ProgramId,
        desc: ProgramDesc,
        state: RenderState,
    },
    SetBindGroup(BindGroup),
    DrawGeometry {
        geometry: GeometryId,
        instances: Range<u32>,
    },
    DrawFullscreen,
    EndPass,
    Submit {
        submission: u64,
    },
}

/// How fences returned by [`RenderDevice::submit`] complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceMode {
    /// The "GPU" finishes instantly.
    Immediate,
    /// Fences stay pending until signaled through the device or a clone.
    Manual,
}

#[derive(Debug)]
struct BufferRecord {
    label: String,
    usage: BufferUsage,
    data: Vec<u8>,
}

#[derive(Debug)]
struct TextureRecord {
    label: String,
    width: u32,
    height: u32,
    layers: u32,
    data: Vec<u8>,
}

#[derive(Debug)]
struct FramebufferRecord {
    label: String,
    colors: Vec<Attachment>,
    depth: Option<Attachment>,
}

pub struct HeadlessDevice {
    next_id: u32,
    buffers: HashMap<u32, BufferRecord>,
    textures: HashMap<u32, TextureRecord>,
    framebuffers: HashMap<u32, FramebufferRecord>,
    geometries: HashMap<u32, u32>,
    programs: HashMap<u32, ProgramDesc>,
    current_program: Option<ProgramDesc>,
    open_pass: Option<String>,
    commands: Vec<Command>,
    fence_mode: FenceMode,
    submissions: Vec<GpuFence>,
    next_submission: u64,
    max_buffer_size: Option<u64>,
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self::with_fence_mode(FenceMode::Immediate)
    }

    pub fn with_fence_mode(fence_mode: FenceMode) -> Self {
        Self {
            next_id: 1,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            geometries: HashMap::new(),
            programs: HashMap::new(),
            current_program: None,
            open_pass: None,
            commands: Vec::new(),
            fence_mode,
            submissions: Vec::new(),
            next_submission: 0,
            max_buffer_size: None,
        }
    }

    /// Makes every buffer allocation larger than `bytes` fail with
    /// [`DeviceError::OutOfMemory`]. `None` lifts the limit.
    pub fn set_max_buffer_size(&mut self, bytes: Option<u64>) {
        self.max_buffer_size = bytes;
    }

    pub fn set_fence_mode(&mut self, fence_mode: FenceMode) {
        self.fence_mode = fence_mode;
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }

    /// Every fence handed out so far, oldest first.
    pub fn submissions(&self) -> &[GpuFence] {
        &self.submissions
    }

    pub fn fence(&self, submission: u64) -> Option<&GpuFence> {
        self.submissions
            .iter()
            .find(|fence| fence.submission() == submission)
    }

    pub fn signal_all(&self) {
        for fence in &self.submissions {
            fence.signal();
        }
    }

    pub fn buffer_contents(&self, buffer: BufferId) -> Option<&[u8]> {
        self.buffers.get(&buffer.0).map(|record| record.data.as_slice())
    }

    pub fn buffer_label(&self, buffer: BufferId) -> Option<&str> {
        self.buffers.get(&buffer.0).map(|record| record.label.as_str())
    }

    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn texture_contents(&self, texture: TextureId) -> Option<&[u8]> {
        self.textures.get(&texture.0).map(|record| record.data.as_slice())
    }

    pub fn texture_label(&self, texture: TextureId) -> Option<&str> {
        self.textures.get(&texture.0).map(|record| record.label.as_str())
    }

    pub fn live_texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn framebuffer_label(&self, framebuffer: FramebufferId) -> Option<&str> {
        self.framebuffers
            .get(&framebuffer.0)
            .map(|record| record.label.as_str())
    }

    /// Attachments of `framebuffer`: colors first, then depth.
    pub fn framebuffer_attachments(&self, framebuffer: FramebufferId) -> Vec<Attachment> {
        self.framebuffers
            .get(&framebuffer.0)
            .map(|record| record.colors.iter().copied().chain(record.depth).collect())
            .unwrap_or_default()
    }

    pub fn program_desc(&self, program: ProgramId) -> Option<ProgramDesc> {
        self.programs.get(&program.0).copied()
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn buffer_mut(&mut self, buffer: BufferId) -> Result<&mut BufferRecord, DeviceError> {
        self.buffers
            .get_mut(&buffer.0)
            .ok_or(DeviceError::InvalidHandle {
                kind: "buffer",
                index: buffer.0,
            })
    }

    fn check_texture(&self, attachment: &Attachment) -> Result<(), DeviceError> {
        match self.textures.get(&attachment.texture.0) {
            Some(texture) if attachment.layer < texture.layers => Ok(()),
            _ => Err(DeviceError::InvalidHandle {
                kind: "texture",
                index: attachment.texture.0,
            }),
        }
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderDevice for HeadlessDevice {
    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<BufferId, DeviceError> {
        if let Some(limit) = self.max_buffer_size {
            if desc.size > limit {
                return Err(DeviceError::OutOfMemory {
                    requested: desc.size,
                });
            }
        }
        let id = self.allocate_id();
        self.buffers.insert(
            id,
            BufferRecord {
                label: desc.label.to_owned(),
                usage: desc.usage,
                data: vec![0; desc.size as usize],
            },
        );
        Ok(BufferId(id))
    }

    fn write_buffer(
        &mut self,
        buffer: BufferId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        let record = self.buffer_mut(buffer)?;
        let start = offset as usize;
        let end = start + data.len();
        if end > record.data.len() {
            return Err(DeviceError::Backend(format!(
                "write of {} bytes at {} overruns {} ({:?}, {} bytes)",
                data.len(),
                offset,
                record.label,
                record.usage,
                record.data.len()
            )));
        }
        record.data[start..end].copy_from_slice(data);
        self.commands.push(Command::WriteBuffer {
            buffer,
            offset,
            len: data.len() as u64,
        });
        Ok(())
    }

    fn copy_buffer(&mut self, src: BufferId, dst: BufferId, size: u64) -> Result<(), DeviceError> {
        let bytes = {
            let source = self.buffer_mut(src)?;
            source
                .data
                .get(..size as usize)
                .ok_or_else(|| DeviceError::Backend(format!("copy source {} too small", source.label)))?
                .to_vec()
        };
        let target = self.buffer_mut(dst)?;
        let Some(region) = target.data.get_mut(..size as usize) else {
            return Err(DeviceError::Backend(format!(
                "copy target {} too small",
                target.label
            )));
        };
        region.copy_from_slice(&bytes);
        self.commands.push(Command::CopyBuffer { src, dst, size });
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer.0);
    }

    fn create_texture(&mut self, desc: &TextureDesc<'_>) -> Result<TextureId, DeviceError> {
        if desc.width == 0 || desc.height == 0 || desc.layers == 0 {
            return Err(DeviceError::Backend(format!(
                "texture {} has a zero extent",
                desc.label
            )));
        }
        let id = self.allocate_id();
        let size = desc.width * desc.height * desc.layers * desc.format.bytes_per_texel();
        self.textures.insert(
            id,
            TextureRecord {
                label: desc.label.to_owned(),
                width: desc.width,
                height: desc.height,
                layers: desc.layers,
                data: vec![0; size as usize],
            },
        );
        Ok(TextureId(id))
    }

    fn write_texture(&mut self, texture: TextureId, data: &[u8]) -> Result<(), DeviceError> {
        let record = self
            .textures
            .get_mut(&texture.0)
            .ok_or(DeviceError::InvalidHandle {
                kind: "texture",
                index: texture.0,
            })?;
        let layer_size = record.data.len() / record.layers as usize;
        if data.len() != layer_size {
            return Err(DeviceError::Backend(format!(
                "texture {} ({}x{}) expects {} bytes per layer, got {}",
                record.label,
                record.width,
                record.height,
                layer_size,
                data.len()
            )));
        }
        record.data[..layer_size].copy_from_slice(data);
        Ok(())
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture.0);
    }

    fn create_framebuffer(
        &mut self,
        desc: &FramebufferDesc<'_>,
    ) -> Result<FramebufferId, DeviceError> {
        for attachment in desc.colors.iter().chain(desc.depth.as_ref()) {
            self.check_texture(attachment)?;
        }
        let id = self.allocate_id();
        self.framebuffers.insert(
            id,
            FramebufferRecord {
                label: desc.label.to_owned(),
                colors: desc.colors.to_vec(),
                depth: desc.depth,
            },
        );
        Ok(FramebufferId(id))
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferId) {
        self.framebuffers.remove(&framebuffer.0);
    }

    fn create_geometry(&mut self, desc: &GeometryDesc<'_>) -> Result<GeometryId, DeviceError> {
        let id = self.allocate_id();
        self.geometries.insert(id, desc.indices.len() as u32);
        Ok(GeometryId(id))
    }

    fn destroy_geometry(&mut self, geometry: GeometryId) {
        self.geometries.remove(&geometry.0);
    }

    fn create_program(&mut self, desc: &ProgramDesc) -> Result<ProgramId, DeviceError> {
        let id = self.allocate_id();
        self.programs.insert(id, *desc);
        Ok(ProgramId(id))
    }

    fn destroy_program(&mut self, program: ProgramId) {
        self.programs.remove(&program.0);
    }

    fn begin_pass(&mut self, desc: &PassDesc<'_>) -> Result<(), DeviceError> {
        if let Some(open) = &self.open_pass {
            return Err(DeviceError::PassAlreadyOpen(open.clone()));
        }
        if !self.framebuffers.contains_key(&desc.framebuffer.0) {
            return Err(DeviceError::InvalidHandle {
                kind: "framebuffer",
                index: desc.framebuffer.0,
            });
        }
        self.open_pass = Some(desc.label.to_owned());
        self.current_program = None;
        self.commands.push(Command::BeginPass {
            label: desc.label.to_owned(),
            framebuffer: desc.framebuffer,
            clear_color: desc.clear_color,
            clear_depth: desc.clear_depth,
        });
        Ok(())
    }

    fn set_program(&mut self, program: ProgramId, state: RenderState) {
        match self.programs.get(&program.0).copied() {
            Some(desc) => {
                self.current_program = Some(desc);
                self.commands
                    .push(Command::SetProgram { program, desc, state });
            }
            None => log::warn!("Headless: set_program with unknown program {:?}", program),
        }
    }

    fn set_bind_group(&mut self, group: &BindGroup) {
        self.commands.push(Command::SetBindGroup(*group));
    }

    fn draw_geometry(&mut self, geometry: GeometryId, instances: Range<u32>) {
        if self.open_pass.is_none() || self.current_program.is_none() {
            log::warn!("Headless: draw outside of a configured pass");
            return;
        }
        if !self.geometries.contains_key(&geometry.0) {
            log::warn!("Headless: draw with unknown geometry {:?}", geometry);
            return;
        }
        self.commands
            .push(Command::DrawGeometry { geometry, instances });
    }

    fn draw_fullscreen(&mut self) {
        if self.open_pass.is_none() || self.current_program.is_none() {
            log::warn!("Headless: fullscreen draw outside of a configured pass");
            return;
        }
        self.commands.push(Command::DrawFullscreen);
    }

    fn end_pass(&mut self) -> Result<(), DeviceError> {
        self.open_pass.take().ok_or(DeviceError::NoOpenPass)?;
        self.current_program = None;
        self.commands.push(Command::EndPass);
        Ok(())
    }

    fn submit(&mut self) -> GpuFence {
        let submission = self.next_submission;
        self.next_submission += 1;

        let fence = GpuFence::new(submission);
        if self.fence_mode == FenceMode::Immediate {
            fence.signal();
        }
        self.commands.push(Command::Submit { submission });
        self.submissions.push(fence.clone());
        fence
    }

    fn poll(&mut self) {}
}
