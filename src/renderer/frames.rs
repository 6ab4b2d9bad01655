//! Per-frame CPU-writable buffers, multiplexed over the frames in flight.
//!
//! ```text
//! frame k:     slot k % N   CPU writes, GPU idle on it (fence of k - N waited)
//! frame k - 1: slot ...     GPU may still read
//! ```

use std::time::Duration;

use crate::error::RenderResult;
use crate::renderer::device::{BufferDesc, BufferId, BufferSlice, BufferUsage, RenderDevice};
use crate::renderer::fence::{wait_for_fence, GpuFence};
use crate::renderer::uniforms::{align_uniform, GlobalsUniform};

const GLOBALS_SIZE: u64 = std::mem::size_of::<GlobalsUniform>() as u64;
const INITIAL_STORAGE_SIZE: u64 = 16 * 1024;
const INITIAL_ARENA_SIZE: u64 = 16 * 1024;

/// A device buffer that is rewritten each time its slot comes around and
/// grows by doubling when a frame needs more.
#[derive(Debug)]
pub struct SlotBuffer {
    label: String,
    usage: BufferUsage,
    buffer: BufferId,
    size: u64,
}

impl SlotBuffer {
    fn new(
        device: &mut dyn RenderDevice,
        label: String,
        usage: BufferUsage,
        size: u64,
    ) -> RenderResult<Self> {
        let buffer = device.create_buffer(&BufferDesc {
            label: &label,
            size,
            usage,
        })?;
        Ok(Self {
            label,
            usage,
            buffer,
            size,
        })
    }

    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn binding(&self) -> BufferSlice {
        BufferSlice::whole(self.buffer, self.size)
    }

    /// Replaces the buffer with a larger one. Only valid while the GPU does
    /// not read this slot, which holds between `begin_frame` and submission.
    fn reserve(&mut self, device: &mut dyn RenderDevice, required: u64) -> RenderResult<()> {
        if required <= self.size {
            return Ok(());
        }
        let mut size = self.size.max(1);
        while size < required {
            size *= 2;
        }
        log::info!("Growing {} buffer: {} -> {} bytes", self.label, self.size, size);

        let buffer = device.create_buffer(&BufferDesc {
            label: &self.label,
            size,
            usage: self.usage,
        })?;
        device.destroy_buffer(std::mem::replace(&mut self.buffer, buffer));
        self.size = size;
        Ok(())
    }

    pub fn upload(&mut self, device: &mut dyn RenderDevice, data: &[u8]) -> RenderResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.reserve(device, data.len() as u64)?;
        device.write_buffer(self.buffer, 0, data)?;
        Ok(())
    }

    fn destroy(self, device: &mut dyn RenderDevice) {
        device.destroy_buffer(self.buffer);
    }
}

/// Uniform blocks written back to back at aligned offsets and uploaded in one
/// write. Offsets handed out by [`push`](Self::push) stay valid for the frame.
#[derive(Debug)]
pub struct UniformArena {
    storage: SlotBuffer,
    staging: Vec<u8>,
}

impl UniformArena {
    fn new(device: &mut dyn RenderDevice, label: String) -> RenderResult<Self> {
        Ok(Self {
            storage: SlotBuffer::new(device, label, BufferUsage::Uniform, INITIAL_ARENA_SIZE)?,
            staging: Vec::new(),
        })
    }

    pub fn reset(&mut self) {
        self.staging.clear();
    }

    /// Appends one block and returns its offset.
    pub fn push(&mut self, bytes: &[u8]) -> u64 {
        let offset = self.staging.len() as u64;
        self.staging.extend_from_slice(bytes);
        self.staging.resize(offset as usize + align_uniform(bytes.len() as u64) as usize, 0);
        offset
    }

    pub fn len(&self) -> u64 {
        self.staging.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.staging.is_empty()
    }

    pub fn upload(&mut self, device: &mut dyn RenderDevice) -> RenderResult<()> {
        self.storage.upload(device, &self.staging)
    }

    /// Binding of a block pushed this frame. Valid after [`upload`](Self::upload).
    pub fn slice(&self, offset: u64, size: u64) -> BufferSlice {
        BufferSlice {
            buffer: self.storage.buffer(),
            offset,
            size,
        }
    }
}

/// One of the N rotating sets of per-frame buffers.
#[derive(Debug)]
pub struct FrameSlot {
    index: usize,
    pub globals: SlotBuffer,
    /// Light and shadow-view uniforms.
    pub lights: UniformArena,
    /// SSAO, blur and post-process parameters.
    pub passes: UniformArena,
    pub actors: SlotBuffer,
    pub instances: SlotBuffer,
    fence: Option<GpuFence>,
    frame: Option<u64>,
}

impl FrameSlot {
    fn new(device: &mut dyn RenderDevice, index: usize) -> RenderResult<Self> {
        Ok(Self {
            index,
            globals: SlotBuffer::new(
                device,
                format!("Globals [slot {index}]"),
                BufferUsage::Uniform,
                GLOBALS_SIZE,
            )?,
            lights: UniformArena::new(device, format!("LightUniforms [slot {index}]"))?,
            passes: UniformArena::new(device, format!("PassUniforms [slot {index}]"))?,
            actors: SlotBuffer::new(
                device,
                format!("Actors [slot {index}]"),
                BufferUsage::Storage,
                INITIAL_STORAGE_SIZE,
            )?,
            instances: SlotBuffer::new(
                device,
                format!("Instances [slot {index}]"),
                BufferUsage::Storage,
                INITIAL_STORAGE_SIZE,
            )?,
            fence: None,
            frame: None,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// The frame that last used this slot.
    pub fn last_frame(&self) -> Option<u64> {
        self.frame
    }

    pub fn fence(&self) -> Option<&GpuFence> {
        self.fence.as_ref()
    }

    fn destroy(self, device: &mut dyn RenderDevice) {
        self.globals.destroy(device);
        self.lights.storage.destroy(device);
        self.passes.storage.destroy(device);
        self.actors.destroy(device);
        self.instances.destroy(device);
    }
}

fn create_slots(device: &mut dyn RenderDevice, count: usize) -> RenderResult<Vec<FrameSlot>> {
    let mut slots = Vec::with_capacity(count);
    for index in 0..count {
        match FrameSlot::new(device, index) {
            Ok(slot) => slots.push(slot),
            Err(err) => {
                for slot in slots {
                    slot.destroy(device);
                }
                return Err(err);
            }
        }
    }
    Ok(slots)
}

pub struct FrameMultiplexer {
    slots: Vec<FrameSlot>,
    timeout: Duration,
}

impl FrameMultiplexer {
    pub fn new(device: &mut dyn RenderDevice, count: usize, timeout: Duration) -> RenderResult<Self> {
        let count = count.max(1);
        let slots = create_slots(device, count)?;
        log::info!("Created {} frame slots", count);
        Ok(Self { slots, timeout })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn slot_index(&self, frame: u64) -> usize {
        (frame % self.slots.len() as u64) as usize
    }

    /// Selects slot `frame % N` and blocks until the frame that used it
    /// before (`frame - N`) has finished on the GPU. Fails with
    /// [`SyncTimeout`](crate::error::RenderError::SyncTimeout) after the
    /// configured timeout, leaving the slot untouched.
    pub fn begin_frame(
        &mut self,
        device: &mut dyn RenderDevice,
        frame: u64,
    ) -> RenderResult<&mut FrameSlot> {
        let index = self.slot_index(frame);
        let slot = &mut self.slots[index];
        if let Some(fence) = &slot.fence {
            let previous = slot.frame.unwrap_or(frame);
            wait_for_fence(device, fence, self.timeout, previous)?;
        }
        slot.fence = None;
        slot.lights.reset();
        slot.passes.reset();
        Ok(slot)
    }

    pub fn slot_mut(&mut self, frame: u64) -> &mut FrameSlot {
        let index = self.slot_index(frame);
        &mut self.slots[index]
    }

    /// Records the fence of `frame`'s submission on its slot.
    pub fn end_frame(&mut self, frame: u64, fence: GpuFence) {
        let slot = self.slot_mut(frame);
        slot.fence = Some(fence);
        slot.frame = Some(frame);
    }

    /// Waits for every slot (bounded) so all of them are idle.
    pub fn wait_idle(&mut self, device: &mut dyn RenderDevice) -> RenderResult<()> {
        for slot in &self.slots {
            if let (Some(fence), Some(frame)) = (&slot.fence, slot.frame) {
                wait_for_fence(device, fence, self.timeout, frame)?;
            }
        }
        Ok(())
    }

    /// Recreates the slots for a new frame count once the GPU is idle. The
    /// old slots stay in place unless every new one could be created.
    pub fn rebuild(&mut self, device: &mut dyn RenderDevice, count: usize) -> RenderResult<()> {
        self.wait_idle(device)?;
        let count = count.max(1);
        let slots = create_slots(device, count)?;
        for slot in std::mem::replace(&mut self.slots, slots) {
            slot.destroy(device);
        }
        log::info!("Rebuilt frame slots: {}", count);
        Ok(())
    }

    pub fn destroy(&mut self, device: &mut dyn RenderDevice) {
        for slot in self.slots.drain(..) {
            slot.destroy(device);
        }
    }
}
