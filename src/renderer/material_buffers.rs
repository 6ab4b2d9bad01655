use std::collections::{BTreeMap, VecDeque};
use std::ops::Range;
use std::time::Duration;

use crate::error::{RenderError, RenderResult};
use crate::renderer::device::{BufferDesc, BufferId, BufferSlice, BufferUsage, RenderDevice};
use crate::renderer::fence::{wait_for_fence, GpuFence};
use crate::renderer::material::{Material, MaterialKind, MaterialParamsLayout};
use crate::settings::MaterialBufferSettings;

/// GPU storage for the parameter blocks of one material kind.
///
/// `shadow` mirrors the device buffer byte for byte; writes land there first
/// and reach the device in [`MaterialBufferManager::flush`].
pub struct MaterialDataBuffer {
    kind: MaterialKind,
    stride: u64,
    buffer: BufferId,
    shadow: Vec<u8>,
    entry_count: u32,
    capacity: u32,
    free: Vec<u32>,
    dirty: Option<Range<u64>>,
}

impl MaterialDataBuffer {
    pub fn kind(&self) -> MaterialKind {
        self.kind
    }

    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Contiguous indices handed out so far, free or not.
    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn binding(&self) -> BufferSlice {
        BufferSlice::whole(self.buffer, self.capacity as u64 * self.stride)
    }

    fn mark_dirty(&mut self, range: Range<u64>) {
        self.dirty = Some(match self.dirty.take() {
            Some(dirty) => dirty.start.min(range.start)..dirty.end.max(range.end),
            None => range,
        });
    }
}

/// Slots released during one frame, reusable once `fence` signals.
#[derive(Debug)]
struct PendingFree {
    kind: MaterialKind,
    indices: Vec<u32>,
    frame: u64,
    fence: GpuFence,
}

#[derive(Debug)]
struct RetiredBuffer {
    buffer: BufferId,
    fence: GpuFence,
}

/// Owns one [`MaterialDataBuffer`] per material kind and hands out slots with
/// fence-gated reuse.
pub struct MaterialBufferManager {
    buffers: BTreeMap<MaterialKind, MaterialDataBuffer>,
    open_frees: Vec<(MaterialKind, u32)>,
    pending: VecDeque<PendingFree>,
    open_retired: Vec<BufferId>,
    retired: Vec<RetiredBuffer>,
    max_capacity: u32,
    timeout: Duration,
    growths: u32,
}

impl MaterialBufferManager {
    pub fn new(settings: &MaterialBufferSettings, timeout: Duration) -> Self {
        Self {
            buffers: BTreeMap::new(),
            open_frees: Vec::new(),
            pending: VecDeque::new(),
            open_retired: Vec::new(),
            retired: Vec::new(),
            max_capacity: settings.max_capacity,
            timeout,
            growths: 0,
        }
    }

    pub fn set_limits(&mut self, settings: &MaterialBufferSettings, timeout: Duration) {
        self.max_capacity = settings.max_capacity;
        self.timeout = timeout;
    }

    /// Creates the data buffer for `layout.kind`. A stride smaller than the
    /// kind's parameter block would let neighbouring slots overlap and is
    /// rejected.
    pub fn register(
        &mut self,
        device: &mut dyn RenderDevice,
        layout: MaterialParamsLayout,
        initial_capacity: u32,
    ) -> RenderResult<()> {
        let required = layout.kind.params_size() as u32;
        if layout.stride < required || layout.stride % 16 != 0 {
            return Err(RenderError::Configuration(format!(
                "{} material stride {} does not fit its {} byte parameter block",
                layout.kind.label(),
                layout.stride,
                required
            )));
        }
        if self.buffers.contains_key(&layout.kind) {
            log::warn!("{} material buffer registered twice", layout.kind.label());
            return Ok(());
        }

        let capacity = initial_capacity.max(1);
        let stride = layout.stride as u64;
        let buffer = device.create_buffer(&BufferDesc {
            label: layout.kind.label(),
            size: capacity as u64 * stride,
            usage: BufferUsage::Storage,
        })?;
        log::info!(
            "Registered {} material buffer: {} entries of {} bytes",
            layout.kind.label(),
            capacity,
            stride
        );

        self.buffers.insert(
            layout.kind,
            MaterialDataBuffer {
                kind: layout.kind,
                stride,
                buffer,
                shadow: vec![0; (capacity as u64 * stride) as usize],
                entry_count: 0,
                capacity,
                free: Vec::new(),
                dirty: None,
            },
        );
        Ok(())
    }

    pub fn is_registered(&self, kind: MaterialKind) -> bool {
        self.buffers.contains_key(&kind)
    }

    pub fn buffer(&self, kind: MaterialKind) -> Option<&MaterialDataBuffer> {
        self.buffers.get(&kind)
    }

    pub fn binding(&self, kind: MaterialKind) -> Option<BufferSlice> {
        self.buffers.get(&kind).map(MaterialDataBuffer::binding)
    }

    /// Slots freed but still waiting for the GPU, sealed or not.
    pub fn pending_count(&self) -> usize {
        self.open_frees.len() + self.pending.iter().map(|p| p.indices.len()).sum::<usize>()
    }

    /// Number of buffer growths since the last call.
    pub fn take_growths(&mut self) -> u32 {
        std::mem::take(&mut self.growths)
    }

    /// Returns a slot in the `kind` buffer: a reclaimed index first, then the
    /// next contiguous one, growing the buffer when it is full. Existing
    /// indices never move.
    ///
    /// When growth is impossible and frees are still pending, waits (bounded)
    /// for the oldest pending batch before giving up with
    /// [`RenderError::BufferExhausted`].
    pub fn allocate(
        &mut self,
        device: &mut dyn RenderDevice,
        kind: MaterialKind,
    ) -> RenderResult<u32> {
        loop {
            let buffer = self.buffers.get_mut(&kind).ok_or_else(|| {
                RenderError::Configuration(format!(
                    "no material buffer registered for {}",
                    kind.label()
                ))
            })?;

            if let Some(index) = buffer.free.pop() {
                return Ok(index);
            }

            if buffer.entry_count < buffer.capacity {
                let index = buffer.entry_count;
                buffer.entry_count += 1;
                return Ok(index);
            }

            let capacity = buffer.capacity;
            match Self::grow(buffer, device, self.max_capacity) {
                Ok(retired) => {
                    self.open_retired.push(retired);
                    self.growths += 1;
                    continue;
                }
                Err(err) => {
                    log::warn!("{} material buffer cannot grow: {}", kind.label(), err);
                }
            }

            if !self.wait_oldest_pending(device, kind)? {
                log::error!(
                    "{} material buffer exhausted at {} entries",
                    kind.label(),
                    capacity
                );
                return Err(RenderError::BufferExhausted { kind, capacity });
            }
        }
    }

    /// Doubles `buffer` (bounded by `max_capacity`), copying the old contents
    /// on the device. Returns the old device buffer, which in-flight frames
    /// may still read.
    fn grow(
        buffer: &mut MaterialDataBuffer,
        device: &mut dyn RenderDevice,
        max_capacity: u32,
    ) -> RenderResult<BufferId> {
        let new_capacity = buffer.capacity.saturating_mul(2).min(max_capacity);
        if new_capacity <= buffer.capacity {
            return Err(RenderError::BufferExhausted {
                kind: buffer.kind,
                capacity: buffer.capacity,
            });
        }

        log::info!(
            "Growing {} material buffer: {} -> {}",
            buffer.kind.label(),
            buffer.capacity,
            new_capacity
        );

        let old_size = buffer.capacity as u64 * buffer.stride;
        let new_size = new_capacity as u64 * buffer.stride;
        let new_buffer = device.create_buffer(&BufferDesc {
            label: buffer.kind.label(),
            size: new_size,
            usage: BufferUsage::Storage,
        })?;
        if let Err(err) = device.copy_buffer(buffer.buffer, new_buffer, old_size) {
            device.destroy_buffer(new_buffer);
            return Err(err.into());
        }

        let old_buffer = std::mem::replace(&mut buffer.buffer, new_buffer);
        buffer.shadow.resize(new_size as usize, 0);
        buffer.capacity = new_capacity;
        Ok(old_buffer)
    }

    /// Blocks on the oldest sealed batch of frees for `kind`, then reclaims.
    /// Returns false when nothing was pending.
    fn wait_oldest_pending(
        &mut self,
        device: &mut dyn RenderDevice,
        kind: MaterialKind,
    ) -> RenderResult<bool> {
        let Some(pending) = self.pending.iter().find(|p| p.kind == kind) else {
            return Ok(false);
        };
        let fence = pending.fence.clone();
        let frame = pending.frame;
        log::debug!(
            "{} material buffer full, waiting for frees of frame {}",
            kind.label(),
            frame
        );
        wait_for_fence(device, &fence, self.timeout, frame)?;
        self.reclaim(device);
        Ok(true)
    }

    /// Queues `index` for reuse once the GPU is done with the current frame.
    pub fn free(&mut self, kind: MaterialKind, index: u32) {
        match self.buffers.get(&kind) {
            Some(buffer) if index < buffer.entry_count => {
                self.open_frees.push((kind, index));
            }
            _ => log::warn!(
                "Ignoring free of unknown {} material slot {}",
                kind.label(),
                index
            ),
        }
    }

    /// Packs `material` into its slot of the CPU-side copy.
    pub fn write(&mut self, slot: u32, material: &Material) -> RenderResult<()> {
        let kind = material.kind();
        let buffer = self.buffers.get_mut(&kind).ok_or_else(|| {
            RenderError::Configuration(format!(
                "no material buffer registered for {}",
                kind.label()
            ))
        })?;
        if slot >= buffer.entry_count {
            return Err(RenderError::Configuration(format!(
                "{} material slot {} was never allocated",
                kind.label(),
                slot
            )));
        }

        let start = slot as u64 * buffer.stride;
        let end = start + buffer.stride;
        material.write_parameters(&mut buffer.shadow[start as usize..end as usize])?;
        buffer.mark_dirty(start..end);
        Ok(())
    }

    /// Uploads the dirty byte range of every buffer.
    pub fn flush(&mut self, device: &mut dyn RenderDevice) -> RenderResult<()> {
        for buffer in self.buffers.values_mut() {
            if let Some(range) = buffer.dirty.take() {
                device.write_buffer(
                    buffer.buffer,
                    range.start,
                    &buffer.shadow[range.start as usize..range.end as usize],
                )?;
            }
        }
        Ok(())
    }

    /// Tags everything freed or retired since the last call with `fence`, the
    /// completion token of `frame`'s submission.
    pub fn seal_frame(&mut self, frame: u64, fence: &GpuFence) {
        let mut by_kind: BTreeMap<MaterialKind, Vec<u32>> = BTreeMap::new();
        for (kind, index) in self.open_frees.drain(..) {
            by_kind.entry(kind).or_default().push(index);
        }
        for (kind, indices) in by_kind {
            self.pending.push_back(PendingFree {
                kind,
                indices,
                frame,
                fence: fence.clone(),
            });
        }

        self.retired
            .extend(self.open_retired.drain(..).map(|buffer| RetiredBuffer {
                buffer,
                fence: fence.clone(),
            }));
    }

    /// Moves every pending batch whose fence has signaled onto its free list
    /// and destroys retired buffers the GPU no longer reads. Never blocks.
    pub fn reclaim(&mut self, device: &mut dyn RenderDevice) {
        let buffers = &mut self.buffers;
        self.pending.retain(|pending| {
            if !pending.fence.is_signaled() {
                return true;
            }
            if let Some(buffer) = buffers.get_mut(&pending.kind) {
                buffer.free.extend(pending.indices.iter().rev().copied());
            }
            false
        });

        self.retired.retain(|retired| {
            if retired.fence.is_signaled() {
                device.destroy_buffer(retired.buffer);
                false
            } else {
                true
            }
        });
    }

    /// Releases every device buffer. Callers must have waited for the GPU.
    pub fn destroy(&mut self, device: &mut dyn RenderDevice) {
        for buffer in std::mem::take(&mut self.buffers).into_values() {
            device.destroy_buffer(buffer.buffer);
        }
        for retired in self.retired.drain(..) {
            device.destroy_buffer(retired.buffer);
        }
        for buffer in self.open_retired.drain(..) {
            device.destroy_buffer(buffer);
        }
        self.open_frees.clear();
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::headless::{FenceMode, HeadlessDevice};
    use glam::Vec3;

    fn manager(device: &mut HeadlessDevice, initial: u32, max: u32) -> MaterialBufferManager {
        let mut manager = MaterialBufferManager::new(
            &MaterialBufferSettings {
                initial_capacity: initial,
                max_capacity: max,
            },
            Duration::from_millis(5),
        );
        manager
            .register(device, MaterialParamsLayout::packed(MaterialKind::Flat), initial)
            .unwrap();
        manager
    }

    #[test]
    fn unregistered_kind_is_a_configuration_error() {
        let mut device = HeadlessDevice::new();
        let mut manager = manager(&mut device, 4, 4);
        assert!(matches!(
            manager.allocate(&mut device, MaterialKind::BlinnPhongSolid),
            Err(RenderError::Configuration(_))
        ));
    }

    #[test]
    fn narrow_stride_is_rejected() {
        let mut device = HeadlessDevice::new();
        let mut manager = manager(&mut device, 4, 4);
        let layout = MaterialParamsLayout {
            kind: MaterialKind::BlinnPhongTextured,
            stride: 32,
        };
        assert!(matches!(
            manager.register(&mut device, layout, 4),
            Err(RenderError::Configuration(_))
        ));
    }

    #[test]
    fn growth_copies_existing_contents() {
        let mut device = HeadlessDevice::new();
        let mut manager = manager(&mut device, 1, 8);

        let first = manager.allocate(&mut device, MaterialKind::Flat).unwrap();
        manager
            .write(first, &Material::flat(Vec3::new(1.0, 0.0, 0.0)))
            .unwrap();
        manager.flush(&mut device).unwrap();
        let old = manager.buffer(MaterialKind::Flat).unwrap().buffer();

        let second = manager.allocate(&mut device, MaterialKind::Flat).unwrap();
        assert_eq!((first, second), (0, 1));
        assert_eq!(manager.take_growths(), 1);

        let grown = manager.buffer(MaterialKind::Flat).unwrap();
        assert_eq!(grown.capacity(), 2);
        assert_ne!(grown.buffer(), old);
        let bytes = device.buffer_contents(grown.buffer()).unwrap();
        assert_eq!(&bytes[..4], &1.0f32.to_le_bytes());
    }

    #[test]
    fn retired_buffers_are_destroyed_after_their_fence() {
        let mut device = HeadlessDevice::with_fence_mode(FenceMode::Manual);
        let mut manager = manager(&mut device, 1, 8);
        let live = device.live_buffer_count();

        manager.allocate(&mut device, MaterialKind::Flat).unwrap();
        manager.allocate(&mut device, MaterialKind::Flat).unwrap();
        assert_eq!(device.live_buffer_count(), live + 1);

        let fence = device.submit();
        manager.seal_frame(0, &fence);
        manager.reclaim(&mut device);
        assert_eq!(device.live_buffer_count(), live + 1);

        fence.signal();
        manager.reclaim(&mut device);
        assert_eq!(device.live_buffer_count(), live);
    }

    #[test]
    fn exhaustion_waits_for_pending_frees_then_times_out() {
        let mut device = HeadlessDevice::with_fence_mode(FenceMode::Manual);
        let mut manager = manager(&mut device, 2, 2);

        let a = manager.allocate(&mut device, MaterialKind::Flat).unwrap();
        manager.allocate(&mut device, MaterialKind::Flat).unwrap();
        manager.free(MaterialKind::Flat, a);
        let fence = device.submit();
        manager.seal_frame(0, &fence);

        assert!(matches!(
            manager.allocate(&mut device, MaterialKind::Flat),
            Err(RenderError::SyncTimeout { frame: 0, .. })
        ));

        fence.signal();
        assert_eq!(manager.allocate(&mut device, MaterialKind::Flat).unwrap(), a);
        assert!(matches!(
            manager.allocate(&mut device, MaterialKind::Flat),
            Err(RenderError::BufferExhausted { capacity: 2, .. })
        ));
    }

    #[test]
    fn failed_device_growth_leaves_state_untouched() {
        let mut device = HeadlessDevice::new();
        let mut manager = manager(&mut device, 2, 64);
        manager.allocate(&mut device, MaterialKind::Flat).unwrap();
        manager.allocate(&mut device, MaterialKind::Flat).unwrap();

        device.set_max_buffer_size(Some(32));
        assert!(matches!(
            manager.allocate(&mut device, MaterialKind::Flat),
            Err(RenderError::BufferExhausted { capacity: 2, .. })
        ));
        let buffer = manager.buffer(MaterialKind::Flat).unwrap();
        assert_eq!(buffer.entry_count(), 2);
        assert_eq!(buffer.free_count(), 0);
    }
}
