use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{RenderError, RenderResult};
use crate::renderer::device::RenderDevice;

const POLL_INTERVAL: Duration = Duration::from_micros(200);

struct FenceState {
    submission: u64,
    signaled: AtomicBool,
}

/// Completion token for one device submission.
///
/// Clones share state. Backends signal it from whatever context their
/// completion notification arrives on.
#[derive(Clone)]
pub struct GpuFence {
    state: Arc<FenceState>,
}

impl GpuFence {
    pub fn new(submission: u64) -> Self {
        Self {
            state: Arc::new(FenceState {
                submission,
                signaled: AtomicBool::new(false),
            }),
        }
    }

    /// A fence that is already complete, for work that never reached the GPU.
    pub fn signaled(submission: u64) -> Self {
        let fence = Self::new(submission);
        fence.signal();
        fence
    }

    pub fn submission(&self) -> u64 {
        self.state.submission
    }

    pub fn is_signaled(&self) -> bool {
        self.state.signaled.load(Ordering::Acquire)
    }

    pub fn signal(&self) {
        self.state.signaled.store(true, Ordering::Release);
    }
}

impl fmt::Debug for GpuFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuFence")
            .field("submission", &self.submission())
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

/// Blocks until `fence` signals, polling the device, or fails with
/// [`RenderError::SyncTimeout`] once `timeout` has elapsed.
pub fn wait_for_fence(
    device: &mut dyn RenderDevice,
    fence: &GpuFence,
    timeout: Duration,
    frame: u64,
) -> RenderResult<()> {
    if fence.is_signaled() {
        return Ok(());
    }

    let start = Instant::now();
    loop {
        device.poll();
        if fence.is_signaled() {
            log::debug!(
                "Waited {:?} for submission {} (frame {})",
                start.elapsed(),
                fence.submission(),
                frame
            );
            return Ok(());
        }
        if start.elapsed() >= timeout {
            log::error!(
                "Submission {} for frame {} still pending after {:?}",
                fence.submission(),
                frame,
                timeout
            );
            return Err(RenderError::SyncTimeout { frame, timeout });
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::headless::HeadlessDevice;

    #[test]
    fn clones_share_completion() {
        let fence = GpuFence::new(7);
        let observer = fence.clone();
        assert!(!observer.is_signaled());
        fence.signal();
        assert!(observer.is_signaled());
        assert_eq!(observer.submission(), 7);
    }

    #[test]
    fn wait_times_out_on_unsignaled_fence() {
        let mut device = HeadlessDevice::new();
        let fence = GpuFence::new(1);
        let result = wait_for_fence(&mut device, &fence, Duration::from_millis(5), 4);
        assert_eq!(
            result,
            Err(RenderError::SyncTimeout {
                frame: 4,
                timeout: Duration::from_millis(5)
            })
        );
    }

    #[test]
    fn wait_returns_once_signaled_elsewhere() {
        let mut device = HeadlessDevice::new();
        let fence = GpuFence::new(1);
        let remote = fence.clone();
        let signaler = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            remote.signal();
        });

        wait_for_fence(&mut device, &fence, Duration::from_secs(5), 0).unwrap();
        assert!(fence.is_signaled());
        signaler.join().unwrap();
    }
}
