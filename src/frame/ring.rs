//! Bounded ring of per-frame synchronization and command objects.

use crate::backend::traits::*;
use crate::backend::types::PipelineStages;
use std::time::Duration;

/// Index of a frame-in-flight slot.
///
/// Distinct from [`ImageIndex`]: the ring cursor and the presentable image the
/// platform hands back are independent counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotIndex(pub usize);

/// Index of a presentable swapchain image, as returned by acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageIndex(pub u32);

/// How long the CPU may block on a slot fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitPolicy {
    /// Block until the GPU signals, however long it takes.
    #[default]
    Infinite,
    /// Fail with [`BackendError::Timeout`] once the duration elapses.
    Timeout(Duration),
}

impl WaitPolicy {
    pub fn as_timeout(&self) -> Option<Duration> {
        match self {
            WaitPolicy::Infinite => None,
            WaitPolicy::Timeout(timeout) => Some(*timeout),
        }
    }
}

/// Synchronization and command objects owned by one frame in flight.
#[derive(Debug, Clone, Copy)]
pub struct FrameSlot {
    pub fence: FenceHandle,
    pub image_available: SemaphoreHandle,
    pub render_finished: SemaphoreHandle,
    pub command_pool: CommandPoolHandle,
    pub command_buffer: CommandBufferHandle,
}

impl FrameSlot {
    fn new(device: &mut dyn GpuDevice) -> BackendResult<Self> {
        // Signaled so the first wait on a fresh slot returns immediately.
        let fence = device.create_fence(true)?;
        let image_available = device.create_semaphore()?;
        let render_finished = device.create_semaphore()?;
        let command_pool = device.create_command_pool(false)?;
        let command_buffer = device.allocate_command_buffer(command_pool)?;

        Ok(Self {
            fence,
            image_available,
            render_finished,
            command_pool,
            command_buffer,
        })
    }

    fn destroy(&self, device: &mut dyn GpuDevice) {
        device.free_command_buffer(self.command_pool, self.command_buffer);
        device.destroy_command_pool(self.command_pool);
        device.destroy_semaphore(self.render_finished);
        device.destroy_semaphore(self.image_available);
        device.destroy_fence(self.fence);
    }
}

/// Cycles a fixed number of [`FrameSlot`]s so the CPU can record frame k+1
/// while the GPU executes frame k.
///
/// ```text
/// acquire_slot   wait(fence)                       single CPU suspension point
/// begin_recording reset(fence), reset(pool), begin
///     ...        passes record into slot.command_buffer
/// submit         wait imageAvailable @ COLOR_ATTACHMENT_OUTPUT
///                signal renderFinished + fence
/// present        (swapchain) waits renderFinished
/// advance        cursor = (k + 1) mod N
/// ```
///
/// The fence wait follows the ring's [`WaitPolicy`]. With the default
/// `Infinite` policy a hung GPU blocks the caller forever; that is the
/// documented behavior, and a bounded timeout must be opted into.
pub struct FrameRing {
    slots: Vec<FrameSlot>,
    frame_number: u64,
    policy: WaitPolicy,
    recording: Option<SlotIndex>,
}

impl FrameRing {
    /// Preallocate `size` slots.
    pub fn new(device: &mut dyn GpuDevice, size: usize, policy: WaitPolicy) -> BackendResult<Self> {
        if size == 0 {
            return Err(BackendError::InitializationFailed(
                "frame ring needs at least one slot".into(),
            ));
        }

        let mut slots = Vec::with_capacity(size);
        for _ in 0..size {
            match FrameSlot::new(device) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    for slot in &slots {
                        slot.destroy(device);
                    }
                    return Err(e);
                }
            }
        }

        log::info!("Frame ring created with {} slots ({:?})", size, policy);

        Ok(Self {
            slots,
            frame_number: 0,
            policy,
            recording: None,
        })
    }

    /// Number of slots in the ring
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Total frames advanced so far
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn policy(&self) -> WaitPolicy {
        self.policy
    }

    /// Slot used by the given frame number.
    pub fn slot_index(&self, frame_number: u64) -> SlotIndex {
        SlotIndex((frame_number % self.slots.len() as u64) as usize)
    }

    /// Slot under the cursor.
    pub fn current_slot(&self) -> SlotIndex {
        self.slot_index(self.frame_number)
    }

    pub fn slot(&self, index: SlotIndex) -> &FrameSlot {
        &self.slots[index.0]
    }

    /// Wait until the slot under the cursor is no longer in flight.
    ///
    /// This is the only place the frame loop blocks on the GPU. The fence is
    /// *not* reset here: if image acquisition then reports out-of-date, the
    /// frame is abandoned and the fence must stay signaled for the next try.
    pub fn acquire_slot(&mut self, device: &mut dyn GpuDevice) -> BackendResult<SlotIndex> {
        let index = self.current_slot();
        let fence = self.slots[index.0].fence;

        log::trace!(
            "Frame {}: waiting on slot {} fence",
            self.frame_number,
            index.0
        );
        device
            .wait_for_fence(fence, self.policy.as_timeout())
            .map_err(|e| match e {
                BackendError::Timeout { timeout, .. } => BackendError::Timeout {
                    what: format!("frame slot {} fence", index.0),
                    timeout,
                },
                other => other,
            })?;

        Ok(index)
    }

    /// Reset the slot's fence and command pool and start recording.
    ///
    /// Must follow [`acquire_slot`](Self::acquire_slot) for the same slot.
    pub fn begin_recording(
        &mut self,
        device: &mut dyn GpuDevice,
        index: SlotIndex,
    ) -> BackendResult<CommandBufferHandle> {
        if index != self.current_slot() {
            return Err(BackendError::SynchronizationFailed(format!(
                "slot {} is not under the cursor (expected {})",
                index.0,
                self.current_slot().0
            )));
        }

        let slot = self.slots[index.0];
        device.reset_fence(slot.fence)?;
        device.reset_command_pool(slot.command_pool)?;
        device.begin_command_buffer(slot.command_buffer, true)?;
        self.recording = Some(index);

        Ok(slot.command_buffer)
    }

    /// End the slot's buffer and submit it, chaining
    /// imageAvailable → execution → renderFinished and signaling the fence.
    pub fn submit(&mut self, device: &mut dyn GpuDevice, index: SlotIndex) -> BackendResult<()> {
        if self.recording != Some(index) {
            return Err(BackendError::SubmitFailed(format!(
                "slot {} was not recording",
                index.0
            )));
        }

        let slot = self.slots[index.0];
        device.end_command_buffer(slot.command_buffer)?;
        device.submit(&SubmitInfo {
            command_buffer: slot.command_buffer,
            wait: Some((slot.image_available, PipelineStages::COLOR_ATTACHMENT_OUTPUT)),
            signal: Some(slot.render_finished),
            fence: Some(slot.fence),
        })?;
        self.recording = None;

        Ok(())
    }

    /// Move the cursor to the next slot.
    pub fn advance(&mut self) {
        self.frame_number += 1;
    }

    /// True when the slot's previous submission has completed.
    pub fn is_slot_ready(&self, device: &dyn GpuDevice, index: SlotIndex) -> BackendResult<bool> {
        device.is_fence_signaled(self.slots[index.0].fence)
    }

    /// Wait on every slot fence. Used before tearing anything down.
    ///
    /// A slot whose recording never reached submission has a reset fence
    /// that nothing will signal; it holds no GPU work and is skipped.
    pub fn wait_all(&self, device: &mut dyn GpuDevice) -> BackendResult<()> {
        for (i, slot) in self.slots.iter().enumerate() {
            if self.recording == Some(SlotIndex(i)) {
                log::debug!("Slot {} was never submitted, not waiting on it", i);
                continue;
            }
            device
                .wait_for_fence(slot.fence, self.policy.as_timeout())
                .map_err(|e| match e {
                    BackendError::Timeout { timeout, .. } => BackendError::Timeout {
                        what: format!("frame slot {} fence during shutdown", i),
                        timeout,
                    },
                    other => other,
                })?;
        }
        Ok(())
    }

    /// Release all slot objects. Call [`wait_all`](Self::wait_all) first.
    pub fn destroy(&mut self, device: &mut dyn GpuDevice) {
        for slot in self.slots.drain(..) {
            slot.destroy(device);
        }
        self.recording = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{DeviceCall, HeadlessConfig, HeadlessDevice};

    fn ring(device: &mut HeadlessDevice, size: usize) -> FrameRing {
        FrameRing::new(device, size, WaitPolicy::Infinite).unwrap()
    }

    #[test]
    fn test_zero_slots_rejected() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        assert!(FrameRing::new(&mut device, 0, WaitPolicy::Infinite).is_err());
    }

    #[test]
    fn test_slot_index_wraps() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let ring = ring(&mut device, 3);
        for k in 0..10u64 {
            assert_eq!(ring.slot_index(k), SlotIndex((k % 3) as usize));
        }
    }

    #[test]
    fn test_first_acquire_does_not_block() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let mut ring = ring(&mut device, 2);
        let slot = ring.acquire_slot(&mut device).unwrap();
        assert_eq!(slot, SlotIndex(0));
        assert!(ring.is_slot_ready(&device, slot).unwrap());
    }

    #[test]
    fn test_begin_recording_resets_after_wait() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let mut ring = ring(&mut device, 2);
        device.clear_call_log();

        let slot = ring.acquire_slot(&mut device).unwrap();
        ring.begin_recording(&mut device, slot).unwrap();

        let fence = ring.slot(slot).fence;
        let pool = ring.slot(slot).command_pool;
        let log = device.call_log();
        let wait = log
            .iter()
            .position(|c| *c == DeviceCall::WaitFence(fence))
            .unwrap();
        let reset = log
            .iter()
            .position(|c| *c == DeviceCall::ResetFence(fence))
            .unwrap();
        let pool_reset = log
            .iter()
            .position(|c| *c == DeviceCall::ResetCommandPool(pool))
            .unwrap();
        assert!(wait < reset);
        assert!(reset < pool_reset);
    }

    #[test]
    fn test_begin_recording_rejects_wrong_slot() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let mut ring = ring(&mut device, 2);
        assert!(ring.begin_recording(&mut device, SlotIndex(1)).is_err());
    }

    #[test]
    fn test_submit_requires_recording() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let mut ring = ring(&mut device, 2);
        assert!(ring.submit(&mut device, SlotIndex(0)).is_err());
    }

    #[test]
    fn test_timeout_policy_reports_slot() {
        let mut device = HeadlessDevice::new(HeadlessConfig {
            complete_submissions: false,
            ..HeadlessConfig::default()
        });
        let mut ring = FrameRing::new(
            &mut device,
            1,
            WaitPolicy::Timeout(Duration::from_millis(5)),
        )
        .unwrap();

        let slot = ring.acquire_slot(&mut device).unwrap();
        ring.begin_recording(&mut device, slot).unwrap();
        ring.submit(&mut device, slot).unwrap();
        ring.advance();

        match ring.acquire_slot(&mut device) {
            Err(BackendError::Timeout { what, .. }) => assert!(what.contains("slot 0")),
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}
