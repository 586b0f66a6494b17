// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync. `FramePacer` owns one
// `FrameSync` per frame in flight and is the only thing that decides which
// slot is active, so at most `frames_in_flight` submissions are ever pending.

use std::sync::Arc;

use ash::vk;

use super::{GpuDevice, RenderError, RenderResult};

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &dyn GpuDevice) -> RenderResult<Self> {
        let image_available = device.create_semaphore()?;

        let render_finished = match device.create_semaphore() {
            Ok(semaphore) => semaphore,
            Err(e) => {
                device.destroy_semaphore(image_available);
                return Err(e.into());
            }
        };

        // Start signaled so the first wait on a fresh slot returns at once
        let in_flight_fence = match device.create_fence(true) {
            Ok(fence) => fence,
            Err(e) => {
                device.destroy_semaphore(image_available);
                device.destroy_semaphore(render_finished);
                return Err(e.into());
            }
        };

        Ok(Self {
            image_available,
            render_finished,
            in_flight_fence,
        })
    }

    pub fn destroy(&self, device: &dyn GpuDevice) {
        device.destroy_semaphore(self.image_available);
        device.destroy_semaphore(self.render_finished);
        device.destroy_fence(self.in_flight_fence);
    }
}

/// Ring of frame slots plus the record of which slot last rendered to each
/// swapchain image.
pub struct FramePacer {
    device: Arc<dyn GpuDevice>,
    slots: Vec<FrameSync>,
    current: usize,
    images_in_flight: Vec<Option<usize>>,
}

impl FramePacer {
    pub fn new(device: &Arc<dyn GpuDevice>, frames_in_flight: usize) -> RenderResult<Self> {
        if frames_in_flight == 0 {
            return Err(RenderError::InvalidConfig(
                "frames in flight must be at least 1".to_string(),
            ));
        }

        let mut pacer = Self {
            device: Arc::clone(device),
            slots: Vec::with_capacity(frames_in_flight),
            current: 0,
            images_in_flight: Vec::new(),
        };
        for _ in 0..frames_in_flight {
            pacer.slots.push(FrameSync::new(device.as_ref())?);
        }

        log::debug!("Frame pacer ready with {} slots", frames_in_flight);
        Ok(pacer)
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// The active slot's primitives.
    pub fn current(&self) -> &FrameSync {
        &self.slots[self.current]
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    /// Move to the next slot in the ring.
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
    }

    /// Block until the GPU has finished the last submission made from the
    /// active slot.
    pub fn wait_for_slot(&self) -> RenderResult<()> {
        Ok(self
            .device
            .wait_for_fence(self.current().in_flight_fence, u64::MAX)?)
    }

    /// Mark `image_index` as used by the active slot. If another slot still
    /// has work in flight on that image, wait for it first.
    pub fn claim_image(&mut self, image_index: u32) -> RenderResult<()> {
        let count = self.images_in_flight.len();
        let entry = self
            .images_in_flight
            .get(image_index as usize)
            .copied()
            .ok_or(RenderError::ImageIndexOutOfRange { index: image_index, count })?;

        if let Some(owner) = entry {
            if owner != self.current {
                log::trace!("Image {} still in use by slot {}, waiting", image_index, owner);
                self.device
                    .wait_for_fence(self.slots[owner].in_flight_fence, u64::MAX)?;
            }
        }

        self.images_in_flight[image_index as usize] = Some(self.current);
        Ok(())
    }

    /// Reset the active slot's fence and hand it out for the submit that
    /// immediately follows.
    pub fn begin_submit(&self) -> RenderResult<vk::Fence> {
        let fence = self.current().in_flight_fence;
        self.device.reset_fence(fence)?;
        Ok(fence)
    }

    /// Forget image ownership after the swapchain was rebuilt.
    pub fn reset_images(&mut self, image_count: usize) {
        self.images_in_flight = vec![None; image_count];
    }
}

impl Drop for FramePacer {
    fn drop(&mut self) {
        for slot in &self.slots {
            slot.destroy(self.device.as_ref());
        }
    }
}
