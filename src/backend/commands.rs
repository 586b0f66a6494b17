// Command pools and one-shot command submission
//
// Frame command buffers come from a long-lived `CommandPool`. Setup work
// (uploads, layout transitions) goes through `OneShotCommands`, which records
// a throwaway buffer, submits it on the graphics queue and blocks on a fence.

use std::sync::Arc;

use ash::vk;

use super::{GpuDevice, RenderResult, Submission};

/// Owned command pool. Destroying it frees every buffer allocated from it.
pub struct CommandPool {
    device: Arc<dyn GpuDevice>,
    pool: vk::CommandPool,
}

impl CommandPool {
    pub fn new(device: &Arc<dyn GpuDevice>, queue_family: u32, flags: vk::CommandPoolCreateFlags) -> RenderResult<Self> {
        let pool = device.create_command_pool(queue_family, flags)?;
        Ok(Self {
            device: Arc::clone(device),
            pool,
        })
    }

    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Allocate `count` primary command buffers.
    pub fn allocate(&self, count: u32) -> RenderResult<Vec<vk::CommandBuffer>> {
        Ok(self.device.allocate_command_buffers(self.pool, count)?)
    }

    pub fn free(&self, buffers: &[vk::CommandBuffer]) {
        if !buffers.is_empty() {
            self.device.free_command_buffers(self.pool, buffers);
        }
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        self.device.destroy_command_pool(self.pool);
    }
}

/// Blocking single-use command submission on the graphics queue.
pub struct OneShotCommands {
    device: Arc<dyn GpuDevice>,
    pool: CommandPool,
}

impl OneShotCommands {
    pub fn new(device: &Arc<dyn GpuDevice>) -> RenderResult<Self> {
        let family = device.queue_families().graphics;
        let pool = CommandPool::new(device, family, vk::CommandPoolCreateFlags::TRANSIENT)?;
        Ok(Self {
            device: Arc::clone(device),
            pool,
        })
    }

    /// Allocate a primary command buffer and begin it for one submission.
    pub fn begin(&self) -> RenderResult<vk::CommandBuffer> {
        let cmd = self
            .pool
            .allocate(1)?
            .into_iter()
            .next()
            .ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)?;

        if let Err(e) = self
            .device
            .begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
        {
            self.pool.free(&[cmd]);
            return Err(e.into());
        }
        Ok(cmd)
    }

    /// End `cmd`, submit it with a fresh fence, wait for completion and
    /// release the buffer. The buffer is freed even when submission fails.
    pub fn submit_and_wait(&self, cmd: vk::CommandBuffer) -> RenderResult<()> {
        let result = self.submit_inner(cmd);
        self.pool.free(&[cmd]);
        result
    }

    fn submit_inner(&self, cmd: vk::CommandBuffer) -> RenderResult<()> {
        self.device.end_command_buffer(cmd)?;

        let fence = self.device.create_fence(false)?;
        let command_buffers = [cmd];
        let submission = Submission {
            command_buffers: &command_buffers,
            ..Default::default()
        };

        let result = self
            .device
            .queue_submit(self.device.graphics_queue(), &submission, fence)
            .and_then(|()| self.device.wait_for_fence(fence, u64::MAX));
        self.device.destroy_fence(fence);

        Ok(result?)
    }
}
