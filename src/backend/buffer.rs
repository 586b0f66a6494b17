// Buffer utilities for vertex, index, uniform and staging buffers
//
// A buffer always owns the memory bound to it. Binding happens once, right
// after allocation, and both are released together on drop.

use std::sync::Arc;

use ash::vk;

use super::commands::OneShotCommands;
use super::{GpuDevice, RenderError, RenderResult};

/// Find a memory type index that is allowed by `type_filter` and has at
/// least the `required` property flags. The first match wins.
pub fn find_memory_type(
    table: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    required: vk::MemoryPropertyFlags,
) -> RenderResult<u32> {
    for i in 0..table.memory_type_count {
        let has_type = (type_filter & (1 << i)) != 0;
        let has_properties = table.memory_types[i as usize].property_flags.contains(required);

        if has_type && has_properties {
            return Ok(i);
        }
    }

    Err(RenderError::NoCompatibleMemory { type_filter, required })
}

/// Allocate memory matching `requirements` with the given properties.
pub(crate) fn allocate_for(
    device: &dyn GpuDevice,
    requirements: vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
) -> RenderResult<vk::DeviceMemory> {
    let memory_type_index = find_memory_type(device.memory_properties(), requirements.memory_type_bits, properties)?;
    Ok(device.allocate_memory(requirements.size, memory_type_index)?)
}

/// A buffer plus the memory permanently bound to it.
pub struct MemoryBackedBuffer {
    device: Arc<dyn GpuDevice>,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
}

impl MemoryBackedBuffer {
    pub fn new(
        device: &Arc<dyn GpuDevice>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> RenderResult<Self> {
        if size == 0 {
            return Err(RenderError::EmptyUpload);
        }

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = device.create_buffer(&buffer_info)?;

        let requirements = device.buffer_memory_requirements(buffer);
        let memory = match allocate_for(device.as_ref(), requirements, properties) {
            Ok(memory) => memory,
            Err(e) => {
                device.destroy_buffer(buffer);
                return Err(e);
            }
        };

        if let Err(e) = device.bind_buffer_memory(buffer, memory) {
            device.destroy_buffer(buffer);
            device.free_memory(memory);
            return Err(e.into());
        }

        Ok(Self {
            device: Arc::clone(device),
            buffer,
            memory,
            size,
        })
    }

    /// Create a buffer and fill it through a mapped write. `properties` must
    /// include `HOST_VISIBLE`.
    pub fn with_data<T: bytemuck::Pod>(
        device: &Arc<dyn GpuDevice>,
        data: &[T],
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> RenderResult<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let buffer = Self::new(device, bytes.len() as vk::DeviceSize, usage, properties)?;
        buffer.write(0, bytes)?;
        Ok(buffer)
    }

    /// Copy `bytes` into the buffer at `offset`. Host-visible buffers only.
    pub fn write(&self, offset: vk::DeviceSize, bytes: &[u8]) -> RenderResult<()> {
        if offset + bytes.len() as vk::DeviceSize > self.size {
            return Err(RenderError::LengthMismatch {
                what: "buffer write",
                expected: self.size as usize,
                actual: offset as usize + bytes.len(),
            });
        }
        Ok(self.device.write_memory(self.memory, offset, bytes)?)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

impl Drop for MemoryBackedBuffer {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.buffer);
        self.device.free_memory(self.memory);
    }
}

/// Upload `data` into a new buffer with `usage` and `properties`, usually
/// device-local memory the host cannot map.
///
/// Goes through a host-coherent staging buffer and a one-shot transfer, and
/// blocks until the copy has finished. Meant for setup, not per frame.
pub fn upload_and_wait<T: bytemuck::Pod>(
    device: &Arc<dyn GpuDevice>,
    commands: &OneShotCommands,
    data: &[T],
    usage: vk::BufferUsageFlags,
    properties: vk::MemoryPropertyFlags,
) -> RenderResult<MemoryBackedBuffer> {
    let bytes: &[u8] = bytemuck::cast_slice(data);
    if bytes.is_empty() {
        return Err(RenderError::EmptyUpload);
    }
    let size = bytes.len() as vk::DeviceSize;

    let staging = MemoryBackedBuffer::with_data(
        device,
        bytes,
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;
    let destination = MemoryBackedBuffer::new(device, size, usage | vk::BufferUsageFlags::TRANSFER_DST, properties)?;

    let cmd = commands.begin()?;
    let region = vk::BufferCopy {
        src_offset: 0,
        dst_offset: 0,
        size,
    };
    device.cmd_copy_buffer(cmd, staging.handle(), destination.handle(), &[region]);
    commands.submit_and_wait(cmd)?;

    log::debug!("Uploaded {} bytes to device buffer {:?}", size, destination.handle());
    Ok(destination)
}
