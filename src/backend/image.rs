// Images with bound memory and the layout transitions they go through
//
// Same allocation path as buffers. Layout changes are limited to the small
// table in `barrier_for`; anything outside it is a bug in the caller.
//
// The quad renderer samples no textures. `upload_image_and_wait` is the
// image half of the resource factory and is driven only by its tests.

use std::sync::Arc;

use ash::vk;

use super::buffer::{allocate_for, MemoryBackedBuffer};
use super::commands::OneShotCommands;
use super::{GpuDevice, RenderError, RenderResult};

/// Creation parameters for a 2D image.
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub mip_levels: u32,
}

impl ImageDesc {
    /// A single-mip optimal-tiling image to sample from after an upload.
    pub fn sampled(extent: vk::Extent2D, format: vk::Format) -> Self {
        Self {
            extent,
            format,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            mip_levels: 1,
        }
    }
}

/// Access masks and pipeline stages for one layout transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutBarrier {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Look up the synchronization scopes for an `old -> new` layout change.
pub fn barrier_for(old: vk::ImageLayout, new: vk::ImageLayout) -> RenderResult<LayoutBarrier> {
    use vk::ImageLayout as L;

    let barrier = match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => LayoutBarrier {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        },
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => LayoutBarrier {
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        },
        (L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => LayoutBarrier {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        },
        _ => return Err(RenderError::UnsupportedLayoutTransition { old, new }),
    };

    Ok(barrier)
}

fn aspect_for(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D32_SFLOAT | vk::Format::D16_UNORM => vk::ImageAspectFlags::DEPTH,
        vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// An image plus the memory permanently bound to it.
pub struct MemoryBackedImage {
    device: Arc<dyn GpuDevice>,
    image: vk::Image,
    memory: vk::DeviceMemory,
    desc: ImageDesc,
}

impl MemoryBackedImage {
    pub fn new(device: &Arc<dyn GpuDevice>, desc: ImageDesc, properties: vk::MemoryPropertyFlags) -> RenderResult<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(1)
            .format(desc.format)
            .tiling(desc.tiling)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let image = device.create_image(&image_info)?;

        let requirements = device.image_memory_requirements(image);
        let memory = match allocate_for(device.as_ref(), requirements, properties) {
            Ok(memory) => memory,
            Err(e) => {
                device.destroy_image(image);
                return Err(e);
            }
        };

        if let Err(e) = device.bind_image_memory(image, memory) {
            device.destroy_image(image);
            device.free_memory(memory);
            return Err(e.into());
        }

        Ok(Self {
            device: Arc::clone(device),
            image,
            memory,
            desc,
        })
    }

    /// Record a layout transition covering every mip level.
    pub fn record_transition(
        &self,
        cmd: vk::CommandBuffer,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    ) -> RenderResult<()> {
        let scopes = barrier_for(old, new)?;

        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(old)
            .new_layout(new)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(self.subresource_range())
            .src_access_mask(scopes.src_access)
            .dst_access_mask(scopes.dst_access)
            .build();

        self.device
            .cmd_pipeline_barrier(cmd, scopes.src_stage, scopes.dst_stage, &[barrier]);
        Ok(())
    }

    /// Create a 2D view over the whole image. The caller owns the view.
    pub fn create_view(&self) -> RenderResult<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(self.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(self.desc.format)
            .subresource_range(self.subresource_range());

        Ok(self.device.create_image_view(&view_info)?)
    }

    fn subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: aspect_for(self.desc.format),
            base_mip_level: 0,
            level_count: self.desc.mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    pub fn handle(&self) -> vk::Image {
        self.image
    }

    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.desc.extent
    }

    pub fn format(&self) -> vk::Format {
        self.desc.format
    }

    pub fn tiling(&self) -> vk::ImageTiling {
        self.desc.tiling
    }

    pub fn mip_levels(&self) -> u32 {
        self.desc.mip_levels
    }
}

impl Drop for MemoryBackedImage {
    fn drop(&mut self) {
        self.device.destroy_image(self.image);
        self.device.free_memory(self.memory);
    }
}

/// Upload tightly packed 4-byte texels into a new device-local image and
/// leave it in `SHADER_READ_ONLY_OPTIMAL`. Blocks until the GPU is done.
pub fn upload_image_and_wait(
    device: &Arc<dyn GpuDevice>,
    commands: &OneShotCommands,
    pixels: &[u8],
    desc: ImageDesc,
) -> RenderResult<MemoryBackedImage> {
    let expected = desc.extent.width as usize * desc.extent.height as usize * 4;
    if pixels.len() != expected {
        return Err(RenderError::LengthMismatch {
            what: "image pixels",
            expected,
            actual: pixels.len(),
        });
    }

    let staging = MemoryBackedBuffer::with_data(
        device,
        pixels,
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;
    let image = MemoryBackedImage::new(device, desc, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;

    // Transition for the copy
    let cmd = commands.begin()?;
    image.record_transition(cmd, vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
    commands.submit_and_wait(cmd)?;

    // Copy texels
    let cmd = commands.begin()?;
    let region = vk::BufferImageCopy {
        buffer_offset: 0,
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        },
        image_offset: vk::Offset3D::default(),
        image_extent: vk::Extent3D {
            width: desc.extent.width,
            height: desc.extent.height,
            depth: 1,
        },
    };
    device.cmd_copy_buffer_to_image(
        cmd,
        staging.handle(),
        image.handle(),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        &[region],
    );
    commands.submit_and_wait(cmd)?;

    // Hand over to the fragment shader
    let cmd = commands.begin()?;
    image.record_transition(
        cmd,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    )?;
    commands.submit_and_wait(cmd)?;

    log::debug!(
        "Uploaded {}x{} image {:?}",
        desc.extent.width,
        desc.extent.height,
        image.handle()
    );
    Ok(image)
}
