// Swapchain - Window presentation
//
// Picks format, present mode, extent and image count for the window surface,
// owns the swapchain and one view per image. A `SurfaceState` is never
// resized in place: when the surface goes stale the renderer drops it and
// creates a new one.

use std::sync::Arc;

use ash::vk;

use super::{GpuDevice, RenderError, RenderResult, SurfaceSupport};

/// Result of a successful acquire or present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceStatus {
    Optimal,
    /// Still usable, but the swapchain no longer matches the surface exactly.
    Suboptimal,
}

impl SurfaceStatus {
    fn from_suboptimal(suboptimal: bool) -> Self {
        if suboptimal {
            Self::Suboptimal
        } else {
            Self::Optimal
        }
    }

    pub fn is_suboptimal(self) -> bool {
        self == Self::Suboptimal
    }
}

/// Prefer sRGB BGRA, otherwise take whatever the surface lists first.
pub fn choose_format(formats: &[vk::SurfaceFormatKHR]) -> RenderResult<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .or_else(|| formats.first())
        .copied()
        .ok_or(RenderError::NoSurfaceFormat)
}

/// Use `preferred` when the surface offers it. FIFO is always supported.
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], preferred: vk::PresentModeKHR) -> vk::PresentModeKHR {
    if modes.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// The surface dictates the extent unless it reports the `u32::MAX`
/// sentinel, in which case the drawable size is clamped into range.
pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, drawable: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    vk::Extent2D {
        width: drawable
            .width
            .clamp(capabilities.min_image_extent.width, capabilities.max_image_extent.width),
        height: drawable
            .height
            .clamp(capabilities.min_image_extent.height, capabilities.max_image_extent.height),
    }
}

/// One more than the minimum, capped by the maximum (0 means unbounded).
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut image_count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 && image_count > capabilities.max_image_count {
        image_count = capabilities.max_image_count;
    }
    image_count
}

/// Images are shared between queues only when graphics and present live in
/// different families.
pub fn choose_sharing(graphics_family: u32, present_family: u32) -> (vk::SharingMode, Vec<u32>) {
    if graphics_family != present_family {
        (vk::SharingMode::CONCURRENT, vec![graphics_family, present_family])
    } else {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    }
}

/// A swapchain, its images and one colour view per image.
pub struct SurfaceState {
    device: Arc<dyn GpuDevice>,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    extent: vk::Extent2D,
    format: vk::Format,
    present_mode: vk::PresentModeKHR,
    present_queue: vk::Queue,
}

impl SurfaceState {
    pub fn create(
        device: &Arc<dyn GpuDevice>,
        drawable: vk::Extent2D,
        preferred_mode: vk::PresentModeKHR,
    ) -> RenderResult<Self> {
        let support: SurfaceSupport = device.surface_support()?;

        let surface_format = choose_format(&support.formats)?;
        let present_mode = choose_present_mode(&support.present_modes, preferred_mode);
        let extent = choose_extent(&support.capabilities, drawable);
        let image_count = choose_image_count(&support.capabilities);

        let families = device.queue_families();
        let (sharing_mode, family_indices) = choose_sharing(families.graphics, families.present);

        log::info!(
            "Creating swapchain: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            image_count,
            surface_format.format,
            present_mode
        );

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&family_indices)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let swapchain = device.create_swapchain(&create_info)?;

        // From here on Drop cleans up whatever has been created
        let mut state = Self {
            device: Arc::clone(device),
            swapchain,
            images: Vec::new(),
            views: Vec::new(),
            extent,
            format: surface_format.format,
            present_mode,
            present_queue: device.present_queue(),
        };

        state.images = device.swapchain_images(swapchain)?;
        log::info!("Created swapchain with {} images", state.images.len());

        for &image in &state.images {
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            let view = device.create_image_view(&view_info)?;
            state.views.push(view);
        }

        Ok(state)
    }

    /// Acquire the next presentable image, signalling `signal` when it is
    /// ready to be rendered to.
    pub fn acquire_next_image(&self, signal: vk::Semaphore) -> RenderResult<(u32, SurfaceStatus)> {
        match self.device.acquire_next_image(self.swapchain, signal) {
            Ok((index, suboptimal)) => Ok((index, SurfaceStatus::from_suboptimal(suboptimal))),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(RenderError::SurfaceOutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    /// Queue image `image_index` for presentation once `wait` is signalled.
    pub fn present(&self, wait: vk::Semaphore, image_index: u32) -> RenderResult<SurfaceStatus> {
        match self
            .device
            .queue_present(self.present_queue, self.swapchain, image_index, wait)
        {
            Ok(suboptimal) => Ok(SurfaceStatus::from_suboptimal(suboptimal)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(RenderError::SurfaceOutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn views(&self) -> &[vk::ImageView] {
        &self.views
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }
}

impl Drop for SurfaceState {
    fn drop(&mut self) {
        for &view in &self.views {
            self.device.destroy_image_view(view);
        }
        self.device.destroy_swapchain(self.swapchain);
    }
}
