// Render loop driver
//
// FRAME FLOW:
// 1. Wait for the active slot's fence (at most N frames queued)
// 2. Acquire a swapchain image, signalling the slot's image-available semaphore
// 3. Wait out any other slot still rendering to that image
// 4. Reset the fence, write uniforms, submit the pre-recorded commands
// 5. Present once render-finished is signalled
// 6. Advance to the next slot
//
// A stale surface at acquire or present (or a resize) sends the renderer
// through `recreate`, the only place per-surface resources are replaced.

use std::sync::Arc;
use std::time::Instant;

use ash::vk;

use crate::app::WindowHost;
use crate::backend::commands::OneShotCommands;
use crate::backend::{FramePacer, GpuDevice, RenderError, RenderResult, Submission, SurfaceState};
use crate::graphics::{FrameResources, ShaderCode, SharedGraphics};

/// Knobs the renderer takes from configuration.
#[derive(Debug, Clone)]
pub struct RendererSettings {
    pub frames_in_flight: usize,
    pub present_mode: vk::PresentModeKHR,
    pub clear_color: [f32; 4],
    pub shaders: ShaderCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame was submitted and queued for presentation.
    Presented,
    /// The surface was stale; per-surface resources were rebuilt.
    Recreated,
}

/// Owns every per-run GPU resource.
///
/// IMPORTANT: Field order matters for Drop. The frame bundle goes before the
/// surface it was built from, both go before the pacer and the shared
/// pieces, and the device handle set goes last.
pub struct Renderer {
    frames: Option<FrameResources>,
    surface: Option<SurfaceState>,
    pacer: FramePacer,
    shared: SharedGraphics,
    present_mode: vk::PresentModeKHR,
    started: Instant,
    device: Arc<dyn GpuDevice>,
}

impl Renderer {
    pub fn new(device: Arc<dyn GpuDevice>, window: &dyn WindowHost, settings: RendererSettings) -> RenderResult<Self> {
        let pacer = FramePacer::new(&device, settings.frames_in_flight)?;

        let shared = {
            let commands = OneShotCommands::new(&device)?;
            SharedGraphics::new(&device, &commands, settings.shaders, settings.clear_color)?
        };

        let mut renderer = Self {
            frames: None,
            surface: None,
            pacer,
            shared,
            present_mode: settings.present_mode,
            started: Instant::now(),
            device,
        };
        renderer.rebuild(window.drawable_size())?;

        log::info!(
            "Renderer ready: {} frames in flight, {} swapchain images",
            renderer.pacer.frames_in_flight(),
            renderer.image_count()
        );
        Ok(renderer)
    }

    /// Run one iteration of the frame loop.
    pub fn draw_frame(&mut self, window: &mut dyn WindowHost) -> RenderResult<FrameOutcome> {
        if self.surface.is_none() || self.frames.is_none() {
            self.recreate(window)?;
            return Ok(FrameOutcome::Recreated);
        }

        self.pacer.wait_for_slot()?;
        let image_available = self.pacer.current().image_available;
        let render_finished = self.pacer.current().render_finished;

        // The slot's fence stays signalled when acquire fails, so the next
        // wait on it returns at once
        let acquired = match &self.surface {
            Some(surface) => surface.acquire_next_image(image_available),
            None => Err(RenderError::SurfaceOutOfDate),
        };
        let (image_index, acquire_status) = match acquired {
            Ok(acquired) => acquired,
            Err(RenderError::SurfaceOutOfDate) => {
                log::debug!("Swapchain out of date at acquire");
                self.recreate(window)?;
                return Ok(FrameOutcome::Recreated);
            }
            Err(e) => return Err(e),
        };

        self.pacer.claim_image(image_index)?;
        let fence = self.pacer.begin_submit()?;

        let frames = self.frames.as_ref().ok_or(RenderError::SurfaceOutOfDate)?;
        frames.record_frame(image_index, self.started.elapsed().as_secs_f32())?;
        let command_buffers = [frames.command_buffer(image_index)?];

        let wait_semaphores = [image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [render_finished];
        let submission = Submission {
            wait_semaphores: &wait_semaphores,
            wait_stages: &wait_stages,
            command_buffers: &command_buffers,
            signal_semaphores: &signal_semaphores,
        };
        self.device.queue_submit(self.device.graphics_queue(), &submission, fence)?;

        let presented = match &self.surface {
            Some(surface) => surface.present(render_finished, image_index),
            None => Err(RenderError::SurfaceOutOfDate),
        };
        let stale = match presented {
            Ok(status) => status.is_suboptimal() || acquire_status.is_suboptimal(),
            Err(RenderError::SurfaceOutOfDate) => true,
            Err(e) => return Err(e),
        };
        let resized = window.take_resized();

        self.pacer.advance();

        if stale || resized {
            log::debug!("Recreating after present (stale: {}, resized: {})", stale, resized);
            self.recreate(window)?;
            return Ok(FrameOutcome::Recreated);
        }
        Ok(FrameOutcome::Presented)
    }

    /// Tear down and rebuild every per-surface resource.
    ///
    /// Blocks while the window has no drawable area (minimised), then idles
    /// the device so nothing in flight still references the old resources.
    pub fn recreate(&mut self, window: &mut dyn WindowHost) -> RenderResult<()> {
        let mut size = window.drawable_size();
        while size.width == 0 || size.height == 0 {
            if window.close_requested() {
                log::debug!("Close requested while minimised, skipping recreation");
                return Ok(());
            }
            window.wait_events();
            size = window.drawable_size();
        }
        window.take_resized();

        self.device.wait_idle()?;
        self.rebuild(size)
    }

    fn rebuild(&mut self, drawable: vk::Extent2D) -> RenderResult<()> {
        // Bundle first: its framebuffers reference the surface's views
        self.frames = None;
        self.surface = None;

        let surface = SurfaceState::create(&self.device, drawable, self.present_mode)?;
        let frames = FrameResources::build(&self.device, &surface, &self.shared)?;
        self.pacer.reset_images(surface.image_count());

        self.surface = Some(surface);
        self.frames = Some(frames);
        Ok(())
    }

    pub fn image_count(&self) -> usize {
        self.surface.as_ref().map_or(0, SurfaceState::image_count)
    }

    pub fn extent(&self) -> Option<vk::Extent2D> {
        self.surface.as_ref().map(SurfaceState::extent)
    }

    pub fn present_mode(&self) -> Option<vk::PresentModeKHR> {
        self.surface.as_ref().map(SurfaceState::present_mode)
    }

    pub fn frames_in_flight(&self) -> usize {
        self.pacer.frames_in_flight()
    }

    /// Block until the GPU has drained every queue.
    pub fn wait_idle(&self) -> RenderResult<()> {
        Ok(self.device.wait_idle()?)
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        // Nothing may be destroyed while the GPU still uses it
        if let Err(e) = self.device.wait_idle() {
            log::error!("wait_idle failed during shutdown: {}", e);
        }
    }
}
