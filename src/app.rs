// =============================================================================
// APPLICATION - window, event pumping and the frame loop
// =============================================================================
//
// The renderer never talks to winit directly. It sees the window through
// `WindowHost`, which the winit-backed `WinitWindow` implements by pumping
// the event loop from our own loop instead of handing control to `run_app`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use ash::vk;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::platform::pump_events::{EventLoopExtPumpEvents, PumpStatus};
use winit::window::{Fullscreen, Window, WindowAttributes, WindowId};

use crate::backend::shader::load_spirv;
use crate::backend::{GpuDevice, VulkanDevice};
use crate::config::{Config, WindowConfig};
use crate::graphics::ShaderCode;
use crate::renderer::{FrameOutcome, Renderer, RendererSettings};

/// What the render loop needs from the window system.
pub trait WindowHost {
    /// Current drawable size in pixels. Zero on either axis while minimised.
    fn drawable_size(&self) -> vk::Extent2D;
    /// Block until at least one event arrives and process it.
    fn wait_events(&mut self);
    /// Process pending events without blocking.
    fn pump_events(&mut self);
    /// Whether the window was resized since the last call.
    fn take_resized(&mut self) -> bool;
    fn close_requested(&self) -> bool;
}

// =============================================================================
// WINIT WINDOW
// =============================================================================

struct WindowState {
    attributes: WindowAttributes,
    window: Option<Window>,
    create_error: Option<String>,
    is_fullscreen: bool,
    resized: bool,
    close_requested: bool,
}

impl WindowState {
    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }

            self.resized = true;
        }
    }
}

impl ApplicationHandler for WindowState {
    /// Windows can only be created once the event loop has resumed.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        match event_loop.create_window(self.attributes.clone()) {
            Ok(window) => self.window = Some(window),
            Err(e) => self.create_error = Some(e.to_string()),
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested");
                self.close_requested = true;
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.resized = true;
            }

            WindowEvent::KeyboardInput { event, .. } => {
                if event.state.is_pressed() && !event.repeat {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                self.close_requested = true;
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }
}

/// A winit window driven through `EventLoopExtPumpEvents`.
///
/// Field order matters: the window (inside `state`) drops before the loop.
pub struct WinitWindow {
    state: WindowState,
    event_loop: EventLoop<()>,
}

impl WinitWindow {
    pub fn new(config: &WindowConfig) -> Result<Self> {
        let event_loop = EventLoop::new().context("Failed to create event loop")?;

        let mut attributes = Window::default_attributes()
            .with_title(&config.title)
            .with_inner_size(PhysicalSize::new(config.width, config.height));
        if config.fullscreen {
            attributes = attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let mut host = Self {
            state: WindowState {
                attributes,
                window: None,
                create_error: None,
                is_fullscreen: config.fullscreen,
                resized: false,
                close_requested: false,
            },
            event_loop,
        };

        while host.state.window.is_none() {
            let status = host
                .event_loop
                .pump_app_events(Some(Duration::from_millis(1)), &mut host.state);
            if let Some(e) = host.state.create_error.take() {
                bail!("Failed to create window: {}", e);
            }
            if let PumpStatus::Exit(code) = status {
                bail!("Event loop exited with code {} before the window was created", code);
            }
        }

        Ok(host)
    }

    pub fn window(&self) -> Option<&Window> {
        self.state.window.as_ref()
    }

    pub fn is_fullscreen(&self) -> bool {
        self.state.is_fullscreen
    }

    pub fn set_title(&self, title: &str) {
        if let Some(ref window) = self.state.window {
            window.set_title(title);
        }
    }

    fn pump(&mut self, timeout: Option<Duration>) {
        if let PumpStatus::Exit(code) = self.event_loop.pump_app_events(timeout, &mut self.state) {
            log::debug!("Event loop exited with code {}", code);
            self.state.close_requested = true;
        }
    }
}

impl WindowHost for WinitWindow {
    fn drawable_size(&self) -> vk::Extent2D {
        self.state.window.as_ref().map_or(vk::Extent2D::default(), |window| {
            let size = window.inner_size();
            vk::Extent2D {
                width: size.width,
                height: size.height,
            }
        })
    }

    fn wait_events(&mut self) {
        self.pump(None);
    }

    fn pump_events(&mut self) {
        self.pump(Some(Duration::ZERO));
    }

    fn take_resized(&mut self) -> bool {
        std::mem::take(&mut self.state.resized)
    }

    fn close_requested(&self) -> bool {
        self.state.close_requested
    }
}

// =============================================================================
// FPS TRACKING
// =============================================================================

/// Frame counter that reports once per second.
pub struct FpsCounter {
    frame_count: u32,
    last_frame_time: Instant,
    last_report: Instant,
}

/// One FPS report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FpsReport {
    pub fps: f32,
    pub frame_ms: f32,
}

impl FpsCounter {
    pub fn new(now: Instant) -> Self {
        Self {
            frame_count: 0,
            last_frame_time: now,
            last_report: now,
        }
    }

    /// Count a presented frame. Returns a report when a second has passed
    /// since the last one.
    pub fn tick(&mut self, now: Instant) -> Option<FpsReport> {
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        let elapsed = now.duration_since(self.last_report).as_secs_f32();
        if elapsed < 1.0 {
            return None;
        }

        let report = FpsReport {
            fps: self.frame_count as f32 / elapsed,
            frame_ms: frame_time * 1000.0,
        };
        self.frame_count = 0;
        self.last_report = now;
        Some(report)
    }
}

// =============================================================================
// RUN
// =============================================================================

fn load_shaders(config: &Config) -> Result<ShaderCode> {
    let vertex = load_spirv(&config.shaders.vertex)
        .with_context(|| format!("Failed to load vertex shader {:?}", config.shaders.vertex))?;
    let fragment = load_spirv(&config.shaders.fragment)
        .with_context(|| format!("Failed to load fragment shader {:?}", config.shaders.fragment))?;
    Ok(ShaderCode { vertex, fragment })
}

/// Open the window, set up Vulkan and render until the window closes.
pub fn run(config: Config) -> Result<()> {
    config.validate().context("Invalid configuration")?;
    let shaders = load_shaders(&config)?;

    let mut window = WinitWindow::new(&config.window)?;
    let device: Arc<dyn GpuDevice> = {
        let handle = window.window().context("Window closed during startup")?;
        let device = VulkanDevice::new(&config.window.title, config.debug.validation_layers, handle)
            .context("Failed to initialize Vulkan")?;
        log::info!("Using GPU: {}", device.device_name());
        device as Arc<dyn GpuDevice>
    };

    let settings = RendererSettings {
        frames_in_flight: config.graphics.max_frames_in_flight,
        present_mode: config.get_present_mode(),
        clear_color: config.graphics.clear_color,
        shaders,
    };
    // Declared after the window so it drops first
    let mut renderer = Renderer::new(device, &window, settings).context("Failed to set up renderer")?;
    let mut fps = FpsCounter::new(Instant::now());

    loop {
        window.pump_events();
        if window.close_requested() {
            break;
        }

        match renderer.draw_frame(&mut window) {
            Ok(FrameOutcome::Presented) => {
                if config.debug.show_fps {
                    if let Some(report) = fps.tick(Instant::now()) {
                        let mode = if window.is_fullscreen() { "fullscreen" } else { "windowed" };
                        window.set_title(&format!(
                            "{} - {:.0} FPS ({:.2}ms) [{}]",
                            config.window.title, report.fps, report.frame_ms, mode
                        ));
                        log::debug!("{:.0} FPS ({:.2}ms)", report.fps, report.frame_ms);
                    }
                }
            }
            Ok(FrameOutcome::Recreated) => {}
            Err(e) if e.is_transient() => {
                log::debug!("Transient presentation error: {}", e);
                renderer.recreate(&mut window).context("Failed to recreate swapchain")?;
            }
            Err(e) => return Err(e).context("Frame failed"),
        }
    }

    renderer.wait_idle().context("Failed to idle device on shutdown")?;
    log::info!("Shutting down");
    Ok(())
}

// =============================================================================
// TEST WINDOW
// =============================================================================
