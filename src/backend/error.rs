// Backend error types
//
// Every failure the renderer can hit, plus the class that decides whether the
// render loop recovers from it or the process exits.

use ash::vk;
use thiserror::Error;

/// How the render loop reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Instance/device/surface creation, memory type or queue selection.
    SetupFatal,
    /// Out-of-date surface. Recovered by recreating the swapchain.
    TransientPresentation,
    /// Host or device allocation failure. No eviction policy exists.
    ResourceExhaustion,
    /// A defect: bad layout transition, mismatched lengths, bad index.
    ProgrammerError,
}

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    #[error("Failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("Validation layer not found: {0}")]
    LayerNotFound(String),

    #[error("No suitable GPU found")]
    NoSuitableGpu,

    #[error("Surface reports no formats")]
    NoSurfaceFormat,

    #[error("Unsupported window handle: {0}")]
    UnsupportedWindow(String),

    #[error("No memory type in filter {type_filter:#b} has properties {required:?}")]
    NoCompatibleMemory {
        type_filter: u32,
        required: vk::MemoryPropertyFlags,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Shader error: {0}")]
    Shader(String),

    #[error("Swapchain out of date")]
    SurfaceOutOfDate,

    #[error("Unsupported layout transition {old:?} -> {new:?}")]
    UnsupportedLayoutTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },

    #[error("{what}: expected {expected} entries, got {actual}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Image index {index} out of range for {count} swapchain images")]
    ImageIndexOutOfRange { index: u32, count: usize },

    #[error("Refusing to upload an empty buffer")]
    EmptyUpload,
}

impl RenderError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::SurfaceOutOfDate => ErrorClass::TransientPresentation,
            Self::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR) => ErrorClass::TransientPresentation,
            Self::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
            | Self::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY) => ErrorClass::ResourceExhaustion,
            Self::UnsupportedLayoutTransition { .. }
            | Self::LengthMismatch { .. }
            | Self::ImageIndexOutOfRange { .. }
            | Self::EmptyUpload => ErrorClass::ProgrammerError,
            _ => ErrorClass::SetupFatal,
        }
    }

    /// The only class the render loop retries.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::TransientPresentation
    }
}

pub type RenderResult<T> = std::result::Result<T, RenderError>;
