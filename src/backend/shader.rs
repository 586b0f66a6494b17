// Shader module loading and management
//
// Vulkan uses SPIR-V bytecode for shaders. This module reads compiled
// shaders from disk and wraps them in shader modules.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use ash::vk;

use super::{GpuDevice, RenderError, RenderResult};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Decode SPIR-V bytes into words. Byte-swapped modules are accepted and
/// swapped to host order.
pub fn parse_spirv(bytes: &[u8]) -> RenderResult<Vec<u32>> {
    if bytes.is_empty() {
        return Err(RenderError::Shader("SPIR-V module is empty".to_string()));
    }

    let words = ash::util::read_spv(&mut Cursor::new(bytes))
        .map_err(|e| RenderError::Shader(format!("invalid SPIR-V: {}", e)))?;

    // read_spv only swaps on a reversed magic, it never rejects a wrong one
    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        Some(other) => Err(RenderError::Shader(format!("bad SPIR-V magic {:#010x}", other))),
        None => Err(RenderError::Shader("SPIR-V module is empty".to_string())),
    }
}

/// Load a compiled shader from disk.
pub fn load_spirv(path: impl AsRef<Path>) -> RenderResult<Vec<u32>> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .map_err(|e| RenderError::Shader(format!("failed to read {}: {}", path.display(), e)))?;

    let words = parse_spirv(&bytes)
        .map_err(|e| RenderError::Shader(format!("{}: {}", path.display(), e)))?;
    log::debug!("Loaded shader {} ({} words)", path.display(), words.len());
    Ok(words)
}

/// Owned shader module, destroyed once the pipeline that used it is built.
pub struct ShaderModule {
    device: Arc<dyn GpuDevice>,
    module: vk::ShaderModule,
}

impl ShaderModule {
    pub fn new(device: &Arc<dyn GpuDevice>, code: &[u32]) -> RenderResult<Self> {
        let module = device.create_shader_module(code)?;
        Ok(Self {
            device: Arc::clone(device),
            module,
        })
    }

    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        self.device.destroy_shader_module(self.module);
    }
}
