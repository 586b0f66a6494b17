// Frame graphics bundle
//
// Everything that depends on the swapchain lives in `FrameResources` and is
// rebuilt together with it. The pieces that survive a rebuild (descriptor
// layout, command pool, shader code, uploaded geometry) live in
// `SharedGraphics`, which must outlive every bundle built from it.

use std::mem::size_of;
use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

use crate::backend::buffer::upload_and_wait;
use crate::backend::commands::{CommandPool, OneShotCommands};
use crate::backend::pipeline::{
    DescriptorPool, DescriptorSetLayout, Framebuffers, GraphicsPipeline, RenderPass, VertexInput,
};
use crate::backend::shader::ShaderModule;
use crate::backend::{GpuDevice, MemoryBackedBuffer, RenderError, RenderResult, SurfaceState};

// ============================================================================
// Geometry
// ============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 2],
    pub color: [f32; 3],
}

impl Vertex {
    pub fn binding_descriptions() -> [vk::VertexInputBindingDescription; 1] {
        [vk::VertexInputBindingDescription {
            binding: 0,
            stride: size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }]
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 2] {
        [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: 0,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: size_of::<[f32; 2]>() as u32,
            },
        ]
    }
}

pub const QUAD_VERTICES: [Vertex; 4] = [
    Vertex { pos: [-0.5, -0.5], color: [1.0, 0.0, 0.0] },
    Vertex { pos: [0.5, -0.5], color: [0.0, 1.0, 0.0] },
    Vertex { pos: [0.5, 0.5], color: [0.0, 0.0, 1.0] },
    Vertex { pos: [-0.5, 0.5], color: [1.0, 1.0, 1.0] },
];

pub const QUAD_INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

/// Vertex and index buffers in device-local memory, uploaded once.
pub struct Geometry {
    vertices: MemoryBackedBuffer,
    indices: MemoryBackedBuffer,
    index_count: u32,
}

impl Geometry {
    pub fn upload(
        device: &Arc<dyn GpuDevice>,
        commands: &OneShotCommands,
        vertices: &[Vertex],
        indices: &[u16],
    ) -> RenderResult<Self> {
        let vertex_buffer = upload_and_wait(
            device,
            commands,
            vertices,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        let index_buffer = upload_and_wait(
            device,
            commands,
            indices,
            vk::BufferUsageFlags::INDEX_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        Ok(Self {
            vertices: vertex_buffer,
            indices: index_buffer,
            index_count: indices.len() as u32,
        })
    }

    pub fn quad(device: &Arc<dyn GpuDevice>, commands: &OneShotCommands) -> RenderResult<Self> {
        Self::upload(device, commands, &QUAD_VERTICES, &QUAD_INDICES)
    }

    pub fn vertex_buffer(&self) -> vk::Buffer {
        self.vertices.handle()
    }

    pub fn index_buffer(&self) -> vk::Buffer {
        self.indices.handle()
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }
}

// ============================================================================
// Uniform data
// ============================================================================

/// Per-image uniform block, matching the vertex shader's binding 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Transform {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

impl Transform {
    pub const SIZE: vk::DeviceSize = size_of::<Transform>() as vk::DeviceSize;

    /// Quad spinning about +Z at 90 degrees per second, seen from (2,2,2).
    pub fn at(elapsed: f32, extent: vk::Extent2D) -> Self {
        let model = Mat4::from_rotation_z(elapsed * 90f32.to_radians());
        let view = Mat4::look_at_rh(Vec3::new(2.0, 2.0, 2.0), Vec3::ZERO, Vec3::Z);

        let aspect = extent.width as f32 / extent.height.max(1) as f32;
        let mut proj = Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 10.0);
        // Vulkan clip space has Y pointing down
        proj.y_axis.y *= -1.0;

        Self { model, view, proj }
    }
}

// ============================================================================
// Long-lived pieces
// ============================================================================

/// Compiled vertex and fragment shader words.
#[derive(Debug, Clone)]
pub struct ShaderCode {
    pub vertex: Vec<u32>,
    pub fragment: Vec<u32>,
}

pub struct SharedGraphics {
    pub set_layout: DescriptorSetLayout,
    pub command_pool: CommandPool,
    pub geometry: Geometry,
    pub shaders: ShaderCode,
    pub clear_color: [f32; 4],
}

impl SharedGraphics {
    pub fn new(
        device: &Arc<dyn GpuDevice>,
        commands: &OneShotCommands,
        shaders: ShaderCode,
        clear_color: [f32; 4],
    ) -> RenderResult<Self> {
        let set_layout = DescriptorSetLayout::uniform_buffer(device)?;
        // Frame command buffers are recorded once per rebuild, never reset
        let command_pool = CommandPool::new(
            device,
            device.queue_families().graphics,
            vk::CommandPoolCreateFlags::empty(),
        )?;
        let geometry = Geometry::quad(device, commands)?;

        Ok(Self {
            set_layout,
            command_pool,
            geometry,
            shaders,
            clear_color,
        })
    }
}

// ============================================================================
// Per-surface bundle
// ============================================================================

/// Per-image framebuffer, uniform buffer, descriptor set and pre-recorded
/// command buffer, plus the render pass and pipeline they share.
///
/// Fields drop top to bottom after `Drop::drop` frees the command buffers.
pub struct FrameResources {
    device: Arc<dyn GpuDevice>,
    command_pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
    descriptor_sets: Vec<vk::DescriptorSet>,
    descriptors: DescriptorPool,
    uniforms: Vec<MemoryBackedBuffer>,
    framebuffers: Framebuffers,
    pipeline: GraphicsPipeline,
    render_pass: RenderPass,
    extent: vk::Extent2D,
}

fn check_len(what: &'static str, expected: usize, actual: usize) -> RenderResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(RenderError::LengthMismatch { what, expected, actual })
    }
}

impl FrameResources {
    pub fn build(device: &Arc<dyn GpuDevice>, surface: &SurfaceState, shared: &SharedGraphics) -> RenderResult<Self> {
        let image_count = surface.image_count();
        let extent = surface.extent();

        let render_pass = RenderPass::new(device, surface.format())?;

        // Shader modules only need to live until the pipeline exists
        let pipeline = {
            let vert = ShaderModule::new(device, &shared.shaders.vertex)?;
            let frag = ShaderModule::new(device, &shared.shaders.fragment)?;
            let bindings = Vertex::binding_descriptions();
            let attributes = Vertex::attribute_descriptions();
            GraphicsPipeline::new(
                device,
                &render_pass,
                extent,
                &vert,
                &frag,
                VertexInput {
                    bindings: &bindings,
                    attributes: &attributes,
                },
                &shared.set_layout,
            )?
        };

        let framebuffers = Framebuffers::new(device, surface.views(), &render_pass, extent)?;
        check_len("framebuffers", image_count, framebuffers.len())?;

        let uniforms = (0..image_count)
            .map(|_| {
                MemoryBackedBuffer::new(
                    device,
                    Transform::SIZE,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                )
            })
            .collect::<RenderResult<Vec<_>>>()?;

        let descriptors = DescriptorPool::uniform_buffers(device, image_count as u32)?;
        let descriptor_sets = descriptors.allocate(&shared.set_layout, image_count)?;
        check_len("descriptor sets", image_count, descriptor_sets.len())?;

        for (&set, uniform) in descriptor_sets.iter().zip(&uniforms) {
            let buffer_info = &[vk::DescriptorBufferInfo {
                buffer: uniform.handle(),
                offset: 0,
                range: Transform::SIZE,
            }];
            let write = vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(0)
                .dst_array_element(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(buffer_info)
                .build();
            device.update_descriptor_sets(&[write]);
        }

        let command_buffers = shared.command_pool.allocate(image_count as u32)?;

        // From here on Drop frees the command buffers
        let resources = Self {
            device: Arc::clone(device),
            command_pool: shared.command_pool.handle(),
            command_buffers,
            descriptor_sets,
            descriptors,
            uniforms,
            framebuffers,
            pipeline,
            render_pass,
            extent,
        };
        check_len("command buffers", image_count, resources.command_buffers.len())?;

        for index in 0..image_count {
            resources.record_commands(index, shared)?;
        }

        log::debug!(
            "Built frame resources for {} images at {}x{}",
            image_count,
            extent.width,
            extent.height
        );
        Ok(resources)
    }

    fn record_commands(&self, index: usize, shared: &SharedGraphics) -> RenderResult<()> {
        let device = self.device.as_ref();
        let cmd = self.command_buffers[index];

        device.begin_command_buffer(cmd, vk::CommandBufferUsageFlags::empty())?;

        let clear_values = &[vk::ClearValue {
            color: vk::ClearColorValue {
                float32: shared.clear_color,
            },
        }];
        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass.handle())
            .framebuffer(self.framebuffers.handles()[index])
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.extent,
            })
            .clear_values(clear_values);

        device.cmd_begin_render_pass(cmd, &render_pass_info);
        device.cmd_bind_pipeline(cmd, self.pipeline.handle());
        device.cmd_bind_vertex_buffer(cmd, shared.geometry.vertex_buffer());
        device.cmd_bind_index_buffer(cmd, shared.geometry.index_buffer(), vk::IndexType::UINT16);
        device.cmd_bind_descriptor_set(cmd, self.pipeline.layout(), self.descriptor_sets[index]);
        device.cmd_draw_indexed(cmd, shared.geometry.index_count());
        device.cmd_end_render_pass(cmd);

        device.end_command_buffer(cmd)?;
        Ok(())
    }

    /// Write this frame's transform into image `image_index`'s uniform buffer.
    pub fn record_frame(&self, image_index: u32, elapsed: f32) -> RenderResult<()> {
        let uniform = self
            .uniforms
            .get(image_index as usize)
            .ok_or(RenderError::ImageIndexOutOfRange {
                index: image_index,
                count: self.uniforms.len(),
            })?;

        let transform = Transform::at(elapsed, self.extent);
        uniform.write(0, bytemuck::bytes_of(&transform))
    }

    /// Pre-recorded command buffer for image `image_index`.
    pub fn command_buffer(&self, image_index: u32) -> RenderResult<vk::CommandBuffer> {
        self.command_buffers
            .get(image_index as usize)
            .copied()
            .ok_or(RenderError::ImageIndexOutOfRange {
                index: image_index,
                count: self.command_buffers.len(),
            })
    }

    pub fn image_count(&self) -> usize {
        self.command_buffers.len()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn descriptor_pool(&self) -> vk::DescriptorPool {
        self.descriptors.handle()
    }
}

impl Drop for FrameResources {
    fn drop(&mut self) {
        if !self.command_buffers.is_empty() {
            self.device.free_command_buffers(self.command_pool, &self.command_buffers);
        }
    }
}
