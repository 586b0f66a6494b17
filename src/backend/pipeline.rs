// Graphics pipeline creation and management
//
// The graphics pipeline defines how vertices are processed and rasterized.
// Everything here depends on the swapchain format or extent, so it is built
// and dropped together with the rest of the per-surface resources.

use std::ffi::CStr;
use std::sync::Arc;

use ash::vk;

use super::shader::ShaderModule;
use super::{GpuDevice, RenderResult};

const ENTRY_POINT: &CStr = c"main";

/// External -> subpass 0 dependency so the first colour write waits for the
/// presentation engine to release the image.
pub fn subpass_dependency() -> vk::SubpassDependency {
    vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
        .build()
}

/// Single-subpass render pass with one cleared colour attachment that ends
/// up ready for presentation.
pub struct RenderPass {
    device: Arc<dyn GpuDevice>,
    render_pass: vk::RenderPass,
}

impl RenderPass {
    pub fn new(device: &Arc<dyn GpuDevice>, format: vk::Format) -> RenderResult<Self> {
        // Color attachment (the swapchain image)
        let color_attachment = vk::AttachmentDescription::builder()
            .format(format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .build();

        let color_attachment_ref = vk::AttachmentReference::builder()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .build();

        let color_attachments = &[color_attachment_ref];
        let subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(color_attachments)
            .build();

        let attachments = &[color_attachment];
        let subpasses = &[subpass];
        let dependencies = &[subpass_dependency()];

        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(attachments)
            .subpasses(subpasses)
            .dependencies(dependencies);

        let render_pass = device.create_render_pass(&render_pass_info)?;
        Ok(Self {
            device: Arc::clone(device),
            render_pass,
        })
    }

    pub fn handle(&self) -> vk::RenderPass {
        self.render_pass
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        self.device.destroy_render_pass(self.render_pass);
    }
}

/// Layout with a single uniform buffer at binding 0, read by the vertex stage.
pub struct DescriptorSetLayout {
    device: Arc<dyn GpuDevice>,
    layout: vk::DescriptorSetLayout,
}

impl DescriptorSetLayout {
    pub fn uniform_buffer(device: &Arc<dyn GpuDevice>) -> RenderResult<Self> {
        let binding = vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .build();

        let bindings = &[binding];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);

        let layout = device.create_descriptor_set_layout(&layout_info)?;
        Ok(Self {
            device: Arc::clone(device),
            layout,
        })
    }

    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        self.device.destroy_descriptor_set_layout(self.layout);
    }
}

/// Pool sized for `count` uniform-buffer sets. Destroying it frees the sets.
pub struct DescriptorPool {
    device: Arc<dyn GpuDevice>,
    pool: vk::DescriptorPool,
}

impl DescriptorPool {
    pub fn uniform_buffers(device: &Arc<dyn GpuDevice>, count: u32) -> RenderResult<Self> {
        let pool_sizes = &[vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: count,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(pool_sizes)
            .max_sets(count);

        let pool = device.create_descriptor_pool(&pool_info)?;
        Ok(Self {
            device: Arc::clone(device),
            pool,
        })
    }

    /// Allocate `count` sets that all use `layout`.
    pub fn allocate(&self, layout: &DescriptorSetLayout, count: usize) -> RenderResult<Vec<vk::DescriptorSet>> {
        let layouts = vec![layout.handle(); count];
        Ok(self.device.allocate_descriptor_sets(self.pool, &layouts)?)
    }

    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        self.device.destroy_descriptor_pool(self.pool);
    }
}

/// Vertex buffer layout fed to the pipeline's input stage.
pub struct VertexInput<'a> {
    pub bindings: &'a [vk::VertexInputBindingDescription],
    pub attributes: &'a [vk::VertexInputAttributeDescription],
}

/// Graphics pipeline and its layout.
pub struct GraphicsPipeline {
    device: Arc<dyn GpuDevice>,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

impl GraphicsPipeline {
    pub fn new(
        device: &Arc<dyn GpuDevice>,
        render_pass: &RenderPass,
        extent: vk::Extent2D,
        vert_shader: &ShaderModule,
        frag_shader: &ShaderModule,
        vertex_input: VertexInput<'_>,
        set_layout: &DescriptorSetLayout,
    ) -> RenderResult<Self> {
        let vert_stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert_shader.handle())
            .name(ENTRY_POINT)
            .build();

        let frag_stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(frag_shader.handle())
            .name(ENTRY_POINT)
            .build();

        let shader_stages = &[vert_stage, frag_stage];

        // Vertex input
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(vertex_input.bindings)
            .vertex_attribute_descriptions(vertex_input.attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // Viewport and scissor cover the whole surface
        let viewport = vk::Viewport::builder()
            .x(0.0)
            .y(0.0)
            .width(extent.width as f32)
            .height(extent.height as f32)
            .min_depth(0.0)
            .max_depth(1.0)
            .build();

        let scissor = vk::Rect2D::builder()
            .offset(vk::Offset2D { x: 0, y: 0 })
            .extent(extent)
            .build();

        let viewports = &[viewport];
        let scissors = &[scissor];
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewports(viewports)
            .scissors(scissors);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        // Color blending (no blending, opaque)
        let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build();

        let color_blend_attachments = &[color_blend_attachment];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(color_blend_attachments);

        let set_layouts = &[set_layout.handle()];
        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(set_layouts);
        let layout = device.create_pipeline_layout(&layout_info)?;

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .color_blend_state(&color_blending)
            .layout(layout)
            .render_pass(render_pass.handle())
            .subpass(0);

        let pipeline = match device.create_graphics_pipeline(&pipeline_info) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                device.destroy_pipeline_layout(layout);
                return Err(e.into());
            }
        };

        Ok(Self {
            device: Arc::clone(device),
            pipeline,
            layout,
        })
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        self.device.destroy_pipeline(self.pipeline);
        self.device.destroy_pipeline_layout(self.layout);
    }
}

/// One framebuffer per swapchain view.
pub struct Framebuffers {
    device: Arc<dyn GpuDevice>,
    framebuffers: Vec<vk::Framebuffer>,
}

impl Framebuffers {
    pub fn new(
        device: &Arc<dyn GpuDevice>,
        image_views: &[vk::ImageView],
        render_pass: &RenderPass,
        extent: vk::Extent2D,
    ) -> RenderResult<Self> {
        let mut framebuffers = Self {
            device: Arc::clone(device),
            framebuffers: Vec::with_capacity(image_views.len()),
        };

        for &image_view in image_views {
            let attachments = &[image_view];
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass.handle())
                .attachments(attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            let framebuffer = device.create_framebuffer(&framebuffer_info)?;
            framebuffers.framebuffers.push(framebuffer);
        }

        Ok(framebuffers)
    }

    pub fn handles(&self) -> &[vk::Framebuffer] {
        &self.framebuffers
    }

    pub fn len(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.framebuffers.is_empty()
    }
}

impl Drop for Framebuffers {
    fn drop(&mut self) {
        for &framebuffer in &self.framebuffers {
            self.device.destroy_framebuffer(framebuffer);
        }
    }
}
