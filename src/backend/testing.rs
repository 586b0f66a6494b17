// Recording GpuDevice double for unit tests
//
// Simulates just enough of a Vulkan device to check the things the frame
// pacer and the lifecycle code must get right: handle lifetimes per object
// type, host-visible memory contents, fence and semaphore state, swapchain
// image rotation and the order of acquire/submit/present. Misuse that a
// validation layer would report is collected in `violations()`.

use std::collections::{HashMap, HashSet, VecDeque};

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::Mutex;

use super::{GpuDevice, QueueFamilies, Submission, SurfaceSupport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    Signaled,
    Unsignaled,
    Pending,
}

/// Observable GPU-side events in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Acquire {
        image_index: u32,
        signal: vk::Semaphore,
    },
    Submit {
        command_buffers: Vec<vk::CommandBuffer>,
        wait: Vec<vk::Semaphore>,
        signal: Vec<vk::Semaphore>,
        fence: vk::Fence,
    },
    Present {
        image_index: u32,
        wait: vk::Semaphore,
    },
    Barrier {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },
    FenceWait(vk::Fence),
    WaitIdle,
}

/// Canned result for the next acquire or present call.
#[derive(Debug, Clone, Copy)]
pub enum Scripted {
    OutOfDate,
    Suboptimal,
    Fail(vk::Result),
}

#[derive(Debug, Clone)]
enum Recorded {
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        regions: Vec<vk::BufferImageCopy>,
    },
    Barrier {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },
    Draw {
        framebuffer: vk::Framebuffer,
        descriptor_set: vk::DescriptorSet,
    },
}

struct MockSwapchain {
    images: Vec<vk::Image>,
    next: u32,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    live: HashMap<vk::ObjectType, HashSet<u64>>,
    memory: HashMap<u64, Vec<u8>>,
    sizes: HashMap<u64, vk::DeviceSize>,
    bindings: HashMap<u64, u64>,
    fences: HashMap<u64, FenceState>,
    max_pending: usize,
    semaphores: HashMap<u64, bool>,
    pool_buffers: HashMap<u64, Vec<vk::CommandBuffer>>,
    pool_sets: HashMap<u64, Vec<vk::DescriptorSet>>,
    recording: HashSet<u64>,
    recordings: HashMap<u64, Vec<Recorded>>,
    pending_draw: HashMap<u64, (vk::Framebuffer, vk::DescriptorSet)>,
    framebuffer_views: HashMap<u64, Vec<vk::ImageView>>,
    swapchains: HashMap<u64, MockSwapchain>,
    surface: SurfaceSupport,
    acquire_script: VecDeque<Scripted>,
    present_script: VecDeque<Scripted>,
    events: Vec<Event>,
    violations: Vec<String>,
}

impl State {
    fn make<H: Handle>(&mut self) -> H {
        self.next_handle += 1;
        let raw = self.next_handle;
        self.live.entry(H::TYPE).or_default().insert(raw);
        H::from_raw(raw)
    }

    fn release<H: Handle + Copy + std::fmt::Debug>(&mut self, handle: H) {
        let raw = handle.as_raw();
        if raw == 0 {
            return;
        }
        let removed = self.live.get_mut(&H::TYPE).map_or(false, |set| set.remove(&raw));
        if !removed {
            self.violations.push(format!("destroyed {:?} {handle:?} that is not live", H::TYPE));
        }
    }

    fn is_live<H: Handle>(&self, handle: H) -> bool {
        self.live.get(&H::TYPE).map_or(false, |set| set.contains(&handle.as_raw()))
    }

    fn violate<T>(&mut self, message: String) -> VkResult<T> {
        self.violations.push(message);
        Err(vk::Result::ERROR_VALIDATION_FAILED_EXT)
    }

    fn check_recording(&mut self, cmd: vk::CommandBuffer) -> bool {
        if self.recording.contains(&cmd.as_raw()) {
            true
        } else {
            self.violations.push(format!("command recorded into {cmd:?} outside begin/end"));
            false
        }
    }

    fn record(&mut self, cmd: vk::CommandBuffer, command: Recorded) {
        if self.check_recording(cmd) {
            self.recordings.entry(cmd.as_raw()).or_default().push(command);
        }
    }

    fn bound_memory(&self, resource: u64) -> Option<u64> {
        self.bindings.get(&resource).copied()
    }

    fn copy_bytes(&mut self, src_memory: u64, src_offset: usize, dst_memory: u64, dst_offset: usize, len: usize) {
        let bytes = match self.memory.get(&src_memory) {
            Some(src) if src_offset + len <= src.len() => src[src_offset..src_offset + len].to_vec(),
            _ => {
                self.violations.push(format!("copy reads past source memory {src_memory}"));
                return;
            }
        };
        match self.memory.get_mut(&dst_memory) {
            Some(dst) if dst_offset + len <= dst.len() => dst[dst_offset..dst_offset + len].copy_from_slice(&bytes),
            _ => self.violations.push(format!("copy writes past destination memory {dst_memory}")),
        }
    }

    fn execute(&mut self, cmd: vk::CommandBuffer) {
        let commands = self.recordings.get(&cmd.as_raw()).cloned().unwrap_or_default();
        for command in commands {
            match command {
                Recorded::CopyBuffer { src, dst, regions } => {
                    let (Some(src_mem), Some(dst_mem)) = (self.bound_memory(src.as_raw()), self.bound_memory(dst.as_raw()))
                    else {
                        self.violations.push("copy between unbound buffers".to_string());
                        continue;
                    };
                    for region in regions {
                        self.copy_bytes(
                            src_mem,
                            region.src_offset as usize,
                            dst_mem,
                            region.dst_offset as usize,
                            region.size as usize,
                        );
                    }
                }
                Recorded::CopyBufferToImage { src, dst, regions } => {
                    let (Some(src_mem), Some(dst_mem)) = (self.bound_memory(src.as_raw()), self.bound_memory(dst.as_raw()))
                    else {
                        self.violations.push("copy into unbound image".to_string());
                        continue;
                    };
                    for region in regions {
                        let len = (region.image_extent.width * region.image_extent.height * 4) as usize;
                        self.copy_bytes(src_mem, region.buffer_offset as usize, dst_mem, 0, len);
                    }
                }
                Recorded::Barrier { old, new } => self.events.push(Event::Barrier { old, new }),
                Recorded::Draw { framebuffer, descriptor_set } => {
                    if !self.is_live(framebuffer) {
                        self.violations.push(format!("submitted draw into dead framebuffer {framebuffer:?}"));
                    }
                    if !self.is_live(descriptor_set) {
                        self.violations.push(format!("submitted draw with dead descriptor set {descriptor_set:?}"));
                    }
                }
            }
        }
    }

    fn pending_fences(&self) -> usize {
        self.fences.values().filter(|state| **state == FenceState::Pending).count()
    }
}

/// A `GpuDevice` that runs entirely on the host.
///
/// GPU work "completes" lazily: a submitted fence stays pending until the
/// host waits on it or the device goes idle. That is the slowest GPU the
/// host can observe, which is what backpressure tests need.
pub struct MockDevice {
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    families: QueueFamilies,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    state: Mutex<State>,
}

pub const MEMORY_TYPE_DEVICE_LOCAL: u32 = 0;
pub const MEMORY_TYPE_HOST_COHERENT: u32 = 1;

impl MockDevice {
    pub fn new() -> Self {
        let mut memory_properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 2,
            memory_heap_count: 2,
            ..Default::default()
        };
        memory_properties.memory_types[MEMORY_TYPE_DEVICE_LOCAL as usize] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 0,
        };
        memory_properties.memory_types[MEMORY_TYPE_HOST_COHERENT as usize] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            heap_index: 1,
        };

        let state = State {
            surface: Self::default_surface(),
            ..Default::default()
        };

        Self {
            memory_properties,
            families: QueueFamilies { graphics: 0, present: 0 },
            graphics_queue: vk::Queue::from_raw(0x1000),
            present_queue: vk::Queue::from_raw(0x2000),
            state: Mutex::new(state),
        }
    }

    /// 800x600 fixed extent, 2..=8 images, sRGB BGRA, FIFO + MAILBOX.
    pub fn default_surface() -> SurfaceSupport {
        SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR {
                min_image_count: 2,
                max_image_count: 8,
                current_extent: vk::Extent2D { width: 800, height: 600 },
                min_image_extent: vk::Extent2D { width: 1, height: 1 },
                max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
                current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                ..Default::default()
            },
            formats: vec![vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            }],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        }
    }

    pub fn with_families(mut self, families: QueueFamilies) -> Self {
        self.families = families;
        self
    }

    pub fn set_surface(&self, surface: SurfaceSupport) {
        self.state.lock().surface = surface;
    }

    pub fn script_acquire(&self, result: Scripted) {
        self.state.lock().acquire_script.push_back(result);
    }

    pub fn script_present(&self, result: Scripted) {
        self.state.lock().present_script.push_back(result);
    }

    pub fn live_count(&self, ty: vk::ObjectType) -> usize {
        self.state.lock().live.get(&ty).map_or(0, HashSet::len)
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    pub fn max_pending_fences(&self) -> usize {
        self.state.lock().max_pending
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    #[track_caller]
    pub fn assert_clean(&self) {
        let violations = self.violations();
        assert!(violations.is_empty(), "device misuse: {violations:#?}");
    }

    /// Raw contents of an allocation regardless of its memory type.
    pub fn memory_contents(&self, memory: vk::DeviceMemory) -> Vec<u8> {
        self.state.lock().memory.get(&memory.as_raw()).cloned().unwrap_or_default()
    }

    /// Number of live objects of every type, for leak checks.
    pub fn total_live(&self) -> usize {
        self.state.lock().live.values().map(HashSet::len).sum()
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for MockDevice {
    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    fn queue_families(&self) -> QueueFamilies {
        self.families
    }

    fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    fn wait_idle(&self) -> VkResult<()> {
        let mut state = self.state.lock();
        for fence in state.fences.values_mut() {
            if *fence == FenceState::Pending {
                *fence = FenceState::Signaled;
            }
        }
        state.events.push(Event::WaitIdle);
        Ok(())
    }

    fn create_buffer(&self, info: &vk::BufferCreateInfo) -> VkResult<vk::Buffer> {
        let mut state = self.state.lock();
        if info.size == 0 {
            return state.violate("buffer created with size 0".to_string());
        }
        let buffer: vk::Buffer = state.make();
        state.sizes.insert(buffer.as_raw(), info.size);
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        state.bindings.remove(&buffer.as_raw());
        state.sizes.remove(&buffer.as_raw());
        state.release(buffer);
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let size = self.state.lock().sizes.get(&buffer.as_raw()).copied().unwrap_or(0);
        vk::MemoryRequirements {
            size,
            alignment: 16,
            memory_type_bits: 0b11,
        }
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()> {
        let mut state = self.state.lock();
        if !state.is_live(buffer) || !state.is_live(memory) {
            return state.violate(format!("bind of dead buffer {buffer:?} or memory {memory:?}"));
        }
        if state.bindings.insert(buffer.as_raw(), memory.as_raw()).is_some() {
            return state.violate(format!("buffer {buffer:?} bound twice"));
        }
        Ok(())
    }

    fn create_image(&self, info: &vk::ImageCreateInfo) -> VkResult<vk::Image> {
        let mut state = self.state.lock();
        if info.extent.width == 0 || info.extent.height == 0 {
            return state.violate("image created with empty extent".to_string());
        }
        let image: vk::Image = state.make();
        let size = u64::from(info.extent.width) * u64::from(info.extent.height) * 4;
        state.sizes.insert(image.as_raw(), size);
        Ok(image)
    }

    fn destroy_image(&self, image: vk::Image) {
        let mut state = self.state.lock();
        state.bindings.remove(&image.as_raw());
        state.sizes.remove(&image.as_raw());
        state.release(image);
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let size = self.state.lock().sizes.get(&image.as_raw()).copied().unwrap_or(0);
        vk::MemoryRequirements {
            size,
            alignment: 16,
            memory_type_bits: 0b01,
        }
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> VkResult<()> {
        let mut state = self.state.lock();
        if !state.is_live(image) || !state.is_live(memory) {
            return state.violate(format!("bind of dead image {image:?} or memory {memory:?}"));
        }
        state.bindings.insert(image.as_raw(), memory.as_raw());
        Ok(())
    }

    fn allocate_memory(&self, size: vk::DeviceSize, memory_type_index: u32) -> VkResult<vk::DeviceMemory> {
        let mut state = self.state.lock();
        if memory_type_index >= self.memory_properties.memory_type_count {
            return state.violate(format!("memory type {memory_type_index} does not exist"));
        }
        let memory: vk::DeviceMemory = state.make();
        state.memory.insert(memory.as_raw(), vec![0; size as usize]);
        Ok(memory)
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.lock();
        state.memory.remove(&memory.as_raw());
        state.release(memory);
    }

    fn write_memory(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, data: &[u8]) -> VkResult<()> {
        let mut state = self.state.lock();
        let offset = offset as usize;
        match state.memory.get_mut(&memory.as_raw()) {
            Some(bytes) if offset + data.len() <= bytes.len() => {
                bytes[offset..offset + data.len()].copy_from_slice(data);
                Ok(())
            }
            _ => state.violate(format!("write of {} bytes past {memory:?}", data.len())),
        }
    }

    fn read_memory(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, len: usize) -> VkResult<Vec<u8>> {
        let mut state = self.state.lock();
        let offset = offset as usize;
        match state.memory.get(&memory.as_raw()) {
            Some(bytes) if offset + len <= bytes.len() => Ok(bytes[offset..offset + len].to_vec()),
            _ => state.violate(format!("read of {len} bytes past {memory:?}")),
        }
    }

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo) -> VkResult<vk::ImageView> {
        let mut state = self.state.lock();
        if info.image == vk::Image::null() {
            return state.violate("image view of a null image".to_string());
        }
        Ok(state.make())
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        let mut state = self.state.lock();
        let referenced = state
            .framebuffer_views
            .iter()
            .any(|(framebuffer, views)| views.contains(&view) && state.is_live(vk::Framebuffer::from_raw(*framebuffer)));
        if referenced {
            state.violations.push(format!("image view {view:?} destroyed while a framebuffer still uses it"));
        }
        state.release(view);
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let mut state = self.state.lock();
        let semaphore: vk::Semaphore = state.make();
        state.semaphores.insert(semaphore.as_raw(), false);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        state.semaphores.remove(&semaphore.as_raw());
        state.release(semaphore);
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut state = self.state.lock();
        let fence: vk::Fence = state.make();
        let initial = if signaled { FenceState::Signaled } else { FenceState::Unsignaled };
        state.fences.insert(fence.as_raw(), initial);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        if state.fences.remove(&fence.as_raw()) == Some(FenceState::Pending) {
            state.violations.push(format!("fence {fence:?} destroyed while pending"));
        }
        state.release(fence);
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout: u64) -> VkResult<()> {
        let mut state = self.state.lock();
        state.events.push(Event::FenceWait(fence));
        match state.fences.get(&fence.as_raw()).copied() {
            Some(FenceState::Signaled) => Ok(()),
            Some(FenceState::Pending) => {
                state.fences.insert(fence.as_raw(), FenceState::Signaled);
                Ok(())
            }
            Some(FenceState::Unsignaled) => {
                state.violations.push(format!("waited on {fence:?} which nothing will signal"));
                Err(vk::Result::TIMEOUT)
            }
            None => state.violate(format!("waited on dead fence {fence:?}")),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        match state.fences.get(&fence.as_raw()).copied() {
            Some(FenceState::Pending) => state.violate(format!("reset of pending fence {fence:?}")),
            Some(_) => {
                state.fences.insert(fence.as_raw(), FenceState::Unsignaled);
                Ok(())
            }
            None => state.violate(format!("reset of dead fence {fence:?}")),
        }
    }

    fn create_command_pool(&self, _queue_family: u32, _flags: vk::CommandPoolCreateFlags) -> VkResult<vk::CommandPool> {
        Ok(self.state.lock().make())
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        let owned = state.pool_buffers.remove(&pool.as_raw()).unwrap_or_default();
        for cmd in owned {
            if state.is_live(cmd) {
                state.release(cmd);
            }
        }
        state.release(pool);
    }

    fn allocate_command_buffers(&self, pool: vk::CommandPool, count: u32) -> VkResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        if !state.is_live(pool) {
            return state.violate(format!("allocation from dead pool {pool:?}"));
        }
        let buffers: Vec<vk::CommandBuffer> = (0..count).map(|_| state.make()).collect();
        state.pool_buffers.entry(pool.as_raw()).or_default().extend(&buffers);
        Ok(buffers)
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.lock();
        for &cmd in buffers {
            state.recordings.remove(&cmd.as_raw());
            state.release(cmd);
        }
        if let Some(owned) = state.pool_buffers.get_mut(&pool.as_raw()) {
            owned.retain(|cmd| !buffers.contains(cmd));
        }
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, _flags: vk::CommandBufferUsageFlags) -> VkResult<()> {
        let mut state = self.state.lock();
        if !state.is_live(cmd) {
            return state.violate(format!("begin on dead command buffer {cmd:?}"));
        }
        state.recordings.insert(cmd.as_raw(), Vec::new());
        state.recording.insert(cmd.as_raw());
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        if !state.recording.remove(&cmd.as_raw()) {
            return state.violate(format!("end on {cmd:?} which is not recording"));
        }
        Ok(())
    }

    fn cmd_copy_buffer(&self, cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        self.state.lock().record(
            cmd,
            Recorded::CopyBuffer {
                src,
                dst,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        let mut state = self.state.lock();
        if layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL {
            state.violations.push(format!("copy into image in layout {layout:?}"));
        }
        state.record(
            cmd,
            Recorded::CopyBufferToImage {
                src,
                dst,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        _src_stage: vk::PipelineStageFlags,
        _dst_stage: vk::PipelineStageFlags,
        image_barriers: &[vk::ImageMemoryBarrier],
    ) {
        let mut state = self.state.lock();
        for barrier in image_barriers {
            state.record(
                cmd,
                Recorded::Barrier {
                    old: barrier.old_layout,
                    new: barrier.new_layout,
                },
            );
        }
    }

    fn cmd_begin_render_pass(&self, cmd: vk::CommandBuffer, info: &vk::RenderPassBeginInfo) {
        let mut state = self.state.lock();
        if state.check_recording(cmd) {
            state.pending_draw.insert(cmd.as_raw(), (info.framebuffer, vk::DescriptorSet::null()));
        }
    }

    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        let mut state = self.state.lock();
        if state.check_recording(cmd) && !state.is_live(pipeline) {
            state.violations.push(format!("bound dead pipeline {pipeline:?}"));
        }
    }

    fn cmd_bind_vertex_buffer(&self, cmd: vk::CommandBuffer, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        if state.check_recording(cmd) && !state.is_live(buffer) {
            state.violations.push(format!("bound dead vertex buffer {buffer:?}"));
        }
    }

    fn cmd_bind_index_buffer(&self, cmd: vk::CommandBuffer, buffer: vk::Buffer, _index_type: vk::IndexType) {
        let mut state = self.state.lock();
        if state.check_recording(cmd) && !state.is_live(buffer) {
            state.violations.push(format!("bound dead index buffer {buffer:?}"));
        }
    }

    fn cmd_bind_descriptor_set(&self, cmd: vk::CommandBuffer, _layout: vk::PipelineLayout, set: vk::DescriptorSet) {
        let mut state = self.state.lock();
        if state.check_recording(cmd) {
            if let Some(draw) = state.pending_draw.get_mut(&cmd.as_raw()) {
                draw.1 = set;
            }
        }
    }

    fn cmd_draw_indexed(&self, cmd: vk::CommandBuffer, _index_count: u32) {
        let mut state = self.state.lock();
        let Some((framebuffer, descriptor_set)) = state.pending_draw.get(&cmd.as_raw()).copied() else {
            state.violations.push(format!("draw outside a render pass in {cmd:?}"));
            return;
        };
        state.record(cmd, Recorded::Draw { framebuffer, descriptor_set });
    }

    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        let mut state = self.state.lock();
        if state.check_recording(cmd) && state.pending_draw.remove(&cmd.as_raw()).is_none() {
            state.violations.push(format!("end render pass without begin in {cmd:?}"));
        }
    }

    fn queue_submit(&self, _queue: vk::Queue, submission: &Submission<'_>, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();

        for semaphore in submission.wait_semaphores {
            match state.semaphores.get(&semaphore.as_raw()).copied() {
                Some(true) => {
                    state.semaphores.insert(semaphore.as_raw(), false);
                }
                _ => return state.violate(format!("submit waits on unsignaled {semaphore:?}")),
            }
        }
        for &cmd in submission.command_buffers {
            if !state.is_live(cmd) || state.recording.contains(&cmd.as_raw()) {
                return state.violate(format!("submitted {cmd:?} which is dead or still recording"));
            }
            state.execute(cmd);
        }
        for semaphore in submission.signal_semaphores {
            if state.semaphores.insert(semaphore.as_raw(), true) == Some(true) {
                return state.violate(format!("submit signals already signaled {semaphore:?}"));
            }
        }
        if fence != vk::Fence::null() {
            match state.fences.get(&fence.as_raw()).copied() {
                Some(FenceState::Unsignaled) => {
                    state.fences.insert(fence.as_raw(), FenceState::Pending);
                }
                other => return state.violate(format!("submit with fence {fence:?} in state {other:?}")),
            }
            let pending = state.pending_fences();
            state.max_pending = state.max_pending.max(pending);
        }

        state.events.push(Event::Submit {
            command_buffers: submission.command_buffers.to_vec(),
            wait: submission.wait_semaphores.to_vec(),
            signal: submission.signal_semaphores.to_vec(),
            fence,
        });
        Ok(())
    }

    fn surface_support(&self) -> VkResult<SurfaceSupport> {
        Ok(self.state.lock().surface.clone())
    }

    fn create_swapchain(&self, info: &vk::SwapchainCreateInfoKHR) -> VkResult<vk::SwapchainKHR> {
        let mut state = self.state.lock();
        let others_live = state.live.get(&vk::ObjectType::SWAPCHAIN_KHR).map_or(0, HashSet::len);
        if others_live > 0 && info.old_swapchain == vk::SwapchainKHR::null() {
            state.violations.push("second swapchain created for one surface".to_string());
            return Err(vk::Result::ERROR_NATIVE_WINDOW_IN_USE_KHR);
        }
        let swapchain: vk::SwapchainKHR = state.make();
        let images = (0..info.min_image_count)
            .map(|i| vk::Image::from_raw(0xABC0_0000 + swapchain.as_raw() * 16 + u64::from(i)))
            .collect();
        state.swapchains.insert(swapchain.as_raw(), MockSwapchain { images, next: 0 });
        Ok(swapchain)
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        let mut state = self.state.lock();
        match state.swapchains.get(&swapchain.as_raw()) {
            Some(chain) => Ok(chain.images.clone()),
            None => state.violate(format!("images of dead swapchain {swapchain:?}")),
        }
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.lock();
        state.swapchains.remove(&swapchain.as_raw());
        state.release(swapchain);
    }

    fn acquire_next_image(&self, swapchain: vk::SwapchainKHR, signal: vk::Semaphore) -> VkResult<(u32, bool)> {
        let mut state = self.state.lock();
        let suboptimal = match state.acquire_script.pop_front() {
            Some(Scripted::OutOfDate) => return Err(vk::Result::ERROR_OUT_OF_DATE_KHR),
            Some(Scripted::Fail(result)) => return Err(result),
            Some(Scripted::Suboptimal) => true,
            None => false,
        };
        if state.semaphores.get(&signal.as_raw()).copied() != Some(false) {
            return state.violate(format!("acquire signals {signal:?} which is dead or already signaled"));
        }
        let Some(chain) = state.swapchains.get_mut(&swapchain.as_raw()) else {
            return state.violate(format!("acquire on dead swapchain {swapchain:?}"));
        };
        let image_index = chain.next;
        chain.next = (chain.next + 1) % chain.images.len() as u32;
        state.semaphores.insert(signal.as_raw(), true);
        state.events.push(Event::Acquire { image_index, signal });
        Ok((image_index, suboptimal))
    }

    fn queue_present(
        &self,
        _queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> VkResult<bool> {
        let mut state = self.state.lock();
        if state.semaphores.get(&wait.as_raw()).copied() != Some(true) {
            return state.violate(format!("present waits on unsignaled {wait:?}"));
        }
        if !state.swapchains.contains_key(&swapchain.as_raw()) {
            return state.violate(format!("present on dead swapchain {swapchain:?}"));
        }
        state.semaphores.insert(wait.as_raw(), false);
        state.events.push(Event::Present { image_index, wait });
        match state.present_script.pop_front() {
            Some(Scripted::OutOfDate) => Err(vk::Result::ERROR_OUT_OF_DATE_KHR),
            Some(Scripted::Fail(result)) => Err(result),
            Some(Scripted::Suboptimal) => Ok(true),
            None => Ok(false),
        }
    }

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        let mut state = self.state.lock();
        if code.is_empty() {
            return state.violate("empty shader module".to_string());
        }
        Ok(state.make())
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.state.lock().release(module);
    }

    fn create_render_pass(&self, _info: &vk::RenderPassCreateInfo) -> VkResult<vk::RenderPass> {
        Ok(self.state.lock().make())
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.state.lock().release(render_pass);
    }

    fn create_descriptor_set_layout(&self, _info: &vk::DescriptorSetLayoutCreateInfo) -> VkResult<vk::DescriptorSetLayout> {
        Ok(self.state.lock().make())
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.state.lock().release(layout);
    }

    fn create_pipeline_layout(&self, _info: &vk::PipelineLayoutCreateInfo) -> VkResult<vk::PipelineLayout> {
        Ok(self.state.lock().make())
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.state.lock().release(layout);
    }

    fn create_graphics_pipeline(&self, info: &vk::GraphicsPipelineCreateInfo) -> VkResult<vk::Pipeline> {
        let mut state = self.state.lock();
        if !state.is_live(info.render_pass) || !state.is_live(info.layout) {
            return state.violate("pipeline built against a dead render pass or layout".to_string());
        }
        Ok(state.make())
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.state.lock().release(pipeline);
    }

    fn create_framebuffer(&self, info: &vk::FramebufferCreateInfo) -> VkResult<vk::Framebuffer> {
        let mut state = self.state.lock();
        let views = if info.attachment_count == 0 {
            Vec::new()
        } else {
            // SAFETY: the caller keeps the attachment slice alive for the call.
            unsafe { std::slice::from_raw_parts(info.p_attachments, info.attachment_count as usize) }.to_vec()
        };
        if let Some(dead) = views.iter().find(|view| !state.is_live(**view)) {
            return state.violate(format!("framebuffer references dead view {dead:?}"));
        }
        let framebuffer: vk::Framebuffer = state.make();
        state.framebuffer_views.insert(framebuffer.as_raw(), views);
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        let mut state = self.state.lock();
        state.framebuffer_views.remove(&framebuffer.as_raw());
        state.release(framebuffer);
    }

    fn create_descriptor_pool(&self, _info: &vk::DescriptorPoolCreateInfo) -> VkResult<vk::DescriptorPool> {
        Ok(self.state.lock().make())
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state.lock();
        let owned = state.pool_sets.remove(&pool.as_raw()).unwrap_or_default();
        for set in owned {
            state.release(set);
        }
        state.release(pool);
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> VkResult<Vec<vk::DescriptorSet>> {
        let mut state = self.state.lock();
        if !state.is_live(pool) {
            return state.violate(format!("descriptor sets from dead pool {pool:?}"));
        }
        let sets: Vec<vk::DescriptorSet> = layouts.iter().map(|_| state.make()).collect();
        state.pool_sets.entry(pool.as_raw()).or_default().extend(&sets);
        Ok(sets)
    }

    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet]) {
        let mut state = self.state.lock();
        for write in writes {
            if !state.is_live(write.dst_set) {
                state.violations.push(format!("write to dead descriptor set {:?}", write.dst_set));
            }
        }
    }
}
