//! Core backend abstraction traits
//!
//! `GpuDevice` is the explicit, Vulkan-shaped seam every component of the
//! renderer talks to. It is object safe: components receive
//! `&mut dyn GpuDevice` and never know whether they drive the ash backend or
//! the CPU-simulated headless device.

use crate::backend::types::*;
use crate::render_graph::PassDescriptor;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Missing required device capability: {0}")]
    MissingFeature(String),
    #[error("Failed to create surface: {0}")]
    SurfaceCreationFailed(String),
    #[error("Failed to create device: {0}")]
    DeviceCreationFailed(String),
    #[error("Failed to create swapchain: {0}")]
    SwapchainCreationFailed(String),
    #[error("Failed to acquire next image: {0}")]
    AcquireImageFailed(String),
    #[error("Failed to present: {0}")]
    PresentFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create image: {0}")]
    ImageCreationFailed(String),
    #[error("Failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("Failed to create shader: {0}")]
    ShaderCreationFailed(String),
    #[error("Failed to create render pass: {0}")]
    RenderPassCreationFailed(String),
    #[error("Descriptor operation failed: {0}")]
    DescriptorFailed(String),
    #[error("Synchronization failed: {0}")]
    SynchronizationFailed(String),
    #[error("Command recording failed: {0}")]
    CommandRecordingFailed(String),
    #[error("Queue submission failed: {0}")]
    SubmitFailed(String),
    #[error("Timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },
    #[error("Usage violation: {0}")]
    Validation(String),
    #[error("Unknown resource: {0}")]
    ResourceNotFound(String),
    #[error("Diagnostics dump failed: {0}")]
    DiagnosticsFailed(String),
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),
    #[error("Surface lost")]
    SurfaceLost,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Handle to a CPU-observable fence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceHandle(pub(crate) u64);

/// Handle to a GPU-side semaphore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaphoreHandle(pub(crate) u64);

/// Handle to a command pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandPoolHandle(pub(crate) u64);

/// Handle to a primary command buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandBufferHandle(pub(crate) u64);

/// Handle to a swapchain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwapchainHandle(pub(crate) u64);

/// Handle to an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHandle(pub(crate) u64);

/// Handle to an image view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageViewHandle(pub(crate) u64);

/// Handle to a sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerHandle(pub(crate) u64);

/// Handle to a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u64);

/// Handle to a shader module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderModuleHandle(pub(crate) u64);

/// Handle to a render pass object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderPassHandle(pub(crate) u64);

/// Handle to a framebuffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferHandle(pub(crate) u64);

/// Handle to a descriptor set layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorSetLayoutHandle(pub(crate) u64);

/// Handle to a descriptor pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorPoolHandle(pub(crate) u64);

/// Handle to a descriptor set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorSetHandle(pub(crate) u64);

/// Handle to a pipeline layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineLayoutHandle(pub(crate) u64);

/// Handle to a graphics pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineHandle(pub(crate) u64);

/// Image descriptor
#[derive(Debug, Clone)]
pub struct ImageDescriptor {
    pub label: String,
    pub format: Format,
    pub extent: Extent2D,
    pub array_layers: u32,
    pub usage: ImageUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageViewKind {
    D2,
    D2Array,
}

/// Subresource selection for an image view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageViewDescriptor {
    pub kind: ImageViewKind,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl ImageViewDescriptor {
    pub fn single_layer(layer: u32) -> Self {
        Self {
            kind: ImageViewKind::D2,
            base_layer: layer,
            layer_count: 1,
        }
    }

    pub fn whole(array_layers: u32) -> Self {
        if array_layers > 1 {
            Self {
                kind: ImageViewKind::D2Array,
                base_layer: 0,
                layer_count: array_layers,
            }
        } else {
            Self::single_layer(0)
        }
    }
}

/// Buffer descriptor
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub label: String,
    pub size: u64,
    pub usage: BufferUsage,
    pub location: MemoryLocation,
}

/// Parameters for creating a swapchain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainDescriptor {
    pub surface_format: SurfaceFormat,
    pub present_mode: PresentMode,
    pub extent: Extent2D,
    pub image_count: u32,
    pub usage: ImageUsage,
}

#[derive(Debug, Clone)]
pub struct FramebufferDescriptor {
    pub render_pass: RenderPassHandle,
    pub attachments: Vec<ImageViewHandle>,
    pub extent: Extent2D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorSetLayoutBinding {
    pub binding: u32,
    pub ty: DescriptorType,
    pub stages: ShaderStages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorPoolSize {
    pub ty: DescriptorType,
    pub count: u32,
}

/// Concrete resource written into a descriptor binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorResource {
    Buffer {
        buffer: BufferHandle,
        offset: u64,
        range: u64,
    },
    Image {
        view: ImageViewHandle,
        sampler: Option<SamplerHandle>,
        layout: ImageLayout,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub ty: DescriptorType,
    pub resource: DescriptorResource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushConstantRange {
    pub stages: ShaderStages,
    pub offset: u32,
    pub size: u32,
}

/// Fixed-function and shader state of a graphics pipeline
#[derive(Debug, Clone)]
pub struct GraphicsPipelineDescriptor {
    pub label: String,
    pub vertex_module: ShaderModuleHandle,
    pub fragment_module: ShaderModuleHandle,
    pub entry_point: &'static str,
    pub vertex_layout: Option<VertexLayout>,
    pub cull_mode: CullMode,
    pub depth_compare: Option<CompareFunction>,
    pub depth_write: bool,
    pub color_attachment_count: u32,
    pub blend: bool,
    pub layout: PipelineLayoutHandle,
    pub render_pass: RenderPassHandle,
    pub subpass: u32,
    pub extent: Extent2D,
}

/// One queue submission with its semaphore chaining
#[derive(Debug, Clone, Copy)]
pub struct SubmitInfo {
    pub command_buffer: CommandBufferHandle,
    pub wait: Option<(SemaphoreHandle, PipelineStages)>,
    pub signal: Option<SemaphoreHandle>,
    pub fence: Option<FenceHandle>,
}

#[derive(Debug, Clone)]
pub struct RenderPassBegin {
    pub render_pass: RenderPassHandle,
    pub framebuffer: FramebufferHandle,
    pub extent: Extent2D,
    pub clear_values: Vec<ClearValue>,
}

/// Image layout transition with its execution/memory dependency
#[derive(Debug, Clone, Copy)]
pub struct ImageBarrier {
    pub image: ImageHandle,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
    pub base_layer: u32,
    pub layer_count: u32,
    pub src_stages: PipelineStages,
    pub dst_stages: PipelineStages,
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
}

/// Buffer region to/from one tightly packed image layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferImageCopy {
    pub buffer_offset: u64,
    pub layer: u32,
    pub extent: Extent2D,
}

/// Result of asking the platform for the next presentable image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { index: u32, suboptimal: bool },
    OutOfDate,
}

/// Result of queueing an image for presentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AllocationEntry {
    pub name: String,
    pub size: u64,
}

/// Device memory usage snapshot for diagnostics
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryReport {
    pub allocated_bytes: u64,
    pub reserved_bytes: u64,
    pub block_count: usize,
    pub allocations: Vec<AllocationEntry>,
}

/// Explicit GPU device interface
pub trait GpuDevice {
    /// Human readable backend name
    fn name(&self) -> &str;

    // Synchronization

    fn create_fence(&mut self, signaled: bool) -> BackendResult<FenceHandle>;

    /// Block until the fence is signaled. `None` waits forever.
    fn wait_for_fence(&mut self, fence: FenceHandle, timeout: Option<Duration>)
        -> BackendResult<()>;

    fn reset_fence(&mut self, fence: FenceHandle) -> BackendResult<()>;

    fn is_fence_signaled(&self, fence: FenceHandle) -> BackendResult<bool>;

    fn destroy_fence(&mut self, fence: FenceHandle);

    fn create_semaphore(&mut self) -> BackendResult<SemaphoreHandle>;

    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle);

    // Command pools and submission

    fn create_command_pool(&mut self, transient: bool) -> BackendResult<CommandPoolHandle>;

    /// Reset a pool, invalidating every buffer recorded from it
    fn reset_command_pool(&mut self, pool: CommandPoolHandle) -> BackendResult<()>;

    fn destroy_command_pool(&mut self, pool: CommandPoolHandle);

    fn allocate_command_buffer(
        &mut self,
        pool: CommandPoolHandle,
    ) -> BackendResult<CommandBufferHandle>;

    fn free_command_buffer(&mut self, pool: CommandPoolHandle, cmd: CommandBufferHandle);

    fn begin_command_buffer(&mut self, cmd: CommandBufferHandle, one_time: bool)
        -> BackendResult<()>;

    fn end_command_buffer(&mut self, cmd: CommandBufferHandle) -> BackendResult<()>;

    fn submit(&mut self, info: &SubmitInfo) -> BackendResult<()>;

    fn wait_idle(&mut self) -> BackendResult<()>;

    // Surface and swapchain

    fn surface_support(&mut self) -> BackendResult<SurfaceSupport>;

    fn create_swapchain(
        &mut self,
        desc: &SwapchainDescriptor,
        old: Option<SwapchainHandle>,
    ) -> BackendResult<SwapchainHandle>;

    fn swapchain_images(&self, swapchain: SwapchainHandle) -> BackendResult<Vec<ImageHandle>>;

    fn destroy_swapchain(&mut self, swapchain: SwapchainHandle);

    fn acquire_next_image(
        &mut self,
        swapchain: SwapchainHandle,
        signal: SemaphoreHandle,
        timeout: Option<Duration>,
    ) -> BackendResult<AcquireOutcome>;

    fn present(
        &mut self,
        swapchain: SwapchainHandle,
        image_index: u32,
        wait: SemaphoreHandle,
    ) -> BackendResult<PresentOutcome>;

    // Images and buffers

    fn create_image(&mut self, desc: &ImageDescriptor) -> BackendResult<ImageHandle>;

    fn create_image_view(
        &mut self,
        image: ImageHandle,
        desc: &ImageViewDescriptor,
    ) -> BackendResult<ImageViewHandle>;

    fn destroy_image_view(&mut self, view: ImageViewHandle);

    fn destroy_image(&mut self, image: ImageHandle);

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle>;

    fn destroy_sampler(&mut self, sampler: SamplerHandle);

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle>;

    /// Write through the host mapping of a host-visible buffer
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8])
        -> BackendResult<()>;

    /// Read through the host mapping of a host-visible buffer
    fn read_buffer(&self, buffer: BufferHandle, offset: u64, len: u64) -> BackendResult<Vec<u8>>;

    fn destroy_buffer(&mut self, buffer: BufferHandle);

    fn memory_report(&self) -> MemoryReport;

    // Pipeline objects

    fn create_shader_module(&mut self, code: &[u8]) -> BackendResult<ShaderModuleHandle>;

    fn destroy_shader_module(&mut self, module: ShaderModuleHandle);

    fn create_render_pass(&mut self, desc: &PassDescriptor) -> BackendResult<RenderPassHandle>;

    fn destroy_render_pass(&mut self, render_pass: RenderPassHandle);

    fn create_framebuffer(
        &mut self,
        desc: &FramebufferDescriptor,
    ) -> BackendResult<FramebufferHandle>;

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle);

    fn create_descriptor_set_layout(
        &mut self,
        bindings: &[DescriptorSetLayoutBinding],
    ) -> BackendResult<DescriptorSetLayoutHandle>;

    fn destroy_descriptor_set_layout(&mut self, layout: DescriptorSetLayoutHandle);

    fn create_descriptor_pool(
        &mut self,
        sizes: &[DescriptorPoolSize],
        max_sets: u32,
    ) -> BackendResult<DescriptorPoolHandle>;

    /// Return every set allocated from the pool
    fn reset_descriptor_pool(&mut self, pool: DescriptorPoolHandle) -> BackendResult<()>;

    fn destroy_descriptor_pool(&mut self, pool: DescriptorPoolHandle);

    fn allocate_descriptor_set(
        &mut self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
    ) -> BackendResult<DescriptorSetHandle>;

    fn update_descriptor_set(
        &mut self,
        set: DescriptorSetHandle,
        writes: &[DescriptorWrite],
    ) -> BackendResult<()>;

    fn create_pipeline_layout(
        &mut self,
        set_layouts: &[DescriptorSetLayoutHandle],
        push_constants: &[PushConstantRange],
    ) -> BackendResult<PipelineLayoutHandle>;

    fn destroy_pipeline_layout(&mut self, layout: PipelineLayoutHandle);

    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDescriptor,
    ) -> BackendResult<PipelineHandle>;

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle);

    // Command recording

    fn cmd_begin_render_pass(&mut self, cmd: CommandBufferHandle, begin: &RenderPassBegin);

    fn cmd_next_subpass(&mut self, cmd: CommandBufferHandle);

    fn cmd_end_render_pass(&mut self, cmd: CommandBufferHandle);

    fn cmd_bind_pipeline(&mut self, cmd: CommandBufferHandle, pipeline: PipelineHandle);

    fn cmd_bind_descriptor_sets(
        &mut self,
        cmd: CommandBufferHandle,
        layout: PipelineLayoutHandle,
        first_set: u32,
        sets: &[DescriptorSetHandle],
    );

    fn cmd_push_constants(
        &mut self,
        cmd: CommandBufferHandle,
        layout: PipelineLayoutHandle,
        stages: ShaderStages,
        offset: u32,
        data: &[u8],
    );

    fn cmd_bind_vertex_buffer(&mut self, cmd: CommandBufferHandle, buffer: BufferHandle);

    fn cmd_draw(&mut self, cmd: CommandBufferHandle, vertex_count: u32, instance_count: u32);

    fn cmd_copy_buffer(
        &mut self,
        cmd: CommandBufferHandle,
        src: BufferHandle,
        dst: BufferHandle,
        size: u64,
    );

    fn cmd_copy_buffer_to_image(
        &mut self,
        cmd: CommandBufferHandle,
        src: BufferHandle,
        dst: ImageHandle,
        region: &BufferImageCopy,
    );

    fn cmd_copy_image_to_buffer(
        &mut self,
        cmd: CommandBufferHandle,
        src: ImageHandle,
        dst: BufferHandle,
        region: &BufferImageCopy,
    );

    fn cmd_image_barrier(&mut self, cmd: CommandBufferHandle, barrier: &ImageBarrier);
}
