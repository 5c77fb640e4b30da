//! Vulkan backend implementation using ash
//!
//! Objects live in per-kind tables keyed by the `u64` inside each handle.
//! Memory comes from gpu-allocator; host-visible buffers stay persistently
//! mapped so `write_buffer`/`read_buffer` are plain copies.

pub mod convert;
pub mod init;

pub use init::InitContext;

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::render_graph::{AttachmentRef, PassDescriptor};
use crate::RendererConfig;
use ash::khr::swapchain;
use ash::vk;
use convert::*;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::collections::HashMap;
use std::ffi::CString;
use std::time::Duration;

struct ImageEntry {
    image: vk::Image,
    /// `None` for swapchain images, which the swapchain owns
    allocation: Option<Allocation>,
    format: Format,
}

struct BufferEntry {
    buffer: vk::Buffer,
    allocation: Allocation,
    size: u64,
}

struct SwapchainEntry {
    swapchain: vk::SwapchainKHR,
    images: Vec<ImageHandle>,
}

/// [`GpuDevice`] over a Vulkan logical device with one graphics+present queue
pub struct VulkanDevice {
    context: Option<InitContext>,
    device: ash::Device,
    queue: vk::Queue,
    queue_family: u32,
    swapchain_fn: swapchain::Device,
    allocator: Option<Mutex<Allocator>>,
    next_id: u64,

    fences: HashMap<u64, vk::Fence>,
    semaphores: HashMap<u64, vk::Semaphore>,
    command_pools: HashMap<u64, vk::CommandPool>,
    command_buffers: HashMap<u64, vk::CommandBuffer>,
    swapchains: HashMap<u64, SwapchainEntry>,
    images: HashMap<u64, ImageEntry>,
    views: HashMap<u64, vk::ImageView>,
    samplers: HashMap<u64, vk::Sampler>,
    buffers: HashMap<u64, BufferEntry>,
    shader_modules: HashMap<u64, vk::ShaderModule>,
    render_passes: HashMap<u64, vk::RenderPass>,
    framebuffers: HashMap<u64, vk::Framebuffer>,
    set_layouts: HashMap<u64, vk::DescriptorSetLayout>,
    descriptor_pools: HashMap<u64, vk::DescriptorPool>,
    /// Set and the pool it came from
    descriptor_sets: HashMap<u64, (vk::DescriptorSet, u64)>,
    pipeline_layouts: HashMap<u64, vk::PipelineLayout>,
    pipelines: HashMap<u64, vk::Pipeline>,
}

fn lookup<T: Copy>(table: &HashMap<u64, T>, id: u64, kind: &str) -> BackendResult<T> {
    table
        .get(&id)
        .copied()
        .ok_or_else(|| BackendError::ResourceNotFound(format!("{} {}", kind, id)))
}

fn timeout_nanos(timeout: Option<Duration>) -> u64 {
    timeout.map_or(u64::MAX, |t| t.as_nanos().min(u64::MAX as u128) as u64)
}

impl VulkanDevice {
    /// Create a device presenting to `window`.
    ///
    /// The window must outlive the device.
    pub fn new<W>(window: &W, config: &RendererConfig) -> BackendResult<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let context = InitContext::new(window, &config.app_name, config.validation)?;
        Self::from_context(context)
    }

    /// Create the logical device, queue and allocator from a prepared context.
    pub fn from_context(context: InitContext) -> BackendResult<Self> {
        let device = match create_logical_device(&context) {
            Ok(device) => device,
            Err(e) => {
                context.destroy();
                return Err(e);
            }
        };

        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: context.instance.clone(),
            device: device.clone(),
            physical_device: context.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        }) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                context.destroy();
                return Err(BackendError::InitializationFailed(format!("allocator: {}", e)));
            }
        };

        let queue = unsafe { device.get_device_queue(context.queue_family, 0) };
        let swapchain_fn = swapchain::Device::new(&context.instance, &device);

        log::info!("Vulkan device created on {}", context.device_name);

        Ok(Self {
            queue_family: context.queue_family,
            context: Some(context),
            device,
            queue,
            swapchain_fn,
            allocator: Some(Mutex::new(allocator)),
            next_id: 1,
            fences: HashMap::new(),
            semaphores: HashMap::new(),
            command_pools: HashMap::new(),
            command_buffers: HashMap::new(),
            swapchains: HashMap::new(),
            images: HashMap::new(),
            views: HashMap::new(),
            samplers: HashMap::new(),
            buffers: HashMap::new(),
            shader_modules: HashMap::new(),
            render_passes: HashMap::new(),
            framebuffers: HashMap::new(),
            set_layouts: HashMap::new(),
            descriptor_pools: HashMap::new(),
            descriptor_sets: HashMap::new(),
            pipeline_layouts: HashMap::new(),
            pipelines: HashMap::new(),
        })
    }

    /// Get the Vulkan device
    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    fn next(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn context(&self) -> BackendResult<&InitContext> {
        self.context
            .as_ref()
            .ok_or_else(|| BackendError::InitializationFailed("device already torn down".into()))
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: gpu_allocator::MemoryLocation,
        linear: bool,
    ) -> BackendResult<Allocation> {
        let allocator = self.allocator.as_ref().ok_or(BackendError::OutOfMemory)?;
        allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| match e {
                gpu_allocator::AllocationError::OutOfMemory => BackendError::OutOfMemory,
                other => BackendError::BufferCreationFailed(format!("{}: {}", name, other)),
            })
    }

    fn free(&self, allocation: Allocation) {
        if let Some(allocator) = &self.allocator {
            if let Err(e) = allocator.lock().free(allocation) {
                log::warn!("Failed to free allocation: {}", e);
            }
        }
    }

    fn command_buffer(&self, cmd: CommandBufferHandle) -> Option<vk::CommandBuffer> {
        let buffer = self.command_buffers.get(&cmd.0).copied();
        if buffer.is_none() {
            log::error!("Recording into unknown command buffer {}", cmd.0);
        }
        buffer
    }

    fn image_entry(&self, image: ImageHandle) -> BackendResult<&ImageEntry> {
        self.images
            .get(&image.0)
            .ok_or_else(|| BackendError::ResourceNotFound(format!("image {}", image.0)))
    }

    fn surface_capabilities(&self) -> BackendResult<vk::SurfaceCapabilitiesKHR> {
        let context = self.context()?;
        unsafe {
            context
                .surface_fn
                .get_physical_device_surface_capabilities(context.physical_device, context.surface)
        }
        .map_err(|e| match e {
            vk::Result::ERROR_SURFACE_LOST_KHR => BackendError::SurfaceLost,
            other => BackendError::SwapchainCreationFailed(other.to_string()),
        })
    }
}

fn create_logical_device(context: &InitContext) -> BackendResult<ash::Device> {
    let priorities = [1.0f32];
    let queue_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(context.queue_family)
        .queue_priorities(&priorities)];
    let extensions = [swapchain::NAME.as_ptr()];
    let features = vk::PhysicalDeviceFeatures::default();

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&extensions)
        .enabled_features(&features);

    unsafe {
        context
            .instance
            .create_device(context.physical_device, &create_info, None)
    }
    .map_err(|e| BackendError::DeviceCreationFailed(format!("{:?}", e)))
}

fn map_device_error(e: vk::Result, wrap: fn(String) -> BackendError) -> BackendError {
    match e {
        vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
        vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
            BackendError::OutOfMemory
        }
        other => wrap(other.to_string()),
    }
}

impl GpuDevice for VulkanDevice {
    fn name(&self) -> &str {
        "vulkan"
    }

    fn create_fence(&mut self, signaled: bool) -> BackendResult<FenceHandle> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence = unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)
        }
        .map_err(|e| map_device_error(e, BackendError::SynchronizationFailed))?;
        let id = self.next();
        self.fences.insert(id, fence);
        Ok(FenceHandle(id))
    }

    fn wait_for_fence(
        &mut self,
        fence: FenceHandle,
        timeout: Option<Duration>,
    ) -> BackendResult<()> {
        let raw = lookup(&self.fences, fence.0, "fence")?;
        match unsafe { self.device.wait_for_fences(&[raw], true, timeout_nanos(timeout)) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(BackendError::Timeout {
                what: format!("fence {}", fence.0),
                timeout: timeout.unwrap_or_default(),
            }),
            Err(e) => Err(map_device_error(e, BackendError::SynchronizationFailed)),
        }
    }

    fn reset_fence(&mut self, fence: FenceHandle) -> BackendResult<()> {
        let raw = lookup(&self.fences, fence.0, "fence")?;
        unsafe { self.device.reset_fences(&[raw]) }
            .map_err(|e| map_device_error(e, BackendError::SynchronizationFailed))
    }

    fn is_fence_signaled(&self, fence: FenceHandle) -> BackendResult<bool> {
        let raw = lookup(&self.fences, fence.0, "fence")?;
        unsafe { self.device.get_fence_status(raw) }
            .map_err(|e| map_device_error(e, BackendError::SynchronizationFailed))
    }

    fn destroy_fence(&mut self, fence: FenceHandle) {
        if let Some(raw) = self.fences.remove(&fence.0) {
            unsafe { self.device.destroy_fence(raw, None) };
        }
    }

    fn create_semaphore(&mut self) -> BackendResult<SemaphoreHandle> {
        let semaphore = unsafe {
            self.device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        }
        .map_err(|e| map_device_error(e, BackendError::SynchronizationFailed))?;
        let id = self.next();
        self.semaphores.insert(id, semaphore);
        Ok(SemaphoreHandle(id))
    }

    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle) {
        if let Some(raw) = self.semaphores.remove(&semaphore.0) {
            unsafe { self.device.destroy_semaphore(raw, None) };
        }
    }

    fn create_command_pool(&mut self, transient: bool) -> BackendResult<CommandPoolHandle> {
        let flags = if transient {
            vk::CommandPoolCreateFlags::TRANSIENT
        } else {
            vk::CommandPoolCreateFlags::empty()
        };
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.queue_family)
            .flags(flags);
        let pool = unsafe { self.device.create_command_pool(&info, None) }
            .map_err(|e| map_device_error(e, BackendError::CommandRecordingFailed))?;
        let id = self.next();
        self.command_pools.insert(id, pool);
        Ok(CommandPoolHandle(id))
    }

    fn reset_command_pool(&mut self, pool: CommandPoolHandle) -> BackendResult<()> {
        let raw = lookup(&self.command_pools, pool.0, "command pool")?;
        unsafe {
            self.device
                .reset_command_pool(raw, vk::CommandPoolResetFlags::empty())
        }
        .map_err(|e| map_device_error(e, BackendError::CommandRecordingFailed))
    }

    fn destroy_command_pool(&mut self, pool: CommandPoolHandle) {
        if let Some(raw) = self.command_pools.remove(&pool.0) {
            unsafe { self.device.destroy_command_pool(raw, None) };
        }
    }

    fn allocate_command_buffer(
        &mut self,
        pool: CommandPoolHandle,
    ) -> BackendResult<CommandBufferHandle> {
        let raw_pool = lookup(&self.command_pools, pool.0, "command pool")?;
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(raw_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info) }
            .map_err(|e| map_device_error(e, BackendError::CommandRecordingFailed))?;
        let buffer = buffers.into_iter().next().ok_or_else(|| {
            BackendError::CommandRecordingFailed("driver returned no command buffer".into())
        })?;
        let id = self.next();
        self.command_buffers.insert(id, buffer);
        Ok(CommandBufferHandle(id))
    }

    fn free_command_buffer(&mut self, pool: CommandPoolHandle, cmd: CommandBufferHandle) {
        let Some(buffer) = self.command_buffers.remove(&cmd.0) else {
            return;
        };
        if let Some(raw_pool) = self.command_pools.get(&pool.0) {
            unsafe { self.device.free_command_buffers(*raw_pool, &[buffer]) };
        }
    }

    fn begin_command_buffer(
        &mut self,
        cmd: CommandBufferHandle,
        one_time: bool,
    ) -> BackendResult<()> {
        let buffer = lookup(&self.command_buffers, cmd.0, "command buffer")?;
        let flags = if one_time {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::empty()
        };
        unsafe {
            self.device
                .begin_command_buffer(buffer, &vk::CommandBufferBeginInfo::default().flags(flags))
        }
        .map_err(|e| map_device_error(e, BackendError::CommandRecordingFailed))
    }

    fn end_command_buffer(&mut self, cmd: CommandBufferHandle) -> BackendResult<()> {
        let buffer = lookup(&self.command_buffers, cmd.0, "command buffer")?;
        unsafe { self.device.end_command_buffer(buffer) }
            .map_err(|e| map_device_error(e, BackendError::CommandRecordingFailed))
    }

    fn submit(&mut self, info: &SubmitInfo) -> BackendResult<()> {
        let buffers = [lookup(&self.command_buffers, info.command_buffer.0, "command buffer")?];
        let (wait_semaphores, wait_stages) = match info.wait {
            Some((semaphore, stages)) => (
                vec![lookup(&self.semaphores, semaphore.0, "semaphore")?],
                vec![stages_to_vk(stages)],
            ),
            None => (Vec::new(), Vec::new()),
        };
        let signal_semaphores = match info.signal {
            Some(semaphore) => vec![lookup(&self.semaphores, semaphore.0, "semaphore")?],
            None => Vec::new(),
        };
        let fence = match info.fence {
            Some(fence) => lookup(&self.fences, fence.0, "fence")?,
            None => vk::Fence::null(),
        };

        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&buffers)
            .signal_semaphores(&signal_semaphores);
        unsafe { self.device.queue_submit(self.queue, &[submit], fence) }
            .map_err(|e| map_device_error(e, BackendError::SubmitFailed))
    }

    fn wait_idle(&mut self) -> BackendResult<()> {
        unsafe { self.device.device_wait_idle() }
            .map_err(|e| map_device_error(e, BackendError::SynchronizationFailed))
    }

    fn surface_support(&mut self) -> BackendResult<SurfaceSupport> {
        let caps = self.surface_capabilities()?;
        let context = self.context()?;
        let formats = unsafe {
            context
                .surface_fn
                .get_physical_device_surface_formats(context.physical_device, context.surface)
        }
        .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;
        let present_modes = unsafe {
            context
                .surface_fn
                .get_physical_device_surface_present_modes(context.physical_device, context.surface)
        }
        .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

        let current_extent = if caps.current_extent.width == u32::MAX {
            None
        } else {
            Some(Extent2D::new(
                caps.current_extent.width,
                caps.current_extent.height,
            ))
        };

        Ok(SurfaceSupport {
            capabilities: SurfaceCapabilities {
                min_image_count: caps.min_image_count,
                max_image_count: caps.max_image_count,
                current_extent,
                min_image_extent: Extent2D::new(
                    caps.min_image_extent.width,
                    caps.min_image_extent.height,
                ),
                max_image_extent: Extent2D::new(
                    caps.max_image_extent.width,
                    caps.max_image_extent.height,
                ),
                supported_usage: image_usage_from_vk(caps.supported_usage_flags),
            },
            formats: formats
                .iter()
                .map(|f| SurfaceFormat {
                    format: format_from_vk(f.format),
                    color_space: color_space_from_vk(f.color_space),
                })
                .collect(),
            present_modes: present_modes
                .iter()
                .filter_map(|m| present_mode_from_vk(*m))
                .collect(),
        })
    }

    fn create_swapchain(
        &mut self,
        desc: &SwapchainDescriptor,
        old: Option<SwapchainHandle>,
    ) -> BackendResult<SwapchainHandle> {
        let caps = self.surface_capabilities()?;
        let surface = self.context()?.surface;
        let old_swapchain = match old {
            Some(old) => self
                .swapchains
                .get(&old.0)
                .map_or(vk::SwapchainKHR::null(), |entry| entry.swapchain),
            None => vk::SwapchainKHR::null(),
        };
        let composite_alpha = [
            vk::CompositeAlphaFlagsKHR::OPAQUE,
            vk::CompositeAlphaFlagsKHR::INHERIT,
            vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
            vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
        ]
        .into_iter()
        .find(|mode| caps.supported_composite_alpha.contains(*mode))
        .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE);

        let info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(desc.image_count)
            .image_format(format_to_vk(desc.surface_format.format))
            .image_color_space(color_space_to_vk(desc.surface_format.color_space))
            .image_extent(vk::Extent2D {
                width: desc.extent.width,
                height: desc.extent.height,
            })
            .image_array_layers(1)
            .image_usage(image_usage_to_vk(desc.usage))
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(composite_alpha)
            .present_mode(present_mode_to_vk(desc.present_mode))
            .clipped(true)
            .old_swapchain(old_swapchain);

        let raw = unsafe { self.swapchain_fn.create_swapchain(&info, None) }.map_err(|e| match e
        {
            vk::Result::ERROR_SURFACE_LOST_KHR => BackendError::SurfaceLost,
            other => BackendError::SwapchainCreationFailed(other.to_string()),
        })?;
        let raw_images = match unsafe { self.swapchain_fn.get_swapchain_images(raw) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { self.swapchain_fn.destroy_swapchain(raw, None) };
                return Err(BackendError::SwapchainCreationFailed(e.to_string()));
            }
        };

        let mut images = Vec::with_capacity(raw_images.len());
        for image in raw_images {
            let id = self.next();
            self.images.insert(
                id,
                ImageEntry {
                    image,
                    allocation: None,
                    format: desc.surface_format.format,
                },
            );
            images.push(ImageHandle(id));
        }

        let id = self.next();
        self.swapchains.insert(
            id,
            SwapchainEntry {
                swapchain: raw,
                images,
            },
        );
        Ok(SwapchainHandle(id))
    }

    fn swapchain_images(&self, swapchain: SwapchainHandle) -> BackendResult<Vec<ImageHandle>> {
        self.swapchains
            .get(&swapchain.0)
            .map(|entry| entry.images.clone())
            .ok_or_else(|| BackendError::ResourceNotFound(format!("swapchain {}", swapchain.0)))
    }

    fn destroy_swapchain(&mut self, swapchain: SwapchainHandle) {
        let Some(entry) = self.swapchains.remove(&swapchain.0) else {
            return;
        };
        for image in &entry.images {
            self.images.remove(&image.0);
        }
        unsafe { self.swapchain_fn.destroy_swapchain(entry.swapchain, None) };
    }

    fn acquire_next_image(
        &mut self,
        swapchain: SwapchainHandle,
        signal: SemaphoreHandle,
        timeout: Option<Duration>,
    ) -> BackendResult<AcquireOutcome> {
        let raw = self
            .swapchains
            .get(&swapchain.0)
            .map(|entry| entry.swapchain)
            .ok_or_else(|| BackendError::ResourceNotFound(format!("swapchain {}", swapchain.0)))?;
        let semaphore = lookup(&self.semaphores, signal.0, "semaphore")?;

        match unsafe {
            self.swapchain_fn.acquire_next_image(
                raw,
                timeout_nanos(timeout),
                semaphore,
                vk::Fence::null(),
            )
        } {
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Acquired { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => Err(BackendError::Timeout {
                what: "swapchain image".into(),
                timeout: timeout.unwrap_or_default(),
            }),
            Err(vk::Result::ERROR_SURFACE_LOST_KHR) => Err(BackendError::SurfaceLost),
            Err(e) => Err(map_device_error(e, BackendError::AcquireImageFailed)),
        }
    }

    fn present(
        &mut self,
        swapchain: SwapchainHandle,
        image_index: u32,
        wait: SemaphoreHandle,
    ) -> BackendResult<PresentOutcome> {
        let raw = self
            .swapchains
            .get(&swapchain.0)
            .map(|entry| entry.swapchain)
            .ok_or_else(|| BackendError::ResourceNotFound(format!("swapchain {}", swapchain.0)))?;
        let wait_semaphores = [lookup(&self.semaphores, wait.0, "semaphore")?];
        let swapchains = [raw];
        let indices = [image_index];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);

        match unsafe { self.swapchain_fn.queue_present(self.queue, &info) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(vk::Result::ERROR_SURFACE_LOST_KHR) => Err(BackendError::SurfaceLost),
            Err(e) => Err(map_device_error(e, BackendError::PresentFailed)),
        }
    }

    fn create_image(&mut self, desc: &ImageDescriptor) -> BackendResult<ImageHandle> {
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format_to_vk(desc.format))
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(image_usage_to_vk(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.device.create_image(&info, None) }
            .map_err(|e| map_device_error(e, BackendError::ImageCreationFailed))?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.allocate(
            &desc.label,
            requirements,
            gpu_allocator::MemoryLocation::GpuOnly,
            false,
        ) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };
        if let Err(e) = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        } {
            unsafe { self.device.destroy_image(image, None) };
            self.free(allocation);
            return Err(BackendError::ImageCreationFailed(e.to_string()));
        }

        let id = self.next();
        self.images.insert(
            id,
            ImageEntry {
                image,
                allocation: Some(allocation),
                format: desc.format,
            },
        );
        Ok(ImageHandle(id))
    }

    fn create_image_view(
        &mut self,
        image: ImageHandle,
        desc: &ImageViewDescriptor,
    ) -> BackendResult<ImageViewHandle> {
        let entry = self.image_entry(image)?;
        let view_type = match desc.kind {
            ImageViewKind::D2 => vk::ImageViewType::TYPE_2D,
            ImageViewKind::D2Array => vk::ImageViewType::TYPE_2D_ARRAY,
        };
        let info = vk::ImageViewCreateInfo::default()
            .image(entry.image)
            .view_type(view_type)
            .format(format_to_vk(entry.format))
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: view_aspect_for(entry.format),
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: desc.base_layer,
                layer_count: desc.layer_count,
            });
        let view = unsafe { self.device.create_image_view(&info, None) }
            .map_err(|e| map_device_error(e, BackendError::ImageCreationFailed))?;
        let id = self.next();
        self.views.insert(id, view);
        Ok(ImageViewHandle(id))
    }

    fn destroy_image_view(&mut self, view: ImageViewHandle) {
        if let Some(raw) = self.views.remove(&view.0) {
            unsafe { self.device.destroy_image_view(raw, None) };
        }
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        let Some(entry) = self.images.remove(&image.0) else {
            return;
        };
        match entry.allocation {
            Some(allocation) => {
                unsafe { self.device.destroy_image(entry.image, None) };
                self.free(allocation);
            }
            None => {
                log::warn!("Image {} belongs to a swapchain, not destroying", image.0);
                self.images.insert(image.0, ImageEntry { allocation: None, ..entry });
            }
        }
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        let address_mode = address_mode_to_vk(desc.address_mode);
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(filter_to_vk(desc.filter))
            .min_filter(filter_to_vk(desc.filter))
            .mipmap_mode(mipmap_mode_to_vk(desc.filter))
            .address_mode_u(address_mode)
            .address_mode_v(address_mode)
            .address_mode_w(address_mode)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK);
        let sampler = unsafe { self.device.create_sampler(&info, None) }
            .map_err(|e| map_device_error(e, BackendError::ImageCreationFailed))?;
        let id = self.next();
        self.samplers.insert(id, sampler);
        Ok(SamplerHandle(id))
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        if let Some(raw) = self.samplers.remove(&sampler.0) {
            unsafe { self.device.destroy_sampler(raw, None) };
        }
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        let info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(buffer_usage_to_vk(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&info, None) }
            .map_err(|e| map_device_error(e, BackendError::BufferCreationFailed))?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.allocate(
            &desc.label,
            requirements,
            memory_location_to_vk(desc.location),
            true,
        ) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.free(allocation);
            return Err(BackendError::BufferCreationFailed(e.to_string()));
        }

        let id = self.next();
        self.buffers.insert(
            id,
            BufferEntry {
                buffer,
                allocation,
                size: desc.size,
            },
        );
        Ok(BufferHandle(id))
    }

    fn write_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> BackendResult<()> {
        let entry = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| BackendError::ResourceNotFound(format!("buffer {}", buffer.0)))?;
        let end = offset + data.len() as u64;
        if end > entry.size {
            return Err(BackendError::Validation(format!(
                "write of {} bytes at {} overflows buffer of {}",
                data.len(),
                offset,
                entry.size
            )));
        }
        let mapped = entry.allocation.mapped_slice_mut().ok_or_else(|| {
            BackendError::Validation(format!("buffer {} is not host visible", buffer.0))
        })?;
        mapped[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferHandle, offset: u64, len: u64) -> BackendResult<Vec<u8>> {
        let entry = self
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| BackendError::ResourceNotFound(format!("buffer {}", buffer.0)))?;
        let end = offset + len;
        if end > entry.size {
            return Err(BackendError::Validation(format!(
                "read of {} bytes at {} overflows buffer of {}",
                len, offset, entry.size
            )));
        }
        let mapped = entry.allocation.mapped_slice().ok_or_else(|| {
            BackendError::Validation(format!("buffer {} is not host visible", buffer.0))
        })?;
        Ok(mapped[offset as usize..end as usize].to_vec())
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(entry) = self.buffers.remove(&buffer.0) {
            unsafe { self.device.destroy_buffer(entry.buffer, None) };
            self.free(entry.allocation);
        }
    }

    fn memory_report(&self) -> MemoryReport {
        let Some(allocator) = &self.allocator else {
            return MemoryReport::default();
        };
        let report = allocator.lock().generate_report();
        MemoryReport {
            allocated_bytes: report.total_allocated_bytes,
            reserved_bytes: report.total_reserved_bytes,
            block_count: report.blocks.len(),
            allocations: report
                .allocations
                .iter()
                .map(|a| AllocationEntry {
                    name: a.name.clone(),
                    size: a.size,
                })
                .collect(),
        }
    }

    fn create_shader_module(&mut self, code: &[u8]) -> BackendResult<ShaderModuleHandle> {
        let words = ash::util::read_spv(&mut std::io::Cursor::new(code))
            .map_err(|e| BackendError::ShaderCreationFailed(e.to_string()))?;
        let info = vk::ShaderModuleCreateInfo::default().code(&words);
        let module = unsafe { self.device.create_shader_module(&info, None) }
            .map_err(|e| map_device_error(e, BackendError::ShaderCreationFailed))?;
        let id = self.next();
        self.shader_modules.insert(id, module);
        Ok(ShaderModuleHandle(id))
    }

    fn destroy_shader_module(&mut self, module: ShaderModuleHandle) {
        if let Some(raw) = self.shader_modules.remove(&module.0) {
            unsafe { self.device.destroy_shader_module(raw, None) };
        }
    }

    fn create_render_pass(&mut self, desc: &PassDescriptor) -> BackendResult<RenderPassHandle> {
        desc.validate()?;

        let attachments: Vec<vk::AttachmentDescription> = desc
            .attachments
            .iter()
            .map(|a| {
                vk::AttachmentDescription::default()
                    .format(format_to_vk(a.format))
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(load_op_to_vk(a.load_op))
                    .store_op(store_op_to_vk(a.store_op))
                    .stencil_load_op(load_op_to_vk(a.stencil_load_op))
                    .stencil_store_op(store_op_to_vk(a.stencil_store_op))
                    .initial_layout(layout_to_vk(a.initial_layout))
                    .final_layout(layout_to_vk(a.final_layout))
            })
            .collect();

        let to_refs = |refs: &[AttachmentRef]| -> Vec<vk::AttachmentReference> {
            refs.iter()
                .map(|r| vk::AttachmentReference {
                    attachment: r.attachment,
                    layout: layout_to_vk(r.layout),
                })
                .collect()
        };
        let inputs: Vec<Vec<vk::AttachmentReference>> = desc
            .subpasses
            .iter()
            .map(|s| to_refs(&s.input_attachments))
            .collect();
        let colors: Vec<Vec<vk::AttachmentReference>> = desc
            .subpasses
            .iter()
            .map(|s| to_refs(&s.color_attachments))
            .collect();
        let depths: Vec<Option<vk::AttachmentReference>> = desc
            .subpasses
            .iter()
            .map(|s| {
                s.depth_attachment.map(|r| vk::AttachmentReference {
                    attachment: r.attachment,
                    layout: layout_to_vk(r.layout),
                })
            })
            .collect();

        let subpasses: Vec<vk::SubpassDescription> = (0..desc.subpasses.len())
            .map(|i| {
                let subpass = vk::SubpassDescription::default()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .input_attachments(&inputs[i])
                    .color_attachments(&colors[i]);
                match &depths[i] {
                    Some(depth) => subpass.depth_stencil_attachment(depth),
                    None => subpass,
                }
            })
            .collect();

        let dependencies: Vec<vk::SubpassDependency> = desc
            .dependencies
            .iter()
            .map(|d| {
                vk::SubpassDependency::default()
                    .src_subpass(d.src_subpass)
                    .dst_subpass(d.dst_subpass)
                    .src_stage_mask(stages_to_vk(d.src_stages))
                    .dst_stage_mask(stages_to_vk(d.dst_stages))
                    .src_access_mask(access_to_vk(d.src_access))
                    .dst_access_mask(access_to_vk(d.dst_access))
                    .dependency_flags(if d.by_region {
                        vk::DependencyFlags::BY_REGION
                    } else {
                        vk::DependencyFlags::empty()
                    })
            })
            .collect();

        let info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        let render_pass = unsafe { self.device.create_render_pass(&info, None) }
            .map_err(|e| map_device_error(e, BackendError::RenderPassCreationFailed))?;
        log::debug!(
            "Render pass '{}': {} attachments, {} subpasses",
            desc.label,
            attachments.len(),
            subpasses.len()
        );

        let id = self.next();
        self.render_passes.insert(id, render_pass);
        Ok(RenderPassHandle(id))
    }

    fn destroy_render_pass(&mut self, render_pass: RenderPassHandle) {
        if let Some(raw) = self.render_passes.remove(&render_pass.0) {
            unsafe { self.device.destroy_render_pass(raw, None) };
        }
    }

    fn create_framebuffer(
        &mut self,
        desc: &FramebufferDescriptor,
    ) -> BackendResult<FramebufferHandle> {
        let render_pass = lookup(&self.render_passes, desc.render_pass.0, "render pass")?;
        let attachments = desc
            .attachments
            .iter()
            .map(|view| lookup(&self.views, view.0, "image view"))
            .collect::<BackendResult<Vec<_>>>()?;
        let info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(desc.extent.width)
            .height(desc.extent.height)
            .layers(1);
        let framebuffer = unsafe { self.device.create_framebuffer(&info, None) }
            .map_err(|e| map_device_error(e, BackendError::RenderPassCreationFailed))?;
        let id = self.next();
        self.framebuffers.insert(id, framebuffer);
        Ok(FramebufferHandle(id))
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        if let Some(raw) = self.framebuffers.remove(&framebuffer.0) {
            unsafe { self.device.destroy_framebuffer(raw, None) };
        }
    }

    fn create_descriptor_set_layout(
        &mut self,
        bindings: &[DescriptorSetLayoutBinding],
    ) -> BackendResult<DescriptorSetLayoutHandle> {
        let raw_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(descriptor_type_to_vk(b.ty))
                    .descriptor_count(1)
                    .stage_flags(shader_stages_to_vk(b.stages))
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&raw_bindings);
        let layout = unsafe { self.device.create_descriptor_set_layout(&info, None) }
            .map_err(|e| map_device_error(e, BackendError::DescriptorFailed))?;
        let id = self.next();
        self.set_layouts.insert(id, layout);
        Ok(DescriptorSetLayoutHandle(id))
    }

    fn destroy_descriptor_set_layout(&mut self, layout: DescriptorSetLayoutHandle) {
        if let Some(raw) = self.set_layouts.remove(&layout.0) {
            unsafe { self.device.destroy_descriptor_set_layout(raw, None) };
        }
    }

    fn create_descriptor_pool(
        &mut self,
        sizes: &[DescriptorPoolSize],
        max_sets: u32,
    ) -> BackendResult<DescriptorPoolHandle> {
        let raw_sizes: Vec<vk::DescriptorPoolSize> = sizes
            .iter()
            .map(|s| vk::DescriptorPoolSize {
                ty: descriptor_type_to_vk(s.ty),
                descriptor_count: s.count,
            })
            .collect();
        let info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(&raw_sizes);
        let pool = unsafe { self.device.create_descriptor_pool(&info, None) }
            .map_err(|e| map_device_error(e, BackendError::DescriptorFailed))?;
        let id = self.next();
        self.descriptor_pools.insert(id, pool);
        Ok(DescriptorPoolHandle(id))
    }

    fn reset_descriptor_pool(&mut self, pool: DescriptorPoolHandle) -> BackendResult<()> {
        let raw = lookup(&self.descriptor_pools, pool.0, "descriptor pool")?;
        unsafe {
            self.device
                .reset_descriptor_pool(raw, vk::DescriptorPoolResetFlags::empty())
        }
        .map_err(|e| map_device_error(e, BackendError::DescriptorFailed))?;
        self.descriptor_sets.retain(|_, (_, owner)| *owner != pool.0);
        Ok(())
    }

    fn destroy_descriptor_pool(&mut self, pool: DescriptorPoolHandle) {
        if let Some(raw) = self.descriptor_pools.remove(&pool.0) {
            unsafe { self.device.destroy_descriptor_pool(raw, None) };
            self.descriptor_sets.retain(|_, (_, owner)| *owner != pool.0);
        }
    }

    fn allocate_descriptor_set(
        &mut self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
    ) -> BackendResult<DescriptorSetHandle> {
        let raw_pool = lookup(&self.descriptor_pools, pool.0, "descriptor pool")?;
        let layouts = [lookup(&self.set_layouts, layout.0, "descriptor set layout")?];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(raw_pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&info) }
            .map_err(|e| map_device_error(e, BackendError::DescriptorFailed))?;
        let set = sets.into_iter().next().ok_or_else(|| {
            BackendError::DescriptorFailed("driver returned no descriptor set".into())
        })?;
        let id = self.next();
        self.descriptor_sets.insert(id, (set, pool.0));
        Ok(DescriptorSetHandle(id))
    }

    fn update_descriptor_set(
        &mut self,
        set: DescriptorSetHandle,
        writes: &[DescriptorWrite],
    ) -> BackendResult<()> {
        let (raw_set, _) = lookup(&self.descriptor_sets, set.0, "descriptor set")?;

        enum Info {
            Buffer(vk::DescriptorBufferInfo),
            Image(vk::DescriptorImageInfo),
        }
        let mut infos = Vec::with_capacity(writes.len());
        for write in writes {
            let info = match write.resource {
                DescriptorResource::Buffer {
                    buffer,
                    offset,
                    range,
                } => Info::Buffer(vk::DescriptorBufferInfo {
                    buffer: self
                        .buffers
                        .get(&buffer.0)
                        .map(|b| b.buffer)
                        .ok_or_else(|| {
                            BackendError::ResourceNotFound(format!("buffer {}", buffer.0))
                        })?,
                    offset,
                    range,
                }),
                DescriptorResource::Image {
                    view,
                    sampler,
                    layout,
                } => Info::Image(vk::DescriptorImageInfo {
                    sampler: match sampler {
                        Some(sampler) => lookup(&self.samplers, sampler.0, "sampler")?,
                        None => vk::Sampler::null(),
                    },
                    image_view: lookup(&self.views, view.0, "image view")?,
                    image_layout: layout_to_vk(layout),
                }),
            };
            infos.push(info);
        }

        let raw_writes: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .zip(&infos)
            .map(|(write, info)| {
                let raw = vk::WriteDescriptorSet::default()
                    .dst_set(raw_set)
                    .dst_binding(write.binding)
                    .descriptor_type(descriptor_type_to_vk(write.ty));
                match info {
                    Info::Buffer(buffer) => raw.buffer_info(std::slice::from_ref(buffer)),
                    Info::Image(image) => raw.image_info(std::slice::from_ref(image)),
                }
            })
            .collect();

        unsafe { self.device.update_descriptor_sets(&raw_writes, &[]) };
        Ok(())
    }

    fn create_pipeline_layout(
        &mut self,
        set_layouts: &[DescriptorSetLayoutHandle],
        push_constants: &[PushConstantRange],
    ) -> BackendResult<PipelineLayoutHandle> {
        let layouts = set_layouts
            .iter()
            .map(|l| lookup(&self.set_layouts, l.0, "descriptor set layout"))
            .collect::<BackendResult<Vec<_>>>()?;
        let ranges: Vec<vk::PushConstantRange> = push_constants
            .iter()
            .map(|r| vk::PushConstantRange {
                stage_flags: shader_stages_to_vk(r.stages),
                offset: r.offset,
                size: r.size,
            })
            .collect();
        let info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&layouts)
            .push_constant_ranges(&ranges);
        let layout = unsafe { self.device.create_pipeline_layout(&info, None) }
            .map_err(|e| map_device_error(e, BackendError::PipelineCreationFailed))?;
        let id = self.next();
        self.pipeline_layouts.insert(id, layout);
        Ok(PipelineLayoutHandle(id))
    }

    fn destroy_pipeline_layout(&mut self, layout: PipelineLayoutHandle) {
        if let Some(raw) = self.pipeline_layouts.remove(&layout.0) {
            unsafe { self.device.destroy_pipeline_layout(raw, None) };
        }
    }

    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDescriptor,
    ) -> BackendResult<PipelineHandle> {
        let vertex = lookup(&self.shader_modules, desc.vertex_module.0, "shader module")?;
        let fragment = lookup(&self.shader_modules, desc.fragment_module.0, "shader module")?;
        let layout = lookup(&self.pipeline_layouts, desc.layout.0, "pipeline layout")?;
        let render_pass = lookup(&self.render_passes, desc.render_pass.0, "render pass")?;
        let entry = CString::new(desc.entry_point)
            .map_err(|e| BackendError::PipelineCreationFailed(e.to_string()))?;

        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex)
                .name(&entry),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment)
                .name(&entry),
        ];

        let (bindings, attributes) = match &desc.vertex_layout {
            Some(layout) => (
                vec![vk::VertexInputBindingDescription {
                    binding: 0,
                    stride: layout.stride,
                    input_rate: vk::VertexInputRate::VERTEX,
                }],
                layout
                    .attributes
                    .iter()
                    .map(|a| vk::VertexInputAttributeDescription {
                        location: a.location,
                        binding: 0,
                        format: vertex_format_to_vk(a.format),
                        offset: a.offset,
                    })
                    .collect::<Vec<_>>(),
            ),
            None => (Vec::new(), Vec::new()),
        };
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);

        let viewports = [vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: desc.extent.width as f32,
            height: desc.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }];
        let scissors = [vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: desc.extent.width,
                height: desc.extent.height,
            },
        }];
        let viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewports(&viewports)
            .scissors(&scissors);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(cull_mode_to_vk(desc.cull_mode))
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = match desc.depth_compare {
            Some(compare) => vk::PipelineDepthStencilStateCreateInfo::default()
                .depth_test_enable(true)
                .depth_write_enable(desc.depth_write)
                .depth_compare_op(compare_function_to_vk(compare)),
            None => vk::PipelineDepthStencilStateCreateInfo::default(),
        };

        let blend_attachment = if desc.blend {
            vk::PipelineColorBlendAttachmentState::default()
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .alpha_blend_op(vk::BlendOp::ADD)
                .color_write_mask(vk::ColorComponentFlags::RGBA)
        } else {
            vk::PipelineColorBlendAttachmentState::default()
                .color_write_mask(vk::ColorComponentFlags::RGBA)
        };
        let blend_attachments = vec![blend_attachment; desc.color_attachment_count as usize];
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(desc.subpass);

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        }
        .map_err(|(_, e)| {
            BackendError::PipelineCreationFailed(format!("{}: {:?}", desc.label, e))
        })?;
        let pipeline = pipelines.into_iter().next().ok_or_else(|| {
            BackendError::PipelineCreationFailed(format!("{}: no pipeline returned", desc.label))
        })?;

        let id = self.next();
        self.pipelines.insert(id, pipeline);
        Ok(PipelineHandle(id))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        if let Some(raw) = self.pipelines.remove(&pipeline.0) {
            unsafe { self.device.destroy_pipeline(raw, None) };
        }
    }

    fn cmd_begin_render_pass(&mut self, cmd: CommandBufferHandle, begin: &RenderPassBegin) {
        let Some(buffer) = self.command_buffer(cmd) else {
            return;
        };
        let (Some(render_pass), Some(framebuffer)) = (
            self.render_passes.get(&begin.render_pass.0),
            self.framebuffers.get(&begin.framebuffer.0),
        ) else {
            log::error!("Begin of unknown render pass or framebuffer");
            return;
        };
        let clear_values: Vec<vk::ClearValue> = begin
            .clear_values
            .iter()
            .map(|v| clear_value_to_vk(*v))
            .collect();
        let info = vk::RenderPassBeginInfo::default()
            .render_pass(*render_pass)
            .framebuffer(*framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: begin.extent.width,
                    height: begin.extent.height,
                },
            })
            .clear_values(&clear_values);
        unsafe {
            self.device
                .cmd_begin_render_pass(buffer, &info, vk::SubpassContents::INLINE)
        };
    }

    fn cmd_next_subpass(&mut self, cmd: CommandBufferHandle) {
        if let Some(buffer) = self.command_buffer(cmd) {
            unsafe { self.device.cmd_next_subpass(buffer, vk::SubpassContents::INLINE) };
        }
    }

    fn cmd_end_render_pass(&mut self, cmd: CommandBufferHandle) {
        if let Some(buffer) = self.command_buffer(cmd) {
            unsafe { self.device.cmd_end_render_pass(buffer) };
        }
    }

    fn cmd_bind_pipeline(&mut self, cmd: CommandBufferHandle, pipeline: PipelineHandle) {
        let Some(buffer) = self.command_buffer(cmd) else {
            return;
        };
        if let Some(raw) = self.pipelines.get(&pipeline.0) {
            unsafe {
                self.device
                    .cmd_bind_pipeline(buffer, vk::PipelineBindPoint::GRAPHICS, *raw)
            };
        }
    }

    fn cmd_bind_descriptor_sets(
        &mut self,
        cmd: CommandBufferHandle,
        layout: PipelineLayoutHandle,
        first_set: u32,
        sets: &[DescriptorSetHandle],
    ) {
        let Some(buffer) = self.command_buffer(cmd) else {
            return;
        };
        let Some(raw_layout) = self.pipeline_layouts.get(&layout.0) else {
            log::error!("Bind with unknown pipeline layout {}", layout.0);
            return;
        };
        let raw_sets: Vec<vk::DescriptorSet> = sets
            .iter()
            .filter_map(|s| self.descriptor_sets.get(&s.0).map(|(set, _)| *set))
            .collect();
        if raw_sets.len() != sets.len() {
            log::error!("Bind of unknown descriptor sets {:?}", sets);
            return;
        }
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                buffer,
                vk::PipelineBindPoint::GRAPHICS,
                *raw_layout,
                first_set,
                &raw_sets,
                &[],
            )
        };
    }

    fn cmd_push_constants(
        &mut self,
        cmd: CommandBufferHandle,
        layout: PipelineLayoutHandle,
        stages: ShaderStages,
        offset: u32,
        data: &[u8],
    ) {
        let Some(buffer) = self.command_buffer(cmd) else {
            return;
        };
        if let Some(raw_layout) = self.pipeline_layouts.get(&layout.0) {
            unsafe {
                self.device.cmd_push_constants(
                    buffer,
                    *raw_layout,
                    shader_stages_to_vk(stages),
                    offset,
                    data,
                )
            };
        }
    }

    fn cmd_bind_vertex_buffer(&mut self, cmd: CommandBufferHandle, vertex_buffer: BufferHandle) {
        let Some(buffer) = self.command_buffer(cmd) else {
            return;
        };
        if let Some(entry) = self.buffers.get(&vertex_buffer.0) {
            unsafe {
                self.device
                    .cmd_bind_vertex_buffers(buffer, 0, &[entry.buffer], &[0])
            };
        }
    }

    fn cmd_draw(&mut self, cmd: CommandBufferHandle, vertex_count: u32, instance_count: u32) {
        if let Some(buffer) = self.command_buffer(cmd) {
            unsafe {
                self.device
                    .cmd_draw(buffer, vertex_count, instance_count, 0, 0)
            };
        }
    }

    fn cmd_copy_buffer(
        &mut self,
        cmd: CommandBufferHandle,
        src: BufferHandle,
        dst: BufferHandle,
        size: u64,
    ) {
        let Some(buffer) = self.command_buffer(cmd) else {
            return;
        };
        let (Some(src), Some(dst)) = (self.buffers.get(&src.0), self.buffers.get(&dst.0)) else {
            log::error!("Copy between unknown buffers");
            return;
        };
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe {
            self.device
                .cmd_copy_buffer(buffer, src.buffer, dst.buffer, &[region])
        };
    }

    fn cmd_copy_buffer_to_image(
        &mut self,
        cmd: CommandBufferHandle,
        src: BufferHandle,
        dst: ImageHandle,
        region: &BufferImageCopy,
    ) {
        let Some(buffer) = self.command_buffer(cmd) else {
            return;
        };
        let (Some(src), Some(dst)) = (self.buffers.get(&src.0), self.images.get(&dst.0)) else {
            log::error!("Copy between unknown buffer and image");
            return;
        };
        let copy = buffer_image_copy(region, dst.format);
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                buffer,
                src.buffer,
                dst.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[copy],
            )
        };
    }

    fn cmd_copy_image_to_buffer(
        &mut self,
        cmd: CommandBufferHandle,
        src: ImageHandle,
        dst: BufferHandle,
        region: &BufferImageCopy,
    ) {
        let Some(buffer) = self.command_buffer(cmd) else {
            return;
        };
        let (Some(src), Some(dst)) = (self.images.get(&src.0), self.buffers.get(&dst.0)) else {
            log::error!("Copy between unknown image and buffer");
            return;
        };
        let copy = buffer_image_copy(region, src.format);
        unsafe {
            self.device.cmd_copy_image_to_buffer(
                buffer,
                src.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst.buffer,
                &[copy],
            )
        };
    }

    fn cmd_image_barrier(&mut self, cmd: CommandBufferHandle, barrier: &ImageBarrier) {
        let Some(buffer) = self.command_buffer(cmd) else {
            return;
        };
        let Some(image) = self.images.get(&barrier.image.0) else {
            log::error!("Barrier on unknown image {}", barrier.image.0);
            return;
        };
        let raw = vk::ImageMemoryBarrier::default()
            .old_layout(layout_to_vk(barrier.old_layout))
            .new_layout(layout_to_vk(barrier.new_layout))
            .src_access_mask(access_to_vk(barrier.src_access))
            .dst_access_mask(access_to_vk(barrier.dst_access))
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect_for(image.format),
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: barrier.base_layer,
                layer_count: barrier.layer_count,
            });
        unsafe {
            self.device.cmd_pipeline_barrier(
                buffer,
                stages_to_vk(barrier.src_stages),
                stages_to_vk(barrier.dst_stages),
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[raw],
            )
        };
    }
}

fn buffer_image_copy(region: &BufferImageCopy, format: Format) -> vk::BufferImageCopy {
    vk::BufferImageCopy {
        buffer_offset: region.buffer_offset,
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: vk::ImageSubresourceLayers {
            aspect_mask: view_aspect_for(format),
            mip_level: 0,
            base_array_layer: region.layer,
            layer_count: 1,
        },
        image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
        image_extent: vk::Extent3D {
            width: region.extent.width,
            height: region.extent.height,
            depth: 1,
        },
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::error!("Device wait idle failed during teardown: {}", e);
            }

            let leaked = self.pipelines.len()
                + self.framebuffers.len()
                + self.render_passes.len()
                + self.buffers.len()
                + self.views.len();
            if leaked > 0 {
                log::warn!("Vulkan device dropped with {} live objects", leaked);
            }

            for (_, pipeline) in self.pipelines.drain() {
                self.device.destroy_pipeline(pipeline, None);
            }
            for (_, layout) in self.pipeline_layouts.drain() {
                self.device.destroy_pipeline_layout(layout, None);
            }
            self.descriptor_sets.clear();
            for (_, pool) in self.descriptor_pools.drain() {
                self.device.destroy_descriptor_pool(pool, None);
            }
            for (_, layout) in self.set_layouts.drain() {
                self.device.destroy_descriptor_set_layout(layout, None);
            }
            for (_, framebuffer) in self.framebuffers.drain() {
                self.device.destroy_framebuffer(framebuffer, None);
            }
            for (_, render_pass) in self.render_passes.drain() {
                self.device.destroy_render_pass(render_pass, None);
            }
            for (_, module) in self.shader_modules.drain() {
                self.device.destroy_shader_module(module, None);
            }
            for (_, sampler) in self.samplers.drain() {
                self.device.destroy_sampler(sampler, None);
            }
            for (_, view) in self.views.drain() {
                self.device.destroy_image_view(view, None);
            }

            if let Some(allocator) = &self.allocator {
                let mut allocator = allocator.lock();
                for (_, buffer) in self.buffers.drain() {
                    self.device.destroy_buffer(buffer.buffer, None);
                    let _ = allocator.free(buffer.allocation);
                }
                for (_, image) in self.images.drain() {
                    if let Some(allocation) = image.allocation {
                        self.device.destroy_image(image.image, None);
                        let _ = allocator.free(allocation);
                    }
                }
            }
            // The allocator must go before the device.
            drop(self.allocator.take());

            for (_, entry) in self.swapchains.drain() {
                self.swapchain_fn.destroy_swapchain(entry.swapchain, None);
            }
            self.command_buffers.clear();
            for (_, pool) in self.command_pools.drain() {
                self.device.destroy_command_pool(pool, None);
            }
            for (_, semaphore) in self.semaphores.drain() {
                self.device.destroy_semaphore(semaphore, None);
            }
            for (_, fence) in self.fences.drain() {
                self.device.destroy_fence(fence, None);
            }

            self.device.destroy_device(None);
        }
        if let Some(context) = self.context.take() {
            context.destroy();
        }
    }
}
