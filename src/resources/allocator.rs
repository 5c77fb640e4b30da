//! GPU-backed images and buffers with named lifetimes
//!
//! The allocator keeps a ledger of every live resource it created so it can
//! report statistics, but it does no reference counting: destroying a
//! resource that an in-flight command buffer still references is the
//! caller's bug.
//!
//! Uploads use the staging pattern and block until the copy has executed.
//! That serializes uploads (a throughput limit, not a correctness one).

use crate::backend::traits::*;
use crate::backend::types::*;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

/// Request for a new image
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub name: String,
    pub usage: ImageUsage,
    pub format: Format,
    pub extent: Extent2D,
    pub array_layers: u32,
    /// Also create one 2D view per layer
    pub layer_views: bool,
}

impl ImageRequest {
    pub fn new(name: &str, format: Format, extent: Extent2D, usage: ImageUsage) -> Self {
        Self {
            name: name.to_string(),
            usage,
            format,
            extent,
            array_layers: 1,
            layer_views: false,
        }
    }

    pub fn with_layers(mut self, array_layers: u32, layer_views: bool) -> Self {
        self.array_layers = array_layers;
        self.layer_views = layer_views;
        self
    }
}

/// An image together with its default view and optional per-layer views
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuImage {
    pub name: String,
    pub image: ImageHandle,
    pub view: ImageViewHandle,
    pub layer_views: Vec<ImageViewHandle>,
    pub format: Format,
    pub extent: Extent2D,
    pub array_layers: u32,
    pub usage: ImageUsage,
}

impl GpuImage {
    /// Bytes of one tightly packed layer
    pub fn layer_size(&self) -> u64 {
        self.extent.texel_count() * self.format.bytes_per_pixel().unwrap_or(0) as u64
    }

    pub fn size(&self) -> u64 {
        self.layer_size() * self.array_layers as u64
    }

    /// View of a single layer, falling back to the default view for 1-layer images.
    pub fn layer_view(&self, layer: u32) -> Option<ImageViewHandle> {
        if self.array_layers == 1 && layer == 0 {
            return Some(self.view);
        }
        self.layer_views.get(layer as usize).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuBuffer {
    pub name: String,
    pub buffer: BufferHandle,
    pub size: u64,
    pub usage: BufferUsage,
    pub location: MemoryLocation,
}

/// Borrowed reference to either kind of resource
#[derive(Debug, Clone, Copy)]
pub enum GpuResource<'a> {
    Image(&'a GpuImage),
    Buffer(&'a GpuBuffer),
}

impl<'a> From<&'a GpuImage> for GpuResource<'a> {
    fn from(image: &'a GpuImage) -> Self {
        GpuResource::Image(image)
    }
}

impl<'a> From<&'a GpuBuffer> for GpuResource<'a> {
    fn from(buffer: &'a GpuBuffer) -> Self {
        GpuResource::Buffer(buffer)
    }
}

/// Owned resource handed back for destruction
#[derive(Debug)]
pub enum OwnedResource {
    Image(GpuImage),
    Buffer(GpuBuffer),
}

impl From<GpuImage> for OwnedResource {
    fn from(image: GpuImage) -> Self {
        OwnedResource::Image(image)
    }
}

impl From<GpuBuffer> for OwnedResource {
    fn from(buffer: GpuBuffer) -> Self {
        OwnedResource::Buffer(buffer)
    }
}

/// Image layer to read back, with the layout it currently sits in
#[derive(Debug, Clone, Copy)]
pub struct ImageReadback {
    pub image: ImageHandle,
    pub format: Format,
    pub extent: Extent2D,
    pub layer: u32,
    pub layout: ImageLayout,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AllocatorStats {
    pub live_images: usize,
    pub live_buffers: usize,
    pub live_image_bytes: u64,
    pub live_buffer_bytes: u64,
    pub peak_bytes: u64,
    pub uploads: u64,
    pub uploaded_bytes: u64,
    pub readbacks: u64,
}

#[derive(Debug, Clone, Serialize)]
struct LedgerEntry {
    name: String,
    kind: &'static str,
    bytes: u64,
}

#[derive(Serialize)]
struct StatsDump<'a> {
    backend: &'a str,
    stats: AllocatorStats,
    resources: Vec<LedgerEntry>,
    device_memory: MemoryReport,
}

/// Creates and destroys images and buffers, and moves bytes in and out of
/// device-local memory through staging buffers.
pub struct ResourceAllocator {
    transfer_pool: CommandPoolHandle,
    transfer_fence: FenceHandle,
    images: HashMap<ImageHandle, LedgerEntry>,
    buffers: HashMap<BufferHandle, LedgerEntry>,
    stats: AllocatorStats,
}

impl ResourceAllocator {
    pub fn new(device: &mut dyn GpuDevice) -> BackendResult<Self> {
        let transfer_pool = device.create_command_pool(true)?;
        let transfer_fence = match device.create_fence(false) {
            Ok(fence) => fence,
            Err(e) => {
                device.destroy_command_pool(transfer_pool);
                return Err(e);
            }
        };

        Ok(Self {
            transfer_pool,
            transfer_fence,
            images: HashMap::new(),
            buffers: HashMap::new(),
            stats: AllocatorStats::default(),
        })
    }

    /// Allocate a device-local image and its views.
    ///
    /// Usage must name every role the image will play: an attachment later
    /// read as an input attachment needs both `COLOR_ATTACHMENT` and
    /// `INPUT_ATTACHMENT`.
    pub fn create_image(
        &mut self,
        device: &mut dyn GpuDevice,
        request: &ImageRequest,
    ) -> BackendResult<GpuImage> {
        if request.extent.is_zero_area() || request.array_layers == 0 {
            return Err(BackendError::ImageCreationFailed(format!(
                "{}: empty extent {:?} x {} layers",
                request.name, request.extent, request.array_layers
            )));
        }
        if request.format.bytes_per_pixel().is_none() {
            return Err(BackendError::ImageCreationFailed(format!(
                "{}: unsupported format {:?}",
                request.name, request.format
            )));
        }

        let image = device.create_image(&ImageDescriptor {
            label: request.name.clone(),
            format: request.format,
            extent: request.extent,
            array_layers: request.array_layers,
            usage: request.usage,
        })?;

        let mut views = Vec::new();
        let result = (|| -> BackendResult<()> {
            views.push(device.create_image_view(
                image,
                &ImageViewDescriptor::whole(request.array_layers),
            )?);
            if request.layer_views {
                for layer in 0..request.array_layers {
                    views.push(
                        device.create_image_view(image, &ImageViewDescriptor::single_layer(layer))?,
                    );
                }
            }
            Ok(())
        })();

        if let Err(e) = result {
            for view in views {
                device.destroy_image_view(view);
            }
            device.destroy_image(image);
            return Err(e);
        }

        let view = views.remove(0);
        let gpu_image = GpuImage {
            name: request.name.clone(),
            image,
            view,
            layer_views: views,
            format: request.format,
            extent: request.extent,
            array_layers: request.array_layers,
            usage: request.usage,
        };

        log::debug!(
            "Allocated image '{}' {:?} {}x{}x{} ({} bytes)",
            gpu_image.name,
            gpu_image.format,
            gpu_image.extent.width,
            gpu_image.extent.height,
            gpu_image.array_layers,
            gpu_image.size()
        );

        self.images.insert(
            image,
            LedgerEntry {
                name: gpu_image.name.clone(),
                kind: "image",
                bytes: gpu_image.size(),
            },
        );
        self.stats.live_images += 1;
        self.stats.live_image_bytes += gpu_image.size();
        self.track_peak();

        Ok(gpu_image)
    }

    pub fn create_buffer(
        &mut self,
        device: &mut dyn GpuDevice,
        name: &str,
        size: u64,
        usage: BufferUsage,
        location: MemoryLocation,
    ) -> BackendResult<GpuBuffer> {
        if size == 0 {
            return Err(BackendError::BufferCreationFailed(format!(
                "{}: zero-sized buffer",
                name
            )));
        }

        let buffer = device.create_buffer(&BufferDescriptor {
            label: name.to_string(),
            size,
            usage,
            location,
        })?;

        log::debug!(
            "Allocated buffer '{}' {} bytes {:?}",
            name,
            size,
            location
        );

        self.buffers.insert(
            buffer,
            LedgerEntry {
                name: name.to_string(),
                kind: "buffer",
                bytes: size,
            },
        );
        self.stats.live_buffers += 1;
        self.stats.live_buffer_bytes += size;
        self.track_peak();

        Ok(GpuBuffer {
            name: name.to_string(),
            buffer,
            size,
            usage,
            location,
        })
    }

    /// Copy `bytes` into a resource through a temporary staging buffer and
    /// wait for the copy to finish.
    ///
    /// Buffers receive the bytes at offset zero. Images receive whole layers
    /// starting at layer zero and are left in `ShaderReadOnly` layout.
    pub fn upload<'a>(
        &mut self,
        device: &mut dyn GpuDevice,
        dst: impl Into<GpuResource<'a>>,
        bytes: &[u8],
    ) -> BackendResult<()> {
        let dst = dst.into();
        if bytes.is_empty() {
            log::trace!("Skipping zero-length upload");
            return Ok(());
        }

        match dst {
            GpuResource::Buffer(buffer) => {
                if bytes.len() as u64 > buffer.size {
                    return Err(BackendError::Validation(format!(
                        "upload of {} bytes into '{}' ({} bytes)",
                        bytes.len(),
                        buffer.name,
                        buffer.size
                    )));
                }
                if !buffer.usage.contains(BufferUsage::TRANSFER_DST) {
                    return Err(BackendError::Validation(format!(
                        "'{}' was not created with TRANSFER_DST",
                        buffer.name
                    )));
                }
            }
            GpuResource::Image(image) => {
                let layer_size = image.layer_size();
                if layer_size == 0
                    || bytes.len() as u64 % layer_size != 0
                    || bytes.len() as u64 > image.size()
                {
                    return Err(BackendError::Validation(format!(
                        "upload of {} bytes into '{}' (layers of {} bytes, {} layers)",
                        bytes.len(),
                        image.name,
                        layer_size,
                        image.array_layers
                    )));
                }
            }
        }

        let staging = self.create_staging(
            device,
            bytes.len() as u64,
            BufferUsage::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;
        let result = device
            .write_buffer(staging, 0, bytes)
            .map_err(TransferError::Settled)
            .and_then(|_| {
                self.one_shot(device, |device, cmd| match dst {
                    GpuResource::Buffer(buffer) => {
                        device.cmd_copy_buffer(cmd, staging, buffer.buffer, bytes.len() as u64);
                    }
                    GpuResource::Image(image) => {
                        let layers = (bytes.len() as u64 / image.layer_size()) as u32;
                        device.cmd_image_barrier(
                            cmd,
                            &ImageBarrier {
                                image: image.image,
                                old_layout: ImageLayout::Undefined,
                                new_layout: ImageLayout::TransferDst,
                                base_layer: 0,
                                layer_count: layers,
                                src_stages: PipelineStages::TOP_OF_PIPE,
                                dst_stages: PipelineStages::TRANSFER,
                                src_access: AccessFlags::empty(),
                                dst_access: AccessFlags::TRANSFER_WRITE,
                            },
                        );
                        for layer in 0..layers {
                            device.cmd_copy_buffer_to_image(
                                cmd,
                                staging,
                                image.image,
                                &BufferImageCopy {
                                    buffer_offset: layer as u64 * image.layer_size(),
                                    layer,
                                    extent: image.extent,
                                },
                            );
                        }
                        device.cmd_image_barrier(
                            cmd,
                            &ImageBarrier {
                                image: image.image,
                                old_layout: ImageLayout::TransferDst,
                                new_layout: ImageLayout::ShaderReadOnly,
                                base_layer: 0,
                                layer_count: layers,
                                src_stages: PipelineStages::TRANSFER,
                                dst_stages: PipelineStages::FRAGMENT_SHADER,
                                src_access: AccessFlags::TRANSFER_WRITE,
                                dst_access: AccessFlags::SHADER_READ,
                            },
                        );
                    }
                })
            });
        release_staging(device, staging, result)?;

        self.stats.uploads += 1;
        self.stats.uploaded_bytes += bytes.len() as u64;
        Ok(())
    }

    /// Copy the first `len` bytes of a buffer back to the host.
    pub fn read_back(
        &mut self,
        device: &mut dyn GpuDevice,
        src: &GpuBuffer,
        len: u64,
    ) -> BackendResult<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        if len > src.size {
            return Err(BackendError::Validation(format!(
                "read back of {} bytes from '{}' ({} bytes)",
                len, src.name, src.size
            )));
        }

        let staging = self.create_staging(
            device,
            len,
            BufferUsage::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
        )?;
        let result = self
            .one_shot(device, |device, cmd| {
                device.cmd_copy_buffer(cmd, src.buffer, staging, len);
            })
            .and_then(|_| {
                device
                    .read_buffer(staging, 0, len)
                    .map_err(TransferError::Settled)
            });

        self.stats.readbacks += 1;
        release_staging(device, staging, result)
    }

    /// Copy one image layer back to the host, returning it to its layout afterwards.
    pub fn read_back_image(
        &mut self,
        device: &mut dyn GpuDevice,
        src: &ImageReadback,
    ) -> BackendResult<Vec<u8>> {
        let bpp = src.format.bytes_per_pixel().ok_or_else(|| {
            BackendError::Validation(format!("cannot read back format {:?}", src.format))
        })?;
        let len = src.extent.texel_count() * bpp as u64;

        let staging = self.create_staging(
            device,
            len,
            BufferUsage::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
        )?;
        let result = self
            .one_shot(device, |device, cmd| {
                device.cmd_image_barrier(
                    cmd,
                    &ImageBarrier {
                        image: src.image,
                        old_layout: src.layout,
                        new_layout: ImageLayout::TransferSrc,
                        base_layer: src.layer,
                        layer_count: 1,
                        src_stages: PipelineStages::COLOR_ATTACHMENT_OUTPUT,
                        dst_stages: PipelineStages::TRANSFER,
                        src_access: AccessFlags::COLOR_ATTACHMENT_WRITE,
                        dst_access: AccessFlags::TRANSFER_READ,
                    },
                );
                device.cmd_copy_image_to_buffer(
                    cmd,
                    src.image,
                    staging,
                    &BufferImageCopy {
                        buffer_offset: 0,
                        layer: src.layer,
                        extent: src.extent,
                    },
                );
                device.cmd_image_barrier(
                    cmd,
                    &ImageBarrier {
                        image: src.image,
                        old_layout: ImageLayout::TransferSrc,
                        new_layout: src.layout,
                        base_layer: src.layer,
                        layer_count: 1,
                        src_stages: PipelineStages::TRANSFER,
                        dst_stages: PipelineStages::BOTTOM_OF_PIPE,
                        src_access: AccessFlags::TRANSFER_READ,
                        dst_access: AccessFlags::empty(),
                    },
                );
            })
            .and_then(|_| {
                device
                    .read_buffer(staging, 0, len)
                    .map_err(TransferError::Settled)
            });

        self.stats.readbacks += 1;
        release_staging(device, staging, result)
    }

    /// Release a resource's memory and handles.
    pub fn destroy(&mut self, device: &mut dyn GpuDevice, resource: impl Into<OwnedResource>) {
        match resource.into() {
            OwnedResource::Image(image) => {
                for view in image.layer_views {
                    device.destroy_image_view(view);
                }
                device.destroy_image_view(image.view);
                device.destroy_image(image.image);
                if let Some(entry) = self.images.remove(&image.image) {
                    self.stats.live_images -= 1;
                    self.stats.live_image_bytes -= entry.bytes;
                }
            }
            OwnedResource::Buffer(buffer) => {
                device.destroy_buffer(buffer.buffer);
                if let Some(entry) = self.buffers.remove(&buffer.buffer) {
                    self.stats.live_buffers -= 1;
                    self.stats.live_buffer_bytes -= entry.bytes;
                }
            }
        }
    }

    pub fn stats(&self) -> AllocatorStats {
        self.stats
    }

    /// Write allocator statistics and the device memory report as JSON.
    pub fn dump_stats_json(&self, device: &dyn GpuDevice, path: &Path) -> BackendResult<()> {
        let mut resources: Vec<LedgerEntry> = self
            .images
            .values()
            .chain(self.buffers.values())
            .cloned()
            .collect();
        resources.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.name.cmp(&b.name)));

        let dump = StatsDump {
            backend: device.name(),
            stats: self.stats,
            resources,
            device_memory: device.memory_report(),
        };
        let json = serde_json::to_string_pretty(&dump)
            .map_err(|e| BackendError::DiagnosticsFailed(e.to_string()))?;
        std::fs::write(path, json)
            .map_err(|e| BackendError::DiagnosticsFailed(format!("{}: {}", path.display(), e)))?;

        log::info!("Allocator statistics written to {}", path.display());
        Ok(())
    }

    /// Release the transfer objects. Resources still alive are reported, not freed.
    pub fn shutdown(&mut self, device: &mut dyn GpuDevice) {
        if !self.images.is_empty() || !self.buffers.is_empty() {
            log::warn!(
                "Allocator shut down with {} images and {} buffers still alive",
                self.images.len(),
                self.buffers.len()
            );
        }
        device.destroy_fence(self.transfer_fence);
        device.destroy_command_pool(self.transfer_pool);
    }

    fn create_staging(
        &mut self,
        device: &mut dyn GpuDevice,
        size: u64,
        usage: BufferUsage,
        location: MemoryLocation,
    ) -> BackendResult<BufferHandle> {
        device.create_buffer(&BufferDescriptor {
            label: "staging".into(),
            size,
            usage,
            location,
        })
    }

    /// Record with `f`, submit on the graphics queue, and block until done.
    ///
    /// If the wait fails after a successful submit, the command buffer is
    /// not freed and the error is [`TransferError::InFlight`].
    fn one_shot(
        &mut self,
        device: &mut dyn GpuDevice,
        f: impl FnOnce(&mut dyn GpuDevice, CommandBufferHandle),
    ) -> Result<(), TransferError> {
        let cmd = device
            .allocate_command_buffer(self.transfer_pool)
            .map_err(TransferError::Settled)?;
        let submitted = (|| -> BackendResult<()> {
            device.begin_command_buffer(cmd, true)?;
            f(device, cmd);
            device.end_command_buffer(cmd)?;
            device.submit(&SubmitInfo {
                command_buffer: cmd,
                wait: None,
                signal: None,
                fence: Some(self.transfer_fence),
            })
        })();
        if let Err(e) = submitted {
            device.free_command_buffer(self.transfer_pool, cmd);
            return Err(TransferError::Settled(e));
        }
        if let Err(e) = device.wait_for_fence(self.transfer_fence, None) {
            log::error!("Transfer fence wait failed, leaking command buffer: {}", e);
            return Err(TransferError::InFlight(e));
        }
        let result = device.reset_fence(self.transfer_fence);
        device.free_command_buffer(self.transfer_pool, cmd);
        result.map_err(TransferError::Settled)
    }

    fn track_peak(&mut self) {
        let live = self.stats.live_image_bytes + self.stats.live_buffer_bytes;
        self.stats.peak_bytes = self.stats.peak_bytes.max(live);
    }
}

/// How a one-shot transfer failed
enum TransferError {
    /// The GPU is done with the transfer's resources, or never saw them
    Settled(BackendError),
    /// Submitted work may still access the transfer's resources
    InFlight(BackendError),
}

/// Destroy a staging buffer unless the GPU may still be using it.
fn release_staging<T>(
    device: &mut dyn GpuDevice,
    staging: BufferHandle,
    result: Result<T, TransferError>,
) -> BackendResult<T> {
    match result {
        Ok(value) => {
            device.destroy_buffer(staging);
            Ok(value)
        }
        Err(TransferError::Settled(e)) => {
            device.destroy_buffer(staging);
            Err(e)
        }
        Err(TransferError::InFlight(e)) => {
            log::error!("Leaking staging buffer {:?} of an unfinished transfer", staging);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{HeadlessConfig, HeadlessDevice};
    use crate::backend::headless::DeviceCall;

    fn setup() -> (HeadlessDevice, ResourceAllocator) {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let allocator = ResourceAllocator::new(&mut device).unwrap();
        (device, allocator)
    }

    #[test]
    fn test_create_image_with_layer_views() {
        let (mut device, mut allocator) = setup();
        let image = allocator
            .create_image(
                &mut device,
                &ImageRequest::new(
                    "views",
                    Format::Rgba8Unorm,
                    Extent2D::new(8, 4),
                    ImageUsage::COLOR_ATTACHMENT | ImageUsage::SAMPLED,
                )
                .with_layers(9, true),
            )
            .unwrap();

        assert_eq!(image.layer_views.len(), 9);
        assert_eq!(image.layer_size(), 8 * 4 * 4);
        assert_eq!(allocator.stats().live_images, 1);
        assert_eq!(allocator.stats().live_image_bytes, 9 * 128);

        allocator.destroy(&mut device, image);
        assert_eq!(allocator.stats().live_images, 0);
        assert_eq!(allocator.stats().peak_bytes, 9 * 128);
    }

    #[test]
    fn test_zero_extent_rejected() {
        let (mut device, mut allocator) = setup();
        let result = allocator.create_image(
            &mut device,
            &ImageRequest::new(
                "empty",
                Format::R32Float,
                Extent2D::new(0, 4),
                ImageUsage::SAMPLED,
            ),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_upload_larger_than_buffer_rejected() {
        let (mut device, mut allocator) = setup();
        let buffer = allocator
            .create_buffer(
                &mut device,
                "small",
                4,
                BufferUsage::TRANSFER_DST,
                MemoryLocation::GpuOnly,
            )
            .unwrap();
        let result = allocator.upload(&mut device, &buffer, &[0u8; 8]);
        assert!(matches!(result, Err(BackendError::Validation(_))));
    }

    #[test]
    fn test_unfinished_upload_keeps_staging_alive() {
        let (mut device, mut allocator) = setup();
        let buffer = allocator
            .create_buffer(
                &mut device,
                "target",
                16,
                BufferUsage::TRANSFER_DST,
                MemoryLocation::GpuOnly,
            )
            .unwrap();
        device.set_complete_submissions(false);
        device.fail_next_fence_wait(BackendError::DeviceLost);
        device.clear_call_log();

        let result = allocator.upload(&mut device, &buffer, &[7u8; 16]);
        assert!(matches!(result, Err(BackendError::DeviceLost)));

        let calls = device.call_log();
        let staging = calls
            .iter()
            .find_map(|c| match c {
                DeviceCall::Create { kind: "buffer", id } => Some(*id),
                _ => None,
            })
            .expect("staging buffer created");
        assert!(!calls.contains(&DeviceCall::Destroy {
            kind: "buffer",
            id: staging
        }));
        assert!(!calls
            .iter()
            .any(|c| matches!(c, DeviceCall::Destroy { kind: "command_buffer", .. })));
        assert_eq!(allocator.stats().uploads, 0);
        device.completer().complete_all();
    }

    #[test]
    fn test_failed_recording_releases_staging() {
        let (mut device, mut allocator) = setup();
        // Not a copy source, so recording the copy fails before submit.
        let buffer = allocator
            .create_buffer(
                &mut device,
                "vertex",
                16,
                BufferUsage::VERTEX,
                MemoryLocation::GpuOnly,
            )
            .unwrap();
        device.clear_call_log();
        assert!(allocator.read_back(&mut device, &buffer, 16).is_err());

        let calls = device.call_log();
        let count = |kind: &str, destroy: bool| {
            calls
                .iter()
                .filter(|c| match c {
                    DeviceCall::Create { kind: k, .. } => !destroy && *k == kind,
                    DeviceCall::Destroy { kind: k, .. } => destroy && *k == kind,
                    _ => false,
                })
                .count()
        };
        assert_eq!(count("buffer", false), 1);
        assert_eq!(count("buffer", true), 1);
        assert_eq!(count("command_buffer", true), 1);
    }

    #[test]
    fn test_upload_requires_transfer_dst() {
        let (mut device, mut allocator) = setup();
        let buffer = allocator
            .create_buffer(
                &mut device,
                "vertex",
                16,
                BufferUsage::VERTEX,
                MemoryLocation::GpuOnly,
            )
            .unwrap();
        assert!(allocator.upload(&mut device, &buffer, &[1u8; 16]).is_err());
    }

    #[test]
    fn test_image_upload_round_trip() {
        let (mut device, mut allocator) = setup();
        let image = allocator
            .create_image(
                &mut device,
                &ImageRequest::new(
                    "texture",
                    Format::Rgba8Unorm,
                    Extent2D::new(2, 2),
                    ImageUsage::TRANSFER_DST | ImageUsage::TRANSFER_SRC | ImageUsage::SAMPLED,
                ),
            )
            .unwrap();
        let bytes: Vec<u8> = (0..16).collect();
        allocator.upload(&mut device, &image, &bytes).unwrap();

        let read = allocator
            .read_back_image(
                &mut device,
                &ImageReadback {
                    image: image.image,
                    format: image.format,
                    extent: image.extent,
                    layer: 0,
                    layout: ImageLayout::ShaderReadOnly,
                },
            )
            .unwrap();
        assert_eq!(read, bytes);
    }

    #[test]
    fn test_staging_buffers_are_freed() {
        let (mut device, mut allocator) = setup();
        let buffer = allocator
            .create_buffer(
                &mut device,
                "dst",
                64,
                BufferUsage::TRANSFER_DST | BufferUsage::TRANSFER_SRC,
                MemoryLocation::GpuOnly,
            )
            .unwrap();
        let before = device.live_buffer_count();
        allocator.upload(&mut device, &buffer, &[7u8; 64]).unwrap();
        allocator.read_back(&mut device, &buffer, 64).unwrap();
        assert_eq!(device.live_buffer_count(), before);
        assert_eq!(allocator.stats().uploads, 1);
        assert_eq!(allocator.stats().uploaded_bytes, 64);
    }
}
