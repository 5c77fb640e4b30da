//! Surface negotiation and the swapchain recreate protocol
//!
//! The negotiation rules are plain functions over the platform's reported
//! [`SurfaceSupport`] so they can be checked without a device. The
//! [`SwapchainManager`] owns the live swapchain and drives recreation in a
//! fixed order:
//!
//! ```text
//! wait device idle
//!   -> dependents release framebuffers / extent-sized pipelines and images
//!   -> destroy old image views and swapchain
//!   -> renegotiate against fresh surface support
//!   -> create swapchain + per-image views
//!   -> dependents rebuild against the new SwapchainState
//! ```

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::frame::ImageIndex;

/// Preferred presentation behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresentModePreference {
    /// Mailbox, then immediate, then FIFO.
    #[default]
    LowLatency,
    /// Always FIFO.
    Vsync,
}

/// Pick the sRGB-nonlinear BGRA8/RGBA8 sRGB format if offered, else the first one.
pub fn negotiate_surface_format(formats: &[SurfaceFormat]) -> Option<SurfaceFormat> {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.color_space == ColorSpace::SrgbNonlinear
                && matches!(f.format, Format::Bgra8Srgb | Format::Rgba8Srgb)
        })
        .or_else(|| formats.first().copied())
}

pub fn negotiate_present_mode(
    available: &[PresentMode],
    preference: PresentModePreference,
) -> PresentMode {
    let wanted: &[PresentMode] = match preference {
        PresentModePreference::LowLatency => &[PresentMode::Mailbox, PresentMode::Immediate],
        PresentModePreference::Vsync => &[],
    };

    wanted
        .iter()
        .copied()
        .find(|mode| available.contains(mode))
        .unwrap_or(PresentMode::Fifo)
}

/// Use the surface's current extent when it dictates one, otherwise clamp the
/// window's pixel size into the supported range.
///
/// A surface reporting a maximum below its minimum gets the minimum.
pub fn negotiate_extent(capabilities: &SurfaceCapabilities, window_size: Extent2D) -> Extent2D {
    let (min, max) = (capabilities.min_image_extent, capabilities.max_image_extent);
    match capabilities.current_extent {
        Some(extent) => extent,
        None => Extent2D {
            width: window_size.width.clamp(min.width, max.width.max(min.width)),
            height: window_size.height.clamp(min.height, max.height.max(min.height)),
        },
    }
}

/// One more than the minimum unless a count was requested, bounded by the maximum.
pub fn negotiate_image_count(capabilities: &SurfaceCapabilities, desired: Option<u32>) -> u32 {
    let count = desired
        .unwrap_or(capabilities.min_image_count + 1)
        .max(capabilities.min_image_count);
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// Immutable description of a created swapchain.
///
/// A new value is produced by every creation; nothing mutates it in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapchainState {
    pub handle: SwapchainHandle,
    pub surface_format: SurfaceFormat,
    pub present_mode: PresentMode,
    pub extent: Extent2D,
    pub images: Vec<ImageHandle>,
    pub views: Vec<ImageViewHandle>,
    pub usage: ImageUsage,
}

impl SwapchainState {
    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    pub fn format(&self) -> Format {
        self.surface_format.format
    }

    pub fn view(&self, index: ImageIndex) -> ImageViewHandle {
        self.views[index.0 as usize]
    }

    pub fn image(&self, index: ImageIndex) -> ImageHandle {
        self.images[index.0 as usize]
    }

    /// Negotiated fields, without the per-creation handles.
    pub fn negotiated(&self) -> (SurfaceFormat, PresentMode, Extent2D, u32) {
        (
            self.surface_format,
            self.present_mode,
            self.extent,
            self.image_count(),
        )
    }
}

/// Objects whose lifetime is tied to the swapchain images or extent.
pub trait SwapchainDependent {
    /// Destroy everything referencing the old swapchain. The device is idle.
    fn release_swapchain_resources(&mut self, device: &mut dyn GpuDevice);

    /// Recreate framebuffers and extent-dependent state for the new swapchain.
    fn rebuild_swapchain_resources(
        &mut self,
        device: &mut dyn GpuDevice,
        state: &SwapchainState,
    ) -> BackendResult<()>;
}

/// Result of asking for the next presentable image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    Image(ImageIndex),
    /// The swapchain no longer matches the surface and must be recreated.
    OutOfDate,
}

/// Owns the swapchain and its recreate-on-resize protocol.
pub struct SwapchainManager {
    preference: PresentModePreference,
    desired_image_count: Option<u32>,
    state: Option<SwapchainState>,
    generation: u64,
}

impl SwapchainManager {
    /// Negotiate and create the initial swapchain.
    pub fn create(
        device: &mut dyn GpuDevice,
        window_size: Extent2D,
        preference: PresentModePreference,
        desired_image_count: Option<u32>,
    ) -> BackendResult<Self> {
        let mut manager = Self {
            preference,
            desired_image_count,
            state: None,
            generation: 0,
        };
        manager.build(device, window_size)?;
        Ok(manager)
    }

    pub fn state(&self) -> BackendResult<&SwapchainState> {
        self.state
            .as_ref()
            .ok_or_else(|| BackendError::ResourceNotFound("swapchain".into()))
    }

    /// Number of swapchains created so far, including the initial one
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Tear down and rebuild the swapchain and everything depending on it.
    ///
    /// Calling this twice with the same extent and unchanged surface yields
    /// the same negotiated format, present mode, extent and image count.
    pub fn recreate(
        &mut self,
        device: &mut dyn GpuDevice,
        window_size: Extent2D,
        dependents: &mut dyn SwapchainDependent,
    ) -> BackendResult<()> {
        device.wait_idle()?;

        dependents.release_swapchain_resources(device);
        self.destroy_current(device);

        self.build(device, window_size)?;
        let state = self.state()?;
        dependents.rebuild_swapchain_resources(device, state)?;

        log::info!(
            "Swapchain recreated: {}x{} {:?} {:?}, {} images",
            state.extent.width,
            state.extent.height,
            state.surface_format.format,
            state.present_mode,
            state.image_count()
        );
        Ok(())
    }

    /// Acquire the next image, signaling `semaphore` when it is ready.
    ///
    /// Suboptimal acquisitions are logged and used; only out-of-date asks for
    /// recreation.
    pub fn acquire(
        &self,
        device: &mut dyn GpuDevice,
        semaphore: SemaphoreHandle,
    ) -> BackendResult<Acquired> {
        let state = self.state()?;
        match device.acquire_next_image(state.handle, semaphore, None)? {
            AcquireOutcome::Acquired { index, suboptimal } => {
                if index >= state.image_count() {
                    return Err(BackendError::AcquireImageFailed(format!(
                        "platform returned image {} of {}",
                        index,
                        state.image_count()
                    )));
                }
                if suboptimal {
                    log::warn!("Swapchain image {} acquired suboptimal", index);
                }
                Ok(Acquired::Image(ImageIndex(index)))
            }
            AcquireOutcome::OutOfDate => {
                log::warn!("Swapchain out of date during acquire");
                Ok(Acquired::OutOfDate)
            }
        }
    }

    /// Present an image. Returns `true` when the swapchain should be recreated.
    pub fn present(
        &self,
        device: &mut dyn GpuDevice,
        image: ImageIndex,
        wait: SemaphoreHandle,
    ) -> BackendResult<bool> {
        let state = self.state()?;
        match device.present(state.handle, image.0, wait)? {
            PresentOutcome::Presented => Ok(false),
            PresentOutcome::Suboptimal => {
                log::warn!("Swapchain suboptimal during present");
                Ok(true)
            }
            PresentOutcome::OutOfDate => {
                log::warn!("Swapchain out of date during present");
                Ok(true)
            }
        }
    }

    /// Destroy the swapchain. The device must be idle.
    pub fn destroy(&mut self, device: &mut dyn GpuDevice) {
        self.destroy_current(device);
    }

    fn destroy_current(&mut self, device: &mut dyn GpuDevice) {
        if let Some(state) = self.state.take() {
            for view in state.views {
                device.destroy_image_view(view);
            }
            device.destroy_swapchain(state.handle);
        }
    }

    fn build(&mut self, device: &mut dyn GpuDevice, window_size: Extent2D) -> BackendResult<()> {
        let support = device.surface_support()?;

        let surface_format = negotiate_surface_format(&support.formats).ok_or_else(|| {
            BackendError::SwapchainCreationFailed("surface reports no formats".into())
        })?;
        let present_mode = negotiate_present_mode(&support.present_modes, self.preference);
        let extent = negotiate_extent(&support.capabilities, window_size);
        if extent.is_zero_area() {
            return Err(BackendError::SwapchainCreationFailed(
                "zero-area extent".into(),
            ));
        }
        let image_count = negotiate_image_count(&support.capabilities, self.desired_image_count);

        // Transfer source lets diagnostics read back what was presented.
        let mut usage = ImageUsage::COLOR_ATTACHMENT;
        if support
            .capabilities
            .supported_usage
            .contains(ImageUsage::TRANSFER_SRC)
        {
            usage |= ImageUsage::TRANSFER_SRC;
        }

        let desc = SwapchainDescriptor {
            surface_format,
            present_mode,
            extent,
            image_count,
            usage,
        };
        let handle = device.create_swapchain(&desc, None)?;
        let images = device.swapchain_images(handle)?;

        let mut views = Vec::with_capacity(images.len());
        for &image in &images {
            match device.create_image_view(image, &ImageViewDescriptor::single_layer(0)) {
                Ok(view) => views.push(view),
                Err(e) => {
                    for view in views {
                        device.destroy_image_view(view);
                    }
                    device.destroy_swapchain(handle);
                    return Err(e);
                }
            }
        }

        log::info!(
            "Swapchain created: {}x{} {:?}/{:?} {:?}, {} images",
            extent.width,
            extent.height,
            surface_format.format,
            surface_format.color_space,
            present_mode,
            images.len()
        );

        self.generation += 1;
        self.state = Some(SwapchainState {
            handle,
            surface_format,
            present_mode,
            extent,
            images,
            views,
            usage,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: Option<Extent2D>) -> SurfaceCapabilities {
        SurfaceCapabilities {
            min_image_count: 2,
            max_image_count: 3,
            current_extent: current,
            min_image_extent: Extent2D::new(16, 16),
            max_image_extent: Extent2D::new(4096, 2048),
            supported_usage: ImageUsage::COLOR_ATTACHMENT | ImageUsage::TRANSFER_SRC,
        }
    }

    #[test]
    fn test_format_prefers_srgb_nonlinear() {
        let formats = [
            SurfaceFormat {
                format: Format::Bgra8Unorm,
                color_space: ColorSpace::SrgbNonlinear,
            },
            SurfaceFormat {
                format: Format::Bgra8Srgb,
                color_space: ColorSpace::SrgbNonlinear,
            },
        ];
        assert_eq!(
            negotiate_surface_format(&formats).unwrap().format,
            Format::Bgra8Srgb
        );
    }

    #[test]
    fn test_format_falls_back_to_first() {
        let formats = [
            SurfaceFormat {
                format: Format::Other(1234),
                color_space: ColorSpace::Other(7),
            },
            SurfaceFormat {
                format: Format::Bgra8Srgb,
                color_space: ColorSpace::Other(7),
            },
        ];
        assert_eq!(
            negotiate_surface_format(&formats).unwrap().format,
            Format::Other(1234)
        );
        assert!(negotiate_surface_format(&[]).is_none());
    }

    #[test]
    fn test_present_mode_preference() {
        let all = [PresentMode::Fifo, PresentMode::Immediate, PresentMode::Mailbox];
        assert_eq!(
            negotiate_present_mode(&all, PresentModePreference::LowLatency),
            PresentMode::Mailbox
        );
        assert_eq!(
            negotiate_present_mode(
                &[PresentMode::Fifo, PresentMode::Immediate],
                PresentModePreference::LowLatency
            ),
            PresentMode::Immediate
        );
        assert_eq!(
            negotiate_present_mode(&all, PresentModePreference::Vsync),
            PresentMode::Fifo
        );
        assert_eq!(
            negotiate_present_mode(&[], PresentModePreference::LowLatency),
            PresentMode::Fifo
        );
    }

    #[test]
    fn test_extent_uses_current_when_reported() {
        let c = caps(Some(Extent2D::new(800, 600)));
        assert_eq!(
            negotiate_extent(&c, Extent2D::new(1920, 1080)),
            Extent2D::new(800, 600)
        );
    }

    #[test]
    fn test_extent_clamps_window_size() {
        let c = caps(None);
        assert_eq!(
            negotiate_extent(&c, Extent2D::new(8000, 4)),
            Extent2D::new(4096, 16)
        );
        assert_eq!(
            negotiate_extent(&c, Extent2D::new(640, 480)),
            Extent2D::new(640, 480)
        );
    }

    #[test]
    fn test_extent_with_inverted_range_uses_minimum() {
        let mut c = caps(None);
        c.min_image_extent = Extent2D::new(320, 240);
        c.max_image_extent = Extent2D::new(100, 4096);
        assert_eq!(
            negotiate_extent(&c, Extent2D::new(640, 480)),
            Extent2D::new(320, 480)
        );
        assert_eq!(
            negotiate_extent(&c, Extent2D::new(50, 50)),
            Extent2D::new(320, 240)
        );
    }

    #[test]
    fn test_image_count_bounds() {
        let mut c = caps(None);
        assert_eq!(negotiate_image_count(&c, None), 3);
        assert_eq!(negotiate_image_count(&c, Some(8)), 3);
        assert_eq!(negotiate_image_count(&c, Some(1)), 2);
        c.max_image_count = 0;
        assert_eq!(negotiate_image_count(&c, Some(8)), 8);
    }
}
