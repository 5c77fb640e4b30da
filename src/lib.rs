//! Lightfield Renderer - frame synchronization and render-graph orchestration
//! over an explicit graphics API
//!
//! Two devices implement the [`GpuDevice`](backend::GpuDevice) seam:
//! - **Vulkan**: ash + gpu-allocator, for real windows (native feature)
//! - **Headless**: a CPU-simulated device with a call log, used by tests
//!
//! # Features
//! - Bounded ring of frames in flight with fence-before-reset ordering
//! - Swapchain negotiation and recreate-on-resize
//! - Deferred shading in one render pass with two subpasses
//! - Lightfield capture: forward ×9 on a 3×3 camera grid, gradients,
//!   disparity placeholder and a final swapchain write with overlay hook
//! - Resource allocator with staging uploads and a JSON statistics report
//! - Descriptor binder with per-frame sets indexed by ring slot

pub mod backend;
pub mod camera;
pub mod descriptor;
pub mod engine;
pub mod frame;
pub mod pipeline;
pub mod render_graph;
pub mod resources;
pub mod shader;
pub mod swapchain;

#[cfg(feature = "native")]
pub mod window;

pub use backend::{BackendError, BackendResult, GpuDevice};
pub use camera::Camera;
pub use engine::{FrameStatus, Renderer};
pub use frame::WaitPolicy;
pub use pipeline::{LightUniform, LightfieldConfig, PipelineKind, PresentSource};
pub use render_graph::OverlayRecorder;
pub use shader::ShaderLibrary;
pub use swapchain::PresentModePreference;

#[cfg(feature = "native")]
pub use window::Window;

use backend::types::Extent2D;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for initializing the renderer
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Application name, also the window title
    pub app_name: String,
    /// Initial surface size in pixels
    pub extent: Extent2D,
    pub present_mode: PresentModePreference,
    /// Requested swapchain image count, clamped to what the surface allows
    pub swapchain_images: Option<u32>,
    /// Frame ring size. Defaults to the swapchain image count.
    pub frames_in_flight: Option<usize>,
    /// How long to block on a frame's fence
    pub wait_policy: WaitPolicy,
    pub pipeline: PipelineKind,
    pub lightfield: LightfieldConfig,
    pub light: LightUniform,
    pub camera: Camera,
    /// Where to write the allocator report, if anywhere
    pub allocator_report: Option<PathBuf>,
    /// Request validation layers from the Vulkan device
    pub validation: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            app_name: "Lightfield Renderer".to_string(),
            extent: Extent2D::new(1280, 720),
            present_mode: PresentModePreference::default(),
            swapchain_images: None,
            frames_in_flight: None,
            wait_policy: WaitPolicy::Infinite,
            pipeline: PipelineKind::default(),
            lightfield: LightfieldConfig::default(),
            light: LightUniform::default(),
            camera: Camera::default(),
            allocator_report: None,
            validation: cfg!(debug_assertions),
        }
    }
}

impl RendererConfig {
    pub fn with_app_name(mut self, name: &str) -> Self {
        self.app_name = name.to_string();
        self
    }

    pub fn with_extent(mut self, width: u32, height: u32) -> Self {
        self.extent = Extent2D::new(width, height);
        self
    }

    pub fn with_present_mode(mut self, present_mode: PresentModePreference) -> Self {
        self.present_mode = present_mode;
        self
    }

    pub fn with_swapchain_images(mut self, count: u32) -> Self {
        self.swapchain_images = Some(count);
        self
    }

    pub fn with_frames_in_flight(mut self, count: usize) -> Self {
        self.frames_in_flight = Some(count);
        self
    }

    /// Bound every fence wait. The default waits forever.
    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.wait_policy = WaitPolicy::Timeout(timeout);
        self
    }

    pub fn with_pipeline(mut self, pipeline: PipelineKind) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_lightfield(mut self, lightfield: LightfieldConfig) -> Self {
        self.lightfield = lightfield;
        self
    }

    pub fn with_light(mut self, light: LightUniform) -> Self {
        self.light = light;
        self
    }

    pub fn with_camera(mut self, camera: Camera) -> Self {
        self.camera = camera;
        self
    }

    pub fn with_allocator_report(mut self, path: impl Into<PathBuf>) -> Self {
        self.allocator_report = Some(path.into());
        self
    }

    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }
}
