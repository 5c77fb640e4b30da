//! # Lightfield Demo
//!
//! Opens a window and runs either the lightfield or the deferred graph on
//! the Vulkan device. Shaders are loaded from a directory of
//! `<program>.vert.spv` / `<program>.frag.spv` files.
//!
//! ```text
//! cargo run --example lightfield -- --shaders shaders/ --pipeline lightfield
//! ```

use clap::{Parser, ValueEnum};
use glam::Vec3;
use lightfield_renderer::backend::vulkan::VulkanDevice;
use lightfield_renderer::pipeline::GradientMode;
use lightfield_renderer::resources::{Mesh, MeshTag};
use lightfield_renderer::window::{self, Window};
use lightfield_renderer::{
    BackendResult, Camera, FrameStatus, LightfieldConfig, PipelineKind, PresentModePreference,
    PresentSource, Renderer, RendererConfig, ShaderLibrary,
};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use winit::event_loop::EventLoop;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PipelineArg {
    Deferred,
    Lightfield,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PresentArg {
    View,
    Gradients,
    Disparity,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum GradientArg {
    Passthrough,
    Horizontal,
    Vertical,
    Magnitude,
}

#[derive(Debug, Parser)]
#[command(about = "Lightfield and deferred rendering demo")]
struct Args {
    /// Directory with compiled SPIR-V shaders
    #[arg(long, default_value = "shaders")]
    shaders: PathBuf,

    #[arg(long, value_enum, default_value_t = PipelineArg::Lightfield)]
    pipeline: PipelineArg,

    #[arg(long, default_value_t = 1280)]
    width: u32,

    #[arg(long, default_value_t = 720)]
    height: u32,

    /// Lock presentation to the display refresh rate
    #[arg(long)]
    vsync: bool,

    /// Frame ring size, defaults to the swapchain image count
    #[arg(long)]
    frames_in_flight: Option<usize>,

    /// Give up on a frame fence after this many milliseconds
    #[arg(long)]
    fence_timeout_ms: Option<u64>,

    /// Image the lightfield graph presents
    #[arg(long, value_enum, default_value_t = PresentArg::Disparity)]
    present: PresentArg,

    #[arg(long, value_enum, default_value_t = GradientArg::Magnitude)]
    gradients: GradientArg,

    /// Distance between neighboring grid cameras
    #[arg(long, default_value_t = 0.1)]
    baseline: f32,

    /// Write the allocator report here on exit
    #[arg(long)]
    report: Option<PathBuf>,

    /// Stop after this many frames
    #[arg(long)]
    frames: Option<u64>,

    #[arg(long)]
    no_validation: bool,
}

impl Args {
    fn config(&self) -> RendererConfig {
        let lightfield = LightfieldConfig {
            gradient_mode: match self.gradients {
                GradientArg::Passthrough => GradientMode::Passthrough,
                GradientArg::Horizontal => GradientMode::Horizontal,
                GradientArg::Vertical => GradientMode::Vertical,
                GradientArg::Magnitude => GradientMode::Magnitude,
            },
            baseline: self.baseline,
            present_source: match self.present {
                PresentArg::View => PresentSource::ForwardView,
                PresentArg::Gradients => PresentSource::Gradients,
                PresentArg::Disparity => PresentSource::Disparity,
            },
            ..LightfieldConfig::default()
        };

        let mut config = RendererConfig::default()
            .with_app_name("Lightfield Demo")
            .with_extent(self.width, self.height)
            .with_pipeline(match self.pipeline {
                PipelineArg::Deferred => PipelineKind::Deferred,
                PipelineArg::Lightfield => PipelineKind::Lightfield,
            })
            .with_present_mode(if self.vsync {
                PresentModePreference::Vsync
            } else {
                PresentModePreference::LowLatency
            })
            .with_lightfield(lightfield)
            .with_camera(Camera::new(Vec3::new(1.5, 1.2, 3.0), Vec3::ZERO))
            .with_validation(!self.no_validation);

        if let Some(count) = self.frames_in_flight {
            config = config.with_frames_in_flight(count);
        }
        if let Some(ms) = self.fence_timeout_ms {
            config = config.with_fence_timeout(Duration::from_millis(ms));
        }
        if let Some(path) = &self.report {
            config = config.with_allocator_report(path);
        }
        config
    }
}

fn scene(pipeline: PipelineKind) -> Vec<(Mesh, MeshTag)> {
    let tag = match pipeline {
        PipelineKind::Deferred => MeshTag::Deferred,
        PipelineKind::Lightfield => MeshTag::Lightfield,
    };
    vec![
        (Mesh::cube([0.8, 0.3, 0.2, 1.0]), tag),
        (Mesh::quad([0.4, 0.4, 0.45, 1.0]), tag),
    ]
}

fn main() -> BackendResult<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.config();
    let shaders = ShaderLibrary::load_dir(&args.shaders)?;
    log::info!("Loaded {} shader stages from {}", shaders.len(), args.shaders.display());

    let event_loop = EventLoop::new().map_err(|e| {
        lightfield_renderer::BackendError::InitializationFailed(e.to_string())
    })?;
    let window = Window::new(
        &event_loop,
        &config.app_name,
        config.extent.width,
        config.extent.height,
    )?;

    let device = VulkanDevice::new(&window, &config)?;
    let meshes = scene(config.pipeline);
    let mut renderer = Some(Renderer::new(device, config, shaders, &meshes)?);

    let frame_limit = args.frames;
    let started = Instant::now();
    let mut last_report = Instant::now();

    window::run(event_loop, window, move |window| {
        let Some(active) = renderer.as_mut() else {
            return Ok(false);
        };

        if let Some((width, height)) = window.state_mut().take_resize() {
            active.resize(width, height);
        }

        let close = window.state().should_close()
            || frame_limit.is_some_and(|limit| active.ring().frame_number() >= limit);
        if close {
            active.dump_configured_report()?;
            // Drains every frame in flight before releasing GPU objects.
            renderer = None;
            return Ok(false);
        }

        let t = started.elapsed().as_secs_f32();
        active.camera_mut().position = Vec3::new(1.5 * t.cos(), 1.2, 1.5 * t.sin() + 1.5);

        match active.render_frame(None)? {
            FrameStatus::Presented => {}
            FrameStatus::Recreated => log::debug!("Swapchain recreated"),
            FrameStatus::Skipped => std::thread::sleep(Duration::from_millis(16)),
        }

        if last_report.elapsed() >= Duration::from_secs(5) {
            let stats = active.allocator_stats();
            log::info!(
                "Frame {}: {} images, {} buffers, peak {} bytes",
                active.ring().frame_number(),
                stats.live_images,
                stats.live_buffers,
                stats.peak_bytes
            );
            last_report = Instant::now();
        }
        Ok(true)
    })
}
