//! Per-frame orchestrator

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::camera::{Camera, CameraUniform};
use crate::frame::{FrameRing, SlotIndex};
use crate::pipeline::{build_deferred_graph, build_lightfield_graph, PipelineKind};
use crate::render_graph::{GraphRebuild, OverlayRecorder, RenderGraph};
use crate::resources::{
    AllocatorStats, Mesh, MeshTag, ResourceAllocator, RingUniformBuffer, Scene, UniformBuffer,
};
use crate::shader::ShaderLibrary;
use crate::swapchain::{Acquired, SwapchainManager};
use crate::RendererConfig;
use std::path::Path;

/// What a call to [`Renderer::render_frame`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// A frame was submitted and queued for presentation.
    Presented,
    /// Nothing was rendered because the window has no area.
    Skipped,
    /// The swapchain and its dependents were rebuilt. A frame may have been
    /// presented before the rebuild.
    Recreated,
}

/// Ties the frame ring, swapchain, allocator and render graph together.
///
/// Owns the device. Dropping the renderer drains every frame in flight
/// before anything is destroyed.
pub struct Renderer<D: GpuDevice> {
    device: D,
    config: RendererConfig,
    allocator: ResourceAllocator,
    swapchain: SwapchainManager,
    ring: FrameRing,
    shaders: ShaderLibrary,
    camera: Camera,
    camera_uniform: Option<RingUniformBuffer>,
    scene: Scene,
    graph: RenderGraph,
    window_extent: Extent2D,
    needs_recreate: bool,
}

impl<D: GpuDevice> Renderer<D> {
    /// Create every long-lived object and build the configured graph.
    ///
    /// Startup failures are fatal; objects created before the failing step
    /// are left to the device's own teardown.
    pub fn new(
        mut device: D,
        config: RendererConfig,
        shaders: ShaderLibrary,
        meshes: &[(Mesh, MeshTag)],
    ) -> BackendResult<Self> {
        shaders.require(config.pipeline.required_programs())?;

        let mut graph = match config.pipeline {
            PipelineKind::Deferred => build_deferred_graph(config.light)?,
            PipelineKind::Lightfield => build_lightfield_graph(&config.lightfield)?,
        };

        let mut allocator = ResourceAllocator::new(&mut device)?;
        let swapchain = SwapchainManager::create(
            &mut device,
            config.extent,
            config.present_mode,
            config.swapchain_images,
        )?;
        let state = swapchain.state()?;

        let ring_size = config
            .frames_in_flight
            .unwrap_or(state.image_count() as usize);
        let ring = FrameRing::new(&mut device, ring_size, config.wait_policy)?;

        let camera_uniform = RingUniformBuffer::new(
            &mut device,
            &mut allocator,
            "camera",
            std::mem::size_of::<crate::camera::CameraUniform>() as u64,
            ring.size(),
        )?;

        let mut scene = Scene::new();
        for (mesh, tag) in meshes {
            scene.add(&mut device, &mut allocator, mesh, *tag)?;
        }

        graph.build(&mut device, &mut allocator, &shaders, state, &camera_uniform)?;

        let mut camera = config.camera.clone();
        camera.set_aspect(state.extent.width, state.extent.height);

        log::info!(
            "Renderer ready: {:?} graph, {} frames in flight, {} meshes",
            config.pipeline,
            ring.size(),
            scene.len()
        );

        Ok(Self {
            device,
            window_extent: config.extent,
            config,
            allocator,
            swapchain,
            ring,
            shaders,
            camera,
            camera_uniform: Some(camera_uniform),
            scene,
            graph,
            needs_recreate: false,
        })
    }

    /// Render and present one frame.
    ///
    /// `overlay` records into the final pass after the graph's own draws.
    pub fn render_frame(
        &mut self,
        overlay: Option<&mut dyn OverlayRecorder>,
    ) -> BackendResult<FrameStatus> {
        if self.window_extent.is_zero_area() {
            log::trace!("Window has no area, skipping frame");
            return Ok(FrameStatus::Skipped);
        }
        if self.needs_recreate {
            self.recreate_swapchain()?;
            return Ok(FrameStatus::Recreated);
        }

        let slot = self.ring.acquire_slot(&mut self.device)?;
        let image_available = self.ring.slot(slot).image_available;
        let image = match self.swapchain.acquire(&mut self.device, image_available)? {
            Acquired::Image(image) => image,
            Acquired::OutOfDate => {
                // The slot's fence was not reset, so the ring stays consistent.
                self.recreate_swapchain()?;
                return Ok(FrameStatus::Recreated);
            }
        };
        log::trace!(
            "Frame {}: slot {}, image {}",
            self.ring.frame_number(),
            slot.0,
            image.0
        );

        let camera = self.write_camera(slot)?;

        let cmd = self.ring.begin_recording(&mut self.device, slot)?;
        let state = self.swapchain.state()?;
        self.graph.record(
            &mut self.device,
            cmd,
            slot,
            image,
            state,
            &self.scene,
            &camera,
            overlay,
        )?;
        self.ring.submit(&mut self.device, slot)?;

        let render_finished = self.ring.slot(slot).render_finished;
        let stale = self
            .swapchain
            .present(&mut self.device, image, render_finished)?;
        self.ring.advance();

        if stale {
            self.recreate_swapchain()?;
            return Ok(FrameStatus::Recreated);
        }
        Ok(FrameStatus::Presented)
    }

    /// Record a new window size. The swapchain is rebuilt on the next frame;
    /// a zero-area size pauses rendering until a non-zero one arrives.
    pub fn resize(&mut self, width: u32, height: u32) {
        let extent = Extent2D::new(width, height);
        if extent == self.window_extent && !self.needs_recreate {
            return;
        }
        log::debug!("Resize requested: {}x{}", width, height);
        self.window_extent = extent;
        self.needs_recreate = true;
    }

    /// Write the allocator's JSON report to `path`
    pub fn dump_allocator_stats(&self, path: &Path) -> BackendResult<()> {
        self.allocator.dump_stats_json(&self.device, path)
    }

    /// Write the JSON report to the configured path, if one is set
    pub fn dump_configured_report(&self) -> BackendResult<()> {
        match &self.config.allocator_report {
            Some(path) => self.dump_allocator_stats(path),
            None => Ok(()),
        }
    }

    pub fn allocator_stats(&self) -> AllocatorStats {
        self.allocator.stats()
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    pub fn graph(&self) -> &RenderGraph {
        &self.graph
    }

    pub fn swapchain(&self) -> &SwapchainManager {
        &self.swapchain
    }

    pub fn ring(&self) -> &FrameRing {
        &self.ring
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    fn write_camera(&mut self, slot: SlotIndex) -> BackendResult<CameraUniform> {
        let uniform = self.camera_uniform.as_mut().ok_or_else(|| {
            BackendError::ResourceNotFound("camera uniform".into())
        })?;
        let data = self.camera.uniform_data();
        uniform.write(&mut self.device, slot, bytemuck::bytes_of(&data))?;
        Ok(data)
    }

    fn recreate_swapchain(&mut self) -> BackendResult<()> {
        let camera = self.camera_uniform.as_ref().ok_or_else(|| {
            BackendError::ResourceNotFound("camera uniform".into())
        })?;
        let mut rebuild = GraphRebuild {
            graph: &mut self.graph,
            allocator: &mut self.allocator,
            shaders: &self.shaders,
            camera,
        };
        self.swapchain
            .recreate(&mut self.device, self.window_extent, &mut rebuild)?;
        self.needs_recreate = false;

        let extent = self.swapchain.state()?.extent;
        self.camera.set_aspect(extent.width, extent.height);
        Ok(())
    }
}

impl<D: GpuDevice> Drop for Renderer<D> {
    fn drop(&mut self) {
        // Destroying anything the GPU may still read is undefined behavior,
        // so a failed drain leaks instead.
        if let Err(e) = self.ring.wait_all(&mut self.device) {
            log::error!("Frames still in flight at shutdown, leaking GPU objects: {}", e);
            return;
        }
        if let Err(e) = self.device.wait_idle() {
            log::error!("Device did not go idle at shutdown, leaking GPU objects: {}", e);
            return;
        }

        self.graph.destroy(&mut self.device, &mut self.allocator);
        if let Some(camera) = self.camera_uniform.take() {
            camera.destroy(&mut self.device, &mut self.allocator);
        }
        self.scene.destroy(&mut self.device, &mut self.allocator);
        self.swapchain.destroy(&mut self.device);
        self.ring.destroy(&mut self.device);
        self.allocator.shutdown(&mut self.device);
        log::info!("Renderer shut down after {} frames", self.ring.frame_number());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{HeadlessConfig, HeadlessDevice};
    use crate::pipeline::lightfield::{FORWARD_PROGRAM, GRADIENTS_PROGRAM, SWAPCHAIN_WRITE_PROGRAM};

    fn lightfield_shaders() -> ShaderLibrary {
        let mut shaders = ShaderLibrary::new();
        for program in [FORWARD_PROGRAM, GRADIENTS_PROGRAM, SWAPCHAIN_WRITE_PROGRAM] {
            shaders.insert(program, ShaderStage::Vertex, format!("{}.vs", program).into_bytes());
            shaders.insert(program, ShaderStage::Fragment, format!("{}.fs", program).into_bytes());
        }
        shaders
    }

    fn renderer() -> Renderer<HeadlessDevice> {
        Renderer::new(
            HeadlessDevice::new(HeadlessConfig::default()),
            RendererConfig::default().with_extent(64, 64),
            lightfield_shaders(),
            &[(Mesh::quad([1.0; 4]), MeshTag::Lightfield)],
        )
        .unwrap()
    }

    #[test]
    fn test_missing_program_fails_early() {
        let result = Renderer::new(
            HeadlessDevice::new(HeadlessConfig::default()),
            RendererConfig::default(),
            ShaderLibrary::new(),
            &[],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_ring_defaults_to_image_count() {
        let renderer = renderer();
        let images = renderer.swapchain().state().unwrap().image_count() as usize;
        assert_eq!(renderer.ring().size(), images);
    }

    #[test]
    fn test_frames_advance_ring() {
        let mut renderer = renderer();
        for _ in 0..5 {
            assert_eq!(renderer.render_frame(None).unwrap(), FrameStatus::Presented);
        }
        assert_eq!(renderer.ring().frame_number(), 5);
    }

    #[test]
    fn test_zero_area_skips() {
        let mut renderer = renderer();
        renderer.resize(0, 0);
        assert_eq!(renderer.render_frame(None).unwrap(), FrameStatus::Skipped);
        assert_eq!(renderer.ring().frame_number(), 0);
    }

    #[test]
    fn test_resize_recreates_once() {
        let mut renderer = renderer();
        let generation = renderer.swapchain().generation();
        renderer.resize(32, 32);
        assert_eq!(renderer.render_frame(None).unwrap(), FrameStatus::Recreated);
        assert_eq!(renderer.swapchain().generation(), generation + 1);
        assert_eq!(renderer.render_frame(None).unwrap(), FrameStatus::Presented);
    }
}
