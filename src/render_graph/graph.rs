//! Render graph definition, build and recording

use crate::backend::traits::*;
use crate::camera::CameraUniform;
use crate::descriptor::{DescriptorBinder, DescriptorPool};
use crate::frame::{ImageIndex, SlotIndex};
use crate::render_graph::pass::*;
use crate::render_graph::resource::*;
use crate::resources::{ResourceAllocator, Scene, UniformBuffer};
use crate::shader::ShaderLibrary;
use crate::swapchain::{SwapchainDependent, SwapchainState};
use std::collections::HashSet;

/// Metadata for a pass in the graph
#[derive(Debug)]
pub struct PassNode {
    pub id: PassId,
    pub name: String,
    pub io: PassIo,
}

/// A fixed, statically ordered sequence of passes recorded into one command
/// buffer per frame.
pub struct RenderGraph {
    passes: Vec<Box<dyn RenderPass>>,
    pass_nodes: Vec<PassNode>,
    binder: DescriptorBinder,
    pool: Option<DescriptorPool>,
    resources: ResourceTable,
    external_resources: HashSet<String>,
    next_pass_id: u32,
    built: bool,
}

impl RenderGraph {
    pub fn new() -> Self {
        let mut graph = Self {
            passes: Vec::new(),
            pass_nodes: Vec::new(),
            binder: DescriptorBinder::new(),
            pool: None,
            resources: ResourceTable::new(),
            external_resources: HashSet::new(),
            next_pass_id: 0,
            built: false,
        };
        graph.register_external(SWAPCHAIN_RESOURCE);
        graph
    }

    /// Register a resource that exists outside the graph (like the swapchain image)
    pub fn register_external(&mut self, name: &str) {
        self.external_resources.insert(name.to_string());
    }

    /// Append a pass. Passes execute in the order they are added.
    pub fn add_pass<P: RenderPass + 'static>(&mut self, pass: P) -> BackendResult<PassId> {
        let id = PassId(self.next_pass_id);
        self.next_pass_id += 1;

        let mut io = PassIo::default();
        pass.declare(&mut io);
        for (set, binding) in &io.bindings {
            self.binder
                .declare_binding(id, *set, binding.binding, binding.ty, binding.stages)?;
        }

        log::debug!(
            "Added pass '{}' (reads {:?}, writes {:?})",
            pass.name(),
            io.reads,
            io.writes
        );
        self.pass_nodes.push(PassNode {
            id,
            name: pass.name().to_string(),
            io,
        });
        self.passes.push(Box::new(pass));
        Ok(id)
    }

    /// Check the fixed order: every read names an external resource or one
    /// written by an earlier pass, and no resource has two writers.
    pub fn validate(&self) -> BackendResult<()> {
        let mut written: HashSet<&str> = HashSet::new();
        for node in &self.pass_nodes {
            for read in &node.io.reads {
                if !self.external_resources.contains(read) && !written.contains(read.as_str()) {
                    return Err(BackendError::Validation(format!(
                        "pass '{}' reads '{}' before any earlier pass writes it",
                        node.name, read
                    )));
                }
            }
            for write in &node.io.writes {
                if self.external_resources.contains(write) {
                    continue;
                }
                if !written.insert(write.as_str()) {
                    return Err(BackendError::Validation(format!(
                        "pass '{}' writes '{}', which an earlier pass already writes",
                        node.name, write
                    )));
                }
            }
        }
        Ok(())
    }

    /// Create every pass's swapchain-dependent objects, in order.
    pub fn build(
        &mut self,
        device: &mut dyn GpuDevice,
        allocator: &mut ResourceAllocator,
        shaders: &ShaderLibrary,
        swapchain: &SwapchainState,
        camera: &dyn UniformBuffer,
    ) -> BackendResult<()> {
        self.validate()?;
        if self.built {
            self.release(device, allocator);
        }
        if self.pool.is_none() {
            let max_sets = self.pool_capacity(camera.copies());
            log::debug!("Descriptor pool sized for {} sets", max_sets);
            self.pool = Some(DescriptorPool::new(device, max_sets)?);
        }
        let Some(pool) = self.pool.as_ref() else {
            return Err(BackendError::DescriptorFailed("no descriptor pool".into()));
        };

        let mut failure = None;
        for (pass, node) in self.passes.iter_mut().zip(&self.pass_nodes) {
            let mut ctx = PassBuildContext {
                id: node.id,
                device: &mut *device,
                allocator: &mut *allocator,
                binder: &mut self.binder,
                pool,
                shaders,
                resources: &mut self.resources,
                swapchain,
                camera,
            };
            if let Err(e) = pass.create(&mut ctx) {
                log::warn!("Pass '{}' failed to build: {}", node.name, e);
                failure = Some(e);
                break;
            }
        }

        self.built = true;
        if let Some(e) = failure {
            self.release(device, allocator);
            return Err(e);
        }
        log::info!(
            "Render graph built: {} passes at {}x{}",
            self.passes.len(),
            swapchain.extent.width,
            swapchain.extent.height
        );
        Ok(())
    }

    /// Every declared set, once per copy of the per-frame uniforms.
    fn pool_capacity(&self, copies: usize) -> u32 {
        let sets: u32 = self
            .pass_nodes
            .iter()
            .map(|node| self.binder.set_count(node.id))
            .sum();
        sets.max(1) * copies.max(1) as u32
    }

    /// Record every pass, in order, into `cmd`.
    #[allow(clippy::too_many_arguments)]
    pub fn record<'a>(
        &mut self,
        device: &'a mut dyn GpuDevice,
        cmd: CommandBufferHandle,
        slot: SlotIndex,
        image: ImageIndex,
        swapchain: &'a SwapchainState,
        scene: &'a Scene,
        camera: &'a CameraUniform,
        overlay: Option<&mut dyn OverlayRecorder>,
    ) -> BackendResult<()> {
        if !self.built {
            return Err(BackendError::CommandRecordingFailed(
                "render graph recorded before build".into(),
            ));
        }

        let mut ctx = RecordContext {
            device,
            cmd,
            slot,
            image,
            swapchain,
            scene,
            camera,
            overlay,
        };
        for pass in &mut self.passes {
            log::trace!("Recording pass '{}'", pass.name());
            pass.record(&mut ctx)?;
        }
        Ok(())
    }

    /// Destroy swapchain-dependent objects in reverse order and free all
    /// descriptor sets. The device must be idle.
    pub fn release(&mut self, device: &mut dyn GpuDevice, allocator: &mut ResourceAllocator) {
        if !self.built {
            return;
        }
        for (pass, node) in self.passes.iter_mut().zip(&self.pass_nodes).rev() {
            let mut ctx = PassTeardownContext {
                id: node.id,
                device: &mut *device,
                allocator: &mut *allocator,
                resources: &mut self.resources,
            };
            pass.destroy(&mut ctx);
        }
        if let Some(pool) = &self.pool {
            if let Err(e) = pool.reset(device) {
                log::warn!("Failed to reset descriptor pool: {}", e);
            }
        }
        if !self.resources.is_empty() {
            log::warn!(
                "Shared images left after release: {:?}",
                self.resources.names().collect::<Vec<_>>()
            );
        }
        self.built = false;
    }

    /// Release everything, including the pool and cached set layouts.
    pub fn destroy(&mut self, device: &mut dyn GpuDevice, allocator: &mut ResourceAllocator) {
        self.release(device, allocator);
        if let Some(pool) = self.pool.take() {
            pool.destroy(device);
        }
        self.binder.destroy(device);
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    /// Get pass nodes (metadata)
    pub fn pass_nodes(&self) -> &[PassNode] {
        &self.pass_nodes
    }

    /// Find a pass by concrete type
    pub fn pass<T: 'static>(&self) -> Option<&T> {
        self.passes.iter().find_map(|p| p.as_any().downcast_ref::<T>())
    }

    pub fn resources(&self) -> &ResourceTable {
        &self.resources
    }

    pub fn binder(&self) -> &DescriptorBinder {
        &self.binder
    }
}

impl Default for RenderGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// A graph bundled with what it needs to rebuild after swapchain recreation
pub struct GraphRebuild<'a> {
    pub graph: &'a mut RenderGraph,
    pub allocator: &'a mut ResourceAllocator,
    pub shaders: &'a ShaderLibrary,
    pub camera: &'a dyn UniformBuffer,
}

impl<'a> SwapchainDependent for GraphRebuild<'a> {
    fn release_swapchain_resources(&mut self, device: &mut dyn GpuDevice) {
        self.graph.release(device, self.allocator);
    }

    fn rebuild_swapchain_resources(
        &mut self,
        device: &mut dyn GpuDevice,
        state: &SwapchainState,
    ) -> BackendResult<()> {
        self.graph
            .build(device, self.allocator, self.shaders, state, self.camera)
    }
}
