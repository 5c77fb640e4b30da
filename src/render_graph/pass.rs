//! Render pass declarations for the render graph

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::camera::CameraUniform;
use crate::descriptor::{BindingResource, BoundSet, DescriptorBinder, DescriptorPool};
use crate::frame::{ImageIndex, SlotIndex};
use crate::render_graph::pipeline::{PipelineDesc, PipelineObject};
use crate::render_graph::resource::{ResourceId, ResourceTable};
use crate::resources::{
    GpuImage, ImageRequest, ResourceAllocator, Scene, StaticUniformBuffer, UniformBuffer,
};
use crate::shader::ShaderLibrary;
use crate::swapchain::SwapchainState;
use std::any::Any;

/// Subpass index meaning "outside this render pass"
pub const SUBPASS_EXTERNAL: u32 = u32::MAX;

/// Name of the externally owned presentable image in pass reads/writes
pub const SWAPCHAIN_RESOURCE: &str = "swapchain";

/// Unique identifier for a render pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PassId(pub(crate) u32);

impl PassId {
    pub fn index(&self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttachmentDescription {
    pub format: Format,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub stencil_load_op: LoadOp,
    pub stencil_store_op: StoreOp,
    pub initial_layout: ImageLayout,
    pub final_layout: ImageLayout,
}

impl AttachmentDescription {
    pub fn color(
        format: Format,
        load_op: LoadOp,
        store_op: StoreOp,
        initial_layout: ImageLayout,
        final_layout: ImageLayout,
    ) -> Self {
        Self {
            format,
            load_op,
            store_op,
            stencil_load_op: LoadOp::DontCare,
            stencil_store_op: StoreOp::DontCare,
            initial_layout,
            final_layout,
        }
    }

    /// Cleared depth/stencil whose contents are not needed after the pass.
    pub fn transient_depth(format: Format) -> Self {
        Self {
            format,
            load_op: LoadOp::Clear,
            store_op: StoreOp::DontCare,
            stencil_load_op: if format.has_stencil() {
                LoadOp::Clear
            } else {
                LoadOp::DontCare
            },
            stencil_store_op: StoreOp::DontCare,
            initial_layout: ImageLayout::Undefined,
            final_layout: ImageLayout::DepthStencilAttachment,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentRef {
    pub attachment: u32,
    pub layout: ImageLayout,
}

impl AttachmentRef {
    pub fn color(attachment: u32) -> Self {
        Self {
            attachment,
            layout: ImageLayout::ColorAttachment,
        }
    }

    pub fn depth(attachment: u32) -> Self {
        Self {
            attachment,
            layout: ImageLayout::DepthStencilAttachment,
        }
    }

    pub fn input(attachment: u32) -> Self {
        Self {
            attachment,
            layout: ImageLayout::ShaderReadOnly,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindPoint {
    #[default]
    Graphics,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubpassDescription {
    pub bind_point: BindPoint,
    pub input_attachments: Vec<AttachmentRef>,
    pub color_attachments: Vec<AttachmentRef>,
    pub depth_attachment: Option<AttachmentRef>,
}

/// Execution and memory dependency between two subpasses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubpassDependency {
    pub src_subpass: u32,
    pub dst_subpass: u32,
    pub src_stages: PipelineStages,
    pub dst_stages: PipelineStages,
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
    /// Region-local: each pixel only depends on the same pixel of the source.
    pub by_region: bool,
}

/// Attachments, subpasses and dependencies of one render pass object
#[derive(Debug, Clone, PartialEq)]
pub struct PassDescriptor {
    pub label: String,
    pub attachments: Vec<AttachmentDescription>,
    pub subpasses: Vec<SubpassDescription>,
    pub dependencies: Vec<SubpassDependency>,
}

impl PassDescriptor {
    /// Check references and dependency indices.
    pub fn validate(&self) -> BackendResult<()> {
        let fail = |msg: String| {
            Err(BackendError::RenderPassCreationFailed(format!(
                "{}: {}",
                self.label, msg
            )))
        };

        if self.subpasses.is_empty() {
            return fail("no subpasses".into());
        }

        let count = self.attachments.len() as u32;
        for (i, subpass) in self.subpasses.iter().enumerate() {
            let refs = subpass
                .input_attachments
                .iter()
                .chain(&subpass.color_attachments)
                .chain(subpass.depth_attachment.iter());
            for r in refs {
                if r.attachment >= count {
                    return fail(format!(
                        "subpass {} references attachment {} of {}",
                        i, r.attachment, count
                    ));
                }
            }
            for input in &subpass.input_attachments {
                if subpass
                    .color_attachments
                    .iter()
                    .any(|c| c.attachment == input.attachment)
                {
                    return fail(format!(
                        "subpass {} reads and writes attachment {}",
                        i, input.attachment
                    ));
                }
            }
            if let Some(depth) = subpass.depth_attachment {
                if !self.attachments[depth.attachment as usize].format.is_depth() {
                    return fail(format!(
                        "subpass {} depth attachment {} is not a depth format",
                        i, depth.attachment
                    ));
                }
            }
        }

        let subpasses = self.subpasses.len() as u32;
        for dep in &self.dependencies {
            let valid = |s: u32| s == SUBPASS_EXTERNAL || s < subpasses;
            if !valid(dep.src_subpass) || !valid(dep.dst_subpass) {
                return fail(format!(
                    "dependency {} -> {} names a missing subpass",
                    dep.src_subpass, dep.dst_subpass
                ));
            }
            if dep.src_subpass != SUBPASS_EXTERNAL
                && dep.dst_subpass != SUBPASS_EXTERNAL
                && dep.src_subpass > dep.dst_subpass
            {
                return fail(format!(
                    "dependency {} -> {} points backwards",
                    dep.src_subpass, dep.dst_subpass
                ));
            }
        }

        Ok(())
    }

    /// Usage bits an image must carry to serve as the given attachment.
    pub fn required_usage(&self, attachment: u32) -> ImageUsage {
        let mut usage = ImageUsage::empty();
        for subpass in &self.subpasses {
            if subpass
                .color_attachments
                .iter()
                .any(|r| r.attachment == attachment)
            {
                usage |= ImageUsage::COLOR_ATTACHMENT;
            }
            if subpass
                .depth_attachment
                .is_some_and(|r| r.attachment == attachment)
            {
                usage |= ImageUsage::DEPTH_STENCIL_ATTACHMENT;
            }
            if subpass
                .input_attachments
                .iter()
                .any(|r| r.attachment == attachment)
            {
                usage |= ImageUsage::INPUT_ATTACHMENT;
            }
        }
        usage
    }
}

/// Shared resources a pass reads and writes, plus its descriptor bindings
#[derive(Debug, Default)]
pub struct PassIo {
    pub(crate) reads: Vec<String>,
    pub(crate) writes: Vec<String>,
    pub(crate) bindings: Vec<(u32, DescriptorSetLayoutBinding)>,
}

impl PassIo {
    pub fn read(&mut self, name: &str) {
        self.reads.push(name.to_string());
    }

    pub fn write(&mut self, name: &str) {
        self.writes.push(name.to_string());
    }

    /// Declare a descriptor binding visible to this pass's shaders.
    pub fn binding(&mut self, set: u32, binding: u32, ty: DescriptorType, stages: ShaderStages) {
        self.bindings.push((
            set,
            DescriptorSetLayoutBinding {
                binding,
                ty,
                stages,
            },
        ));
    }

    pub fn reads(&self) -> &[String] {
        &self.reads
    }

    pub fn writes(&self) -> &[String] {
        &self.writes
    }
}

/// Draw calls injected into the final subpass by an external UI layer
pub trait OverlayRecorder {
    fn record(&mut self, device: &mut dyn GpuDevice, cmd: CommandBufferHandle, extent: Extent2D);
}

/// Everything a pass needs to (re)create its extent-dependent objects
pub struct PassBuildContext<'a> {
    pub id: PassId,
    pub device: &'a mut dyn GpuDevice,
    pub allocator: &'a mut ResourceAllocator,
    pub binder: &'a mut DescriptorBinder,
    pub pool: &'a DescriptorPool,
    pub shaders: &'a ShaderLibrary,
    pub resources: &'a mut ResourceTable,
    pub swapchain: &'a SwapchainState,
    /// Per-frame camera data shared by every pass
    pub camera: &'a dyn UniformBuffer,
}

impl<'a> PassBuildContext<'a> {
    /// Allocate an image and publish it under `name` for later passes.
    pub fn share_new_image(
        &mut self,
        name: &str,
        request: ImageRequest,
        layout: ImageLayout,
    ) -> BackendResult<GpuImage> {
        let image = self.allocator.create_image(&mut *self.device, &request)?;
        match self.resources.register(self.id, name, image.clone(), layout) {
            Ok(_) => Ok(image),
            Err(e) => {
                self.allocator.destroy(&mut *self.device, image);
                Err(e)
            }
        }
    }

    /// Image an earlier pass published under `name`
    pub fn shared(&self, name: &str) -> BackendResult<GpuImage> {
        self.resources.get(name).map(|entry| entry.image.clone())
    }

    pub fn shared_id(&self, name: &str) -> BackendResult<ResourceId> {
        self.resources.get(name).map(|entry| entry.id)
    }

    /// Layout of one of this pass's declared sets
    pub fn set_layout(&mut self, set: u32) -> BackendResult<DescriptorSetLayoutHandle> {
        self.binder.layout(&mut *self.device, self.id, set)
    }

    /// Layouts of every set this pass declared, in set order
    pub fn set_layouts(&mut self) -> BackendResult<Vec<DescriptorSetLayoutHandle>> {
        self.binder.pass_layouts(&mut *self.device, self.id)
    }

    /// Write one of this pass's sets from the shared pool.
    pub fn bind(&mut self, set: u32, resources: &[BindingResource]) -> BackendResult<BoundSet> {
        self.binder
            .build(&mut *self.device, self.pool, self.id, set, resources)
    }
}

/// Objects a pass created for the current swapchain.
///
/// Everything is recorded as soon as it exists, so a pass whose `create`
/// fails half way can still release what it made.
#[derive(Default)]
pub struct PassObjects {
    render_passes: Vec<RenderPassHandle>,
    framebuffers: Vec<FramebufferHandle>,
    pipelines: Vec<PipelineObject>,
    samplers: Vec<SamplerHandle>,
    images: Vec<GpuImage>,
    uniforms: Vec<StaticUniformBuffer>,
}

impl PassObjects {
    pub fn render_pass(
        &mut self,
        device: &mut dyn GpuDevice,
        desc: &PassDescriptor,
    ) -> BackendResult<RenderPassHandle> {
        desc.validate()?;
        let render_pass = device.create_render_pass(desc)?;
        self.render_passes.push(render_pass);
        Ok(render_pass)
    }

    pub fn framebuffer(
        &mut self,
        device: &mut dyn GpuDevice,
        render_pass: RenderPassHandle,
        attachments: Vec<ImageViewHandle>,
        extent: Extent2D,
    ) -> BackendResult<FramebufferHandle> {
        let framebuffer = device.create_framebuffer(&FramebufferDescriptor {
            render_pass,
            attachments,
            extent,
        })?;
        self.framebuffers.push(framebuffer);
        Ok(framebuffer)
    }

    pub fn pipeline(
        &mut self,
        device: &mut dyn GpuDevice,
        shaders: &ShaderLibrary,
        desc: &PipelineDesc,
    ) -> BackendResult<PipelineObject> {
        let pipeline = PipelineObject::create(device, shaders, desc)?;
        self.pipelines.push(pipeline.clone());
        Ok(pipeline)
    }

    pub fn sampler(
        &mut self,
        device: &mut dyn GpuDevice,
        desc: &SamplerDescriptor,
    ) -> BackendResult<SamplerHandle> {
        let sampler = device.create_sampler(desc)?;
        self.samplers.push(sampler);
        Ok(sampler)
    }

    /// Image private to the pass (not published to the resource table)
    pub fn image(
        &mut self,
        device: &mut dyn GpuDevice,
        allocator: &mut ResourceAllocator,
        request: &ImageRequest,
    ) -> BackendResult<GpuImage> {
        let image = allocator.create_image(device, request)?;
        self.images.push(image.clone());
        Ok(image)
    }

    /// Static uniform filled with `bytes`
    pub fn uniform(
        &mut self,
        device: &mut dyn GpuDevice,
        allocator: &mut ResourceAllocator,
        name: &str,
        bytes: &[u8],
    ) -> BackendResult<&StaticUniformBuffer> {
        let uniform = StaticUniformBuffer::with_contents(device, allocator, name, bytes)?;
        self.uniforms.push(uniform);
        Ok(&self.uniforms[self.uniforms.len() - 1])
    }

    pub fn is_empty(&self) -> bool {
        self.render_passes.is_empty()
            && self.framebuffers.is_empty()
            && self.pipelines.is_empty()
            && self.samplers.is_empty()
            && self.images.is_empty()
            && self.uniforms.is_empty()
    }

    /// Destroy everything, dependents first. The device must be idle.
    pub fn release(&mut self, device: &mut dyn GpuDevice, allocator: &mut ResourceAllocator) {
        for pipeline in self.pipelines.drain(..).rev() {
            pipeline.destroy(device);
        }
        for framebuffer in self.framebuffers.drain(..).rev() {
            device.destroy_framebuffer(framebuffer);
        }
        for render_pass in self.render_passes.drain(..).rev() {
            device.destroy_render_pass(render_pass);
        }
        for sampler in self.samplers.drain(..) {
            device.destroy_sampler(sampler);
        }
        for uniform in self.uniforms.drain(..) {
            uniform.destroy(device, allocator);
        }
        for image in self.images.drain(..) {
            allocator.destroy(device, image);
        }
    }
}

/// Context for recording one frame
///
/// The overlay is borrowed for its own lifetime `'o`, independent of the
/// renderer state borrowed for `'a`.
pub struct RecordContext<'a, 'o> {
    pub device: &'a mut dyn GpuDevice,
    pub cmd: CommandBufferHandle,
    pub slot: SlotIndex,
    pub image: ImageIndex,
    pub swapchain: &'a SwapchainState,
    pub scene: &'a Scene,
    /// CPU copy of the camera data written to this slot's uniform
    pub camera: &'a CameraUniform,
    pub overlay: Option<&'o mut dyn OverlayRecorder>,
}

/// Context for releasing a pass's objects. The device is idle.
pub struct PassTeardownContext<'a> {
    pub id: PassId,
    pub device: &'a mut dyn GpuDevice,
    pub allocator: &'a mut ResourceAllocator,
    pub resources: &'a mut ResourceTable,
}

impl<'a> PassTeardownContext<'a> {
    /// Release a pass's objects and the shared images it published.
    pub fn release(&mut self, objects: &mut PassObjects) {
        objects.release(&mut *self.device, &mut *self.allocator);
        for image in self.resources.release_owned(self.id) {
            self.allocator.destroy(&mut *self.device, image);
        }
    }
}

/// A statically declared stage of a render graph
pub trait RenderPass {
    /// Get the pass name for debugging
    fn name(&self) -> &str;

    /// Declare shared resources read/written and descriptor bindings.
    /// Called once when the pass is added to a graph.
    fn declare(&self, io: &mut PassIo);

    /// Create the render pass object, framebuffers, pipelines, images and
    /// descriptor sets for the current swapchain.
    fn create(&mut self, ctx: &mut PassBuildContext) -> BackendResult<()>;

    /// Record bind/draw commands for one frame.
    fn record(&mut self, ctx: &mut RecordContext) -> BackendResult<()>;

    /// Release everything `create` made.
    fn destroy(&mut self, ctx: &mut PassTeardownContext);

    /// Allow downcasting
    fn as_any(&self) -> &dyn Any;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_subpass() -> PassDescriptor {
        PassDescriptor {
            label: "test".into(),
            attachments: vec![
                AttachmentDescription::color(
                    Format::Rgba8Unorm,
                    LoadOp::Clear,
                    StoreOp::DontCare,
                    ImageLayout::Undefined,
                    ImageLayout::ColorAttachment,
                ),
                AttachmentDescription::color(
                    Format::Bgra8Srgb,
                    LoadOp::Clear,
                    StoreOp::Store,
                    ImageLayout::Undefined,
                    ImageLayout::PresentSrc,
                ),
            ],
            subpasses: vec![
                SubpassDescription {
                    color_attachments: vec![AttachmentRef::color(0)],
                    ..Default::default()
                },
                SubpassDescription {
                    input_attachments: vec![AttachmentRef::input(0)],
                    color_attachments: vec![AttachmentRef::color(1)],
                    ..Default::default()
                },
            ],
            dependencies: vec![SubpassDependency {
                src_subpass: 0,
                dst_subpass: 1,
                src_stages: PipelineStages::COLOR_ATTACHMENT_OUTPUT,
                dst_stages: PipelineStages::FRAGMENT_SHADER,
                src_access: AccessFlags::COLOR_ATTACHMENT_WRITE,
                dst_access: AccessFlags::INPUT_ATTACHMENT_READ,
                by_region: true,
            }],
        }
    }

    #[test]
    fn test_valid_descriptor() {
        assert!(two_subpass().validate().is_ok());
    }

    #[test]
    fn test_required_usage_collects_roles() {
        let desc = two_subpass();
        assert_eq!(
            desc.required_usage(0),
            ImageUsage::COLOR_ATTACHMENT | ImageUsage::INPUT_ATTACHMENT
        );
        assert_eq!(desc.required_usage(1), ImageUsage::COLOR_ATTACHMENT);
    }

    #[test]
    fn test_out_of_range_reference_rejected() {
        let mut desc = two_subpass();
        desc.subpasses[1].input_attachments.push(AttachmentRef::input(5));
        assert!(desc.validate().is_err());
    }

    #[test]
    fn test_read_write_same_attachment_rejected() {
        let mut desc = two_subpass();
        desc.subpasses[1].input_attachments.push(AttachmentRef::input(1));
        assert!(desc.validate().is_err());
    }

    #[test]
    fn test_backward_dependency_rejected() {
        let mut desc = two_subpass();
        desc.dependencies[0].src_subpass = 1;
        desc.dependencies[0].dst_subpass = 0;
        assert!(desc.validate().is_err());
    }
}
