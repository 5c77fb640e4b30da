//! Deferred shading in one render pass
//!
//! ```text
//! subpass 0 "geometry"                 subpass 1 "lighting"
//!   meshes ──► position  (RGBA32F) ──┐
//!          ──► albedo    (RGBA8 sRGB)├─► input attachments ──► composite
//!          ──► normal    (RGBA8 snorm)┘   full-screen triangle  (swapchain)
//!          ──► depth/stencil
//! ```
//!
//! The lighting subpass reads the G-buffer through input attachments, so
//! each fragment only sees the G-buffer texel at its own position and the
//! dependency between the subpasses is region-local.

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::descriptor::{BindingResource, BoundSet};
use crate::render_graph::*;
use crate::resources::{ImageRequest, MeshTag};
use bytemuck::{Pod, Zeroable};
use glam::Vec4;
use std::any::Any;

pub const GEOMETRY_PROGRAM: &str = "deferred.geometry";
pub const LIGHTING_PROGRAM: &str = "deferred.lighting";

pub const POSITION_FORMAT: Format = Format::Rgba32Float;
pub const ALBEDO_FORMAT: Format = Format::Rgba8Srgb;
pub const NORMAL_FORMAT: Format = Format::Rgba8Snorm;
pub const DEPTH_FORMAT: Format = Format::Depth32FloatStencil8;

pub const GBUFFER_POSITION: &str = "gbuffer.position";
pub const GBUFFER_ALBEDO: &str = "gbuffer.albedo";
pub const GBUFFER_NORMAL: &str = "gbuffer.normal";

/// Descriptor sets declared by the pass
pub const CAMERA_SET: u32 = 0;
pub const GBUFFER_SET: u32 = 1;
pub const LIGHT_SET: u32 = 2;

const POSITION: u32 = 0;
const ALBEDO: u32 = 1;
const NORMAL: u32 = 2;
const DEPTH: u32 = 3;
const COMPOSITE: u32 = 4;

/// Directional light read by the lighting subpass
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, PartialEq)]
pub struct LightUniform {
    /// Direction the light travels, `w` unused
    pub direction: Vec4,
    /// Linear color, `w` is intensity
    pub color: Vec4,
    /// Ambient term added to every lit texel
    pub ambient: Vec4,
}

impl Default for LightUniform {
    fn default() -> Self {
        Self {
            direction: Vec4::new(-0.3, -0.5, -1.0, 0.0),
            color: Vec4::new(1.0, 1.0, 1.0, 1.0),
            ambient: Vec4::new(0.05, 0.05, 0.05, 0.0),
        }
    }
}

/// Render pass object for the geometry + lighting subpasses.
pub fn deferred_pass_descriptor(swapchain_format: Format) -> PassDescriptor {
    let gbuffer = |format| {
        AttachmentDescription::color(
            format,
            LoadOp::Clear,
            StoreOp::Store,
            ImageLayout::Undefined,
            ImageLayout::ColorAttachment,
        )
    };

    PassDescriptor {
        label: "deferred".into(),
        attachments: vec![
            gbuffer(POSITION_FORMAT),
            gbuffer(ALBEDO_FORMAT),
            gbuffer(NORMAL_FORMAT),
            AttachmentDescription::transient_depth(DEPTH_FORMAT),
            AttachmentDescription::color(
                swapchain_format,
                LoadOp::Clear,
                StoreOp::Store,
                ImageLayout::Undefined,
                ImageLayout::PresentSrc,
            ),
        ],
        subpasses: vec![
            SubpassDescription {
                color_attachments: vec![
                    AttachmentRef::color(POSITION),
                    AttachmentRef::color(ALBEDO),
                    AttachmentRef::color(NORMAL),
                ],
                depth_attachment: Some(AttachmentRef::depth(DEPTH)),
                ..Default::default()
            },
            SubpassDescription {
                input_attachments: vec![
                    AttachmentRef::input(POSITION),
                    AttachmentRef::input(ALBEDO),
                    AttachmentRef::input(NORMAL),
                ],
                color_attachments: vec![AttachmentRef::color(COMPOSITE)],
                ..Default::default()
            },
        ],
        dependencies: vec![
            // Waits for the acquired image before any attachment write.
            SubpassDependency {
                src_subpass: SUBPASS_EXTERNAL,
                dst_subpass: 0,
                src_stages: PipelineStages::COLOR_ATTACHMENT_OUTPUT
                    | PipelineStages::EARLY_FRAGMENT_TESTS,
                dst_stages: PipelineStages::COLOR_ATTACHMENT_OUTPUT
                    | PipelineStages::EARLY_FRAGMENT_TESTS,
                src_access: AccessFlags::empty(),
                dst_access: AccessFlags::COLOR_ATTACHMENT_WRITE
                    | AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                by_region: false,
            },
            SubpassDependency {
                src_subpass: 0,
                dst_subpass: 1,
                src_stages: PipelineStages::COLOR_ATTACHMENT_OUTPUT
                    | PipelineStages::EARLY_FRAGMENT_TESTS,
                dst_stages: PipelineStages::COLOR_ATTACHMENT_OUTPUT
                    | PipelineStages::FRAGMENT_SHADER,
                src_access: AccessFlags::COLOR_ATTACHMENT_WRITE
                    | AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                dst_access: AccessFlags::COLOR_ATTACHMENT_READ
                    | AccessFlags::INPUT_ATTACHMENT_READ,
                by_region: true,
            },
        ],
    }
}

struct DeferredObjects {
    render_pass: RenderPassHandle,
    framebuffers: Vec<FramebufferHandle>,
    geometry: PipelineObject,
    lighting: PipelineObject,
    camera_set: BoundSet,
    gbuffer_set: BoundSet,
    light_set: BoundSet,
    extent: Extent2D,
}

/// Geometry and lighting subpasses writing straight into the swapchain image
pub struct DeferredPass {
    light: LightUniform,
    objects: PassObjects,
    built: Option<DeferredObjects>,
}

impl DeferredPass {
    pub fn new(light: LightUniform) -> Self {
        Self {
            light,
            objects: PassObjects::default(),
            built: None,
        }
    }

    pub fn light(&self) -> &LightUniform {
        &self.light
    }

    pub fn render_pass(&self) -> Option<RenderPassHandle> {
        self.built.as_ref().map(|b| b.render_pass)
    }

    pub fn framebuffer_count(&self) -> usize {
        self.built.as_ref().map_or(0, |b| b.framebuffers.len())
    }

    /// Camera set bound for each ring slot
    pub fn camera_set(&self) -> Option<&BoundSet> {
        self.built.as_ref().map(|b| &b.camera_set)
    }

    fn build(&mut self, ctx: &mut PassBuildContext) -> BackendResult<DeferredObjects> {
        let extent = ctx.swapchain.extent;
        let desc = deferred_pass_descriptor(ctx.swapchain.format());
        let render_pass = self.objects.render_pass(ctx.device, &desc)?;

        let gbuffer_usage =
            ImageUsage::COLOR_ATTACHMENT | ImageUsage::INPUT_ATTACHMENT | ImageUsage::TRANSFER_SRC;
        let mut gbuffer = Vec::with_capacity(3);
        for (name, format) in [
            (GBUFFER_POSITION, POSITION_FORMAT),
            (GBUFFER_ALBEDO, ALBEDO_FORMAT),
            (GBUFFER_NORMAL, NORMAL_FORMAT),
        ] {
            gbuffer.push(ctx.share_new_image(
                name,
                ImageRequest::new(name, format, extent, gbuffer_usage),
                ImageLayout::ColorAttachment,
            )?);
        }
        let depth = self.objects.image(
            ctx.device,
            ctx.allocator,
            &ImageRequest::new(
                "gbuffer.depth",
                DEPTH_FORMAT,
                extent,
                ImageUsage::DEPTH_STENCIL_ATTACHMENT | ImageUsage::TRANSIENT_ATTACHMENT,
            ),
        )?;

        let mut framebuffers = Vec::with_capacity(ctx.swapchain.views.len());
        for view in &ctx.swapchain.views {
            let attachments = vec![
                gbuffer[0].view,
                gbuffer[1].view,
                gbuffer[2].view,
                depth.view,
                *view,
            ];
            framebuffers.push(self.objects.framebuffer(
                ctx.device,
                render_pass,
                attachments,
                extent,
            )?);
        }

        let camera = ctx.camera;
        let camera_set = ctx.bind(CAMERA_SET, &[BindingResource::Uniform(camera)])?;
        let gbuffer_set = ctx.bind(
            GBUFFER_SET,
            &[
                BindingResource::InputAttachment {
                    view: gbuffer[0].view,
                },
                BindingResource::InputAttachment {
                    view: gbuffer[1].view,
                },
                BindingResource::InputAttachment {
                    view: gbuffer[2].view,
                },
            ],
        )?;
        let light = self.objects.uniform(
            ctx.device,
            ctx.allocator,
            "deferred.light",
            bytemuck::bytes_of(&self.light),
        )?;
        let light_set = ctx.bind(LIGHT_SET, &[BindingResource::Uniform(light)])?;

        let camera_layout = ctx.set_layout(CAMERA_SET)?;
        let all_layouts = ctx.set_layouts()?;
        let geometry = self.objects.pipeline(
            ctx.device,
            ctx.shaders,
            &PipelineDesc::new("deferred.geometry", GEOMETRY_PROGRAM, render_pass, 0, extent)
                .with_vertex_layout(Vertex::layout())
                .with_depth_test(CompareFunction::Less, true)
                .with_color_attachments(3)
                .with_set_layouts(vec![camera_layout]),
        )?;
        let lighting = self.objects.pipeline(
            ctx.device,
            ctx.shaders,
            &PipelineDesc::new("deferred.lighting", LIGHTING_PROGRAM, render_pass, 1, extent)
                .with_set_layouts(all_layouts),
        )?;

        Ok(DeferredObjects {
            render_pass,
            framebuffers,
            geometry,
            lighting,
            camera_set,
            gbuffer_set,
            light_set,
            extent,
        })
    }
}

impl Default for DeferredPass {
    fn default() -> Self {
        Self::new(LightUniform::default())
    }
}

impl RenderPass for DeferredPass {
    fn name(&self) -> &str {
        "deferred"
    }

    fn declare(&self, io: &mut PassIo) {
        io.write(GBUFFER_POSITION);
        io.write(GBUFFER_ALBEDO);
        io.write(GBUFFER_NORMAL);
        io.write(SWAPCHAIN_RESOURCE);

        io.binding(
            CAMERA_SET,
            0,
            DescriptorType::UniformBuffer,
            ShaderStages::ALL_GRAPHICS,
        );
        for binding in 0..3 {
            io.binding(
                GBUFFER_SET,
                binding,
                DescriptorType::InputAttachment,
                ShaderStages::FRAGMENT,
            );
        }
        io.binding(
            LIGHT_SET,
            0,
            DescriptorType::UniformBuffer,
            ShaderStages::FRAGMENT,
        );
    }

    fn create(&mut self, ctx: &mut PassBuildContext) -> BackendResult<()> {
        let built = self.build(ctx)?;
        self.built = Some(built);
        Ok(())
    }

    fn record(&mut self, ctx: &mut RecordContext) -> BackendResult<()> {
        let built = self.built.as_ref().ok_or_else(|| {
            BackendError::CommandRecordingFailed("deferred pass recorded before create".into())
        })?;
        let framebuffer = *built
            .framebuffers
            .get(ctx.image.0 as usize)
            .ok_or_else(|| {
                BackendError::CommandRecordingFailed(format!(
                    "no deferred framebuffer for swapchain image {}",
                    ctx.image.0
                ))
            })?;

        let cmd = ctx.cmd;
        ctx.device.cmd_begin_render_pass(
            cmd,
            &RenderPassBegin {
                render_pass: built.render_pass,
                framebuffer,
                extent: built.extent,
                clear_values: vec![
                    ClearValue::TRANSPARENT,
                    ClearValue::TRANSPARENT,
                    ClearValue::TRANSPARENT,
                    ClearValue::DEPTH_ONE,
                    ClearValue::BLACK,
                ],
            },
        );

        // Geometry
        built.geometry.bind(ctx.device, cmd);
        built
            .geometry
            .bind_sets(ctx.device, cmd, 0, &[built.camera_set.select(ctx.slot)]);
        for mesh in ctx.scene.tagged(MeshTag::Deferred) {
            mesh.draw(ctx.device, cmd);
        }

        ctx.device.cmd_next_subpass(cmd);

        // Lighting: full-screen triangle, no vertex buffer
        built.lighting.bind(ctx.device, cmd);
        built.lighting.bind_sets(
            ctx.device,
            cmd,
            0,
            &[
                built.camera_set.select(ctx.slot),
                built.gbuffer_set.select(ctx.slot),
                built.light_set.select(ctx.slot),
            ],
        );
        ctx.device.cmd_draw(cmd, 3, 1);

        if let Some(overlay) = ctx.overlay.as_mut() {
            overlay.record(&mut *ctx.device, cmd, built.extent);
        }

        ctx.device.cmd_end_render_pass(cmd);
        Ok(())
    }

    fn destroy(&mut self, ctx: &mut PassTeardownContext) {
        self.built = None;
        ctx.release(&mut self.objects);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_is_valid() {
        let desc = deferred_pass_descriptor(Format::Bgra8Srgb);
        assert!(desc.validate().is_ok());
        assert_eq!(desc.subpasses.len(), 2);
    }

    #[test]
    fn test_gbuffer_formats_are_distinct() {
        let desc = deferred_pass_descriptor(Format::Bgra8Srgb);
        let formats: Vec<Format> = desc.attachments[..3].iter().map(|a| a.format).collect();
        assert_eq!(formats, vec![POSITION_FORMAT, ALBEDO_FORMAT, NORMAL_FORMAT]);
        assert!(desc.attachments[DEPTH as usize].format.has_stencil());
        assert_eq!(
            desc.attachments[COMPOSITE as usize].final_layout,
            ImageLayout::PresentSrc
        );
    }

    #[test]
    fn test_gbuffer_needs_color_and_input_usage() {
        let desc = deferred_pass_descriptor(Format::Bgra8Srgb);
        for attachment in [POSITION, ALBEDO, NORMAL] {
            assert_eq!(
                desc.required_usage(attachment),
                ImageUsage::COLOR_ATTACHMENT | ImageUsage::INPUT_ATTACHMENT
            );
        }
    }

    #[test]
    fn test_geometry_to_lighting_dependency() {
        let desc = deferred_pass_descriptor(Format::Bgra8Srgb);
        let dep = desc
            .dependencies
            .iter()
            .find(|d| d.src_subpass == 0 && d.dst_subpass == 1)
            .unwrap();
        assert!(dep.by_region);
        assert!(dep.src_stages.contains(
            PipelineStages::COLOR_ATTACHMENT_OUTPUT | PipelineStages::EARLY_FRAGMENT_TESTS
        ));
        assert!(dep.dst_stages.contains(PipelineStages::COLOR_ATTACHMENT_OUTPUT));
        assert!(dep.dst_access.contains(AccessFlags::COLOR_ATTACHMENT_READ));
    }

    #[test]
    fn test_declares_three_sets() {
        let pass = DeferredPass::default();
        let mut io = PassIo::default();
        pass.declare(&mut io);
        assert_eq!(io.writes().len(), 4);
        let sets: Vec<u32> = io.bindings.iter().map(|(set, _)| *set).collect();
        assert_eq!(sets, vec![0, 1, 1, 1, 2]);
    }
}
