//! Forward pass rendering the scene once per virtual camera
//!
//! Every camera renders into its own layer of one image array through a
//! per-layer framebuffer. Each camera's `proj * T(offset) * view` is built
//! on the CPU from the frame's camera data and pushed together with the
//! camera index; the static offset table stays bound for shading.

use super::{FORWARD_PROGRAM, VIEWS};
use crate::backend::traits::*;
use crate::backend::types::*;
use crate::camera::{offset_view_projection, CameraOffsets, CameraUniform, LIGHTFIELD_VIEWS};
use crate::descriptor::{BindingResource, BoundSet};
use crate::render_graph::*;
use crate::resources::{ImageRequest, MeshTag};
use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use std::any::Any;

pub const CAMERA_SET: u32 = 0;
pub const OFFSETS_SET: u32 = 1;

const DEPTH_FORMAT: Format = Format::Depth32Float;

/// Per-draw push constants of the forward pass
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, PartialEq)]
pub struct ForwardPushConstants {
    /// View-projection of this camera, offset in view space
    pub view_proj: Mat4,
    pub camera: u32,
    pub _pad: [u32; 3],
}

impl ForwardPushConstants {
    pub fn for_camera(data: &CameraUniform, offsets: &CameraOffsets, camera: usize) -> Self {
        Self {
            view_proj: offset_view_projection(data.view, data.proj, offsets.offset(camera)),
            camera: camera as u32,
            _pad: [0; 3],
        }
    }
}

pub fn forward_pass_descriptor(view_format: Format) -> PassDescriptor {
    PassDescriptor {
        label: "lightfield.forward".into(),
        attachments: vec![
            AttachmentDescription::color(
                view_format,
                LoadOp::Clear,
                StoreOp::Store,
                ImageLayout::Undefined,
                ImageLayout::ShaderReadOnly,
            ),
            AttachmentDescription::transient_depth(DEPTH_FORMAT),
        ],
        subpasses: vec![SubpassDescription {
            color_attachments: vec![AttachmentRef::color(0)],
            depth_attachment: Some(AttachmentRef::depth(1)),
            ..Default::default()
        }],
        dependencies: vec![
            SubpassDependency {
                src_subpass: SUBPASS_EXTERNAL,
                dst_subpass: 0,
                // The depth image is shared by all camera layers, so the
                // previous layer's depth writes must land before this one clears.
                src_stages: PipelineStages::FRAGMENT_SHADER
                    | PipelineStages::EARLY_FRAGMENT_TESTS
                    | PipelineStages::LATE_FRAGMENT_TESTS,
                dst_stages: PipelineStages::COLOR_ATTACHMENT_OUTPUT
                    | PipelineStages::EARLY_FRAGMENT_TESTS
                    | PipelineStages::LATE_FRAGMENT_TESTS,
                src_access: AccessFlags::SHADER_READ
                    | AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                dst_access: AccessFlags::COLOR_ATTACHMENT_WRITE
                    | AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                by_region: false,
            },
            SubpassDependency {
                src_subpass: 0,
                dst_subpass: SUBPASS_EXTERNAL,
                src_stages: PipelineStages::COLOR_ATTACHMENT_OUTPUT,
                dst_stages: PipelineStages::FRAGMENT_SHADER,
                src_access: AccessFlags::COLOR_ATTACHMENT_WRITE,
                dst_access: AccessFlags::SHADER_READ | AccessFlags::INPUT_ATTACHMENT_READ,
                by_region: false,
            },
        ],
    }
}

struct ForwardObjects {
    render_pass: RenderPassHandle,
    /// One per camera, each targeting one layer
    framebuffers: Vec<FramebufferHandle>,
    pipeline: PipelineObject,
    camera_set: BoundSet,
    offsets_set: BoundSet,
    extent: Extent2D,
}

pub struct ForwardPass {
    view_format: Format,
    offsets: CameraOffsets,
    objects: PassObjects,
    built: Option<ForwardObjects>,
}

impl ForwardPass {
    pub fn new(view_format: Format, baseline: f32) -> Self {
        Self {
            view_format,
            offsets: CameraOffsets::from_grid(baseline),
            objects: PassObjects::default(),
            built: None,
        }
    }

    pub fn offsets(&self) -> &CameraOffsets {
        &self.offsets
    }

    pub fn layer_count(&self) -> u32 {
        LIGHTFIELD_VIEWS as u32
    }

    fn build(&mut self, ctx: &mut PassBuildContext) -> BackendResult<ForwardObjects> {
        let extent = ctx.swapchain.extent;
        let render_pass = self
            .objects
            .render_pass(ctx.device, &forward_pass_descriptor(self.view_format))?;

        let views = ctx.share_new_image(
            VIEWS,
            ImageRequest::new(
                VIEWS,
                self.view_format,
                extent,
                ImageUsage::COLOR_ATTACHMENT
                    | ImageUsage::SAMPLED
                    | ImageUsage::INPUT_ATTACHMENT
                    | ImageUsage::TRANSFER_SRC,
            )
            .with_layers(LIGHTFIELD_VIEWS as u32, true),
            ImageLayout::ShaderReadOnly,
        )?;
        // Cleared at the start of every camera's pass, so one is enough.
        let depth = self.objects.image(
            ctx.device,
            ctx.allocator,
            &ImageRequest::new(
                "lightfield.depth",
                DEPTH_FORMAT,
                extent,
                ImageUsage::DEPTH_STENCIL_ATTACHMENT | ImageUsage::TRANSIENT_ATTACHMENT,
            ),
        )?;

        let mut framebuffers = Vec::with_capacity(LIGHTFIELD_VIEWS);
        for layer in 0..LIGHTFIELD_VIEWS as u32 {
            let view = views.layer_view(layer).ok_or_else(|| {
                BackendError::ResourceNotFound(format!("{} layer {} view", VIEWS, layer))
            })?;
            framebuffers.push(self.objects.framebuffer(
                ctx.device,
                render_pass,
                vec![view, depth.view],
                extent,
            )?);
        }

        let camera = ctx.camera;
        let camera_set = ctx.bind(CAMERA_SET, &[BindingResource::Uniform(camera)])?;
        let offsets = self.objects.uniform(
            ctx.device,
            ctx.allocator,
            "lightfield.offsets",
            bytemuck::bytes_of(&self.offsets),
        )?;
        let offsets_set = ctx.bind(OFFSETS_SET, &[BindingResource::Uniform(offsets)])?;

        let layouts = ctx.set_layouts()?;
        let pipeline = self.objects.pipeline(
            ctx.device,
            ctx.shaders,
            &PipelineDesc::new("lightfield.forward", FORWARD_PROGRAM, render_pass, 0, extent)
                .with_vertex_layout(Vertex::layout())
                .with_depth_test(CompareFunction::Less, true)
                .with_set_layouts(layouts)
                .with_push_constants(
                    ShaderStages::ALL_GRAPHICS,
                    std::mem::size_of::<ForwardPushConstants>() as u32,
                ),
        )?;

        Ok(ForwardObjects {
            render_pass,
            framebuffers,
            pipeline,
            camera_set,
            offsets_set,
            extent,
        })
    }
}

impl RenderPass for ForwardPass {
    fn name(&self) -> &str {
        "lightfield.forward"
    }

    fn declare(&self, io: &mut PassIo) {
        io.write(VIEWS);
        io.binding(
            CAMERA_SET,
            0,
            DescriptorType::UniformBuffer,
            ShaderStages::ALL_GRAPHICS,
        );
        io.binding(
            OFFSETS_SET,
            0,
            DescriptorType::UniformBuffer,
            ShaderStages::VERTEX,
        );
    }

    fn create(&mut self, ctx: &mut PassBuildContext) -> BackendResult<()> {
        let built = self.build(ctx)?;
        self.built = Some(built);
        Ok(())
    }

    fn record(&mut self, ctx: &mut RecordContext) -> BackendResult<()> {
        let built = self.built.as_ref().ok_or_else(|| {
            BackendError::CommandRecordingFailed("forward pass recorded before create".into())
        })?;
        let cmd = ctx.cmd;
        let sets = [
            built.camera_set.select(ctx.slot),
            built.offsets_set.select(ctx.slot),
        ];

        for (camera, framebuffer) in built.framebuffers.iter().enumerate() {
            ctx.device.cmd_begin_render_pass(
                cmd,
                &RenderPassBegin {
                    render_pass: built.render_pass,
                    framebuffer: *framebuffer,
                    extent: built.extent,
                    clear_values: vec![ClearValue::TRANSPARENT, ClearValue::DEPTH_ONE],
                },
            );
            built.pipeline.bind(ctx.device, cmd);
            built.pipeline.bind_sets(ctx.device, cmd, 0, &sets);
            let push = ForwardPushConstants::for_camera(ctx.camera, &self.offsets, camera);
            built.pipeline.push_constants(
                ctx.device,
                cmd,
                ShaderStages::ALL_GRAPHICS,
                bytemuck::bytes_of(&push),
            );
            for mesh in ctx.scene.tagged(MeshTag::Lightfield) {
                mesh.draw(ctx.device, cmd);
            }
            ctx.device.cmd_end_render_pass(cmd);
        }
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
        let desc = forward_pass_descriptor(Format::Rgba8Unorm);
        assert!(desc.validate().is_ok());
        assert_eq!(desc.attachments[0].final_layout, ImageLayout::ShaderReadOnly);
    }

    #[test]
    fn test_depth_writes_ordered_between_cameras() {
        let desc = forward_pass_descriptor(Format::Rgba8Unorm);
        let incoming = desc
            .dependencies
            .iter()
            .find(|d| d.src_subpass == SUBPASS_EXTERNAL && d.dst_subpass == 0)
            .expect("incoming dependency");
        assert!(incoming.src_stages.contains(PipelineStages::LATE_FRAGMENT_TESTS));
        assert!(incoming.src_access.contains(AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE));
        assert!(incoming.dst_stages.contains(PipelineStages::EARLY_FRAGMENT_TESTS));
        assert!(incoming.dst_access.contains(AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE));
    }

    #[test]
    fn test_push_constants_carry_offset_camera() {
        let camera = crate::camera::Camera::default();
        let data = camera.uniform_data();
        let offsets = CameraOffsets::from_grid(0.5);

        let center = ForwardPushConstants::for_camera(&data, &offsets, 4);
        assert_eq!(center.camera, 4);
        assert!(center.view_proj.abs_diff_eq(data.view_proj, 1e-6));

        let corner = ForwardPushConstants::for_camera(&data, &offsets, 0);
        let shift = Mat4::from_translation(glam::Vec3::new(-0.5, -0.5, 0.0));
        let expected = data.proj * shift * data.view;
        assert!(corner.view_proj.abs_diff_eq(expected, 1e-6));
        assert_eq!(std::mem::size_of::<ForwardPushConstants>(), 80);
    }

    #[test]
    fn test_offsets_follow_baseline() {
        let pass = ForwardPass::new(Format::Rgba8Unorm, 0.5);
        assert_eq!(pass.offsets().offset(0), glam::Vec2::new(-0.5, -0.5));
        assert_eq!(pass.offsets().offset(4), glam::Vec2::ZERO);
        assert_eq!(pass.layer_count(), 9);
    }
}
