//! Image gradients of the reference view

use super::{GRADIENTS, GRADIENTS_PROGRAM, VIEWS};
use crate::backend::traits::*;
use crate::backend::types::*;
use crate::descriptor::{BindingResource, BoundSet};
use crate::render_graph::*;
use crate::resources::ImageRequest;
use bytemuck::{Pod, Zeroable};
use std::any::Any;

pub const GRADIENT_FORMAT: Format = Format::R32Float;

/// Filter the gradients shader applies, passed as a push constant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum GradientMode {
    /// Copy the reference luminance unfiltered
    Passthrough = 0,
    Horizontal = 1,
    Vertical = 2,
    #[default]
    Magnitude = 3,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, PartialEq, Eq)]
pub struct GradientPushConstants {
    pub mode: u32,
    pub layer: u32,
}

pub fn gradients_pass_descriptor() -> PassDescriptor {
    PassDescriptor {
        label: "lightfield.gradients".into(),
        attachments: vec![AttachmentDescription::color(
            GRADIENT_FORMAT,
            LoadOp::Clear,
            StoreOp::Store,
            ImageLayout::Undefined,
            ImageLayout::ShaderReadOnly,
        )],
        subpasses: vec![SubpassDescription {
            color_attachments: vec![AttachmentRef::color(0)],
            ..Default::default()
        }],
        dependencies: vec![
            SubpassDependency {
                src_subpass: SUBPASS_EXTERNAL,
                dst_subpass: 0,
                src_stages: PipelineStages::FRAGMENT_SHADER
                    | PipelineStages::COLOR_ATTACHMENT_OUTPUT,
                dst_stages: PipelineStages::COLOR_ATTACHMENT_OUTPUT,
                src_access: AccessFlags::SHADER_READ | AccessFlags::COLOR_ATTACHMENT_WRITE,
                dst_access: AccessFlags::COLOR_ATTACHMENT_WRITE,
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

struct GradientsObjects {
    render_pass: RenderPassHandle,
    framebuffer: FramebufferHandle,
    pipeline: PipelineObject,
    source_set: BoundSet,
    extent: Extent2D,
}

/// Full-screen pass writing a float gradient map of one forward layer
pub struct GradientsPass {
    mode: GradientMode,
    reference_layer: u32,
    objects: PassObjects,
    built: Option<GradientsObjects>,
}

impl GradientsPass {
    pub fn new(mode: GradientMode, reference_layer: u32) -> Self {
        Self {
            mode,
            reference_layer,
            objects: PassObjects::default(),
            built: None,
        }
    }

    pub fn push_constants(&self) -> GradientPushConstants {
        GradientPushConstants {
            mode: self.mode as u32,
            layer: self.reference_layer,
        }
    }

    fn build(&mut self, ctx: &mut PassBuildContext) -> BackendResult<GradientsObjects> {
        let views = ctx.shared(VIEWS)?;
        let source = views.layer_view(self.reference_layer).ok_or_else(|| {
            BackendError::ResourceNotFound(format!(
                "{} layer {} of {}",
                VIEWS, self.reference_layer, views.array_layers
            ))
        })?;
        let extent = views.extent;

        let render_pass = self
            .objects
            .render_pass(ctx.device, &gradients_pass_descriptor())?;
        let output = ctx.share_new_image(
            GRADIENTS,
            ImageRequest::new(
                GRADIENTS,
                GRADIENT_FORMAT,
                extent,
                ImageUsage::COLOR_ATTACHMENT
                    | ImageUsage::SAMPLED
                    | ImageUsage::INPUT_ATTACHMENT
                    | ImageUsage::TRANSFER_SRC,
            ),
            ImageLayout::ShaderReadOnly,
        )?;
        let framebuffer =
            self.objects
                .framebuffer(ctx.device, render_pass, vec![output.view], extent)?;

        let sampler = self.objects.sampler(
            ctx.device,
            &SamplerDescriptor {
                label: Some("lightfield.gradients".into()),
                filter: FilterMode::Nearest,
                address_mode: AddressMode::ClampToEdge,
            },
        )?;
        let source_set = ctx.bind(
            0,
            &[BindingResource::SampledImage {
                view: source,
                sampler,
            }],
        )?;

        let layouts = ctx.set_layouts()?;
        let pipeline = self.objects.pipeline(
            ctx.device,
            ctx.shaders,
            &PipelineDesc::new(
                "lightfield.gradients",
                GRADIENTS_PROGRAM,
                render_pass,
                0,
                extent,
            )
            .with_set_layouts(layouts)
            .with_push_constants(
                ShaderStages::FRAGMENT,
                std::mem::size_of::<GradientPushConstants>() as u32,
            ),
        )?;

        Ok(GradientsObjects {
            render_pass,
            framebuffer,
            pipeline,
            source_set,
            extent,
        })
    }
}

impl RenderPass for GradientsPass {
    fn name(&self) -> &str {
        "lightfield.gradients"
    }

    fn declare(&self, io: &mut PassIo) {
        io.read(VIEWS);
        io.write(GRADIENTS);
        io.binding(
            0,
            0,
            DescriptorType::CombinedImageSampler,
            ShaderStages::FRAGMENT,
        );
    }

    fn create(&mut self, ctx: &mut PassBuildContext) -> BackendResult<()> {
        let built = self.build(ctx)?;
        self.built = Some(built);
        Ok(())
    }

    fn record(&mut self, ctx: &mut RecordContext) -> BackendResult<()> {
        let push = self.push_constants();
        let built = self.built.as_ref().ok_or_else(|| {
            BackendError::CommandRecordingFailed("gradients pass recorded before create".into())
        })?;
        let cmd = ctx.cmd;

        ctx.device.cmd_begin_render_pass(
            cmd,
            &RenderPassBegin {
                render_pass: built.render_pass,
                framebuffer: built.framebuffer,
                extent: built.extent,
                clear_values: vec![ClearValue::TRANSPARENT],
            },
        );
        built.pipeline.bind(ctx.device, cmd);
        built
            .pipeline
            .bind_sets(ctx.device, cmd, 0, &[built.source_set.select(ctx.slot)]);
        built.pipeline.push_constants(
            ctx.device,
            cmd,
            ShaderStages::FRAGMENT,
            bytemuck::bytes_of(&push),
        );
        ctx.device.cmd_draw(cmd, 3, 1);
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
    fn test_push_constant_layout() {
        let pass = GradientsPass::new(GradientMode::Vertical, 4);
        let push = pass.push_constants();
        assert_eq!(bytemuck::bytes_of(&push), &[2, 0, 0, 0, 4, 0, 0, 0]);
    }

    #[test]
    fn test_descriptor_writes_float_map() {
        let desc = gradients_pass_descriptor();
        assert!(desc.validate().is_ok());
        assert_eq!(desc.attachments[0].format, Format::R32Float);
    }

    #[test]
    fn test_external_dependency_guards_previous_frame() {
        let desc = gradients_pass_descriptor();
        assert!(desc.validate().is_ok());
        let incoming = desc
            .dependencies
            .iter()
            .find(|d| d.src_subpass == SUBPASS_EXTERNAL && d.dst_subpass == 0)
            .expect("incoming dependency");
        assert!(incoming.src_stages.contains(PipelineStages::FRAGMENT_SHADER));
        assert!(incoming.src_access.contains(AccessFlags::SHADER_READ));
        assert!(incoming.dst_access.contains(AccessFlags::COLOR_ATTACHMENT_WRITE));
    }
}
