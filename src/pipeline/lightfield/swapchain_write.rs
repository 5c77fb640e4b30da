//! Final pass copying a lightfield image into the presentable image

use super::{PresentSource, SWAPCHAIN_WRITE_PROGRAM, VIEWS};
use crate::backend::traits::*;
use crate::backend::types::*;
use crate::descriptor::{BindingResource, BoundSet};
use crate::render_graph::*;
use std::any::Any;

const SOURCE: u32 = 0;
const TARGET: u32 = 1;

pub fn swapchain_write_descriptor(
    source_format: Format,
    swapchain_format: Format,
) -> PassDescriptor {
    PassDescriptor {
        label: "lightfield.swapchain_write".into(),
        attachments: vec![
            AttachmentDescription::color(
                source_format,
                LoadOp::Load,
                StoreOp::Store,
                ImageLayout::ShaderReadOnly,
                ImageLayout::ShaderReadOnly,
            ),
            AttachmentDescription::color(
                swapchain_format,
                LoadOp::Clear,
                StoreOp::Store,
                ImageLayout::Undefined,
                ImageLayout::PresentSrc,
            ),
        ],
        subpasses: vec![SubpassDescription {
            input_attachments: vec![AttachmentRef::input(SOURCE)],
            color_attachments: vec![AttachmentRef::color(TARGET)],
            ..Default::default()
        }],
        dependencies: vec![SubpassDependency {
            src_subpass: SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stages: PipelineStages::COLOR_ATTACHMENT_OUTPUT,
            dst_stages: PipelineStages::COLOR_ATTACHMENT_OUTPUT | PipelineStages::FRAGMENT_SHADER,
            src_access: AccessFlags::COLOR_ATTACHMENT_WRITE,
            dst_access: AccessFlags::COLOR_ATTACHMENT_WRITE | AccessFlags::INPUT_ATTACHMENT_READ,
            by_region: false,
        }],
    }
}

struct SwapchainWriteObjects {
    render_pass: RenderPassHandle,
    /// One per swapchain image
    framebuffers: Vec<FramebufferHandle>,
    pipeline: PipelineObject,
    source_set: BoundSet,
    extent: Extent2D,
}

/// Reads the source image as an input attachment, writes the acquired
/// swapchain image, then lets the overlay draw on top in the same subpass.
pub struct SwapchainWritePass {
    source: PresentSource,
    reference_layer: u32,
    objects: PassObjects,
    built: Option<SwapchainWriteObjects>,
}

impl SwapchainWritePass {
    pub fn new(source: PresentSource, reference_layer: u32) -> Self {
        Self {
            source,
            reference_layer,
            objects: PassObjects::default(),
            built: None,
        }
    }

    pub fn source(&self) -> PresentSource {
        self.source
    }

    fn build(&mut self, ctx: &mut PassBuildContext) -> BackendResult<SwapchainWriteObjects> {
        let source = ctx.shared(self.source.resource())?;
        let source_view = if self.source.resource() == VIEWS {
            source.layer_view(self.reference_layer).ok_or_else(|| {
                BackendError::ResourceNotFound(format!(
                    "{} layer {}",
                    VIEWS, self.reference_layer
                ))
            })?
        } else {
            source.view
        };
        let extent = ctx.swapchain.extent;
        if source.extent != extent {
            return Err(BackendError::Validation(format!(
                "'{}' is {:?}, swapchain is {:?}",
                source.name, source.extent, extent
            )));
        }

        let render_pass = self.objects.render_pass(
            ctx.device,
            &swapchain_write_descriptor(source.format, ctx.swapchain.format()),
        )?;
        let mut framebuffers = Vec::with_capacity(ctx.swapchain.views.len());
        for view in &ctx.swapchain.views {
            framebuffers.push(self.objects.framebuffer(
                ctx.device,
                render_pass,
                vec![source_view, *view],
                extent,
            )?);
        }

        let source_set = ctx.bind(0, &[BindingResource::InputAttachment { view: source_view }])?;
        let layouts = ctx.set_layouts()?;
        let pipeline = self.objects.pipeline(
            ctx.device,
            ctx.shaders,
            &PipelineDesc::new(
                "lightfield.swapchain_write",
                SWAPCHAIN_WRITE_PROGRAM,
                render_pass,
                0,
                extent,
            )
            .with_set_layouts(layouts),
        )?;

        Ok(SwapchainWriteObjects {
            render_pass,
            framebuffers,
            pipeline,
            source_set,
            extent,
        })
    }
}

impl RenderPass for SwapchainWritePass {
    fn name(&self) -> &str {
        "lightfield.swapchain_write"
    }

    fn declare(&self, io: &mut PassIo) {
        io.read(self.source.resource());
        io.write(SWAPCHAIN_RESOURCE);
        io.binding(
            0,
            0,
            DescriptorType::InputAttachment,
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
            BackendError::CommandRecordingFailed(
                "swapchain write pass recorded before create".into(),
            )
        })?;
        let framebuffer = *built
            .framebuffers
            .get(ctx.image.0 as usize)
            .ok_or_else(|| {
                BackendError::CommandRecordingFailed(format!(
                    "no framebuffer for swapchain image {}",
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
                clear_values: vec![ClearValue::BLACK, ClearValue::BLACK],
            },
        );
        built.pipeline.bind(ctx.device, cmd);
        built
            .pipeline
            .bind_sets(ctx.device, cmd, 0, &[built.source_set.select(ctx.slot)]);
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
    fn test_source_is_loaded_not_cleared() {
        let desc = swapchain_write_descriptor(Format::Rgba8Unorm, Format::Bgra8Srgb);
        assert!(desc.validate().is_ok());
        assert_eq!(desc.attachments[0].load_op, LoadOp::Load);
        assert_eq!(desc.attachments[1].final_layout, ImageLayout::PresentSrc);
        assert_eq!(desc.required_usage(0), ImageUsage::INPUT_ATTACHMENT);
    }

    #[test]
    fn test_reads_configured_source() {
        let pass = SwapchainWritePass::new(PresentSource::Gradients, 4);
        let mut io = PassIo::default();
        pass.declare(&mut io);
        assert_eq!(io.reads(), &[super::super::GRADIENTS.to_string()]);
    }
}
