//! Disparity estimation placeholder
//!
//! The pass exists so the graph has its final shape: it consumes the
//! gradient map and owns a same-resolution heat-map image that the
//! swapchain write pass can present. No estimation runs yet; the output is
//! cleared to opaque black every frame.

use super::{DISPARITY, GRADIENTS};
use crate::backend::traits::*;
use crate::backend::types::*;
use crate::render_graph::*;
use crate::resources::ImageRequest;
use std::any::Any;

pub const DISPARITY_FORMAT: Format = Format::Rgba8Unorm;

pub fn disparity_pass_descriptor() -> PassDescriptor {
    PassDescriptor {
        label: "lightfield.disparity".into(),
        attachments: vec![AttachmentDescription::color(
            DISPARITY_FORMAT,
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
                dst_access: AccessFlags::INPUT_ATTACHMENT_READ,
                by_region: false,
            },
        ],
    }
}

struct DisparityObjects {
    render_pass: RenderPassHandle,
    framebuffer: FramebufferHandle,
    extent: Extent2D,
}

pub struct DisparityPass {
    objects: PassObjects,
    built: Option<DisparityObjects>,
    warned: bool,
}

impl DisparityPass {
    pub fn new() -> Self {
        Self {
            objects: PassObjects::default(),
            built: None,
            warned: false,
        }
    }

    /// Whether the pass computes disparity. Always false for now.
    pub fn is_implemented(&self) -> bool {
        false
    }

    /// The estimation pipeline itself
    pub fn estimation_program(&self) -> BackendResult<&'static str> {
        Err(BackendError::NotImplemented("lightfield disparity estimation"))
    }

    fn build(&mut self, ctx: &mut PassBuildContext) -> BackendResult<DisparityObjects> {
        let gradients = ctx.shared(GRADIENTS)?;
        let extent = gradients.extent;

        let render_pass = self
            .objects
            .render_pass(ctx.device, &disparity_pass_descriptor())?;
        let output = ctx.share_new_image(
            DISPARITY,
            ImageRequest::new(
                DISPARITY,
                DISPARITY_FORMAT,
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

        Ok(DisparityObjects {
            render_pass,
            framebuffer,
            extent,
        })
    }
}

impl Default for DisparityPass {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderPass for DisparityPass {
    fn name(&self) -> &str {
        "lightfield.disparity"
    }

    fn declare(&self, io: &mut PassIo) {
        io.read(GRADIENTS);
        io.write(DISPARITY);
    }

    fn create(&mut self, ctx: &mut PassBuildContext) -> BackendResult<()> {
        if !self.warned {
            log::warn!("Disparity estimation is not implemented; output is cleared to black");
            self.warned = true;
        }
        let built = self.build(ctx)?;
        self.built = Some(built);
        Ok(())
    }

    fn record(&mut self, ctx: &mut RecordContext) -> BackendResult<()> {
        let built = self.built.as_ref().ok_or_else(|| {
            BackendError::CommandRecordingFailed("disparity pass recorded before create".into())
        })?;
        ctx.device.cmd_begin_render_pass(
            ctx.cmd,
            &RenderPassBegin {
                render_pass: built.render_pass,
                framebuffer: built.framebuffer,
                extent: built.extent,
                clear_values: vec![ClearValue::BLACK],
            },
        );
        ctx.device.cmd_end_render_pass(ctx.cmd);
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
    fn test_stub_reports_not_implemented() {
        let pass = DisparityPass::new();
        assert!(!pass.is_implemented());
        assert!(matches!(
            pass.estimation_program(),
            Err(BackendError::NotImplemented(_))
        ));
    }

    #[test]
    fn test_declares_gradients_to_disparity() {
        let pass = DisparityPass::new();
        let mut io = PassIo::default();
        pass.declare(&mut io);
        assert_eq!(io.reads(), &[GRADIENTS.to_string()]);
        assert_eq!(io.writes(), &[DISPARITY.to_string()]);
        assert!(io.bindings.is_empty());
    }

    #[test]
    fn test_external_dependency_guards_previous_frame() {
        let desc = disparity_pass_descriptor();
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
