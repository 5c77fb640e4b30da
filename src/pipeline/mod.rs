//! Concrete render graphs
//!
//! - [`deferred`]: one render pass, geometry and lighting subpasses
//! - [`lightfield`]: forward ×9, gradients, disparity, swapchain write

pub mod deferred;
pub mod lightfield;

pub use deferred::{DeferredPass, LightUniform};
pub use lightfield::{
    DisparityPass, ForwardPass, GradientMode, GradientsPass, LightfieldConfig, PresentSource,
    SwapchainWritePass,
};

use crate::backend::traits::*;
use crate::render_graph::RenderGraph;

/// Which graph the renderer runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineKind {
    Deferred,
    #[default]
    Lightfield,
}

impl PipelineKind {
    /// Shader programs the graph needs in the shader library
    pub fn required_programs(&self) -> &'static [&'static str] {
        match self {
            PipelineKind::Deferred => &[deferred::GEOMETRY_PROGRAM, deferred::LIGHTING_PROGRAM],
            PipelineKind::Lightfield => &[
                lightfield::FORWARD_PROGRAM,
                lightfield::GRADIENTS_PROGRAM,
                lightfield::SWAPCHAIN_WRITE_PROGRAM,
            ],
        }
    }
}

/// Build the deferred render graph
pub fn build_deferred_graph(light: LightUniform) -> BackendResult<RenderGraph> {
    let mut graph = RenderGraph::new();
    graph.add_pass(DeferredPass::new(light))?;
    graph.validate()?;
    Ok(graph)
}

/// Build the lightfield render graph
pub fn build_lightfield_graph(config: &LightfieldConfig) -> BackendResult<RenderGraph> {
    config.validate()?;

    let mut graph = RenderGraph::new();
    graph.add_pass(ForwardPass::new(config.view_format, config.baseline))?;
    graph.add_pass(GradientsPass::new(
        config.gradient_mode,
        config.reference_layer,
    ))?;
    graph.add_pass(DisparityPass::new())?;
    graph.add_pass(SwapchainWritePass::new(
        config.present_source,
        config.reference_layer,
    ))?;
    graph.validate()?;
    Ok(graph)
}
