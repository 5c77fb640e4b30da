//! Graphics pipeline description and lifetime

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::shader::ShaderLibrary;

/// Everything needed to build one graphics pipeline.
///
/// Viewport and scissor are static and cover `extent`, so pipelines are
/// rebuilt whenever the swapchain is.
#[derive(Debug, Clone)]
pub struct PipelineDesc {
    pub label: String,
    /// Shader program name in the [`ShaderLibrary`]
    pub program: String,
    pub vertex_layout: Option<VertexLayout>,
    pub cull_mode: CullMode,
    pub depth_test: Option<CompareFunction>,
    pub depth_write: bool,
    pub color_attachment_count: u32,
    pub blend: bool,
    pub set_layouts: Vec<DescriptorSetLayoutHandle>,
    pub push_constants: Vec<PushConstantRange>,
    pub render_pass: RenderPassHandle,
    pub subpass: u32,
    pub extent: Extent2D,
}

impl PipelineDesc {
    /// Full-screen style pipeline: no vertex input, no depth, one color output.
    pub fn new(
        label: &str,
        program: &str,
        render_pass: RenderPassHandle,
        subpass: u32,
        extent: Extent2D,
    ) -> Self {
        Self {
            label: label.to_string(),
            program: program.to_string(),
            vertex_layout: None,
            cull_mode: CullMode::None,
            depth_test: None,
            depth_write: false,
            color_attachment_count: 1,
            blend: false,
            set_layouts: Vec::new(),
            push_constants: Vec::new(),
            render_pass,
            subpass,
            extent,
        }
    }

    pub fn with_vertex_layout(mut self, layout: VertexLayout) -> Self {
        self.vertex_layout = Some(layout);
        self.cull_mode = CullMode::Back;
        self
    }

    pub fn with_depth_test(mut self, compare: CompareFunction, write: bool) -> Self {
        self.depth_test = Some(compare);
        self.depth_write = write;
        self
    }

    pub fn with_color_attachments(mut self, count: u32) -> Self {
        self.color_attachment_count = count;
        self
    }

    pub fn with_blend(mut self) -> Self {
        self.blend = true;
        self
    }

    pub fn with_set_layouts(mut self, layouts: Vec<DescriptorSetLayoutHandle>) -> Self {
        self.set_layouts = layouts;
        self
    }

    pub fn with_push_constants(mut self, stages: ShaderStages, size: u32) -> Self {
        self.push_constants.push(PushConstantRange {
            stages,
            offset: 0,
            size,
        });
        self
    }
}

/// A created pipeline together with its layout
#[derive(Debug, Clone)]
pub struct PipelineObject {
    pub label: String,
    pub pipeline: PipelineHandle,
    pub layout: PipelineLayoutHandle,
}

impl PipelineObject {
    /// Build the pipeline. Shader modules only live for the duration of the call.
    pub fn create(
        device: &mut dyn GpuDevice,
        shaders: &ShaderLibrary,
        desc: &PipelineDesc,
    ) -> BackendResult<Self> {
        let vertex_code = shaders.get(&desc.program, ShaderStage::Vertex)?;
        let fragment_code = shaders.get(&desc.program, ShaderStage::Fragment)?;

        let layout = device.create_pipeline_layout(&desc.set_layouts, &desc.push_constants)?;
        let vertex_module = match device.create_shader_module(vertex_code) {
            Ok(module) => module,
            Err(e) => {
                device.destroy_pipeline_layout(layout);
                return Err(e);
            }
        };
        let fragment_module = match device.create_shader_module(fragment_code) {
            Ok(module) => module,
            Err(e) => {
                device.destroy_shader_module(vertex_module);
                device.destroy_pipeline_layout(layout);
                return Err(e);
            }
        };

        let result = device.create_graphics_pipeline(&GraphicsPipelineDescriptor {
            label: desc.label.clone(),
            vertex_module,
            fragment_module,
            entry_point: "main",
            vertex_layout: desc.vertex_layout.clone(),
            cull_mode: desc.cull_mode,
            depth_compare: desc.depth_test,
            depth_write: desc.depth_write,
            color_attachment_count: desc.color_attachment_count,
            blend: desc.blend,
            layout,
            render_pass: desc.render_pass,
            subpass: desc.subpass,
            extent: desc.extent,
        });

        device.destroy_shader_module(fragment_module);
        device.destroy_shader_module(vertex_module);

        match result {
            Ok(pipeline) => {
                log::debug!("Created pipeline '{}'", desc.label);
                Ok(Self {
                    label: desc.label.clone(),
                    pipeline,
                    layout,
                })
            }
            Err(e) => {
                device.destroy_pipeline_layout(layout);
                Err(e)
            }
        }
    }

    pub fn bind(&self, device: &mut dyn GpuDevice, cmd: CommandBufferHandle) {
        device.cmd_bind_pipeline(cmd, self.pipeline);
    }

    pub fn bind_sets(
        &self,
        device: &mut dyn GpuDevice,
        cmd: CommandBufferHandle,
        first_set: u32,
        sets: &[DescriptorSetHandle],
    ) {
        device.cmd_bind_descriptor_sets(cmd, self.layout, first_set, sets);
    }

    pub fn push_constants(
        &self,
        device: &mut dyn GpuDevice,
        cmd: CommandBufferHandle,
        stages: ShaderStages,
        data: &[u8],
    ) {
        device.cmd_push_constants(cmd, self.layout, stages, 0, data);
    }

    pub fn destroy(self, device: &mut dyn GpuDevice) {
        device.destroy_pipeline(self.pipeline);
        device.destroy_pipeline_layout(self.layout);
    }
}
