//! Headless device
//!
//! A CPU simulation of [`GpuDevice`] used by the test suite and by CI
//! machines without a GPU. Device memory is plain host bytes, so every
//! resource can be inspected after the fact.
//!
//! ```text
//!   record  ──► Vec<Command> per command buffer
//!   submit  ──► execute commands immediately
//!           ──► signal fence now (complete_submissions)
//!               or leave it pending for a SubmissionCompleter
//! ```
//!
//! Draws run a [`FragmentProgram`] registered for the pipeline's fragment
//! shader bytes over every texel of the framebuffer. Vertex data is not
//! rasterized. Semaphores are tracked for existence only.
//!
//! Usage bits are validated the way a validation layer would: attachments,
//! sampled images, copies and host access all check the flags the resource
//! was created with and fail with [`BackendError::Validation`].

pub mod texel;

pub use texel::{Fragment, FragmentProgram, TextureView};

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::render_graph::PassDescriptor;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Surface the headless device reports when none is configured
pub fn default_surface_support(extent: Extent2D) -> SurfaceSupport {
    SurfaceSupport {
        capabilities: SurfaceCapabilities {
            min_image_count: 2,
            max_image_count: 4,
            current_extent: Some(extent),
            min_image_extent: Extent2D::new(1, 1),
            max_image_extent: Extent2D::new(4096, 4096),
            supported_usage: ImageUsage::COLOR_ATTACHMENT
                | ImageUsage::TRANSFER_SRC
                | ImageUsage::TRANSFER_DST,
        },
        formats: vec![
            SurfaceFormat {
                format: Format::Bgra8Srgb,
                color_space: ColorSpace::SrgbNonlinear,
            },
            SurfaceFormat {
                format: Format::Bgra8Unorm,
                color_space: ColorSpace::SrgbNonlinear,
            },
        ],
        present_modes: vec![PresentMode::Fifo, PresentMode::Mailbox],
    }
}

#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    /// Signal submission fences immediately. When false, fences stay
    /// unsignaled until a [`SubmissionCompleter`] completes them.
    pub complete_submissions: bool,
    pub surface: SurfaceSupport,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            complete_submissions: true,
            surface: default_surface_support(Extent2D::new(64, 64)),
        }
    }
}

/// Device calls recorded for ordering assertions
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    Create {
        kind: &'static str,
        id: u64,
    },
    Destroy {
        kind: &'static str,
        id: u64,
    },
    WaitFence(FenceHandle),
    ResetFence(FenceHandle),
    ResetCommandPool(CommandPoolHandle),
    BeginCommandBuffer(CommandBufferHandle),
    Submit {
        command_buffer: CommandBufferHandle,
        wait: Option<(SemaphoreHandle, PipelineStages)>,
        signal: Option<SemaphoreHandle>,
        fence: Option<FenceHandle>,
    },
    WaitIdle,
    AcquireImage {
        swapchain: SwapchainHandle,
        signal: SemaphoreHandle,
    },
    Present {
        swapchain: SwapchainHandle,
        image_index: u32,
        wait: SemaphoreHandle,
    },
    UpdateDescriptorSet(DescriptorSetHandle),
    BeginRenderPass {
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
    },
    BindDescriptorSets {
        first_set: u32,
        sets: Vec<DescriptorSetHandle>,
    },
    PushConstants(Vec<u8>),
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
}

impl DeviceCall {
    pub fn is_destroy(&self) -> bool {
        matches!(self, DeviceCall::Destroy { .. })
    }
}

/// Shared view of a device's call log, usable after the device has moved
#[derive(Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<DeviceCall>>>,
}

impl CallLog {
    pub fn entries(&self) -> Vec<DeviceCall> {
        self.calls.lock().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    fn push(&self, call: DeviceCall) {
        self.calls.lock().push(call);
    }

    /// Objects of `kind` created and not yet destroyed
    pub fn live(&self, kind: &str) -> Vec<u64> {
        let mut live = Vec::new();
        for call in self.calls.lock().iter() {
            match call {
                DeviceCall::Create { kind: k, id } if *k == kind => live.push(*id),
                DeviceCall::Destroy { kind: k, id } if *k == kind => live.retain(|l| l != id),
                _ => {}
            }
        }
        live
    }
}

#[derive(Default)]
struct FenceState {
    signaled: HashMap<u64, bool>,
    pending: HashSet<u64>,
}

#[derive(Default)]
struct FenceTable {
    state: Mutex<FenceState>,
    changed: Condvar,
}

/// Completes pending submissions from any thread.
#[derive(Clone)]
pub struct SubmissionCompleter {
    fences: Arc<FenceTable>,
}

impl SubmissionCompleter {
    /// Signal every pending fence, returning how many were signaled.
    pub fn complete_all(&self) -> usize {
        let mut state = self.fences.state.lock();
        let pending: Vec<u64> = state.pending.drain().collect();
        for id in &pending {
            state.signaled.insert(*id, true);
        }
        self.fences.changed.notify_all();
        pending.len()
    }

    pub fn pending(&self) -> usize {
        self.fences.state.lock().pending.len()
    }
}

#[derive(Debug, Clone)]
enum Command {
    BeginRenderPass(RenderPassBegin),
    NextSubpass,
    EndRenderPass,
    BindPipeline(u64),
    BindDescriptorSets { first_set: u32, sets: Vec<u64> },
    PushConstants { offset: u32, data: Vec<u8> },
    Draw { vertex_count: u32 },
    CopyBuffer { src: u64, dst: u64, size: u64 },
    CopyBufferToImage { src: u64, dst: u64, region: BufferImageCopy },
    CopyImageToBuffer { src: u64, dst: u64, region: BufferImageCopy },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandBufferState {
    Initial,
    Recording,
    Executable,
}

struct CommandBufferEntry {
    pool: u64,
    state: CommandBufferState,
    commands: Vec<Command>,
    error: Option<BackendError>,
}

struct ImageEntry {
    label: String,
    format: Format,
    extent: Extent2D,
    layers: u32,
    usage: ImageUsage,
    data: Vec<u8>,
    swapchain_owned: bool,
}

impl ImageEntry {
    fn layer_size(&self) -> usize {
        self.extent.texel_count() as usize * self.format.bytes_per_pixel().unwrap_or(0) as usize
    }

    fn layer(&self, layer: u32) -> &[u8] {
        let size = self.layer_size();
        let start = layer as usize * size;
        &self.data[start..start + size]
    }
}

#[derive(Clone, Copy)]
struct ViewEntry {
    image: u64,
    base_layer: u32,
    layer_count: u32,
}

struct BufferEntry {
    label: String,
    usage: BufferUsage,
    location: MemoryLocation,
    data: Vec<u8>,
}

struct FramebufferEntry {
    render_pass: u64,
    attachments: Vec<u64>,
    extent: Extent2D,
}

struct DescriptorPoolEntry {
    max_sets: u32,
    sets: Vec<u64>,
}

struct DescriptorSetEntry {
    layout: u64,
    writes: BTreeMap<u32, DescriptorResource>,
}

struct PipelineEntry {
    fragment_code: Vec<u8>,
    subpass: u32,
}

struct SwapchainEntry {
    images: Vec<u64>,
    extent: Extent2D,
    next_image: u32,
}

#[derive(Default)]
struct ExecState {
    render_pass: Option<(u64, u64, Extent2D)>,
    subpass: u32,
    pipeline: Option<u64>,
    sets: BTreeMap<u32, u64>,
    push_constants: Vec<u8>,
}

/// One color target of a draw: image id, layer, format
struct Target {
    image: u64,
    layer: u32,
    format: Format,
    data: Vec<u8>,
}

pub struct HeadlessDevice {
    config: HeadlessConfig,
    next_id: u64,
    calls: CallLog,
    fences: Arc<FenceTable>,
    semaphores: HashSet<u64>,
    command_pools: HashMap<u64, Vec<u64>>,
    command_buffers: HashMap<u64, CommandBufferEntry>,
    in_flight: HashMap<u64, u64>,
    swapchains: HashMap<u64, SwapchainEntry>,
    images: HashMap<u64, ImageEntry>,
    views: HashMap<u64, ViewEntry>,
    samplers: HashSet<u64>,
    buffers: HashMap<u64, BufferEntry>,
    shader_modules: HashMap<u64, Vec<u8>>,
    render_passes: HashMap<u64, PassDescriptor>,
    framebuffers: HashMap<u64, FramebufferEntry>,
    set_layouts: HashMap<u64, Vec<DescriptorSetLayoutBinding>>,
    descriptor_pools: HashMap<u64, DescriptorPoolEntry>,
    descriptor_sets: HashMap<u64, DescriptorSetEntry>,
    pipeline_layouts: HashMap<u64, Vec<u64>>,
    pipelines: HashMap<u64, PipelineEntry>,
    programs: HashMap<Vec<u8>, FragmentProgram>,
    acquire_script: VecDeque<AcquireOutcome>,
    wait_failures: VecDeque<BackendError>,
    present_script: VecDeque<PresentOutcome>,
}

impl HeadlessDevice {
    pub fn new(config: HeadlessConfig) -> Self {
        log::info!(
            "Headless device created (complete_submissions: {})",
            config.complete_submissions
        );
        Self {
            config,
            next_id: 0,
            calls: CallLog::default(),
            fences: Arc::new(FenceTable::default()),
            semaphores: HashSet::new(),
            command_pools: HashMap::new(),
            command_buffers: HashMap::new(),
            in_flight: HashMap::new(),
            swapchains: HashMap::new(),
            images: HashMap::new(),
            views: HashMap::new(),
            samplers: HashSet::new(),
            buffers: HashMap::new(),
            shader_modules: HashMap::new(),
            render_passes: HashMap::new(),
            framebuffers: HashMap::new(),
            set_layouts: HashMap::new(),
            descriptor_pools: HashMap::new(),
            descriptor_sets: HashMap::new(),
            pipeline_layouts: HashMap::new(),
            pipelines: HashMap::new(),
            programs: HashMap::new(),
            acquire_script: VecDeque::new(),
            wait_failures: VecDeque::new(),
            present_script: VecDeque::new(),
        }
    }

    /// Handle for completing pending submissions from another thread
    pub fn completer(&self) -> SubmissionCompleter {
        SubmissionCompleter {
            fences: self.fences.clone(),
        }
    }

    /// Run `program` for every draw whose pipeline uses `fragment_code`.
    pub fn register_fragment_program<F>(&mut self, fragment_code: &[u8], program: F)
    where
        F: Fn(&Fragment<'_>) -> Option<Vec<[f32; 4]>> + Send + Sync + 'static,
    {
        self.programs
            .insert(fragment_code.to_vec(), Arc::new(program));
    }

    /// Switch between immediate and externally driven fence completion.
    pub fn set_complete_submissions(&mut self, complete: bool) {
        self.config.complete_submissions = complete;
    }

    /// Queue the outcome of a future acquire call.
    pub fn script_acquire(&mut self, outcome: AcquireOutcome) {
        self.acquire_script.push_back(outcome);
    }

    /// Fail the next fence wait with `error`, leaving the fence untouched.
    pub fn fail_next_fence_wait(&mut self, error: BackendError) {
        self.wait_failures.push_back(error);
    }

    /// Queue the outcome of a future present call.
    pub fn script_present(&mut self, outcome: PresentOutcome) {
        self.present_script.push_back(outcome);
    }

    /// Simulate a window resize. Swapchains of another extent go out of date.
    pub fn set_surface_extent(&mut self, extent: Extent2D) {
        self.config.surface.capabilities.current_extent = Some(extent);
    }

    pub fn call_log(&self) -> Vec<DeviceCall> {
        self.calls.entries()
    }

    pub fn clear_call_log(&self) {
        self.calls.clear();
    }

    pub fn call_log_handle(&self) -> CallLog {
        self.calls.clone()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Images created through `create_image`, excluding swapchain images
    pub fn live_image_count(&self) -> usize {
        self.images.values().filter(|i| !i.swapchain_owned).count()
    }

    /// Raw contents of any buffer, regardless of its memory location
    pub fn buffer_contents(&self, buffer: BufferHandle) -> BackendResult<Vec<u8>> {
        self.buffers
            .get(&buffer.0)
            .map(|b| b.data.clone())
            .ok_or_else(|| BackendError::ResourceNotFound(format!("buffer {}", buffer.0)))
    }

    /// Decoded texels of one image layer in row-major order
    pub fn image_texels(&self, image: ImageHandle, layer: u32) -> BackendResult<Vec<[f32; 4]>> {
        let entry = self.image(image.0)?;
        if layer >= entry.layers {
            return Err(BackendError::Validation(format!(
                "layer {} of '{}' with {} layers",
                layer, entry.label, entry.layers
            )));
        }
        let bpp = entry.format.bytes_per_pixel().unwrap_or(0) as usize;
        entry
            .layer(layer)
            .chunks_exact(bpp)
            .map(|texel| texel::decode(entry.format, texel))
            .collect()
    }

    fn next(&mut self, kind: &'static str) -> u64 {
        self.next_id += 1;
        self.calls.push(DeviceCall::Create {
            kind,
            id: self.next_id,
        });
        self.next_id
    }

    fn destroyed(&self, kind: &'static str, id: u64, existed: bool) {
        if existed {
            self.calls.push(DeviceCall::Destroy { kind, id });
        } else {
            log::warn!("Destroying unknown {} {}", kind, id);
        }
    }

    fn image(&self, id: u64) -> BackendResult<&ImageEntry> {
        self.images
            .get(&id)
            .ok_or_else(|| BackendError::ResourceNotFound(format!("image {}", id)))
    }

    fn view(&self, id: u64) -> BackendResult<ViewEntry> {
        self.views
            .get(&id)
            .copied()
            .ok_or_else(|| BackendError::ResourceNotFound(format!("image view {}", id)))
    }

    fn buffer(&self, id: u64) -> BackendResult<&BufferEntry> {
        self.buffers
            .get(&id)
            .ok_or_else(|| BackendError::ResourceNotFound(format!("buffer {}", id)))
    }

    /// A command buffer stays in flight until its fence leaves the pending
    /// set; resetting the fence afterwards does not revive it.
    fn is_in_flight(&self, cmd: u64) -> bool {
        self.in_flight
            .get(&cmd)
            .is_some_and(|fence| self.fences.state.lock().pending.contains(fence))
    }

    fn record(&mut self, cmd: CommandBufferHandle, command: Command) {
        let check = self.validate_command(&command);
        let Some(entry) = self.command_buffers.get_mut(&cmd.0) else {
            log::warn!("Recording into unknown command buffer {}", cmd.0);
            return;
        };
        if entry.state != CommandBufferState::Recording {
            entry.error.get_or_insert(BackendError::CommandRecordingFailed(format!(
                "command buffer {} is not recording",
                cmd.0
            )));
            return;
        }
        match check {
            Ok(()) => entry.commands.push(command),
            Err(e) => {
                entry.error.get_or_insert(e);
            }
        }
    }

    fn validate_command(&self, command: &Command) -> BackendResult<()> {
        let buffer_usage = |id: u64, usage: BufferUsage, what: &str| -> BackendResult<()> {
            let buffer = self.buffer(id)?;
            if !buffer.usage.contains(usage) {
                return Err(BackendError::Validation(format!(
                    "buffer '{}' used as {} without {:?}",
                    buffer.label, what, usage
                )));
            }
            Ok(())
        };
        let image_usage = |id: u64, usage: ImageUsage, what: &str| -> BackendResult<()> {
            let image = self.image(id)?;
            if !image.usage.contains(usage) {
                return Err(BackendError::Validation(format!(
                    "image '{}' used as {} without {:?}",
                    image.label, what, usage
                )));
            }
            Ok(())
        };

        match command {
            Command::CopyBuffer { src, dst, size } => {
                buffer_usage(*src, BufferUsage::TRANSFER_SRC, "copy source")?;
                buffer_usage(*dst, BufferUsage::TRANSFER_DST, "copy destination")?;
                let src_len = self.buffer(*src)?.data.len() as u64;
                let dst_len = self.buffer(*dst)?.data.len() as u64;
                if *size > src_len || *size > dst_len {
                    return Err(BackendError::Validation(format!(
                        "copy of {} bytes between buffers of {} and {} bytes",
                        size, src_len, dst_len
                    )));
                }
            }
            Command::CopyBufferToImage { src, dst, region } => {
                buffer_usage(*src, BufferUsage::TRANSFER_SRC, "copy source")?;
                image_usage(*dst, ImageUsage::TRANSFER_DST, "copy destination")?;
                self.check_region(*src, *dst, region)?;
            }
            Command::CopyImageToBuffer { src, dst, region } => {
                image_usage(*src, ImageUsage::TRANSFER_SRC, "copy source")?;
                buffer_usage(*dst, BufferUsage::TRANSFER_DST, "copy destination")?;
                self.check_region(*dst, *src, region)?;
            }
            Command::BindPipeline(id) => {
                if !self.pipelines.contains_key(id) {
                    return Err(BackendError::ResourceNotFound(format!("pipeline {}", id)));
                }
            }
            Command::BindDescriptorSets { sets, .. } => {
                if let Some(missing) = sets.iter().find(|s| !self.descriptor_sets.contains_key(s))
                {
                    return Err(BackendError::ResourceNotFound(format!(
                        "descriptor set {}",
                        missing
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn check_region(&self, buffer: u64, image: u64, region: &BufferImageCopy) -> BackendResult<()> {
        let image = self.image(image)?;
        let buffer = self.buffer(buffer)?;
        if region.layer >= image.layers || region.extent != image.extent {
            return Err(BackendError::Validation(format!(
                "copy region {:?} outside image '{}'",
                region, image.label
            )));
        }
        if region.buffer_offset + image.layer_size() as u64 > buffer.data.len() as u64 {
            return Err(BackendError::Validation(format!(
                "copy region {:?} outside buffer '{}'",
                region, buffer.label
            )));
        }
        Ok(())
    }

    fn execute(&mut self, cmd: u64) -> BackendResult<()> {
        let commands = match self.command_buffers.get(&cmd) {
            Some(entry) => entry.commands.clone(),
            None => return Err(BackendError::ResourceNotFound(format!("command buffer {}", cmd))),
        };

        let mut state = ExecState::default();
        for command in commands {
            match command {
                Command::BeginRenderPass(begin) => self.begin_pass(&mut state, &begin)?,
                Command::NextSubpass => state.subpass += 1,
                Command::EndRenderPass => {
                    state.render_pass = None;
                    state.subpass = 0;
                }
                Command::BindPipeline(pipeline) => state.pipeline = Some(pipeline),
                Command::BindDescriptorSets { first_set, sets } => {
                    for (i, set) in sets.into_iter().enumerate() {
                        state.sets.insert(first_set + i as u32, set);
                    }
                }
                Command::PushConstants { offset, data } => {
                    let end = offset as usize + data.len();
                    if state.push_constants.len() < end {
                        state.push_constants.resize(end, 0);
                    }
                    state.push_constants[offset as usize..end].copy_from_slice(&data);
                }
                Command::Draw { vertex_count } => {
                    if vertex_count > 0 {
                        self.draw(&state)?;
                    }
                }
                Command::CopyBuffer { src, dst, size } => {
                    let bytes = self.buffer(src)?.data[..size as usize].to_vec();
                    if let Some(dst) = self.buffers.get_mut(&dst) {
                        dst.data[..size as usize].copy_from_slice(&bytes);
                    }
                }
                Command::CopyBufferToImage { src, dst, region } => {
                    let size = self.image(dst)?.layer_size();
                    let start = region.buffer_offset as usize;
                    let bytes = self.buffer(src)?.data[start..start + size].to_vec();
                    if let Some(image) = self.images.get_mut(&dst) {
                        let offset = region.layer as usize * size;
                        image.data[offset..offset + size].copy_from_slice(&bytes);
                    }
                }
                Command::CopyImageToBuffer { src, dst, region } => {
                    let bytes = self.image(src)?.layer(region.layer).to_vec();
                    if let Some(buffer) = self.buffers.get_mut(&dst) {
                        let start = region.buffer_offset as usize;
                        buffer.data[start..start + bytes.len()].copy_from_slice(&bytes);
                    }
                }
            }
        }
        Ok(())
    }

    fn begin_pass(&mut self, state: &mut ExecState, begin: &RenderPassBegin) -> BackendResult<()> {
        let desc = self
            .render_passes
            .get(&begin.render_pass.0)
            .cloned()
            .ok_or_else(|| {
                BackendError::ResourceNotFound(format!("render pass {}", begin.render_pass.0))
            })?;
        let attachments = self
            .framebuffers
            .get(&begin.framebuffer.0)
            .map(|fb| fb.attachments.clone())
            .ok_or_else(|| {
                BackendError::ResourceNotFound(format!("framebuffer {}", begin.framebuffer.0))
            })?;

        for (i, attachment) in desc.attachments.iter().enumerate() {
            if attachment.load_op != LoadOp::Clear {
                continue;
            }
            let clear = begin.clear_values.get(i).ok_or_else(|| {
                BackendError::Validation(format!(
                    "{}: no clear value for attachment {}",
                    desc.label, i
                ))
            })?;
            let texel = texel::clear_texel(attachment.format, clear)?;
            let view = self.view(attachments[i])?;
            if let Some(image) = self.images.get_mut(&view.image) {
                let size = image.layer_size();
                for layer in view.base_layer..view.base_layer + view.layer_count {
                    let start = layer as usize * size;
                    for chunk in image.data[start..start + size].chunks_exact_mut(texel.len()) {
                        chunk.copy_from_slice(&texel);
                    }
                }
            }
        }

        state.render_pass = Some((begin.render_pass.0, begin.framebuffer.0, begin.extent));
        state.subpass = 0;
        Ok(())
    }

    fn texture_view(&self, view: u64) -> BackendResult<TextureView> {
        let view = self.view(view)?;
        let image = self.image(view.image)?;
        Ok(TextureView {
            format: image.format,
            extent: image.extent,
            layers: (view.base_layer..view.base_layer + view.layer_count)
                .map(|layer| image.layer(layer).to_vec())
                .collect(),
        })
    }

    fn draw(&mut self, state: &ExecState) -> BackendResult<()> {
        let (render_pass, framebuffer, extent) = state.render_pass.ok_or_else(|| {
            BackendError::Validation("draw outside of a render pass".into())
        })?;
        let pipeline = state
            .pipeline
            .and_then(|p| self.pipelines.get(&p))
            .ok_or_else(|| BackendError::Validation("draw without a bound pipeline".into()))?;
        if pipeline.subpass != state.subpass {
            return Err(BackendError::Validation(format!(
                "pipeline built for subpass {} used in subpass {}",
                pipeline.subpass, state.subpass
            )));
        }
        let Some(program) = self.programs.get(&pipeline.fragment_code).cloned() else {
            log::trace!("No fragment program registered, draw skipped");
            return Ok(());
        };

        let subpass = self
            .render_passes
            .get(&render_pass)
            .and_then(|rp| rp.subpasses.get(state.subpass as usize))
            .cloned()
            .ok_or_else(|| BackendError::Validation(format!("subpass {}", state.subpass)))?;
        let fb_views = self
            .framebuffers
            .get(&framebuffer)
            .map(|fb| fb.attachments.clone())
            .unwrap_or_default();

        let inputs = subpass
            .input_attachments
            .iter()
            .map(|r| self.texture_view(fb_views[r.attachment as usize]))
            .collect::<BackendResult<Vec<_>>>()?;

        let mut targets = Vec::new();
        for r in &subpass.color_attachments {
            let view = self.view(fb_views[r.attachment as usize])?;
            let image = self.image(view.image)?;
            targets.push(Target {
                image: view.image,
                layer: view.base_layer,
                format: image.format,
                data: image.layer(view.base_layer).to_vec(),
            });
        }

        let mut uniforms = Vec::new();
        let mut textures = Vec::new();
        for (&set_index, set) in &state.sets {
            let Some(set) = self.descriptor_sets.get(set) else {
                continue;
            };
            for (&binding, resource) in &set.writes {
                match *resource {
                    DescriptorResource::Buffer {
                        buffer,
                        offset,
                        range,
                    } => {
                        let data = &self.buffer(buffer.0)?.data;
                        let end = (offset + range).min(data.len() as u64) as usize;
                        uniforms.push(((set_index, binding), data[offset as usize..end].to_vec()));
                    }
                    DescriptorResource::Image {
                        view,
                        sampler: Some(_),
                        ..
                    } => {
                        textures.push(((set_index, binding), self.texture_view(view.0)?));
                    }
                    DescriptorResource::Image { sampler: None, .. } => {}
                }
            }
        }

        let mut fetched = vec![[0.0f32; 4]; inputs.len()];
        for y in 0..extent.height {
            for x in 0..extent.width {
                for (slot, input) in fetched.iter_mut().zip(&inputs) {
                    *slot = input.fetch(0, x, y);
                }
                let fragment = Fragment {
                    x,
                    y,
                    extent,
                    inputs: &fetched,
                    push_constants: &state.push_constants,
                    uniforms: &uniforms,
                    textures: &textures,
                };
                let Some(outputs) = program(&fragment) else {
                    continue;
                };
                for (target, value) in targets.iter_mut().zip(outputs) {
                    let texel = texel::encode(target.format, value)?;
                    let offset = (y as usize * extent.width as usize + x as usize) * texel.len();
                    if let Some(dst) = target.data.get_mut(offset..offset + texel.len()) {
                        dst.copy_from_slice(&texel);
                    }
                }
            }
        }

        for target in targets {
            if let Some(image) = self.images.get_mut(&target.image) {
                let size = image.layer_size();
                let start = target.layer as usize * size;
                image.data[start..start + size].copy_from_slice(&target.data);
            }
        }
        Ok(())
    }

    fn destroy_image_entry(&mut self, id: u64) {
        let existed = self.images.remove(&id).is_some();
        self.destroyed("image", id, existed);
    }
}

impl GpuDevice for HeadlessDevice {
    fn name(&self) -> &str {
        "headless"
    }

    fn create_fence(&mut self, signaled: bool) -> BackendResult<FenceHandle> {
        let id = self.next("fence");
        self.fences.state.lock().signaled.insert(id, signaled);
        Ok(FenceHandle(id))
    }

    fn wait_for_fence(
        &mut self,
        fence: FenceHandle,
        timeout: Option<Duration>,
    ) -> BackendResult<()> {
        self.calls.push(DeviceCall::WaitFence(fence));
        if let Some(error) = self.wait_failures.pop_front() {
            return Err(error);
        }
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut state = self.fences.state.lock();
        loop {
            match state.signaled.get(&fence.0) {
                None => {
                    return Err(BackendError::ResourceNotFound(format!("fence {}", fence.0)))
                }
                Some(true) => return Ok(()),
                Some(false) => {}
            }
            if !state.pending.contains(&fence.0) {
                return Err(BackendError::Validation(format!(
                    "fence {} is unsignaled with no pending submission and would never signal",
                    fence.0
                )));
            }
            match deadline {
                None => self.fences.changed.wait(&mut state),
                Some(deadline) => {
                    if self
                        .fences
                        .changed
                        .wait_until(&mut state, deadline)
                        .timed_out()
                        && state.signaled.get(&fence.0) == Some(&false)
                    {
                        return Err(BackendError::Timeout {
                            what: format!("fence {}", fence.0),
                            timeout: timeout.unwrap_or_default(),
                        });
                    }
                }
            }
        }
    }

    fn reset_fence(&mut self, fence: FenceHandle) -> BackendResult<()> {
        self.calls.push(DeviceCall::ResetFence(fence));
        let mut state = self.fences.state.lock();
        if state.pending.contains(&fence.0) {
            return Err(BackendError::Validation(format!(
                "fence {} reset while its submission is pending",
                fence.0
            )));
        }
        match state.signaled.get_mut(&fence.0) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(BackendError::ResourceNotFound(format!("fence {}", fence.0))),
        }
    }

    fn is_fence_signaled(&self, fence: FenceHandle) -> BackendResult<bool> {
        self.fences
            .state
            .lock()
            .signaled
            .get(&fence.0)
            .copied()
            .ok_or_else(|| BackendError::ResourceNotFound(format!("fence {}", fence.0)))
    }

    fn destroy_fence(&mut self, fence: FenceHandle) {
        let mut state = self.fences.state.lock();
        if state.pending.remove(&fence.0) {
            log::warn!("Fence {} destroyed while its submission is pending", fence.0);
        }
        let existed = state.signaled.remove(&fence.0).is_some();
        drop(state);
        self.destroyed("fence", fence.0, existed);
    }

    fn create_semaphore(&mut self) -> BackendResult<SemaphoreHandle> {
        let id = self.next("semaphore");
        self.semaphores.insert(id);
        Ok(SemaphoreHandle(id))
    }

    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle) {
        let existed = self.semaphores.remove(&semaphore.0);
        self.destroyed("semaphore", semaphore.0, existed);
    }

    fn create_command_pool(&mut self, _transient: bool) -> BackendResult<CommandPoolHandle> {
        let id = self.next("command_pool");
        self.command_pools.insert(id, Vec::new());
        Ok(CommandPoolHandle(id))
    }

    fn reset_command_pool(&mut self, pool: CommandPoolHandle) -> BackendResult<()> {
        self.calls.push(DeviceCall::ResetCommandPool(pool));
        let buffers = self
            .command_pools
            .get(&pool.0)
            .cloned()
            .ok_or_else(|| BackendError::ResourceNotFound(format!("command pool {}", pool.0)))?;
        if let Some(busy) = buffers.iter().find(|cmd| self.is_in_flight(**cmd)) {
            return Err(BackendError::Validation(format!(
                "command pool {} reset while command buffer {} is in flight",
                pool.0, busy
            )));
        }
        for cmd in buffers {
            self.in_flight.remove(&cmd);
            if let Some(entry) = self.command_buffers.get_mut(&cmd) {
                entry.state = CommandBufferState::Initial;
                entry.commands.clear();
                entry.error = None;
            }
        }
        Ok(())
    }

    fn destroy_command_pool(&mut self, pool: CommandPoolHandle) {
        let buffers = self.command_pools.remove(&pool.0);
        let existed = buffers.is_some();
        for cmd in buffers.unwrap_or_default() {
            self.command_buffers.remove(&cmd);
            self.in_flight.remove(&cmd);
        }
        self.destroyed("command_pool", pool.0, existed);
    }

    fn allocate_command_buffer(
        &mut self,
        pool: CommandPoolHandle,
    ) -> BackendResult<CommandBufferHandle> {
        if !self.command_pools.contains_key(&pool.0) {
            return Err(BackendError::ResourceNotFound(format!("command pool {}", pool.0)));
        }
        let id = self.next("command_buffer");
        self.command_buffers.insert(
            id,
            CommandBufferEntry {
                pool: pool.0,
                state: CommandBufferState::Initial,
                commands: Vec::new(),
                error: None,
            },
        );
        if let Some(buffers) = self.command_pools.get_mut(&pool.0) {
            buffers.push(id);
        }
        Ok(CommandBufferHandle(id))
    }

    fn free_command_buffer(&mut self, pool: CommandPoolHandle, cmd: CommandBufferHandle) {
        if let Some(buffers) = self.command_pools.get_mut(&pool.0) {
            buffers.retain(|b| *b != cmd.0);
        }
        self.in_flight.remove(&cmd.0);
        let existed = self
            .command_buffers
            .remove(&cmd.0)
            .is_some_and(|entry| entry.pool == pool.0);
        self.destroyed("command_buffer", cmd.0, existed);
    }

    fn begin_command_buffer(
        &mut self,
        cmd: CommandBufferHandle,
        _one_time: bool,
    ) -> BackendResult<()> {
        self.calls.push(DeviceCall::BeginCommandBuffer(cmd));
        if self.is_in_flight(cmd.0) {
            return Err(BackendError::Validation(format!(
                "command buffer {} begun while in flight",
                cmd.0
            )));
        }
        let entry = self.command_buffers.get_mut(&cmd.0).ok_or_else(|| {
            BackendError::ResourceNotFound(format!("command buffer {}", cmd.0))
        })?;
        entry.state = CommandBufferState::Recording;
        entry.commands.clear();
        entry.error = None;
        Ok(())
    }

    fn end_command_buffer(&mut self, cmd: CommandBufferHandle) -> BackendResult<()> {
        let entry = self.command_buffers.get_mut(&cmd.0).ok_or_else(|| {
            BackendError::ResourceNotFound(format!("command buffer {}", cmd.0))
        })?;
        if let Some(error) = entry.error.take() {
            entry.state = CommandBufferState::Initial;
            return Err(error);
        }
        if entry.state != CommandBufferState::Recording {
            return Err(BackendError::CommandRecordingFailed(format!(
                "command buffer {} ended without begin",
                cmd.0
            )));
        }
        entry.state = CommandBufferState::Executable;
        Ok(())
    }

    fn submit(&mut self, info: &SubmitInfo) -> BackendResult<()> {
        self.calls.push(DeviceCall::Submit {
            command_buffer: info.command_buffer,
            wait: info.wait,
            signal: info.signal,
            fence: info.fence,
        });

        let cmd = info.command_buffer.0;
        match self.command_buffers.get(&cmd).map(|e| e.state) {
            Some(CommandBufferState::Executable) => {}
            Some(state) => {
                return Err(BackendError::SubmitFailed(format!(
                    "command buffer {} submitted in state {:?}",
                    cmd, state
                )))
            }
            None => return Err(BackendError::ResourceNotFound(format!("command buffer {}", cmd))),
        }
        for semaphore in info.wait.map(|(s, _)| s).iter().chain(info.signal.iter()) {
            if !self.semaphores.contains(&semaphore.0) {
                return Err(BackendError::ResourceNotFound(format!("semaphore {}", semaphore.0)));
            }
        }
        if let Some(fence) = info.fence {
            if self.is_fence_signaled(fence)? {
                return Err(BackendError::Validation(format!(
                    "fence {} submitted while signaled",
                    fence.0
                )));
            }
        }

        self.execute(cmd)?;

        if let Some(fence) = info.fence {
            let mut state = self.fences.state.lock();
            if self.config.complete_submissions {
                state.signaled.insert(fence.0, true);
                self.fences.changed.notify_all();
            } else {
                state.pending.insert(fence.0);
                self.in_flight.insert(cmd, fence.0);
            }
        }
        Ok(())
    }

    fn wait_idle(&mut self) -> BackendResult<()> {
        self.calls.push(DeviceCall::WaitIdle);
        let mut state = self.fences.state.lock();
        while !state.pending.is_empty() {
            self.fences.changed.wait(&mut state);
        }
        Ok(())
    }

    fn surface_support(&mut self) -> BackendResult<SurfaceSupport> {
        Ok(self.config.surface.clone())
    }

    fn create_swapchain(
        &mut self,
        desc: &SwapchainDescriptor,
        old: Option<SwapchainHandle>,
    ) -> BackendResult<SwapchainHandle> {
        let support = &self.config.surface;
        let caps = &support.capabilities;
        let fail = |msg: String| Err(BackendError::SwapchainCreationFailed(msg));

        if desc.extent.is_zero_area() {
            return fail(format!("zero-area extent {:?}", desc.extent));
        }
        if !caps.supported_usage.contains(desc.usage) {
            return Err(BackendError::Validation(format!(
                "swapchain usage {:?} not supported by the surface",
                desc.usage
            )));
        }
        if desc.image_count < caps.min_image_count
            || (caps.max_image_count > 0 && desc.image_count > caps.max_image_count)
        {
            return fail(format!("image count {} out of range", desc.image_count));
        }
        if !support.formats.contains(&desc.surface_format) {
            return fail(format!("unsupported format {:?}", desc.surface_format));
        }
        if !support.present_modes.contains(&desc.present_mode) {
            return fail(format!("unsupported present mode {:?}", desc.present_mode));
        }
        if let Some(old) = old {
            if !self.swapchains.contains_key(&old.0) {
                return Err(BackendError::ResourceNotFound(format!("swapchain {}", old.0)));
            }
        }

        let id = self.next("swapchain");
        let bpp = desc.surface_format.format.bytes_per_pixel().unwrap_or(4) as usize;
        let mut images = Vec::new();
        for i in 0..desc.image_count {
            self.next_id += 1;
            let image = self.next_id;
            self.images.insert(
                image,
                ImageEntry {
                    label: format!("swapchain[{}]", i),
                    format: desc.surface_format.format,
                    extent: desc.extent,
                    layers: 1,
                    usage: desc.usage,
                    data: vec![0; desc.extent.texel_count() as usize * bpp],
                    swapchain_owned: true,
                },
            );
            images.push(image);
        }
        self.swapchains.insert(
            id,
            SwapchainEntry {
                images,
                extent: desc.extent,
                next_image: 0,
            },
        );
        Ok(SwapchainHandle(id))
    }

    fn swapchain_images(&self, swapchain: SwapchainHandle) -> BackendResult<Vec<ImageHandle>> {
        self.swapchains
            .get(&swapchain.0)
            .map(|s| s.images.iter().map(|i| ImageHandle(*i)).collect())
            .ok_or_else(|| BackendError::ResourceNotFound(format!("swapchain {}", swapchain.0)))
    }

    fn destroy_swapchain(&mut self, swapchain: SwapchainHandle) {
        let entry = self.swapchains.remove(&swapchain.0);
        let existed = entry.is_some();
        for image in entry.map(|e| e.images).unwrap_or_default() {
            self.images.remove(&image);
        }
        self.destroyed("swapchain", swapchain.0, existed);
    }

    fn acquire_next_image(
        &mut self,
        swapchain: SwapchainHandle,
        signal: SemaphoreHandle,
        _timeout: Option<Duration>,
    ) -> BackendResult<AcquireOutcome> {
        self.calls.push(DeviceCall::AcquireImage { swapchain, signal });
        if !self.semaphores.contains(&signal.0) {
            return Err(BackendError::ResourceNotFound(format!("semaphore {}", signal.0)));
        }
        let surface_extent = self.config.surface.capabilities.current_extent;
        let scripted = self.acquire_script.pop_front();
        let entry = self.swapchains.get_mut(&swapchain.0).ok_or_else(|| {
            BackendError::ResourceNotFound(format!("swapchain {}", swapchain.0))
        })?;

        if let Some(outcome) = scripted {
            return Ok(outcome);
        }
        if surface_extent.is_some_and(|extent| extent != entry.extent) {
            return Ok(AcquireOutcome::OutOfDate);
        }
        let index = entry.next_image % entry.images.len() as u32;
        entry.next_image = entry.next_image.wrapping_add(1);
        Ok(AcquireOutcome::Acquired {
            index,
            suboptimal: false,
        })
    }

    fn present(
        &mut self,
        swapchain: SwapchainHandle,
        image_index: u32,
        wait: SemaphoreHandle,
    ) -> BackendResult<PresentOutcome> {
        self.calls.push(DeviceCall::Present {
            swapchain,
            image_index,
            wait,
        });
        let surface_extent = self.config.surface.capabilities.current_extent;
        let entry = self.swapchains.get(&swapchain.0).ok_or_else(|| {
            BackendError::ResourceNotFound(format!("swapchain {}", swapchain.0))
        })?;
        if image_index as usize >= entry.images.len() {
            return Err(BackendError::Validation(format!(
                "present of image {} from a swapchain of {}",
                image_index,
                entry.images.len()
            )));
        }
        if let Some(outcome) = self.present_script.pop_front() {
            return Ok(outcome);
        }
        if surface_extent.is_some_and(|extent| extent != entry.extent) {
            return Ok(PresentOutcome::Suboptimal);
        }
        Ok(PresentOutcome::Presented)
    }

    fn create_image(&mut self, desc: &ImageDescriptor) -> BackendResult<ImageHandle> {
        let bpp = desc.format.bytes_per_pixel().ok_or_else(|| {
            BackendError::ImageCreationFailed(format!("{}: format {:?}", desc.label, desc.format))
        })?;
        if desc.extent.is_zero_area() || desc.array_layers == 0 || desc.usage.is_empty() {
            return Err(BackendError::ImageCreationFailed(format!(
                "{}: invalid extent, layer count or usage",
                desc.label
            )));
        }
        let id = self.next("image");
        let size = desc.extent.texel_count() as usize * bpp as usize * desc.array_layers as usize;
        self.images.insert(
            id,
            ImageEntry {
                label: desc.label.clone(),
                format: desc.format,
                extent: desc.extent,
                layers: desc.array_layers,
                usage: desc.usage,
                data: vec![0; size],
                swapchain_owned: false,
            },
        );
        Ok(ImageHandle(id))
    }

    fn create_image_view(
        &mut self,
        image: ImageHandle,
        desc: &ImageViewDescriptor,
    ) -> BackendResult<ImageViewHandle> {
        let layers = self.image(image.0)?.layers;
        if desc.layer_count == 0
            || desc.base_layer + desc.layer_count > layers
            || (desc.kind == ImageViewKind::D2 && desc.layer_count != 1)
        {
            return Err(BackendError::ImageCreationFailed(format!(
                "view {:?} of an image with {} layers",
                desc, layers
            )));
        }
        let id = self.next("image_view");
        self.views.insert(
            id,
            ViewEntry {
                image: image.0,
                base_layer: desc.base_layer,
                layer_count: desc.layer_count,
            },
        );
        Ok(ImageViewHandle(id))
    }

    fn destroy_image_view(&mut self, view: ImageViewHandle) {
        let existed = self.views.remove(&view.0).is_some();
        self.destroyed("image_view", view.0, existed);
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        if self.images.get(&image.0).is_some_and(|i| i.swapchain_owned) {
            log::warn!("Swapchain image {} destroyed directly", image.0);
            return;
        }
        self.destroy_image_entry(image.0);
    }

    fn create_sampler(&mut self, _desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        let id = self.next("sampler");
        self.samplers.insert(id);
        Ok(SamplerHandle(id))
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        let existed = self.samplers.remove(&sampler.0);
        self.destroyed("sampler", sampler.0, existed);
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        if desc.size == 0 || desc.usage.is_empty() {
            return Err(BackendError::BufferCreationFailed(format!(
                "{}: zero size or empty usage",
                desc.label
            )));
        }
        let id = self.next("buffer");
        self.buffers.insert(
            id,
            BufferEntry {
                label: desc.label.clone(),
                usage: desc.usage,
                location: desc.location,
                data: vec![0; desc.size as usize],
            },
        );
        Ok(BufferHandle(id))
    }

    fn write_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> BackendResult<()> {
        let entry = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| BackendError::ResourceNotFound(format!("buffer {}", buffer.0)))?;
        if !entry.location.is_host_visible() {
            return Err(BackendError::Validation(format!(
                "host write to device-local buffer '{}'",
                entry.label
            )));
        }
        let end = offset as usize + data.len();
        if end > entry.data.len() {
            return Err(BackendError::Validation(format!(
                "write of {} bytes at {} into '{}' ({} bytes)",
                data.len(),
                offset,
                entry.label,
                entry.data.len()
            )));
        }
        entry.data[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferHandle, offset: u64, len: u64) -> BackendResult<Vec<u8>> {
        let entry = self.buffer(buffer.0)?;
        if !entry.location.is_host_visible() {
            return Err(BackendError::Validation(format!(
                "host read of device-local buffer '{}'",
                entry.label
            )));
        }
        let end = (offset + len) as usize;
        entry
            .data
            .get(offset as usize..end)
            .map(|bytes| bytes.to_vec())
            .ok_or_else(|| {
                BackendError::Validation(format!(
                    "read of {} bytes at {} from '{}'",
                    len, offset, entry.label
                ))
            })
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        let existed = self.buffers.remove(&buffer.0).is_some();
        self.destroyed("buffer", buffer.0, existed);
    }

    fn memory_report(&self) -> MemoryReport {
        let mut allocations: Vec<AllocationEntry> = self
            .images
            .values()
            .filter(|i| !i.swapchain_owned)
            .map(|i| AllocationEntry {
                name: i.label.clone(),
                size: i.data.len() as u64,
            })
            .chain(self.buffers.values().map(|b| AllocationEntry {
                name: b.label.clone(),
                size: b.data.len() as u64,
            }))
            .collect();
        allocations.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.name.cmp(&b.name)));
        let allocated_bytes = allocations.iter().map(|a| a.size).sum();

        MemoryReport {
            allocated_bytes,
            reserved_bytes: allocated_bytes,
            block_count: allocations.len(),
            allocations,
        }
    }

    fn create_shader_module(&mut self, code: &[u8]) -> BackendResult<ShaderModuleHandle> {
        if code.is_empty() {
            return Err(BackendError::ShaderCreationFailed("empty shader code".into()));
        }
        let id = self.next("shader_module");
        self.shader_modules.insert(id, code.to_vec());
        Ok(ShaderModuleHandle(id))
    }

    fn destroy_shader_module(&mut self, module: ShaderModuleHandle) {
        let existed = self.shader_modules.remove(&module.0).is_some();
        self.destroyed("shader_module", module.0, existed);
    }

    fn create_render_pass(&mut self, desc: &PassDescriptor) -> BackendResult<RenderPassHandle> {
        desc.validate()?;
        let id = self.next("render_pass");
        self.render_passes.insert(id, desc.clone());
        Ok(RenderPassHandle(id))
    }

    fn destroy_render_pass(&mut self, render_pass: RenderPassHandle) {
        let existed = self.render_passes.remove(&render_pass.0).is_some();
        self.destroyed("render_pass", render_pass.0, existed);
    }

    fn create_framebuffer(
        &mut self,
        desc: &FramebufferDescriptor,
    ) -> BackendResult<FramebufferHandle> {
        let pass = self.render_passes.get(&desc.render_pass.0).ok_or_else(|| {
            BackendError::ResourceNotFound(format!("render pass {}", desc.render_pass.0))
        })?;
        if pass.attachments.len() != desc.attachments.len() {
            return Err(BackendError::Validation(format!(
                "{}: framebuffer has {} attachments, render pass has {}",
                pass.label,
                desc.attachments.len(),
                pass.attachments.len()
            )));
        }

        for (i, view) in desc.attachments.iter().enumerate() {
            let view = self.view(view.0)?;
            let image = self.image(view.image)?;
            let required = pass.required_usage(i as u32);
            if !image.usage.contains(required) {
                return Err(BackendError::Validation(format!(
                    "{}: attachment {} ('{}') needs usage {:?} but was created with {:?}",
                    pass.label, i, image.label, required, image.usage
                )));
            }
            if image.format != pass.attachments[i].format {
                return Err(BackendError::Validation(format!(
                    "{}: attachment {} ('{}') is {:?}, render pass expects {:?}",
                    pass.label, i, image.label, image.format, pass.attachments[i].format
                )));
            }
            if view.layer_count != 1
                || image.extent.width < desc.extent.width
                || image.extent.height < desc.extent.height
            {
                return Err(BackendError::Validation(format!(
                    "{}: attachment {} ('{}') does not cover {:?}",
                    pass.label, i, image.label, desc.extent
                )));
            }
        }

        let id = self.next("framebuffer");
        self.framebuffers.insert(
            id,
            FramebufferEntry {
                render_pass: desc.render_pass.0,
                attachments: desc.attachments.iter().map(|v| v.0).collect(),
                extent: desc.extent,
            },
        );
        Ok(FramebufferHandle(id))
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        let existed = self.framebuffers.remove(&framebuffer.0).is_some();
        self.destroyed("framebuffer", framebuffer.0, existed);
    }

    fn create_descriptor_set_layout(
        &mut self,
        bindings: &[DescriptorSetLayoutBinding],
    ) -> BackendResult<DescriptorSetLayoutHandle> {
        let mut seen = HashSet::new();
        if let Some(dup) = bindings.iter().find(|b| !seen.insert(b.binding)) {
            return Err(BackendError::DescriptorFailed(format!(
                "binding {} declared twice",
                dup.binding
            )));
        }
        let id = self.next("descriptor_set_layout");
        self.set_layouts.insert(id, bindings.to_vec());
        Ok(DescriptorSetLayoutHandle(id))
    }

    fn destroy_descriptor_set_layout(&mut self, layout: DescriptorSetLayoutHandle) {
        let existed = self.set_layouts.remove(&layout.0).is_some();
        self.destroyed("descriptor_set_layout", layout.0, existed);
    }

    fn create_descriptor_pool(
        &mut self,
        _sizes: &[DescriptorPoolSize],
        max_sets: u32,
    ) -> BackendResult<DescriptorPoolHandle> {
        let id = self.next("descriptor_pool");
        self.descriptor_pools.insert(
            id,
            DescriptorPoolEntry {
                max_sets,
                sets: Vec::new(),
            },
        );
        Ok(DescriptorPoolHandle(id))
    }

    fn reset_descriptor_pool(&mut self, pool: DescriptorPoolHandle) -> BackendResult<()> {
        let entry = self.descriptor_pools.get_mut(&pool.0).ok_or_else(|| {
            BackendError::ResourceNotFound(format!("descriptor pool {}", pool.0))
        })?;
        for set in entry.sets.drain(..) {
            self.descriptor_sets.remove(&set);
        }
        Ok(())
    }

    fn destroy_descriptor_pool(&mut self, pool: DescriptorPoolHandle) {
        let entry = self.descriptor_pools.remove(&pool.0);
        let existed = entry.is_some();
        for set in entry.map(|e| e.sets).unwrap_or_default() {
            self.descriptor_sets.remove(&set);
        }
        self.destroyed("descriptor_pool", pool.0, existed);
    }

    fn allocate_descriptor_set(
        &mut self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
    ) -> BackendResult<DescriptorSetHandle> {
        if !self.set_layouts.contains_key(&layout.0) {
            return Err(BackendError::ResourceNotFound(format!(
                "descriptor set layout {}",
                layout.0
            )));
        }
        let entry = self.descriptor_pools.get(&pool.0).ok_or_else(|| {
            BackendError::ResourceNotFound(format!("descriptor pool {}", pool.0))
        })?;
        if entry.sets.len() as u32 >= entry.max_sets {
            return Err(BackendError::DescriptorFailed(format!(
                "descriptor pool {} exhausted ({} sets)",
                pool.0, entry.max_sets
            )));
        }

        self.next_id += 1;
        let id = self.next_id;
        self.descriptor_sets.insert(
            id,
            DescriptorSetEntry {
                layout: layout.0,
                writes: BTreeMap::new(),
            },
        );
        if let Some(entry) = self.descriptor_pools.get_mut(&pool.0) {
            entry.sets.push(id);
        }
        Ok(DescriptorSetHandle(id))
    }

    fn update_descriptor_set(
        &mut self,
        set: DescriptorSetHandle,
        writes: &[DescriptorWrite],
    ) -> BackendResult<()> {
        self.calls.push(DeviceCall::UpdateDescriptorSet(set));
        let entry = self.descriptor_sets.get(&set.0).ok_or_else(|| {
            BackendError::ResourceNotFound(format!("descriptor set {}", set.0))
        })?;
        let layout = self.set_layouts.get(&entry.layout).cloned().unwrap_or_default();

        for write in writes {
            let declared = layout.iter().find(|b| b.binding == write.binding);
            if declared.map(|b| b.ty) != Some(write.ty) {
                return Err(BackendError::Validation(format!(
                    "binding {} written as {:?}, layout declares {:?}",
                    write.binding,
                    write.ty,
                    declared.map(|b| b.ty)
                )));
            }

            match (write.ty, write.resource) {
                (
                    DescriptorType::UniformBuffer,
                    DescriptorResource::Buffer {
                        buffer,
                        offset,
                        range,
                    },
                ) => {
                    let entry = self.buffer(buffer.0)?;
                    if !entry.usage.contains(BufferUsage::UNIFORM) {
                        return Err(BackendError::Validation(format!(
                            "buffer '{}' bound as uniform without UNIFORM usage",
                            entry.label
                        )));
                    }
                    if offset + range > entry.data.len() as u64 {
                        return Err(BackendError::Validation(format!(
                            "uniform range {}+{} outside '{}'",
                            offset, range, entry.label
                        )));
                    }
                }
                (
                    DescriptorType::CombinedImageSampler,
                    DescriptorResource::Image { view, sampler, .. },
                ) => {
                    let image = self.image(self.view(view.0)?.image)?;
                    if !image.usage.contains(ImageUsage::SAMPLED) {
                        return Err(BackendError::Validation(format!(
                            "image '{}' sampled without SAMPLED usage",
                            image.label
                        )));
                    }
                    if !sampler.is_some_and(|s| self.samplers.contains(&s.0)) {
                        return Err(BackendError::Validation(format!(
                            "binding {} has no valid sampler",
                            write.binding
                        )));
                    }
                }
                (DescriptorType::InputAttachment, DescriptorResource::Image { view, .. }) => {
                    let image = self.image(self.view(view.0)?.image)?;
                    if !image.usage.contains(ImageUsage::INPUT_ATTACHMENT) {
                        return Err(BackendError::Validation(format!(
                            "image '{}' bound as input attachment without INPUT_ATTACHMENT usage",
                            image.label
                        )));
                    }
                }
                (ty, resource) => {
                    return Err(BackendError::Validation(format!(
                        "{:?} cannot hold {:?}",
                        ty, resource
                    )))
                }
            }
        }

        if let Some(entry) = self.descriptor_sets.get_mut(&set.0) {
            for write in writes {
                entry.writes.insert(write.binding, write.resource);
            }
        }
        Ok(())
    }

    fn create_pipeline_layout(
        &mut self,
        set_layouts: &[DescriptorSetLayoutHandle],
        push_constants: &[PushConstantRange],
    ) -> BackendResult<PipelineLayoutHandle> {
        if let Some(missing) = set_layouts
            .iter()
            .find(|l| !self.set_layouts.contains_key(&l.0))
        {
            return Err(BackendError::ResourceNotFound(format!(
                "descriptor set layout {}",
                missing.0
            )));
        }
        if let Some(range) = push_constants.iter().find(|r| r.offset + r.size > 128) {
            return Err(BackendError::PipelineCreationFailed(format!(
                "push constant range {:?} exceeds 128 bytes",
                range
            )));
        }
        let id = self.next("pipeline_layout");
        self.pipeline_layouts
            .insert(id, set_layouts.iter().map(|l| l.0).collect());
        Ok(PipelineLayoutHandle(id))
    }

    fn destroy_pipeline_layout(&mut self, layout: PipelineLayoutHandle) {
        let existed = self.pipeline_layouts.remove(&layout.0).is_some();
        self.destroyed("pipeline_layout", layout.0, existed);
    }

    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDescriptor,
    ) -> BackendResult<PipelineHandle> {
        let fail = |msg: String| {
            Err(BackendError::PipelineCreationFailed(format!(
                "{}: {}",
                desc.label, msg
            )))
        };

        if !self.shader_modules.contains_key(&desc.vertex_module.0) {
            return fail("missing vertex module".into());
        }
        let Some(fragment_code) = self.shader_modules.get(&desc.fragment_module.0).cloned() else {
            return fail("missing fragment module".into());
        };
        if !self.pipeline_layouts.contains_key(&desc.layout.0) {
            return fail("missing pipeline layout".into());
        }
        let Some(pass) = self.render_passes.get(&desc.render_pass.0) else {
            return fail("missing render pass".into());
        };
        let Some(subpass) = pass.subpasses.get(desc.subpass as usize) else {
            return fail(format!("render pass has no subpass {}", desc.subpass));
        };
        if subpass.color_attachments.len() as u32 != desc.color_attachment_count {
            return fail(format!(
                "{} color outputs for a subpass with {}",
                desc.color_attachment_count,
                subpass.color_attachments.len()
            ));
        }
        if desc.depth_compare.is_some() && subpass.depth_attachment.is_none() {
            return fail("depth test in a subpass without depth attachment".into());
        }

        let id = self.next("pipeline");
        self.pipelines.insert(
            id,
            PipelineEntry {
                fragment_code,
                subpass: desc.subpass,
            },
        );
        Ok(PipelineHandle(id))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        let existed = self.pipelines.remove(&pipeline.0).is_some();
        self.destroyed("pipeline", pipeline.0, existed);
    }

    fn cmd_begin_render_pass(&mut self, cmd: CommandBufferHandle, begin: &RenderPassBegin) {
        self.calls.push(DeviceCall::BeginRenderPass {
            render_pass: begin.render_pass,
            framebuffer: begin.framebuffer,
        });
        if let Some(fb) = self.framebuffers.get(&begin.framebuffer.0) {
            if fb.render_pass != begin.render_pass.0 {
                log::trace!(
                    "Framebuffer {} was created for render pass {}, used with {}",
                    begin.framebuffer.0,
                    fb.render_pass,
                    begin.render_pass.0
                );
            }
            if fb.extent != begin.extent {
                log::trace!(
                    "Render area {:?} differs from framebuffer {:?}",
                    begin.extent,
                    fb.extent
                );
            }
        }
        self.record(cmd, Command::BeginRenderPass(begin.clone()));
    }

    fn cmd_next_subpass(&mut self, cmd: CommandBufferHandle) {
        self.record(cmd, Command::NextSubpass);
    }

    fn cmd_end_render_pass(&mut self, cmd: CommandBufferHandle) {
        self.record(cmd, Command::EndRenderPass);
    }

    fn cmd_bind_pipeline(&mut self, cmd: CommandBufferHandle, pipeline: PipelineHandle) {
        self.record(cmd, Command::BindPipeline(pipeline.0));
    }

    fn cmd_bind_descriptor_sets(
        &mut self,
        cmd: CommandBufferHandle,
        _layout: PipelineLayoutHandle,
        first_set: u32,
        sets: &[DescriptorSetHandle],
    ) {
        self.calls.push(DeviceCall::BindDescriptorSets {
            first_set,
            sets: sets.to_vec(),
        });
        self.record(
            cmd,
            Command::BindDescriptorSets {
                first_set,
                sets: sets.iter().map(|s| s.0).collect(),
            },
        );
    }

    fn cmd_push_constants(
        &mut self,
        cmd: CommandBufferHandle,
        _layout: PipelineLayoutHandle,
        _stages: ShaderStages,
        offset: u32,
        data: &[u8],
    ) {
        self.calls.push(DeviceCall::PushConstants(data.to_vec()));
        self.record(
            cmd,
            Command::PushConstants {
                offset,
                data: data.to_vec(),
            },
        );
    }

    fn cmd_bind_vertex_buffer(&mut self, cmd: CommandBufferHandle, buffer: BufferHandle) {
        if let Ok(entry) = self.buffer(buffer.0) {
            if !entry.usage.contains(BufferUsage::VERTEX) {
                let error = BackendError::Validation(format!(
                    "buffer '{}' bound as vertex buffer without VERTEX usage",
                    entry.label
                ));
                if let Some(cmd) = self.command_buffers.get_mut(&cmd.0) {
                    cmd.error.get_or_insert(error);
                }
            }
        }
    }

    fn cmd_draw(&mut self, cmd: CommandBufferHandle, vertex_count: u32, instance_count: u32) {
        self.calls.push(DeviceCall::Draw {
            vertex_count,
            instance_count,
        });
        self.record(cmd, Command::Draw { vertex_count });
    }

    fn cmd_copy_buffer(
        &mut self,
        cmd: CommandBufferHandle,
        src: BufferHandle,
        dst: BufferHandle,
        size: u64,
    ) {
        self.record(
            cmd,
            Command::CopyBuffer {
                src: src.0,
                dst: dst.0,
                size,
            },
        );
    }

    fn cmd_copy_buffer_to_image(
        &mut self,
        cmd: CommandBufferHandle,
        src: BufferHandle,
        dst: ImageHandle,
        region: &BufferImageCopy,
    ) {
        self.record(
            cmd,
            Command::CopyBufferToImage {
                src: src.0,
                dst: dst.0,
                region: *region,
            },
        );
    }

    fn cmd_copy_image_to_buffer(
        &mut self,
        cmd: CommandBufferHandle,
        src: ImageHandle,
        dst: BufferHandle,
        region: &BufferImageCopy,
    ) {
        self.record(
            cmd,
            Command::CopyImageToBuffer {
                src: src.0,
                dst: dst.0,
                region: *region,
            },
        );
    }

    fn cmd_image_barrier(&mut self, cmd: CommandBufferHandle, barrier: &ImageBarrier) {
        let layers = self.images.get(&barrier.image.0).map(|i| i.layers);
        if layers.is_some_and(|layers| barrier.base_layer + barrier.layer_count > layers) {
            if let Some(cmd) = self.command_buffers.get_mut(&cmd.0) {
                cmd.error.get_or_insert(BackendError::Validation(format!(
                    "barrier on layers {}..{} of image {}",
                    barrier.base_layer,
                    barrier.base_layer + barrier.layer_count,
                    barrier.image.0
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn recorded(device: &mut HeadlessDevice) -> (CommandPoolHandle, CommandBufferHandle) {
        let pool = device.create_command_pool(false).unwrap();
        let cmd = device.allocate_command_buffer(pool).unwrap();
        device.begin_command_buffer(cmd, true).unwrap();
        device.end_command_buffer(cmd).unwrap();
        (pool, cmd)
    }

    #[test]
    fn test_submission_signals_fence() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let fence = device.create_fence(false).unwrap();
        let (_, cmd) = recorded(&mut device);
        device
            .submit(&SubmitInfo {
                command_buffer: cmd,
                wait: None,
                signal: None,
                fence: Some(fence),
            })
            .unwrap();
        assert!(device.is_fence_signaled(fence).unwrap());
    }

    #[test]
    fn test_pending_fence_times_out() {
        let mut device = HeadlessDevice::new(HeadlessConfig {
            complete_submissions: false,
            ..Default::default()
        });
        let fence = device.create_fence(false).unwrap();
        let (_, cmd) = recorded(&mut device);
        device
            .submit(&SubmitInfo {
                command_buffer: cmd,
                wait: None,
                signal: None,
                fence: Some(fence),
            })
            .unwrap();

        let result = device.wait_for_fence(fence, Some(Duration::from_millis(10)));
        assert!(matches!(result, Err(BackendError::Timeout { .. })));
    }

    #[test]
    fn test_completer_releases_waiter() {
        let mut device = HeadlessDevice::new(HeadlessConfig {
            complete_submissions: false,
            ..Default::default()
        });
        let fence = device.create_fence(false).unwrap();
        let (_, cmd) = recorded(&mut device);
        device
            .submit(&SubmitInfo {
                command_buffer: cmd,
                wait: None,
                signal: None,
                fence: Some(fence),
            })
            .unwrap();

        let completer = device.completer();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completer.complete_all()
        });
        device.wait_for_fence(fence, None).unwrap();
        assert_eq!(handle.join().unwrap(), 1);
    }

    #[test]
    fn test_reset_pool_while_in_flight_rejected() {
        let mut device = HeadlessDevice::new(HeadlessConfig {
            complete_submissions: false,
            ..Default::default()
        });
        let fence = device.create_fence(false).unwrap();
        let (pool, cmd) = recorded(&mut device);
        device
            .submit(&SubmitInfo {
                command_buffer: cmd,
                wait: None,
                signal: None,
                fence: Some(fence),
            })
            .unwrap();

        assert!(matches!(
            device.reset_command_pool(pool),
            Err(BackendError::Validation(_))
        ));
        device.completer().complete_all();
        assert!(device.reset_command_pool(pool).is_ok());
    }

    #[test]
    fn test_reset_pool_after_wait_and_fence_reset() {
        let mut device = HeadlessDevice::new(HeadlessConfig {
            complete_submissions: false,
            ..Default::default()
        });
        let fence = device.create_fence(false).unwrap();
        let (pool, cmd) = recorded(&mut device);
        device
            .submit(&SubmitInfo {
                command_buffer: cmd,
                wait: None,
                signal: None,
                fence: Some(fence),
            })
            .unwrap();

        device.completer().complete_all();
        device.wait_for_fence(fence, None).unwrap();
        device.reset_fence(fence).unwrap();
        assert!(!device.is_fence_signaled(fence).unwrap());
        assert!(device.reset_command_pool(pool).is_ok());
        assert!(device.begin_command_buffer(cmd, true).is_ok());
    }

    #[test]
    fn test_unsubmitted_fence_wait_is_rejected() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let fence = device.create_fence(false).unwrap();
        assert!(device.wait_for_fence(fence, None).is_err());
    }

    #[test]
    fn test_device_local_buffer_not_host_readable() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let buffer = device
            .create_buffer(&BufferDescriptor {
                label: "local".into(),
                size: 16,
                usage: BufferUsage::VERTEX,
                location: MemoryLocation::GpuOnly,
            })
            .unwrap();
        assert!(device.read_buffer(buffer, 0, 16).is_err());
        assert!(device.write_buffer(buffer, 0, &[1]).is_err());
        assert_eq!(device.buffer_contents(buffer).unwrap(), vec![0; 16]);
    }

    #[test]
    fn test_copy_without_transfer_usage_fails_at_end() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let make = |device: &mut HeadlessDevice, usage| {
            device
                .create_buffer(&BufferDescriptor {
                    label: "b".into(),
                    size: 4,
                    usage,
                    location: MemoryLocation::CpuToGpu,
                })
                .unwrap()
        };
        let src = make(&mut device, BufferUsage::UNIFORM);
        let dst = make(&mut device, BufferUsage::TRANSFER_DST);
        let pool = device.create_command_pool(true).unwrap();
        let cmd = device.allocate_command_buffer(pool).unwrap();
        device.begin_command_buffer(cmd, true).unwrap();
        device.cmd_copy_buffer(cmd, src, dst, 4);
        assert!(matches!(
            device.end_command_buffer(cmd),
            Err(BackendError::Validation(_))
        ));
    }

    #[test]
    fn test_call_log_tracks_live_objects() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let log = device.call_log_handle();
        let a = device.create_semaphore().unwrap();
        let _b = device.create_semaphore().unwrap();
        device.destroy_semaphore(a);
        assert_eq!(log.live("semaphore").len(), 1);
        assert!(log.entries().last().unwrap().is_destroy());
    }

    #[test]
    fn test_acquire_goes_out_of_date_after_resize() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let semaphore = device.create_semaphore().unwrap();
        let swapchain = device
            .create_swapchain(
                &SwapchainDescriptor {
                    surface_format: SurfaceFormat {
                        format: Format::Bgra8Srgb,
                        color_space: ColorSpace::SrgbNonlinear,
                    },
                    present_mode: PresentMode::Fifo,
                    extent: Extent2D::new(64, 64),
                    image_count: 3,
                    usage: ImageUsage::COLOR_ATTACHMENT,
                },
                None,
            )
            .unwrap();

        assert_eq!(
            device.acquire_next_image(swapchain, semaphore, None).unwrap(),
            AcquireOutcome::Acquired {
                index: 0,
                suboptimal: false
            }
        );
        device.set_surface_extent(Extent2D::new(32, 32));
        assert_eq!(
            device.acquire_next_image(swapchain, semaphore, None).unwrap(),
            AcquireOutcome::OutOfDate
        );
    }
}
