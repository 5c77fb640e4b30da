//! Shared fixtures for the headless integration tests.
//!
//! Shader "code" is a readable tag per program and stage; fragment programs
//! are registered on the headless device under the same bytes.

#![allow(dead_code)]

use lightfield_renderer::backend::headless::{
    DeviceCall, Fragment, HeadlessConfig, HeadlessDevice,
};
use lightfield_renderer::backend::types::*;
use lightfield_renderer::pipeline::PipelineKind;
use lightfield_renderer::resources::{Mesh, MeshTag};
use lightfield_renderer::{Renderer, RendererConfig, ShaderLibrary};

/// Extent of the default headless surface
pub const SURFACE: Extent2D = Extent2D {
    width: 64,
    height: 64,
};

/// Tolerance for values that went through an 8-bit sRGB target
pub const SRGB8_EPSILON: f32 = 0.02;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn fragment_code(program: &str) -> Vec<u8> {
    format!("{}.frag", program).into_bytes()
}

pub fn vertex_code(program: &str) -> Vec<u8> {
    format!("{}.vert", program).into_bytes()
}

/// Library holding every program the given graph needs
pub fn shaders_for(kind: PipelineKind) -> ShaderLibrary {
    let mut library = ShaderLibrary::new();
    for program in kind.required_programs() {
        library.insert(program, ShaderStage::Vertex, vertex_code(program));
        library.insert(program, ShaderStage::Fragment, fragment_code(program));
    }
    library
}

pub fn headless() -> HeadlessDevice {
    init_logging();
    HeadlessDevice::new(HeadlessConfig::default())
}

/// Register a fragment program for `program` on the device.
pub fn register<F>(device: &mut HeadlessDevice, program: &str, f: F)
where
    F: Fn(&Fragment<'_>) -> Option<Vec<[f32; 4]>> + Send + Sync + 'static,
{
    device.register_fragment_program(&fragment_code(program), f);
}

pub fn scene_for(kind: PipelineKind) -> Vec<(Mesh, MeshTag)> {
    let tag = match kind {
        PipelineKind::Deferred => MeshTag::Deferred,
        PipelineKind::Lightfield => MeshTag::Lightfield,
    };
    vec![(Mesh::quad([1.0, 1.0, 1.0, 1.0]), tag)]
}

pub fn config_for(kind: PipelineKind) -> RendererConfig {
    RendererConfig::default()
        .with_extent(SURFACE.width, SURFACE.height)
        .with_pipeline(kind)
        .with_validation(false)
}

pub fn renderer(
    device: HeadlessDevice,
    config: RendererConfig,
) -> Renderer<HeadlessDevice> {
    let kind = config.pipeline;
    Renderer::new(device, config, shaders_for(kind), &scene_for(kind))
        .expect("renderer creation")
}

/// Image index of the most recent present call
pub fn last_presented(calls: &[DeviceCall]) -> Option<u32> {
    calls.iter().rev().find_map(|call| match call {
        DeviceCall::Present { image_index, .. } => Some(*image_index),
        _ => None,
    })
}

/// Texels of the swapchain image presented last
pub fn presented_texels(renderer: &Renderer<HeadlessDevice>) -> Vec<[f32; 4]> {
    let index = last_presented(&renderer.device().call_log()).expect("a present call");
    let state = renderer.swapchain().state().expect("swapchain state");
    let image = state.images[index as usize];
    renderer
        .device()
        .image_texels(image, 0)
        .expect("swapchain texels")
}

pub fn assert_rgb_near(actual: [f32; 4], expected: [f32; 3], epsilon: f32) {
    for channel in 0..3 {
        assert!(
            (actual[channel] - expected[channel]).abs() <= epsilon,
            "channel {}: got {:?}, expected {:?}",
            channel,
            actual,
            expected
        );
    }
}
