//! End-to-end frames through the deferred and lightfield graphs, with CPU
//! fragment programs standing in for the shaders.

mod common;

use common::{
    assert_rgb_near, config_for, headless, presented_texels, register, renderer, SRGB8_EPSILON,
};
use glam::{Mat4, Vec4};
use lightfield_renderer::camera::{camera_grid, offset_view_projection};
use lightfield_renderer::backend::headless::DeviceCall;
use lightfield_renderer::backend::traits::*;
use lightfield_renderer::backend::types::*;
use lightfield_renderer::pipeline::deferred::{GEOMETRY_PROGRAM, LIGHTING_PROGRAM};
use lightfield_renderer::pipeline::lightfield::{
    ForwardPushConstants, GradientPushConstants, DISPARITY, FORWARD_PROGRAM, GRADIENTS,
    GRADIENTS_PROGRAM, SWAPCHAIN_WRITE_PROGRAM, VIEWS,
};
use lightfield_renderer::pipeline::{ForwardPass, GradientMode};
use lightfield_renderer::{
    FrameStatus, LightUniform, LightfieldConfig, OverlayRecorder, PipelineKind, PresentSource,
};
use rstest::rstest;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn vec4_at(bytes: &[u8], index: usize) -> [f32; 4] {
    bytemuck::pod_read_unaligned(&bytes[index * 16..index * 16 + 16])
}

fn forward_push(push_constants: &[u8]) -> ForwardPushConstants {
    bytemuck::pod_read_unaligned(&push_constants[..std::mem::size_of::<ForwardPushConstants>()])
}

fn camera_index(push_constants: &[u8]) -> usize {
    forward_push(push_constants).camera as usize
}

/// Value the forward program writes into every texel of camera `i`
fn forward_color(i: usize) -> [f32; 4] {
    [i as f32 / 8.0, 0.5, 0.25, 1.0]
}

// ============================================================================
// Deferred
// ============================================================================

/// Albedo written by the geometry program, modulated by the light color and
/// offset by the ambient term in the lighting program.
#[test]
fn test_deferred_lighting_reads_gbuffer_and_light() {
    let light = LightUniform {
        direction: Vec4::new(0.0, 0.0, -1.0, 0.0),
        color: Vec4::new(0.5, 1.0, 0.25, 1.0),
        ambient: Vec4::new(0.1, 0.1, 0.1, 0.0),
    };
    let mut device = headless();

    register(&mut device, GEOMETRY_PROGRAM, |frag| {
        frag.uniform(0, 0)?;
        let [u, v] = frag.uv();
        Some(vec![
            [u, v, -1.0, 1.0],
            [0.8, 0.6, 0.4, 1.0],
            [0.0, 0.0, 1.0, 0.0],
        ])
    });
    register(&mut device, LIGHTING_PROGRAM, |frag| {
        let light = frag.uniform(2, 0)?;
        let color = vec4_at(light, 1);
        let ambient = vec4_at(light, 2);
        let [position, albedo, normal] = [frag.inputs[0], frag.inputs[1], frag.inputs[2]];
        // Position must round-trip through the float G-buffer exactly.
        let [u, v] = frag.uv();
        if position[0] != u || position[1] != v || normal[2] < 0.99 {
            return Some(vec![[1.0, 0.0, 1.0, 1.0]]);
        }
        Some(vec![[
            albedo[0] * color[0] + ambient[0],
            albedo[1] * color[1] + ambient[1],
            albedo[2] * color[2] + ambient[2],
            1.0,
        ]])
    });

    let config = config_for(PipelineKind::Deferred).with_light(light);
    let mut renderer = renderer(device, config);
    assert_eq!(renderer.render_frame(None).unwrap(), FrameStatus::Presented);

    let texels = presented_texels(&renderer);
    assert_eq!(texels.len(), (common::SURFACE.width * common::SURFACE.height) as usize);
    for texel in [texels[0], texels[texels.len() / 2], texels[texels.len() - 1]] {
        assert_rgb_near(texel, [0.5, 0.7, 0.2], SRGB8_EPSILON);
    }
}

#[test]
fn test_deferred_binds_three_sets_for_lighting() {
    let mut renderer = renderer(headless(), config_for(PipelineKind::Deferred));
    renderer.device().clear_call_log();
    renderer.render_frame(None).unwrap();

    let binds: Vec<(u32, usize)> = renderer
        .device()
        .call_log()
        .iter()
        .filter_map(|c| match c {
            DeviceCall::BindDescriptorSets { first_set, sets } => Some((*first_set, sets.len())),
            _ => None,
        })
        .collect();
    assert_eq!(binds, vec![(0, 1), (0, 3)]);
}

// ============================================================================
// Lightfield forward
// ============================================================================

/// Every layer of the views array is drawn with its own camera index and sees
/// the offset table.
#[test]
fn test_forward_writes_each_camera_to_its_layer() {
    let mut device = headless();
    register(&mut device, FORWARD_PROGRAM, |frag| {
        let camera = camera_index(frag.push_constants);
        let offset = vec4_at(frag.uniform(1, 0)?, camera);
        Some(vec![[offset[0], offset[1], camera as f32, 1.0]])
    });

    let lightfield = LightfieldConfig {
        view_format: Format::Rgba32Float,
        baseline: 0.25,
        ..Default::default()
    };
    let config = config_for(PipelineKind::Lightfield).with_lightfield(lightfield);
    let mut renderer = renderer(device, config);
    renderer.render_frame(None).unwrap();

    let offsets = renderer
        .graph()
        .pass::<ForwardPass>()
        .expect("forward pass")
        .offsets()
        .offsets;
    let views = renderer.graph().resources().get(VIEWS).unwrap().image.image;
    for layer in 0..9u32 {
        let texels = renderer.device().image_texels(views, layer).unwrap();
        let expected = offsets[layer as usize];
        assert_eq!(
            texels[0],
            [expected.x, expected.y, layer as f32, 1.0],
            "layer {}",
            layer
        );
    }
    // Center camera sits on the grid origin, corners one baseline away.
    assert_eq!((offsets[4].x, offsets[4].y), (0.0, 0.0));
    assert_eq!((offsets[0].x, offsets[0].y), (-0.25, -0.25));
    assert_eq!((offsets[8].x, offsets[8].y), (0.25, 0.25));
}

#[test]
fn test_forward_pushes_camera_index_per_layer() {
    let mut renderer = renderer(headless(), config_for(PipelineKind::Lightfield));
    renderer.device().clear_call_log();
    renderer.render_frame(None).unwrap();

    let pushed: Vec<usize> = renderer
        .device()
        .call_log()
        .iter()
        .filter_map(|c| match c {
            DeviceCall::PushConstants(bytes)
                if bytes.len() == std::mem::size_of::<ForwardPushConstants>() =>
            {
                Some(camera_index(bytes))
            }
            _ => None,
        })
        .collect();
    assert_eq!(pushed, (0..9).collect::<Vec<_>>());
}

/// Each layer is drawn with `proj * T(offset) * view`, so a known vertex
/// lands where the hand-computed product puts it.
#[test]
fn test_forward_matrix_offsets_in_view_space() {
    const POINT: Vec4 = Vec4::new(0.3, -0.2, 0.1, 1.0);
    let mut device = headless();
    register(&mut device, FORWARD_PROGRAM, |frag| {
        let clip = forward_push(frag.push_constants).view_proj * POINT;
        Some(vec![clip.to_array()])
    });

    let lightfield = LightfieldConfig {
        view_format: Format::Rgba32Float,
        baseline: 0.25,
        ..Default::default()
    };
    let config = config_for(PipelineKind::Lightfield).with_lightfield(lightfield);
    let mut renderer = renderer(device, config);
    renderer.render_frame(None).unwrap();

    let view = renderer.camera().view_matrix();
    let proj = renderer.camera().projection_matrix();
    let grid = camera_grid(0.25);
    let views = renderer.graph().resources().get(VIEWS).unwrap().image.image;
    for (layer, offset) in grid.iter().enumerate() {
        let expected = offset_view_projection(view, proj, *offset) * POINT;
        let by_hand = {
            let mut v = view * POINT;
            v.x += offset.x;
            v.y += offset.y;
            proj * v
        };
        assert!((expected - by_hand).abs().max_element() < 1e-5);

        let texels = renderer.device().image_texels(views, layer as u32).unwrap();
        let texel = Vec4::from_array(texels[0]);
        assert!(
            (texel - expected).abs().max_element() < 1e-5,
            "layer {}: {:?} != {:?}",
            layer,
            texel,
            expected
        );
    }

    // A world-space shift before the view is a different camera.
    let corner = Vec4::from_array(renderer.device().image_texels(views, 0).unwrap()[0]);
    let world_shift = proj * view * Mat4::from_translation(grid[0].extend(0.0)) * POINT;
    assert!((corner - world_shift).abs().max_element() > 1e-4);
}

// ============================================================================
// Gradients
// ============================================================================

#[rstest]
#[case::passthrough(GradientMode::Passthrough)]
#[case::horizontal(GradientMode::Horizontal)]
#[case::magnitude(GradientMode::Magnitude)]
fn test_gradients_sample_reference_layer(#[case] mode: GradientMode) {
    let mut device = headless();
    register(&mut device, FORWARD_PROGRAM, |frag| {
        Some(vec![forward_color(camera_index(frag.push_constants))])
    });
    register(&mut device, GRADIENTS_PROGRAM, |frag| {
        let push: GradientPushConstants = bytemuck::pod_read_unaligned(&frag.push_constants[..8]);
        let texel = frag.texture(0, 0)?.fetch(0, frag.x, frag.y);
        Some(vec![[texel[0] + push.mode as f32, 0.0, 0.0, 1.0]])
    });

    let lightfield = LightfieldConfig {
        gradient_mode: mode,
        reference_layer: 2,
        ..Default::default()
    };
    let config = config_for(PipelineKind::Lightfield).with_lightfield(lightfield);
    let mut renderer = renderer(device, config);
    renderer.render_frame(None).unwrap();

    let gradients = renderer.graph().resources().get(GRADIENTS).unwrap().image.image;
    let texels = renderer.device().image_texels(gradients, 0).unwrap();
    let expected = forward_color(2)[0] + mode as u32 as f32;
    assert!((texels[0][0] - expected).abs() < 0.01, "{:?}", texels[0]);
}

// ============================================================================
// Swapchain write
// ============================================================================

#[rstest]
#[case::forward_view(PresentSource::ForwardView, [0.5, 0.5, 0.25])]
#[case::gradients(PresentSource::Gradients, [0.75, 0.0, 0.0])]
#[case::disparity(PresentSource::Disparity, [0.0, 0.0, 0.0])]
fn test_present_source_reaches_swapchain(
    #[case] present_source: PresentSource,
    #[case] expected: [f32; 3],
) {
    let mut device = headless();
    register(&mut device, FORWARD_PROGRAM, |frag| {
        Some(vec![forward_color(camera_index(frag.push_constants))])
    });
    register(&mut device, GRADIENTS_PROGRAM, |_| Some(vec![[0.75, 0.0, 0.0, 1.0]]));
    register(&mut device, SWAPCHAIN_WRITE_PROGRAM, |frag| Some(vec![frag.inputs[0]]));

    let lightfield = LightfieldConfig {
        present_source,
        ..Default::default()
    };
    let config = config_for(PipelineKind::Lightfield).with_lightfield(lightfield);
    let mut renderer = renderer(device, config);
    renderer.render_frame(None).unwrap();

    for texel in presented_texels(&renderer) {
        assert_rgb_near(texel, expected, SRGB8_EPSILON);
    }
}

/// The disparity stage only clears its output until estimation exists.
#[test]
fn test_disparity_stub_is_black() {
    let mut device = headless();
    register(&mut device, GRADIENTS_PROGRAM, |_| Some(vec![[1.0, 0.0, 0.0, 1.0]]));
    let mut renderer = renderer(device, config_for(PipelineKind::Lightfield));
    renderer.render_frame(None).unwrap();

    let disparity = renderer.graph().resources().get(DISPARITY).unwrap().image.image;
    let texels = renderer.device().image_texels(disparity, 0).unwrap();
    assert!(texels.iter().all(|t| t[..3] == [0.0, 0.0, 0.0]));
}

// ============================================================================
// Overlay
// ============================================================================

struct CountingOverlay {
    calls: Arc<AtomicUsize>,
    extent: Option<Extent2D>,
}

impl OverlayRecorder for CountingOverlay {
    fn record(&mut self, device: &mut dyn GpuDevice, cmd: CommandBufferHandle, extent: Extent2D) {
        let _ = (device, cmd);
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.extent = Some(extent);
    }
}

#[rstest]
#[case::lightfield(PipelineKind::Lightfield)]
#[case::deferred(PipelineKind::Deferred)]
fn test_overlay_recorded_once_per_frame(#[case] kind: PipelineKind) {
    let mut renderer = renderer(headless(), config_for(kind));
    let calls = Arc::new(AtomicUsize::new(0));
    let mut overlay = CountingOverlay {
        calls: calls.clone(),
        extent: None,
    };

    for _ in 0..3 {
        renderer.render_frame(Some(&mut overlay)).unwrap();
    }
    renderer.render_frame(None).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(overlay.extent, Some(common::SURFACE));
}
