//! Staging uploads, read-back, statistics and per-slot uniform data.

mod common;

use common::{config_for, headless, renderer};
use lightfield_renderer::backend::headless::{DeviceCall, HeadlessDevice};
use lightfield_renderer::backend::traits::DescriptorSetHandle;
use lightfield_renderer::backend::types::*;
use lightfield_renderer::frame::SlotIndex;
use lightfield_renderer::resources::{
    GpuBuffer, ImageRequest, ResourceAllocator, RingUniformBuffer, UniformBuffer,
};
use lightfield_renderer::{BackendError, FrameStatus, PipelineKind};
use rstest::rstest;
use std::collections::HashSet;

fn device_buffer(
    device: &mut HeadlessDevice,
    allocator: &mut ResourceAllocator,
    size: u64,
) -> GpuBuffer {
    allocator
        .create_buffer(
            device,
            "device-local",
            size,
            BufferUsage::STORAGE | BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        )
        .unwrap()
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

// ============================================================================
// Upload and read-back
// ============================================================================

#[rstest]
#[case::empty(0)]
#[case::one_byte(1)]
#[case::four_megabytes(4 * 1024 * 1024)]
fn test_upload_round_trip(#[case] len: usize) {
    let mut device = headless();
    let mut allocator = ResourceAllocator::new(&mut device).unwrap();
    let buffer = device_buffer(&mut device, &mut allocator, len.max(1) as u64);
    let bytes = pattern(len);

    allocator.upload(&mut device, &buffer, &bytes).unwrap();
    let back = allocator
        .read_back(&mut device, &buffer, len as u64)
        .unwrap();
    assert_eq!(back, bytes);

    let stats = allocator.stats();
    assert_eq!(stats.uploads, if len == 0 { 0 } else { 1 });
    assert_eq!(stats.uploaded_bytes, len as u64);

    allocator.destroy(&mut device, buffer);
    allocator.shutdown(&mut device);
    assert_eq!(device.live_buffer_count(), 0);
}

#[test]
fn test_upload_without_transfer_dst_fails() {
    let mut device = headless();
    let mut allocator = ResourceAllocator::new(&mut device).unwrap();
    let buffer = allocator
        .create_buffer(
            &mut device,
            "vertices",
            64,
            BufferUsage::VERTEX,
            MemoryLocation::GpuOnly,
        )
        .unwrap();
    device.clear_call_log();

    let result = allocator.upload(&mut device, &buffer, &[1u8; 16]);
    assert!(matches!(result, Err(BackendError::Validation(_))));
    // Rejected before any staging buffer was made.
    assert!(device.call_log().is_empty());
    assert_eq!(allocator.stats().uploads, 0);

    allocator.destroy(&mut device, buffer);
    allocator.shutdown(&mut device);
}

#[test]
fn test_image_layer_upload_and_read_back() {
    let mut device = headless();
    let mut allocator = ResourceAllocator::new(&mut device).unwrap();
    let extent = Extent2D::new(4, 2);
    let image = allocator
        .create_image(
            &mut device,
            &ImageRequest::new(
                "layers",
                Format::Rgba8Unorm,
                extent,
                ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST | ImageUsage::TRANSFER_SRC,
            )
            .with_layers(3, true),
        )
        .unwrap();
    assert_eq!(image.layer_views.len(), 3);

    let bytes = pattern(image.size() as usize);
    allocator.upload(&mut device, &image, &bytes).unwrap();

    let layer = 2;
    let back = allocator
        .read_back_image(
            &mut device,
            &lightfield_renderer::resources::ImageReadback {
                image: image.image,
                format: image.format,
                extent,
                layer,
                layout: ImageLayout::ShaderReadOnly,
            },
        )
        .unwrap();
    let layer_size = image.layer_size() as usize;
    assert_eq!(back, bytes[layer as usize * layer_size..(layer as usize + 1) * layer_size]);

    allocator.destroy(&mut device, image);
    allocator.shutdown(&mut device);
    assert_eq!(device.live_image_count(), 0);
}

// ============================================================================
// Statistics
// ============================================================================

#[test]
fn test_stats_dump_is_json() {
    let mut device = headless();
    let mut allocator = ResourceAllocator::new(&mut device).unwrap();
    let small = device_buffer(&mut device, &mut allocator, 256);
    let large = device_buffer(&mut device, &mut allocator, 4096);
    allocator.upload(&mut device, &small, &pattern(128)).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("allocator.json");
    allocator.dump_stats_json(&device, &path).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(json["backend"], "headless");
    assert_eq!(json["stats"]["live_buffers"], 2);
    assert_eq!(json["stats"]["live_buffer_bytes"], 256 + 4096);
    assert_eq!(json["stats"]["uploads"], 1);
    assert_eq!(json["stats"]["uploaded_bytes"], 128);
    let resources = json["resources"].as_array().unwrap();
    assert_eq!(resources.len(), 2);
    // Largest first.
    assert_eq!(resources[0]["bytes"], 4096);
    assert!(json["device_memory"].is_object());

    allocator.destroy(&mut device, small);
    allocator.destroy(&mut device, large);
    assert_eq!(allocator.stats().peak_bytes, 256 + 4096);
    allocator.shutdown(&mut device);
}

#[test]
fn test_renderer_report_written_to_configured_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.json");
    let config = config_for(PipelineKind::Lightfield).with_allocator_report(&path);
    let mut renderer = renderer(headless(), config);
    renderer.render_frame(None).unwrap();

    renderer.dump_configured_report().unwrap();
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert!(json["stats"]["live_images"].as_u64().unwrap() >= 3);
}

// ============================================================================
// Per-slot uniform data
// ============================================================================

#[test]
fn test_ring_uniform_keeps_slots_apart() {
    let mut device = headless();
    let mut allocator = ResourceAllocator::new(&mut device).unwrap();
    let mut uniform = RingUniformBuffer::new(&mut device, &mut allocator, "camera", 16, 3).unwrap();
    assert_eq!(uniform.copies(), 3);

    for slot in 0..3u8 {
        uniform
            .write(&mut device, SlotIndex(slot as usize), &[slot + 1; 16])
            .unwrap();
    }
    for slot in 0..3u8 {
        let binding = uniform.descriptor_binding(SlotIndex(slot as usize));
        assert_eq!(device.buffer_contents(binding.buffer).unwrap(), vec![slot + 1; 16]);
    }

    uniform.destroy(&mut device, &mut allocator);
    allocator.shutdown(&mut device);
}

/// Camera sets alternate with the ring slot; the static light set does not.
#[rstest]
#[case::deferred(PipelineKind::Deferred)]
#[case::lightfield(PipelineKind::Lightfield)]
fn test_descriptor_pool_scales_with_ring(#[case] kind: PipelineKind) {
    const FRAMES_IN_FLIGHT: usize = 40;
    let config = config_for(kind).with_frames_in_flight(FRAMES_IN_FLIGHT);
    let mut renderer = renderer(headless(), config);
    for _ in 0..FRAMES_IN_FLIGHT {
        assert_eq!(renderer.render_frame(None).unwrap(), FrameStatus::Presented);
    }
    assert_eq!(renderer.ring().size(), FRAMES_IN_FLIGHT);
}

#[rstest]
#[case::double(2)]
#[case::triple(3)]
fn test_frame_sets_follow_ring_slot(#[case] frames_in_flight: usize) {
    let config = config_for(PipelineKind::Deferred).with_frames_in_flight(frames_in_flight);
    let mut renderer = renderer(headless(), config);
    renderer.device().clear_call_log();

    let frames = 2 * frames_in_flight;
    for _ in 0..frames {
        renderer.render_frame(None).unwrap();
    }

    // Lighting binds camera, G-buffer and light sets in one call per frame.
    let lighting: Vec<Vec<DescriptorSetHandle>> = renderer
        .device()
        .call_log()
        .into_iter()
        .filter_map(|c| match c {
            DeviceCall::BindDescriptorSets { sets, .. } if sets.len() == 3 => Some(sets),
            _ => None,
        })
        .collect();
    assert_eq!(lighting.len(), frames);

    let cameras: HashSet<_> = lighting.iter().map(|sets| sets[0]).collect();
    let lights: HashSet<_> = lighting.iter().map(|sets| sets[2]).collect();
    assert_eq!(cameras.len(), frames_in_flight);
    assert_eq!(lights.len(), 1);
    for (k, sets) in lighting.iter().enumerate() {
        assert_eq!(sets[0], lighting[k % frames_in_flight][0]);
    }
}
