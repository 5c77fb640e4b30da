//! Swapchain negotiation, recreation and acquire/present outcomes.

mod common;

use common::{config_for, headless, renderer};
use lightfield_renderer::backend::headless::DeviceCall;
use lightfield_renderer::backend::traits::*;
use lightfield_renderer::backend::types::*;
use lightfield_renderer::swapchain::{SwapchainDependent, SwapchainManager, SwapchainState};
use lightfield_renderer::{BackendError, FrameStatus, PipelineKind, PresentModePreference};
use rstest::rstest;

/// Counts dependent rebuilds and remembers the extent they saw.
#[derive(Default)]
struct Dependents {
    released: usize,
    rebuilt: usize,
    extent: Option<Extent2D>,
}

impl SwapchainDependent for Dependents {
    fn release_swapchain_resources(&mut self, _device: &mut dyn GpuDevice) {
        self.released += 1;
    }

    fn rebuild_swapchain_resources(
        &mut self,
        _device: &mut dyn GpuDevice,
        state: &SwapchainState,
    ) -> BackendResult<()> {
        self.rebuilt += 1;
        self.extent = Some(state.extent);
        Ok(())
    }
}

// ============================================================================
// Recreation
// ============================================================================

#[rstest]
#[case::square(Extent2D::new(64, 64))]
#[case::wide(Extent2D::new(320, 180))]
#[case::one_pixel(Extent2D::new(1, 1))]
fn test_recreate_is_idempotent(#[case] extent: Extent2D) {
    let mut device = headless();
    device.set_surface_extent(extent);
    let mut swapchain =
        SwapchainManager::create(&mut device, extent, PresentModePreference::LowLatency, None)
            .unwrap();
    let mut dependents = Dependents::default();

    swapchain.recreate(&mut device, extent, &mut dependents).unwrap();
    let first = swapchain.state().unwrap().negotiated();
    swapchain.recreate(&mut device, extent, &mut dependents).unwrap();
    let second = swapchain.state().unwrap().negotiated();

    assert_eq!(first, second);
    assert_eq!(first.2, extent);
    assert_eq!(dependents.released, 2);
    assert_eq!(dependents.rebuilt, 2);
    assert_eq!(dependents.extent, Some(extent));
    assert_eq!(swapchain.generation(), 3);

    swapchain.destroy(&mut device);
}

#[test]
fn test_recreate_waits_idle_before_destroying() {
    let mut device = headless();
    let mut swapchain = SwapchainManager::create(
        &mut device,
        common::SURFACE,
        PresentModePreference::Vsync,
        None,
    )
    .unwrap();
    let old = swapchain.state().unwrap().handle;
    device.clear_call_log();

    swapchain
        .recreate(&mut device, common::SURFACE, &mut Dependents::default())
        .unwrap();

    let calls = device.call_log();
    let idle = calls.iter().position(|c| *c == DeviceCall::WaitIdle).unwrap();
    let destroyed = calls
        .iter()
        .position(|c| matches!(c, DeviceCall::Destroy { kind: "swapchain", .. }))
        .unwrap();
    assert!(idle < destroyed);
    assert_ne!(swapchain.state().unwrap().handle, old);
    swapchain.destroy(&mut device);
}

#[test]
fn test_negotiation_on_default_surface() {
    let mut device = headless();
    let swapchain = SwapchainManager::create(
        &mut device,
        common::SURFACE,
        PresentModePreference::LowLatency,
        None,
    )
    .unwrap();
    let (format, mode, extent, count) = swapchain.state().unwrap().negotiated();
    assert_eq!(format.format, Format::Bgra8Srgb);
    assert_eq!(mode, PresentMode::Mailbox);
    assert_eq!(extent, common::SURFACE);
    assert_eq!(count, 3);

    let mut swapchain = swapchain;
    swapchain.destroy(&mut device);
}

#[test]
fn test_resize_rebuilds_graph_at_new_extent() {
    let mut renderer = renderer(headless(), config_for(PipelineKind::Deferred));
    let before = renderer.device().live_image_count();

    let extent = Extent2D::new(96, 40);
    renderer.device_mut().set_surface_extent(extent);
    renderer.resize(extent.width, extent.height);

    assert_eq!(renderer.render_frame(None).unwrap(), FrameStatus::Recreated);
    assert_eq!(renderer.swapchain().state().unwrap().extent, extent);
    // Attachments were replaced, not accumulated.
    assert_eq!(renderer.device().live_image_count(), before);
    assert_eq!(renderer.render_frame(None).unwrap(), FrameStatus::Presented);
}

// ============================================================================
// Acquire outcomes
// ============================================================================

#[test]
fn test_out_of_range_acquire_is_an_error() {
    let mut renderer = renderer(headless(), config_for(PipelineKind::Lightfield));
    renderer.device_mut().script_acquire(AcquireOutcome::Acquired {
        index: 99,
        suboptimal: false,
    });

    let result = renderer.render_frame(None);
    assert!(matches!(result, Err(BackendError::AcquireImageFailed(_))));

    // The slot was never reset, so the next frame proceeds normally.
    assert_eq!(renderer.render_frame(None).unwrap(), FrameStatus::Presented);
}

#[test]
fn test_suboptimal_acquire_is_used() {
    let mut renderer = renderer(headless(), config_for(PipelineKind::Lightfield));
    renderer.device_mut().script_acquire(AcquireOutcome::Acquired {
        index: 1,
        suboptimal: true,
    });
    renderer.device().clear_call_log();
    let generation = renderer.swapchain().generation();

    assert_eq!(renderer.render_frame(None).unwrap(), FrameStatus::Presented);
    assert_eq!(common::last_presented(&renderer.device().call_log()), Some(1));
    assert_eq!(renderer.swapchain().generation(), generation);
}

#[test]
fn test_out_of_date_acquire_leaves_fence_signaled() {
    let mut renderer = renderer(headless(), config_for(PipelineKind::Lightfield));
    renderer.device_mut().script_acquire(AcquireOutcome::OutOfDate);
    renderer.device().clear_call_log();
    let frame = renderer.ring().frame_number();

    assert_eq!(renderer.render_frame(None).unwrap(), FrameStatus::Recreated);
    let calls = renderer.device().call_log();
    assert!(!calls.iter().any(|c| matches!(c, DeviceCall::ResetFence(_))));
    assert!(!calls.iter().any(|c| matches!(c, DeviceCall::Submit { .. })));
    assert_eq!(renderer.ring().frame_number(), frame);
    assert_eq!(renderer.swapchain().generation(), 2);

    assert_eq!(renderer.render_frame(None).unwrap(), FrameStatus::Presented);
}

#[test]
fn test_surface_change_detected_on_acquire() {
    let mut renderer = renderer(headless(), config_for(PipelineKind::Lightfield));
    renderer.device_mut().set_surface_extent(Extent2D::new(48, 48));

    assert_eq!(renderer.render_frame(None).unwrap(), FrameStatus::Recreated);
    assert_eq!(
        renderer.swapchain().state().unwrap().extent,
        Extent2D::new(48, 48)
    );
    assert_eq!(renderer.render_frame(None).unwrap(), FrameStatus::Presented);
}

// ============================================================================
// Present outcomes
// ============================================================================

#[rstest]
#[case::suboptimal(PresentOutcome::Suboptimal)]
#[case::out_of_date(PresentOutcome::OutOfDate)]
fn test_stale_present_recreates(#[case] outcome: PresentOutcome) {
    let mut renderer = renderer(headless(), config_for(PipelineKind::Lightfield));
    renderer.device_mut().script_present(outcome);
    let frame = renderer.ring().frame_number();

    assert_eq!(renderer.render_frame(None).unwrap(), FrameStatus::Recreated);
    // The frame was submitted, so the ring still moved on.
    assert_eq!(renderer.ring().frame_number(), frame + 1);
    assert_eq!(renderer.swapchain().generation(), 2);
    assert_eq!(renderer.render_frame(None).unwrap(), FrameStatus::Presented);
}

// ============================================================================
// Minimized windows
// ============================================================================

#[test]
fn test_zero_area_skips_until_restored() {
    let mut renderer = renderer(headless(), config_for(PipelineKind::Deferred));
    renderer.resize(0, 0);
    renderer.device().clear_call_log();

    for _ in 0..3 {
        assert_eq!(renderer.render_frame(None).unwrap(), FrameStatus::Skipped);
    }
    assert!(renderer.device().call_log().is_empty());

    renderer.resize(common::SURFACE.width, common::SURFACE.height);
    assert_eq!(renderer.render_frame(None).unwrap(), FrameStatus::Recreated);
    assert_eq!(renderer.render_frame(None).unwrap(), FrameStatus::Presented);
}
