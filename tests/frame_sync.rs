//! Frame ring ordering, bounded frames in flight and shutdown draining,
//! exercised through the renderer on the headless device.

mod common;

use common::{config_for, headless, renderer};
use lightfield_renderer::backend::headless::DeviceCall;
use lightfield_renderer::backend::traits::FenceHandle;
use lightfield_renderer::{BackendError, FrameStatus, PipelineKind};
use rstest::rstest;
use std::collections::HashSet;
use std::thread;
use std::time::Duration;

// ============================================================================
// Ordering
// ============================================================================

/// Whether `fence` was waited on after its last submission before `end`.
fn waited_since_last_submit(calls: &[DeviceCall], fence: FenceHandle, end: usize) -> bool {
    for call in calls[..end].iter().rev() {
        match call {
            DeviceCall::WaitFence(f) if *f == fence => return true,
            DeviceCall::Submit { fence: Some(f), .. } if *f == fence => return false,
            _ => {}
        }
    }
    false
}

#[rstest]
#[case::single(1)]
#[case::double(2)]
#[case::triple(3)]
fn test_fence_waited_before_every_reset(#[case] frames_in_flight: usize) {
    let config = config_for(PipelineKind::Lightfield).with_frames_in_flight(frames_in_flight);
    let mut renderer = renderer(headless(), config);
    renderer.device().clear_call_log();

    let frames = 3 * frames_in_flight + 1;
    for _ in 0..frames {
        assert_eq!(renderer.render_frame(None).unwrap(), FrameStatus::Presented);
    }

    let calls = renderer.device().call_log();
    let resets: Vec<(usize, FenceHandle)> = calls
        .iter()
        .enumerate()
        .filter_map(|(i, call)| match call {
            DeviceCall::ResetFence(f) => Some((i, *f)),
            _ => None,
        })
        .collect();
    assert_eq!(resets.len(), frames);
    for (index, fence) in resets {
        assert!(
            waited_since_last_submit(&calls, fence, index),
            "fence {:?} reset at call {} without a wait",
            fence,
            index
        );
    }
}

#[rstest]
#[case::double(2)]
#[case::triple(3)]
fn test_slots_rotate_in_order(#[case] frames_in_flight: usize) {
    let config = config_for(PipelineKind::Lightfield).with_frames_in_flight(frames_in_flight);
    let mut renderer = renderer(headless(), config);
    renderer.device().clear_call_log();

    for _ in 0..2 * frames_in_flight {
        renderer.render_frame(None).unwrap();
    }

    let fences: Vec<FenceHandle> = renderer
        .device()
        .call_log()
        .iter()
        .filter_map(|call| match call {
            DeviceCall::Submit { fence: Some(f), .. } => Some(*f),
            _ => None,
        })
        .collect();
    assert_eq!(fences.len(), 2 * frames_in_flight);

    let distinct: HashSet<_> = fences.iter().collect();
    assert_eq!(distinct.len(), frames_in_flight);
    for (k, fence) in fences.iter().enumerate() {
        assert_eq!(*fence, fences[k % frames_in_flight], "frame {}", k);
    }
}

#[test]
fn test_submission_chains_slot_semaphores() {
    let mut renderer = renderer(headless(), config_for(PipelineKind::Lightfield));
    renderer.device().clear_call_log();
    renderer.render_frame(None).unwrap();

    let slot = *renderer.ring().slot(lightfield_renderer::frame::SlotIndex(0));
    let calls = renderer.device().call_log();

    let acquire = calls
        .iter()
        .position(|c| {
            matches!(c, DeviceCall::AcquireImage { signal, .. } if *signal == slot.image_available)
        })
        .expect("acquire signals imageAvailable");
    let submit = calls
        .iter()
        .position(|c| {
            matches!(
                c,
                DeviceCall::Submit { wait: Some((w, _)), signal: Some(s), fence: Some(f), .. }
                    if *w == slot.image_available
                        && *s == slot.render_finished
                        && *f == slot.fence
            )
        })
        .expect("submit chains the slot semaphores");
    let present = calls
        .iter()
        .position(|c| {
            matches!(c, DeviceCall::Present { wait, .. } if *wait == slot.render_finished)
        })
        .expect("present waits on renderFinished");
    assert!(acquire < submit && submit < present);
}

// ============================================================================
// Bounded frames in flight
// ============================================================================

#[rstest]
#[case::double(2)]
#[case::triple(3)]
fn test_no_more_than_ring_size_frames_in_flight(#[case] frames_in_flight: usize) {
    let config = config_for(PipelineKind::Lightfield)
        .with_frames_in_flight(frames_in_flight)
        .with_fence_timeout(Duration::from_millis(30));
    let mut renderer = renderer(headless(), config);
    renderer.device_mut().set_complete_submissions(false);
    let completer = renderer.device().completer();

    for _ in 0..frames_in_flight {
        assert_eq!(renderer.render_frame(None).unwrap(), FrameStatus::Presented);
    }
    assert_eq!(completer.pending(), frames_in_flight);

    let blocked = renderer.render_frame(None);
    assert!(matches!(blocked, Err(BackendError::Timeout { .. })));
    assert_eq!(renderer.ring().frame_number(), frames_in_flight as u64);

    assert_eq!(completer.complete_all(), frames_in_flight);
    assert_eq!(renderer.render_frame(None).unwrap(), FrameStatus::Presented);
    completer.complete_all();
}

#[test]
fn test_infinite_wait_released_by_gpu_completion() {
    let config = config_for(PipelineKind::Lightfield).with_frames_in_flight(1);
    let mut renderer = renderer(headless(), config);
    renderer.device_mut().set_complete_submissions(false);
    let completer = renderer.device().completer();

    renderer.render_frame(None).unwrap();
    let worker = {
        let completer = completer.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            completer.complete_all()
        })
    };
    // Blocks on the single slot until the worker completes the first frame.
    assert_eq!(renderer.render_frame(None).unwrap(), FrameStatus::Presented);
    assert_eq!(worker.join().unwrap(), 1);
    assert_eq!(completer.complete_all(), 1);
}

// ============================================================================
// Shutdown
// ============================================================================

const OBJECT_KINDS: &[&str] = &[
    "fence",
    "semaphore",
    "command_pool",
    "command_buffer",
    "swapchain",
    "image",
    "image_view",
    "sampler",
    "buffer",
    "shader_module",
    "render_pass",
    "framebuffer",
    "descriptor_set_layout",
    "descriptor_pool",
    "pipeline_layout",
    "pipeline",
];

#[rstest]
#[case::lightfield(PipelineKind::Lightfield)]
#[case::deferred(PipelineKind::Deferred)]
fn test_shutdown_drains_in_flight_frames(#[case] kind: PipelineKind) {
    let mut renderer = renderer(headless(), config_for(kind).with_frames_in_flight(3));
    renderer.device_mut().set_complete_submissions(false);
    let completer = renderer.device().completer();
    let log = renderer.device().call_log_handle();

    renderer.render_frame(None).unwrap();
    renderer.render_frame(None).unwrap();
    assert_eq!(completer.pending(), 2);
    log.clear();

    let worker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        completer.complete_all()
    });
    drop(renderer);
    assert_eq!(worker.join().unwrap(), 2);

    let calls = log.entries();
    let first_destroy = calls
        .iter()
        .position(DeviceCall::is_destroy)
        .expect("shutdown destroys objects");
    let waits = calls[..first_destroy]
        .iter()
        .filter(|c| matches!(c, DeviceCall::WaitFence(_)))
        .count();
    assert_eq!(waits, 3, "every slot fence is waited before teardown");
    assert!(calls[..first_destroy].contains(&DeviceCall::WaitIdle));

    for kind in OBJECT_KINDS {
        assert!(log.live(kind).is_empty(), "{} objects leaked", kind);
    }
}

#[test]
fn test_shutdown_after_abandoned_frame() {
    // An out-of-date acquire abandons the frame before its fence is reset.
    let mut renderer = renderer(headless(), config_for(PipelineKind::Lightfield));
    renderer.render_frame(None).unwrap();
    renderer
        .device_mut()
        .script_acquire(lightfield_renderer::backend::traits::AcquireOutcome::OutOfDate);
    assert_eq!(renderer.render_frame(None).unwrap(), FrameStatus::Recreated);

    let log = renderer.device().call_log_handle();
    drop(renderer);
    for kind in OBJECT_KINDS {
        assert!(log.live(kind).is_empty(), "{} objects leaked", kind);
    }
}
