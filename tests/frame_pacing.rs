mod common;

use common::{small_settings, Harness};
use wgpu_passes::renderer::{Command, FenceMode};
use wgpu_passes::settings::Resolution;
use wgpu_passes::{DeviceError, RenderError};

#[test]
fn third_frame_waits_for_the_first_submission() {
    let mut h = Harness::with_fence_mode(small_settings(), FenceMode::Manual);

    h.render().unwrap();
    h.render().unwrap();
    assert_eq!(h.device.submissions().len(), 2);

    // Slot 0 is still owned by frame 0.
    match h.render() {
        Err(RenderError::SyncTimeout { frame, .. }) => assert_eq!(frame, 0),
        other => panic!("expected a sync timeout, got {other:?}"),
    }
    assert_eq!(h.device.submissions().len(), 2);
    assert_eq!(h.renderer.frame_count(), 2);

    h.device.fence(0).unwrap().signal();
    let stats = h.render().unwrap();
    assert_eq!(stats.frame, 2);
    assert_eq!(h.device.submissions().len(), 3);
}

#[test]
fn frames_alternate_between_slots() {
    let mut h = Harness::new(small_settings());
    let mut globals = Vec::new();
    for _ in 0..4 {
        let commands = h.render_commands();
        globals.push(common::globals_binding(&commands).unwrap().buffer);
    }
    assert_ne!(globals[0], globals[1]);
    assert_eq!(globals[0], globals[2]);
    assert_eq!(globals[1], globals[3]);
}

#[test]
fn one_submission_per_frame() {
    let mut h = Harness::new(small_settings());
    let commands = h.render_commands();
    let submits = commands
        .iter()
        .filter(|command| matches!(command, Command::Submit { .. }))
        .count();
    assert_eq!(submits, 1);
    assert!(matches!(commands.last(), Some(Command::Submit { .. })));
}

#[test]
fn result_accessors_lag_one_frame_behind() {
    let mut h = Harness::new(small_settings());
    assert_eq!(h.renderer.result_texture(), None);

    h.render().unwrap();
    assert_eq!(h.renderer.result_frame(), None);

    h.render().unwrap();
    assert_eq!(h.renderer.result_frame(), Some(0));
    let texture = h.renderer.result_texture().unwrap();
    assert!(h.device.texture_label(texture).is_some());
}

#[test]
fn single_frame_in_flight_exposes_the_latest_frame() {
    let settings = wgpu_passes::RenderSettings {
        frames_in_flight: 1,
        ..small_settings()
    };
    let mut h = Harness::new(settings);
    h.render().unwrap();
    assert_eq!(h.renderer.result_frame(), Some(0));
    h.render().unwrap();
    assert_eq!(h.renderer.result_frame(), Some(1));
}

#[test]
fn changing_frame_count_between_frames_keeps_rendering() {
    let mut h = Harness::new(small_settings());
    h.render().unwrap();
    h.render().unwrap();

    let settings = wgpu_passes::RenderSettings {
        frames_in_flight: 3,
        ..small_settings()
    };
    h.renderer.update_settings(&mut h.device, settings).unwrap();
    assert_eq!(h.renderer.result_frame(), None);

    let mut globals = Vec::new();
    for _ in 0..3 {
        let commands = h.render_commands();
        globals.push(common::globals_binding(&commands).unwrap().buffer);
    }
    globals.sort();
    globals.dedup();
    assert_eq!(globals.len(), 3);
}

#[test]
fn failed_frame_count_change_keeps_the_old_slots() {
    let mut h = Harness::new(small_settings());
    h.render().unwrap();
    let textures = h.device.live_texture_count();

    h.device.set_max_buffer_size(Some(64));
    let settings = wgpu_passes::RenderSettings {
        frames_in_flight: 3,
        ..small_settings()
    };
    assert!(matches!(
        h.renderer.update_settings(&mut h.device, settings),
        Err(RenderError::Device(DeviceError::OutOfMemory { .. }))
    ));
    assert_eq!(h.renderer.settings().frames_in_flight, 2);
    assert_eq!(h.device.live_texture_count(), textures);

    h.device.set_max_buffer_size(None);
    h.render().unwrap();
    h.render().unwrap();
    assert_eq!(h.renderer.frame_count(), 3);
}

#[test]
fn resize_retried_after_a_timeout_recreates_the_targets() {
    let mut h = Harness::with_fence_mode(small_settings(), FenceMode::Manual);
    h.render().unwrap();

    let settings = wgpu_passes::RenderSettings {
        resolution: Resolution {
            width: 64,
            height: 64,
        },
        ..small_settings()
    };
    assert!(matches!(
        h.renderer.update_settings(&mut h.device, settings.clone()),
        Err(RenderError::SyncTimeout { frame: 0, .. })
    ));
    assert_eq!(h.renderer.settings().resolution.width, 32);

    h.device.fence(0).unwrap().signal();
    h.renderer.update_settings(&mut h.device, settings).unwrap();
    assert_eq!(h.renderer.settings().resolution.width, 64);

    h.render().unwrap();
    h.device.fence(1).unwrap().signal();
    h.render().unwrap();
    let texture = h.renderer.result_texture().unwrap();
    assert_eq!(h.device.texture_contents(texture).unwrap().len(), 64 * 64 * 4);
}
