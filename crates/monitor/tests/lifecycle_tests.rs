//! Lifecycle controller integration tests
//!
//! Drive the controller the way a host backend does (raw notifications,
//! possibly from several threads) and observe it the way a consumer does
//! (subscriptions, device list, open/close).

use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, MockControlBlock, mock_raw_camera, mock_raw_composite_camera,
    mock_raw_mass_storage, with_timeout,
};
use common::{DeviceId, DeviceIdentity, HostEvent, RawDevice};
use monitor::lifecycle::{
    CameraFilter, ControllerOptions, DenialReason, LifecycleController, LifecycleError,
    LifecycleEvent, PermissionState, PromptPolicy, RequestOutcome,
};
use monitor::test_utils::{MockHost, MockTransport, RecordingObserver};
use monitor::CaptureConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct Harness {
    host: Arc<MockHost>,
    transport: Arc<MockTransport>,
    controller: Arc<LifecycleController>,
    observer: Arc<RecordingObserver>,
}

impl Harness {
    fn new() -> Self {
        Self::with_options(ControllerOptions::default())
    }

    fn with_options(options: ControllerOptions) -> Self {
        let host = Arc::new(MockHost::new());
        let transport = Arc::new(MockTransport::new());
        let controller = Arc::new(LifecycleController::new(
            host.clone(),
            transport.clone(),
            options,
        ));
        let observer = RecordingObserver::new();
        controller.subscribe(observer.clone());

        Self {
            host,
            transport,
            controller,
            observer,
        }
    }

    fn grant(&self, raw: &RawDevice) -> Arc<std::sync::atomic::AtomicBool> {
        let block = MockControlBlock::new(raw.id);
        let released = block.released_flag();
        self.controller
            .permission_granted(&DeviceIdentity::from_raw(raw), Box::new(block));
        released
    }
}

fn identity(raw: &RawDevice) -> DeviceIdentity {
    DeviceIdentity::from_raw(raw)
}

#[test]
fn test_camera_full_lifecycle() {
    let h = Harness::new();
    let cam = mock_raw_camera(1, 0x046d, 0x0825);

    h.controller.attach(&cam);
    assert_eq!(h.observer.kinds(), vec!["attached"]);
    assert_eq!(h.host.prompt_count(cam.id), 1);
    assert_eq!(
        h.controller.permission_state(cam.id),
        Some(PermissionState::Pending)
    );

    let released = h.grant(&cam);
    assert_eq!(h.observer.kinds(), vec!["attached", "permission-granted"]);
    assert!(h.controller.has_permission(cam.id));

    h.controller.open(cam.id, &CaptureConfig::default()).unwrap();
    assert!(h.controller.is_open(cam.id));
    assert_eq!(h.transport.opened(), 1);

    h.controller.detach(&cam);
    assert_eq!(
        h.observer.kinds(),
        vec!["attached", "permission-granted", "detached"]
    );
    assert_eq!(h.transport.closed(), 1);
    assert!(released.load(Ordering::SeqCst));
    assert!(!h.controller.has_permission(cam.id));
    assert!(h.controller.devices().is_empty());

    // Every event carries the identity captured at attach time
    for event in h.observer.events() {
        assert_eq!(event.device(), &identity(&cam));
        assert_eq!(event.device().name(), "Test Camera 1");
    }
}

#[test]
fn test_non_camera_produces_nothing() {
    let h = Harness::new();
    let storage = mock_raw_mass_storage(2);

    h.controller.attach(&storage);
    h.controller.detach(&storage);

    assert!(h.observer.events().is_empty());
    assert!(h.host.prompts().is_empty());
    assert!(h.controller.devices().is_empty());
}

#[test]
fn test_composite_camera_is_managed() {
    let h = Harness::new();
    let cam = mock_raw_composite_camera(3, 0x0c45, 0x6366);

    h.controller.attach(&cam);
    assert_eq!(h.controller.devices().len(), 1);
}

#[test]
fn test_allow_listed_device_is_managed() {
    let filter = CameraFilter::from_patterns(&["0x0781:*"]).unwrap();
    let h = Harness::with_options(ControllerOptions {
        filter,
        ..ControllerOptions::default()
    });

    h.controller.attach(&mock_raw_mass_storage(2));
    assert_eq!(h.observer.kinds(), vec!["attached"]);
}

#[test]
fn test_late_deny_after_detach_is_ignored() {
    let h = Harness::new();
    let cam = mock_raw_camera(3, 0x046d, 0x0825);

    h.controller.attach(&cam);
    h.controller.detach(&cam);
    h.controller.permission_denied(&identity(&cam));
    h.controller.permission_request_cancelled(&identity(&cam));

    assert_eq!(h.observer.kinds(), vec!["attached", "detached"]);
    assert!(h.controller.devices().is_empty());
    assert_eq!(h.controller.permission_state(cam.id), None);
}

#[test]
fn test_late_grant_after_detach_releases_channel() {
    let h = Harness::new();
    let cam = mock_raw_camera(4, 0x046d, 0x0825);

    h.controller.attach(&cam);
    h.controller.detach(&cam);
    let released = h.grant(&cam);

    assert!(released.load(Ordering::SeqCst));
    assert_eq!(h.observer.kinds(), vec!["attached", "detached"]);
    assert_eq!(
        h.controller.open(cam.id, &CaptureConfig::default()),
        Err(LifecycleError::UnknownDevice(cam.id))
    );
}

#[test]
fn test_duplicate_notifications_are_idempotent() {
    let h = Harness::new();
    let cam = mock_raw_camera(5, 0x046d, 0x0825);

    h.controller.attach(&cam);
    h.controller.attach(&cam);
    h.grant(&cam);
    let second = h.grant(&cam);
    h.controller.detach(&cam);
    h.controller.detach(&cam);

    assert!(second.load(Ordering::SeqCst));
    assert_eq!(
        h.observer.kinds(),
        vec!["attached", "permission-granted", "detached"]
    );
    assert_eq!(h.host.prompt_count(cam.id), 1);
}

#[test]
fn test_denial_then_manual_retry() {
    let h = Harness::new();
    let cam = mock_raw_camera(6, 0x046d, 0x0825);

    h.controller.attach(&cam);
    h.controller.permission_denied(&identity(&cam));
    assert_eq!(
        h.controller.permission_state(cam.id),
        Some(PermissionState::Denied)
    );
    assert_eq!(
        h.controller.open(cam.id, &CaptureConfig::default()),
        Err(LifecycleError::NotPermitted(cam.id))
    );

    assert_eq!(
        h.controller.request_permission(cam.id),
        Ok(RequestOutcome::Prompt)
    );
    assert_eq!(
        h.controller.request_permission(cam.id),
        Ok(RequestOutcome::AlreadyPending)
    );
    assert_eq!(h.host.prompt_count(cam.id), 2);

    h.grant(&cam);
    assert_eq!(
        h.controller.request_permission(cam.id),
        Ok(RequestOutcome::AlreadyGranted)
    );
    assert_eq!(
        h.controller.request_permission(DeviceId(999)),
        Err(LifecycleError::UnknownDevice(DeviceId(999)))
    );

    let denied = h
        .observer
        .events()
        .into_iter()
        .find_map(|e| match e {
            LifecycleEvent::PermissionDenied { reason, .. } => Some(reason),
            _ => None,
        });
    assert_eq!(denied, Some(DenialReason::Denied));
}

#[test]
fn test_channel_loss_closes_session() {
    let h = Harness::new();
    let cam = mock_raw_camera(7, 0x046d, 0x0825);

    h.controller.attach(&cam);
    let released = h.grant(&cam);
    h.controller.open(cam.id, &CaptureConfig::default()).unwrap();

    h.controller.control_channel_lost(&identity(&cam));
    assert!(!h.controller.is_open(cam.id));
    assert!(released.load(Ordering::SeqCst));
    assert_eq!(h.transport.closed(), 1);
    assert_eq!(
        h.controller.open(cam.id, &CaptureConfig::default()),
        Err(LifecycleError::NotPermitted(cam.id))
    );

    match h.observer.events().last() {
        Some(LifecycleEvent::PermissionDenied { reason, .. }) => {
            assert_eq!(*reason, DenialReason::Revoked)
        }
        other => panic!("unexpected last event: {:?}", other),
    }

    // A second loss report changes nothing
    h.controller.control_channel_lost(&identity(&cam));
    assert_eq!(h.observer.events().len(), 3);
}

#[test]
fn test_close_is_idempotent() {
    let h = Harness::new();
    let cam = mock_raw_camera(8, 0x046d, 0x0825);

    h.controller.attach(&cam);
    h.grant(&cam);
    h.controller.open(cam.id, &CaptureConfig::default()).unwrap();

    assert_eq!(h.controller.close(cam.id), Ok(true));
    assert_eq!(h.controller.close(cam.id), Ok(false));
    assert_eq!(h.transport.closed(), 1);

    // Reopen after close
    h.controller.open(cam.id, &CaptureConfig::default()).unwrap();
    assert_eq!(h.transport.opened(), 2);
}

#[test]
fn test_transport_failure_is_surfaced() {
    let host = Arc::new(MockHost::new());
    let controller = LifecycleController::new(
        host,
        Arc::new(MockTransport::failing("no bandwidth")),
        ControllerOptions::default(),
    );
    let cam = mock_raw_camera(9, 0x046d, 0x0825);

    controller.attach(&cam);
    controller.permission_granted(&identity(&cam), Box::new(MockControlBlock::new(cam.id)));

    match controller.open(cam.id, &CaptureConfig::default()) {
        Err(LifecycleError::Transport { device, message }) => {
            assert_eq!(device, cam.id);
            assert_eq!(message, "no bandwidth");
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(!controller.is_open(cam.id));
    assert!(controller.has_permission(cam.id));
}

#[test]
fn test_events_are_ordered_per_device() {
    let h = Harness::new();
    let a = mock_raw_camera(10, 0x046d, 0x0825);
    let b = mock_raw_camera(11, 0x046d, 0x0826);

    h.controller.attach(&a);
    h.controller.attach(&b);
    h.grant(&b);
    h.controller.permission_denied(&identity(&a));
    h.controller.detach(&a);
    h.controller.detach(&b);

    let per_device = |id: DeviceId| -> Vec<&'static str> {
        h.observer
            .events()
            .iter()
            .filter(|e| e.device().id() == id)
            .map(|e| e.kind())
            .collect()
    };
    assert_eq!(
        per_device(a.id),
        vec!["attached", "permission-denied", "detached"]
    );
    assert_eq!(
        per_device(b.id),
        vec!["attached", "permission-granted", "detached"]
    );
}

#[test]
fn test_device_list_keeps_attach_order() {
    let h = Harness::new();
    for id in [20, 12, 31] {
        h.controller.attach(&mock_raw_camera(id, 0x046d, 0x0825));
    }
    h.grant(&mock_raw_camera(12, 0x046d, 0x0825));

    let tiles = h.controller.devices();
    let ids: Vec<u32> = tiles.iter().map(|t| t.identity.id().0).collect();
    assert_eq!(ids, vec![20, 12, 31]);
    assert_eq!(tiles[1].permission, PermissionState::Granted);
    assert_eq!(tiles[0].permission, PermissionState::Pending);
}

#[test]
fn test_unsubscribe_inside_handler() {
    let h = Harness::new();
    let delivered = Arc::new(AtomicUsize::new(0));
    let token = Arc::new(Mutex::new(None));

    let weak = Arc::downgrade(&h.controller);
    let count = delivered.clone();
    let own_token = token.clone();
    let subscribed = h.controller.subscribe_fn(move |_: &LifecycleEvent| {
        count.fetch_add(1, Ordering::SeqCst);
        if let (Some(controller), Some(token)) = (weak.upgrade(), *own_token.lock().unwrap()) {
            assert!(controller.unsubscribe(token));
        }
        Ok(())
    });
    *token.lock().unwrap() = Some(subscribed);

    let cam = mock_raw_camera(13, 0x046d, 0x0825);
    h.controller.attach(&cam);
    h.grant(&cam);
    h.controller.detach(&cam);

    assert_eq!(delivered.load(Ordering::SeqCst), 1);
    assert_eq!(h.observer.events().len(), 3);
    assert!(!h.controller.unsubscribe(subscribed));
}

#[test]
fn test_subscribe_inside_handler_starts_with_next_event() {
    let h = Harness::new();
    let late = RecordingObserver::new();

    let weak = Arc::downgrade(&h.controller);
    let pending = Mutex::new(Some(late.clone()));
    h.controller.subscribe_fn(move |_: &LifecycleEvent| {
        if let (Some(controller), Some(late)) = (weak.upgrade(), pending.lock().unwrap().take()) {
            controller.subscribe(late);
        }
        Ok(())
    });

    let cam = mock_raw_camera(14, 0x046d, 0x0825);
    h.controller.attach(&cam);
    assert!(late.events().is_empty());

    h.grant(&cam);
    h.controller.detach(&cam);
    assert_eq!(late.kinds(), vec!["permission-granted", "detached"]);
    assert_eq!(h.observer.kinds(), vec!["attached", "permission-granted", "detached"]);
}

#[test]
fn test_unsubscribe_other_inside_handler_keeps_current_event() {
    let h = Harness::new();
    let target = Arc::new(Mutex::new(None));

    let weak = Arc::downgrade(&h.controller);
    let victim = target.clone();
    h.controller.subscribe_fn(move |_: &LifecycleEvent| {
        if let (Some(controller), Some(token)) = (weak.upgrade(), victim.lock().unwrap().take()) {
            assert!(controller.unsubscribe(token));
        }
        Ok(())
    });
    let removed = RecordingObserver::new();
    *target.lock().unwrap() = Some(h.controller.subscribe(removed.clone()));

    let cam = mock_raw_camera(15, 0x046d, 0x0825);
    h.controller.attach(&cam);
    h.grant(&cam);

    assert_eq!(removed.kinds(), vec!["attached"]);
    assert_eq!(h.observer.kinds(), vec!["attached", "permission-granted"]);
}

#[test]
fn test_open_from_grant_handler() {
    let h = Harness::new();
    let weak = Arc::downgrade(&h.controller);
    let results = Arc::new(Mutex::new(Vec::new()));

    let seen = results.clone();
    h.controller.subscribe_fn(move |event: &LifecycleEvent| {
        if let LifecycleEvent::PermissionGranted { device } = event {
            if let Some(controller) = weak.upgrade() {
                let result = controller.open(device.id(), &CaptureConfig::default());
                seen.lock().unwrap().push(result.clone());
                result?;
            }
        }
        Ok(())
    });

    let cam = mock_raw_camera(14, 0x046d, 0x0825);
    h.controller.attach(&cam);
    h.grant(&cam);

    assert_eq!(*results.lock().unwrap(), vec![Ok(())]);
    assert!(h.controller.is_open(cam.id));
    assert_eq!(h.transport.opened(), 1);
}

#[test]
fn test_retry_from_denial_handler() {
    let h = Harness::new();
    let weak = Arc::downgrade(&h.controller);
    let retried = Arc::new(AtomicUsize::new(0));

    let count = retried.clone();
    h.controller.subscribe_fn(move |event: &LifecycleEvent| {
        if let LifecycleEvent::PermissionDenied { device, .. } = event {
            if count.fetch_add(1, Ordering::SeqCst) == 0 {
                if let Some(controller) = weak.upgrade() {
                    assert_eq!(
                        controller.request_permission(device.id()),
                        Ok(RequestOutcome::Prompt)
                    );
                }
            }
        }
        Ok(())
    });

    let cam = mock_raw_camera(15, 0x046d, 0x0825);
    h.controller.attach(&cam);
    h.controller.permission_request_cancelled(&identity(&cam));

    assert_eq!(retried.load(Ordering::SeqCst), 1);
    assert_eq!(h.host.prompt_count(cam.id), 2);
    assert_eq!(
        h.controller.permission_state(cam.id),
        Some(PermissionState::Pending)
    );
}

#[test]
fn test_detach_observer_sees_no_handle() {
    let h = Harness::new();
    let weak = Arc::downgrade(&h.controller);
    let transport = h.transport.clone();
    let checked = Arc::new(AtomicUsize::new(0));

    let count = checked.clone();
    h.controller.subscribe_fn(move |event: &LifecycleEvent| {
        if let LifecycleEvent::Detached { device } = event {
            let controller = weak.upgrade().ok_or_else(|| anyhow::anyhow!("gone"))?;
            assert!(!controller.is_open(device.id()));
            assert!(controller.permission_state(device.id()).is_none());
            assert_eq!(transport.closed(), 1);
            count.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    });

    let cam = mock_raw_camera(16, 0x046d, 0x0825);
    h.controller.attach(&cam);
    h.grant(&cam);
    h.controller.open(cam.id, &CaptureConfig::default()).unwrap();
    h.controller.detach(&cam);

    assert_eq!(checked.load(Ordering::SeqCst), 1);
}

#[test]
fn test_faulty_observers_are_isolated() {
    let h = Harness::new();
    h.controller.subscribe_fn(|_: &LifecycleEvent| Err(anyhow::anyhow!("observer failed")));
    h.controller.subscribe_fn(|_: &LifecycleEvent| -> anyhow::Result<()> {
        panic!("observer bug")
    });
    let late = RecordingObserver::new();
    h.controller.subscribe(late.clone());

    let cam = mock_raw_camera(17, 0x046d, 0x0825);
    h.controller.attach(&cam);
    h.grant(&cam);

    assert_eq!(late.kinds(), vec!["attached", "permission-granted"]);
    assert!(h.controller.has_permission(cam.id));
}

#[test]
fn test_pre_granted_only_policy() {
    let h = Harness::with_options(ControllerOptions {
        prompt_policy: PromptPolicy::PreGrantedOnly,
        ..ControllerOptions::default()
    });
    let cam = mock_raw_camera(18, 0x046d, 0x0825);

    h.controller.attach(&cam);
    assert!(h.host.prompts().is_empty());
    assert_eq!(
        h.controller.permission_state(cam.id),
        Some(PermissionState::Unrequested)
    );

    h.host.set_pre_granted(true);
    let other = mock_raw_camera(19, 0x046d, 0x0825);
    h.controller.attach(&other);
    assert_eq!(h.host.prompts(), vec![other.id]);
}

#[test]
fn test_unless_denied_policy_remembers_model() {
    let h = Harness::with_options(ControllerOptions {
        prompt_policy: PromptPolicy::UnlessDenied,
        ..ControllerOptions::default()
    });
    let cam = mock_raw_camera(21, 0x046d, 0x0825);

    h.controller.attach(&cam);
    h.controller.permission_denied(&identity(&cam));
    h.controller.detach(&cam);

    // Same model back on another port
    let replug = mock_raw_camera(22, 0x046d, 0x0825);
    h.controller.attach(&replug);
    assert_eq!(h.host.prompt_count(replug.id), 0);
    assert_eq!(
        h.controller.permission_state(replug.id),
        Some(PermissionState::Unrequested)
    );

    // Manual retry still prompts
    assert_eq!(
        h.controller.request_permission(replug.id),
        Ok(RequestOutcome::Prompt)
    );
    assert_eq!(h.host.prompt_count(replug.id), 1);
}

#[test]
fn test_host_events_are_routed() {
    let h = Harness::new();
    let cam = mock_raw_camera(23, 0x046d, 0x0825);

    h.controller.handle_host_event(HostEvent::Attached(cam.clone()));
    h.controller.handle_host_event(HostEvent::PermissionGranted {
        device: identity(&cam),
        channel: Box::new(MockControlBlock::new(cam.id)),
    });
    h.controller.handle_host_event(HostEvent::ChannelLost(identity(&cam)));
    h.controller.handle_host_event(HostEvent::PermissionCancelled(identity(&cam)));
    h.controller.handle_host_event(HostEvent::Detached(cam.clone()));

    assert_eq!(
        h.observer.kinds(),
        vec![
            "attached",
            "permission-granted",
            "permission-denied",
            "detached"
        ]
    );
}

#[test]
fn test_concurrent_attach_from_threads() {
    let h = Harness::new();

    std::thread::scope(|scope| {
        for id in 100..108 {
            let controller = h.controller.clone();
            scope.spawn(move || {
                let cam = mock_raw_camera(id, 0x046d, 0x0825);
                controller.attach(&cam);
                controller.attach(&cam);
                controller.permission_granted(
                    &DeviceIdentity::from_raw(&cam),
                    Box::new(MockControlBlock::new(cam.id)),
                );
            });
        }
    });

    assert_eq!(h.controller.devices().len(), 8);
    assert_eq!(h.host.prompts().len(), 8);
    for id in 100..108 {
        let id = DeviceId(id);
        assert!(h.controller.has_permission(id));
        let kinds: Vec<&str> = h
            .observer
            .events()
            .iter()
            .filter(|e| e.device().id() == id)
            .map(|e| e.kind())
            .collect();
        assert_eq!(kinds, vec!["attached", "permission-granted"]);
    }
}

#[test]
fn test_shutdown_closes_everything() {
    let h = Harness::new();
    for id in 40..43 {
        let cam = mock_raw_camera(id, 0x046d, 0x0825);
        h.controller.attach(&cam);
        h.grant(&cam);
        h.controller.open(cam.id, &CaptureConfig::default()).unwrap();
    }

    h.controller.shutdown();
    assert!(h.controller.devices().is_empty());
    assert_eq!(h.transport.closed(), 3);
    assert_eq!(
        h.observer
            .kinds()
            .iter()
            .filter(|k| k.as_str() == "detached")
            .count(),
        3
    );
}

#[tokio::test]
async fn test_event_stream() {
    let h = Harness::new();
    let (token, rx) = h.controller.event_stream(16);
    let cam = mock_raw_camera(50, 0x046d, 0x0825);

    h.controller.attach(&cam);
    h.grant(&cam);

    let first = with_timeout(DEFAULT_TEST_TIMEOUT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    let second = with_timeout(DEFAULT_TEST_TIMEOUT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.kind(), "attached");
    assert_eq!(second.kind(), "permission-granted");

    assert!(h.controller.unsubscribe(token));
    h.controller.detach(&cam);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_watch_devices() {
    let h = Harness::new();
    let mut rx = h.controller.watch_devices();
    assert!(rx.borrow().is_empty());

    let controller = h.controller.clone();
    let task = tokio::spawn(async move {
        let cam = mock_raw_camera(60, 0x046d, 0x0825);
        controller.attach(&cam);
    });

    with_timeout(DEFAULT_TEST_TIMEOUT, rx.changed())
        .await
        .unwrap()
        .unwrap();
    task.await.unwrap();

    let tiles = rx.borrow_and_update().clone();
    assert_eq!(tiles.len(), 1);
    assert_eq!(tiles[0].identity.id(), DeviceId(60));
    assert_eq!(tiles[0].permission, PermissionState::Pending);
    assert!(!tiles[0].open);
}
