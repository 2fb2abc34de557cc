//! End-to-end phone behavior against the scripted engine

mod common;

use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use common::{connected, fast_config, phone, phone_with, Recorder, WAIT};
use sipline_phone_core::engine::mock::MockEngineHandle;
use sipline_phone_core::engine::{CallHandle, RawCallState, RegistrationState};
use sipline_phone_core::{
    CallDirection, CallState, ConnectState, ErrorKind, LineState, PhoneError, PhoneEvent,
};

#[test]
fn test_connect_sets_progress_then_connected_once() {
    let mock = MockEngineHandle::new().with_auto_register(false);
    let phone = phone(&mock);
    let mut recorder = Recorder::attach(&phone);

    phone.connect().unwrap();
    assert_eq!(phone.connect_state(), ConnectState::Progress);
    assert_eq!(mock.created(), 1);

    mock.registration(RegistrationState::Ok);
    recorder.expect("PhoneConnected", |e| matches!(e, PhoneEvent::PhoneConnected));
    assert!(phone.wait_for_connect_state(ConnectState::Connected, WAIT));

    // A refreshed registration must not announce the connection again
    mock.registration(RegistrationState::Ok);
    recorder.settle(Duration::from_millis(100));
    assert_eq!(recorder.count(|e| matches!(e, PhoneEvent::PhoneConnected)), 1);
}

#[test]
fn test_make_call_on_busy_line_never_reaches_engine() {
    let mock = MockEngineHandle::new();
    let (phone, mut recorder) = connected(&mock);

    mock.incoming_call("sip:bob@pbx.example.com");
    recorder.expect("IncomingCall", |e| matches!(e, PhoneEvent::IncomingCall(_)));
    assert!(phone.wait_for_line_state(LineState::Busy, WAIT));

    assert_eq!(phone.make_call("sip:carol@pbx.example.com"), Err(PhoneError::LineBusy));
    assert_eq!(mock.count("invite"), 0);
}

#[test]
fn test_incoming_then_connected_is_one_entity() {
    let mock = MockEngineHandle::new();
    let (phone, mut recorder) = connected(&mock);

    mock.incoming_call("sip:bob@pbx.example.com");
    let incoming = match recorder.expect("IncomingCall", |e| matches!(e, PhoneEvent::IncomingCall(_))) {
        PhoneEvent::IncomingCall(call) => call,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(incoming.direction(), CallDirection::Incoming);
    assert_eq!(incoming.from(), "sip:bob@pbx.example.com");
    assert_eq!(incoming.to(), "sip:alice@pbx.example.com");
    assert_eq!(incoming.state(), CallState::Loading);

    phone.receive_call(&incoming).unwrap();
    let active = match recorder.expect("CallActive", |e| matches!(e, PhoneEvent::CallActive(_))) {
        PhoneEvent::CallActive(call) => call,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(active.id(), incoming.id());
    assert_eq!(active.state(), CallState::Active);

    recorder.settle(Duration::from_millis(100));
    assert_eq!(recorder.count(|e| matches!(e, PhoneEvent::IncomingCall(_))), 1);
    assert_eq!(recorder.count(|e| matches!(e, PhoneEvent::CallActive(_))), 1);
    assert_eq!(phone.calls().unwrap().len(), 1);
}

#[test]
fn test_released_handle_reuse_creates_fresh_call() {
    let mock = MockEngineHandle::new();
    let (phone, mut recorder) = connected(&mock);
    let handle = CallHandle(7);

    mock.incoming_call_on(handle, "sip:bob@pbx.example.com");
    let first = match recorder.expect("IncomingCall", |e| matches!(e, PhoneEvent::IncomingCall(_))) {
        PhoneEvent::IncomingCall(call) => call,
        other => panic!("unexpected {:?}", other),
    };
    mock.hang_up(handle);
    recorder.expect("CallCompleted", |e| matches!(e, PhoneEvent::CallCompleted(_)));
    assert!(phone.wait_for_line_state(LineState::Free, WAIT));

    mock.incoming_call_on(handle, "sip:carol@pbx.example.com");
    let second = match recorder.expect("IncomingCall", |e| matches!(e, PhoneEvent::IncomingCall(_))) {
        PhoneEvent::IncomingCall(call) => call,
        other => panic!("unexpected {:?}", other),
    };

    assert_ne!(second.id(), first.id());
    assert_eq!(second.handle(), handle);
    assert_eq!(second.from(), "sip:carol@pbx.example.com");
    assert_eq!(second.state(), CallState::Loading);

    let calls = phone.calls().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].id(), second.id());
    assert_eq!(mock.ref_count(handle), 1);

    // The stale snapshot no longer names a live call
    assert_eq!(
        phone.terminate_call(&first),
        Err(PhoneError::CallNotFound { call_id: first.id() })
    );
}

#[test]
fn test_disconnect_with_active_call_tears_down_in_order() {
    let mock = MockEngineHandle::new();
    let config = fast_config().with_poll_interval(Duration::from_millis(50));
    let phone = phone_with(&mock, config);
    let mut recorder = Recorder::attach(&phone);
    phone.connect().unwrap();
    recorder.expect("PhoneConnected", |e| matches!(e, PhoneEvent::PhoneConnected));

    mock.incoming_call("sip:bob@pbx.example.com");
    let call = match recorder.expect("IncomingCall", |e| matches!(e, PhoneEvent::IncomingCall(_))) {
        PhoneEvent::IncomingCall(call) => call,
        other => panic!("unexpected {:?}", other),
    };
    phone.receive_call(&call).unwrap();
    recorder.expect("CallActive", |e| matches!(e, PhoneEvent::CallActive(_)));

    phone.disconnect().unwrap();
    // Returned before the engine saw any of the teardown
    assert_eq!(phone.connect_state(), ConnectState::Progress);
    assert_eq!(mock.count("unregister"), 0);

    recorder.expect("PhoneDisconnected", |e| matches!(e, PhoneEvent::PhoneDisconnected));
    assert_eq!(phone.connect_state(), ConnectState::Disconnected);
    assert_eq!(phone.line_state(), LineState::Free);

    let ops = mock.operations();
    let terminate_all = ops.iter().position(|op| *op == "terminate_all").unwrap();
    let unregister = ops.iter().position(|op| *op == "unregister").unwrap();
    assert!(terminate_all < unregister, "journal: {:?}", ops);

    recorder.settle(Duration::from_millis(100));
    assert_eq!(recorder.count(|e| matches!(e, PhoneEvent::CallCompleted(_))), 1);
    assert_eq!(mock.ref_count(call.handle()), 0);

    // The engine is destroyed once teardown finished
    let deadline = std::time::Instant::now() + WAIT;
    while mock.destroyed() == 0 && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(mock.destroyed(), 1);
    assert_eq!(phone.calls(), Err(PhoneError::EngineNotRunning));
    assert_eq!(phone.capabilities(), Err(PhoneError::EngineNotRunning));
}

#[test]
fn test_outgoing_call_lifecycle() {
    let mock = MockEngineHandle::new();
    let (phone, mut recorder) = connected(&mock);

    phone.make_call("sip:bob@pbx.example.com").unwrap();
    let call = match recorder.expect("OutgoingCall", |e| matches!(e, PhoneEvent::OutgoingCall(_))) {
        PhoneEvent::OutgoingCall(call) => call,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(call.direction(), CallDirection::Outgoing);
    assert_eq!(call.from(), "sip:alice@pbx.example.com");
    assert_eq!(call.to(), "sip:bob@pbx.example.com");
    assert_eq!(phone.line_state(), LineState::Busy);

    mock.call_state(call.handle(), RawCallState::Connected);
    recorder.expect("CallActive", |e| matches!(e, PhoneEvent::CallActive(_)));

    phone.send_dtmfs(&call, "12#").unwrap();
    assert!(matches!(
        phone.send_dtmfs(&call, "9x"),
        Err(PhoneError::InvalidArgument { .. })
    ));

    phone.terminate_call(&call).unwrap();
    let completed = match recorder.expect("CallCompleted", |e| matches!(e, PhoneEvent::CallCompleted(_))) {
        PhoneEvent::CallCompleted(call) => call,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(completed.id(), call.id());
    assert!(phone.wait_for_line_state(LineState::Free, WAIT));
}

#[test]
fn test_recorded_call_stops_recording_on_end() {
    let mock = MockEngineHandle::new();
    let (phone, mut recorder) = connected(&mock);

    phone
        .make_call_and_record("sip:bob@pbx.example.com", "/tmp/bob.wav")
        .unwrap();
    let call = match recorder.expect("OutgoingCall", |e| matches!(e, PhoneEvent::OutgoingCall(_))) {
        PhoneEvent::OutgoingCall(call) => call,
        other => panic!("unexpected {:?}", other),
    };
    assert!(mock.is_recording(call.handle()));
    assert_eq!(call.record_file(), Some("/tmp/bob.wav"));

    phone.pause_recording(&call).unwrap();
    assert!(!mock.is_recording(call.handle()));
    phone.start_recording(&call).unwrap();
    assert!(mock.is_recording(call.handle()));

    mock.hang_up(call.handle());
    recorder.expect("CallCompleted", |e| matches!(e, PhoneEvent::CallCompleted(_)));
    assert!(!mock.is_recording(call.handle()));
    assert!(mock.count("stop_recording") >= 2);
}

#[test]
fn test_call_error_reports_then_completes() {
    let mock = MockEngineHandle::new();
    let (phone, mut recorder) = connected(&mock);

    let handle = mock.incoming_call("sip:bob@pbx.example.com");
    recorder.expect("IncomingCall", |e| matches!(e, PhoneEvent::IncomingCall(_)));
    mock.call_state(handle, RawCallState::Error);

    let error = recorder.expect("call error", |e| matches!(e, PhoneEvent::Error { .. }));
    match error {
        PhoneEvent::Error {
            call: Some(call),
            kind: ErrorKind::CallError,
        } => assert_eq!(call.state(), CallState::Error),
        other => panic!("unexpected {:?}", other),
    }
    recorder.expect("CallCompleted", |e| matches!(e, PhoneEvent::CallCompleted(_)));
    assert!(phone.wait_for_line_state(LineState::Free, WAIT));
}

#[test]
fn test_registration_failure_disconnects_with_error_first() {
    let mock = MockEngineHandle::new().with_auto_register(false);
    let phone = phone(&mock);
    let mut recorder = Recorder::attach(&phone);

    phone.connect().unwrap();
    mock.registration(RegistrationState::Failed);

    recorder.expect("PhoneDisconnected", |e| matches!(e, PhoneEvent::PhoneDisconnected));
    let seen = recorder.settle(Duration::ZERO).to_vec();
    let error_at = seen
        .iter()
        .position(|e| {
            matches!(
                e,
                PhoneEvent::Error {
                    call: None,
                    kind: ErrorKind::RegisterFailed
                }
            )
        })
        .expect("RegisterFailed error");
    let disconnected_at = seen
        .iter()
        .position(|e| matches!(e, PhoneEvent::PhoneDisconnected))
        .unwrap();
    assert!(error_at < disconnected_at);
    assert_eq!(phone.connect_state(), ConnectState::Disconnected);
    assert_eq!(recorder.count(|e| matches!(e, PhoneEvent::PhoneConnected)), 0);

    // Reconnecting works after the automatic teardown
    phone.connect().unwrap();
    mock.registration(RegistrationState::Ok);
    assert!(phone.wait_for_connect_state(ConnectState::Connected, WAIT));
    assert_eq!(mock.created(), 2);
}

#[test]
fn test_engine_panic_reports_unknown_error_and_disconnects() {
    let mock = MockEngineHandle::new();
    let (phone, mut recorder) = connected(&mock);

    mock.panic_on_iterate();
    recorder.expect("loop failure", |e| {
        matches!(
            e,
            PhoneEvent::Error {
                call: None,
                kind: ErrorKind::UnknownError
            }
        )
    });
    recorder.expect("PhoneDisconnected", |e| matches!(e, PhoneEvent::PhoneDisconnected));
    assert_eq!(phone.connect_state(), ConnectState::Disconnected);
    assert_eq!(mock.destroyed(), 1);
}

#[test]
fn test_engine_accessor_panic_stops_loop_and_fails_fast() {
    let mock = MockEngineHandle::new();
    let (phone, mut recorder) = connected(&mock);

    mock.panic_in("call_remote_address");
    mock.incoming_call("sip:bob@pbx.example.com");

    recorder.expect("loop failure", |e| {
        matches!(
            e,
            PhoneEvent::Error {
                call: None,
                kind: ErrorKind::UnknownError
            }
        )
    });
    recorder.expect("PhoneDisconnected", |e| matches!(e, PhoneEvent::PhoneDisconnected));
    assert_eq!(phone.connect_state(), ConnectState::Disconnected);
    assert_eq!(mock.destroyed(), 1);

    // Callers are turned away instead of waiting on a dead loop
    assert_eq!(phone.calls(), Err(PhoneError::EngineNotRunning));
    assert_eq!(phone.set_mic_enabled(false), Err(PhoneError::EngineNotRunning));
}

#[test]
fn test_forced_teardown_completes_live_calls() {
    let mock = MockEngineHandle::new();
    let (phone, mut recorder) = connected(&mock);

    mock.incoming_call("sip:bob@pbx.example.com");
    let call = match recorder.expect("IncomingCall", |e| matches!(e, PhoneEvent::IncomingCall(_))) {
        PhoneEvent::IncomingCall(call) => call,
        other => panic!("unexpected {:?}", other),
    };
    phone.receive_call(&call).unwrap();
    recorder.expect("CallActive", |e| matches!(e, PhoneEvent::CallActive(_)));

    mock.panic_on_iterate();
    let completed = match recorder.expect("CallCompleted", |e| matches!(e, PhoneEvent::CallCompleted(_))) {
        PhoneEvent::CallCompleted(call) => call,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(completed.id(), call.id());
    assert_eq!(completed.state(), CallState::Completed);

    assert!(phone.wait_for_connect_state(ConnectState::Disconnected, WAIT));
    assert!(phone.wait_for_line_state(LineState::Free, WAIT));
    assert_eq!(mock.ref_count(call.handle()), 0);
}

#[test]
fn test_each_call_sees_its_events_in_order_across_workers() {
    const CALLS: usize = 6;
    let mock = MockEngineHandle::new();
    let phone = phone_with(&mock, fast_config().with_event_workers(4));
    let mut recorder = Recorder::attach(&phone);
    phone.connect().unwrap();
    recorder.expect("PhoneConnected", |e| matches!(e, PhoneEvent::PhoneConnected));

    // Interleave the lifecycles so every pump carries several calls
    let handles: Vec<CallHandle> = (0..CALLS)
        .map(|n| mock.incoming_call(&format!("sip:caller{}@pbx.example.com", n)))
        .collect();
    for handle in &handles {
        mock.call_state(*handle, RawCallState::Connected);
    }
    for handle in handles.iter().rev() {
        mock.hang_up(*handle);
    }

    for _ in 0..CALLS {
        recorder.expect("CallCompleted", |e| matches!(e, PhoneEvent::CallCompleted(_)));
    }
    let seen = recorder.settle(Duration::from_millis(50)).to_vec();

    let mut per_call: HashMap<_, Vec<&str>> = HashMap::new();
    for event in &seen {
        let (call, step) = match event {
            PhoneEvent::IncomingCall(call) => (call, "incoming"),
            PhoneEvent::CallActive(call) => (call, "active"),
            PhoneEvent::CallCompleted(call) => (call, "completed"),
            _ => continue,
        };
        per_call.entry(call.id()).or_default().push(step);
    }
    assert_eq!(per_call.len(), CALLS);
    for (id, steps) in &per_call {
        assert_eq!(steps, &["incoming", "active", "completed"], "call {}", id);
    }
    assert!(phone.wait_for_line_state(LineState::Free, WAIT));
}

#[test]
fn test_engine_is_entered_from_one_thread_only() {
    let mock = MockEngineHandle::new();
    let (phone, mut recorder) = connected(&mock);
    let phone = std::sync::Arc::new(phone);

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let phone = phone.clone();
            thread::spawn(move || {
                for _ in 0..10 {
                    phone.set_mic_enabled(false).unwrap();
                    phone.mic_enabled().unwrap();
                    phone.playback_devices().unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    phone.make_call("sip:bob@pbx.example.com").unwrap();
    recorder.expect("OutgoingCall", |e| matches!(e, PhoneEvent::OutgoingCall(_)));

    let threads = mock.engine_threads();
    assert_eq!(threads.len(), 1);
    let engine_thread = threads.into_iter().next().unwrap();
    let stray: Vec<_> = mock
        .invocations()
        .into_iter()
        .filter(|i| i.operation != "create" && i.thread != engine_thread)
        .collect();
    assert!(stray.is_empty(), "entered off the loop thread: {:?}", stray);
    assert_eq!(mock.count("enable_mic"), 40);
}

#[test]
fn test_drop_stops_engine() {
    let mock = MockEngineHandle::new();
    let (phone, _recorder) = connected(&mock);
    mock.incoming_call("sip:bob@pbx.example.com");
    drop(phone);
    assert_eq!(mock.destroyed(), 1);
}
