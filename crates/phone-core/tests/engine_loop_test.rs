//! Command marshaling onto the engine loop thread

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded};
use parking_lot::Mutex;
use sipline_phone_core::engine::mock::MockEngineHandle;
use sipline_phone_core::engine::RegistrationState;
use sipline_phone_core::engine_loop::{EngineLoop, LoopConfig};
use sipline_phone_core::events::{EngineEvent, EventBus, LogGate};
use sipline_phone_core::{
    Account, EventFilter, PhoneConfig, PhoneError, ShutdownConfig, SubmitOptions,
};

fn spawn(mock: &MockEngineHandle) -> (Arc<EngineLoop>, Arc<EventBus<EngineEvent>>) {
    let config = PhoneConfig::default().with_poll_interval(Duration::from_millis(5));
    let bus = Arc::new(EventBus::new("test", 2, 64).unwrap());
    let engine_loop = EngineLoop::spawn(
        mock.factory(),
        LoopConfig::new(Account::new("alice", "secret", "pbx.example.com"), &config),
        bus.clone(),
        Arc::new(LogGate::new()),
    )
    .unwrap();
    (Arc::new(engine_loop), bus)
}

#[test]
fn test_bootstrap_configures_engine_in_order() {
    let mock = MockEngineHandle::new();
    let (engine_loop, _bus) = spawn(&mock);

    let ops = mock.operations();
    let order = [
        "create",
        "set_log_level",
        "set_sip_transports",
        "set_user_agent",
        "add_auth_info",
        "add_proxy",
    ];
    let positions: Vec<usize> = order
        .iter()
        .map(|op| ops.iter().position(|o| o == op).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "journal: {:?}", ops);
    assert_eq!(
        mock.last_config().unwrap().account.identity(),
        "sip:alice@pbx.example.com"
    );
    assert!(engine_loop.is_running());
}

#[test]
fn test_failed_bootstrap_destroys_engine() {
    let mock = MockEngineHandle::new();
    mock.fail_operation("add_proxy");
    let bus = Arc::new(EventBus::new("test", 1, 8).unwrap());
    let config = PhoneConfig::default();
    let result = EngineLoop::spawn(
        mock.factory(),
        LoopConfig::new(Account::new("alice", "secret", "pbx.example.com"), &config),
        bus,
        Arc::new(LogGate::new()),
    );
    assert!(matches!(result, Err(PhoneError::EngineCreation { .. })));
    assert_eq!(mock.created(), 1);
    assert_eq!(mock.destroyed(), 1);
}

#[test]
fn test_submit_runs_once_on_loop_thread() {
    let mock = MockEngineHandle::new();
    let (engine_loop, _bus) = spawn(&mock);
    let runs = Arc::new(AtomicUsize::new(0));

    let counter = runs.clone();
    let ran_on = engine_loop
        .submit(move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(thread::current().id())
        })
        .unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_ne!(ran_on, thread::current().id());
    assert!(mock.engine_threads().contains(&ran_on));
}

#[test]
fn test_commands_from_one_thread_run_in_order() {
    let mock = MockEngineHandle::new();
    let (engine_loop, _bus) = spawn(&mock);
    let log = Arc::new(Mutex::new(Vec::new()));
    const THREADS: usize = 4;
    const PER_THREAD: usize = 25;

    let producers: Vec<_> = (0..THREADS)
        .map(|producer| {
            let engine_loop = engine_loop.clone();
            let log = log.clone();
            thread::spawn(move || {
                for seq in 0..PER_THREAD {
                    let log = log.clone();
                    engine_loop
                        .submit(move |_ctx| {
                            log.lock().push((producer, seq));
                            Ok(())
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let log = log.lock();
    assert_eq!(log.len(), THREADS * PER_THREAD);
    for producer in 0..THREADS {
        let seqs: Vec<usize> = log
            .iter()
            .filter(|(p, _)| *p == producer)
            .map(|(_, s)| *s)
            .collect();
        assert_eq!(seqs, (0..PER_THREAD).collect::<Vec<_>>());
    }
}

#[test]
fn test_panicking_command_is_reported_and_loop_survives() {
    let mock = MockEngineHandle::new();
    let (engine_loop, _bus) = spawn(&mock);

    let result: Result<(), PhoneError> = engine_loop.submit(|_ctx| panic!("boom"));
    assert_eq!(
        result,
        Err(PhoneError::CommandPanicked {
            message: "boom".to_string()
        })
    );
    assert_eq!(engine_loop.submit(|_ctx| Ok(42)), Ok(42));
}

#[test]
fn test_submit_from_loop_thread_is_reentrant() {
    let mock = MockEngineHandle::new();
    let (engine_loop, _bus) = spawn(&mock);

    let inner = engine_loop.clone();
    let nested = engine_loop
        .submit(move |_ctx| Ok(inner.submit(|_ctx| Ok(()))))
        .unwrap();
    assert_eq!(nested, Err(PhoneError::Reentrant));
}

#[test]
fn test_timed_out_command_never_runs() {
    let mock = MockEngineHandle::new();
    let (engine_loop, _bus) = spawn(&mock);
    let (started_tx, started_rx) = bounded(1);

    let blocker = {
        let engine_loop = engine_loop.clone();
        thread::spawn(move || {
            engine_loop.submit(move |_ctx| {
                let _ = started_tx.send(());
                thread::sleep(Duration::from_millis(150));
                Ok(())
            })
        })
    };
    started_rx.recv().unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let result = engine_loop.submit_with(SubmitOptions::with_timeout(Duration::from_millis(20)), move |_ctx| {
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });
    assert_eq!(result, Err(PhoneError::Timeout { duration_ms: 20 }));

    blocker.join().unwrap().unwrap();
    // FIFO: once this ran, the cancelled command has been dequeued
    engine_loop.submit(|_ctx| Ok(())).unwrap();
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn test_pending_and_late_commands_fail_on_shutdown() {
    let mock = MockEngineHandle::new();
    let (engine_loop, _bus) = spawn(&mock);
    let (started_tx, started_rx) = bounded(1);

    let blocker = {
        let engine_loop = engine_loop.clone();
        thread::spawn(move || {
            engine_loop.submit(move |_ctx| {
                let _ = started_tx.send(());
                thread::sleep(Duration::from_millis(200));
                Ok(())
            })
        })
    };
    started_rx.recv().unwrap();

    let pending = {
        let engine_loop = engine_loop.clone();
        thread::spawn(move || engine_loop.submit(|_ctx| Ok("ran")))
    };
    thread::sleep(Duration::from_millis(50));
    engine_loop.request_shutdown(ShutdownConfig::immediate());

    assert_eq!(blocker.join().unwrap(), Ok(()));
    assert_eq!(pending.join().unwrap(), Err(PhoneError::ShuttingDown));

    let late = engine_loop.submit(|_ctx| Ok(()));
    assert!(matches!(
        late,
        Err(PhoneError::ShuttingDown) | Err(PhoneError::EngineNotRunning)
    ));

    engine_loop.join();
    assert!(!engine_loop.is_running());
    assert_eq!(engine_loop.submit(|_ctx| Ok(())), Err(PhoneError::EngineNotRunning));
    assert_eq!(mock.destroyed(), 1);
}

#[test]
fn test_stop_publishes_cleared_when_engine_did_not() {
    let mock = MockEngineHandle::new().with_auto_register(false);
    let (engine_loop, bus) = spawn(&mock);
    let (tx, rx) = unbounded();
    bus.subscribe(
        Arc::new(move |event: &EngineEvent| {
            let _ = tx.send(event.clone());
        }),
        EventFilter::all(),
    );

    engine_loop.stop();

    let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    match event {
        EngineEvent::Registration { loop_id, state, .. } => {
            assert_eq!(loop_id, engine_loop.id());
            assert_eq!(state, RegistrationState::Cleared);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(mock.count("unregister"), 0);
}

#[test]
fn test_calls_are_released_when_loop_stops() {
    let mock = MockEngineHandle::new();
    let (engine_loop, _bus) = spawn(&mock);
    let handle = mock.incoming_call("sip:bob@pbx.example.com");

    // Wait until the loop picked the call up
    let mut known = 0;
    for _ in 0..200 {
        known = engine_loop.submit(|ctx| Ok(ctx.registry().len())).unwrap();
        if known == 1 {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(known, 1);
    assert_eq!(mock.ref_count(handle), 1);

    engine_loop.stop();
    assert_eq!(mock.ref_count(handle), 0);
    assert!(mock.count("terminate_all") >= 1);
}
