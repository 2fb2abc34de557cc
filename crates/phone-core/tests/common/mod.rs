//! Shared helpers for phone-core integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver};
use sipline_phone_core::engine::mock::MockEngineHandle;
use sipline_phone_core::{
    Account, ConnectState, EventFilter, Phone, PhoneConfig, PhoneEvent, ShutdownConfig,
};

pub const WAIT: Duration = Duration::from_secs(3);

pub fn account() -> Account {
    Account::new("alice", "secret", "pbx.example.com")
}

/// Short poll interval and bounded grace periods
pub fn fast_config() -> PhoneConfig {
    PhoneConfig::default()
        .with_poll_interval(Duration::from_millis(5))
        .with_shutdown(ShutdownConfig {
            call_teardown_grace: Duration::from_millis(500),
            unregister_grace: Duration::from_millis(500),
            finish_on_completion: true,
        })
}

pub fn phone(mock: &MockEngineHandle) -> Phone {
    phone_with(mock, fast_config())
}

pub fn phone_with(mock: &MockEngineHandle, config: PhoneConfig) -> Phone {
    Phone::new(account(), config, mock.factory()).expect("phone")
}

/// Collects every phone event in delivery order
pub struct Recorder {
    rx: Receiver<PhoneEvent>,
    seen: Vec<PhoneEvent>,
}

impl Recorder {
    pub fn attach(phone: &Phone) -> Self {
        let (tx, rx) = unbounded();
        phone.subscribe(
            Arc::new(move |event: &PhoneEvent| {
                let _ = tx.send(event.clone());
            }),
            EventFilter::all(),
        );
        Self {
            rx,
            seen: Vec::new(),
        }
    }

    /// Wait for the first not yet consumed event matching `pred`
    pub fn expect(&mut self, what: &str, pred: impl Fn(&PhoneEvent) -> bool) -> PhoneEvent {
        let deadline = Instant::now() + WAIT;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(left) {
                Ok(event) => {
                    self.seen.push(event.clone());
                    if pred(&event) {
                        return event;
                    }
                }
                Err(_) => panic!("timed out waiting for {}; saw {:?}", what, self.seen),
            }
        }
    }

    /// Drain whatever arrives within `settle`, then return everything seen so far
    pub fn settle(&mut self, settle: Duration) -> &[PhoneEvent] {
        let deadline = Instant::now() + settle;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(left) {
                Ok(event) => self.seen.push(event),
                Err(_) => return &self.seen,
            }
        }
    }

    pub fn count(&self, pred: impl Fn(&PhoneEvent) -> bool) -> usize {
        self.seen.iter().filter(|e| pred(e)).count()
    }
}

/// Connect with auto registration and wait for `Connected`
pub fn connected(mock: &MockEngineHandle) -> (Phone, Recorder) {
    let phone = phone(mock);
    let mut recorder = Recorder::attach(&phone);
    phone.connect().expect("connect");
    recorder.expect("PhoneConnected", |e| matches!(e, PhoneEvent::PhoneConnected));
    assert_eq!(phone.connect_state(), ConnectState::Connected);
    (phone, recorder)
}
