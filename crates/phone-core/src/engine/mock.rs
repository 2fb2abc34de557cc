//! Scripted in-process engine
//!
//! [`MockEngine`] implements the full [`Engine`] contract without any network
//! or audio. A [`MockEngineHandle`] shares its state with every engine it
//! creates, so a test can inject notifications (delivered on the next pump),
//! steer registration, and inspect the journal of entry-point invocations.
//! Each journal entry records the thread it was made on, which lets tests
//! assert that the engine was only ever entered from the loop thread.
//!
//! ```rust
//! use sipline_phone_core::engine::mock::MockEngineHandle;
//! use sipline_phone_core::engine::RawCallState;
//!
//! let mock = MockEngineHandle::new();
//! let handle = mock.incoming_call("sip:bob@example.com");
//! mock.call_state(handle, RawCallState::Connected);
//! assert_eq!(mock.pending_notifications(), 2);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use super::{
    CallHandle, CallParams, Capabilities, Engine, EngineConfig, EngineFactory,
    EngineLogLevel, EngineNotification, ProxyConfig, RawCallState, RegistrationState,
    SoundDevice,
};
use crate::config::{AudioCodec, NatPolicy, SipTransports};

/// Version reported by mock engines
pub const MOCK_VERSION: &str = "mock-1.0";

/// One journaled engine entry point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub operation: &'static str,
    pub detail: String,
    pub thread: ThreadId,
}

#[derive(Debug, Clone, Default)]
struct MockCall {
    remote: String,
    record_file: Option<String>,
    recording: bool,
    ended: bool,
}

#[derive(Debug)]
struct MockState {
    capabilities: Capabilities,
    pending: VecDeque<EngineNotification>,
    journal: Vec<Invocation>,
    engine_threads: HashSet<ThreadId>,
    calls: HashMap<CallHandle, MockCall>,
    refs: HashMap<CallHandle, i64>,
    next_handle: u64,
    auto_register: bool,
    registered: bool,
    failing: HashSet<&'static str>,
    refuse_invite: bool,
    panic_on_iterate: bool,
    panicking: HashSet<&'static str>,
    iterations: u64,
    created: u32,
    destroyed: u32,
    log_level: EngineLogLevel,
    mic: bool,
    keep_alive: bool,
    echo_cancellation: bool,
    ringer_device: Option<String>,
    playback_device: Option<String>,
    capture_device: Option<String>,
    devices: Vec<SoundDevice>,
    codecs: Vec<AudioCodec>,
    ringback: Option<String>,
    ring: Option<String>,
    last_config: Option<EngineConfig>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            capabilities: Capabilities::full(MOCK_VERSION),
            pending: VecDeque::new(),
            journal: Vec::new(),
            engine_threads: HashSet::new(),
            calls: HashMap::new(),
            refs: HashMap::new(),
            next_handle: 1,
            auto_register: true,
            registered: false,
            failing: HashSet::new(),
            refuse_invite: false,
            panic_on_iterate: false,
            panicking: HashSet::new(),
            iterations: 0,
            created: 0,
            destroyed: 0,
            log_level: EngineLogLevel::Off,
            mic: true,
            keep_alive: true,
            echo_cancellation: true,
            ringer_device: Some("Speaker".into()),
            playback_device: Some("Speaker".into()),
            capture_device: Some("Microphone".into()),
            devices: vec![
                SoundDevice {
                    name: "Speaker".into(),
                    can_capture: false,
                    can_playback: true,
                },
                SoundDevice {
                    name: "Microphone".into(),
                    can_capture: true,
                    can_playback: false,
                },
                SoundDevice {
                    name: "Headset".into(),
                    can_capture: true,
                    can_playback: true,
                },
            ],
            codecs: vec![
                AudioCodec::new("opus", 48000, true),
                AudioCodec::new("PCMU", 8000, true),
                AudioCodec::new("PCMA", 8000, false),
            ],
            ringback: None,
            ring: None,
            last_config: None,
        }
    }
}

impl MockState {
    fn record(&mut self, operation: &'static str, detail: impl Into<String>) {
        self.journal.push(Invocation {
            operation,
            detail: detail.into(),
            thread: thread::current().id(),
        });
        self.engine_threads.insert(thread::current().id());
    }

    fn check(&self, operation: &'static str) -> Result<(), String> {
        if self.failing.contains(operation) {
            Err(format!("{} refused by mock", operation))
        } else {
            Ok(())
        }
    }

    fn allocate(&mut self) -> CallHandle {
        let handle = CallHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    fn push_call(&mut self, handle: CallHandle, state: RawCallState) {
        self.pending.push_back(EngineNotification::CallStateChanged {
            handle,
            state,
            message: format!("{:?}", state),
        });
    }

    fn push_registration(&mut self, state: RegistrationState) {
        self.pending.push_back(EngineNotification::RegistrationChanged {
            state,
            message: format!("{:?}", state),
        });
    }

    fn live_call(&self, handle: CallHandle) -> Result<&MockCall, String> {
        match self.calls.get(&handle) {
            Some(call) if !call.ended => Ok(call),
            _ => Err(format!("no live call {}", handle)),
        }
    }

    fn end_call(&mut self, handle: CallHandle) {
        if let Some(call) = self.calls.get_mut(&handle) {
            if call.ended {
                return;
            }
            call.ended = true;
            call.recording = false;
        }
        self.push_call(handle, RawCallState::End);
        self.push_call(handle, RawCallState::Released);
    }
}

/// Test-side handle on the shared mock state
#[derive(Debug, Clone, Default)]
pub struct MockEngineHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockEngineHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engines created from this handle report `capabilities`
    pub fn with_capabilities(self, capabilities: Capabilities) -> Self {
        self.state.lock().capabilities = capabilities;
        self
    }

    /// Whether adding the proxy immediately queues Progress then Ok
    pub fn with_auto_register(self, enabled: bool) -> Self {
        self.state.lock().auto_register = enabled;
        self
    }

    /// Engine sharing this handle's state
    pub fn engine(&self) -> MockEngine {
        MockEngine {
            state: self.state.clone(),
        }
    }

    /// Factory producing engines that share this handle's state
    pub fn factory(&self) -> Arc<dyn EngineFactory> {
        let handle = self.clone();
        Arc::new(move |config: &EngineConfig| -> Result<Box<dyn Engine>, String> {
            let mut state = handle.state.lock();
            state.record("create", config.account.identity());
            state.check("create")?;
            state.created += 1;
            state.last_config = Some(config.clone());
            drop(state);
            Ok(Box::new(handle.engine()))
        })
    }

    // -- scripting --

    pub fn push(&self, notification: EngineNotification) {
        self.state.lock().pending.push_back(notification);
    }

    pub fn registration(&self, state: RegistrationState) {
        let mut mock = self.state.lock();
        mock.registered = state == RegistrationState::Ok;
        mock.push_registration(state);
    }

    /// Queue a new incoming call from `remote`
    pub fn incoming_call(&self, remote: &str) -> CallHandle {
        let mut state = self.state.lock();
        let handle = state.allocate();
        drop(state);
        self.incoming_call_on(handle, remote);
        handle
    }

    /// Queue a new incoming call on a specific handle value
    pub fn incoming_call_on(&self, handle: CallHandle, remote: &str) {
        let mut state = self.state.lock();
        state.calls.insert(
            handle,
            MockCall {
                remote: remote.to_string(),
                ..Default::default()
            },
        );
        state.push_call(handle, RawCallState::IncomingReceived);
    }

    /// Queue a raw state notification for `handle`
    pub fn call_state(&self, handle: CallHandle, raw: RawCallState) {
        let mut state = self.state.lock();
        if matches!(raw, RawCallState::Released) {
            if let Some(call) = state.calls.get_mut(&handle) {
                call.ended = true;
                call.recording = false;
            }
        }
        state.push_call(handle, raw);
    }

    /// Queue End then Released for `handle`
    pub fn hang_up(&self, handle: CallHandle) {
        self.state.lock().end_call(handle);
    }

    pub fn message(&self, from: &str, text: &str) {
        self.push(EngineNotification::MessageReceived {
            from: from.to_string(),
            text: text.to_string(),
        });
    }

    pub fn log(&self, level: EngineLogLevel, domain: &str, message: &str) {
        self.push(EngineNotification::Log {
            level,
            domain: domain.to_string(),
            message: message.to_string(),
        });
    }

    /// Make entry point `operation` return an error
    pub fn fail_operation(&self, operation: &'static str) {
        self.state.lock().failing.insert(operation);
    }

    /// Make `invite` return no call
    pub fn refuse_invite(&self) {
        self.state.lock().refuse_invite = true;
    }

    /// Panic inside the next pump
    pub fn panic_on_iterate(&self) {
        self.state.lock().panic_on_iterate = true;
    }

    /// Panic whenever entry point `operation` is called
    pub fn panic_in(&self, operation: &'static str) {
        self.state.lock().panicking.insert(operation);
    }

    // -- inspection --

    pub fn invocations(&self) -> Vec<Invocation> {
        self.state.lock().journal.clone()
    }

    /// Journaled operation names in call order
    pub fn operations(&self) -> Vec<&'static str> {
        self.state.lock().journal.iter().map(|i| i.operation).collect()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.state
            .lock()
            .journal
            .iter()
            .filter(|i| i.operation == operation)
            .count()
    }

    /// Threads that entered the engine, pumps included
    pub fn engine_threads(&self) -> HashSet<ThreadId> {
        self.state.lock().engine_threads.clone()
    }

    pub fn pending_notifications(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn iterations(&self) -> u64 {
        self.state.lock().iterations
    }

    pub fn created(&self) -> u32 {
        self.state.lock().created
    }

    pub fn destroyed(&self) -> u32 {
        self.state.lock().destroyed
    }

    pub fn ref_count(&self, handle: CallHandle) -> i64 {
        self.state.lock().refs.get(&handle).copied().unwrap_or(0)
    }

    pub fn is_recording(&self, handle: CallHandle) -> bool {
        self.state
            .lock()
            .calls
            .get(&handle)
            .map(|c| c.recording)
            .unwrap_or(false)
    }

    pub fn is_registered(&self) -> bool {
        self.state.lock().registered
    }

    pub fn log_level(&self) -> EngineLogLevel {
        self.state.lock().log_level
    }

    pub fn ringback(&self) -> Option<String> {
        self.state.lock().ringback.clone()
    }

    pub fn ring(&self) -> Option<String> {
        self.state.lock().ring.clone()
    }

    /// Configuration passed to the most recent create
    pub fn last_config(&self) -> Option<EngineConfig> {
        self.state.lock().last_config.clone()
    }
}

/// Engine backed by a [`MockEngineHandle`]
#[derive(Debug)]
pub struct MockEngine {
    state: Arc<Mutex<MockState>>,
}

impl MockEngine {
    fn trip(&self, operation: &'static str) {
        if self.state.lock().panicking.contains(operation) {
            panic!("mock engine {} panic", operation);
        }
    }
}

impl Engine for MockEngine {
    fn capabilities(&self) -> Capabilities {
        self.state.lock().capabilities.clone()
    }

    fn iterate(&mut self, out: &mut Vec<EngineNotification>) {
        let mut state = self.state.lock();
        state.iterations += 1;
        state.engine_threads.insert(thread::current().id());
        if state.panic_on_iterate {
            state.panic_on_iterate = false;
            drop(state);
            panic!("mock engine iterate panic");
        }
        out.extend(state.pending.drain(..));
    }

    fn set_log_level(&mut self, level: EngineLogLevel) {
        let mut state = self.state.lock();
        state.record("set_log_level", format!("{:?}", level));
        state.log_level = level;
    }

    fn set_sip_transports(&mut self, transports: &SipTransports) -> Result<(), String> {
        let mut state = self.state.lock();
        state.record("set_sip_transports", format!("{:?}", transports));
        state.check("set_sip_transports")
    }

    fn set_user_agent(&mut self, name: &str, version: &str) {
        self.state
            .lock()
            .record("set_user_agent", format!("{}/{}", name, version));
    }

    fn add_auth_info(&mut self, username: &str, _password: &str) {
        self.state.lock().record("add_auth_info", username);
    }

    fn set_nat_policy(&mut self, policy: &NatPolicy) {
        self.state
            .lock()
            .record("set_nat_policy", format!("{:?}", policy));
    }

    fn add_proxy(&mut self, proxy: &ProxyConfig) -> Result<(), String> {
        let mut state = self.state.lock();
        state.record("add_proxy", proxy.server_address.clone());
        state.check("add_proxy")?;
        if proxy.register && state.auto_register {
            state.registered = true;
            state.push_registration(RegistrationState::Progress);
            state.push_registration(RegistrationState::Ok);
        }
        Ok(())
    }

    fn proxy_is_registered(&self) -> bool {
        self.state.lock().registered
    }

    fn unregister(&mut self) -> Result<(), String> {
        let mut state = self.state.lock();
        state.record("unregister", "");
        state.check("unregister")?;
        if state.registered {
            state.registered = false;
            state.push_registration(RegistrationState::Progress);
            state.push_registration(RegistrationState::Cleared);
        }
        Ok(())
    }

    fn invite(&mut self, uri: &str, params: &CallParams) -> Option<CallHandle> {
        let mut state = self.state.lock();
        state.record("invite", uri);
        if state.refuse_invite {
            return None;
        }
        let handle = state.allocate();
        state.calls.insert(
            handle,
            MockCall {
                remote: uri.to_string(),
                record_file: params.record_file.clone(),
                ..Default::default()
            },
        );
        state.push_call(handle, RawCallState::OutgoingInit);
        state.push_call(handle, RawCallState::OutgoingProgress);
        Some(handle)
    }

    fn accept(&mut self, call: CallHandle, params: &CallParams) -> Result<(), String> {
        let mut state = self.state.lock();
        state.record("accept", call.to_string());
        state.check("accept")?;
        state.live_call(call)?;
        if let Some(mock_call) = state.calls.get_mut(&call) {
            if params.record_file.is_some() {
                mock_call.record_file = params.record_file.clone();
            }
        }
        state.push_call(call, RawCallState::Connected);
        state.push_call(call, RawCallState::StreamsRunning);
        Ok(())
    }

    fn terminate(&mut self, call: CallHandle) -> Result<(), String> {
        let mut state = self.state.lock();
        state.record("terminate", call.to_string());
        state.check("terminate")?;
        state.live_call(call)?;
        state.end_call(call);
        Ok(())
    }

    fn terminate_all(&mut self) -> Result<(), String> {
        let mut state = self.state.lock();
        state.record("terminate_all", "");
        state.check("terminate_all")?;
        let mut live: Vec<CallHandle> = state
            .calls
            .iter()
            .filter(|(_, c)| !c.ended)
            .map(|(h, _)| *h)
            .collect();
        live.sort();
        for handle in live {
            state.end_call(handle);
        }
        Ok(())
    }

    fn pause(&mut self, call: CallHandle) -> Result<(), String> {
        let mut state = self.state.lock();
        state.record("pause", call.to_string());
        state.check("pause")?;
        state.live_call(call)?;
        state.push_call(call, RawCallState::Pausing);
        state.push_call(call, RawCallState::Paused);
        Ok(())
    }

    fn resume(&mut self, call: CallHandle) -> Result<(), String> {
        let mut state = self.state.lock();
        state.record("resume", call.to_string());
        state.check("resume")?;
        state.live_call(call)?;
        state.push_call(call, RawCallState::Resuming);
        state.push_call(call, RawCallState::StreamsRunning);
        Ok(())
    }

    fn redirect(&mut self, call: CallHandle, uri: &str) -> Result<(), String> {
        let mut state = self.state.lock();
        state.record("redirect", format!("{} -> {}", call, uri));
        state.check("redirect")?;
        state.live_call(call)?;
        state.end_call(call);
        Ok(())
    }

    fn transfer(&mut self, call: CallHandle, uri: &str) -> Result<(), String> {
        let mut state = self.state.lock();
        state.record("transfer", format!("{} -> {}", call, uri));
        state.check("transfer")?;
        state.live_call(call)?;
        state.push_call(call, RawCallState::Referred);
        Ok(())
    }

    fn send_dtmfs(&mut self, call: CallHandle, digits: &str) -> Result<(), String> {
        let mut state = self.state.lock();
        state.record("send_dtmfs", format!("{} {}", call, digits));
        state.check("send_dtmfs")?;
        state.live_call(call).map(|_| ())
    }

    fn start_recording(&mut self, call: CallHandle) {
        let mut state = self.state.lock();
        state.record("start_recording", call.to_string());
        if let Some(mock_call) = state.calls.get_mut(&call) {
            mock_call.recording = mock_call.record_file.is_some() && !mock_call.ended;
        }
    }

    fn stop_recording(&mut self, call: CallHandle) {
        let mut state = self.state.lock();
        state.record("stop_recording", call.to_string());
        if let Some(mock_call) = state.calls.get_mut(&call) {
            mock_call.recording = false;
        }
    }

    fn ref_call(&mut self, call: CallHandle) {
        let mut state = self.state.lock();
        state.record("ref_call", call.to_string());
        *state.refs.entry(call).or_insert(0) += 1;
    }

    fn unref_call(&mut self, call: CallHandle) {
        let mut state = self.state.lock();
        state.record("unref_call", call.to_string());
        *state.refs.entry(call).or_insert(0) -= 1;
    }

    fn call_remote_address(&self, call: CallHandle) -> Option<String> {
        self.trip("call_remote_address");
        self.state.lock().calls.get(&call).map(|c| c.remote.clone())
    }

    fn call_record_file(&self, call: CallHandle) -> Option<String> {
        self.state
            .lock()
            .calls
            .get(&call)
            .and_then(|c| c.record_file.clone())
    }

    fn send_message(&mut self, to: &str, text: &str) -> Result<(), String> {
        let mut state = self.state.lock();
        state.record("send_message", format!("{}: {}", to, text));
        state.check("send_message")
    }

    fn set_ringback(&mut self, file: &str) {
        let mut state = self.state.lock();
        state.record("set_ringback", file);
        state.ringback = Some(file.to_string());
    }

    fn set_ring(&mut self, file: &str) {
        let mut state = self.state.lock();
        state.record("set_ring", file);
        state.ring = Some(file.to_string());
    }

    fn mic_enabled(&self) -> bool {
        self.state.lock().mic
    }

    fn enable_mic(&mut self, enabled: bool) {
        let mut state = self.state.lock();
        state.record("enable_mic", enabled.to_string());
        state.mic = enabled;
    }

    fn keep_alive_enabled(&self) -> bool {
        self.state.lock().keep_alive
    }

    fn enable_keep_alive(&mut self, enabled: bool) {
        let mut state = self.state.lock();
        state.record("enable_keep_alive", enabled.to_string());
        state.keep_alive = enabled;
    }

    fn echo_cancellation_enabled(&self) -> bool {
        self.state.lock().echo_cancellation
    }

    fn enable_echo_cancellation(&mut self, enabled: bool) {
        let mut state = self.state.lock();
        state.record("enable_echo_cancellation", enabled.to_string());
        state.echo_cancellation = enabled;
    }

    fn ringer_device(&self) -> Option<String> {
        self.state.lock().ringer_device.clone()
    }

    fn set_ringer_device(&mut self, device: &str) -> Result<(), String> {
        let mut state = self.state.lock();
        state.record("set_ringer_device", device);
        if !state.devices.iter().any(|d| d.name == device && d.can_playback) {
            return Err(format!("unknown playback device {}", device));
        }
        state.ringer_device = Some(device.to_string());
        Ok(())
    }

    fn playback_device(&self) -> Option<String> {
        self.state.lock().playback_device.clone()
    }

    fn set_playback_device(&mut self, device: &str) -> Result<(), String> {
        let mut state = self.state.lock();
        state.record("set_playback_device", device);
        if !state.devices.iter().any(|d| d.name == device && d.can_playback) {
            return Err(format!("unknown playback device {}", device));
        }
        state.playback_device = Some(device.to_string());
        Ok(())
    }

    fn capture_device(&self) -> Option<String> {
        self.state.lock().capture_device.clone()
    }

    fn set_capture_device(&mut self, device: &str) -> Result<(), String> {
        let mut state = self.state.lock();
        state.record("set_capture_device", device);
        if !state.devices.iter().any(|d| d.name == device && d.can_capture) {
            return Err(format!("unknown capture device {}", device));
        }
        state.capture_device = Some(device.to_string());
        Ok(())
    }

    fn reload_sound_devices(&mut self) {
        self.state.lock().record("reload_sound_devices", "");
    }

    fn sound_devices(&self) -> Vec<SoundDevice> {
        self.state.lock().devices.clone()
    }

    fn audio_codecs(&self) -> Vec<AudioCodec> {
        self.state.lock().codecs.clone()
    }

    fn enable_codec(&mut self, name: &str, clock_rate: u32, enabled: bool) -> Result<(), String> {
        let mut state = self.state.lock();
        state.record("enable_codec", format!("{}/{} {}", name, clock_rate, enabled));
        match state
            .codecs
            .iter_mut()
            .find(|c| c.name == name && c.clock_rate == clock_rate)
        {
            Some(codec) => {
                codec.enabled = enabled;
                Ok(())
            }
            None => Err(format!("unknown codec {}/{}", name, clock_rate)),
        }
    }

    fn destroy(self: Box<Self>) {
        let mut state = self.state.lock();
        state.record("destroy", "");
        state.destroyed += 1;
        state.registered = false;
        state.pending.clear();
    }
}
