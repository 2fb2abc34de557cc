//! Phone State Machine
//!
//! [`Phone`] is the public operation surface. It tracks two pieces of coarse
//! state, both changed only by events coming off the engine bus:
//!
//! ```text
//!                connect()            registration Ok
//!  Disconnected ──────────▶ Progress ─────────────────▶ Connected
//!        ▲                    │  ▲                          │
//!        │   registration     │  │       disconnect()       │
//!        └──── Cleared ◀──────┘  └──────────────────────────┘
//!
//!  LineState: Free ──(a call enters Loading/Active)──▶ Busy
//!             Busy ──(every such call Completed/Error)──▶ Free
//! ```
//!
//! Guards are checked on the calling thread before any engine work: placing a
//! call requires `Connected` and a free line. Everything else is marshaled to
//! the engine loop and blocks until it ran there.
//!
//! A registration failure tears the engine down automatically. Once teardown
//! finished the phone is `Disconnected`, then `Error(RegisterFailed)` and
//! `PhoneDisconnected` are published, in that order.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sipline_phone_core::config::{Account, PhoneConfig};
//! use sipline_phone_core::engine::mock::MockEngineHandle;
//! use sipline_phone_core::events::{EventFilter, PhoneEvent};
//! use sipline_phone_core::{ConnectState, Phone};
//!
//! # fn main() -> sipline_phone_core::PhoneResult<()> {
//! let mock = MockEngineHandle::new();
//! let phone = Phone::new(
//!     Account::new("alice", "secret", "pbx.example.com"),
//!     PhoneConfig::default(),
//!     mock.factory(),
//! )?;
//!
//! phone.subscribe(
//!     Arc::new(|event: &PhoneEvent| println!("{:?}", event)),
//!     EventFilter::all(),
//! );
//!
//! phone.connect()?;
//! assert!(phone.wait_for_connect_state(ConnectState::Connected, Duration::from_secs(1)));
//! phone.make_call("sip:bob@pbx.example.com")?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::command::SubmitOptions;
use crate::config::{Account, AudioCodec, PhoneConfig, ShutdownConfig};
use crate::engine::{CallParams, Capabilities, Capability, EngineFactory, RegistrationState};
use crate::engine_loop::{EngineContext, EngineLoop, LoopConfig};
use crate::error::{ErrorKind, PhoneError, PhoneResult};
use crate::events::{
    EngineEvent, EventBus, EventFamily, EventFilter, EventHandler, LogGate, PhoneEvent,
    Subscribers,
};
use crate::registry::{Call, CallDirection, CallState};

/// Registration-level state of the phone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectState {
    Disconnected,
    /// Connecting or disconnecting
    Progress,
    Connected,
}

/// Whether a call occupies the line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LineState {
    Free,
    Busy,
}

#[derive(Debug)]
struct PhoneState {
    connect: ConnectState,
    line: LineState,
    busy_calls: HashSet<Uuid>,
    tearing_down: bool,
    register_failed: bool,
}

impl PhoneState {
    fn new() -> Self {
        Self {
            connect: ConnectState::Disconnected,
            line: LineState::Free,
            busy_calls: HashSet::new(),
            tearing_down: false,
            register_failed: false,
        }
    }

    fn occupy(&mut self, call_id: Uuid) {
        self.busy_calls.insert(call_id);
        self.line = LineState::Busy;
    }

    fn release(&mut self, call_id: Uuid) {
        self.busy_calls.remove(&call_id);
        if self.busy_calls.is_empty() {
            self.line = LineState::Free;
        }
    }

    fn reset(&mut self) {
        self.busy_calls.clear();
        self.line = LineState::Free;
        self.tearing_down = false;
        self.register_failed = false;
    }
}

struct Shared {
    state: Mutex<PhoneState>,
    changed: Condvar,
    subscribers: Subscribers<PhoneEvent>,
    engine: Mutex<Option<Arc<EngineLoop>>>,
    log_gate: Arc<LogGate>,
    log_listeners: Mutex<HashSet<Uuid>>,
    shutdown: ShutdownConfig,
}

impl Shared {
    fn current_engine(&self) -> Option<Arc<EngineLoop>> {
        self.engine.lock().clone()
    }

    /// The current loop if it is the one identified by `loop_id`
    fn engine_for(&self, loop_id: Uuid) -> Option<Arc<EngineLoop>> {
        self.current_engine().filter(|engine| engine.id() == loop_id)
    }

    fn request_teardown(&self) {
        if let Some(engine) = self.current_engine() {
            engine.request_shutdown(self.shutdown.clone());
        }
    }

    fn emit(&self, events: Vec<PhoneEvent>) {
        for event in events {
            self.subscribers.dispatch(&event);
        }
    }
}

/// Turns engine events into phone state and phone events
struct StateMachine {
    shared: Weak<Shared>,
}

impl StateMachine {
    fn on_registration(
        &self,
        shared: &Shared,
        engine: Arc<EngineLoop>,
        state: RegistrationState,
    ) -> Vec<PhoneEvent> {
        let mut events = Vec::new();
        let mut teardown = false;
        {
            let mut phone = shared.state.lock();
            match state {
                RegistrationState::Ok => {
                    if phone.connect == ConnectState::Progress && !phone.tearing_down {
                        phone.connect = ConnectState::Connected;
                        info!("Phone connected");
                        events.push(PhoneEvent::PhoneConnected);
                    }
                }
                RegistrationState::Failed => {
                    if phone.connect != ConnectState::Disconnected && !phone.register_failed {
                        warn!("Registration failed, tearing down engine");
                        phone.connect = ConnectState::Progress;
                        phone.register_failed = true;
                        phone.tearing_down = true;
                        teardown = true;
                    }
                }
                RegistrationState::Cleared => {
                    if phone.connect != ConnectState::Disconnected {
                        phone.connect = ConnectState::Disconnected;
                        if phone.register_failed {
                            events.push(PhoneEvent::Error {
                                call: None,
                                kind: ErrorKind::RegisterFailed,
                            });
                        }
                        phone.reset();
                        info!("Phone disconnected");
                        events.push(PhoneEvent::PhoneDisconnected);
                        teardown = true;
                    }
                }
                RegistrationState::None | RegistrationState::Progress => {}
            }
        }
        shared.changed.notify_all();
        if teardown {
            engine.request_shutdown(shared.shutdown.clone());
        }
        events
    }

    fn on_call_state(&self, shared: &Shared, call: &Call) -> Vec<PhoneEvent> {
        let mut events = Vec::new();
        {
            let mut phone = shared.state.lock();
            match call.state() {
                CallState::Loading => {
                    phone.occupy(call.id());
                    events.push(match call.direction() {
                        CallDirection::Outgoing => PhoneEvent::OutgoingCall(call.clone()),
                        _ => PhoneEvent::IncomingCall(call.clone()),
                    });
                }
                CallState::Active => {
                    phone.occupy(call.id());
                    events.push(PhoneEvent::CallActive(call.clone()));
                }
                CallState::Completed => {
                    phone.release(call.id());
                    events.push(PhoneEvent::CallCompleted(call.clone()));
                }
                CallState::Error => {
                    phone.release(call.id());
                    events.push(PhoneEvent::Error {
                        call: Some(call.clone()),
                        kind: ErrorKind::CallError,
                    });
                    events.push(PhoneEvent::CallCompleted(call.clone()));
                }
                CallState::None => {}
            }
        }
        shared.changed.notify_all();
        events
    }
}

impl EventHandler<EngineEvent> for StateMachine {
    fn on_event(&self, event: &EngineEvent) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };

        let source = match event.loop_id() {
            Some(loop_id) => match shared.engine_for(loop_id) {
                Some(engine) => Some(engine),
                None => {
                    trace!(%loop_id, "Ignoring event from a previous engine loop");
                    return;
                }
            },
            None => None,
        };

        let events = match (event, source) {
            (EngineEvent::Registration { state, .. }, Some(engine)) => {
                self.on_registration(&shared, engine, *state)
            }
            (EngineEvent::Registration { .. }, None) => Vec::new(),
            (EngineEvent::CallState { call, .. }, _) => self.on_call_state(&shared, call),
            (EngineEvent::Message { from, text }, _) => vec![PhoneEvent::MessageReceived {
                from: from.clone(),
                text: text.clone(),
            }],
            (EngineEvent::Log { level, message, .. }, _) => vec![PhoneEvent::Log {
                level: *level,
                message: message.clone(),
            }],
            (EngineEvent::LoopFailed { reason, .. }, _) => {
                warn!(%reason, "Engine loop failed");
                vec![PhoneEvent::Error {
                    call: None,
                    kind: ErrorKind::UnknownError,
                }]
            }
        };
        shared.emit(events);
    }
}

/// Softphone bound to one account
///
/// All operations may be called from any thread.
pub struct Phone {
    account: Account,
    config: PhoneConfig,
    factory: Arc<dyn EngineFactory>,
    bus: Arc<EventBus<EngineEvent>>,
    shared: Arc<Shared>,
}

impl Phone {
    /// Create a disconnected phone; no engine exists until [`connect`](Self::connect)
    pub fn new(
        account: Account,
        config: PhoneConfig,
        factory: Arc<dyn EngineFactory>,
    ) -> PhoneResult<Self> {
        account.validate()?;
        config.validate()?;

        let bus = Arc::new(EventBus::new(
            "sipline",
            config.event_workers,
            config.event_channel_capacity,
        )?);
        let shared = Arc::new(Shared {
            state: Mutex::new(PhoneState::new()),
            changed: Condvar::new(),
            subscribers: Subscribers::new(config.event_channel_capacity),
            engine: Mutex::new(None),
            log_gate: Arc::new(LogGate::new()),
            log_listeners: Mutex::new(HashSet::new()),
            shutdown: config.shutdown.clone(),
        });
        bus.subscribe(
            Arc::new(StateMachine {
                shared: Arc::downgrade(&shared),
            }),
            EventFilter::all(),
        );

        debug!(identity = %account.identity(), "Phone created");
        Ok(Self {
            account,
            config,
            factory,
            bus,
            shared,
        })
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn config(&self) -> &PhoneConfig {
        &self.config
    }

    pub fn connect_state(&self) -> ConnectState {
        self.shared.state.lock().connect
    }

    pub fn line_state(&self) -> LineState {
        self.shared.state.lock().line
    }

    /// Block until the phone reaches `wanted` or `timeout` elapses
    pub fn wait_for_connect_state(&self, wanted: ConnectState, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.connect == wanted)
    }

    /// Block until the line reaches `wanted` or `timeout` elapses
    pub fn wait_for_line_state(&self, wanted: LineState, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.line == wanted)
    }

    fn wait_until(&self, timeout: Duration, done: impl Fn(&PhoneState) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while !done(&state) {
            if self.shared.changed.wait_until(&mut state, deadline).timed_out() {
                return done(&state);
            }
        }
        true
    }

    // -- events --

    /// Register a handler; returns its subscription id
    pub fn subscribe(&self, handler: Arc<dyn EventHandler<PhoneEvent>>, filter: EventFilter) -> Uuid {
        self.shared.subscribers.subscribe(handler, filter)
    }

    pub fn unsubscribe(&self, id: Uuid) -> bool {
        self.shared.subscribers.unsubscribe(id)
    }

    /// Stream of every phone event from now on
    pub fn events(&self) -> broadcast::Receiver<PhoneEvent> {
        self.shared.subscribers.stream()
    }

    /// Register a handler for engine log lines
    ///
    /// Engine logs are published as events only while at least one log
    /// listener is registered on this phone.
    pub fn add_log_listener(&self, handler: Arc<dyn EventHandler<PhoneEvent>>) -> Uuid {
        let id = self
            .shared
            .subscribers
            .subscribe(handler, EventFilter::only([EventFamily::Log]));
        self.shared.log_listeners.lock().insert(id);
        self.shared.log_gate.add();
        id
    }

    pub fn remove_log_listener(&self, id: Uuid) -> bool {
        if !self.shared.log_listeners.lock().remove(&id) {
            return false;
        }
        self.shared.log_gate.remove();
        self.shared.subscribers.unsubscribe(id)
    }

    // -- connection --

    /// Create the engine and start registering
    ///
    /// Sets `Progress` immediately; `PhoneConnected` follows once the proxy
    /// accepted the registration.
    pub fn connect(&self) -> PhoneResult<()> {
        {
            let mut state = self.shared.state.lock();
            if state.connect != ConnectState::Disconnected {
                return Err(PhoneError::order("connect", state.connect));
            }
            state.reset();
            state.connect = ConnectState::Progress;
        }
        self.shared.changed.notify_all();

        let mut slot = self.shared.engine.lock();
        if let Some(previous) = slot.take() {
            previous.stop();
        }

        let spawned = EngineLoop::spawn(
            self.factory.clone(),
            LoopConfig::new(self.account.clone(), &self.config),
            self.bus.clone(),
            self.shared.log_gate.clone(),
        );
        match spawned {
            Ok(engine_loop) => {
                *slot = Some(Arc::new(engine_loop));
                info!(identity = %self.account.identity(), "Connecting");
                Ok(())
            }
            Err(e) => {
                drop(slot);
                self.shared.state.lock().connect = ConnectState::Disconnected;
                self.shared.changed.notify_all();
                Err(e)
            }
        }
    }

    /// Begin tearing the engine down; returns without waiting
    ///
    /// `PhoneDisconnected` is published when teardown finished. Use
    /// [`wait_for_connect_state`](Self::wait_for_connect_state) to block on it.
    pub fn disconnect(&self) -> PhoneResult<()> {
        {
            let mut state = self.shared.state.lock();
            if state.connect != ConnectState::Connected {
                return Err(PhoneError::order("disconnect", state.connect));
            }
            state.connect = ConnectState::Progress;
            state.tearing_down = true;
        }
        self.shared.changed.notify_all();
        info!("Disconnecting");
        self.shared.request_teardown();
        Ok(())
    }

    // -- calls --

    pub fn make_call(&self, uri: &str) -> PhoneResult<()> {
        self.place_call(uri, None)
    }

    /// Place a call and record it to `file` from the start
    pub fn make_call_and_record(&self, uri: &str, file: &str) -> PhoneResult<()> {
        PhoneError::require_non_empty("file", file)?;
        self.place_call(uri, Some(file.to_string()))
    }

    fn place_call(&self, uri: &str, record_file: Option<String>) -> PhoneResult<()> {
        PhoneError::require_non_empty("uri", uri)?;
        {
            let state = self.shared.state.lock();
            if state.connect != ConnectState::Connected {
                return Err(PhoneError::order("make_call", state.connect));
            }
            if state.line == LineState::Busy {
                return Err(PhoneError::LineBusy);
            }
        }

        let uri = uri.to_string();
        self.submit(move |ctx| {
            ctx.require(Capability::Calls)?;
            let recording = record_file.is_some();
            if recording {
                ctx.require(Capability::Recording)?;
            }
            let params = CallParams::audio_only().with_record_file(record_file);
            let handle = ctx
                .engine()
                .invite(&uri, &params)
                .ok_or_else(|| PhoneError::engine("invite", format!("no call created for {}", uri)))?;
            if recording {
                ctx.engine().start_recording(handle);
            }
            debug!(%handle, %uri, recording, "Call placed");
            Ok(())
        })
    }

    pub fn receive_call(&self, call: &Call) -> PhoneResult<()> {
        self.answer(call, None)
    }

    /// Answer `call` and record it to `file` from the start
    pub fn receive_call_and_record(&self, call: &Call, file: &str) -> PhoneResult<()> {
        PhoneError::require_non_empty("file", file)?;
        self.answer(call, Some(file.to_string()))
    }

    fn answer(&self, call: &Call, record_file: Option<String>) -> PhoneResult<()> {
        let call_id = call.id();
        self.submit(move |ctx| {
            let recording = record_file.is_some();
            if recording {
                ctx.require(Capability::Recording)?;
            }
            let handle = ctx.live_handle_by_id(call_id)?;
            let params = CallParams::audio_only().with_record_file(record_file);
            ctx.engine()
                .accept(handle, &params)
                .map_err(|reason| PhoneError::engine("accept", reason))?;
            if recording {
                ctx.engine().start_recording(handle);
            }
            Ok(())
        })
    }

    pub fn terminate_call(&self, call: &Call) -> PhoneResult<()> {
        self.with_call(call, None, |ctx, handle| {
            ctx.engine()
                .terminate(handle)
                .map_err(|reason| PhoneError::engine("terminate", reason))
        })
    }

    pub fn pause_call(&self, call: &Call) -> PhoneResult<()> {
        self.with_call(call, Some(Capability::PauseResume), |ctx, handle| {
            ctx.engine()
                .pause(handle)
                .map_err(|reason| PhoneError::engine("pause", reason))
        })
    }

    pub fn resume_call(&self, call: &Call) -> PhoneResult<()> {
        self.with_call(call, Some(Capability::PauseResume), |ctx, handle| {
            ctx.engine()
                .resume(handle)
                .map_err(|reason| PhoneError::engine("resume", reason))
        })
    }

    /// Redirect a ringing call to `uri`
    pub fn redirect_call(&self, call: &Call, uri: &str) -> PhoneResult<()> {
        PhoneError::require_non_empty("uri", uri)?;
        let uri = uri.to_string();
        self.with_call(call, Some(Capability::Redirect), move |ctx, handle| {
            ctx.engine()
                .redirect(handle, &uri)
                .map_err(|reason| PhoneError::engine("redirect", reason))
        })
    }

    /// Blind-transfer an established call to `uri`
    pub fn transfer_call(&self, call: &Call, uri: &str) -> PhoneResult<()> {
        PhoneError::require_non_empty("uri", uri)?;
        let uri = uri.to_string();
        self.with_call(call, Some(Capability::Transfer), move |ctx, handle| {
            ctx.engine()
                .transfer(handle, &uri)
                .map_err(|reason| PhoneError::engine("transfer", reason))
        })
    }

    /// Send DTMF digits (`0-9`, `*`, `#`, `A-D`)
    pub fn send_dtmfs(&self, call: &Call, digits: &str) -> PhoneResult<()> {
        validate_dtmf(digits)?;
        let digits = digits.to_string();
        self.with_call(call, Some(Capability::Dtmf), move |ctx, handle| {
            ctx.engine()
                .send_dtmfs(handle, &digits)
                .map_err(|reason| PhoneError::engine("send_dtmfs", reason))
        })
    }

    /// Start recording a call that has a record file; no-op otherwise
    pub fn start_recording(&self, call: &Call) -> PhoneResult<()> {
        self.with_call(call, Some(Capability::Recording), |ctx, handle| {
            if ctx.engine_ref().call_record_file(handle).is_some() {
                ctx.engine().start_recording(handle);
            } else {
                debug!(%handle, "Call has no record file, not recording");
            }
            Ok(())
        })
    }

    /// Stop recording a call that has a record file; no-op otherwise
    pub fn pause_recording(&self, call: &Call) -> PhoneResult<()> {
        self.with_call(call, Some(Capability::Recording), |ctx, handle| {
            if ctx.engine_ref().call_record_file(handle).is_some() {
                ctx.engine().stop_recording(handle);
            }
            Ok(())
        })
    }

    /// Snapshots of every call the engine currently knows
    pub fn calls(&self) -> PhoneResult<Vec<Call>> {
        self.submit(|ctx| Ok(ctx.registry().snapshot()))
    }

    // -- messaging --

    pub fn send_message(&self, to: &str, text: &str) -> PhoneResult<()> {
        PhoneError::require_non_empty("to", to)?;
        PhoneError::require_non_empty("text", text)?;
        let (to, text) = (to.to_string(), text.to_string());
        self.submit(move |ctx| {
            ctx.require(Capability::Messaging)?;
            ctx.engine()
                .send_message(&to, &text)
                .map_err(|reason| PhoneError::engine("send_message", reason))
        })
    }

    // -- sound settings --

    pub fn set_ringback_sound(&self, file: &str) -> PhoneResult<()> {
        PhoneError::require_non_empty("file", file)?;
        let file = file.to_string();
        self.submit(move |ctx| {
            ctx.engine().set_ringback(&file);
            Ok(())
        })
    }

    pub fn set_incoming_ring_sound(&self, file: &str) -> PhoneResult<()> {
        PhoneError::require_non_empty("file", file)?;
        let file = file.to_string();
        self.submit(move |ctx| {
            ctx.engine().set_ring(&file);
            Ok(())
        })
    }

    pub fn mic_enabled(&self) -> PhoneResult<bool> {
        self.submit(|ctx| Ok(ctx.engine_ref().mic_enabled()))
    }

    pub fn set_mic_enabled(&self, enabled: bool) -> PhoneResult<()> {
        self.submit(move |ctx| {
            ctx.engine().enable_mic(enabled);
            Ok(())
        })
    }

    pub fn keep_alive_enabled(&self) -> PhoneResult<bool> {
        self.submit(|ctx| Ok(ctx.engine_ref().keep_alive_enabled()))
    }

    pub fn set_keep_alive_enabled(&self, enabled: bool) -> PhoneResult<()> {
        self.submit(move |ctx| {
            ctx.engine().enable_keep_alive(enabled);
            Ok(())
        })
    }

    pub fn echo_cancellation_enabled(&self) -> PhoneResult<bool> {
        self.submit(|ctx| Ok(ctx.engine_ref().echo_cancellation_enabled()))
    }

    pub fn set_echo_cancellation_enabled(&self, enabled: bool) -> PhoneResult<()> {
        self.submit(move |ctx| {
            ctx.engine().enable_echo_cancellation(enabled);
            Ok(())
        })
    }

    pub fn ringer_device(&self) -> PhoneResult<Option<String>> {
        self.submit(|ctx| {
            ctx.require(Capability::SoundDevices)?;
            Ok(ctx.engine_ref().ringer_device())
        })
    }

    pub fn set_ringer_device(&self, device: &str) -> PhoneResult<()> {
        self.set_device("set_ringer_device", device, |ctx, device| {
            ctx.engine().set_ringer_device(device)
        })
    }

    pub fn playback_device(&self) -> PhoneResult<Option<String>> {
        self.submit(|ctx| {
            ctx.require(Capability::SoundDevices)?;
            Ok(ctx.engine_ref().playback_device())
        })
    }

    pub fn set_playback_device(&self, device: &str) -> PhoneResult<()> {
        self.set_device("set_playback_device", device, |ctx, device| {
            ctx.engine().set_playback_device(device)
        })
    }

    pub fn capture_device(&self) -> PhoneResult<Option<String>> {
        self.submit(|ctx| {
            ctx.require(Capability::SoundDevices)?;
            Ok(ctx.engine_ref().capture_device())
        })
    }

    pub fn set_capture_device(&self, device: &str) -> PhoneResult<()> {
        self.set_device("set_capture_device", device, |ctx, device| {
            ctx.engine().set_capture_device(device)
        })
    }

    /// Names of devices usable for playback, after reloading the device list
    pub fn playback_devices(&self) -> PhoneResult<Vec<String>> {
        self.list_devices(|device| device.can_playback)
    }

    /// Names of devices usable for capture, after reloading the device list
    pub fn capture_devices(&self) -> PhoneResult<Vec<String>> {
        self.list_devices(|device| device.can_capture)
    }

    // -- codecs --

    pub fn audio_codecs(&self) -> PhoneResult<Vec<AudioCodec>> {
        self.submit(|ctx| {
            ctx.require(Capability::Codecs)?;
            Ok(ctx.engine_ref().audio_codecs())
        })
    }

    pub fn set_codec_enabled(&self, codec: &AudioCodec, enabled: bool) -> PhoneResult<()> {
        PhoneError::require_non_empty("codec", &codec.name)?;
        let (name, clock_rate) = (codec.name.clone(), codec.clock_rate);
        self.submit(move |ctx| {
            ctx.require(Capability::Codecs)?;
            ctx.engine()
                .enable_codec(&name, clock_rate, enabled)
                .map_err(|reason| PhoneError::engine("enable_codec", reason))
        })
    }

    /// Capability set of the running engine
    pub fn capabilities(&self) -> PhoneResult<Capabilities> {
        let engine = self.engine_loop()?;
        if !engine.is_running() {
            return Err(PhoneError::EngineNotRunning);
        }
        Ok(engine.capabilities().clone())
    }

    // -- plumbing --

    fn engine_loop(&self) -> PhoneResult<Arc<EngineLoop>> {
        self.shared
            .current_engine()
            .ok_or(PhoneError::EngineNotRunning)
    }

    fn submit<F, T>(&self, f: F) -> PhoneResult<T>
    where
        F: FnOnce(&mut EngineContext) -> PhoneResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let options = SubmitOptions {
            timeout: self.config.default_submit_timeout,
        };
        self.engine_loop()?.submit_with(options, f)
    }

    fn with_call<F>(&self, call: &Call, capability: Option<Capability>, f: F) -> PhoneResult<()>
    where
        F: FnOnce(&mut EngineContext, crate::engine::CallHandle) -> PhoneResult<()> + Send + 'static,
    {
        let call_id = call.id();
        self.submit(move |ctx| {
            if let Some(capability) = capability {
                ctx.require(capability)?;
            }
            let handle = ctx.live_handle_by_id(call_id)?;
            f(ctx, handle)
        })
    }

    fn set_device<F>(&self, operation: &'static str, device: &str, f: F) -> PhoneResult<()>
    where
        F: FnOnce(&mut EngineContext, &str) -> Result<(), String> + Send + 'static,
    {
        PhoneError::require_non_empty("device", device)?;
        let device = device.to_string();
        self.submit(move |ctx| {
            ctx.require(Capability::SoundDevices)?;
            f(ctx, &device).map_err(|reason| PhoneError::engine(operation, reason))
        })
    }

    fn list_devices(
        &self,
        keep: fn(&crate::engine::SoundDevice) -> bool,
    ) -> PhoneResult<Vec<String>> {
        self.submit(move |ctx| {
            ctx.require(Capability::SoundDevices)?;
            ctx.engine().reload_sound_devices();
            Ok(ctx
                .engine_ref()
                .sound_devices()
                .into_iter()
                .filter(|device| keep(device))
                .map(|device| device.name)
                .collect())
        })
    }
}

impl Drop for Phone {
    fn drop(&mut self) {
        // Keep the loop current until its last events are delivered
        if let Some(engine) = self.shared.current_engine() {
            engine.stop();
        }
        self.bus.shutdown();
        self.shared.engine.lock().take();
    }
}

fn validate_dtmf(digits: &str) -> PhoneResult<()> {
    PhoneError::require_non_empty("digits", digits)?;
    match digits
        .chars()
        .find(|c| !(c.is_ascii_digit() || matches!(c.to_ascii_uppercase(), '*' | '#' | 'A'..='D')))
    {
        Some(bad) => Err(PhoneError::invalid_argument(
            "digits",
            format!("'{}' is not a DTMF digit", bad),
        )),
        None => Ok(()),
    }
}
