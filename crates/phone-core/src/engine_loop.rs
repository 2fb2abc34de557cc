//! Engine Loop
//!
//! The one thread allowed to touch the engine. Each cycle it pumps the engine,
//! turns what the engine reported into registry updates and bus events, moves
//! a pending shutdown forward, and then waits up to one poll interval for a
//! single command to run.
//!
//! ```text
//!   callers ──submit──▶ CommandQueue ──▶ ┌──────────── engine loop ────────────┐
//!                                        │ iterate ─▶ translate ─▶ registry    │
//!                                        │    │                      │         │
//!                                        │    └──────── publish ◀────┘         │
//!                                        │ shutdown step                       │
//!                                        │ recv_timeout(poll) ─▶ run command   │
//!                                        └─────────────────────────────────────┘
//!                                                       │
//!                                                       ▼
//!                                                 EventBus workers
//! ```
//!
//! # Shutdown
//!
//! A shutdown request closes the queue (pending commands fail with
//! `ShuttingDown`), asks the engine to terminate every call, and then walks
//! two bounded stages:
//!
//! 1. **Terminating**: until the registry is empty or `call_teardown_grace`
//!    elapsed. Then unregister if the proxy is registered.
//! 2. **Unregistering**: until registration `Cleared` was observed or
//!    `unregister_grace` elapsed.
//!
//! After that every remaining call reference is released, the engine is
//! destroyed, and registration `Cleared` is published if the engine did not
//! report it itself.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use parking_lot::Mutex;
use tracing::{debug, error, info, info_span, trace, warn};
use uuid::Uuid;

use crate::command::{panic_message, CommandQueue, QueueState, SubmitOptions};
use crate::config::{Account, PhoneConfig, ShutdownConfig};
use crate::engine::{
    CallHandle, Capabilities, Capability, Engine, EngineConfig, EngineFactory, EngineLogLevel,
    EngineNotification, ProxyConfig, RawCallState, RegistrationState,
};
use crate::error::{PhoneError, PhoneResult};
use crate::events::{EngineEvent, EventBus, LogGate};
use crate::logging::forward_engine_log;
use crate::registry::{CallRegistry, CallUpdate};
use crate::translator::{translate, AddressRule};

/// Settings for one engine loop
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub engine: EngineConfig,
    pub poll_interval: Duration,
    /// Raise engine log verbosity while log listeners exist
    pub engine_logs: bool,
}

impl LoopConfig {
    pub fn new(account: Account, config: &PhoneConfig) -> Self {
        Self {
            engine: EngineConfig {
                account,
                user_agent: config.user_agent.clone(),
                version: config.version.clone(),
                transports: config.transports,
                nat_policy: config.nat_policy.clone(),
            },
            poll_interval: config.poll_interval,
            engine_logs: config.engine_logs,
        }
    }
}

/// Engine access for a running command
pub struct EngineContext {
    engine: Box<dyn Engine>,
    registry: CallRegistry,
    capabilities: Capabilities,
    identity: String,
}

impl EngineContext {
    pub fn engine(&mut self) -> &mut dyn Engine {
        self.engine.as_mut()
    }

    pub fn engine_ref(&self) -> &dyn Engine {
        self.engine.as_ref()
    }

    pub fn registry(&self) -> &CallRegistry {
        &self.registry
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Local identity used as the local address of calls
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn require(&self, capability: Capability) -> PhoneResult<()> {
        self.capabilities.require(capability)
    }

    /// Engine handle of the call with this id if that very entity is still live
    ///
    /// A snapshot whose handle has since been released, or reused by another
    /// call, yields `CallNotFound`.
    pub fn live_handle_by_id(&self, call_id: Uuid) -> PhoneResult<CallHandle> {
        self.registry
            .find_by_id(call_id)
            .map(|c| c.handle())
            .ok_or(PhoneError::CallNotFound { call_id })
    }
}

#[derive(Debug, Clone, Copy)]
enum ShutdownPhase {
    Terminating { deadline: Instant },
    Unregistering { deadline: Instant },
}

#[derive(Debug, Default)]
struct Control {
    requested: Option<ShutdownConfig>,
}

/// Handle on a running engine loop thread
///
/// Dropping it shuts the loop down immediately and waits for the thread.
pub struct EngineLoop {
    id: Uuid,
    queue: Arc<CommandQueue>,
    control: Arc<Mutex<Control>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    capabilities: Capabilities,
}

impl EngineLoop {
    /// Start the loop thread and create the engine on it
    ///
    /// Returns once the engine exists and is configured, or with
    /// `EngineCreation` if that failed.
    pub fn spawn(
        factory: Arc<dyn EngineFactory>,
        config: LoopConfig,
        bus: Arc<EventBus<EngineEvent>>,
        log_gate: Arc<LogGate>,
    ) -> PhoneResult<Self> {
        let queue = Arc::new(CommandQueue::new());
        let control = Arc::new(Mutex::new(Control::default()));
        let (ready_tx, ready_rx) = bounded::<PhoneResult<Capabilities>>(1);

        let id = Uuid::new_v4();
        let runner = Runner {
            loop_id: id,
            queue: queue.clone(),
            control: control.clone(),
            bus,
            log_gate,
            poll_interval: config.poll_interval,
            engine_logs: config.engine_logs,
            log_level: EngineLogLevel::Off,
            phase: None,
            cleared_seen: false,
        };

        let handle = thread::Builder::new()
            .name("sipline-engine".to_string())
            .spawn(move || runner.run(factory, config.engine, ready_tx))
            .map_err(|e| PhoneError::EngineCreation {
                reason: format!("failed to spawn engine thread: {}", e),
            })?;

        let capabilities = match ready_rx.recv() {
            Ok(Ok(capabilities)) => capabilities,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(PhoneError::EngineCreation {
                    reason: "engine thread exited during startup".to_string(),
                });
            }
        };

        info!(loop_id = %id, version = %capabilities.version, "Engine loop started");
        Ok(Self {
            id,
            queue,
            control,
            thread: Mutex::new(Some(handle)),
            capabilities,
        })
    }

    /// Identifies this loop in the events it publishes
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Capability set queried when the engine was created
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Run `f` on the loop thread and wait for its result
    pub fn submit<F, T>(&self, f: F) -> PhoneResult<T>
    where
        F: FnOnce(&mut EngineContext) -> PhoneResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.queue.submit(f)
    }

    pub fn submit_with<F, T>(&self, options: SubmitOptions, f: F) -> PhoneResult<T>
    where
        F: FnOnce(&mut EngineContext) -> PhoneResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.queue.submit_with(options, f)
    }

    /// Whether the loop still accepts or drains commands
    pub fn is_running(&self) -> bool {
        if self.queue.state() == QueueState::Closed {
            return false;
        }
        self.thread
            .lock()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Begin the shutdown sequence; returns immediately
    ///
    /// Only the first request counts.
    pub fn request_shutdown(&self, shutdown: ShutdownConfig) {
        let mut control = self.control.lock();
        if control.requested.is_none() {
            debug!(?shutdown, "Engine loop shutdown requested");
            control.requested = Some(shutdown);
        }
    }

    /// Wait for the loop thread to exit
    ///
    /// A no-op on the loop thread itself.
    pub fn join(&self) {
        if self.queue.on_consumer_thread() {
            return;
        }
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Engine loop thread panicked");
            }
        }
    }

    /// Shut down without grace periods and wait for the thread
    pub fn stop(&self) {
        self.request_shutdown(ShutdownConfig::immediate());
        self.join();
    }
}

impl Drop for EngineLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Runner {
    loop_id: Uuid,
    queue: Arc<CommandQueue>,
    control: Arc<Mutex<Control>>,
    bus: Arc<EventBus<EngineEvent>>,
    log_gate: Arc<LogGate>,
    poll_interval: Duration,
    engine_logs: bool,
    log_level: EngineLogLevel,
    phase: Option<ShutdownPhase>,
    cleared_seen: bool,
}

enum Step {
    Continue,
    Done,
}

impl Runner {
    fn run(
        mut self,
        factory: Arc<dyn EngineFactory>,
        config: EngineConfig,
        ready: crossbeam_channel::Sender<PhoneResult<Capabilities>>,
    ) {
        self.queue.bind_consumer();
        let span = info_span!("engine_loop", loop_id = %self.loop_id, identity = %config.account.identity());
        let _enter = span.enter();

        let mut ctx = match Self::create(factory.as_ref(), &config) {
            Ok(ctx) => ctx,
            Err(e) => {
                error!(error = %e, "Engine creation failed");
                self.queue.finish();
                let _ = ready.send(Err(e));
                return;
            }
        };
        let _ = ready.send(Ok(ctx.capabilities.clone()));
        drop(ready);

        let mut notifications = Vec::new();
        loop {
            let cycle = panic::catch_unwind(AssertUnwindSafe(|| {
                self.cycle(&mut ctx, &mut notifications)
            }));
            match cycle {
                Ok(Step::Continue) => {}
                Ok(Step::Done) => break,
                Err(payload) => {
                    let reason = panic_message(payload.as_ref());
                    error!(%reason, "Engine panicked on the loop thread");
                    self.bus.publish(EngineEvent::LoopFailed {
                        loop_id: self.loop_id,
                        reason,
                    });
                    notifications.clear();
                    break;
                }
            }
        }

        self.finish(ctx);
    }

    /// One pump, dispatch, shutdown and command round
    fn cycle(
        &mut self,
        ctx: &mut EngineContext,
        notifications: &mut Vec<EngineNotification>,
    ) -> Step {
        ctx.engine.iterate(notifications);
        for notification in notifications.drain(..) {
            self.handle_notification(ctx, notification);
        }
        self.sync_log_level(ctx);

        if let Step::Done = self.shutdown_step(ctx) {
            return Step::Done;
        }

        if let Some(command) = self.queue.recv_timeout(self.poll_interval) {
            command.execute(ctx);
        }
        Step::Continue
    }

    fn create(factory: &dyn EngineFactory, config: &EngineConfig) -> PhoneResult<EngineContext> {
        let creation = |reason: String| PhoneError::EngineCreation { reason };

        let mut engine = factory.create(config).map_err(creation)?;
        let capabilities = engine.capabilities();
        debug!(version = %capabilities.version, features = ?capabilities.features, "Engine created");

        let configured = (|| -> Result<(), String> {
            engine.set_log_level(EngineLogLevel::Off);
            engine.set_sip_transports(&config.transports)?;
            engine.set_user_agent(&config.user_agent, &config.version);
            engine.add_auth_info(&config.account.username, &config.account.password);
            if config.nat_policy.is_enabled() {
                if capabilities.supports(Capability::NatPolicy) {
                    engine.set_nat_policy(&config.nat_policy);
                } else {
                    warn!("Engine has no NAT policy support, ignoring policy");
                }
            }
            if capabilities.supports(Capability::Registration) {
                engine.add_proxy(&ProxyConfig {
                    identity: config.account.identity(),
                    server_address: config.account.server_address(),
                    register: true,
                })?;
            }
            Ok(())
        })();

        if let Err(reason) = configured {
            engine.destroy();
            return Err(creation(reason));
        }

        Ok(EngineContext {
            engine,
            registry: CallRegistry::new(),
            capabilities,
            identity: config.account.identity(),
        })
    }

    fn handle_notification(&mut self, ctx: &mut EngineContext, notification: EngineNotification) {
        match notification {
            EngineNotification::RegistrationChanged { state, message } => {
                info!(?state, %message, "Registration state changed");
                if state == RegistrationState::Cleared {
                    self.cleared_seen = true;
                }
                self.bus.publish(EngineEvent::Registration {
                    loop_id: self.loop_id,
                    state,
                    message,
                });
            }
            EngineNotification::CallStateChanged {
                handle,
                state,
                message,
            } => self.handle_call_state(ctx, handle, state, message),
            EngineNotification::MessageReceived { from, text } => {
                debug!(%from, "Message received");
                self.bus.publish(EngineEvent::Message { from, text });
            }
            EngineNotification::Log {
                level,
                domain,
                message,
            } => {
                forward_engine_log(level, &domain, &message);
                if self.log_gate.is_open() {
                    self.bus.publish(EngineEvent::Log {
                        level,
                        domain,
                        message,
                    });
                }
            }
        }
    }

    fn handle_call_state(
        &mut self,
        ctx: &mut EngineContext,
        handle: CallHandle,
        raw: RawCallState,
        message: String,
    ) {
        if raw == RawCallState::Released && ctx.registry.find(handle).is_none() {
            trace!(%handle, "Released for unknown call, ignoring");
            return;
        }

        let translation = translate(raw);
        let addresses = match translation.address {
            AddressRule::Unchanged => None,
            rule => {
                let remote = ctx.engine.call_remote_address(handle).unwrap_or_default();
                let local = ctx.identity.clone();
                Some(match rule {
                    AddressRule::RemoteToLocal => (remote, local),
                    _ => (local, remote),
                })
            }
        };
        let update = CallUpdate {
            state: translation.state,
            direction: translation.direction,
            addresses,
            record_file: ctx.engine.call_record_file(handle),
        };

        let outcome = ctx.registry.upsert(handle, update, ctx.engine.as_mut());
        trace!(call_id = %outcome.call.id(), %handle, ?raw, "Call notification");

        if translation.stops_recording && outcome.call.record_file().is_some() {
            ctx.engine.stop_recording(handle);
        }

        if outcome.state_changed() {
            debug!(
                call_id = %outcome.call.id(),
                %handle,
                from = %outcome.previous,
                to = %outcome.call.state(),
                "Call state changed"
            );
            self.bus.publish(EngineEvent::CallState {
                loop_id: self.loop_id,
                call: outcome.call,
                previous: outcome.previous,
                message,
            });
        }

        if raw == RawCallState::Released {
            ctx.registry.remove(handle, ctx.engine.as_mut());
        }
    }

    fn sync_log_level(&mut self, ctx: &mut EngineContext) {
        if !self.engine_logs || !ctx.capabilities.supports(Capability::LogForwarding) {
            return;
        }
        let wanted = if self.log_gate.is_open() {
            EngineLogLevel::Debug
        } else {
            EngineLogLevel::Off
        };
        if wanted != self.log_level {
            trace!(?wanted, "Adjusting engine log level");
            ctx.engine.set_log_level(wanted);
            self.log_level = wanted;
        }
    }

    fn shutdown_step(&mut self, ctx: &mut EngineContext) -> Step {
        let Some(shutdown) = self.control.lock().requested.clone() else {
            return Step::Continue;
        };
        let now = Instant::now();

        loop {
            match self.phase {
                None => {
                    info!("Shutting down engine loop");
                    self.queue.close();
                    if let Err(reason) = ctx.engine.terminate_all() {
                        warn!(%reason, "Terminating calls failed");
                    }
                    self.phase = Some(ShutdownPhase::Terminating {
                        deadline: now + shutdown.call_teardown_grace,
                    });
                }
                Some(ShutdownPhase::Terminating { deadline }) => {
                    let drained = shutdown.finish_on_completion && ctx.registry.is_empty();
                    if !drained && now < deadline {
                        return Step::Continue;
                    }
                    if !drained {
                        debug!(remaining = ctx.registry.len(), "Call teardown grace elapsed");
                    }
                    if !ctx.engine.proxy_is_registered() {
                        return Step::Done;
                    }
                    if let Err(reason) = ctx.engine.unregister() {
                        warn!(%reason, "Unregister failed");
                        return Step::Done;
                    }
                    self.phase = Some(ShutdownPhase::Unregistering {
                        deadline: now + shutdown.unregister_grace,
                    });
                }
                Some(ShutdownPhase::Unregistering { deadline }) => {
                    if shutdown.finish_on_completion && self.cleared_seen {
                        return Step::Done;
                    }
                    if now >= deadline {
                        debug!("Unregister grace elapsed");
                        return Step::Done;
                    }
                    return Step::Continue;
                }
            }
        }
    }

    fn finish(mut self, mut ctx: EngineContext) {
        self.queue.finish();

        // Calls the engine never released still end for subscribers
        for outcome in ctx.registry.complete_all() {
            debug!(call_id = %outcome.call.id(), from = %outcome.previous, "Completing call left by engine");
            self.bus.publish(EngineEvent::CallState {
                loop_id: self.loop_id,
                call: outcome.call,
                previous: outcome.previous,
                message: "engine stopped".to_string(),
            });
        }

        let EngineContext {
            mut engine,
            mut registry,
            ..
        } = ctx;
        match panic::catch_unwind(AssertUnwindSafe(|| registry.clear(engine.as_mut()))) {
            Ok(0) => {}
            Ok(released) => debug!(released, "Released remaining call references"),
            Err(_) => error!("Engine panicked while releasing call references"),
        }

        if panic::catch_unwind(AssertUnwindSafe(move || engine.destroy())).is_err() {
            error!("Engine panicked while being destroyed");
        }

        if !self.cleared_seen {
            self.cleared_seen = true;
            self.bus.publish(EngineEvent::Registration {
                loop_id: self.loop_id,
                state: RegistrationState::Cleared,
                message: "engine stopped".to_string(),
            });
        }
        info!("Engine loop stopped");
    }
}
