//! Event Bus
//!
//! Notifications produced on the engine loop are delivered to subscribers on a
//! small pool of dispatch threads, never on the loop itself, so a subscriber
//! may call back into the phone without deadlocking against the loop.
//!
//! # Ordering
//!
//! Every event carries an optional ordering key (the call id for call events).
//! Events are sharded onto workers by that key and each worker is a FIFO, so
//! all events for one call are delivered in the order they were produced.
//! Events without a key share worker 0. Nothing is guaranteed across
//! different keys.
//!
//! # Event Types
//!
//! - [`EngineEvent`]: raw notifications published by the engine loop
//! - [`PhoneEvent`]: application-facing events published by the
//!   [`Phone`](crate::Phone) state machine
//!
//! # Subscribing
//!
//! ```rust
//! use std::sync::Arc;
//! use sipline_phone_core::events::{EventFamily, EventFilter, PhoneEvent, Subscribers};
//!
//! let subscribers: Subscribers<PhoneEvent> = Subscribers::new(16);
//! let id = subscribers.subscribe(
//!     Arc::new(|event: &PhoneEvent| println!("{:?}", event)),
//!     EventFilter::only([EventFamily::Call]),
//! );
//! assert_eq!(subscribers.len(), 1);
//! assert!(subscribers.unsubscribe(id));
//! ```

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, trace, warn};
use uuid::Uuid;

use crate::command::panic_message;
use crate::engine::{EngineLogLevel, RegistrationState};
use crate::error::{ErrorKind, PhoneError, PhoneResult};
use crate::registry::{Call, CallState};

/// Coarse grouping used by filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventFamily {
    Registration,
    Call,
    Message,
    Log,
    Error,
}

/// Anything the bus can carry
pub trait BusEvent: Clone + Send + 'static {
    /// Events sharing a key are delivered in publish order
    fn ordering_key(&self) -> Option<Uuid>;

    fn family(&self) -> EventFamily;
}

/// Notification published by the engine loop
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Registration state of the proxy changed
    Registration {
        loop_id: Uuid,
        state: RegistrationState,
        message: String,
    },
    /// A call's lifecycle state changed; `call` is the snapshot after the change
    CallState {
        loop_id: Uuid,
        call: Call,
        previous: CallState,
        message: String,
    },
    /// Text message received
    Message { from: String, text: String },
    /// Engine log line, only published while log listeners exist
    Log {
        level: EngineLogLevel,
        domain: String,
        message: String,
    },
    /// The engine loop stopped on an unexpected failure
    LoopFailed { loop_id: Uuid, reason: String },
}

impl EngineEvent {
    /// Engine loop that produced the event, for loop-scoped events
    pub fn loop_id(&self) -> Option<Uuid> {
        match self {
            EngineEvent::Registration { loop_id, .. }
            | EngineEvent::CallState { loop_id, .. }
            | EngineEvent::LoopFailed { loop_id, .. } => Some(*loop_id),
            EngineEvent::Message { .. } | EngineEvent::Log { .. } => None,
        }
    }
}

impl BusEvent for EngineEvent {
    fn ordering_key(&self) -> Option<Uuid> {
        match self {
            EngineEvent::CallState { call, .. } => Some(call.id()),
            _ => None,
        }
    }

    fn family(&self) -> EventFamily {
        match self {
            EngineEvent::Registration { .. } => EventFamily::Registration,
            EngineEvent::CallState { .. } => EventFamily::Call,
            EngineEvent::Message { .. } => EventFamily::Message,
            EngineEvent::Log { .. } => EventFamily::Log,
            EngineEvent::LoopFailed { .. } => EventFamily::Error,
        }
    }
}

/// Application-facing event
#[derive(Debug, Clone, PartialEq)]
pub enum PhoneEvent {
    /// Registration succeeded
    PhoneConnected,
    /// The engine has been torn down
    PhoneDisconnected,
    IncomingCall(Call),
    OutgoingCall(Call),
    CallActive(Call),
    CallCompleted(Call),
    MessageReceived { from: String, text: String },
    /// Asynchronous failure, with the call it concerns if any
    Error { call: Option<Call>, kind: ErrorKind },
    Log { level: EngineLogLevel, message: String },
}

impl BusEvent for PhoneEvent {
    fn ordering_key(&self) -> Option<Uuid> {
        match self {
            PhoneEvent::IncomingCall(call)
            | PhoneEvent::OutgoingCall(call)
            | PhoneEvent::CallActive(call)
            | PhoneEvent::CallCompleted(call) => Some(call.id()),
            PhoneEvent::Error {
                call: Some(call), ..
            } => Some(call.id()),
            _ => None,
        }
    }

    fn family(&self) -> EventFamily {
        match self {
            PhoneEvent::PhoneConnected | PhoneEvent::PhoneDisconnected => EventFamily::Registration,
            PhoneEvent::IncomingCall(_)
            | PhoneEvent::OutgoingCall(_)
            | PhoneEvent::CallActive(_)
            | PhoneEvent::CallCompleted(_) => EventFamily::Call,
            PhoneEvent::MessageReceived { .. } => EventFamily::Message,
            PhoneEvent::Error { .. } => EventFamily::Error,
            PhoneEvent::Log { .. } => EventFamily::Log,
        }
    }
}

/// Receives events on a dispatch thread
pub trait EventHandler<E>: Send + Sync {
    fn on_event(&self, event: &E);
}

impl<E, F> EventHandler<E> for F
where
    F: Fn(&E) + Send + Sync,
{
    fn on_event(&self, event: &E) {
        (self)(event)
    }
}

/// Which families a subscription receives
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// `None` receives everything
    pub families: Option<HashSet<EventFamily>>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn only(families: impl IntoIterator<Item = EventFamily>) -> Self {
        Self {
            families: Some(families.into_iter().collect()),
        }
    }

    pub fn accepts(&self, family: EventFamily) -> bool {
        self.families
            .as_ref()
            .map_or(true, |families| families.contains(&family))
    }
}

struct Subscription<E> {
    id: Uuid,
    handler: Arc<dyn EventHandler<E>>,
    filter: EventFilter,
}

impl<E> Clone for Subscription<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            handler: self.handler.clone(),
            filter: self.filter.clone(),
        }
    }
}

/// Handler registry plus a broadcast stream
///
/// [`dispatch`](Self::dispatch) runs on the calling thread: every matching
/// handler first, then the stream. A panicking handler is logged and skipped.
pub struct Subscribers<E> {
    list: RwLock<Vec<Subscription<E>>>,
    stream: broadcast::Sender<E>,
}

impl<E: BusEvent> Subscribers<E> {
    /// `capacity` bounds how far a stream receiver may lag before losing events
    pub fn new(capacity: usize) -> Self {
        let (stream, _) = broadcast::channel(capacity.max(1));
        Self {
            list: RwLock::new(Vec::new()),
            stream,
        }
    }

    pub fn subscribe(&self, handler: Arc<dyn EventHandler<E>>, filter: EventFilter) -> Uuid {
        let id = Uuid::new_v4();
        self.list.write().push(Subscription {
            id,
            handler,
            filter,
        });
        id
    }

    pub fn unsubscribe(&self, id: Uuid) -> bool {
        let mut list = self.list.write();
        match list.iter().position(|s| s.id == id) {
            Some(pos) => {
                list.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.list.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.read().is_empty()
    }

    /// Receiver for every event dispatched from now on
    pub fn stream(&self) -> broadcast::Receiver<E> {
        self.stream.subscribe()
    }

    pub fn dispatch(&self, event: &E) {
        let family = event.family();
        let subscriptions: Vec<Subscription<E>> = self
            .list
            .read()
            .iter()
            .filter(|s| s.filter.accepts(family))
            .cloned()
            .collect();

        for subscription in subscriptions {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| {
                subscription.handler.on_event(event);
            }));
            if let Err(payload) = delivered {
                warn!(
                    subscription = %subscription.id,
                    message = %panic_message(payload.as_ref()),
                    "Event handler panicked"
                );
            }
        }

        // No receivers is not an error
        let _ = self.stream.send(event.clone());
    }
}

/// Sharded dispatch pool
pub struct EventBus<E: BusEvent> {
    name: String,
    senders: RwLock<Vec<Sender<E>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    subscribers: Arc<Subscribers<E>>,
}

impl<E: BusEvent> EventBus<E> {
    /// Start `workers` dispatch threads named after `name`
    pub fn new(name: &str, workers: usize, capacity: usize) -> PhoneResult<Self> {
        if workers == 0 {
            return Err(PhoneError::configuration("event_workers", "must be at least 1"));
        }

        let subscribers = Arc::new(Subscribers::new(capacity));
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for index in 0..workers {
            let (tx, rx) = unbounded::<E>();
            let subscribers = subscribers.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-events-{}", name, index))
                .spawn(move || {
                    for event in rx.iter() {
                        subscribers.dispatch(&event);
                    }
                    trace!(worker = index, "Event worker exiting");
                })
                .map_err(|e| PhoneError::internal(format!("failed to spawn event worker: {}", e)))?;
            senders.push(tx);
            handles.push(handle);
        }

        Ok(Self {
            name: name.to_string(),
            senders: RwLock::new(senders),
            workers: Mutex::new(handles),
            subscribers,
        })
    }

    /// Queue `event` for delivery; never blocks
    pub fn publish(&self, event: E) {
        let senders = self.senders.read();
        if senders.is_empty() {
            trace!(bus = %self.name, "Dropping event published after shutdown");
            return;
        }
        let shard = match event.ordering_key() {
            Some(key) => (key.as_u128() % senders.len() as u128) as usize,
            None => 0,
        };
        if senders[shard].send(event).is_err() {
            error!(bus = %self.name, shard, "Event worker is gone");
        }
    }

    pub fn subscribe(&self, handler: Arc<dyn EventHandler<E>>, filter: EventFilter) -> Uuid {
        self.subscribers.subscribe(handler, filter)
    }

    pub fn unsubscribe(&self, id: Uuid) -> bool {
        self.subscribers.unsubscribe(id)
    }

    pub fn stream(&self) -> broadcast::Receiver<E> {
        self.subscribers.stream()
    }

    /// Deliver what is queued, then stop the workers
    ///
    /// Called from a worker thread, the calling worker is left to exit on its own.
    pub fn shutdown(&self) {
        self.senders.write().clear();
        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!(bus = %self.name, "Event worker panicked");
            }
        }
    }
}

impl<E: BusEvent> Drop for EventBus<E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Per-instance log listener count
///
/// The engine loop forwards engine log lines as events only while the gate is
/// open.
#[derive(Debug, Default)]
pub struct LogGate {
    listeners: AtomicUsize,
}

impl LogGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.listeners.load(Ordering::Acquire) > 0
    }

    pub fn listeners(&self) -> usize {
        self.listeners.load(Ordering::Acquire)
    }

    pub(crate) fn add(&self) {
        self.listeners.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn remove(&self) {
        let _ = self
            .listeners
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registration(state: RegistrationState) -> EngineEvent {
        EngineEvent::Registration {
            loop_id: Uuid::nil(),
            state,
            message: String::new(),
        }
    }

    #[test]
    fn test_filter_accepts() {
        assert!(EventFilter::all().accepts(EventFamily::Log));
        let calls_only = EventFilter::only([EventFamily::Call]);
        assert!(calls_only.accepts(EventFamily::Call));
        assert!(!calls_only.accepts(EventFamily::Log));
    }

    #[test]
    fn test_dispatch_respects_filter_and_survives_panics() {
        let subscribers: Subscribers<EngineEvent> = Subscribers::new(8);
        let seen = Arc::new(Mutex::new(Vec::new()));

        subscribers.subscribe(
            Arc::new(|_: &EngineEvent| panic!("handler bug")),
            EventFilter::all(),
        );
        let sink = seen.clone();
        subscribers.subscribe(
            Arc::new(move |event: &EngineEvent| sink.lock().push(event.clone())),
            EventFilter::only([EventFamily::Registration]),
        );

        subscribers.dispatch(&registration(RegistrationState::Ok));
        subscribers.dispatch(&EngineEvent::Message {
            from: "sip:bob@pbx".into(),
            text: "hi".into(),
        });

        assert_eq!(*seen.lock(), vec![registration(RegistrationState::Ok)]);
    }

    #[test]
    fn test_bus_delivers_off_publisher_thread_in_order() {
        let bus: EventBus<EngineEvent> = EventBus::new("test", 3, 16).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        bus.subscribe(
            Arc::new(move |event: &EngineEvent| {
                let _ = tx.send((thread::current().id(), event.clone()));
            }),
            EventFilter::all(),
        );

        let states = [
            RegistrationState::Progress,
            RegistrationState::Ok,
            RegistrationState::Cleared,
        ];
        for state in states {
            bus.publish(registration(state));
        }

        let mut delivered = Vec::new();
        for _ in 0..states.len() {
            let (thread_id, event) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_ne!(thread_id, thread::current().id());
            delivered.push(event);
        }
        let expected: Vec<_> = states.iter().map(|s| registration(*s)).collect();
        assert_eq!(delivered, expected);
    }

    #[test]
    fn test_publish_after_shutdown_is_dropped() {
        let bus: EventBus<EngineEvent> = EventBus::new("test", 1, 4).unwrap();
        let mut stream = bus.stream();
        bus.shutdown();
        bus.publish(registration(RegistrationState::Ok));
        assert!(stream.try_recv().is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(EventBus::<EngineEvent>::new("test", 0, 4).is_err());
    }

    #[test]
    fn test_log_gate_counts() {
        let gate = LogGate::new();
        assert!(!gate.is_open());
        gate.add();
        gate.add();
        gate.remove();
        assert!(gate.is_open());
        gate.remove();
        gate.remove();
        assert_eq!(gate.listeners(), 0);
    }
}
