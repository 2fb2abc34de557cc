//! Call Registry
//!
//! Maps engine call handles to managed [`Call`] entities. The registry lives on
//! the engine loop thread and is the only place a `Call` is ever mutated; the
//! rest of the crate only sees cloned snapshots.
//!
//! A handle is absent before its first notification and after its terminal
//! one. An engine may reuse a handle value once the call it named has been
//! released, so every entity also carries its own `call_id`; a reused handle
//! yields a fresh entity with a fresh id.

use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::engine::{CallHandle, Engine};

/// Who placed the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallDirection {
    None,
    Incoming,
    Outgoing,
}

/// Application-facing call lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    /// Known to the engine, no lifecycle transition yet
    None,
    /// Ringing or being set up
    Loading,
    /// Media flowing
    Active,
    /// Ended normally
    Completed,
    /// Ended with an error
    Error,
}

impl CallState {
    /// Whether the call still occupies the line
    pub fn is_in_progress(&self) -> bool {
        matches!(self, CallState::Loading | CallState::Active)
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, CallState::Completed | CallState::Error)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::None => "none",
            CallState::Loading => "loading",
            CallState::Active => "active",
            CallState::Completed => "completed",
            CallState::Error => "error",
        };
        f.write_str(name)
    }
}

/// A managed call
///
/// Values handed out of the registry are snapshots taken when the event that
/// carries them was produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    id: Uuid,
    handle: CallHandle,
    direction: CallDirection,
    state: CallState,
    from: String,
    to: String,
    record_file: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Call {
    fn new(handle: CallHandle) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            handle,
            direction: CallDirection::None,
            state: CallState::None,
            from: String::new(),
            to: String::new(),
            record_file: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Identity of this entity; differs between calls sharing a reused handle
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn handle(&self) -> CallHandle {
        self.handle
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn to(&self) -> &str {
        &self.to
    }

    pub fn record_file(&self) -> Option<&str> {
        self.record_file.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

/// Attributes computed for one notification
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallUpdate {
    /// `None` keeps the stored state
    pub state: Option<CallState>,
    /// `None` keeps the stored direction
    pub direction: Option<CallDirection>,
    /// `(from, to)`; `None` keeps the stored addresses
    pub addresses: Option<(String, String)>,
    pub record_file: Option<String>,
}

/// What [`CallRegistry::upsert`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Snapshot after the update
    pub call: Call,
    pub is_new: bool,
    /// State before the update; `CallState::None` for a new entity
    pub previous: CallState,
}

impl UpsertOutcome {
    /// Whether the update changed the lifecycle state
    pub fn state_changed(&self) -> bool {
        self.previous != self.call.state
    }
}

/// Insertion-ordered handle to call mapping
#[derive(Debug, Default)]
pub struct CallRegistry {
    calls: IndexMap<CallHandle, Call>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or update the entity for `handle`
    ///
    /// A new entity takes an engine-side reference on the handle, released by
    /// [`remove`](Self::remove).
    pub fn upsert(
        &mut self,
        handle: CallHandle,
        update: CallUpdate,
        engine: &mut dyn Engine,
    ) -> UpsertOutcome {
        let is_new = !self.calls.contains_key(&handle);
        let call = self.calls.entry(handle).or_insert_with(|| {
            engine.ref_call(handle);
            Call::new(handle)
        });

        let previous = call.state;
        if let Some(state) = update.state {
            call.state = state;
        }
        if let Some(direction) = update.direction {
            call.direction = direction;
        }
        if let Some((from, to)) = update.addresses {
            call.from = from;
            call.to = to;
        }
        if update.record_file.is_some() {
            call.record_file = update.record_file;
        }
        call.updated_at = Utc::now();

        if is_new {
            debug!(call_id = %call.id, %handle, state = %call.state, "Registered call");
        } else if previous != call.state {
            trace!(call_id = %call.id, %handle, from = %previous, to = %call.state, "Call state changed");
        }

        UpsertOutcome {
            call: call.clone(),
            is_new,
            previous,
        }
    }

    pub fn find(&self, handle: CallHandle) -> Option<&Call> {
        self.calls.get(&handle)
    }

    /// Find the live entity with this id
    pub fn find_by_id(&self, id: Uuid) -> Option<&Call> {
        self.calls.values().find(|call| call.id == id)
    }

    /// Delete the entity for `handle` and release its engine reference
    ///
    /// Removing an absent handle is a no-op.
    pub fn remove(&mut self, handle: CallHandle, engine: &mut dyn Engine) -> Option<Call> {
        let call = self.calls.shift_remove(&handle)?;
        engine.unref_call(handle);
        debug!(call_id = %call.id, %handle, "Removed call");
        Some(call)
    }

    /// Mark every call still in progress as Completed
    ///
    /// Returns one outcome per call whose state changed.
    pub fn complete_all(&mut self) -> Vec<UpsertOutcome> {
        let now = Utc::now();
        self.calls
            .values_mut()
            .filter(|call| call.state.is_in_progress())
            .map(|call| {
                let previous = call.state;
                call.state = CallState::Completed;
                call.updated_at = now;
                UpsertOutcome {
                    call: call.clone(),
                    is_new: false,
                    previous,
                }
            })
            .collect()
    }

    /// Remove every entity, releasing all engine references
    pub fn clear(&mut self, engine: &mut dyn Engine) -> usize {
        let count = self.calls.len();
        for (handle, _) in self.calls.drain(..) {
            engine.unref_call(handle);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Call> {
        self.calls.values()
    }

    /// Snapshots of every entity in insertion order
    pub fn snapshot(&self) -> Vec<Call> {
        self.calls.values().cloned().collect()
    }
}
