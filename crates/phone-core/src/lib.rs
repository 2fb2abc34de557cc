//! # sipline phone core
//!
//! Control core of a SIP softphone. It drives one SIP/media engine that must
//! only ever be touched from a single thread, while the application calls into
//! it from any thread it likes.
//!
//! ## Architecture
//!
//! ```text
//!   application threads
//!          │  Phone operations (guards checked here)
//!          ▼
//!   ┌──────────────┐     ┌───────────────────────────────────────┐
//!   │ CommandQueue │ ──▶ │ engine loop thread                    │
//!   └──────────────┘     │   Engine ─▶ translator ─▶ CallRegistry │
//!                        └───────────────────┬───────────────────┘
//!                                            │ EngineEvent
//!                                            ▼
//!                               EventBus (per-call ordered workers)
//!                                            │
//!                                            ▼
//!                          Phone state machine ─▶ PhoneEvent handlers
//! ```
//!
//! - [`command`]: marshals closures onto the engine thread and waits for them
//! - [`engine_loop`]: owns the engine, pumps it and runs commands
//! - [`registry`]: handle to [`Call`] mapping
//! - [`translator`]: raw engine call states to [`CallState`]
//! - [`events`]: asynchronous event delivery
//! - [`phone`]: the public operation surface and its state machine
//! - [`engine`]: the engine abstraction plus a scriptable [`engine::mock`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sipline_phone_core::engine::mock::MockEngineHandle;
//! use sipline_phone_core::{Account, ConnectState, EventFilter, Phone, PhoneConfig, PhoneEvent};
//!
//! # fn main() -> sipline_phone_core::PhoneResult<()> {
//! let engine = MockEngineHandle::new();
//! let phone = Phone::new(
//!     Account::new("alice", "secret", "pbx.example.com"),
//!     PhoneConfig::default(),
//!     engine.factory(),
//! )?;
//!
//! phone.subscribe(
//!     Arc::new(|event: &PhoneEvent| {
//!         if let PhoneEvent::IncomingCall(call) = event {
//!             println!("incoming call from {}", call.from());
//!         }
//!     }),
//!     EventFilter::all(),
//! );
//!
//! phone.connect()?;
//! phone.wait_for_connect_state(ConnectState::Connected, Duration::from_secs(5));
//! phone.make_call("sip:bob@pbx.example.com")?;
//! # Ok(())
//! # }
//! ```

#![warn(rust_2018_idioms)]

pub mod command;
pub mod config;
pub mod engine;
pub mod engine_loop;
pub mod error;
pub mod events;
pub mod logging;
pub mod phone;
pub mod registry;
pub mod translator;

// Re-export main types
pub use command::SubmitOptions;
pub use config::{
    Account, AudioCodec, NatPolicy, PhoneConfig, ShutdownConfig, SipTransports, TransportPort,
};
pub use engine::{Capabilities, Capability, Engine, EngineFactory};
pub use error::{ErrorKind, PhoneError, PhoneResult};
pub use events::{EventFamily, EventFilter, EventHandler, PhoneEvent};
pub use logging::{setup_logging, LoggingConfig};
pub use phone::{ConnectState, LineState, Phone};
pub use registry::{Call, CallDirection, CallState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
