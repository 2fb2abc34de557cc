//! Engine collaborator contract
//!
//! The SIP/media engine is a black box: it is created, pumped periodically,
//! queried per call, and destroyed. It is single-threaded and non-reentrant,
//! so an [`Engine`] is deliberately not `Send`: the [`EngineFactory`] is moved
//! onto the engine loop thread and the engine is created there, which makes
//! it impossible to touch the engine from any other thread.
//!
//! During [`Engine::iterate`] the engine reports everything that happened since
//! the last pump as [`EngineNotification`]s, synchronously, on the calling
//! thread. The loop processes them after the pump returns, with full access to
//! the per-call accessors.

pub mod mock;

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{Account, AudioCodec, NatPolicy, SipTransports};
use crate::error::{PhoneError, PhoneResult};

/// Opaque engine-side call identifier
///
/// Only meaningful for the lifetime of the engine that issued it. Engines are
/// free to reuse a value once the call it named has been released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallHandle(pub u64);

impl fmt::Display for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:x}", self.0)
    }
}

/// Raw per-notification call state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RawCallState {
    Idle,
    IncomingReceived,
    OutgoingInit,
    OutgoingProgress,
    OutgoingRinging,
    OutgoingEarlyMedia,
    Connected,
    StreamsRunning,
    Pausing,
    Paused,
    Resuming,
    Referred,
    Error,
    End,
    PausedByRemote,
    UpdatedByRemote,
    IncomingEarlyMedia,
    Updating,
    Released,
}

impl RawCallState {
    /// Every raw state, in engine order
    pub const ALL: [RawCallState; 19] = [
        RawCallState::Idle,
        RawCallState::IncomingReceived,
        RawCallState::OutgoingInit,
        RawCallState::OutgoingProgress,
        RawCallState::OutgoingRinging,
        RawCallState::OutgoingEarlyMedia,
        RawCallState::Connected,
        RawCallState::StreamsRunning,
        RawCallState::Pausing,
        RawCallState::Paused,
        RawCallState::Resuming,
        RawCallState::Referred,
        RawCallState::Error,
        RawCallState::End,
        RawCallState::PausedByRemote,
        RawCallState::UpdatedByRemote,
        RawCallState::IncomingEarlyMedia,
        RawCallState::Updating,
        RawCallState::Released,
    ];
}

/// Registration state of the default proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistrationState {
    /// Initial state
    None,
    /// Registration (or unregistration) in progress
    Progress,
    /// Registered
    Ok,
    /// Unregistered
    Cleared,
    /// Registration failed
    Failed,
}

/// Engine log severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EngineLogLevel {
    Debug,
    Trace,
    Message,
    Warning,
    Error,
    Fatal,
    /// Logging disabled
    Off,
}

/// Something the engine reported during a pump
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineNotification {
    RegistrationChanged {
        state: RegistrationState,
        message: String,
    },
    CallStateChanged {
        handle: CallHandle,
        state: RawCallState,
        message: String,
    },
    MessageReceived {
        from: String,
        text: String,
    },
    Log {
        level: EngineLogLevel,
        domain: String,
        message: String,
    },
}

/// Optional engine feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Capability {
    Registration,
    Calls,
    Recording,
    Dtmf,
    Messaging,
    Transfer,
    Redirect,
    PauseResume,
    NatPolicy,
    SoundDevices,
    Codecs,
    LogForwarding,
}

/// Typed capability set queried once when the engine is created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Engine version string
    pub version: String,
    pub features: BTreeSet<Capability>,
}

impl Capabilities {
    pub fn new(version: impl Into<String>, features: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            version: version.into(),
            features: features.into_iter().collect(),
        }
    }

    /// Every known feature
    pub fn full(version: impl Into<String>) -> Self {
        use Capability::*;
        Self::new(
            version,
            [
                Registration,
                Calls,
                Recording,
                Dtmf,
                Messaging,
                Transfer,
                Redirect,
                PauseResume,
                NatPolicy,
                SoundDevices,
                Codecs,
                LogForwarding,
            ],
        )
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.features.contains(&capability)
    }

    /// Fail with [`PhoneError::Unsupported`] unless `capability` is present
    pub fn require(&self, capability: Capability) -> PhoneResult<()> {
        if self.supports(capability) {
            Ok(())
        } else {
            Err(PhoneError::Unsupported { capability })
        }
    }
}

/// Parameters for placing or accepting a call
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallParams {
    pub audio: bool,
    pub video: bool,
    pub early_media_sending: bool,
    pub record_file: Option<String>,
}

impl CallParams {
    /// Audio-only call with early media sending
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
            early_media_sending: true,
            record_file: None,
        }
    }

    pub fn with_record_file(mut self, record_file: Option<String>) -> Self {
        self.record_file = record_file.filter(|f| !f.is_empty());
        self
    }
}

/// Proxy registration settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub identity: String,
    pub server_address: String,
    pub register: bool,
}

/// Sound device known to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoundDevice {
    pub name: String,
    pub can_capture: bool,
    pub can_playback: bool,
}

/// Everything the engine consumes at creation time
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub account: Account,
    pub user_agent: String,
    pub version: String,
    pub transports: SipTransports,
    pub nat_policy: NatPolicy,
}

/// The single-threaded, non-reentrant SIP/media engine
///
/// All methods are called from the engine loop thread only. Methods that can
/// be refused by the engine return `Err(reason)`.
pub trait Engine {
    /// Features this engine provides
    fn capabilities(&self) -> Capabilities;

    /// Pump the engine; pushes every pending notification into `out`
    fn iterate(&mut self, out: &mut Vec<EngineNotification>);

    fn set_log_level(&mut self, level: EngineLogLevel);

    // -- configuration --
    fn set_sip_transports(&mut self, transports: &SipTransports) -> Result<(), String>;
    fn set_user_agent(&mut self, name: &str, version: &str);
    fn add_auth_info(&mut self, username: &str, password: &str);
    fn set_nat_policy(&mut self, policy: &NatPolicy);
    fn add_proxy(&mut self, proxy: &ProxyConfig) -> Result<(), String>;
    fn proxy_is_registered(&self) -> bool;
    /// Disable registration on the default proxy (engine reports Progress then Cleared)
    fn unregister(&mut self) -> Result<(), String>;

    // -- calls --
    fn invite(&mut self, uri: &str, params: &CallParams) -> Option<CallHandle>;
    fn accept(&mut self, call: CallHandle, params: &CallParams) -> Result<(), String>;
    fn terminate(&mut self, call: CallHandle) -> Result<(), String>;
    fn terminate_all(&mut self) -> Result<(), String>;
    fn pause(&mut self, call: CallHandle) -> Result<(), String>;
    fn resume(&mut self, call: CallHandle) -> Result<(), String>;
    fn redirect(&mut self, call: CallHandle, uri: &str) -> Result<(), String>;
    fn transfer(&mut self, call: CallHandle, uri: &str) -> Result<(), String>;
    fn send_dtmfs(&mut self, call: CallHandle, digits: &str) -> Result<(), String>;
    fn start_recording(&mut self, call: CallHandle);
    fn stop_recording(&mut self, call: CallHandle);

    /// Take an engine-side reference keeping the call object alive
    fn ref_call(&mut self, call: CallHandle);
    /// Release a reference taken with [`Engine::ref_call`]
    fn unref_call(&mut self, call: CallHandle);

    // -- per-call accessors --
    fn call_remote_address(&self, call: CallHandle) -> Option<String>;
    fn call_record_file(&self, call: CallHandle) -> Option<String>;

    // -- messaging --
    fn send_message(&mut self, to: &str, text: &str) -> Result<(), String>;

    // -- sound --
    fn set_ringback(&mut self, file: &str);
    fn set_ring(&mut self, file: &str);
    fn mic_enabled(&self) -> bool;
    fn enable_mic(&mut self, enabled: bool);
    fn keep_alive_enabled(&self) -> bool;
    fn enable_keep_alive(&mut self, enabled: bool);
    fn echo_cancellation_enabled(&self) -> bool;
    fn enable_echo_cancellation(&mut self, enabled: bool);
    fn ringer_device(&self) -> Option<String>;
    fn set_ringer_device(&mut self, device: &str) -> Result<(), String>;
    fn playback_device(&self) -> Option<String>;
    fn set_playback_device(&mut self, device: &str) -> Result<(), String>;
    fn capture_device(&self) -> Option<String>;
    fn set_capture_device(&mut self, device: &str) -> Result<(), String>;
    fn reload_sound_devices(&mut self);
    fn sound_devices(&self) -> Vec<SoundDevice>;

    // -- codecs --
    fn audio_codecs(&self) -> Vec<AudioCodec>;
    fn enable_codec(&mut self, name: &str, clock_rate: u32, enabled: bool) -> Result<(), String>;

    /// Release the engine and everything it owns
    fn destroy(self: Box<Self>);
}

/// Creates engines on the engine loop thread
pub trait EngineFactory: Send + Sync + 'static {
    fn create(&self, config: &EngineConfig) -> Result<Box<dyn Engine>, String>;
}

impl<F> EngineFactory for F
where
    F: Fn(&EngineConfig) -> Result<Box<dyn Engine>, String> + Send + Sync + 'static,
{
    fn create(&self, config: &EngineConfig) -> Result<Box<dyn Engine>, String> {
        (self)(config)
    }
}
