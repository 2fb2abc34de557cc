//! Phone configuration structures
//!
//! All values here are immutable once handed to a [`Phone`](crate::Phone): they
//! are consumed when the engine is created and never mutated by the core.
//!
//! ```text
//! ┌──────────────────────────┐
//! │      PhoneConfig         │
//! │ ┌──────────────────────┐ │
//! │ │ user agent / version │ │  • identifies the client to the proxy
//! │ │ poll interval        │ │  • engine pump cadence
//! │ │ SipTransports        │ │  • UDP/TCP/DTLS/TLS listening ports
//! │ │ NatPolicy            │ │  • STUN/TURN/ICE/UPnP
//! │ │ ShutdownConfig       │ │  • teardown grace periods
//! │ └──────────────────────┘ │
//! └──────────────────────────┘
//!          + Account           • credentials and registrar
//! ```
//!
//! # Examples
//!
//! ```rust
//! use sipline_phone_core::config::{Account, NatPolicy, PhoneConfig};
//! use std::time::Duration;
//!
//! let account = Account::new("alice", "secret", "pbx.example.com");
//! assert_eq!(account.identity(), "sip:alice@pbx.example.com");
//! assert_eq!(account.server_address(), "sip:pbx.example.com:5060");
//!
//! let config = PhoneConfig::new()
//!     .with_user_agent("Desk/1.0")
//!     .with_poll_interval(Duration::from_millis(20))
//!     .with_nat_policy(NatPolicy::stun("stun.example.com"));
//! assert!(config.validate().is_ok());
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PhoneError, PhoneResult};

/// Default SIP port used when an account does not name one
pub const DEFAULT_SIP_PORT: u16 = 5060;

/// SIP account credentials and registrar location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    pub password: String,
    pub server: String,
    #[serde(default = "default_sip_port")]
    pub port: u16,
}

fn default_sip_port() -> u16 {
    DEFAULT_SIP_PORT
}

impl Account {
    /// Create an account on the default SIP port
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        server: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            server: server.into(),
            port: DEFAULT_SIP_PORT,
        }
    }

    /// Use a non-default registrar port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Local identity, `sip:<username>@<server>`
    pub fn identity(&self) -> String {
        format!("sip:{}@{}", self.username, self.server)
    }

    /// Registrar address, `sip:<server>:<port>`
    pub fn server_address(&self) -> String {
        format!("sip:{}:{}", self.server, self.port)
    }

    /// Check that the account can be used to register
    pub fn validate(&self) -> PhoneResult<()> {
        if self.username.trim().is_empty() {
            return Err(PhoneError::configuration("account.username", "must not be empty"));
        }
        if self.server.trim().is_empty() {
            return Err(PhoneError::configuration("account.server", "must not be empty"));
        }
        if self.port == 0 {
            return Err(PhoneError::configuration("account.port", "must not be zero"));
        }
        Ok(())
    }
}

/// NAT traversal policy handed opaquely to the engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatPolicy {
    pub use_stun: bool,
    pub use_turn: bool,
    pub use_ice: bool,
    pub use_upnp: bool,
    /// STUN/TURN server; resolved by the engine when set
    pub stun_server: Option<String>,
}

impl NatPolicy {
    /// STUN-only policy against `server`
    pub fn stun(server: impl Into<String>) -> Self {
        Self {
            use_stun: true,
            stun_server: Some(server.into()),
            ..Default::default()
        }
    }

    /// Whether any traversal mechanism is enabled
    pub fn is_enabled(&self) -> bool {
        self.use_stun || self.use_turn || self.use_ice || self.use_upnp
    }
}

/// Listening port choice for one SIP transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportPort {
    /// Let the engine pick a free port
    Random,
    /// Transport not used
    Disabled,
    /// Fixed port
    Port(u16),
}

impl Default for TransportPort {
    fn default() -> Self {
        TransportPort::Random
    }
}

/// SIP transports the engine listens on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SipTransports {
    pub udp: TransportPort,
    pub tcp: TransportPort,
    pub dtls: TransportPort,
    pub tls: TransportPort,
}

/// Grace periods used by the disconnect sequence
///
/// The engine does not always report when all calls are gone or when the
/// unregistration finished, so each stage is bounded by a grace period. With
/// `finish_on_completion` a stage ends as soon as its completion is observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Time allowed for calls to terminate before unregistering
    #[serde(with = "duration_ms")]
    pub call_teardown_grace: Duration,
    /// Time allowed for unregistration before the engine is destroyed
    #[serde(with = "duration_ms")]
    pub unregister_grace: Duration,
    /// End a stage early once its completion is observed
    pub finish_on_completion: bool,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            call_teardown_grace: Duration::from_secs(2),
            unregister_grace: Duration::from_secs(5),
            finish_on_completion: true,
        }
    }
}

impl ShutdownConfig {
    /// No grace at all; used when dropping a phone
    pub fn immediate() -> Self {
        Self {
            call_teardown_grace: Duration::ZERO,
            unregister_grace: Duration::ZERO,
            finish_on_completion: true,
        }
    }
}

/// Main phone configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhoneConfig {
    /// User agent announced to the proxy
    pub user_agent: String,
    /// User agent version
    pub version: String,
    /// Engine pump cadence, also the bounded wait for the next command
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Number of event dispatch workers
    pub event_workers: usize,
    /// Capacity of the broadcast event stream
    pub event_channel_capacity: usize,
    /// Forward engine logs when log listeners are registered
    pub engine_logs: bool,
    /// Timeout applied to every command a phone operation submits
    #[serde(with = "option_duration_ms")]
    pub default_submit_timeout: Option<Duration>,
    pub transports: SipTransports,
    pub nat_policy: NatPolicy,
    pub shutdown: ShutdownConfig,
}

impl Default for PhoneConfig {
    fn default() -> Self {
        Self {
            user_agent: "sipline".to_string(),
            version: crate::VERSION.to_string(),
            poll_interval: Duration::from_millis(50),
            event_workers: 4,
            event_channel_capacity: 256,
            engine_logs: true,
            default_submit_timeout: None,
            transports: SipTransports::default(),
            nat_policy: NatPolicy::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl PhoneConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from TOML text; missing keys take defaults
    pub fn from_toml_str(text: &str) -> PhoneResult<Self> {
        let config: PhoneConfig =
            toml::from_str(text).map_err(|e| PhoneError::configuration("toml", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_event_workers(mut self, workers: usize) -> Self {
        self.event_workers = workers;
        self
    }

    pub fn with_engine_logs(mut self, enabled: bool) -> Self {
        self.engine_logs = enabled;
        self
    }

    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.default_submit_timeout = Some(timeout);
        self
    }

    pub fn with_transports(mut self, transports: SipTransports) -> Self {
        self.transports = transports;
        self
    }

    pub fn with_nat_policy(mut self, nat_policy: NatPolicy) -> Self {
        self.nat_policy = nat_policy;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownConfig) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Check settings the engine loop depends on
    pub fn validate(&self) -> PhoneResult<()> {
        if self.poll_interval.is_zero() {
            return Err(PhoneError::configuration("poll_interval", "must be greater than zero"));
        }
        if self.event_workers == 0 {
            return Err(PhoneError::configuration("event_workers", "must be at least 1"));
        }
        if self.event_channel_capacity == 0 {
            return Err(PhoneError::configuration(
                "event_channel_capacity",
                "must be at least 1",
            ));
        }
        if self.user_agent.trim().is_empty() {
            return Err(PhoneError::configuration("user_agent", "must not be empty"));
        }
        if let Some(timeout) = self.default_submit_timeout {
            if timeout.is_zero() {
                return Err(PhoneError::configuration(
                    "default_submit_timeout",
                    "must be greater than zero",
                ));
            }
        }
        Ok(())
    }
}

/// Audio codec as reported by the engine
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioCodec {
    pub name: String,
    /// Clock rate in Hz
    pub clock_rate: u32,
    pub enabled: bool,
}

impl AudioCodec {
    pub fn new(name: impl Into<String>, clock_rate: u32, enabled: bool) -> Self {
        Self {
            name: name.into(),
            clock_rate,
            enabled,
        }
    }
}

impl fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} kbit/s)", self.name, self.clock_rate / 1000)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
