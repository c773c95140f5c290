//! Bridge configuration
//!
//! Values can be set in code through the `with_*` builders or read from the
//! environment with [`BridgeConfig::from_env`]:
//!
//! - `TASKBRIDGE_SOCKET_PATH`: socket path (default `/tmp/taskbridge.sock`)
//! - `TASKBRIDGE_NAME`: name used as `source` on outgoing messages
//! - `TASKBRIDGE_HEARTBEAT_MS`: heartbeat interval (default 30000)
//! - `TASKBRIDGE_RECONNECT_DELAY_MS`: reconnect window (default 5000)
//! - `TASKBRIDGE_MAX_RECONNECT_ATTEMPTS`: windows before `ConnectionLost` (default 10)
//! - `TASKBRIDGE_MESSAGE_TIMEOUT_MS`: query timeout (default 30000)
//! - `TASKBRIDGE_TASK_TIMEOUT_MS`: in-flight expiry, `0` disables (default 300000)
//! - `TASKBRIDGE_PEER_POLICY`: `reject` or `replace` (default `reject`)
//! - `TASKBRIDGE_MATCH_POLICY`: `any` or `all` (default `any`)

use crate::error::BridgeError;
use crate::registry::MatchPolicy;
use crate::Result;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use taskbridge_proto::MAX_FRAME_SIZE;

const DEFAULT_SOCKET_PATH: &str = "/tmp/taskbridge.sock";
const DEFAULT_NAME: &str = "bridge";

/// What to do with an inbound connection while a peer is already attached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PeerPolicy {
    /// Close the newcomer and keep the active peer
    #[default]
    Reject,
    /// Drop the active peer and its state, then attach the newcomer
    Replace,
}

impl FromStr for PeerPolicy {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "replace" => Ok(Self::Replace),
            other => Err(BridgeError::Config(format!("unknown peer policy: {}", other))),
        }
    }
}

/// Bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Path of the Unix socket to listen on
    pub socket_path: PathBuf,
    /// Name used as `source` on outgoing messages
    pub name: String,
    /// Interval between outgoing heartbeats and expiry sweeps
    pub heartbeat_interval: Duration,
    /// Length of one reconnect window
    pub reconnect_delay: Duration,
    /// Reconnect windows allowed before `ConnectionLost` fires
    pub max_reconnect_attempts: u32,
    /// Default timeout for query helpers
    pub message_timeout: Duration,
    /// Age after which an unanswered task is expired; `None` keeps tasks forever
    pub task_timeout: Option<Duration>,
    /// Second-connection policy
    pub peer_policy: PeerPolicy,
    /// Capability matching policy
    pub match_policy: MatchPolicy,
    /// Maximum encoded message size
    pub max_frame_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            name: DEFAULT_NAME.to_string(),
            heartbeat_interval: Duration::from_millis(30_000),
            reconnect_delay: Duration::from_millis(5_000),
            max_reconnect_attempts: 10,
            message_timeout: Duration::from_millis(30_000),
            task_timeout: Some(Duration::from_millis(300_000)),
            peer_policy: PeerPolicy::default(),
            match_policy: MatchPolicy::default(),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl BridgeConfig {
    /// Default configuration listening on `socket_path`
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Default::default()
        }
    }

    /// Build a configuration from `TASKBRIDGE_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup("TASKBRIDGE_SOCKET_PATH") {
            config.socket_path = PathBuf::from(path);
        }
        if let Some(name) = lookup("TASKBRIDGE_NAME") {
            config.name = name;
        }
        if let Some(ms) = lookup("TASKBRIDGE_HEARTBEAT_MS") {
            config.heartbeat_interval = parse_millis("TASKBRIDGE_HEARTBEAT_MS", &ms)?;
        }
        if let Some(ms) = lookup("TASKBRIDGE_RECONNECT_DELAY_MS") {
            config.reconnect_delay = parse_millis("TASKBRIDGE_RECONNECT_DELAY_MS", &ms)?;
        }
        if let Some(n) = lookup("TASKBRIDGE_MAX_RECONNECT_ATTEMPTS") {
            config.max_reconnect_attempts = n.trim().parse().map_err(|_| {
                BridgeError::Config(format!("TASKBRIDGE_MAX_RECONNECT_ATTEMPTS: not a number: {}", n))
            })?;
        }
        if let Some(ms) = lookup("TASKBRIDGE_MESSAGE_TIMEOUT_MS") {
            config.message_timeout = parse_millis("TASKBRIDGE_MESSAGE_TIMEOUT_MS", &ms)?;
        }
        if let Some(ms) = lookup("TASKBRIDGE_TASK_TIMEOUT_MS") {
            let timeout = parse_millis("TASKBRIDGE_TASK_TIMEOUT_MS", &ms)?;
            config.task_timeout = (!timeout.is_zero()).then_some(timeout);
        }
        if let Some(policy) = lookup("TASKBRIDGE_PEER_POLICY") {
            config.peer_policy = policy.parse()?;
        }
        if let Some(policy) = lookup("TASKBRIDGE_MATCH_POLICY") {
            config.match_policy = policy.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the bridge cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(BridgeError::Config("heartbeat interval must be non-zero".to_string()));
        }
        if self.reconnect_delay.is_zero() {
            return Err(BridgeError::Config("reconnect delay must be non-zero".to_string()));
        }
        if self.max_frame_size == 0 || self.max_frame_size > u32::MAX as usize {
            return Err(BridgeError::Config(format!(
                "max frame size must be between 1 and {} bytes, got {}",
                u32::MAX,
                self.max_frame_size
            )));
        }
        if self.name.is_empty() {
            return Err(BridgeError::Config("bridge name must not be empty".to_string()));
        }
        Ok(())
    }

    /// Set the bridge name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the reconnect window and the number of windows allowed
    pub fn with_reconnect(mut self, delay: Duration, max_attempts: u32) -> Self {
        self.reconnect_delay = delay;
        self.max_reconnect_attempts = max_attempts;
        self
    }

    /// Set the query timeout
    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    /// Set or disable in-flight task expiry
    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Set the second-connection policy
    pub fn with_peer_policy(mut self, policy: PeerPolicy) -> Self {
        self.peer_policy = policy;
        self
    }

    /// Set the capability matching policy
    pub fn with_match_policy(mut self, policy: MatchPolicy) -> Self {
        self.match_policy = policy;
        self
    }

    /// Set the maximum encoded message size
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| BridgeError::Config(format!("{}: not a number of milliseconds: {}", key, value)))
}
