//! Error types for nfregex
//!
//! Errors are split into two hard categories: fatal errors (the queue
//! transport is broken, no packet can be handled safely) and per-packet
//! errors (the offending packet is dropped, processing continues).
//! Ruleset errors are scoped to a single reload attempt.

use thiserror::Error;

/// Top-level error type for nfregex
#[derive(Debug, Error)]
pub enum NfRegexError {
    /// Queue transport errors (bind/receive/verdict failures)
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Per-packet errors (parse, re-serialization, verdict misuse)
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// Ruleset compilation errors
    #[error("Ruleset error: {0}")]
    Ruleset(#[from] RulesetError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl NfRegexError {
    /// Check whether this error must terminate the process.
    ///
    /// Transport errors mean the kernel interception point is broken and
    /// nothing can be verdicted safely; everything else is scoped to one
    /// packet or one reload attempt.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Queue(e) => e.is_fatal(),
            Self::Packet(_) | Self::Ruleset(_) => false,
            Self::Config(_) => true,
        }
    }
}

/// Queue transport errors
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to open the netlink socket
    #[error("Failed to open nfqueue socket: {0}")]
    Open(String),

    /// Failed to bind a queue number
    #[error("Failed to bind queue {queue_num}: {reason}")]
    Bind { queue_num: u16, reason: String },

    /// No free queue number in the scanned range
    #[error("No free queue number in {start}..{end}")]
    NoFreeQueue { start: u16, end: u16 },

    /// Receive failure on the queue socket
    #[error("Queue receive failed: {0}")]
    Recv(String),

    /// Verdict send failure
    #[error("Verdict send failed: {0}")]
    Verdict(String),

    /// The transport was closed (shutdown path)
    #[error("Queue transport closed")]
    Closed,
}

impl QueueError {
    /// All transport errors except an orderly close are fatal.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Closed)
    }
}

/// Per-packet errors
///
/// None of these are fatal: the packet they refer to is dropped so the
/// kernel queue never stalls on an un-verdicted packet.
#[derive(Debug, Error)]
pub enum PacketError {
    /// Malformed or truncated headers
    #[error("Failed to parse packet: {0}")]
    Parse(String),

    /// Packet re-serialization failed (malformed replacement payload)
    #[error("Failed to re-serialize packet: {0}")]
    Serialize(String),

    /// A second verdict was requested for the same packet
    #[error("Verdict already issued for this packet")]
    VerdictAlreadyIssued,

    /// Decision engine internal failure while scanning this packet
    #[error("Decision engine failure: {0}")]
    Engine(String),
}

/// Ruleset compilation errors
///
/// Any of these fails the whole reload; the previous ruleset version
/// stays live.
#[derive(Debug, Error)]
pub enum RulesetError {
    /// Token too short or malformed framing
    #[error("Invalid rule token {token:?}: {reason}")]
    BadToken { token: String, reason: String },

    /// Hex-encoded pattern did not decode
    #[error("Invalid hex in rule token {token:?}")]
    BadHex { token: String },

    /// Pattern failed to compile
    #[error("Failed to compile pattern {pattern:?}: {reason}")]
    BadPattern { pattern: String, reason: String },
}

impl RulesetError {
    /// Create a bad-token error
    pub fn bad_token(token: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BadToken {
            token: token.into(),
            reason: reason.into(),
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Environment variable holds an unusable value
    #[error("Environment variable {name}: {reason}")]
    EnvError { name: String, reason: String },
}

impl ConfigError {
    /// Create an environment variable error
    pub fn env(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::EnvError {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Type alias for Result with `NfRegexError`
pub type Result<T> = std::result::Result<T, NfRegexError>;
