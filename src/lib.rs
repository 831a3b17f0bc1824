//! nfregex: regex firewall for NFQUEUE'd TCP/UDP traffic
//!
//! nfregex sits behind iptables NFQUEUE rules and filters application
//! payloads against a hot-reloadable set of regex rules, built for
//! attack/defense CTF services: the moment a rule matches, the stream is
//! blocked and (for TCP) torn down politely so the service never sees
//! the offending bytes.
//!
//! # Architecture
//!
//! ```text
//! kernel NFQUEUE → dispatch (parse + shard by flow) → worker 0..N
//!                                                        ↓
//!                                       reassembly → regex engine → verdict
//! ```
//!
//! One dispatch loop owns the queue socket; workers own all per-stream
//! state and return verdicts through a channel, so the packet path is
//! lock-free. Length-changing rewrites are compensated with per-stream
//! seq/ack offsets so neither peer notices.
//!
//! # Control protocol
//!
//! The process is driven over stdio by a supervisor: `QUEUE <n>` on
//! startup, one replacement ruleset per stdin line answered with
//! `ACK OK`/`ACK FAIL <reason>`, and `BLOCKED <token>` whenever a rule
//! fires. See [`control`].
//!
//! # Modules
//!
//! - [`config`]: environment-driven runtime configuration
//! - [`control`]: stdio control protocol
//! - [`engine`]: decision engines and the versioned regex ruleset
//! - [`error`]: error types
//! - [`offsets`]: TCP seq/ack compensation after rewrites
//! - [`packet`]: packet parsing and mutation
//! - [`queue`]: NFQUEUE and in-memory transports
//! - [`reassembly`]: minimal TCP stream reassembly
//! - [`stream`]: per-worker stream state
//! - [`verdict`]: exactly-once verdict issuing
//! - [`worker`]: sharded worker pool and dispatch loop

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod offsets;
pub mod packet;
pub mod queue;
pub mod reassembly;
pub mod stream;
pub mod verdict;
pub mod worker;

// Re-export commonly used types at the crate root
pub use config::{Config, MatchMode};
pub use engine::{Decision, DecisionEngine, EngineFactory, RegexEngine, RegexEngineFactory, RulesetHandle};
pub use error::{ConfigError, NfRegexError, PacketError, QueueError, Result, RulesetError};
pub use packet::{Direction, PacketView, StreamIdentity, TransportProto};
pub use queue::{MemoryTransport, NfqTransport, Transport, VerdictSink, WireAction};
pub use worker::FilterPool;

/// Crate version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
