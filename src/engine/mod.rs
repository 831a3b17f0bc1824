//! Decision engines
//!
//! A [`DecisionEngine`] turns ordered application bytes into per-chunk
//! decisions. The worker pool is engine-agnostic; the regex engine
//! ([`RegexEngine`]) is the one production implementation, scanning
//! against the live [`RegexRuleset`] snapshot in either streaming or
//! per-chunk ("block") mode.

mod matcher;
mod ruleset;

pub use matcher::{StreamMatcher, MATCH_WINDOW};
pub use ruleset::{RegexRuleset, RulesetHandle};

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::MatchMode;
use crate::error::PacketError;
use crate::packet::{Direction, StreamIdentity, TransportProto};

/// What to do with the chunk (and, for terminal decisions, the stream).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Let the packet through untouched.
    Accept,
    /// Silently discard the packet and block the stream.
    Drop {
        /// Rule token responsible, reported on the control channel.
        matched_by: String,
    },
    /// Block the stream and tear the connection down politely: the
    /// triggering segment is stripped and turned into a half-close.
    Reject { matched_by: String },
    /// Let the packet through with a replacement payload.
    Mangle { payload: Vec<u8> },
}

/// One engine instance per worker; streams never migrate between
/// workers, so no internal locking is needed.
pub trait DecisionEngine: Send {
    /// Decide on one chunk of ordered application data.
    ///
    /// # Errors
    ///
    /// An engine failure is scoped to this packet; the caller fails
    /// closed (or open, per configuration) and keeps running.
    fn decide(
        &mut self,
        sid: &StreamIdentity,
        direction: Direction,
        proto: TransportProto,
        data: &[u8],
    ) -> Result<Decision, PacketError>;

    /// Drop all per-stream state for `sid`. Idempotent.
    fn forget(&mut self, sid: &StreamIdentity);
}

/// Builds one engine per worker thread.
pub trait EngineFactory: Send + Sync + 'static {
    type Engine: DecisionEngine + 'static;

    fn build(&self) -> Self::Engine;
}

/// Regex-ruleset engine.
///
/// TCP flows in streaming mode keep a [`StreamMatcher`] so patterns can
/// span packet boundaries; everything else is scanned chunk by chunk.
/// Matchers created under an older ruleset version are discarded the
/// first time the stream is touched under a newer one.
pub struct RegexEngine {
    rules: Arc<RulesetHandle>,
    mode: MatchMode,
    matchers: HashMap<StreamIdentity, StreamMatcher>,
}

impl RegexEngine {
    #[must_use]
    pub fn new(rules: Arc<RulesetHandle>, mode: MatchMode) -> Self {
        Self {
            rules,
            mode,
            matchers: HashMap::new(),
        }
    }
}

impl DecisionEngine for RegexEngine {
    fn decide(
        &mut self,
        sid: &StreamIdentity,
        direction: Direction,
        proto: TransportProto,
        data: &[u8],
    ) -> Result<Decision, PacketError> {
        let rules = self.rules.snapshot();

        let matched = if proto == TransportProto::Tcp && self.mode == MatchMode::Stream {
            let matcher = self
                .matchers
                .entry(*sid)
                .or_insert_with(|| StreamMatcher::new(rules.version()));
            if matcher.version() != rules.version() {
                debug!(stream = %sid, old = matcher.version(), new = rules.version(),
                    "ruleset changed, scanner state discarded");
                *matcher = StreamMatcher::new(rules.version());
            }
            matcher.scan(&rules, direction, data)
        } else {
            rules.first_match(direction, data)
        };

        Ok(match matched {
            None => Decision::Accept,
            Some(token) if proto == TransportProto::Tcp => Decision::Reject {
                matched_by: token.to_string(),
            },
            Some(token) => Decision::Drop {
                matched_by: token.to_string(),
            },
        })
    }

    fn forget(&mut self, sid: &StreamIdentity) {
        self.matchers.remove(sid);
    }
}

/// Factory handing each worker its own [`RegexEngine`] over the shared
/// ruleset handle.
pub struct RegexEngineFactory {
    rules: Arc<RulesetHandle>,
    mode: MatchMode,
}

impl RegexEngineFactory {
    #[must_use]
    pub fn new(rules: Arc<RulesetHandle>, mode: MatchMode) -> Self {
        Self { rules, mode }
    }
}

impl EngineFactory for RegexEngineFactory {
    type Engine = RegexEngine;

    fn build(&self) -> RegexEngine {
        RegexEngine::new(Arc::clone(&self.rules), self.mode)
    }
}
