//! Compiled, versioned regex rulesets
//!
//! Rules arrive as whitespace-separated tokens of the form
//! `{case}{dir}{hex}`: a case flag (`1` sensitive, `0` insensitive), a
//! direction flag (`C` client-to-server, `S` server-to-client) and the
//! hex-encoded pattern. A reload compiles the whole set before anything
//! becomes visible; one bad token fails the reload and the previous set
//! stays live.
//!
//! Every successfully compiled set gets a fresh version from a global
//! counter. Versions are never reused, and version 0 is reserved so that
//! per-stream scanner state can use it as "never initialized".

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use regex::bytes::RegexSet;
use tracing::info;

use crate::error::RulesetError;
use crate::packet::Direction;

/// Global version source. Never hands out 0.
static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

fn next_version() -> u64 {
    NEXT_VERSION.fetch_add(1, Ordering::SeqCst)
}

/// One decoded rule.
#[derive(Debug, Clone)]
struct RegexRule {
    /// Original token, echoed verbatim when the rule blocks a stream.
    token: String,
    direction: Direction,
    pattern: String,
}

fn decode_token(token: &str) -> Result<RegexRule, RulesetError> {
    let bytes = token.as_bytes();
    // Two flag bytes are mandatory; the hex part may be empty, which
    // decodes to the empty pattern and matches everything.
    if bytes.len() < 2 {
        return Err(RulesetError::bad_token(token, "token too short"));
    }
    let case_sensitive = match bytes[0] {
        b'1' => true,
        b'0' => false,
        _ => return Err(RulesetError::bad_token(token, "invalid case flag")),
    };
    let direction = match bytes[1] {
        b'C' => Direction::ClientToServer,
        b'S' => Direction::ServerToClient,
        _ => return Err(RulesetError::bad_token(token, "invalid direction flag")),
    };
    let raw = hex::decode(&token[2..]).map_err(|_| RulesetError::BadHex {
        token: token.to_string(),
    })?;
    let pattern = String::from_utf8(raw).map_err(|_| RulesetError::BadPattern {
        pattern: token.to_string(),
        reason: "pattern is not valid UTF-8".into(),
    })?;
    let pattern = if case_sensitive {
        pattern
    } else {
        format!("(?i){pattern}")
    };
    Ok(RegexRule {
        token: token.to_string(),
        direction,
        pattern,
    })
}

/// Patterns for one direction, compiled as a single set.
#[derive(Debug)]
struct DirectionSet {
    set: RegexSet,
    tokens: Vec<String>,
}

impl DirectionSet {
    fn compile(rules: &[&RegexRule]) -> Result<Self, RulesetError> {
        let set = RegexSet::new(rules.iter().map(|r| r.pattern.as_str())).map_err(|e| {
            // RegexSet reports the offending pattern inside the error; the
            // token list lets the caller see which rule it belongs to.
            RulesetError::BadPattern {
                pattern: rules
                    .iter()
                    .map(|r| r.token.clone())
                    .collect::<Vec<_>>()
                    .join(" "),
                reason: e.to_string(),
            }
        })?;
        Ok(Self {
            set,
            tokens: rules.iter().map(|r| r.token.clone()).collect(),
        })
    }

    fn first_match(&self, haystack: &[u8]) -> Option<&str> {
        self.set
            .matches(haystack)
            .iter()
            .next()
            .map(|idx| self.tokens[idx].as_str())
    }
}

/// An immutable compiled ruleset snapshot.
#[derive(Debug)]
pub struct RegexRuleset {
    version: u64,
    client_to_server: DirectionSet,
    server_to_client: DirectionSet,
}

impl RegexRuleset {
    /// Compile a set of rule tokens. All-or-nothing.
    ///
    /// # Errors
    ///
    /// Returns the first decode or compile failure; no version is burned
    /// visible to matchers in that case (the counter may still advance).
    pub fn compile<'a, I>(tokens: I) -> Result<Self, RulesetError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let rules = tokens
            .into_iter()
            .map(decode_token)
            .collect::<Result<Vec<_>, _>>()?;
        let c2s: Vec<&RegexRule> = rules
            .iter()
            .filter(|r| r.direction == Direction::ClientToServer)
            .collect();
        let s2c: Vec<&RegexRule> = rules
            .iter()
            .filter(|r| r.direction == Direction::ServerToClient)
            .collect();
        Ok(Self {
            version: next_version(),
            client_to_server: DirectionSet::compile(&c2s)?,
            server_to_client: DirectionSet::compile(&s2c)?,
        })
    }

    /// The empty ruleset every process starts with.
    ///
    /// # Panics
    ///
    /// Never: zero tokens always compile.
    #[must_use]
    pub fn empty() -> Self {
        Self::compile(std::iter::empty::<&str>()).unwrap_or_else(|_| unreachable!())
    }

    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.client_to_server.tokens.len() + self.server_to_client.tokens.len()
    }

    fn dir(&self, direction: Direction) -> &DirectionSet {
        match direction {
            Direction::ClientToServer => &self.client_to_server,
            Direction::ServerToClient => &self.server_to_client,
        }
    }

    /// Token of the first rule matching `haystack` in `direction`, if any.
    #[must_use]
    pub fn first_match(&self, direction: Direction, haystack: &[u8]) -> Option<&str> {
        self.dir(direction).first_match(haystack)
    }

    /// Whether any rule exists for `direction`. Lets callers skip
    /// buffering work when nothing could ever match.
    #[must_use]
    pub fn has_rules_for(&self, direction: Direction) -> bool {
        !self.dir(direction).tokens.is_empty()
    }
}

/// Shared handle to the live ruleset. Readers take lock-free snapshots;
/// reloads swap the whole set atomically.
#[derive(Debug)]
pub struct RulesetHandle {
    current: ArcSwap<RegexRuleset>,
}

impl Default for RulesetHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl RulesetHandle {
    /// Start with the empty ruleset.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RegexRuleset::empty()),
        }
    }

    /// Current snapshot. Cheap; safe to hold across a reload (the old set
    /// simply stays alive until the last holder drops it).
    #[must_use]
    pub fn snapshot(&self) -> Arc<RegexRuleset> {
        self.current.load_full()
    }

    /// Compile a whitespace-separated token line and swap it in.
    /// On failure the live ruleset is untouched.
    ///
    /// # Errors
    ///
    /// Propagates the first token decode or pattern compile error.
    pub fn reload(&self, line: &str) -> Result<(usize, u64), RulesetError> {
        let compiled = RegexRuleset::compile(line.split_whitespace())?;
        let count = compiled.rule_count();
        let version = compiled.version();
        self.current.store(Arc::new(compiled));
        info!(version, rules = count, "ruleset updated");
        Ok((count, version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tok(case: char, dir: char, pattern: &str) -> String {
        format!("{case}{dir}{}", hex::encode(pattern))
    }

    #[test]
    fn test_token_decode_rejects_garbage() {
        assert!(matches!(
            decode_token("1"),
            Err(RulesetError::BadToken { .. })
        ));
        assert!(matches!(
            decode_token(&tok('2', 'C', "x")),
            Err(RulesetError::BadToken { .. })
        ));
        assert!(matches!(
            decode_token(&tok('1', 'X', "x")),
            Err(RulesetError::BadToken { .. })
        ));
        assert!(matches!(
            decode_token("1Czz"),
            Err(RulesetError::BadHex { .. })
        ));
    }

    #[test]
    fn test_empty_pattern_matches_everything() {
        let rules = RegexRuleset::compile(["1C"]).unwrap();
        assert_eq!(
            rules.first_match(Direction::ClientToServer, b"anything at all"),
            Some("1C")
        );
        assert_eq!(rules.first_match(Direction::ClientToServer, b""), Some("1C"));
        assert_eq!(rules.first_match(Direction::ServerToClient, b"x"), None);
    }

    #[test]
    fn test_directional_matching() {
        let flag = tok('1', 'C', "FLAG\\{");
        let rules = RegexRuleset::compile([flag.as_str()]).unwrap();
        assert_eq!(
            rules.first_match(Direction::ClientToServer, b"send FLAG{xyz}"),
            Some(flag.as_str())
        );
        // Same bytes in the other direction do not match.
        assert_eq!(
            rules.first_match(Direction::ServerToClient, b"send FLAG{xyz}"),
            None
        );
    }

    #[test]
    fn test_case_insensitive_flag() {
        let rule = tok('0', 'S', "secret");
        let rules = RegexRuleset::compile([rule.as_str()]).unwrap();
        assert!(rules
            .first_match(Direction::ServerToClient, b"the SeCrEt value")
            .is_some());

        let strict = tok('1', 'S', "secret");
        let rules = RegexRuleset::compile([strict.as_str()]).unwrap();
        assert!(rules
            .first_match(Direction::ServerToClient, b"the SeCrEt value")
            .is_none());
    }

    #[test]
    fn test_versions_monotonic_and_nonzero() {
        let a = RegexRuleset::empty();
        let b = RegexRuleset::empty();
        assert!(a.version() > 0);
        assert!(b.version() > a.version());
    }

    #[test]
    fn test_reload_all_or_nothing() {
        let handle = RulesetHandle::new();
        let good = tok('1', 'C', "evil");
        let (count, version) = handle.reload(&good).unwrap();
        assert_eq!(count, 1);

        // One broken token fails the entire line.
        let broken = format!("{good} 1C4142 1Cnothex");
        assert!(handle.reload(&broken).is_err());
        let live = handle.snapshot();
        assert_eq!(live.version(), version);
        assert_eq!(live.rule_count(), 1);
    }

    #[test]
    fn test_bad_pattern_fails_compile() {
        let unbalanced = tok('1', 'C', "evil(");
        assert!(matches!(
            RegexRuleset::compile([unbalanced.as_str()]),
            Err(RulesetError::BadPattern { .. })
        ));
    }

    #[test]
    fn test_empty_reload_clears_rules() {
        let handle = RulesetHandle::new();
        handle.reload(&tok('1', 'C', "x")).unwrap();
        handle.reload("").unwrap();
        assert_eq!(handle.snapshot().rule_count(), 0);
    }
}
