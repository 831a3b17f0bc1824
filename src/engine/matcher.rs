//! Per-stream scanning state
//!
//! Streaming mode keeps a bounded trailing window of reassembled bytes
//! per direction so patterns spanning packet boundaries still match. The
//! window is re-scanned after every append; once a stream matches it is
//! blocked and its matcher discarded, so a hit is only ever reported once.
//!
//! A matcher is pinned to the ruleset version it was created under.
//! Callers must throw it away when the live version moves on; partial
//! window contents from the old rule generation must not leak into
//! decisions made under the new one.

use super::ruleset::RegexRuleset;
use crate::packet::Direction;

/// Bytes of stream history kept per direction. Patterns longer than this
/// window cannot match across its edge.
pub const MATCH_WINDOW: usize = 16 * 1024;

#[derive(Debug)]
pub struct StreamMatcher {
    version: u64,
    client_to_server: Vec<u8>,
    server_to_client: Vec<u8>,
}

impl StreamMatcher {
    #[must_use]
    pub fn new(version: u64) -> Self {
        Self {
            version,
            client_to_server: Vec::new(),
            server_to_client: Vec::new(),
        }
    }

    /// Ruleset version this matcher's window was accumulated under.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    fn window(&mut self, direction: Direction) -> &mut Vec<u8> {
        match direction {
            Direction::ClientToServer => &mut self.client_to_server,
            Direction::ServerToClient => &mut self.server_to_client,
        }
    }

    /// Append a reassembled chunk and scan the trailing window.
    ///
    /// Returns the token of the first matching rule, if any. The caller
    /// must pass the same ruleset generation this matcher was built for.
    pub fn scan<'r>(
        &mut self,
        rules: &'r RegexRuleset,
        direction: Direction,
        chunk: &[u8],
    ) -> Option<&'r str> {
        debug_assert_eq!(self.version, rules.version());
        if !rules.has_rules_for(direction) {
            return None;
        }
        let window = self.window(direction);
        window.extend_from_slice(chunk);
        if window.len() > MATCH_WINDOW {
            let excess = window.len() - MATCH_WINDOW;
            window.drain(..excess);
        }
        rules.first_match(direction, window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ruleset(dir: char, pattern: &str) -> RegexRuleset {
        let token = format!("1{dir}{}", hex::encode(pattern));
        RegexRuleset::compile([token.as_str()]).unwrap()
    }

    #[test]
    fn test_match_across_chunk_boundary() {
        let rules = ruleset('C', "FLAG\\{[a-z]+\\}");
        let mut matcher = StreamMatcher::new(rules.version());
        let dir = Direction::ClientToServer;
        assert!(matcher.scan(&rules, dir, b"prefix FLA").is_none());
        assert!(matcher.scan(&rules, dir, b"G{spl").is_none());
        assert!(matcher.scan(&rules, dir, b"it} suffix").is_some());
    }

    #[test]
    fn test_directions_do_not_mix() {
        let rules = ruleset('S', "AB");
        let mut matcher = StreamMatcher::new(rules.version());
        assert!(matcher
            .scan(&rules, Direction::ServerToClient, b"A")
            .is_none());
        // The other half arriving on the opposite direction is not a match.
        assert!(matcher
            .scan(&rules, Direction::ClientToServer, b"B")
            .is_none());
        assert!(matcher
            .scan(&rules, Direction::ServerToClient, b"B")
            .is_some());
    }

    #[test]
    fn test_window_is_bounded() {
        let rules = ruleset('C', "needle");
        let mut matcher = StreamMatcher::new(rules.version());
        let dir = Direction::ClientToServer;
        matcher.scan(&rules, dir, b"nee");
        // Push the partial match out of the window.
        let filler = vec![b'x'; MATCH_WINDOW];
        matcher.scan(&rules, dir, &filler);
        assert!(matcher.scan(&rules, dir, b"dle").is_none());
        // A fully in-window occurrence still matches.
        assert!(matcher.scan(&rules, dir, b"a needle here").is_some());
    }
}
