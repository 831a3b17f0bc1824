//! Direction-agnostic flow identity
//!
//! Both directions of one flow must map to the same key, so the endpoint
//! pair is stored ordered (smaller endpoint first). This mirrors the
//! min/max-address normalization of the stream identifier the original
//! reassembly library used.

use std::hash::{Hash, Hasher};
use std::net::IpAddr;

/// Transport protocol carried by a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportProto {
    Tcp,
    Udp,
    /// Anything that is neither TCP nor UDP (no port space).
    Raw,
}

/// One endpoint of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub addr: IpAddr,
    pub port: u16,
}

/// Normalized flow key: equal for both directions of the same connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamIdentity {
    lo: Endpoint,
    hi: Endpoint,
    proto: TransportProto,
}

impl StreamIdentity {
    /// Build the identity from a packet's source/destination endpoints.
    ///
    /// The two endpoints are ordered internally, so
    /// `new(a, b, p) == new(b, a, p)`.
    #[must_use]
    pub fn new(src: Endpoint, dst: Endpoint, proto: TransportProto) -> Self {
        if src <= dst {
            Self {
                lo: src,
                hi: dst,
                proto,
            }
        } else {
            Self {
                lo: dst,
                hi: src,
                proto,
            }
        }
    }

    #[must_use]
    pub const fn proto(&self) -> TransportProto {
        self.proto
    }

    /// Worker shard index for this flow.
    ///
    /// Stable for the life of the process, which is all per-connection
    /// affinity needs.
    #[must_use]
    pub fn shard(&self, workers: usize) -> usize {
        debug_assert!(workers > 0);
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash(&mut hasher);
        (hasher.finish() % workers as u64) as usize
    }
}

impl std::fmt::Display for StreamIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}<->{}:{}",
            self.lo.addr, self.lo.port, self.hi.addr, self.hi.port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(addr: &str, port: u16) -> Endpoint {
        Endpoint {
            addr: addr.parse().unwrap(),
            port,
        }
    }

    #[test]
    fn test_direction_agnostic() {
        let a = ep("10.0.0.1", 43210);
        let b = ep("10.0.0.2", 80);
        let forward = StreamIdentity::new(a, b, TransportProto::Tcp);
        let reverse = StreamIdentity::new(b, a, TransportProto::Tcp);
        assert_eq!(forward, reverse);
        assert_eq!(forward.shard(8), reverse.shard(8));
    }

    #[test]
    fn test_distinct_flows_differ() {
        let a = ep("10.0.0.1", 43210);
        let b = ep("10.0.0.2", 80);
        let c = ep("10.0.0.1", 43211);
        assert_ne!(
            StreamIdentity::new(a, b, TransportProto::Tcp),
            StreamIdentity::new(c, b, TransportProto::Tcp)
        );
        // Same endpoints, different protocol
        assert_ne!(
            StreamIdentity::new(a, b, TransportProto::Tcp),
            StreamIdentity::new(a, b, TransportProto::Udp)
        );
    }

    #[test]
    fn test_v6_flows() {
        let a = ep("2001:db8::1", 5000);
        let b = ep("2001:db8::2", 443);
        assert_eq!(
            StreamIdentity::new(a, b, TransportProto::Tcp),
            StreamIdentity::new(b, a, TransportProto::Tcp)
        );
    }

    #[test]
    fn test_shard_in_range() {
        let sid = StreamIdentity::new(ep("192.168.1.1", 1), ep("192.168.1.2", 2), TransportProto::Udp);
        for workers in 1..16 {
            assert!(sid.shard(workers) < workers);
        }
    }
}
