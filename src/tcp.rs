//! Identity types for captured TCP traffic: endpoints, connection keys and
//! the immutable segments routed by the assembler.

use core::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// One side of a TCP connection, rendered as `ip:port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Directed flow identity: `src` talks to `dst`.
///
/// A full connection is represented by a key and its mirror image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub src: Endpoint,
    pub dst: Endpoint,
}

impl ConnectionKey {
    pub fn new(src: Endpoint, dst: Endpoint) -> Self {
        Self { src, dst }
    }

    pub fn reversed(self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
        }
    }

    /// Canonical form shared by both directions, used as the connection
    /// table key so a packet from either side finds the same entry.
    pub fn canonical(self) -> Self {
        if self.src <= self.dst {
            self
        } else {
            self.reversed()
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.src, self.dst)
    }
}

/// A single captured TCP payload with its flags, immutable once enqueued.
#[derive(Debug, Clone)]
pub struct Segment {
    pub seq: u32,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub uuid: Uuid,
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
}

/// `true` when sequence number `a` is strictly before `b`, accounting for
/// 32-bit wrap-around (valid while the two are less than 2^31 apart).
pub fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_key_is_direction_independent() {
        let a = Endpoint::new("10.0.0.1".parse().unwrap(), 4242);
        let b = Endpoint::new("10.0.0.2".parse().unwrap(), 80);
        let forward = ConnectionKey::new(a, b);
        let backward = ConnectionKey::new(b, a);
        assert_eq!(forward.canonical(), backward.canonical());
        assert_eq!(forward.reversed(), backward);
    }

    #[test]
    fn seq_comparison_handles_wrap_around() {
        assert!(seq_before(5, 10));
        assert!(!seq_before(10, 5));
        assert!(seq_before(u32::MAX - 1, 2));
        assert!(!seq_before(2, u32::MAX - 1));
    }

    #[test]
    fn endpoint_display() {
        let e = Endpoint::new("192.168.1.1".parse().unwrap(), 8080);
        assert_eq!(e.to_string(), "192.168.1.1:8080");
    }
}
