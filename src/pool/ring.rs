//! Consistent hash ring
//!
//! Every server owns `points_per_weight * weight` points on a 32-bit
//! ring. A key belongs to the first point at or after its hash, wrapping
//! around to the start.

use crate::config::ServerAddr;

/// Hash used for both keys and ring points
pub fn hash_key(key: &[u8]) -> u32 {
    crc32fast::hash(key)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RingPoint {
    hash: u32,
    server: usize,
}

/// An immutable consistent-hash ring
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    points: Vec<RingPoint>,
    servers: Vec<ServerAddr>,
}

impl HashRing {
    /// Build a ring from `(server, weight)` pairs
    pub fn new<'a, I>(servers: I, points_per_weight: u32) -> Self
    where
        I: IntoIterator<Item = (&'a ServerAddr, u32)>,
    {
        let mut ring = HashRing::default();

        for (addr, weight) in servers {
            let index = ring.servers.len();
            ring.servers.push(addr.clone());

            let count = points_per_weight.saturating_mul(weight);
            ring.points.extend((0..count).map(|i| RingPoint {
                hash: hash_key(format!("{}-{}", addr, i).as_bytes()),
                server: index,
            }));
        }

        // Ties are broken by address so the ring does not depend on input order
        let servers = &ring.servers;
        ring.points
            .sort_by(|a, b| a.hash.cmp(&b.hash).then_with(|| servers[a.server].cmp(&servers[b.server])));
        ring.points.dedup_by_key(|p| p.hash);

        ring
    }

    /// Server owning `key`, or `None` for an empty ring
    pub fn route(&self, key: &str) -> Option<&ServerAddr> {
        self.route_hash(hash_key(key.as_bytes()))
    }

    /// Server owning ring position `hash`
    pub fn route_hash(&self, hash: u32) -> Option<&ServerAddr> {
        if self.points.is_empty() {
            return None;
        }
        let idx = self.points.partition_point(|p| p.hash < hash);
        let point = &self.points[idx % self.points.len()];
        Some(&self.servers[point.server])
    }

    pub fn servers(&self) -> &[ServerAddr] {
        &self.servers
    }

    pub fn contains(&self, addr: &ServerAddr) -> bool {
        self.servers.contains(addr)
    }

    /// Number of ring points
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
