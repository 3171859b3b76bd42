//! Content-addressed packet cache.
//!
//! Replicable packets are held here so late joiners can catch up and so a
//! packet about to expire gets one more push into the network. Entries live
//! for `min(ttl, max_ttl)`, doubled for packets of a cluster this node is a
//! member of.

use crate::id::{ClusterId, PacketId, SubclusterId};
use crate::packet::Packet;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Number of buckets in a [`CacheSummary`]
pub const SUMMARY_BUCKETS: usize = 16;

/// One cached packet
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The packet
    pub packet: Packet,
    /// Insertion time (milliseconds since the Unix epoch)
    pub inserted_at: u64,
}

/// Compact description of cache contents exchanged in heartbeats
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSummary {
    /// Number of packets summarized
    pub count: u32,
    /// BLAKE3 over the sorted packet ids
    pub digest: [u8; 32],
    /// Packet count per id bucket
    pub buckets: [u16; SUMMARY_BUCKETS],
}

/// Packet cache keyed by packet id
#[derive(Debug, Clone)]
pub struct Cache {
    entries: HashMap<PacketId, CacheEntry>,
    max_ttl: u64,
    member_clusters: HashSet<ClusterId>,
}

impl Cache {
    /// Create a cache whose entries never outlive `max_ttl` milliseconds
    /// (twice that for member clusters)
    #[must_use]
    pub fn new(max_ttl: u64) -> Self {
        Self {
            entries: HashMap::new(),
            max_ttl,
            member_clusters: HashSet::new(),
        }
    }

    /// Treat packets of `cluster` as member traffic
    pub fn add_cluster(&mut self, cluster: ClusterId) {
        self.member_clusters.insert(cluster);
    }

    /// Lifetime of `packet` in this cache
    #[must_use]
    pub fn effective_ttl(&self, packet: &Packet) -> u64 {
        let ttl = packet.ttl().min(self.max_ttl);
        if self.member_clusters.contains(&packet.cluster_id()) {
            ttl.saturating_mul(2)
        } else {
            ttl
        }
    }

    /// Insert a packet. Returns false if it was already cached or has no
    /// lifetime.
    pub fn insert(&mut self, packet: Packet, now: u64) -> bool {
        let id = packet.packet_id();
        if self.entries.contains_key(&id) || self.effective_ttl(&packet) == 0 {
            return false;
        }
        self.entries.insert(
            id,
            CacheEntry {
                packet,
                inserted_at: now,
            },
        );
        true
    }

    /// Re-insert a restored entry with its original insertion time
    pub fn restore(&mut self, packet: Packet, inserted_at: u64) -> bool {
        self.insert(packet, inserted_at)
    }

    /// Returns true if `id` is cached
    #[must_use]
    pub fn has(&self, id: &PacketId) -> bool {
        self.entries.contains_key(id)
    }

    /// Cached packet for `id`
    #[must_use]
    pub fn get(&self, id: &PacketId) -> Option<&Packet> {
        self.entries.get(id).map(|e| &e.packet)
    }

    /// Remove `id`
    pub fn delete(&mut self, id: &PacketId) -> Option<Packet> {
        self.entries.remove(id).map(|e| e.packet)
    }

    /// Number of cached packets
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries
    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    /// Evict expired entries, calling `on_eviction` with each one.
    ///
    /// Returns the number evicted.
    pub fn sweep<F>(&mut self, now: u64, mut on_eviction: F) -> usize
    where
        F: FnMut(&Packet),
    {
        let expired: Vec<PacketId> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_sub(e.inserted_at) >= self.effective_ttl(&e.packet))
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(entry) = self.entries.remove(id) {
                on_eviction(&entry.packet);
            }
        }
        expired.len()
    }

    /// Newest `limit` packets of `subcluster`, oldest first
    #[must_use]
    pub fn recent(&self, subcluster: SubclusterId, limit: usize) -> Vec<Packet> {
        let mut matching: Vec<&CacheEntry> = self
            .entries
            .values()
            .filter(|e| e.packet.subcluster_id() == subcluster)
            .collect();
        matching.sort_by_key(|e| std::cmp::Reverse((e.inserted_at, e.packet.clock())));
        matching.truncate(limit);
        matching.reverse();
        matching.into_iter().map(|e| e.packet.clone()).collect()
    }

    /// Summarize the packets matching `predicate`
    #[must_use]
    pub fn summarize<P>(&self, predicate: P) -> CacheSummary
    where
        P: Fn(&Packet) -> bool,
    {
        let mut ids: Vec<PacketId> = self
            .entries
            .values()
            .filter(|e| predicate(&e.packet))
            .map(|e| e.packet.packet_id())
            .collect();
        ids.sort_unstable();

        let mut summary = CacheSummary {
            count: u32::try_from(ids.len()).unwrap_or(u32::MAX),
            ..CacheSummary::default()
        };
        let mut hasher = blake3::Hasher::new();
        for id in &ids {
            hasher.update(id.as_bytes());
            let bucket = &mut summary.buckets[id.bucket()];
            *bucket = bucket.saturating_add(1);
        }
        summary.digest = *hasher.finalize().as_bytes();
        summary
    }
}
