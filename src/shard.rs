//! Sharded set of MACs with a request in flight.
//!
//! Serializes request handling per client: at most one task may process a
//! given MAC at any instant, while requests for different MACs stay
//! independent. The set is split into independently-locked buckets so a
//! DHCP storm does not serialize on a single lock.

use std::collections::HashSet;

use parking_lot::Mutex;

use crate::net::Mac;

const SHARD_COUNT: usize = 32;

#[derive(Debug)]
pub struct InflightMacs {
    shards: [Mutex<HashSet<u64>>; SHARD_COUNT],
}

impl Default for InflightMacs {
    fn default() -> Self {
        Self::new()
    }
}

impl InflightMacs {
    pub fn new() -> Self {
        Self {
            shards: std::array::from_fn(|_| Mutex::new(HashSet::new())),
        }
    }

    fn shard(&self, mac: Mac) -> &Mutex<HashSet<u64>> {
        let index = (mac.0.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as usize % SHARD_COUNT;
        &self.shards[index]
    }

    /// Marks the MAC as in flight. Returns false if a request for it is
    /// already being processed.
    pub fn try_begin(&self, mac: Mac) -> bool {
        self.shard(mac).lock().insert(mac.0)
    }

    pub fn finish(&self, mac: Mac) {
        self.shard(mac).lock().remove(&mac.0);
    }
}
