//! Sharded per-agent serialization.
//!
//! `track` calls and watchdog evaluations for the same agent must not
//! interleave, while different agents proceed in parallel. A fixed
//! array of async mutexes keyed by a hash of the agent id gives that
//! without a global lock.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tokio::sync::{Mutex, MutexGuard};

const SHARD_COUNT: usize = 64;

pub struct AgentLocks {
    shards: Vec<Mutex<()>>,
}

impl AgentLocks {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Acquire the shard guard for this agent. Held across the whole
    /// per-agent pipeline.
    pub async fn lock(&self, agent_id: &str) -> MutexGuard<'_, ()> {
        self.shards[self.shard_index(agent_id)].lock().await
    }

    fn shard_index(&self, agent_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        agent_id.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }
}

impl Default for AgentLocks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_agent_maps_to_same_shard() {
        let locks = AgentLocks::new();
        assert_eq!(locks.shard_index("truck-7"), locks.shard_index("truck-7"));
    }

    #[tokio::test]
    async fn same_agent_is_mutually_exclusive() {
        let locks = AgentLocks::new();
        let guard = locks.lock("a").await;
        assert!(locks.shards[locks.shard_index("a")].try_lock().is_err());
        drop(guard);
        assert!(locks.shards[locks.shard_index("a")].try_lock().is_ok());
    }
}
