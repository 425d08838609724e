//! Worker-node configuration.
//!
//! All knobs that shape the concurrency engine live here. Defaults are
//! conservative; profile with a representative database before tuning.
//!
//! # Measurement Required Before Tuning
//!
//! | Knob                | Workload Sensitivity                          |
//! |---------------------|-----------------------------------------------|
//! | num_threads         | CPU count, back-end comparison cost           |
//! | chunk_size          | Master round-trip latency, search length      |
//! | request_threshold   | Master round-trip latency vs. starvation risk |
//! | batch_size          | Front-end comparison cost, steal granularity  |
//! | promote_hi          | Front/back cost ratio of the pipeline         |
//! | min_steal           | Steal ping-pong vs. tail latency              |

use std::time::Duration;

/// Configuration for a [`WorkerNode`](crate::worker::node::WorkerNode).
///
/// A node owns one shard of every loaded database and runs `num_threads`
/// worker threads plus the main thread that talks to the master.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Number of worker threads. Must be at least 2 so that front-end and
    /// back-end duty can be held by different threads.
    pub num_threads: usize,

    /// Total shard count each database was divided into.
    pub num_shards: u32,

    /// The shard this node is responsible for. Object ids `id` with
    /// `id % num_shards == my_shard` belong to this node; all other ids in
    /// a granted range are skipped.
    pub my_shard: u32,

    /// How many object ids the global queue hands out per pull, and the
    /// upper bound on a single steal.
    pub chunk_size: u64,

    /// Low-water mark (in object ids) on the global queue. Any thread that
    /// observes the queue below this depth arms a work request to the
    /// master.
    pub request_threshold: u64,

    /// How many object ids a thread takes from its own range per batch.
    pub batch_size: u64,

    /// Back-end backlog factor. When the backend queue holds more than
    /// `promote_hi * num_backend_threads` entries, one more thread is moved
    /// to back-end duty.
    pub promote_hi: u64,

    /// Minimum profitable steal. A range shorter than `2 * min_steal` is
    /// not worth splitting and is left to its owner.
    pub min_steal: u64,

    /// How many threads start each search on back-end duty. Stays within
    /// `1..num_threads` for the whole search.
    pub initial_backend_threads: usize,

    /// Main-loop poll interval: how long the master-channel read blocks
    /// before the main thread re-checks the work-request flag and the
    /// search-end condition.
    pub poll_interval: Duration,
}

impl WorkerConfig {
    /// Validate the configuration, returning a diagnostic for the first
    /// violated constraint.
    pub fn validate(&self) -> Result<(), String> {
        if self.num_threads < 2 {
            return Err(format!("num_threads must be >= 2, got {}", self.num_threads));
        }
        if self.num_shards == 0 {
            return Err("num_shards must be > 0".to_string());
        }
        if self.my_shard >= self.num_shards {
            return Err(format!(
                "my_shard {} out of range for {} shards",
                self.my_shard, self.num_shards
            ));
        }
        if self.chunk_size == 0 {
            return Err("chunk_size must be > 0".to_string());
        }
        if self.batch_size == 0 {
            return Err("batch_size must be > 0".to_string());
        }
        if self.promote_hi == 0 {
            return Err("promote_hi must be > 0".to_string());
        }
        if self.min_steal == 0 {
            return Err("min_steal must be > 0".to_string());
        }
        if self.initial_backend_threads == 0 || self.initial_backend_threads >= self.num_threads {
            return Err(format!(
                "initial_backend_threads must be in 1..{}, got {}",
                self.num_threads, self.initial_backend_threads
            ));
        }
        if self.poll_interval.is_zero() {
            return Err("poll_interval must be > 0".to_string());
        }
        Ok(())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_threads: 4,
            num_shards: 1,
            my_shard: 0,
            chunk_size: 256,
            request_threshold: 512,
            batch_size: 64,
            promote_hi: 4,
            min_steal: 16,
            initial_backend_threads: 1,
            poll_interval: Duration::from_micros(500),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(WorkerConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_single_thread() {
        let cfg = WorkerConfig {
            num_threads: 1,
            ..WorkerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_shard_out_of_range() {
        let cfg = WorkerConfig {
            num_shards: 4,
            my_shard: 4,
            ..WorkerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_all_backend_start() {
        let cfg = WorkerConfig {
            num_threads: 4,
            initial_backend_threads: 4,
            ..WorkerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
