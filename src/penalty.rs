//! Node load score.
//!
//! The score combines the last reported stats with the amount of playback
//! failures the node caused recently. Failures are kept in per-minute
//! buckets, so old ones expire on their own.

use std::num::NonZeroUsize;

use chrono::{Duration, DurationRound, Utc};
use lru::LruCache;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::model::NodeStats;

type Events = [u64; 3];
type Timestamp = i64;

/// Amount of minutes a failure counts against a node.
const WINDOW_MINUTES: usize = 5;

/// Failure kinds counted against a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureKind {
    Stuck,
    Exception,
    LoadFailed,
}

/// Weights of each score component.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoadWeights {
    /// Multiplies the node system load (0.0 to 1.0).
    pub cpu: f64,
    /// Multiplies the amount of playing players per core.
    pub players_per_core: f64,
    /// Multiplies the failures registered in the last minutes.
    pub track_failures: f64,
}

impl Default for LoadWeights {
    fn default() -> Self {
        Self {
            cpu: 10.0,
            players_per_core: 1.0,
            track_failures: 0.01,
        }
    }
}

impl LoadWeights {
    /// Score of a node with `stats` and `failures` recent failures. Lower is better.
    pub fn score(&self, stats: &NodeStats, failures: u64) -> f64 {
        let cores = stats.cpu.cores.max(1) as f64;

        self.cpu * stats.cpu.system_load
            + self.players_per_core * (stats.players_active as f64 / cores)
            + self.track_failures * failures as f64
    }
}

/// Recent failures of one node.
pub(crate) struct FailurePenalty {
    cached_events: RwLock<LruCache<Timestamp, Events>>,
    minute: Duration,
}

impl FailurePenalty {
    pub(crate) fn new() -> Self {
        let capacity = NonZeroUsize::new(WINDOW_MINUTES).unwrap_or(NonZeroUsize::MIN);

        Self {
            cached_events: RwLock::new(LruCache::new(capacity)),
            minute: Duration::minutes(1),
        }
    }

    fn current_minute(&self) -> Timestamp {
        let now = Utc::now();
        // Truncation only fails for out of range dates.
        now.duration_trunc(self.minute).unwrap_or(now).timestamp()
    }

    pub(crate) async fn register(&self, kind: FailureKind) {
        let minute = self.current_minute();
        self.register_at(kind, minute).await;
    }

    async fn register_at(&self, kind: FailureKind, minute: Timestamp) {
        let mut cached = self.cached_events.write().await;

        let events = cached.get_or_insert_mut(minute, || [0; 3]);
        events[kind as usize] += 1;
    }

    /// Sum of the failures registered in the current window.
    pub(crate) async fn recent_failures(&self) -> u64 {
        let oldest = self.current_minute() - (WINDOW_MINUTES as i64 - 1) * 60;
        let cached = self.cached_events.read().await;

        cached
            .iter()
            .filter(|(minute, _)| **minute >= oldest)
            .map(|(_, events)| events.iter().sum::<u64>())
            .sum()
    }
}
