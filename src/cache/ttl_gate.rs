use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::time::Duration;
use tracing::debug;

/// Coarse, all-or-nothing staleness timer.
///
/// Holds the start of the current cache epoch. Once the epoch is older than
/// the TTL every entry of the guarded store is considered stale at once.
/// A gate that has never been reset is stale.
#[derive(Debug)]
pub struct TtlGate {
    ttl: Duration,
    epoch_start: RwLock<Option<DateTime<Utc>>>,
}

impl TtlGate {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            epoch_start: RwLock::new(None),
        }
    }

    pub fn starting_at(ttl: Duration, epoch_start: DateTime<Utc>) -> Self {
        Self {
            ttl,
            epoch_start: RwLock::new(Some(epoch_start)),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn epoch_start(&self) -> Option<DateTime<Utc>> {
        *self.epoch_start.read()
    }

    /// `now - epoch_start >= ttl`
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.age(now) {
            Some(age) => age >= self.ttl,
            None => true,
        }
    }

    /// Age of the current epoch; zero if `now` precedes it.
    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        let start = (*self.epoch_start.read())?;
        Some((now - start).to_std().unwrap_or(Duration::ZERO))
    }

    /// Moment the current epoch goes stale.
    pub fn stale_at(&self) -> Option<DateTime<Utc>> {
        let start = (*self.epoch_start.read())?;
        let ttl = chrono::Duration::from_std(self.ttl).ok()?;
        start.checked_add_signed(ttl)
    }

    /// Starts a new epoch. Only called after a full refresh has completed.
    pub fn reset(&self, now: DateTime<Utc>) {
        *self.epoch_start.write() = Some(now);
        debug!("⏱️ Nueva época de caché iniciada en {}", now);
    }
}
