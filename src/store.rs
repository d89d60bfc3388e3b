//! Shared reading store: the single record written by acquisition and read by
//! every consumer.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::outcome::ModuleError;

/// The most recent validated measurement.
///
/// A reading that was never populated carries [`Reading::SENTINEL`] values
/// and `valid == false`.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Temperature in degrees Celsius, or the module's headline metric.
    pub primary: f64,
    /// Relative humidity and friends, in a module-defined order.
    pub secondary: Vec<f64>,
    pub valid: bool,
    /// Monotonic time of the last successful update, used for staleness.
    pub updated_at: Option<Instant>,
    /// Wall-clock time of the last successful update.
    pub recorded_at: Option<DateTime<Utc>>,
}

impl Reading {
    /// Out-of-range marker shown until the first good acquisition.
    pub const SENTINEL: f64 = 888.8;

    pub fn unset() -> Self {
        Self {
            primary: Self::SENTINEL,
            secondary: Vec::new(),
            valid: false,
            updated_at: None,
            recorded_at: None,
        }
    }

    /// Primary value followed by the secondaries.
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        std::iter::once(self.primary).chain(self.secondary.iter().copied())
    }

    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.updated_at.map(|t| now.saturating_duration_since(t))
    }

    /// Never-populated readings are always stale.
    pub fn is_stale(&self, tolerance: Duration, now: Instant) -> bool {
        match self.age(now) {
            Some(age) => !self.valid || age > tolerance,
            None => true,
        }
    }
}

impl Default for Reading {
    fn default() -> Self {
        Self::unset()
    }
}

/// Lock-protected handle to the one shared [`Reading`].
///
/// Cloning the store clones the handle, not the record. The lock is held
/// only for a field copy in either direction.
#[derive(Debug, Clone, Default)]
pub struct ReadingStore {
    inner: Arc<Mutex<Reading>>,
}

impl ReadingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies the whole record out.
    pub fn snapshot(&self) -> Result<Reading, ModuleError> {
        Ok(self.lock()?.clone())
    }

    /// Replaces the record with a freshly validated acquisition.
    pub fn publish(&self, primary: f64, secondary: &[f64]) -> Result<(), ModuleError> {
        let now = Instant::now();
        let wall = Utc::now();
        let mut guard = self.lock()?;
        guard.primary = primary;
        guard.secondary.clear();
        guard.secondary.extend_from_slice(secondary);
        guard.valid = true;
        guard.updated_at = Some(now);
        guard.recorded_at = Some(wall);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Reading>, ModuleError> {
        self.inner
            .lock()
            .map_err(|_| ModuleError::Concurrency("reading store lock is poisoned".into()))
    }
}
