//! Windowed aggregation per `(device, sensor kind)` series
//!
//! Buckets live in a [`DashMap`] and each carries its own mutex, so appends
//! and flushes for one series never contend with another. The window starts
//! with the first value and restarts at every flush.

use crate::protocol::SensorKind;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Decimal places of the published average
pub const AVERAGE_DECIMALS: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    pub device_id: i64,
    pub kind: SensorKind,
}

/// Summary of one flushed window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateResult {
    pub count: usize,
    pub average: f64,
    pub min: f64,
    pub max: f64,
}

impl AggregateResult {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let (sum, min, max) = values.iter().fold(
            (0.0, f64::INFINITY, f64::NEG_INFINITY),
            |(sum, min, max), v| (sum + v, min.min(*v), max.max(*v)),
        );
        Some(Self {
            count: values.len(),
            average: sum / values.len() as f64,
            min,
            max,
        })
    }

    pub fn rounded_average(&self) -> f64 {
        round_to(self.average, AVERAGE_DECIMALS)
    }
}

/// Round half away from zero to `decimals` places
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Values accepted since the last flush
#[derive(Debug)]
pub struct AggregationBucket {
    values: Vec<f64>,
    last_flush: Instant,
}

impl AggregationBucket {
    pub fn new(now: Instant) -> Self {
        Self {
            values: Vec::new(),
            last_flush: now,
        }
    }

    pub fn push(&mut self, value: f64) {
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Swap out the buffered values once `window` has elapsed since the last flush
    pub fn flush_if_due(&mut self, window: Duration, now: Instant) -> Option<Vec<f64>> {
        if now.saturating_duration_since(self.last_flush) < window {
            return None;
        }
        self.last_flush = now;
        Some(std::mem::take(&mut self.values))
    }
}

#[derive(Debug, Default)]
pub struct AggregationStore {
    buckets: DashMap<SeriesKey, Arc<Mutex<AggregationBucket>>>,
}

impl AggregationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `value` and return the window summary if this append closed it
    pub fn record(
        &self,
        key: SeriesKey,
        value: f64,
        window: Duration,
        now: Instant,
    ) -> Option<AggregateResult> {
        // Clone the bucket out so the map shard is not locked while we work
        let bucket = self
            .buckets
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(AggregationBucket::new(now))))
            .clone();

        let flushed = {
            let mut bucket = bucket.lock().unwrap_or_else(|e| e.into_inner());
            bucket.push(value);
            bucket.flush_if_due(window, now)
        };

        flushed.and_then(|values| AggregateResult::from_values(&values))
    }

    /// Values currently buffered for `key`
    pub fn pending(&self, key: &SeriesKey) -> usize {
        self.buckets
            .get(key)
            .map(|bucket| bucket.lock().unwrap_or_else(|e| e.into_inner()).len())
            .unwrap_or(0)
    }

    pub fn series_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    fn key() -> SeriesKey {
        SeriesKey {
            device_id: 3,
            kind: SensorKind::Humidity,
        }
    }

    #[test]
    fn test_window_flush_summarises_values() {
        // Arrange
        let store = AggregationStore::new();
        let start = Instant::now();

        // Act
        let first = store.record(key(), 10.0, WINDOW, start);
        let second = store.record(key(), 20.0, WINDOW, start + Duration::from_secs(10));
        let flushed = store.record(key(), 30.0, WINDOW, start + WINDOW);

        // Assert
        assert!(first.is_none());
        assert!(second.is_none());
        assert_eq!(
            flushed,
            Some(AggregateResult {
                count: 3,
                average: 20.0,
                min: 10.0,
                max: 30.0
            })
        );
        assert_eq!(store.pending(&key()), 0);
    }

    #[test]
    fn test_window_restarts_after_flush() {
        let store = AggregationStore::new();
        let start = Instant::now();

        store.record(key(), 1.0, WINDOW, start);
        store.record(key(), 2.0, WINDOW, start + WINDOW);
        let early = store.record(key(), 3.0, WINDOW, start + WINDOW + Duration::from_secs(30));

        assert!(early.is_none());
        assert_eq!(store.pending(&key()), 1);
    }

    #[test]
    fn test_series_are_independent() {
        let store = AggregationStore::new();
        let start = Instant::now();
        let other = SeriesKey {
            device_id: 4,
            ..key()
        };

        store.record(key(), 1.0, WINDOW, start);
        store.record(other, 2.0, WINDOW, start);

        assert_eq!(store.series_count(), 2);
        assert_eq!(store.pending(&key()), 1);
        assert_eq!(store.pending(&other), 1);
    }

    #[test]
    fn test_rounded_average() {
        let result = AggregateResult::from_values(&[20.0, 21.0, 21.0]).unwrap();

        assert_eq!(result.rounded_average(), 20.67);
        assert_eq!(round_to(2.345, 1), 2.3);
        assert!(AggregateResult::from_values(&[]).is_none());
    }

    #[test]
    fn test_concurrent_appends_flush_once() {
        let store = Arc::new(AggregationStore::new());
        let start = Instant::now();
        store.record(key(), 0.0, WINDOW, start);

        let flushes: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|n| {
                    let store = store.clone();
                    scope.spawn(move || {
                        store
                            .record(key(), n as f64, WINDOW, start + WINDOW)
                            .is_some() as usize
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(flushes, 1);
        assert_eq!(store.pending(&key()), 7);
    }
}
