//! Edge-triggered threshold alerting
//!
//! Each `(device, kind, direction, scope)` key is a two-state machine:
//! `Cleared -> Active` on breach and `Active -> Cleared` on recovery. Only the
//! transitions produce an [`AlertEdge`]; repeated readings in the same state
//! produce nothing.

use crate::protocol::SensorKind;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertDirection {
    High,
    Low,
}

impl AlertDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Low => "low",
        }
    }

    /// Whether `value` breaches `threshold` in this direction
    pub fn breached(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::High => value > threshold,
            Self::Low => value < threshold,
        }
    }
}

impl fmt::Display for AlertDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw readings and flushed averages keep separate alert state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertScope {
    Raw,
    Aggregate,
}

impl AlertScope {
    /// Suffix added to alert names and topic reasons
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Raw => "",
            Self::Aggregate => "_agg",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlertKey {
    pub device_id: i64,
    pub kind: SensorKind,
    pub direction: AlertDirection,
    pub scope: AlertScope,
}

impl fmt::Display for AlertKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}{}",
            self.device_id,
            self.kind,
            self.direction,
            self.scope.suffix()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlertState {
    #[default]
    Cleared,
    Active,
}

/// A state change worth emitting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertEdge {
    Activated,
    Cleared,
}

impl AlertState {
    /// Next state for an observation, and the edge crossed if any (pure function)
    pub fn next(self, breached: bool) -> (AlertState, Option<AlertEdge>) {
        match (self, breached) {
            (AlertState::Cleared, true) => (AlertState::Active, Some(AlertEdge::Activated)),
            (AlertState::Active, false) => (AlertState::Cleared, Some(AlertEdge::Cleared)),
            (state, _) => (state, None),
        }
    }
}

/// Active alerts across all keys
///
/// Only active keys are stored; a cleared key is removed, so memory is bounded
/// by the number of concurrently breached series.
#[derive(Debug, Default)]
pub struct AlertTracker {
    active: DashMap<AlertKey, ()>,
}

impl AlertTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one observation; the shard lock makes the transition atomic per key
    pub fn observe(&self, key: AlertKey, breached: bool) -> Option<AlertEdge> {
        match self.active.entry(key) {
            Entry::Occupied(entry) => {
                let (_, edge) = AlertState::Active.next(breached);
                if edge.is_some() {
                    entry.remove();
                }
                edge
            }
            Entry::Vacant(entry) => {
                let (_, edge) = AlertState::Cleared.next(breached);
                if edge.is_some() {
                    entry.insert(());
                }
                edge
            }
        }
    }

    pub fn state(&self, key: &AlertKey) -> AlertState {
        if self.active.contains_key(key) {
            AlertState::Active
        } else {
            AlertState::Cleared
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}
