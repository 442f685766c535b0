//! Producer schedule
//!
//! Time is cut into slices of `slice_secs`; a cycle holds one slice per
//! producer seat. The producer at position `i` owns the first second of the
//! `i`-th slice in every cycle.

use ledger_core::OwnerId;
use serde::{Deserialize, Serialize};

/// Default number of producer seats
pub const DEFAULT_MAX_PRODUCERS: usize = 3;

/// Default slice length in seconds
pub const DEFAULT_SLICE_SECS: u64 = 3;

/// Ordered, de-duplicated producer membership with its timing parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dynasty {
    producers: Vec<OwnerId>,
    max_producers: usize,
    slice_secs: u64,
}

impl Default for Dynasty {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PRODUCERS, DEFAULT_SLICE_SECS)
    }
}

impl Dynasty {
    /// Empty schedule with `max_producers` seats
    pub fn new(max_producers: usize, slice_secs: u64) -> Self {
        Self {
            producers: Vec::new(),
            max_producers,
            slice_secs,
        }
    }

    /// Schedule with exactly as many seats as (distinct) producers given
    pub fn with_producers(producers: impl IntoIterator<Item = OwnerId>, slice_secs: u64) -> Self {
        let mut unique: Vec<OwnerId> = Vec::new();
        for producer in producers {
            if !unique.contains(&producer) {
                unique.push(producer);
            }
        }
        Self {
            max_producers: unique.len(),
            producers: unique,
            slice_secs,
        }
    }

    /// Add a producer. Duplicates and additions past the seat limit are
    /// ignored; returns whether the producer was added.
    pub fn add_producer(&mut self, producer: OwnerId) -> bool {
        if self.producers.len() >= self.max_producers || self.producers.contains(&producer) {
            tracing::debug!("Ignoring producer {}", producer);
            return false;
        }
        self.producers.push(producer);
        true
    }

    pub fn add_producers(&mut self, producers: impl IntoIterator<Item = OwnerId>) {
        for producer in producers {
            self.add_producer(producer);
        }
    }

    /// Position of `producer` in the schedule
    pub fn index_of(&self, producer: &OwnerId) -> Option<usize> {
        self.producers.iter().position(|p| p == producer)
    }

    pub fn producers(&self) -> &[OwnerId] {
        &self.producers
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    pub fn max_producers(&self) -> usize {
        self.max_producers
    }

    pub fn slice_secs(&self) -> u64 {
        self.slice_secs
    }

    pub fn cycle_secs(&self) -> u64 {
        (self.max_producers as u64).saturating_mul(self.slice_secs)
    }

    /// Whether `now` is the first second of `producer`'s slice
    pub fn is_turn(&self, producer: &OwnerId, now: u64) -> bool {
        let Some(index) = self.index_of(producer) else {
            return false;
        };
        let cycle = self.cycle_secs();
        if cycle == 0 {
            return false;
        }
        let offset = now % cycle;
        offset % self.slice_secs == 0 && offset / self.slice_secs == index as u64
    }

    /// Owner of the slice containing `now`, if that seat is filled
    pub fn producer_at(&self, now: u64) -> Option<OwnerId> {
        let cycle = self.cycle_secs();
        if cycle == 0 {
            return None;
        }
        let index = usize::try_from((now % cycle) / self.slice_secs).ok()?;
        self.producers.get(index).copied()
    }

    /// Number of distinct producers making up `numerator / denominator` of the
    /// schedule, rounded up and never less than one
    pub fn quorum(&self, numerator: usize, denominator: usize) -> usize {
        if denominator == 0 {
            return self.len().max(1);
        }
        (self.len() * numerator).div_ceil(denominator).max(1)
    }
}
