//! Bounded rolling window of `(time, value)` points for live plotting.
//!
//! The buffer performs no rendering. Readers take the ordered points plus
//! the time and value extents through [`LiveSeriesBuffer::snapshot`].

use crate::types::SeriesPoint;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub const DEFAULT_SERIES_CAPACITY: usize = 300;

/// Headroom applied to the largest value in [`ValueRange::Dynamic`] mode.
const DYNAMIC_HEADROOM: f64 = 1.1;

/// How readers should scale the value axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ValueRange {
    /// Preconfigured bounds.
    Fixed { min: f64, max: f64 },
    /// `[0, 1.1 × max(value)]`, recomputed from the current contents.
    Dynamic,
}

impl Default for ValueRange {
    fn default() -> Self {
        ValueRange::Fixed {
            min: -0.1,
            max: 0.8,
        }
    }
}

/// Owned copy of the buffer for the visualization boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesSnapshot {
    pub points: Vec<SeriesPoint>,
    /// `(oldest, newest)` time, `None` when empty.
    pub time_extent: Option<(f64, f64)>,
    pub value_extent: (f64, f64),
}

#[derive(Debug, Clone)]
pub struct LiveSeriesBuffer {
    points: VecDeque<SeriesPoint>,
    capacity: usize,
    range: ValueRange,
    started: bool,
}

impl LiveSeriesBuffer {
    /// Create a stopped buffer. A zero capacity is bumped to one.
    pub fn new(capacity: usize, range: ValueRange) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
            range,
            started: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn start(&mut self) {
        self.started = true;
    }

    /// Stop accepting points. Contents are kept.
    pub fn stop(&mut self) {
        self.started = false;
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    /// Append a point, evicting the oldest when full.
    ///
    /// Returns `false` if the point was rejected: buffer stopped, or value
    /// missing, non-finite or ≤ 0.
    pub fn append(&mut self, time: f64, value: Option<f64>) -> bool {
        if !self.started {
            return false;
        }
        let Some(value) = value.filter(|v| v.is_finite() && *v > 0.0) else {
            return false;
        };
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(SeriesPoint { time, value });
        true
    }

    pub fn points(&self) -> impl ExactSizeIterator<Item = &SeriesPoint> {
        self.points.iter()
    }

    pub fn time_extent(&self) -> Option<(f64, f64)> {
        let first = self.points.front()?;
        let last = self.points.back()?;
        Some((first.time, last.time))
    }

    /// Value axis bounds under the configured [`ValueRange`].
    pub fn value_extent(&self) -> (f64, f64) {
        match self.range {
            ValueRange::Fixed { min, max } => (min, max),
            ValueRange::Dynamic => {
                let max = self.points.iter().map(|p| p.value).fold(0.0, f64::max);
                (0.0, DYNAMIC_HEADROOM * max)
            }
        }
    }

    pub fn snapshot(&self) -> SeriesSnapshot {
        SeriesSnapshot {
            points: self.points.iter().copied().collect(),
            time_extent: self.time_extent(),
            value_extent: self.value_extent(),
        }
    }
}

impl Default for LiveSeriesBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_SERIES_CAPACITY, ValueRange::default())
    }
}
