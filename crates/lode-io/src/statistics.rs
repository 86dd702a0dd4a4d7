//! Named numeric samples and a sliding-window average.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::VecDeque;

/// Value carried by a [`Statistic`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum StatisticValue {
    Integer(i64),
    Float(f64),
    /// 0.0 - 100.0
    Percentage(f64),
}

impl StatisticValue {
    /// Value as a float, whatever its kind.
    pub fn as_f64(&self) -> f64 {
        match *self {
            StatisticValue::Integer(value) => value as f64,
            StatisticValue::Float(value) | StatisticValue::Percentage(value) => value,
        }
    }
}

/// One named sample, pulled from a stage or the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statistic {
    /// Component that produced the sample, e.g. `"BlockCache"`.
    pub owner: Cow<'static, str>,
    pub name: Cow<'static, str>,
    pub value: StatisticValue,
}

impl Statistic {
    /// Counter sample.
    pub fn integer(
        owner: impl Into<Cow<'static, str>>,
        name: impl Into<Cow<'static, str>>,
        value: i64,
    ) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            value: StatisticValue::Integer(value),
        }
    }

    /// Measured sample, e.g. a duration in milliseconds.
    pub fn float(
        owner: impl Into<Cow<'static, str>>,
        name: impl Into<Cow<'static, str>>,
        value: f64,
    ) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            value: StatisticValue::Float(value),
        }
    }

    /// Ratio sample in percent.
    pub fn percentage(
        owner: impl Into<Cow<'static, str>>,
        name: impl Into<Cow<'static, str>>,
        value: f64,
    ) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            value: StatisticValue::Percentage(value),
        }
    }
}

/// Average over the most recent `capacity` samples.
#[derive(Debug, Clone)]
pub struct AverageWindow {
    samples: VecDeque<f64>,
    capacity: usize,
    total: f64,
}

impl AverageWindow {
    /// Window averaging the last `capacity` samples.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of samples kept. Zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            total: 0.0,
        }
    }

    /// Add a sample, dropping the oldest when full.
    pub fn push(&mut self, sample: f64) {
        if self.samples.len() == self.capacity {
            if let Some(oldest) = self.samples.pop_front() {
                self.total -= oldest;
            }
        }
        self.samples.push_back(sample);
        self.total += sample;
    }

    /// Average of the window, or `None` before the first sample.
    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.total / self.samples.len() as f64)
        }
    }

    /// Samples currently held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no sample has been pushed since the last clear.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Drop every sample.
    pub fn clear(&mut self) {
        self.samples.clear();
        self.total = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_evicts_oldest() {
        let mut window = AverageWindow::new(3);
        assert_eq!(window.average(), None);

        window.push(3.0);
        window.push(6.0);
        window.push(9.0);
        assert!((window.average().unwrap() - 6.0).abs() < 1e-9);

        window.push(12.0);
        assert_eq!(window.len(), 3);
        assert!((window.average().unwrap() - 9.0).abs() < 1e-9);
    }

    #[test]
    fn test_statistic_constructors() {
        let stat = Statistic::percentage("BlockCache", "HitRate", 75.0);
        assert_eq!(stat.owner, "BlockCache");
        assert_eq!(stat.value.as_f64(), 75.0);
        assert_eq!(Statistic::integer("a", "b", 3).value, StatisticValue::Integer(3));
    }
}
