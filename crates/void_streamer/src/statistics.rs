//! Diagnostics emitted by the streamer context

use core::fmt;

use serde::{Deserialize, Serialize};

/// Value of a single statistic
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum StatisticValue {
    Integer(i64),
    Float(f64),
    /// Percentage in the 0-100 range
    Percentage(f64),
}

impl fmt::Display for StatisticValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{}", value),
            Self::Float(value) => write!(f, "{:.3}", value),
            Self::Percentage(value) => write!(f, "{:.2}%", value),
        }
    }
}

/// Named statistic
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Statistic {
    /// Subsystem reporting the value
    pub owner: String,
    pub name: String,
    pub value: StatisticValue,
}

impl Statistic {
    pub fn new(owner: impl Into<String>, name: impl Into<String>, value: StatisticValue) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            value,
        }
    }

    pub fn integer(owner: impl Into<String>, name: impl Into<String>, value: i64) -> Self {
        Self::new(owner, name, StatisticValue::Integer(value))
    }

    pub fn float(owner: impl Into<String>, name: impl Into<String>, value: f64) -> Self {
        Self::new(owner, name, StatisticValue::Float(value))
    }

    pub fn percentage(owner: impl Into<String>, name: impl Into<String>, value: f64) -> Self {
        Self::new(owner, name, StatisticValue::Percentage(value))
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}: {}", self.owner, self.name, self.value)
    }
}

/// Rolling average over the last `capacity` samples
#[derive(Clone, Debug)]
pub struct AverageWindow {
    samples: Vec<f64>,
    /// Slot the next sample overwrites once the window is full
    next: usize,
    capacity: usize,
    sum: f64,
}

impl AverageWindow {
    /// Create a window holding up to `capacity` samples
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Vec::with_capacity(capacity),
            next: 0,
            capacity,
            sum: 0.0,
        }
    }

    /// Add a sample, evicting the oldest one if the window is full
    pub fn push(&mut self, value: f64) {
        if self.samples.len() < self.capacity {
            self.samples.push(value);
        } else {
            self.sum -= self.samples[self.next];
            self.samples[self.next] = value;
            self.next = (self.next + 1) % self.capacity;
        }
        self.sum += value;
    }

    /// Mean of the samples in the window, 0 when empty
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.sum / self.samples.len() as f64
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_window() {
        let mut window = AverageWindow::new(3);
        assert_eq!(window.average(), 0.0);

        window.push(1.0);
        window.push(2.0);
        window.push(3.0);
        assert!((window.average() - 2.0).abs() < 1e-9);

        // Evicts 1.0
        window.push(7.0);
        assert_eq!(window.len(), 3);
        assert!((window.average() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_capacity_holds_one_sample() {
        let mut window = AverageWindow::new(0);
        window.push(5.0);
        window.push(9.0);
        assert_eq!(window.capacity(), 1);
        assert!((window.average() - 9.0).abs() < 1e-9);
    }

    #[test]
    fn test_statistic_display() {
        let stat = Statistic::percentage("Streamer", "Missed deadlines", 12.5);
        assert_eq!(stat.to_string(), "Streamer/Missed deadlines: 12.50%");
        assert_eq!(Statistic::integer("Streamer", "Processed", 3).to_string(), "Streamer/Processed: 3");
    }
}
