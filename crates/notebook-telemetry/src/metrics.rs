//! Minimal meter for notebook-level measurements.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Histogram data
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    pub name: String,
    pub description: String,
    pub unit: String,
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl HistogramSnapshot {
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

struct HistogramData {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

/// Histogram metric
pub struct Histogram {
    name: String,
    description: String,
    unit: String,
    data: RwLock<HistogramData>,
}

impl Histogram {
    pub fn new(name: &str, description: &str, unit: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            unit: unit.to_string(),
            data: RwLock::new(HistogramData {
                count: 0,
                sum: 0.0,
                min: f64::MAX,
                max: f64::MIN,
            }),
        }
    }

    pub fn record(&self, value: f64) {
        if !value.is_finite() {
            return;
        }
        let mut data = self.data.write();
        data.count += 1;
        data.sum += value;
        data.min = data.min.min(value);
        data.max = data.max.max(value);
        debug!(metric = %self.name, value, unit = %self.unit, "histogram recorded");
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let data = self.data.read();
        let (min, max) = if data.count == 0 {
            (0.0, 0.0)
        } else {
            (data.min, data.max)
        };
        HistogramSnapshot {
            name: self.name.clone(),
            description: self.description.clone(),
            unit: self.unit.clone(),
            count: data.count,
            sum: data.sum,
            min,
            max,
        }
    }
}

/// Meter - creates and owns the histograms of one service
pub struct Meter {
    name: String,
    histograms: RwLock<HashMap<String, Arc<Histogram>>>,
}

impl Meter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            histograms: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get or create the histogram called `name`.
    pub fn create_histogram(&self, name: &str, description: &str, unit: &str) -> Arc<Histogram> {
        if let Some(existing) = self.histograms.read().get(name) {
            return existing.clone();
        }
        self.histograms
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Histogram::new(name, description, unit)))
            .clone()
    }

    pub fn snapshot(&self) -> Vec<HistogramSnapshot> {
        let mut snapshots: Vec<_> = self
            .histograms
            .read()
            .values()
            .map(|h| h.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}
