//! Session summary statistics

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Sample;

/// Statistics of one numeric field (population standard deviation)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldStats {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub stddev: f64,
}

/// Most frequent value of one categorical field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryStats {
    /// Ties go to the lexicographically smallest value
    pub mode: String,
    pub mode_count: usize,
    pub distinct: usize,
}

/// Summary computed when a session stops
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub sample_count: usize,
    pub numeric: BTreeMap<String, FieldStats>,
    pub categorical: BTreeMap<String, CategoryStats>,
    /// Computed while the session was still recording
    #[serde(default)]
    pub provisional: bool,
}

impl SessionSummary {
    pub fn duration_ms(&self) -> i64 {
        (self.end_time - self.start_time).num_milliseconds()
    }
}

#[derive(Default)]
struct Running {
    count: usize,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl Running {
    // Welford
    fn push(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    fn finish(&self) -> FieldStats {
        FieldStats {
            count: self.count,
            mean: self.mean,
            min: self.min,
            max: self.max,
            stddev: (self.m2 / self.count as f64).max(0.0).sqrt(),
        }
    }
}

pub(crate) fn summarize(
    session_id: &str,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    samples: &[Sample],
    provisional: bool,
) -> SessionSummary {
    let mut numeric: BTreeMap<&str, Running> = BTreeMap::new();
    let mut categories: BTreeMap<&str, BTreeMap<&str, usize>> = BTreeMap::new();

    for sample in samples {
        for (field, value) in &sample.values {
            numeric.entry(field).or_default().push(*value);
        }
        for (field, label) in &sample.labels {
            *categories
                .entry(field)
                .or_default()
                .entry(label)
                .or_insert(0) += 1;
        }
    }

    let categorical = categories
        .into_iter()
        .filter_map(|(field, counts)| {
            let distinct = counts.len();
            // BTreeMap iterates in order, so the first maximum is the smallest label
            let (mode, mode_count) = counts
                .into_iter()
                .fold(None, |best: Option<(&str, usize)>, (label, count)| match best {
                    Some((_, best_count)) if best_count >= count => best,
                    _ => Some((label, count)),
                })?;
            Some((
                field.to_string(),
                CategoryStats {
                    mode: mode.to_string(),
                    mode_count,
                    distinct,
                },
            ))
        })
        .collect();

    SessionSummary {
        session_id: session_id.to_string(),
        start_time,
        end_time,
        sample_count: samples.len(),
        numeric: numeric
            .into_iter()
            .map(|(field, running)| (field.to_string(), running.finish()))
            .collect(),
        categorical,
        provisional,
    }
}
