use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::Serialize;

use crate::config::TrafficConfig;

use super::object::ClassLabel;
use super::tracker::TrackedObject;

pub type ClassCounts = BTreeMap<ClassLabel, u32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficState {
    Fluid,
    Moderate,
    Saturated,
}

impl TrafficState {
    pub fn as_str(self) -> &'static str {
        match self {
            TrafficState::Fluid => "fluid",
            TrafficState::Moderate => "moderate",
            TrafficState::Saturated => "saturated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficThresholds {
    pub fluid_below: u32,
    pub saturated_at: u32,
}

impl TrafficThresholds {
    pub fn classify(&self, vehicle_count: u32) -> TrafficState {
        if vehicle_count < self.fluid_below {
            TrafficState::Fluid
        } else if vehicle_count < self.saturated_at {
            TrafficState::Moderate
        } else {
            TrafficState::Saturated
        }
    }
}

impl From<&TrafficConfig> for TrafficThresholds {
    fn from(config: &TrafficConfig) -> Self {
        Self {
            fluid_below: config.fluid_below,
            saturated_at: config.saturated_at,
        }
    }
}

pub fn vehicle_total(counts: &ClassCounts) -> u32 {
    counts
        .iter()
        .filter(|(class, _)| class.is_vehicle())
        .map(|(_, n)| *n)
        .sum()
}

fn empty_counts() -> ClassCounts {
    ClassLabel::ALL.iter().map(|c| (*c, 0)).collect()
}

/// One processed frame's worth of metrics. Published as-is on `/ws`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub frame: u64,
    pub counts: ClassCounts,
    pub traffic_state: TrafficState,
    pub fps: f64,
}

/// Exponential moving average over inter-frame intervals.
pub struct FpsMeter {
    alpha: f64,
    last: Option<Instant>,
    avg_interval: Option<f64>,
}

impl FpsMeter {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            last: None,
            avg_interval: None,
        }
    }

    pub fn record(&mut self, now: Instant) -> f64 {
        if let Some(last) = self.last {
            let interval = now.saturating_duration_since(last).as_secs_f64();
            self.avg_interval = Some(match self.avg_interval {
                Some(avg) => avg + self.alpha * (interval - avg),
                None => interval,
            });
        }
        self.last = Some(now);
        self.fps()
    }

    pub fn fps(&self) -> f64 {
        match self.avg_interval {
            Some(avg) if avg > 0.0 => 1.0 / avg,
            _ => 0.0,
        }
    }
}

/// Turns per-frame tracked objects into numbered snapshots.
pub struct Aggregator {
    thresholds: TrafficThresholds,
    fps: FpsMeter,
    frame: u64,
    last_timestamp: Option<DateTime<Utc>>,
}

impl Aggregator {
    pub fn new(config: &TrafficConfig) -> Self {
        Self {
            thresholds: TrafficThresholds::from(config),
            fps: FpsMeter::new(config.fps_smoothing),
            frame: 0,
            last_timestamp: None,
        }
    }

    pub fn process(
        &mut self,
        visible: &[TrackedObject],
        wall: DateTime<Utc>,
        now: Instant,
    ) -> MetricsSnapshot {
        let mut counts = empty_counts();
        for obj in visible {
            *counts.entry(obj.class_label).or_insert(0) += 1;
        }

        self.frame += 1;
        let fps = self.fps.record(now);

        // Wall clock may step backwards; snapshots must not.
        let timestamp = match self.last_timestamp {
            Some(prev) if wall < prev => prev,
            _ => wall,
        };
        self.last_timestamp = Some(timestamp);

        MetricsSnapshot {
            timestamp,
            frame: self.frame,
            traffic_state: self.thresholds.classify(vehicle_total(&counts)),
            counts,
            fps,
        }
    }
}

/// Peak counts observed during one wall-clock minute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MinuteSummary {
    pub timestamp: DateTime<Utc>,
    pub counts: ClassCounts,
    pub traffic_state: TrafficState,
}

pub struct MinuteAggregator {
    thresholds: TrafficThresholds,
    minute: Option<DateTime<Utc>>,
    peak: ClassCounts,
}

impl MinuteAggregator {
    pub fn new(thresholds: TrafficThresholds) -> Self {
        Self {
            thresholds,
            minute: None,
            peak: empty_counts(),
        }
    }

    /// Folds a snapshot in; returns the previous minute once it has closed.
    pub fn observe(&mut self, snapshot: &MetricsSnapshot) -> Option<MinuteSummary> {
        let minute = snapshot
            .timestamp
            .duration_trunc(TimeDelta::minutes(1))
            .unwrap_or(snapshot.timestamp);

        let closed = match self.minute {
            Some(current) if current != minute => self.flush(),
            _ => None,
        };

        self.minute = Some(minute);
        for (class, n) in &snapshot.counts {
            let peak = self.peak.entry(*class).or_insert(0);
            *peak = (*peak).max(*n);
        }
        closed
    }

    pub fn flush(&mut self) -> Option<MinuteSummary> {
        let minute = self.minute.take()?;
        let counts = std::mem::replace(&mut self.peak, empty_counts());
        Some(MinuteSummary {
            timestamp: minute,
            traffic_state: self.thresholds.classify(vehicle_total(&counts)),
            counts,
        })
    }
}
