use chrono::{DateTime, Duration, Utc};
use insight_core::types::{Conversion, Touchpoint};
use serde::{Deserialize, Serialize};

/// The touchpoints that can receive credit for one conversion, oldest
/// first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionPath {
    pub converted_at: DateTime<Utc>,
    pub touchpoints: Vec<Touchpoint>,
}

impl AttributionPath {
    /// Keeps touchpoints strictly before the conversion and no older than
    /// `lookback_days`. Touchpoints sharing a timestamp keep their original
    /// order.
    pub fn from_conversion(conversion: &Conversion, lookback_days: u32) -> Self {
        let window_start = conversion.timestamp - Duration::days(i64::from(lookback_days));
        let mut touchpoints: Vec<Touchpoint> = conversion
            .touchpoints
            .iter()
            .filter(|t| t.timestamp < conversion.timestamp && t.timestamp >= window_start)
            .cloned()
            .collect();
        touchpoints.sort_by_key(|t| t.timestamp);

        Self {
            converted_at: conversion.timestamp,
            touchpoints,
        }
    }

    /// Drops touchpoints after `converted_at`; one at the conversion
    /// instant is kept with age 0.
    pub fn new(converted_at: DateTime<Utc>, mut touchpoints: Vec<Touchpoint>) -> Self {
        touchpoints.retain(|t| t.timestamp <= converted_at);
        touchpoints.sort_by_key(|t| t.timestamp);
        Self {
            converted_at,
            touchpoints,
        }
    }

    pub fn len(&self) -> usize {
        self.touchpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.touchpoints.is_empty()
    }

    /// Age of each touchpoint at conversion time, in fractional days.
    pub fn ages_in_days(&self) -> impl Iterator<Item = f64> + '_ {
        self.touchpoints.iter().map(move |t| {
            (self.converted_at - t.timestamp).num_milliseconds() as f64 / 86_400_000.0
        })
    }
}
