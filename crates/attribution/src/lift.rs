//! Channel conversion-rate lift used by the data-driven model.

use std::collections::HashMap;

use insight_core::types::ChannelExposure;
use serde::{Deserialize, Serialize};

/// Per-channel conversion rate relative to the campaign average, computed
/// over the campaign's whole touchpoint population (converting or not).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelLift {
    pub campaign_rate: f64,
    lifts: HashMap<String, f64>,
}

impl ChannelLift {
    /// `None` when the population is empty or never converted, since no
    /// average rate exists to compare against.
    pub fn from_exposure(exposure: &[ChannelExposure]) -> Option<Self> {
        let touchpoints: u64 = exposure.iter().map(|e| e.touchpoints).sum();
        let converting: u64 = exposure.iter().map(|e| e.converting_touchpoints).sum();
        if touchpoints == 0 || converting == 0 {
            return None;
        }
        let campaign_rate = converting as f64 / touchpoints as f64;

        let lifts = exposure
            .iter()
            .filter(|e| e.touchpoints > 0)
            .map(|e| {
                let rate = e.converting_touchpoints as f64 / e.touchpoints as f64;
                (e.channel.clone(), rate / campaign_rate)
            })
            .collect();

        Some(Self {
            campaign_rate,
            lifts,
        })
    }

    pub fn lift(&self, channel: &str) -> Option<f64> {
        self.lifts.get(channel).copied()
    }

    pub fn channel_count(&self) -> usize {
        self.lifts.len()
    }
}
