//! Attribution orchestrator: loads conversion journeys for a campaign,
//! runs one or all models and turns channel totals into insights.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use insight_core::batch::fan_out;
use insight_core::config::{AppConfig, AttributionConfig, StoreConfig};
use insight_core::store::ConversionStore;
use insight_core::types::{Conversion, DateRange};
use insight_core::{InsightError, InsightResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::lift::ChannelLift;
use crate::model::{allocate, AttributionModel, ModelParams};
use crate::path::AttributionPath;

// ─── Results ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelAttribution {
    pub channel: String,
    /// Fractional conversions credited to the channel.
    pub conversions: f64,
    pub conversion_value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionReport {
    pub campaign_id: Uuid,
    pub model: AttributionModel,
    pub range: DateRange,
    pub total_conversions: u64,
    pub total_value: f64,
    pub attributed_conversions: u64,
    pub unattributed_conversions: u64,
    pub unattributed_value: f64,
    /// Conversions the data-driven model credited linearly for lack of
    /// lift statistics.
    pub degraded_conversions: u64,
    /// Sorted by credited value, highest first; ties by channel name.
    pub channels: Vec<ChannelAttribution>,
    pub computed_at: DateTime<Utc>,
}

impl AttributionReport {
    pub fn is_degraded(&self) -> bool {
        self.degraded_conversions > 0
    }

    pub fn channel(&self, name: &str) -> Option<&ChannelAttribution> {
        self.channels.iter().find(|c| c.channel == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelModelRow {
    pub channel: String,
    pub conversions: BTreeMap<AttributionModel, f64>,
    /// Max minus min credited conversions across models.
    pub spread: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelComparison {
    pub campaign_id: Uuid,
    pub range: DateRange,
    pub total_conversions: u64,
    pub attributed_conversions: u64,
    pub degraded_conversions: u64,
    /// Most model-sensitive channels first.
    pub channels: Vec<ChannelModelRow>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelValuation {
    /// The chosen model credits the channel more than last-click does.
    Undervalued,
    /// The chosen model credits the channel less than last-click does.
    Overvalued,
    Aligned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInsight {
    pub channel: String,
    pub conversions: f64,
    pub conversion_value: f64,
    pub contribution_pct: f64,
    pub value_per_conversion: f64,
    pub share_pct: f64,
    pub last_click_share_pct: f64,
    pub share_delta_pct: f64,
    pub valuation: ChannelValuation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionInsights {
    pub campaign_id: Uuid,
    pub model: AttributionModel,
    pub range: DateRange,
    pub threshold_pct: f64,
    pub total_value: f64,
    pub degraded_conversions: u64,
    pub top_channel: Option<ChannelInsight>,
    pub channels: Vec<ChannelInsight>,
    pub computed_at: DateTime<Utc>,
}

// ─── Engine ─────────────────────────────────────────────────────────────

struct LoadedJourneys {
    range: DateRange,
    conversions: Vec<(AttributionPath, f64)>,
    lift: Option<ChannelLift>,
}

/// Multi-touch attribution over a [`ConversionStore`].
pub struct AttributionEngine<S: ConversionStore> {
    store: Arc<S>,
    config: AttributionConfig,
    store_config: StoreConfig,
    params: ModelParams,
}

impl<S: ConversionStore> AttributionEngine<S> {
    pub fn new(store: Arc<S>, config: &AppConfig) -> Self {
        info!(
            lookback_days = config.attribution.lookback_days,
            half_life_days = config.attribution.half_life_days,
            "Attribution engine initialized"
        );
        Self {
            store,
            params: ModelParams::from(&config.attribution),
            config: config.attribution.clone(),
            store_config: config.store.clone(),
        }
    }

    fn resolve_range(&self, range: Option<DateRange>) -> DateRange {
        range.unwrap_or_else(|| DateRange::last_days(self.config.default_range_days, Utc::now()))
    }

    fn load(
        &self,
        org_id: &Uuid,
        campaign_id: &Uuid,
        range: Option<DateRange>,
        with_lift: bool,
    ) -> InsightResult<LoadedJourneys> {
        let range = self.resolve_range(range);
        let conversions: Vec<Conversion> =
            self.store.load_conversions(org_id, campaign_id, &range)?;
        let lookback = self.config.lookback_days;
        let conversions = conversions
            .iter()
            .map(|c| (AttributionPath::from_conversion(c, lookback), c.value))
            .collect();

        let lift = if with_lift {
            let exposure = self.store.load_channel_exposure(org_id, campaign_id, &range)?;
            let lift = ChannelLift::from_exposure(&exposure);
            if lift.is_none() {
                warn!(
                    campaign_id = %campaign_id,
                    "No usable channel lift statistics; data-driven credit falls back to linear"
                );
            }
            lift
        } else {
            None
        };

        Ok(LoadedJourneys {
            range,
            conversions,
            lift,
        })
    }

    fn run_model(
        &self,
        campaign_id: &Uuid,
        model: AttributionModel,
        journeys: &LoadedJourneys,
    ) -> AttributionReport {
        let mut totals: BTreeMap<String, (f64, f64)> = BTreeMap::new();
        let mut report = AttributionReport {
            campaign_id: *campaign_id,
            model,
            range: journeys.range,
            total_conversions: journeys.conversions.len() as u64,
            total_value: 0.0,
            attributed_conversions: 0,
            unattributed_conversions: 0,
            unattributed_value: 0.0,
            degraded_conversions: 0,
            channels: Vec::new(),
            computed_at: Utc::now(),
        };

        for (path, value) in &journeys.conversions {
            report.total_value += value;
            let Some(allocation) = allocate(model, path, &self.params, journeys.lift.as_ref())
            else {
                report.unattributed_conversions += 1;
                report.unattributed_value += value;
                continue;
            };
            report.attributed_conversions += 1;
            if allocation.degraded {
                report.degraded_conversions += 1;
            }
            for (channel, credit) in allocation.credits {
                let entry = totals.entry(channel).or_insert((0.0, 0.0));
                entry.0 += credit;
                entry.1 += credit * value;
            }
        }

        let mut channels: Vec<ChannelAttribution> = totals
            .into_iter()
            .map(|(channel, (conversions, conversion_value))| ChannelAttribution {
                channel,
                conversions,
                conversion_value,
            })
            .collect();
        channels.sort_by(|a, b| {
            b.conversion_value
                .total_cmp(&a.conversion_value)
                .then_with(|| a.channel.cmp(&b.channel))
        });
        report.channels = channels;

        if report.is_degraded() {
            warn!(
                campaign_id = %campaign_id,
                degraded = report.degraded_conversions,
                "Data-driven attribution degraded to linear"
            );
        }
        debug!(
            campaign_id = %campaign_id,
            model = %model,
            conversions = report.total_conversions,
            unattributed = report.unattributed_conversions,
            "Attribution computed"
        );
        report
    }

    /// Credits every conversion in `range` (default: the last
    /// `default_range_days` days) to channels under `model`.
    pub fn attribute_conversions(
        &self,
        org_id: &Uuid,
        campaign_id: &Uuid,
        model: AttributionModel,
        range: Option<DateRange>,
    ) -> InsightResult<AttributionReport> {
        let journeys = self.load(
            org_id,
            campaign_id,
            range,
            model == AttributionModel::DataDriven,
        )?;
        Ok(self.run_model(campaign_id, model, &journeys))
    }

    /// Runs all six models over one load of the campaign's conversions.
    pub fn compare_attribution_models(
        &self,
        org_id: &Uuid,
        campaign_id: &Uuid,
        range: Option<DateRange>,
    ) -> InsightResult<ModelComparison> {
        let journeys = self.load(org_id, campaign_id, range, true)?;
        let reports: Vec<AttributionReport> = AttributionModel::ALL
            .into_iter()
            .map(|model| self.run_model(campaign_id, model, &journeys))
            .collect();

        let mut matrix: BTreeMap<String, BTreeMap<AttributionModel, f64>> = BTreeMap::new();
        for report in &reports {
            for channel in &report.channels {
                matrix
                    .entry(channel.channel.clone())
                    .or_default()
                    .insert(report.model, channel.conversions);
            }
        }

        let mut channels: Vec<ChannelModelRow> = matrix
            .into_iter()
            .map(|(channel, mut conversions)| {
                for model in AttributionModel::ALL {
                    conversions.entry(model).or_insert(0.0);
                }
                let max = conversions.values().copied().fold(f64::MIN, f64::max);
                let min = conversions.values().copied().fold(f64::MAX, f64::min);
                ChannelModelRow {
                    channel,
                    conversions,
                    spread: max - min,
                }
            })
            .collect();
        channels.sort_by(|a, b| {
            b.spread
                .total_cmp(&a.spread)
                .then_with(|| a.channel.cmp(&b.channel))
        });

        let degraded_conversions = reports
            .iter()
            .map(|r| r.degraded_conversions)
            .max()
            .unwrap_or(0);
        let attributed_conversions = reports
            .first()
            .map(|r| r.attributed_conversions)
            .unwrap_or(0);

        info!(
            campaign_id = %campaign_id,
            channels = channels.len(),
            "Attribution models compared"
        );
        Ok(ModelComparison {
            campaign_id: *campaign_id,
            range: journeys.range,
            total_conversions: journeys.conversions.len() as u64,
            attributed_conversions,
            degraded_conversions,
            channels,
            computed_at: Utc::now(),
        })
    }

    /// Compares `model`'s channel credit shares with last-click and labels
    /// channels whose share moves by more than `threshold_pct` points.
    pub fn get_attribution_insights(
        &self,
        org_id: &Uuid,
        campaign_id: &Uuid,
        model: AttributionModel,
        range: Option<DateRange>,
        threshold_pct: Option<f64>,
    ) -> InsightResult<AttributionInsights> {
        let threshold = threshold_pct.unwrap_or(self.config.insight_threshold_pct);
        if !(threshold.is_finite() && (0.0..=100.0).contains(&threshold)) {
            return Err(InsightError::InvalidInput(format!(
                "insight threshold must be within 0-100 percentage points, got {threshold}"
            )));
        }

        let journeys = self.load(
            org_id,
            campaign_id,
            range,
            model == AttributionModel::DataDriven,
        )?;
        let chosen = self.run_model(campaign_id, model, &journeys);
        let baseline = self.run_model(campaign_id, AttributionModel::LastClick, &journeys);

        let credited = chosen.attributed_conversions as f64;
        let share = |conversions: f64| {
            if credited > 0.0 {
                conversions / credited * 100.0
            } else {
                0.0
            }
        };
        let channel_value: f64 = chosen.channels.iter().map(|c| c.conversion_value).sum();

        // Channels only last-click credits still get a row at zero share.
        let baseline_only = baseline
            .channels
            .iter()
            .filter(|b| chosen.channel(&b.channel).is_none())
            .map(|b| ChannelAttribution {
                channel: b.channel.clone(),
                conversions: 0.0,
                conversion_value: 0.0,
            });
        let channels: Vec<ChannelInsight> = chosen
            .channels
            .iter()
            .cloned()
            .chain(baseline_only)
            .map(|c| {
                let share_pct = share(c.conversions);
                let last_click_share_pct = share(
                    baseline
                        .channel(&c.channel)
                        .map(|b| b.conversions)
                        .unwrap_or(0.0),
                );
                let delta = share_pct - last_click_share_pct;
                let valuation = if delta > threshold {
                    ChannelValuation::Undervalued
                } else if delta < -threshold {
                    ChannelValuation::Overvalued
                } else {
                    ChannelValuation::Aligned
                };
                ChannelInsight {
                    contribution_pct: if channel_value > 0.0 {
                        c.conversion_value / channel_value * 100.0
                    } else {
                        0.0
                    },
                    value_per_conversion: if c.conversions > 0.0 {
                        c.conversion_value / c.conversions
                    } else {
                        0.0
                    },
                    channel: c.channel,
                    conversions: c.conversions,
                    conversion_value: c.conversion_value,
                    share_pct,
                    last_click_share_pct,
                    share_delta_pct: delta,
                    valuation,
                }
            })
            .collect();

        let flagged = channels
            .iter()
            .filter(|c| c.valuation != ChannelValuation::Aligned)
            .count();
        info!(
            campaign_id = %campaign_id,
            model = %model,
            flagged,
            "Attribution insights computed"
        );

        Ok(AttributionInsights {
            campaign_id: *campaign_id,
            model,
            range: journeys.range,
            threshold_pct: threshold,
            total_value: channel_value,
            degraded_conversions: chosen.degraded_conversions,
            top_channel: channels.first().cloned(),
            channels,
            computed_at: Utc::now(),
        })
    }
}

impl<S: ConversionStore + 'static> AttributionEngine<S> {
    /// One `attribute_conversions` per campaign, run concurrently with the
    /// store read timeout applied to each.
    pub async fn attribute_campaigns(
        self: &Arc<Self>,
        org_id: Uuid,
        campaign_ids: Vec<Uuid>,
        model: AttributionModel,
        range: Option<DateRange>,
    ) -> Vec<(Uuid, InsightResult<AttributionReport>)> {
        let engine = Arc::clone(self);
        let range = Some(self.resolve_range(range));
        fan_out(campaign_ids, &self.store_config, move |campaign_id| {
            engine.attribute_conversions(&org_id, &campaign_id, model, range)
        })
        .await
    }
}
