//! Read-side views over an experiment: performance, daily series,
//! progress, recommendations and organization totals.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use insight_core::types::{
    Experiment, ExperimentEvent, ExperimentStatus, VariantAggregate, VariantStatus,
};
use insight_statistics::{relative_lift, required_sample_size};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::significance::{SignificanceVerdict, VariantSignificance};

/// Lift above which a variant is flagged for review.
const STRONG_LIFT_PCT: f64 = 20.0;

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator > 0 {
        numerator as f64 / denominator as f64
    } else {
        0.0
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

// ─── Performance ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantPerformance {
    pub variant_id: Uuid,
    pub variant_name: String,
    pub is_control: bool,
    pub status: VariantStatus,
    pub traffic_percentage: f64,
    pub impressions: u64,
    pub clicks: u64,
    pub conversions: u64,
    pub total_value: f64,
    pub ctr: f64,
    pub conversion_rate: f64,
    pub value_per_conversion: f64,
    pub lift_vs_control: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub experiment_id: Uuid,
    pub status: ExperimentStatus,
    pub total_impressions: u64,
    pub total_conversions: u64,
    pub total_value: f64,
    pub variants: Vec<VariantPerformance>,
}

pub fn performance_summary(
    experiment: &Experiment,
    aggregates: &HashMap<Uuid, VariantAggregate>,
) -> PerformanceSummary {
    let control_rate = experiment
        .control()
        .and_then(|c| aggregates.get(&c.id))
        .map(|a| ratio(a.conversions, a.exposures()))
        .unwrap_or(0.0);

    let mut ordered: Vec<_> = experiment.variants.iter().collect();
    ordered.sort_by_key(|v| v.position);

    let variants: Vec<VariantPerformance> = ordered
        .into_iter()
        .map(|v| {
            let agg = aggregates.get(&v.id).copied().unwrap_or_default();
            let conversion_rate = ratio(agg.conversions, agg.exposures());
            VariantPerformance {
                variant_id: v.id,
                variant_name: v.name.clone(),
                is_control: v.is_control,
                status: v.status,
                traffic_percentage: v.traffic_percentage,
                impressions: agg.impressions,
                clicks: agg.clicks,
                conversions: agg.conversions,
                total_value: agg.total_value,
                ctr: ratio(agg.clicks, agg.impressions),
                conversion_rate,
                value_per_conversion: if agg.conversions > 0 {
                    agg.total_value / agg.conversions as f64
                } else {
                    0.0
                },
                lift_vs_control: if v.is_control {
                    None
                } else {
                    relative_lift(control_rate, conversion_rate)
                },
            }
        })
        .collect();

    PerformanceSummary {
        experiment_id: experiment.id,
        status: experiment.status,
        total_impressions: variants.iter().map(|v| v.impressions).sum(),
        total_conversions: variants.iter().map(|v| v.conversions).sum(),
        total_value: variants.iter().map(|v| v.total_value).sum(),
        variants,
    }
}

// ─── Time series ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub date: NaiveDate,
    pub variant_id: Uuid,
    pub impressions: u64,
    pub clicks: u64,
    pub conversions: u64,
    pub custom_events: u64,
    pub total_value: f64,
}

/// Daily (UTC) counts per variant, ordered by date then variant.
pub fn time_series(events: &[ExperimentEvent]) -> Vec<TimeSeriesPoint> {
    let mut buckets: BTreeMap<(NaiveDate, Uuid), VariantAggregate> = BTreeMap::new();
    for event in events {
        buckets
            .entry((event.timestamp.date_naive(), event.variant_id))
            .or_default()
            .record(event);
    }
    buckets
        .into_iter()
        .map(|((date, variant_id), agg)| TimeSeriesPoint {
            date,
            variant_id,
            impressions: agg.impressions,
            clicks: agg.clicks,
            conversions: agg.conversions,
            custom_events: agg.custom_events,
            total_value: agg.total_value,
        })
        .collect()
}

// ─── Progress ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentProgress {
    pub status: ExperimentStatus,
    pub total_days: u32,
    pub days_elapsed: i64,
    pub days_remaining: i64,
    pub percent_complete: f64,
    pub scheduled_end: Option<DateTime<Utc>>,
    /// Exposures of the least-exposed active variant.
    pub min_variant_exposures: u64,
    pub target_sample_size: u64,
    pub sample_progress_pct: f64,
}

impl ExperimentProgress {
    pub fn sample_reached(&self) -> bool {
        self.min_variant_exposures >= self.target_sample_size
    }
}

pub fn progress(
    experiment: &Experiment,
    aggregates: &HashMap<Uuid, VariantAggregate>,
    now: DateTime<Utc>,
) -> ExperimentProgress {
    let total_days = experiment.duration_days;
    let min_variant_exposures = experiment
        .active_variants()
        .map(|v| aggregates.get(&v.id).map(|a| a.exposures()).unwrap_or(0))
        .min()
        .unwrap_or(0);
    let target = experiment.sample_size_per_variant;
    let sample_progress_pct = if target > 0 {
        round1((min_variant_exposures as f64 / target as f64 * 100.0).min(100.0))
    } else {
        100.0
    };

    let scheduled_end = experiment
        .started_at
        .map(|start| start + Duration::days(i64::from(total_days)));

    let (days_elapsed, percent_complete) = match (experiment.status, experiment.started_at) {
        (ExperimentStatus::Draft, _) | (_, None) => (0, 0.0),
        (status, Some(start)) => {
            let until = match status {
                ExperimentStatus::Completed => experiment.ended_at.unwrap_or(now),
                _ => now,
            };
            let elapsed = (until - start).num_days().max(0);
            let pct = if status == ExperimentStatus::Completed {
                100.0
            } else if total_days > 0 {
                round1((elapsed as f64 / f64::from(total_days) * 100.0).min(100.0))
            } else {
                0.0
            };
            (elapsed, pct)
        }
    };
    let days_remaining = match experiment.status {
        ExperimentStatus::Running | ExperimentStatus::Paused => {
            (i64::from(total_days) - days_elapsed).max(0)
        }
        _ => 0,
    };

    ExperimentProgress {
        status: experiment.status,
        total_days,
        days_elapsed,
        days_remaining,
        percent_complete,
        scheduled_end,
        min_variant_exposures,
        target_sample_size: target,
        sample_progress_pct,
    }
}

// ─── Recommendations ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    Action,
    Info,
    Warning,
    Insight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationPriority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    StopTest,
    Continue,
    IncreaseSample,
    ExtendDuration,
    ReviewWinner,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub priority: RecommendationPriority,
    pub action: RecommendedAction,
    pub message: String,
    /// Per-variant sample size estimated from the observed control rate.
    pub recommended_sample_size: Option<u64>,
}

impl Recommendation {
    fn new(
        kind: RecommendationKind,
        priority: RecommendationPriority,
        action: RecommendedAction,
        message: String,
    ) -> Self {
        Self {
            kind,
            priority,
            action,
            message,
            recommended_sample_size: None,
        }
    }
}

pub fn recommendations(
    experiment: &Experiment,
    significance: &[VariantSignificance],
    progress: &ExperimentProgress,
    power_pct: f64,
) -> Vec<Recommendation> {
    let mut recs = Vec::new();
    let live = matches!(
        experiment.status,
        ExperimentStatus::Running | ExperimentStatus::Paused
    );
    let any_significant = significance
        .iter()
        .any(|s| s.verdict == SignificanceVerdict::Significant);

    if live {
        if any_significant {
            recs.push(Recommendation::new(
                RecommendationKind::Action,
                RecommendationPriority::High,
                RecommendedAction::StopTest,
                "Experiment has reached statistical significance. Consider completing it and rolling out the winner.".to_string(),
            ));
        } else {
            recs.push(Recommendation::new(
                RecommendationKind::Info,
                RecommendationPriority::Medium,
                RecommendedAction::Continue,
                "Experiment has not reached statistical significance yet. Keep it running for conclusive results.".to_string(),
            ));
        }

        if !progress.sample_reached() {
            let control_rate = significance
                .first()
                .map(|s| s.control_conversion_rate)
                .unwrap_or(0.0);
            let estimate = required_sample_size(
                control_rate,
                experiment.minimum_detectable_effect,
                experiment.confidence_level,
                power_pct,
            )
            .ok();
            let mut rec = Recommendation::new(
                RecommendationKind::Warning,
                RecommendationPriority::Medium,
                RecommendedAction::IncreaseSample,
                format!(
                    "Smallest variant has {} of {} required exposures. Results may not be reliable yet.",
                    progress.min_variant_exposures, progress.target_sample_size
                ),
            );
            rec.recommended_sample_size = estimate;
            recs.push(rec);
        }

        if progress.days_remaining == 0 && !any_significant {
            recs.push(Recommendation::new(
                RecommendationKind::Warning,
                RecommendationPriority::Low,
                RecommendedAction::ExtendDuration,
                "Scheduled duration has elapsed without a significant result. Consider extending the experiment.".to_string(),
            ));
        }
    }

    let best_lift = significance
        .iter()
        .filter_map(|s| s.lift_pct)
        .fold(None, |best: Option<f64>, lift| {
            Some(best.map_or(lift, |b| b.max(lift)))
        });
    if let Some(lift) = best_lift.filter(|l| *l > STRONG_LIFT_PCT) {
        recs.push(Recommendation::new(
            RecommendationKind::Insight,
            RecommendationPriority::High,
            RecommendedAction::ReviewWinner,
            format!("A variant shows {lift:.1}% improvement over control."),
        ));
    }

    recs
}

// ─── Organization ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrgExperimentStats {
    pub total: usize,
    pub draft: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub with_winner: usize,
    /// Mean improvement over control across completed experiments with a
    /// winner.
    pub avg_winning_improvement: Option<f64>,
}

pub fn org_stats(experiments: &[Experiment]) -> OrgExperimentStats {
    let mut stats = OrgExperimentStats {
        total: experiments.len(),
        ..Default::default()
    };
    let mut improvements = Vec::new();
    for exp in experiments {
        match exp.status {
            ExperimentStatus::Draft => stats.draft += 1,
            ExperimentStatus::Running => stats.running += 1,
            ExperimentStatus::Paused => stats.paused += 1,
            ExperimentStatus::Completed => stats.completed += 1,
        }
        if exp.winner_variant_id.is_some() {
            stats.with_winner += 1;
            improvements.extend(exp.improvement_over_control);
        }
    }
    if !improvements.is_empty() {
        stats.avg_winning_improvement =
            Some(improvements.iter().sum::<f64>() / improvements.len() as f64);
    }
    stats
}
