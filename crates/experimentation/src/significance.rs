//! Per-variant significance against the control and winner selection.

use std::collections::HashMap;

use insight_core::types::{Experiment, VariantAggregate, VariantStatus};
use insight_core::{InsightError, InsightResult};
use insight_statistics::{relative_lift, two_proportion_z_test_at};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// "Not enough data yet" and "tested and not significant" are different
/// answers and are reported separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignificanceVerdict {
    Significant,
    NotSignificant,
    InsufficientData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantSignificance {
    pub variant_id: Uuid,
    pub variant_name: String,
    pub position: u32,
    pub status: VariantStatus,
    pub exposures: u64,
    pub conversions: u64,
    pub conversion_rate: f64,
    pub control_conversion_rate: f64,
    /// Percent over control; `None` when the control has not converted.
    pub lift_pct: Option<f64>,
    pub p_value: Option<f64>,
    pub z_score: Option<f64>,
    pub ci_lower: Option<f64>,
    pub ci_upper: Option<f64>,
    pub verdict: SignificanceVerdict,
    pub is_significant: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WinnerSelection {
    pub variant_id: Uuid,
    pub lift_pct: f64,
    pub p_value: f64,
}

fn rate(conversions: u64, exposures: u64) -> f64 {
    if exposures > 0 {
        conversions as f64 / exposures as f64
    } else {
        0.0
    }
}

/// Tests every non-control variant against the control. Variants (or a
/// control) below `sample_size_per_variant` exposures are
/// `InsufficientData` even when a p-value can be computed.
pub fn evaluate_significance(
    experiment: &Experiment,
    aggregates: &HashMap<Uuid, VariantAggregate>,
) -> InsightResult<Vec<VariantSignificance>> {
    let control = experiment.control().ok_or_else(|| {
        InsightError::InvalidInput(format!("experiment {} has no control variant", experiment.id))
    })?;
    let control_agg = aggregates.get(&control.id).copied().unwrap_or_default();
    let control_rate = rate(control_agg.conversions, control_agg.exposures());
    let required = experiment.sample_size_per_variant;
    let alpha = experiment.alpha();

    let mut results = Vec::new();
    for variant in experiment.variants.iter().filter(|v| !v.is_control) {
        let agg = aggregates.get(&variant.id).copied().unwrap_or_default();
        let variant_rate = rate(agg.conversions, agg.exposures());

        let test = two_proportion_z_test_at(
            control_agg.conversions,
            control_agg.exposures(),
            agg.conversions,
            agg.exposures(),
            experiment.confidence_level,
        );

        let sufficient = agg.exposures() >= required && control_agg.exposures() >= required;
        let (verdict, p_value, z_score, ci) = match test {
            Ok(t) => {
                let verdict = if !sufficient {
                    SignificanceVerdict::InsufficientData
                } else if t.p_value < alpha {
                    SignificanceVerdict::Significant
                } else {
                    SignificanceVerdict::NotSignificant
                };
                (verdict, Some(t.p_value), Some(t.z_score), Some((t.ci_lower, t.ci_upper)))
            }
            Err(e) => {
                debug!(variant_id = %variant.id, error = %e, "Variant could not be scored");
                let verdict = if sufficient {
                    SignificanceVerdict::NotSignificant
                } else {
                    SignificanceVerdict::InsufficientData
                };
                (verdict, None, None, None)
            }
        };

        results.push(VariantSignificance {
            variant_id: variant.id,
            variant_name: variant.name.clone(),
            position: variant.position,
            status: variant.status,
            exposures: agg.exposures(),
            conversions: agg.conversions,
            conversion_rate: variant_rate,
            control_conversion_rate: control_rate,
            lift_pct: relative_lift(control_rate, variant_rate),
            p_value,
            z_score,
            ci_lower: ci.map(|c| c.0),
            ci_upper: ci.map(|c| c.1),
            verdict,
            is_significant: verdict == SignificanceVerdict::Significant,
        });
    }
    Ok(results)
}

/// Among significant, positive-lift, non-stopped variants picks the
/// highest lift, then the lowest p-value, then the earliest created.
pub fn determine_winner(results: &[VariantSignificance]) -> Option<WinnerSelection> {
    results
        .iter()
        .filter(|r| r.verdict == SignificanceVerdict::Significant)
        .filter(|r| r.status != VariantStatus::Stopped)
        .filter_map(|r| match (r.lift_pct, r.p_value) {
            (Some(lift), Some(p)) if lift > 0.0 => Some((r, lift, p)),
            _ => None,
        })
        .min_by(|(a, lift_a, p_a), (b, lift_b, p_b)| {
            lift_b
                .total_cmp(lift_a)
                .then_with(|| p_a.total_cmp(p_b))
                .then_with(|| a.position.cmp(&b.position))
        })
        .map(|(r, lift, p)| WinnerSelection {
            variant_id: r.variant_id,
            lift_pct: lift,
            p_value: p,
        })
}
