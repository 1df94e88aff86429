//! Proportion tests and intervals.

use insight_core::{InsightError, InsightResult};
use serde::{Deserialize, Serialize};

use crate::normal::{two_sided_p_value, z_critical};

const DEFAULT_CONFIDENCE_LEVEL: f64 = 95.0;

/// Outcome of a pooled two-proportion z-test of B against A.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZTestResult {
    pub rate_a: f64,
    pub rate_b: f64,
    pub z_score: f64,
    pub p_value: f64,
    /// `rate_b - rate_a`.
    pub diff: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
    pub margin: f64,
}

fn check_counts(conversions: u64, n: u64, label: &str) -> InsightResult<()> {
    if n == 0 {
        return Err(InsightError::InvalidInput(format!(
            "sample size for {label} must be positive"
        )));
    }
    if conversions > n {
        return Err(InsightError::InvalidInput(format!(
            "{label} has {conversions} conversions out of {n} exposures"
        )));
    }
    Ok(())
}

/// Pooled two-sided z-test with a 95% interval on the difference.
pub fn two_proportion_z_test(
    conv_a: u64,
    n_a: u64,
    conv_b: u64,
    n_b: u64,
) -> InsightResult<ZTestResult> {
    two_proportion_z_test_at(conv_a, n_a, conv_b, n_b, DEFAULT_CONFIDENCE_LEVEL)
}

/// Pooled two-sided z-test; the interval on `diff` uses the unpooled
/// standard error at `confidence_level` percent.
pub fn two_proportion_z_test_at(
    conv_a: u64,
    n_a: u64,
    conv_b: u64,
    n_b: u64,
    confidence_level: f64,
) -> InsightResult<ZTestResult> {
    check_counts(conv_a, n_a, "group A")?;
    check_counts(conv_b, n_b, "group B")?;
    let z_crit = z_critical(confidence_level)?;

    let (na, nb) = (n_a as f64, n_b as f64);
    let rate_a = conv_a as f64 / na;
    let rate_b = conv_b as f64 / nb;
    let diff = rate_b - rate_a;

    let pooled = (conv_a + conv_b) as f64 / (n_a + n_b) as f64;
    let pooled_se = (pooled * (1.0 - pooled) * (1.0 / na + 1.0 / nb)).sqrt();
    let (z_score, p_value) = if pooled_se > 0.0 {
        let z = diff / pooled_se;
        (z, two_sided_p_value(z))
    } else {
        // Both groups at 0% or both at 100%.
        (0.0, 1.0)
    };

    let unpooled_se = (rate_a * (1.0 - rate_a) / na + rate_b * (1.0 - rate_b) / nb).sqrt();
    let margin = z_crit * unpooled_se;

    Ok(ZTestResult {
        rate_a,
        rate_b,
        z_score,
        p_value,
        diff,
        ci_lower: diff - margin,
        ci_upper: diff + margin,
    })
}

/// Normal-approximation interval for a single proportion, clamped to [0, 1].
pub fn confidence_interval(
    p: f64,
    n: u64,
    confidence_level: f64,
) -> InsightResult<ConfidenceInterval> {
    if !(0.0..=1.0).contains(&p) {
        return Err(InsightError::InvalidInput(format!(
            "proportion must be within [0, 1], got {p}"
        )));
    }
    if n == 0 {
        return Err(InsightError::InvalidInput(
            "sample size must be positive".to_string(),
        ));
    }
    let z = z_critical(confidence_level)?;
    let margin = z * (p * (1.0 - p) / n as f64).sqrt();
    Ok(ConfidenceInterval {
        lower: (p - margin).max(0.0),
        upper: (p + margin).min(1.0),
        margin,
    })
}

/// Relative improvement of `variant_rate` over `control_rate`, in percent.
/// Undefined when the control never converts.
pub fn relative_lift(control_rate: f64, variant_rate: f64) -> Option<f64> {
    if control_rate > 0.0 {
        Some((variant_rate - control_rate) / control_rate * 100.0)
    } else {
        None
    }
}
