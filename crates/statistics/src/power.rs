use insight_core::{InsightError, InsightResult};

use crate::normal::{inverse_normal_cdf, z_critical};

/// Per-variant sample size needed to detect a relative lift of `mde_pct`
/// over `baseline_rate` with a two-sided test at `confidence_level` and
/// the given power (both percentages).
pub fn required_sample_size(
    baseline_rate: f64,
    mde_pct: f64,
    confidence_level: f64,
    power_pct: f64,
) -> InsightResult<u64> {
    if !(baseline_rate > 0.0 && baseline_rate < 1.0) {
        return Err(InsightError::InvalidInput(format!(
            "baseline rate must be within (0, 1), got {baseline_rate}"
        )));
    }
    if !(mde_pct > 0.0 && mde_pct.is_finite()) {
        return Err(InsightError::InvalidInput(format!(
            "minimum detectable effect must be positive, got {mde_pct}"
        )));
    }
    if !(power_pct > 0.0 && power_pct < 100.0) {
        return Err(InsightError::InvalidInput(format!(
            "power must be within (0, 100), got {power_pct}"
        )));
    }

    let p1 = baseline_rate;
    let p2 = baseline_rate * (1.0 + mde_pct / 100.0);
    if p2 >= 1.0 {
        return Err(InsightError::InvalidInput(format!(
            "a {mde_pct}% lift on a {baseline_rate} baseline exceeds a 100% rate"
        )));
    }

    let z_alpha = z_critical(confidence_level)?;
    let z_beta = inverse_normal_cdf(power_pct / 100.0)?;
    let p_bar = (p1 + p2) / 2.0;

    let numerator = z_alpha * (2.0 * p_bar * (1.0 - p_bar)).sqrt()
        + z_beta * (p1 * (1.0 - p1) + p2 * (1.0 - p2)).sqrt();
    let n = (numerator * numerator) / ((p2 - p1) * (p2 - p1));
    Ok(n.ceil() as u64)
}
