use serde::Deserialize;

use crate::error::{InsightError, InsightResult};

/// Root engine configuration. Loaded from environment variables
/// with the prefix `INSIGHT_ENGINE__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub experimentation: ExperimentationConfig,
    #[serde(default)]
    pub attribution: AttributionConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentationConfig {
    #[serde(default = "default_confidence_level")]
    pub default_confidence_level: f64,
    /// Allowed deviation of the active traffic split from 100%.
    #[serde(default = "default_traffic_tolerance")]
    pub traffic_tolerance: f64,
    #[serde(default = "default_sample_size_per_variant")]
    pub default_sample_size_per_variant: u64,
    #[serde(default = "default_duration_days")]
    pub default_duration_days: u32,
    #[serde(default = "default_max_duration_days")]
    pub max_duration_days: u32,
    #[serde(default = "default_recommendation_power_pct")]
    pub recommendation_power_pct: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttributionConfig {
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    #[serde(default = "default_half_life_days")]
    pub half_life_days: f64,
    #[serde(default = "default_first_weight")]
    pub first_weight: f64,
    #[serde(default = "default_last_weight")]
    pub last_weight: f64,
    /// Share difference, in percentage points, that flags a channel.
    #[serde(default = "default_insight_threshold_pct")]
    pub insight_threshold_pct: f64,
    #[serde(default = "default_range_days")]
    pub default_range_days: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_max_concurrent_reads")]
    pub max_concurrent_reads: usize,
}

// Default functions
fn default_confidence_level() -> f64 {
    95.0
}
fn default_traffic_tolerance() -> f64 {
    0.01
}
fn default_sample_size_per_variant() -> u64 {
    1000
}
fn default_duration_days() -> u32 {
    14
}
fn default_max_duration_days() -> u32 {
    90
}
fn default_recommendation_power_pct() -> f64 {
    80.0
}
fn default_lookback_days() -> u32 {
    30
}
fn default_half_life_days() -> f64 {
    7.0
}
fn default_first_weight() -> f64 {
    0.4
}
fn default_last_weight() -> f64 {
    0.4
}
fn default_insight_threshold_pct() -> f64 {
    15.0
}
fn default_range_days() -> u32 {
    30
}
fn default_read_timeout_ms() -> u64 {
    5000
}
fn default_max_concurrent_reads() -> usize {
    8
}

impl Default for ExperimentationConfig {
    fn default() -> Self {
        Self {
            default_confidence_level: default_confidence_level(),
            traffic_tolerance: default_traffic_tolerance(),
            default_sample_size_per_variant: default_sample_size_per_variant(),
            default_duration_days: default_duration_days(),
            max_duration_days: default_max_duration_days(),
            recommendation_power_pct: default_recommendation_power_pct(),
        }
    }
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            lookback_days: default_lookback_days(),
            half_life_days: default_half_life_days(),
            first_weight: default_first_weight(),
            last_weight: default_last_weight(),
            insight_threshold_pct: default_insight_threshold_pct(),
            default_range_days: default_range_days(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: default_read_timeout_ms(),
            max_concurrent_reads: default_max_concurrent_reads(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            experimentation: ExperimentationConfig::default(),
            attribution: AttributionConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> InsightResult<Self> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("INSIGHT_ENGINE")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> InsightResult<()> {
        let exp = &self.experimentation;
        if !(90.0..=99.9).contains(&exp.default_confidence_level) {
            return Err(InsightError::Config(format!(
                "default_confidence_level must be within 90-99.9, got {}",
                exp.default_confidence_level
            )));
        }
        if !(exp.traffic_tolerance >= 0.0 && exp.traffic_tolerance < 1.0) {
            return Err(InsightError::Config(format!(
                "traffic_tolerance must be within [0, 1), got {}",
                exp.traffic_tolerance
            )));
        }
        if exp.max_duration_days == 0 || exp.default_duration_days > exp.max_duration_days {
            return Err(InsightError::Config(
                "default_duration_days must not exceed max_duration_days".to_string(),
            ));
        }
        if !(exp.recommendation_power_pct > 0.0 && exp.recommendation_power_pct < 100.0) {
            return Err(InsightError::Config(
                "recommendation_power_pct must be within (0, 100)".to_string(),
            ));
        }

        let attr = &self.attribution;
        if attr.lookback_days == 0 || attr.default_range_days == 0 {
            return Err(InsightError::Config(
                "lookback_days and default_range_days must be positive".to_string(),
            ));
        }
        if !(attr.half_life_days.is_finite() && attr.half_life_days > 0.0) {
            return Err(InsightError::Config(format!(
                "half_life_days must be positive, got {}",
                attr.half_life_days
            )));
        }
        if attr.first_weight < 0.0
            || attr.last_weight < 0.0
            || attr.first_weight + attr.last_weight > 1.0
        {
            return Err(InsightError::Config(format!(
                "position weights must be non-negative and sum to at most 1, got {} + {}",
                attr.first_weight, attr.last_weight
            )));
        }
        if !(attr.insight_threshold_pct > 0.0 && attr.insight_threshold_pct <= 100.0) {
            return Err(InsightError::Config(format!(
                "insight_threshold_pct must be within (0, 100], got {}",
                attr.insight_threshold_pct
            )));
        }

        if self.store.read_timeout_ms == 0 || self.store.max_concurrent_reads == 0 {
            return Err(InsightError::Config(
                "store read_timeout_ms and max_concurrent_reads must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
