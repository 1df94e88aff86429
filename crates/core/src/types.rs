use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{InsightError, InsightResult};

// ─── Property Bags ──────────────────────────────────────────────────────

/// Current schema version stamped on new property bags.
pub const PROPERTY_SCHEMA_VERSION: u32 = 1;
const MAX_PROPERTY_KEY_LEN: usize = 64;
const MAX_PROPERTY_ENTRIES: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

/// Typed key-value payload attached to variants (`config`) and events
/// (`properties`). Schema version 1: flat map of bool, finite number or
/// text values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyBag {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub entries: BTreeMap<String, PropertyValue>,
}

fn default_schema_version() -> u32 {
    PROPERTY_SCHEMA_VERSION
}

impl Default for PropertyBag {
    fn default() -> Self {
        Self {
            schema_version: PROPERTY_SCHEMA_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: PropertyValue) -> Self {
        self.entries.insert(key.to_string(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.entries.get(key)
    }

    pub fn validate(&self) -> InsightResult<()> {
        if self.schema_version != PROPERTY_SCHEMA_VERSION {
            return Err(InsightError::InvalidInput(format!(
                "unsupported property schema version {}",
                self.schema_version
            )));
        }
        if self.entries.len() > MAX_PROPERTY_ENTRIES {
            return Err(InsightError::InvalidInput(format!(
                "property bag has {} entries, limit is {}",
                self.entries.len(),
                MAX_PROPERTY_ENTRIES
            )));
        }
        for (key, value) in &self.entries {
            if key.is_empty() || key.len() > MAX_PROPERTY_KEY_LEN {
                return Err(InsightError::InvalidInput(format!(
                    "property key '{key}' must be 1-{MAX_PROPERTY_KEY_LEN} characters"
                )));
            }
            if let PropertyValue::Number(n) = value {
                if !n.is_finite() {
                    return Err(InsightError::InvalidInput(format!(
                        "property '{key}' is not a finite number"
                    )));
                }
            }
        }
        Ok(())
    }
}

// ─── Experimentation ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentType {
    Campaign,
    Content,
    Audience,
    Budget,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrafficAllocation {
    #[default]
    Equal,
    Weighted,
    Adaptive,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Draft,
    Running,
    Paused,
    Completed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum VariantStatus {
    #[default]
    Active,
    Paused,
    Stopped,
}

/// A/B/n experiment aggregate. Owns its variants in creation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub experiment_type: ExperimentType,
    pub entity_type: Option<String>,
    pub entity_id: Option<Uuid>,
    pub metric: String,
    pub metrics: Vec<String>,
    pub hypothesis: Option<String>,
    pub duration_days: u32,
    pub sample_size_per_variant: u64,
    /// Percent, 90-99.9.
    pub confidence_level: f64,
    /// Percent, 1-50.
    pub minimum_detectable_effect: f64,
    pub traffic_allocation: TrafficAllocation,
    pub status: ExperimentStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub winner_variant_id: Option<Uuid>,
    pub improvement_over_control: Option<f64>,
    pub variants: Vec<ExperimentVariant>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Experiment {
    pub fn control(&self) -> Option<&ExperimentVariant> {
        self.variants.iter().find(|v| v.is_control)
    }

    pub fn variant(&self, variant_id: &Uuid) -> Option<&ExperimentVariant> {
        self.variants.iter().find(|v| v.id == *variant_id)
    }

    pub fn active_variants(&self) -> impl Iterator<Item = &ExperimentVariant> {
        self.variants
            .iter()
            .filter(|v| v.status == VariantStatus::Active)
    }

    /// Sum of traffic percentages across active variants.
    pub fn active_traffic_total(&self) -> f64 {
        self.active_variants().map(|v| v.traffic_percentage).sum()
    }

    /// Significance threshold derived from the confidence level.
    pub fn alpha(&self) -> f64 {
        1.0 - self.confidence_level / 100.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentVariant {
    pub id: Uuid,
    pub experiment_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub is_control: bool,
    pub traffic_percentage: f64,
    pub config: PropertyBag,
    pub status: VariantStatus,
    /// Creation order within the experiment.
    pub position: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentEventType {
    Impression,
    Click,
    Conversion,
    Custom,
}

/// Append-only experiment interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentEvent {
    pub id: Uuid,
    pub experiment_id: Uuid,
    pub variant_id: Uuid,
    pub event_type: ExperimentEventType,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub value: Option<f64>,
    pub properties: PropertyBag,
    pub timestamp: DateTime<Utc>,
}

/// Event counts for one variant. Exposures are impressions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VariantAggregate {
    pub impressions: u64,
    pub clicks: u64,
    pub conversions: u64,
    pub custom_events: u64,
    pub total_value: f64,
}

impl VariantAggregate {
    pub fn record(&mut self, event: &ExperimentEvent) {
        match event.event_type {
            ExperimentEventType::Impression => self.impressions += 1,
            ExperimentEventType::Click => self.clicks += 1,
            ExperimentEventType::Conversion => {
                self.conversions += 1;
                self.total_value += event.value.unwrap_or(0.0);
            }
            ExperimentEventType::Custom => self.custom_events += 1,
        }
    }

    pub fn exposures(&self) -> u64 {
        self.impressions
    }
}

// ─── Attribution ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InteractionType {
    Impression,
    Click,
    Engagement,
    View,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Touchpoint {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub channel: String,
    pub interaction: InteractionType,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversion {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub touchpoints: Vec<Touchpoint>,
}

/// Per-channel touchpoint population for a campaign, including journeys
/// that never converted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelExposure {
    pub channel: String,
    pub touchpoints: u64,
    pub converting_touchpoints: u64,
}

/// Inclusive time window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> InsightResult<Self> {
        if start > end {
            return Err(InsightError::InvalidInput(format!(
                "date range start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// The `days` days ending at `now`.
    pub fn last_days(days: u32, now: DateTime<Utc>) -> Self {
        Self {
            start: now - Duration::days(days as i64),
            end: now,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }
}
