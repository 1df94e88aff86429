//! Experiment lifecycle manager: owns the Experiment/Variant aggregate,
//! validates transitions and persists computed outcomes.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use insight_core::batch::fan_out;
use insight_core::config::{AppConfig, ExperimentationConfig, StoreConfig};
use insight_core::store::ExperimentStore;
use insight_core::types::{
    Experiment, ExperimentEvent, ExperimentEventType, ExperimentStatus, ExperimentType,
    ExperimentVariant, PropertyBag, TrafficAllocation, VariantStatus,
};
use insight_core::{InsightError, InsightResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::reporting::{
    self, ExperimentProgress, OrgExperimentStats, PerformanceSummary, Recommendation,
    TimeSeriesPoint,
};
use crate::significance::{determine_winner, evaluate_significance, VariantSignificance};
use crate::state_machine::ExperimentStateMachine;

const MAX_NAME_LEN: usize = 255;
const MAX_VARIANT_NAME_LEN: usize = 100;
const MAX_HYPOTHESIS_LEN: usize = 500;
const MIN_SAMPLE_SIZE: u64 = 100;

// ─── Requests ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewExperiment {
    pub name: String,
    pub description: Option<String>,
    pub experiment_type: ExperimentType,
    pub entity_type: Option<String>,
    pub entity_id: Option<Uuid>,
    pub metric: String,
    #[serde(default)]
    pub metrics: Vec<String>,
    pub hypothesis: Option<String>,
    pub duration_days: Option<u32>,
    pub sample_size_per_variant: Option<u64>,
    pub confidence_level: Option<f64>,
    pub minimum_detectable_effect: Option<f64>,
    pub traffic_allocation: Option<TrafficAllocation>,
    #[serde(default)]
    pub control_config: PropertyBag,
}

impl NewExperiment {
    pub fn new(name: &str, experiment_type: ExperimentType, metric: &str) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            experiment_type,
            entity_type: None,
            entity_id: None,
            metric: metric.to_string(),
            metrics: Vec::new(),
            hypothesis: None,
            duration_days: None,
            sample_size_per_variant: None,
            confidence_level: None,
            minimum_detectable_effect: None,
            traffic_allocation: None,
            control_config: PropertyBag::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub hypothesis: Option<String>,
    pub duration_days: Option<u32>,
    pub sample_size_per_variant: Option<u64>,
    pub confidence_level: Option<f64>,
    pub minimum_detectable_effect: Option<f64>,
    pub traffic_allocation: Option<TrafficAllocation>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewVariant {
    pub name: String,
    pub description: Option<String>,
    /// Ignored under the `equal` policy, which rebalances automatically.
    pub traffic_percentage: Option<f64>,
    #[serde(default)]
    pub config: PropertyBag,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariantUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub traffic_percentage: Option<f64>,
    pub config: Option<PropertyBag>,
    pub status: Option<VariantStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventPayload {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub value: Option<f64>,
    #[serde(default)]
    pub properties: PropertyBag,
}

// ─── Validation ─────────────────────────────────────────────────────────

fn invalid(msg: impl Into<String>) -> InsightError {
    InsightError::InvalidInput(msg.into())
}

fn validate_name(name: &str, max: usize, what: &str) -> InsightResult<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.chars().count() > max {
        return Err(invalid(format!("{what} must be 1-{max} characters")));
    }
    Ok(())
}

fn validate_traffic(pct: f64) -> InsightResult<()> {
    if !(0.0..=100.0).contains(&pct) {
        return Err(invalid(format!(
            "traffic percentage must be within 0-100, got {pct}"
        )));
    }
    Ok(())
}

fn validate_settings(experiment: &Experiment, max_duration_days: u32) -> InsightResult<()> {
    validate_name(&experiment.name, MAX_NAME_LEN, "experiment name")?;
    if experiment.metric.trim().is_empty() {
        return Err(invalid("metric is required"));
    }
    if let Some(h) = &experiment.hypothesis {
        if h.chars().count() > MAX_HYPOTHESIS_LEN {
            return Err(invalid(format!(
                "hypothesis exceeds {MAX_HYPOTHESIS_LEN} characters"
            )));
        }
    }
    if experiment.duration_days == 0 || experiment.duration_days > max_duration_days {
        return Err(invalid(format!(
            "duration_days must be within 1-{max_duration_days}, got {}",
            experiment.duration_days
        )));
    }
    if experiment.sample_size_per_variant < MIN_SAMPLE_SIZE {
        return Err(invalid(format!(
            "sample_size_per_variant must be at least {MIN_SAMPLE_SIZE}"
        )));
    }
    if !(90.0..=99.9).contains(&experiment.confidence_level) {
        return Err(invalid(format!(
            "confidence_level must be within 90-99.9, got {}",
            experiment.confidence_level
        )));
    }
    if !(1.0..=50.0).contains(&experiment.minimum_detectable_effect) {
        return Err(invalid(format!(
            "minimum_detectable_effect must be within 1-50, got {}",
            experiment.minimum_detectable_effect
        )));
    }
    Ok(())
}

/// Splits 100% equally across active variants; the control absorbs the
/// rounding remainder.
fn rebalance_equal(experiment: &mut Experiment) {
    let active = experiment.active_variants().count();
    if active == 0 {
        return;
    }
    let share = (100.0 / active as f64 * 100.0).floor() / 100.0;
    let remainder = 100.0 - share * active as f64;
    for variant in experiment.variants.iter_mut() {
        variant.traffic_percentage = match variant.status {
            VariantStatus::Active if variant.is_control => share + remainder,
            VariantStatus::Active => share,
            _ => 0.0,
        };
    }
}

// ─── Manager ────────────────────────────────────────────────────────────

/// Drives experiments through `draft → running ⇄ paused → completed`.
/// Mutations of one experiment are serialized in-process and guarded by
/// the store's version check across processes.
pub struct ExperimentManager<S: ExperimentStore> {
    store: Arc<S>,
    config: ExperimentationConfig,
    store_config: StoreConfig,
    state_machine: ExperimentStateMachine,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl<S: ExperimentStore> ExperimentManager<S> {
    pub fn new(store: Arc<S>, config: &AppConfig) -> Self {
        info!("Experiment manager initialized");
        Self {
            store,
            config: config.experimentation.clone(),
            store_config: config.store.clone(),
            state_machine: ExperimentStateMachine::new(),
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, experiment_id: &Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(*experiment_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Loads, applies `op` to a copy and saves it only if `op` succeeds.
    fn mutate<F>(&self, org_id: &Uuid, experiment_id: &Uuid, op: F) -> InsightResult<Experiment>
    where
        F: FnOnce(&mut Experiment) -> InsightResult<()>,
    {
        let lock = self.lock_for(experiment_id);
        let _guard = lock.lock();

        let mut experiment = self.store.load_experiment(org_id, experiment_id)?;
        op(&mut experiment)?;
        experiment.updated_at = Utc::now();
        self.store.save_experiment(&experiment)
    }

    fn transition(
        &self,
        experiment: &mut Experiment,
        to: ExperimentStatus,
    ) -> InsightResult<()> {
        if let Err(e) = self.state_machine.check(experiment.status, to) {
            warn!(
                experiment_id = %experiment.id,
                from = ?experiment.status,
                to = ?to,
                "Rejected experiment transition"
            );
            return Err(e);
        }
        experiment.status = to;
        Ok(())
    }

    // ── Definition ─────────────────────────────────────────────────────

    pub fn create_experiment(
        &self,
        org_id: &Uuid,
        request: NewExperiment,
    ) -> InsightResult<Experiment> {
        request.control_config.validate()?;
        let now = Utc::now();
        let id = Uuid::new_v4();
        let control = ExperimentVariant {
            id: Uuid::new_v4(),
            experiment_id: id,
            name: "Control".to_string(),
            description: None,
            is_control: true,
            traffic_percentage: 100.0,
            config: request.control_config,
            status: VariantStatus::Active,
            position: 0,
            created_at: now,
        };
        let experiment = Experiment {
            id,
            org_id: *org_id,
            name: request.name.trim().to_string(),
            description: request.description,
            experiment_type: request.experiment_type,
            entity_type: request.entity_type,
            entity_id: request.entity_id,
            metric: request.metric,
            metrics: request.metrics,
            hypothesis: request.hypothesis,
            duration_days: request
                .duration_days
                .unwrap_or(self.config.default_duration_days),
            sample_size_per_variant: request
                .sample_size_per_variant
                .unwrap_or(self.config.default_sample_size_per_variant),
            confidence_level: request
                .confidence_level
                .unwrap_or(self.config.default_confidence_level),
            minimum_detectable_effect: request.minimum_detectable_effect.unwrap_or(5.0),
            traffic_allocation: request.traffic_allocation.unwrap_or_default(),
            status: ExperimentStatus::Draft,
            started_at: None,
            ended_at: None,
            winner_variant_id: None,
            improvement_over_control: None,
            variants: vec![control],
            version: 0,
            created_at: now,
            updated_at: now,
        };
        validate_settings(&experiment, self.config.max_duration_days)?;

        let saved = self.store.save_experiment(&experiment)?;
        info!(
            experiment_id = %saved.id,
            org_id = %org_id,
            experiment_type = ?saved.experiment_type,
            "Experiment created"
        );
        Ok(saved)
    }

    pub fn get_experiment(&self, org_id: &Uuid, experiment_id: &Uuid) -> InsightResult<Experiment> {
        self.store.load_experiment(org_id, experiment_id)
    }

    pub fn update_experiment(
        &self,
        org_id: &Uuid,
        experiment_id: &Uuid,
        update: ExperimentUpdate,
    ) -> InsightResult<Experiment> {
        let max_duration = self.config.max_duration_days;
        let state_machine = &self.state_machine;
        self.mutate(org_id, experiment_id, |exp| {
            if !state_machine.can_edit_settings(exp.status) {
                return Err(InsightError::InvalidState(format!(
                    "Can only update draft experiments, experiment is {:?}",
                    exp.status
                )));
            }
            if let Some(name) = update.name {
                exp.name = name.trim().to_string();
            }
            if let Some(description) = update.description {
                exp.description = Some(description);
            }
            if let Some(hypothesis) = update.hypothesis {
                exp.hypothesis = Some(hypothesis);
            }
            if let Some(days) = update.duration_days {
                exp.duration_days = days;
            }
            if let Some(sample) = update.sample_size_per_variant {
                exp.sample_size_per_variant = sample;
            }
            if let Some(level) = update.confidence_level {
                exp.confidence_level = level;
            }
            if let Some(mde) = update.minimum_detectable_effect {
                exp.minimum_detectable_effect = mde;
            }
            if let Some(policy) = update.traffic_allocation {
                exp.traffic_allocation = policy;
                if policy == TrafficAllocation::Equal {
                    rebalance_equal(exp);
                }
            }
            validate_settings(exp, max_duration)
        })
    }

    pub fn delete_experiment(&self, org_id: &Uuid, experiment_id: &Uuid) -> InsightResult<()> {
        let lock = self.lock_for(experiment_id);
        let _guard = lock.lock();

        let experiment = self.store.load_experiment(org_id, experiment_id)?;
        if !self.state_machine.can_delete(experiment.status) {
            return Err(InsightError::InvalidState(
                "Cannot delete running experiment. Pause or complete it first.".to_string(),
            ));
        }
        self.store.delete_experiment(org_id, experiment_id)?;
        drop(_guard);
        self.locks.remove(experiment_id);
        info!(experiment_id = %experiment_id, "Experiment deleted");
        Ok(())
    }

    pub fn add_variant(
        &self,
        org_id: &Uuid,
        experiment_id: &Uuid,
        request: NewVariant,
    ) -> InsightResult<ExperimentVariant> {
        validate_name(&request.name, MAX_VARIANT_NAME_LEN, "variant name")?;
        request.config.validate()?;
        if let Some(pct) = request.traffic_percentage {
            validate_traffic(pct)?;
        }

        let tolerance = self.config.traffic_tolerance;
        let state_machine = &self.state_machine;
        let variant_id = Uuid::new_v4();
        let saved = self.mutate(org_id, experiment_id, |exp| {
            if !state_machine.can_edit_variants(exp.status) {
                return Err(InsightError::InvalidState(format!(
                    "Variants can only be added while draft or paused, experiment is {:?}",
                    exp.status
                )));
            }
            let position = exp.variants.iter().map(|v| v.position + 1).max().unwrap_or(0);
            exp.variants.push(ExperimentVariant {
                id: variant_id,
                experiment_id: exp.id,
                name: request.name.trim().to_string(),
                description: request.description,
                is_control: false,
                traffic_percentage: request.traffic_percentage.unwrap_or(0.0),
                config: request.config,
                status: VariantStatus::Active,
                position,
                created_at: Utc::now(),
            });
            if exp.traffic_allocation == TrafficAllocation::Equal {
                rebalance_equal(exp);
            }
            check_live_traffic(exp, tolerance)
        })?;

        debug!(experiment_id = %experiment_id, variant_id = %variant_id, "Variant added");
        saved
            .variant(&variant_id)
            .cloned()
            .ok_or_else(|| InsightError::NotFound(format!("variant {variant_id}")))
    }

    pub fn update_variant(
        &self,
        org_id: &Uuid,
        experiment_id: &Uuid,
        variant_id: &Uuid,
        update: VariantUpdate,
    ) -> InsightResult<ExperimentVariant> {
        if let Some(name) = &update.name {
            validate_name(name, MAX_VARIANT_NAME_LEN, "variant name")?;
        }
        if let Some(config) = &update.config {
            config.validate()?;
        }
        if let Some(pct) = update.traffic_percentage {
            validate_traffic(pct)?;
        }

        let tolerance = self.config.traffic_tolerance;
        let state_machine = &self.state_machine;
        let saved = self.mutate(org_id, experiment_id, |exp| {
            if !state_machine.can_edit_variants(exp.status) {
                return Err(InsightError::InvalidState(format!(
                    "Variants can only be updated while draft or paused, experiment is {:?}",
                    exp.status
                )));
            }
            let policy = exp.traffic_allocation;
            let variant = exp
                .variants
                .iter_mut()
                .find(|v| v.id == *variant_id)
                .ok_or_else(|| InsightError::NotFound(format!("variant {variant_id}")))?;

            if let Some(status) = update.status {
                if variant.is_control && status != VariantStatus::Active {
                    return Err(invalid("the control variant cannot be paused or stopped"));
                }
                variant.status = status;
            }
            if let Some(name) = update.name {
                variant.name = name.trim().to_string();
            }
            if let Some(description) = update.description {
                variant.description = Some(description);
            }
            if let Some(config) = update.config {
                variant.config = config;
            }
            if let Some(pct) = update.traffic_percentage {
                variant.traffic_percentage = pct;
            }
            if policy == TrafficAllocation::Equal {
                rebalance_equal(exp);
            }
            check_live_traffic(exp, tolerance)
        })?;

        saved
            .variant(variant_id)
            .cloned()
            .ok_or_else(|| InsightError::NotFound(format!("variant {variant_id}")))
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    pub fn start(&self, org_id: &Uuid, experiment_id: &Uuid) -> InsightResult<Experiment> {
        let tolerance = self.config.traffic_tolerance;
        let saved = self.mutate(org_id, experiment_id, |exp| {
            self.state_machine
                .check(exp.status, ExperimentStatus::Running)
                .map_err(|e| {
                    warn!(experiment_id = %exp.id, status = ?exp.status, "Start rejected");
                    e
                })?;
            check_launch_ready(exp, tolerance)?;
            exp.status = ExperimentStatus::Running;
            exp.started_at = Some(Utc::now());
            Ok(())
        })?;
        info!(experiment_id = %saved.id, variants = saved.variants.len(), "Experiment started");
        Ok(saved)
    }

    pub fn pause(&self, org_id: &Uuid, experiment_id: &Uuid) -> InsightResult<Experiment> {
        let saved = self.mutate(org_id, experiment_id, |exp| {
            self.transition(exp, ExperimentStatus::Paused)
        })?;
        info!(experiment_id = %saved.id, "Experiment paused");
        Ok(saved)
    }

    pub fn resume(&self, org_id: &Uuid, experiment_id: &Uuid) -> InsightResult<Experiment> {
        let tolerance = self.config.traffic_tolerance;
        let saved = self.mutate(org_id, experiment_id, |exp| {
            self.transition(exp, ExperimentStatus::Running)?;
            check_launch_ready(exp, tolerance)
        })?;
        info!(experiment_id = %saved.id, "Experiment resumed");
        Ok(saved)
    }

    /// Evaluates significance, records the winner (if any) and closes the
    /// experiment. Completing without a winner is an inconclusive result.
    pub fn complete(&self, org_id: &Uuid, experiment_id: &Uuid) -> InsightResult<Experiment> {
        self.complete_with_winner(org_id, experiment_id, None)
    }

    /// Closes the experiment with `winner` as the recorded winning variant,
    /// or the automatically selected one when `winner` is `None`. The
    /// recorded improvement is the chosen variant's lift over control
    /// (0 for the control itself, unset when the lift is undefined).
    pub fn complete_with_winner(
        &self,
        org_id: &Uuid,
        experiment_id: &Uuid,
        winner: Option<Uuid>,
    ) -> InsightResult<Experiment> {
        let saved = self.mutate(org_id, experiment_id, |exp| {
            self.state_machine
                .check(exp.status, ExperimentStatus::Completed)?;
            if let Some(variant_id) = winner {
                if exp.variant(&variant_id).is_none() {
                    return Err(InsightError::NotFound(format!(
                        "variant {variant_id} in experiment {}",
                        exp.id
                    )));
                }
            }
            let aggregates = self.store.aggregate_events(&exp.id, None)?;
            let significance = evaluate_significance(exp, &aggregates)?;

            let (winner_variant_id, improvement) = match winner {
                Some(variant_id) => {
                    let improvement = match exp.variant(&variant_id) {
                        Some(v) if v.is_control => Some(0.0),
                        _ => significance
                            .iter()
                            .find(|s| s.variant_id == variant_id)
                            .and_then(|s| s.lift_pct),
                    };
                    (Some(variant_id), improvement)
                }
                None => {
                    let selected = determine_winner(&significance);
                    (
                        selected.map(|w| w.variant_id),
                        selected.map(|w| w.lift_pct),
                    )
                }
            };

            exp.status = ExperimentStatus::Completed;
            exp.ended_at = Some(Utc::now());
            exp.winner_variant_id = winner_variant_id;
            exp.improvement_over_control = improvement;
            Ok(())
        })?;
        // Nothing but deletion mutates a completed experiment.
        self.locks.remove(experiment_id);

        match saved.winner_variant_id {
            Some(winner_id) => info!(
                experiment_id = %saved.id,
                winner_variant_id = %winner_id,
                chosen = winner.is_some(),
                improvement = saved.improvement_over_control.unwrap_or_default(),
                "Experiment completed with winner"
            ),
            None => info!(experiment_id = %saved.id, "Experiment completed inconclusive"),
        }
        Ok(saved)
    }

    /// Adds days to a live or paused experiment.
    pub fn extend(
        &self,
        org_id: &Uuid,
        experiment_id: &Uuid,
        additional_days: u32,
    ) -> InsightResult<Experiment> {
        if additional_days == 0 {
            return Err(invalid("additional_days must be positive"));
        }
        let max_duration = self.config.max_duration_days;
        let saved = self.mutate(org_id, experiment_id, |exp| {
            if !matches!(exp.status, ExperimentStatus::Running | ExperimentStatus::Paused) {
                return Err(InsightError::InvalidState(format!(
                    "Only running or paused experiments can be extended, experiment is {:?}",
                    exp.status
                )));
            }
            let extended = exp.duration_days.saturating_add(additional_days);
            if extended > max_duration {
                return Err(invalid(format!(
                    "extended duration {extended} exceeds {max_duration} days"
                )));
            }
            exp.duration_days = extended;
            Ok(())
        })?;
        info!(experiment_id = %saved.id, duration_days = saved.duration_days, "Experiment extended");
        Ok(saved)
    }

    // ── Events ─────────────────────────────────────────────────────────

    /// Appends an event. Not idempotent: a resubmitted event counts twice,
    /// so callers must not retry this automatically. Holds the experiment
    /// lock so an event never lands after a concurrent complete or delete.
    pub fn record_event(
        &self,
        org_id: &Uuid,
        experiment_id: &Uuid,
        variant_id: &Uuid,
        event_type: ExperimentEventType,
        payload: EventPayload,
    ) -> InsightResult<ExperimentEvent> {
        if let Some(value) = payload.value {
            if !value.is_finite() {
                return Err(invalid("event value must be a finite number"));
            }
        }
        payload.properties.validate()?;

        let lock = self.lock_for(experiment_id);
        let _guard = lock.lock();

        let experiment = self.store.load_experiment(org_id, experiment_id)?;
        if experiment.variant(variant_id).is_none() {
            return Err(InsightError::NotFound(format!(
                "variant {variant_id} in experiment {experiment_id}"
            )));
        }
        if !self.state_machine.accepts_events(experiment.status) {
            if experiment.status == ExperimentStatus::Completed {
                self.locks.remove(experiment_id);
            }
            return Err(InsightError::InvalidState(format!(
                "experiment is {:?} and does not accept events",
                experiment.status
            )));
        }

        let event = ExperimentEvent {
            id: Uuid::new_v4(),
            experiment_id: *experiment_id,
            variant_id: *variant_id,
            event_type,
            user_id: payload.user_id,
            session_id: payload.session_id,
            value: payload.value,
            properties: payload.properties,
            timestamp: Utc::now(),
        };
        self.store.append_event(&event)?;
        debug!(
            experiment_id = %experiment_id,
            variant_id = %variant_id,
            event_type = ?event_type,
            "Experiment event recorded"
        );
        Ok(event)
    }

    // ── Analysis ───────────────────────────────────────────────────────

    pub fn calculate_statistical_significance(
        &self,
        experiment: &Experiment,
    ) -> InsightResult<Vec<VariantSignificance>> {
        let aggregates = self.store.aggregate_events(&experiment.id, None)?;
        evaluate_significance(experiment, &aggregates)
    }

    pub fn get_significance(
        &self,
        org_id: &Uuid,
        experiment_id: &Uuid,
    ) -> InsightResult<Vec<VariantSignificance>> {
        let experiment = self.store.load_experiment(org_id, experiment_id)?;
        self.calculate_statistical_significance(&experiment)
    }

    pub fn determine_winner(&self, experiment: &Experiment) -> InsightResult<Option<ExperimentVariant>> {
        let significance = self.calculate_statistical_significance(experiment)?;
        Ok(determine_winner(&significance)
            .and_then(|w| experiment.variant(&w.variant_id))
            .cloned())
    }

    /// The recorded winner of a completed experiment, or the current
    /// leader otherwise.
    pub fn get_winner(
        &self,
        org_id: &Uuid,
        experiment_id: &Uuid,
    ) -> InsightResult<Option<ExperimentVariant>> {
        let experiment = self.store.load_experiment(org_id, experiment_id)?;
        if experiment.status == ExperimentStatus::Completed {
            return Ok(experiment
                .winner_variant_id
                .and_then(|id| experiment.variant(&id))
                .cloned());
        }
        self.determine_winner(&experiment)
    }

    pub fn performance_summary(
        &self,
        org_id: &Uuid,
        experiment_id: &Uuid,
    ) -> InsightResult<PerformanceSummary> {
        let experiment = self.store.load_experiment(org_id, experiment_id)?;
        let aggregates = self.store.aggregate_events(experiment_id, None)?;
        Ok(reporting::performance_summary(&experiment, &aggregates))
    }

    pub fn time_series(
        &self,
        org_id: &Uuid,
        experiment_id: &Uuid,
    ) -> InsightResult<Vec<TimeSeriesPoint>> {
        self.store.load_experiment(org_id, experiment_id)?;
        let events = self.store.load_events(experiment_id)?;
        Ok(reporting::time_series(&events))
    }

    pub fn progress(&self, org_id: &Uuid, experiment_id: &Uuid) -> InsightResult<ExperimentProgress> {
        let experiment = self.store.load_experiment(org_id, experiment_id)?;
        let aggregates = self.store.aggregate_events(experiment_id, None)?;
        Ok(reporting::progress(&experiment, &aggregates, Utc::now()))
    }

    pub fn recommendations(
        &self,
        org_id: &Uuid,
        experiment_id: &Uuid,
    ) -> InsightResult<Vec<Recommendation>> {
        let experiment = self.store.load_experiment(org_id, experiment_id)?;
        let aggregates = self.store.aggregate_events(experiment_id, None)?;
        let significance = evaluate_significance(&experiment, &aggregates)?;
        let progress = reporting::progress(&experiment, &aggregates, Utc::now());
        Ok(reporting::recommendations(
            &experiment,
            &significance,
            &progress,
            self.config.recommendation_power_pct,
        ))
    }

    pub fn org_stats(&self, org_id: &Uuid) -> InsightResult<OrgExperimentStats> {
        let experiments = self.store.list_experiments(org_id)?;
        Ok(reporting::org_stats(&experiments))
    }
}

impl<S: ExperimentStore + 'static> ExperimentManager<S> {
    /// Computes significance for many experiments concurrently, each read
    /// bounded by the store timeout.
    pub async fn significance_batch(
        self: &Arc<Self>,
        org_id: Uuid,
        experiment_ids: Vec<Uuid>,
    ) -> Vec<(Uuid, InsightResult<Vec<VariantSignificance>>)> {
        let manager = Arc::clone(self);
        let settings = self.store_config.clone();
        fan_out(experiment_ids, &settings, move |id| {
            manager.get_significance(&org_id, &id)
        })
        .await
    }
}

/// Structural checks required before traffic flows: two or more active
/// variants, exactly one active control, split summing to 100.
fn check_launch_ready(experiment: &Experiment, tolerance: f64) -> InsightResult<()> {
    let active = experiment.active_variants().count();
    if active < 2 {
        return Err(invalid(format!(
            "experiment needs at least 2 active variants, has {active}"
        )));
    }
    let controls = experiment.variants.iter().filter(|v| v.is_control).count();
    if controls != 1 {
        return Err(invalid(format!(
            "experiment needs exactly one control variant, has {controls}"
        )));
    }
    if experiment.active_variants().all(|v| !v.is_control) {
        return Err(invalid("the control variant is not active"));
    }
    check_traffic_sum(experiment, tolerance)
}

fn check_traffic_sum(experiment: &Experiment, tolerance: f64) -> InsightResult<()> {
    let total = experiment.active_traffic_total();
    if (total - 100.0).abs() > tolerance {
        return Err(invalid(format!(
            "traffic percentages of active variants sum to {total}, expected 100"
        )));
    }
    Ok(())
}

/// Outside draft the active split must stay at 100%.
fn check_live_traffic(experiment: &Experiment, tolerance: f64) -> InsightResult<()> {
    if experiment.status == ExperimentStatus::Draft {
        return Ok(());
    }
    check_traffic_sum(experiment, tolerance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use insight_core::types::PropertyValue;
    use insight_core::InMemoryStore;

    fn setup() -> (ExperimentManager<InMemoryStore>, Arc<InMemoryStore>, Uuid) {
        let store = Arc::new(InMemoryStore::new());
        let manager = ExperimentManager::new(store.clone(), &AppConfig::default());
        (manager, store, Uuid::new_v4())
    }

    fn two_arm(manager: &ExperimentManager<InMemoryStore>, org: &Uuid) -> Experiment {
        let exp = manager
            .create_experiment(
                org,
                NewExperiment::new("Hero banner", ExperimentType::Content, "conversion_rate"),
            )
            .unwrap();
        manager
            .add_variant(
                org,
                &exp.id,
                NewVariant {
                    name: "Variant B".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();
        manager.get_experiment(org, &exp.id).unwrap()
    }

    #[test]
    fn test_create_defaults_and_control() {
        let (manager, _, org) = setup();
        let exp = manager
            .create_experiment(
                &org,
                NewExperiment::new("Pricing page", ExperimentType::Campaign, "conversion_rate"),
            )
            .unwrap();
        assert_eq!(exp.status, ExperimentStatus::Draft);
        assert_eq!(exp.variants.len(), 1);
        assert!(exp.variants[0].is_control);
        assert_eq!(exp.duration_days, 14);
        assert_eq!(exp.sample_size_per_variant, 1000);
        assert!((exp.confidence_level - 95.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_create_rejects_bad_settings() {
        let (manager, _, org) = setup();
        let mut request = NewExperiment::new("Bad", ExperimentType::Budget, "roas");
        request.confidence_level = Some(85.0);
        assert!(matches!(
            manager.create_experiment(&org, request),
            Err(InsightError::InvalidInput(_))
        ));

        let mut request = NewExperiment::new("Bad", ExperimentType::Budget, "roas");
        request.sample_size_per_variant = Some(50);
        assert!(manager.create_experiment(&org, request).is_err());

        let mut request = NewExperiment::new("  ", ExperimentType::Budget, "roas");
        request.duration_days = Some(10);
        assert!(manager.create_experiment(&org, request).is_err());
    }

    #[test]
    fn test_equal_policy_rebalances_on_add() {
        let (manager, _, org) = setup();
        let exp = two_arm(&manager, &org);
        assert!(exp.variants.iter().all(|v| (v.traffic_percentage - 50.0).abs() < 1e-9));

        manager
            .add_variant(
                &org,
                &exp.id,
                NewVariant {
                    name: "Variant C".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();
        let exp = manager.get_experiment(&org, &exp.id).unwrap();
        assert!((exp.active_traffic_total() - 100.0).abs() < 1e-9);
        assert!((exp.variants[1].traffic_percentage - 33.33).abs() < 1e-9);
        assert_eq!(exp.variants[2].position, 2);
    }

    #[test]
    fn test_start_twice_is_invalid_state() {
        let (manager, _, org) = setup();
        let exp = two_arm(&manager, &org);

        let started = manager.start(&org, &exp.id).unwrap();
        assert_eq!(started.status, ExperimentStatus::Running);
        assert!(started.started_at.is_some());

        assert!(matches!(
            manager.start(&org, &exp.id),
            Err(InsightError::InvalidState(_))
        ));
    }

    #[test]
    fn test_start_requires_two_variants() {
        let (manager, _, org) = setup();
        let exp = manager
            .create_experiment(
                &org,
                NewExperiment::new("Solo", ExperimentType::Audience, "ctr"),
            )
            .unwrap();
        assert!(matches!(
            manager.start(&org, &exp.id),
            Err(InsightError::InvalidInput(_))
        ));
        // Nothing was persisted by the failed start.
        let unchanged = manager.get_experiment(&org, &exp.id).unwrap();
        assert_eq!(unchanged.status, ExperimentStatus::Draft);
        assert_eq!(unchanged.version, exp.version);
    }

    #[test]
    fn test_weighted_split_must_sum_to_100() {
        let (manager, _, org) = setup();
        let mut request = NewExperiment::new("Weighted", ExperimentType::Content, "ctr");
        request.traffic_allocation = Some(TrafficAllocation::Weighted);
        let exp = manager.create_experiment(&org, request).unwrap();
        let control = exp.variants[0].id;

        manager
            .update_variant(
                &org,
                &exp.id,
                &control,
                VariantUpdate {
                    traffic_percentage: Some(70.0),
                    ..Default::default()
                },
            )
            .unwrap();
        manager
            .add_variant(
                &org,
                &exp.id,
                NewVariant {
                    name: "B".to_string(),
                    traffic_percentage: Some(20.0),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(matches!(
            manager.start(&org, &exp.id),
            Err(InsightError::InvalidInput(_))
        ));

        manager
            .update_variant(
                &org,
                &exp.id,
                &control,
                VariantUpdate {
                    traffic_percentage: Some(80.0),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(manager.start(&org, &exp.id).is_ok());
    }

    #[test]
    fn test_pause_resume_rules() {
        let (manager, _, org) = setup();
        let exp = two_arm(&manager, &org);

        assert!(matches!(
            manager.pause(&org, &exp.id),
            Err(InsightError::InvalidState(_))
        ));
        manager.start(&org, &exp.id).unwrap();
        assert!(matches!(
            manager.resume(&org, &exp.id),
            Err(InsightError::InvalidState(_))
        ));
        assert_eq!(
            manager.pause(&org, &exp.id).unwrap().status,
            ExperimentStatus::Paused
        );
        assert_eq!(
            manager.resume(&org, &exp.id).unwrap().status,
            ExperimentStatus::Running
        );
    }

    #[test]
    fn test_update_only_in_draft() {
        let (manager, _, org) = setup();
        let exp = two_arm(&manager, &org);
        let updated = manager
            .update_experiment(
                &org,
                &exp.id,
                ExperimentUpdate {
                    confidence_level: Some(99.0),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!((updated.confidence_level - 99.0).abs() < f64::EPSILON);

        manager.start(&org, &exp.id).unwrap();
        assert!(matches!(
            manager.update_experiment(&org, &exp.id, ExperimentUpdate::default()),
            Err(InsightError::InvalidState(_))
        ));
    }

    #[test]
    fn test_variant_edits_blocked_while_running() {
        let (manager, _, org) = setup();
        let exp = two_arm(&manager, &org);
        manager.start(&org, &exp.id).unwrap();

        let request = NewVariant {
            name: "Late".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            manager.add_variant(&org, &exp.id, request.clone()),
            Err(InsightError::InvalidState(_))
        ));

        manager.pause(&org, &exp.id).unwrap();
        let added = manager.add_variant(&org, &exp.id, request).unwrap();
        assert!(!added.is_control);
        let exp = manager.get_experiment(&org, &exp.id).unwrap();
        assert!((exp.active_traffic_total() - 100.0).abs() < 0.01);
    }

    #[test]
    fn test_control_cannot_be_stopped() {
        let (manager, _, org) = setup();
        let exp = two_arm(&manager, &org);
        let control = exp.control().unwrap().id;
        assert!(matches!(
            manager.update_variant(
                &org,
                &exp.id,
                &control,
                VariantUpdate {
                    status: Some(VariantStatus::Stopped),
                    ..Default::default()
                },
            ),
            Err(InsightError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_delete_rules() {
        let (manager, store, org) = setup();
        let exp = two_arm(&manager, &org);
        manager.start(&org, &exp.id).unwrap();
        assert!(matches!(
            manager.delete_experiment(&org, &exp.id),
            Err(InsightError::InvalidState(_))
        ));

        manager.pause(&org, &exp.id).unwrap();
        manager.delete_experiment(&org, &exp.id).unwrap();
        assert!(matches!(
            store.load_experiment(&org, &exp.id),
            Err(InsightError::NotFound(_))
        ));
    }

    #[test]
    fn test_record_event_validation() {
        let (manager, store, org) = setup();
        let exp = two_arm(&manager, &org);
        let variant = exp.variants[1].id;

        // Draft experiments do not collect events.
        assert!(matches!(
            manager.record_event(&org, &exp.id, &variant, ExperimentEventType::Impression, EventPayload::default()),
            Err(InsightError::InvalidState(_))
        ));

        manager.start(&org, &exp.id).unwrap();
        assert!(matches!(
            manager.record_event(&org, &exp.id, &Uuid::new_v4(), ExperimentEventType::Click, EventPayload::default()),
            Err(InsightError::NotFound(_))
        ));
        assert!(matches!(
            manager.record_event(&Uuid::new_v4(), &exp.id, &variant, ExperimentEventType::Click, EventPayload::default()),
            Err(InsightError::NotFound(_))
        ));

        let payload = EventPayload {
            value: Some(19.99),
            properties: PropertyBag::new().with("sku", PropertyValue::Text("A-100".into())),
            ..Default::default()
        };
        let event = manager
            .record_event(&org, &exp.id, &variant, ExperimentEventType::Conversion, payload.clone())
            .unwrap();
        assert_eq!(event.variant_id, variant);

        // Duplicate submissions are counted twice.
        manager
            .record_event(&org, &exp.id, &variant, ExperimentEventType::Conversion, payload)
            .unwrap();
        assert_eq!(store.event_count(&exp.id), 2);
    }

    #[test]
    fn test_extend_caps_duration() {
        let (manager, _, org) = setup();
        let exp = two_arm(&manager, &org);
        assert!(matches!(
            manager.extend(&org, &exp.id, 7),
            Err(InsightError::InvalidState(_))
        ));
        manager.start(&org, &exp.id).unwrap();
        assert_eq!(manager.extend(&org, &exp.id, 7).unwrap().duration_days, 21);
        assert!(matches!(
            manager.extend(&org, &exp.id, 80),
            Err(InsightError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_concurrent_complete_picks_one_outcome() {
        let (manager, _, org) = setup();
        let exp = two_arm(&manager, &org);
        manager.start(&org, &exp.id).unwrap();

        let outcomes: Vec<InsightResult<Experiment>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| s.spawn(|| manager.complete(&org, &exp.id)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let completed = outcomes.iter().filter(|o| o.is_ok()).count();
        assert_eq!(completed, 1);
        assert!(outcomes
            .iter()
            .filter_map(|o| o.as_ref().err())
            .all(|e| matches!(e, InsightError::InvalidState(_))));
    }

    fn record_n(
        manager: &ExperimentManager<InMemoryStore>,
        org: &Uuid,
        exp: &Experiment,
        variant: &Uuid,
        event_type: ExperimentEventType,
        n: usize,
    ) {
        for _ in 0..n {
            manager
                .record_event(org, &exp.id, variant, event_type, EventPayload::default())
                .unwrap();
        }
    }

    #[test]
    fn test_complete_with_chosen_winner() {
        let (manager, _, org) = setup();
        let exp = two_arm(&manager, &org);
        let (control, challenger) = (exp.variants[0].id, exp.variants[1].id);
        manager.start(&org, &exp.id).unwrap();
        record_n(&manager, &org, &exp, &control, ExperimentEventType::Impression, 10);
        record_n(&manager, &org, &exp, &control, ExperimentEventType::Conversion, 1);
        record_n(&manager, &org, &exp, &challenger, ExperimentEventType::Impression, 10);
        record_n(&manager, &org, &exp, &challenger, ExperimentEventType::Conversion, 2);

        // Far below the sample threshold, so no automatic winner exists.
        assert!(manager.determine_winner(&exp).unwrap().is_none());

        let err = manager
            .complete_with_winner(&org, &exp.id, Some(Uuid::new_v4()))
            .unwrap_err();
        assert!(matches!(err, InsightError::NotFound(_)));
        assert_eq!(
            manager.get_experiment(&org, &exp.id).unwrap().status,
            ExperimentStatus::Running
        );

        let done = manager
            .complete_with_winner(&org, &exp.id, Some(challenger))
            .unwrap();
        assert_eq!(done.status, ExperimentStatus::Completed);
        assert_eq!(done.winner_variant_id, Some(challenger));
        assert!((done.improvement_over_control.unwrap() - 100.0).abs() < 1e-9);
        assert_eq!(manager.get_winner(&org, &exp.id).unwrap().unwrap().id, challenger);
    }

    #[test]
    fn test_complete_with_control_as_winner() {
        let (manager, _, org) = setup();
        let exp = two_arm(&manager, &org);
        let control = exp.variants[0].id;
        manager.start(&org, &exp.id).unwrap();

        let done = manager
            .complete_with_winner(&org, &exp.id, Some(control))
            .unwrap();
        assert_eq!(done.winner_variant_id, Some(control));
        assert_eq!(done.improvement_over_control, Some(0.0));
    }

    #[test]
    fn test_events_never_land_after_complete() {
        let (manager, store, org) = setup();
        let exp = two_arm(&manager, &org);
        let variant = exp.variants[1].id;
        manager.start(&org, &exp.id).unwrap();

        let (recorded, completed) = std::thread::scope(|s| {
            let writers: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        (0..50)
                            .filter_map(|_| {
                                manager
                                    .record_event(
                                        &org,
                                        &exp.id,
                                        &variant,
                                        ExperimentEventType::Impression,
                                        EventPayload::default(),
                                    )
                                    .ok()
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            let completed = manager.complete(&org, &exp.id).unwrap();
            let recorded: Vec<ExperimentEvent> = writers
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect();
            (recorded, completed)
        });

        let ended_at = completed.ended_at.unwrap();
        assert_eq!(store.event_count(&exp.id), recorded.len());
        assert!(recorded.iter().all(|e| e.timestamp <= ended_at));
        assert!(matches!(
            manager.record_event(&org, &exp.id, &variant, ExperimentEventType::Click, EventPayload::default()),
            Err(InsightError::InvalidState(_))
        ));
        assert!(manager.locks.get(&exp.id).is_none());
    }
}
