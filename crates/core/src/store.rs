//! Event-store boundary: read/write contracts the engines consume, plus an
//! in-memory implementation backed by `DashMap`.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::error::{InsightError, InsightResult};
use crate::types::{
    ChannelExposure, Conversion, DateRange, Experiment, ExperimentEvent, VariantAggregate,
};

/// Persistence for experiment aggregates and their event streams. Every
/// read is scoped by organization; an experiment owned by another
/// organization is reported as absent.
pub trait ExperimentStore: Send + Sync {
    fn load_experiment(&self, org_id: &Uuid, experiment_id: &Uuid) -> InsightResult<Experiment>;

    fn list_experiments(&self, org_id: &Uuid) -> InsightResult<Vec<Experiment>>;

    /// Saves the aggregate (experiment plus variants) if the stored version
    /// still equals `experiment.version`, returning the persisted copy with
    /// its version bumped. A new experiment is saved with version 0.
    fn save_experiment(&self, experiment: &Experiment) -> InsightResult<Experiment>;

    fn delete_experiment(&self, org_id: &Uuid, experiment_id: &Uuid) -> InsightResult<()>;

    fn append_event(&self, event: &ExperimentEvent) -> InsightResult<()>;

    /// Event aggregates keyed by variant, optionally restricted to one variant.
    fn aggregate_events(
        &self,
        experiment_id: &Uuid,
        variant_id: Option<&Uuid>,
    ) -> InsightResult<HashMap<Uuid, VariantAggregate>>;

    fn load_events(&self, experiment_id: &Uuid) -> InsightResult<Vec<ExperimentEvent>>;
}

/// Read access to conversion journeys for attribution.
pub trait ConversionStore: Send + Sync {
    /// Conversions whose timestamp falls in `range`, each with its raw
    /// touchpoints.
    fn load_conversions(
        &self,
        org_id: &Uuid,
        campaign_id: &Uuid,
        range: &DateRange,
    ) -> InsightResult<Vec<Conversion>>;

    /// Per-channel touchpoint population, converting or not. An empty
    /// result means the statistics are unavailable.
    fn load_channel_exposure(
        &self,
        org_id: &Uuid,
        campaign_id: &Uuid,
        range: &DateRange,
    ) -> InsightResult<Vec<ChannelExposure>>;
}

impl<T: ExperimentStore + ?Sized> ExperimentStore for Arc<T> {
    fn load_experiment(&self, org_id: &Uuid, experiment_id: &Uuid) -> InsightResult<Experiment> {
        (**self).load_experiment(org_id, experiment_id)
    }
    fn list_experiments(&self, org_id: &Uuid) -> InsightResult<Vec<Experiment>> {
        (**self).list_experiments(org_id)
    }
    fn save_experiment(&self, experiment: &Experiment) -> InsightResult<Experiment> {
        (**self).save_experiment(experiment)
    }
    fn delete_experiment(&self, org_id: &Uuid, experiment_id: &Uuid) -> InsightResult<()> {
        (**self).delete_experiment(org_id, experiment_id)
    }
    fn append_event(&self, event: &ExperimentEvent) -> InsightResult<()> {
        (**self).append_event(event)
    }
    fn aggregate_events(
        &self,
        experiment_id: &Uuid,
        variant_id: Option<&Uuid>,
    ) -> InsightResult<HashMap<Uuid, VariantAggregate>> {
        (**self).aggregate_events(experiment_id, variant_id)
    }
    fn load_events(&self, experiment_id: &Uuid) -> InsightResult<Vec<ExperimentEvent>> {
        (**self).load_events(experiment_id)
    }
}

impl<T: ConversionStore + ?Sized> ConversionStore for Arc<T> {
    fn load_conversions(
        &self,
        org_id: &Uuid,
        campaign_id: &Uuid,
        range: &DateRange,
    ) -> InsightResult<Vec<Conversion>> {
        (**self).load_conversions(org_id, campaign_id, range)
    }
    fn load_channel_exposure(
        &self,
        org_id: &Uuid,
        campaign_id: &Uuid,
        range: &DateRange,
    ) -> InsightResult<Vec<ChannelExposure>> {
        (**self).load_channel_exposure(org_id, campaign_id, range)
    }
}

/// In-process store used by tests and single-node deployments.
pub struct InMemoryStore {
    experiments: DashMap<Uuid, Experiment>,
    events: DashMap<Uuid, Vec<ExperimentEvent>>,
    conversions: DashMap<(Uuid, Uuid), Vec<Conversion>>,
    exposure: DashMap<(Uuid, Uuid), Vec<ChannelExposure>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            experiments: DashMap::new(),
            events: DashMap::new(),
            conversions: DashMap::new(),
            exposure: DashMap::new(),
        }
    }

    pub fn insert_conversion(&self, org_id: Uuid, conversion: Conversion) {
        self.conversions
            .entry((org_id, conversion.campaign_id))
            .or_default()
            .push(conversion);
    }

    pub fn set_channel_exposure(
        &self,
        org_id: Uuid,
        campaign_id: Uuid,
        exposure: Vec<ChannelExposure>,
    ) {
        self.exposure.insert((org_id, campaign_id), exposure);
    }

    pub fn event_count(&self, experiment_id: &Uuid) -> usize {
        self.events.get(experiment_id).map(|e| e.len()).unwrap_or(0)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ExperimentStore for InMemoryStore {
    fn load_experiment(&self, org_id: &Uuid, experiment_id: &Uuid) -> InsightResult<Experiment> {
        self.experiments
            .get(experiment_id)
            .filter(|e| e.org_id == *org_id)
            .map(|e| e.clone())
            .ok_or_else(|| InsightError::NotFound(format!("experiment {experiment_id}")))
    }

    fn list_experiments(&self, org_id: &Uuid) -> InsightResult<Vec<Experiment>> {
        let mut list: Vec<Experiment> = self
            .experiments
            .iter()
            .filter(|e| e.org_id == *org_id)
            .map(|e| e.value().clone())
            .collect();
        list.sort_by_key(|e| e.created_at);
        Ok(list)
    }

    fn save_experiment(&self, experiment: &Experiment) -> InsightResult<Experiment> {
        match self.experiments.entry(experiment.id) {
            Entry::Occupied(mut slot) => {
                let stored = slot.get();
                if stored.org_id != experiment.org_id {
                    return Err(InsightError::NotFound(format!(
                        "experiment {}",
                        experiment.id
                    )));
                }
                if stored.version != experiment.version {
                    return Err(InsightError::Conflict(format!(
                        "experiment {} is at version {}, update was based on {}",
                        experiment.id, stored.version, experiment.version
                    )));
                }
                let mut saved = experiment.clone();
                saved.version += 1;
                slot.insert(saved.clone());
                debug!(experiment_id = %saved.id, version = saved.version, "Experiment saved");
                Ok(saved)
            }
            Entry::Vacant(slot) => {
                if experiment.version != 0 {
                    return Err(InsightError::NotFound(format!(
                        "experiment {}",
                        experiment.id
                    )));
                }
                let mut saved = experiment.clone();
                saved.version = 1;
                slot.insert(saved.clone());
                Ok(saved)
            }
        }
    }

    fn delete_experiment(&self, org_id: &Uuid, experiment_id: &Uuid) -> InsightResult<()> {
        self.experiments
            .remove_if(experiment_id, |_, e| e.org_id == *org_id)
            .ok_or_else(|| InsightError::NotFound(format!("experiment {experiment_id}")))?;
        self.events.remove(experiment_id);
        Ok(())
    }

    fn append_event(&self, event: &ExperimentEvent) -> InsightResult<()> {
        self.events
            .entry(event.experiment_id)
            .or_default()
            .push(event.clone());
        Ok(())
    }

    fn aggregate_events(
        &self,
        experiment_id: &Uuid,
        variant_id: Option<&Uuid>,
    ) -> InsightResult<HashMap<Uuid, VariantAggregate>> {
        let mut aggregates: HashMap<Uuid, VariantAggregate> = HashMap::new();
        if let Some(events) = self.events.get(experiment_id) {
            for event in events
                .iter()
                .filter(|e| variant_id.map_or(true, |v| e.variant_id == *v))
            {
                aggregates.entry(event.variant_id).or_default().record(event);
            }
        }
        Ok(aggregates)
    }

    fn load_events(&self, experiment_id: &Uuid) -> InsightResult<Vec<ExperimentEvent>> {
        Ok(self
            .events
            .get(experiment_id)
            .map(|e| e.clone())
            .unwrap_or_default())
    }
}

impl ConversionStore for InMemoryStore {
    fn load_conversions(
        &self,
        org_id: &Uuid,
        campaign_id: &Uuid,
        range: &DateRange,
    ) -> InsightResult<Vec<Conversion>> {
        Ok(self
            .conversions
            .get(&(*org_id, *campaign_id))
            .map(|list| {
                list.iter()
                    .filter(|c| range.contains(c.timestamp))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn load_channel_exposure(
        &self,
        org_id: &Uuid,
        campaign_id: &Uuid,
        _range: &DateRange,
    ) -> InsightResult<Vec<ChannelExposure>> {
        Ok(self
            .exposure
            .get(&(*org_id, *campaign_id))
            .map(|e| e.clone())
            .unwrap_or_default())
    }
}
