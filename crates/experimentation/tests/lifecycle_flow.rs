use std::sync::Arc;

use insight_core::types::{ExperimentEventType, ExperimentStatus, ExperimentType};
use insight_core::{AppConfig, InMemoryStore, InsightError};
use insight_experimentation::{
    EventPayload, ExperimentManager, NewExperiment, NewVariant, SignificanceVerdict,
};
use uuid::Uuid;

fn manager() -> Arc<ExperimentManager<InMemoryStore>> {
    Arc::new(ExperimentManager::new(
        Arc::new(InMemoryStore::new()),
        &AppConfig::default(),
    ))
}

fn record(
    manager: &ExperimentManager<InMemoryStore>,
    org: &Uuid,
    experiment: &Uuid,
    variant: &Uuid,
    event_type: ExperimentEventType,
    count: usize,
) {
    for _ in 0..count {
        manager
            .record_event(org, experiment, variant, event_type, EventPayload::default())
            .unwrap();
    }
}

/// Creates a running 50/50 experiment and returns (experiment, control, challenger).
fn running_ab(manager: &ExperimentManager<InMemoryStore>, org: &Uuid) -> (Uuid, Uuid, Uuid) {
    let exp = manager
        .create_experiment(
            org,
            NewExperiment::new("Landing page headline", ExperimentType::Content, "conversion_rate"),
        )
        .unwrap();
    let b = manager
        .add_variant(
            org,
            &exp.id,
            NewVariant {
                name: "Headline B".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
    manager.start(org, &exp.id).unwrap();
    let control = exp.control().unwrap().id;
    (exp.id, control, b.id)
}

#[test]
fn test_start_is_not_repeatable() {
    let manager = manager();
    let org = Uuid::new_v4();
    let (exp, _, _) = running_ab(&manager, &org);

    let err = manager.start(&org, &exp).unwrap_err();
    assert!(matches!(err, InsightError::InvalidState(_)));
    assert!(err.is_client_error());
    assert_eq!(
        manager.get_experiment(&org, &exp).unwrap().status,
        ExperimentStatus::Running
    );
}

#[test]
fn test_full_lifecycle_picks_challenger() {
    let manager = manager();
    let org = Uuid::new_v4();
    let (exp, control, b) = running_ab(&manager, &org);

    record(&manager, &org, &exp, &control, ExperimentEventType::Impression, 1000);
    record(&manager, &org, &exp, &control, ExperimentEventType::Conversion, 50);
    record(&manager, &org, &exp, &b, ExperimentEventType::Impression, 1000);
    record(&manager, &org, &exp, &b, ExperimentEventType::Conversion, 80);

    let significance = manager.get_significance(&org, &exp).unwrap();
    assert_eq!(significance.len(), 1);
    assert_eq!(significance[0].verdict, SignificanceVerdict::Significant);
    assert!(significance[0].p_value.unwrap() < 0.05);

    // Live leader before completion.
    assert_eq!(manager.get_winner(&org, &exp).unwrap().unwrap().id, b);

    let completed = manager.complete(&org, &exp).unwrap();
    assert_eq!(completed.status, ExperimentStatus::Completed);
    assert!(completed.ended_at.is_some());
    assert_eq!(completed.winner_variant_id, Some(b));
    assert!((completed.improvement_over_control.unwrap() - 60.0).abs() < 1e-9);

    // Completed experiments are closed to events and transitions.
    assert!(matches!(
        manager.record_event(&org, &exp, &b, ExperimentEventType::Click, EventPayload::default()),
        Err(InsightError::InvalidState(_))
    ));
    assert!(matches!(
        manager.complete(&org, &exp),
        Err(InsightError::InvalidState(_))
    ));

    let summary = manager.performance_summary(&org, &exp).unwrap();
    assert_eq!(summary.total_conversions, 130);
    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["status"], "completed");

    let stats = manager.org_stats(&org).unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.with_winner, 1);
}

#[test]
fn test_inconclusive_completion_has_no_winner() {
    let manager = manager();
    let org = Uuid::new_v4();
    let (exp, control, b) = running_ab(&manager, &org);

    record(&manager, &org, &exp, &control, ExperimentEventType::Impression, 300);
    record(&manager, &org, &exp, &b, ExperimentEventType::Impression, 300);
    record(&manager, &org, &exp, &b, ExperimentEventType::Conversion, 30);

    manager.pause(&org, &exp).unwrap();
    // Paused experiments still collect events.
    record(&manager, &org, &exp, &control, ExperimentEventType::Conversion, 1);

    let completed = manager.complete(&org, &exp).unwrap();
    assert_eq!(completed.winner_variant_id, None);
    assert_eq!(completed.improvement_over_control, None);
    assert!(manager.get_winner(&org, &exp).unwrap().is_none());
}

#[test]
fn test_other_org_cannot_see_experiment() {
    let manager = manager();
    let org = Uuid::new_v4();
    let (exp, _, _) = running_ab(&manager, &org);

    let intruder = Uuid::new_v4();
    assert!(matches!(
        manager.get_significance(&intruder, &exp),
        Err(InsightError::NotFound(_))
    ));
    assert!(matches!(
        manager.pause(&intruder, &exp),
        Err(InsightError::NotFound(_))
    ));
    assert_eq!(manager.org_stats(&intruder).unwrap().total, 0);
}

#[tokio::test]
async fn test_significance_batch_keeps_request_order() {
    let manager = manager();
    let org = Uuid::new_v4();
    let (first, _, _) = running_ab(&manager, &org);
    let (second, _, _) = running_ab(&manager, &org);
    let missing = Uuid::new_v4();

    let results = manager
        .significance_batch(org, vec![second, missing, first])
        .await;
    let ids: Vec<Uuid> = results.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, vec![second, missing, first]);
    assert!(results[0].1.is_ok());
    assert!(matches!(results[1].1, Err(InsightError::NotFound(_))));
    assert!(results[2].1.is_ok());
}
