//! Experimentation engine: A/B/n lifecycle management, statistical
//! significance, automatic winner selection and experiment reporting.

pub mod manager;
pub mod reporting;
pub mod significance;
pub mod state_machine;

pub use manager::{
    EventPayload, ExperimentManager, ExperimentUpdate, NewExperiment, NewVariant, VariantUpdate,
};
pub use reporting::{
    ExperimentProgress, OrgExperimentStats, PerformanceSummary, Recommendation,
    RecommendationKind, RecommendationPriority, RecommendedAction, TimeSeriesPoint,
    VariantPerformance,
};
pub use significance::{
    determine_winner, evaluate_significance, SignificanceVerdict, VariantSignificance,
    WinnerSelection,
};
pub use state_machine::ExperimentStateMachine;
