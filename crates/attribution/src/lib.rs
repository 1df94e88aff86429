//! Attribution engine: apportions conversion credit across marketing
//! touchpoints under six models and compares the models per campaign.

pub mod engine;
pub mod lift;
pub mod model;
pub mod path;

pub use engine::{
    AttributionEngine, AttributionInsights, AttributionReport, ChannelAttribution,
    ChannelInsight, ChannelModelRow, ChannelValuation, ModelComparison,
};
pub use lift::ChannelLift;
pub use model::{allocate, AttributionModel, CreditAllocation, ModelParams};
pub use path::AttributionPath;
