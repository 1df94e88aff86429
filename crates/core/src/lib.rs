//! Shared foundation for the decision analytics engines: domain types,
//! error taxonomy, configuration, event-store contracts and batch fan-out.

pub mod batch;
pub mod config;
pub mod error;
pub mod store;
pub mod types;

pub use config::AppConfig;
pub use error::{InsightError, InsightResult};
pub use store::{ConversionStore, ExperimentStore, InMemoryStore};
