//! Statistics kernel: pure, deterministic proportion tests, confidence
//! intervals and sample-size estimates for experiment evaluation.

pub mod normal;
pub mod power;
pub mod proportion;

pub use normal::{inverse_normal_cdf, normal_cdf, two_sided_p_value, z_critical};
pub use power::required_sample_size;
pub use proportion::{
    confidence_interval, relative_lift, two_proportion_z_test, two_proportion_z_test_at,
    ConfidenceInterval, ZTestResult,
};
