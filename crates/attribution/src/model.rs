//! Credit-apportionment models. Every model takes the same input (a path,
//! model parameters and optional channel lift) so callers can run all six
//! uniformly.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use insight_core::config::AttributionConfig;
use insight_core::InsightError;
use serde::{Deserialize, Serialize};

use crate::lift::ChannelLift;
use crate::path::AttributionPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionModel {
    LastClick,
    FirstClick,
    Linear,
    TimeDecay,
    PositionBased,
    /// Linear weights scaled by each channel's conversion-rate lift. An
    /// auditable approximation, not a trained model.
    DataDriven,
}

impl AttributionModel {
    pub const ALL: [AttributionModel; 6] = [
        AttributionModel::LastClick,
        AttributionModel::FirstClick,
        AttributionModel::Linear,
        AttributionModel::TimeDecay,
        AttributionModel::PositionBased,
        AttributionModel::DataDriven,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AttributionModel::LastClick => "last_click",
            AttributionModel::FirstClick => "first_click",
            AttributionModel::Linear => "linear",
            AttributionModel::TimeDecay => "time_decay",
            AttributionModel::PositionBased => "position_based",
            AttributionModel::DataDriven => "data_driven",
        }
    }
}

impl fmt::Display for AttributionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttributionModel {
    type Err = InsightError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AttributionModel::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| InsightError::InvalidInput(format!("unknown attribution model: {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub half_life_days: f64,
    pub first_weight: f64,
    pub last_weight: f64,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            half_life_days: 7.0,
            first_weight: 0.4,
            last_weight: 0.4,
        }
    }
}

impl From<&AttributionConfig> for ModelParams {
    fn from(config: &AttributionConfig) -> Self {
        Self {
            half_life_days: config.half_life_days,
            first_weight: config.first_weight,
            last_weight: config.last_weight,
        }
    }
}

/// Channel → credit fraction for one conversion. Fractions sum to 1.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreditAllocation {
    pub credits: BTreeMap<String, f64>,
    /// Set when the data-driven model had to fall back to linear.
    pub degraded: bool,
}

impl CreditAllocation {
    fn from_weights(path: &AttributionPath, weights: &[f64]) -> Self {
        let total: f64 = weights.iter().sum();
        let mut credits = BTreeMap::new();
        for (touchpoint, weight) in path.touchpoints.iter().zip(weights) {
            *credits.entry(touchpoint.channel.clone()).or_insert(0.0) += weight / total;
        }
        Self {
            credits,
            degraded: false,
        }
    }

    fn single(channel: &str) -> Self {
        Self {
            credits: BTreeMap::from([(channel.to_string(), 1.0)]),
            degraded: false,
        }
    }

    pub fn credit(&self, channel: &str) -> f64 {
        self.credits.get(channel).copied().unwrap_or(0.0)
    }

    pub fn total(&self) -> f64 {
        self.credits.values().sum()
    }
}

/// Splits one conversion's credit under `model`. Returns `None` for an
/// empty path: a conversion without touchpoints is unattributed, not
/// credited to nobody.
pub fn allocate(
    model: AttributionModel,
    path: &AttributionPath,
    params: &ModelParams,
    lift: Option<&ChannelLift>,
) -> Option<CreditAllocation> {
    let first = path.touchpoints.first()?;
    let last = path.touchpoints.last()?;
    let n = path.len();

    let allocation = match model {
        AttributionModel::LastClick => CreditAllocation::single(&last.channel),
        AttributionModel::FirstClick => CreditAllocation::single(&first.channel),
        AttributionModel::Linear => linear(path),
        AttributionModel::TimeDecay => {
            // Ages are taken relative to the youngest touchpoint so its
            // weight is exactly 1 and old paths cannot underflow.
            let ages: Vec<f64> = path.ages_in_days().map(|age| age.max(0.0)).collect();
            let youngest = ages.iter().copied().fold(f64::INFINITY, f64::min);
            let weights: Vec<f64> = ages
                .iter()
                .map(|age| (-(age - youngest) / params.half_life_days).exp2())
                .collect();
            let total: f64 = weights.iter().sum();
            if total.is_finite() && total > 0.0 {
                CreditAllocation::from_weights(path, &weights)
            } else {
                // Non-positive half-life.
                linear(path)
            }
        }
        AttributionModel::PositionBased => {
            let weights: Vec<f64> = match n {
                1 => vec![1.0],
                2 => vec![0.5, 0.5],
                _ => {
                    let middle =
                        (1.0 - params.first_weight - params.last_weight) / (n - 2) as f64;
                    (0..n)
                        .map(|i| match i {
                            0 => params.first_weight,
                            i if i == n - 1 => params.last_weight,
                            _ => middle,
                        })
                        .collect()
                }
            };
            if weights.iter().sum::<f64>() > 0.0 {
                CreditAllocation::from_weights(path, &weights)
            } else {
                linear(path)
            }
        }
        AttributionModel::DataDriven => data_driven(path, lift),
    };
    Some(allocation)
}

fn linear(path: &AttributionPath) -> CreditAllocation {
    let weights = vec![1.0; path.len()];
    CreditAllocation::from_weights(path, &weights)
}

/// Falls back to linear (flagged degraded) when lift is unavailable for
/// any channel on the path or the weighted path carries no credit.
fn data_driven(path: &AttributionPath, lift: Option<&ChannelLift>) -> CreditAllocation {
    let n = path.len() as f64;
    let weights: Option<Vec<f64>> = lift.and_then(|lift| {
        path.touchpoints
            .iter()
            .map(|t| lift.lift(&t.channel).map(|l| l / n))
            .collect()
    });

    match weights {
        Some(weights) if weights.iter().sum::<f64>() > 0.0 => {
            CreditAllocation::from_weights(path, &weights)
        }
        _ => CreditAllocation {
            degraded: true,
            ..linear(path)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use insight_core::types::{ChannelExposure, InteractionType, Touchpoint};
    use uuid::Uuid;

    fn touch(channel: &str, timestamp: DateTime<Utc>) -> Touchpoint {
        Touchpoint {
            id: Uuid::new_v4(),
            campaign_id: Uuid::nil(),
            channel: channel.to_string(),
            interaction: InteractionType::Click,
            timestamp,
        }
    }

    fn path(channels: &[(&str, i64)]) -> AttributionPath {
        let t = Utc::now();
        AttributionPath::new(
            t,
            channels
                .iter()
                .map(|(c, days_before)| touch(c, t - Duration::days(*days_before)))
                .collect(),
        )
    }

    fn lift(rows: &[(&str, u64, u64)]) -> ChannelLift {
        let exposure: Vec<ChannelExposure> = rows
            .iter()
            .map(|(c, n, conv)| ChannelExposure {
                channel: c.to_string(),
                touchpoints: *n,
                converting_touchpoints: *conv,
            })
            .collect();
        ChannelLift::from_exposure(&exposure).unwrap()
    }

    #[test]
    fn test_time_decay_halves_per_half_life() {
        let t = Utc::now();
        let p = AttributionPath::new(
            t,
            vec![
                touch("facebook", t - Duration::days(14)),
                touch("google", t - Duration::days(7)),
                touch("email", t),
            ],
        );
        let alloc = allocate(AttributionModel::TimeDecay, &p, &ModelParams::default(), None).unwrap();
        assert!((alloc.credit("facebook") - 0.1429).abs() < 1e-4);
        assert!((alloc.credit("google") - 0.2857).abs() < 1e-4);
        assert!((alloc.credit("email") - 0.5714).abs() < 1e-4);
        assert!((alloc.total() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_time_decay_on_very_old_path() {
        let t = Utc::now();
        let p = AttributionPath::new(
            t,
            vec![
                touch("print", t - Duration::days(20_007)),
                touch("radio", t - Duration::days(20_000)),
            ],
        );
        let alloc = allocate(AttributionModel::TimeDecay, &p, &ModelParams::default(), None).unwrap();
        assert!((alloc.credit("radio") - 2.0 / 3.0).abs() < 1e-9);
        assert!((alloc.credit("print") - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_every_model_sums_to_one() {
        let lift = lift(&[("search", 100, 10), ("social", 200, 5), ("email", 50, 10)]);
        let paths = [
            path(&[("search", 3)]),
            path(&[("search", 9), ("social", 4)]),
            path(&[("social", 20), ("email", 11), ("search", 2), ("email", 1)]),
            path(&[("email", 29), ("email", 10), ("email", 0)]),
        ];
        for p in &paths {
            for model in AttributionModel::ALL {
                let alloc = allocate(model, p, &ModelParams::default(), Some(&lift)).unwrap();
                assert!(
                    (alloc.total() - 1.0).abs() < 1e-9,
                    "{model} summed to {}",
                    alloc.total()
                );
                assert!(!alloc.degraded);
            }
        }
    }

    #[test]
    fn test_empty_path_has_no_allocation() {
        let p = AttributionPath::new(Utc::now(), vec![]);
        for model in AttributionModel::ALL {
            assert_eq!(allocate(model, &p, &ModelParams::default(), None), None);
        }
    }

    #[test]
    fn test_single_channel_collapses() {
        let p = path(&[("email", 6), ("email", 3), ("email", 1)]);
        for model in [
            AttributionModel::Linear,
            AttributionModel::FirstClick,
            AttributionModel::LastClick,
        ] {
            let alloc = allocate(model, &p, &ModelParams::default(), None).unwrap();
            assert_eq!(alloc.credits.len(), 1);
            assert!((alloc.credit("email") - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_position_based_short_paths() {
        let params = ModelParams::default();
        let one = allocate(AttributionModel::PositionBased, &path(&[("display", 2)]), &params, None)
            .unwrap();
        assert_eq!(one.credit("display"), 1.0);

        let two = allocate(
            AttributionModel::PositionBased,
            &path(&[("display", 2), ("search", 1)]),
            &params,
            None,
        )
        .unwrap();
        assert!((two.credit("display") - 0.5).abs() < 1e-12);
        assert!((two.credit("search") - 0.5).abs() < 1e-12);

        let same = allocate(
            AttributionModel::PositionBased,
            &path(&[("search", 2), ("search", 1)]),
            &params,
            None,
        )
        .unwrap();
        assert!((same.credit("search") - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_position_based_middle_split() {
        let p = path(&[("a", 5), ("b", 4), ("c", 3), ("d", 2)]);
        let alloc = allocate(AttributionModel::PositionBased, &p, &ModelParams::default(), None)
            .unwrap();
        assert!((alloc.credit("a") - 0.4).abs() < 1e-12);
        assert!((alloc.credit("b") - 0.1).abs() < 1e-12);
        assert!((alloc.credit("c") - 0.1).abs() < 1e-12);
        assert!((alloc.credit("d") - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_first_and_last_click() {
        let p = path(&[("social", 9), ("search", 4), ("email", 1)]);
        let params = ModelParams::default();
        let first = allocate(AttributionModel::FirstClick, &p, &params, None).unwrap();
        let last = allocate(AttributionModel::LastClick, &p, &params, None).unwrap();
        assert_eq!(first.credit("social"), 1.0);
        assert_eq!(last.credit("email"), 1.0);
    }

    #[test]
    fn test_data_driven_weights_by_lift() {
        // email converts at twice the campaign average, display at 2/3.
        let lift = lift(&[("email", 100, 20), ("display", 300, 20)]);
        let p = path(&[("display", 3), ("email", 1)]);
        let alloc = allocate(AttributionModel::DataDriven, &p, &ModelParams::default(), Some(&lift))
            .unwrap();
        assert!(!alloc.degraded);
        assert!((alloc.credit("email") - 0.75).abs() < 1e-9);
        assert!((alloc.credit("display") - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_data_driven_degrades_to_linear() {
        let p = path(&[("display", 3), ("email", 1)]);
        let params = ModelParams::default();

        let missing = allocate(AttributionModel::DataDriven, &p, &params, None).unwrap();
        assert!(missing.degraded);
        assert!((missing.credit("email") - 0.5).abs() < 1e-12);

        // Lift known for email only.
        let partial = lift(&[("email", 100, 20)]);
        let alloc = allocate(AttributionModel::DataDriven, &p, &params, Some(&partial)).unwrap();
        assert!(alloc.degraded);

        // Known but zero for every channel on the path.
        let zero = lift(&[("email", 100, 0), ("display", 100, 0), ("search", 10, 5)]);
        let alloc = allocate(AttributionModel::DataDriven, &p, &params, Some(&zero)).unwrap();
        assert!(alloc.degraded);
        assert!((alloc.total() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_model_names_round_trip() {
        for model in AttributionModel::ALL {
            assert_eq!(model.as_str().parse::<AttributionModel>().unwrap(), model);
            assert_eq!(
                serde_json::to_value(model).unwrap(),
                serde_json::Value::String(model.to_string())
            );
        }
        assert!("markov".parse::<AttributionModel>().is_err());
    }
}
