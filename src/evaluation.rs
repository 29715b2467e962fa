//! Метрики ошибки прогноза: MSE, RMSE и MAPE.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::constants::round_decimals;
use crate::error::{ForecastError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Mse,
    Rmse,
    Mape,
}

impl Metric {
    pub const ALL: [Self; 3] = [Self::Mse, Self::Rmse, Self::Mape];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Mse => "mse",
            Self::Rmse => "rmse",
            Self::Mape => "mape",
        }
    }

    /// Неокруглённое значение метрики; `truth` — фактические значения.
    pub fn compute(self, truth: &[f64], predicted: &[f64]) -> Result<f64> {
        match self {
            Self::Mse => mse(truth, predicted),
            Self::Rmse => rmse(truth, predicted),
            Self::Mape => mape(truth, predicted),
        }
    }
}

/// Пространство, в котором сравниваются ряды.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricSpace {
    /// Значения в том виде, в каком их видит модель при обучении.
    Normalized,
    /// Значения, приведённые к цене через опорную точку.
    #[default]
    Denormalized,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricRequest {
    pub metric: Metric,
    #[serde(default)]
    pub space: MetricSpace,
}

impl MetricRequest {
    pub const fn new(metric: Metric, space: MetricSpace) -> Self {
        Self { metric, space }
    }

    /// Все метрики в денормализованном пространстве.
    pub fn defaults() -> Vec<Self> {
        Metric::ALL
            .into_iter()
            .map(|metric| Self::new(metric, MetricSpace::Denormalized))
            .collect()
    }
}

/// Имя метрики → значение, округлённое до двух знаков.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Evaluation(BTreeMap<Metric, f64>);

impl Evaluation {
    pub fn get(&self, metric: Metric) -> Option<f64> {
        self.0.get(&metric).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Metric, f64)> + '_ {
        self.0.iter().map(|(metric, value)| (*metric, *value))
    }

    pub(crate) fn record(&mut self, metric: Metric, value: f64) {
        self.0.insert(metric, round_decimals(value));
    }

    /// Добавляет уже округлённые значения другой оценки.
    pub(crate) fn merge(&mut self, other: Self) {
        self.0.extend(other.0);
    }
}

/// Считает запрошенные метрики по одной паре рядов.
pub fn evaluate(truth: &[f64], predicted: &[f64], metrics: &[Metric]) -> Result<Evaluation> {
    let mut evaluation = Evaluation::default();
    for metric in metrics {
        evaluation.record(*metric, metric.compute(truth, predicted)?);
    }
    Ok(evaluation)
}

pub fn mse(truth: &[f64], predicted: &[f64]) -> Result<f64> {
    check_pair(truth, predicted)?;
    let sum = truth
        .iter()
        .zip(predicted)
        .map(|(a, b)| (a - b) * (a - b))
        .sum::<f64>();
    Ok(sum / truth.len() as f64)
}

pub fn rmse(truth: &[f64], predicted: &[f64]) -> Result<f64> {
    mse(truth, predicted).map(f64::sqrt)
}

/// Ноль среди фактических значений — ошибка, а не бесконечность.
pub fn mape(truth: &[f64], predicted: &[f64]) -> Result<f64> {
    check_pair(truth, predicted)?;
    if let Some(index) = truth.iter().position(|value| *value == 0.0) {
        return Err(ForecastError::ZeroGroundTruth { index });
    }
    let sum = truth
        .iter()
        .zip(predicted)
        .map(|(a, b)| ((a - b) / a).abs())
        .sum::<f64>();
    Ok(sum / truth.len() as f64 * 100.0)
}

fn check_pair(truth: &[f64], predicted: &[f64]) -> Result<()> {
    if truth.is_empty() {
        return Err(ForecastError::EmptyInput);
    }
    if truth.len() != predicted.len() {
        return Err(ForecastError::LengthMismatch {
            expected: truth.len(),
            actual: predicted.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn mse_rounds_to_two_decimals() {
        let evaluation = evaluate(&[1.0, 2.0, 3.0], &[1.0, 2.0, 4.0], &[Metric::Mse]).unwrap();
        assert_eq!(evaluation.get(Metric::Mse), Some(0.33));
        assert_eq!(evaluation.get(Metric::Rmse), None);
    }

    #[test]
    fn all_metrics() {
        let truth = [10.0, 20.0, 40.0];
        let predicted = [12.0, 18.0, 44.0];
        let evaluation = evaluate(&truth, &predicted, &Metric::ALL).unwrap();
        // (4 + 4 + 16) / 3 = 8; (0.2 + 0.1 + 0.1) / 3 * 100 = 13.33
        assert_eq!(evaluation.get(Metric::Mse), Some(8.0));
        assert_eq!(evaluation.get(Metric::Rmse), Some(2.83));
        assert_eq!(evaluation.get(Metric::Mape), Some(13.33));
    }

    #[test]
    fn evaluation_is_idempotent() {
        let truth = [3.0, 1.5, 9.25];
        let predicted = [2.5, 1.0, 10.0];
        let first = evaluate(&truth, &predicted, &Metric::ALL).unwrap();
        let second = evaluate(&truth, &predicted, &Metric::ALL).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn mape_fails_on_zero_truth() {
        let err = mape(&[1.0, 0.0], &[1.0, 1.0]).unwrap_err();
        assert!(matches!(err, ForecastError::ZeroGroundTruth { index: 1 }));
    }

    #[test]
    fn mismatched_lengths_fail() {
        assert!(matches!(
            mse(&[1.0, 2.0], &[1.0]),
            Err(ForecastError::LengthMismatch {
                expected: 2,
                actual: 1
            })
        ));
        assert!(matches!(rmse(&[], &[]), Err(ForecastError::EmptyInput)));
    }

    #[test]
    fn serializes_with_metric_names() {
        let evaluation = evaluate(&[1.0, 2.0], &[1.0, 2.0], &[Metric::Rmse, Metric::Mse]).unwrap();
        let json = serde_json::to_string(&evaluation).unwrap();
        assert_eq!(json, r#"{"mse":0.0,"rmse":0.0}"#);
        assert_eq!(Metric::Mape.name(), "mape");
    }
}
