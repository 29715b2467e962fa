use std::path::Path;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use cryptonic::normalization::point_relative_denormalize;
use cryptonic::windowing::{create_groups, split_supervised};
use cryptonic::{
    FitParams, ForecastError, Forecaster, GroupCollection, LinearModelConfig, LinearSequenceModel,
    Metric, MetricRequest, MetricSpace, ModelError, PreparedSeries, SequenceModel, Series,
    SeriesReference, TrainingHistory, WindowSettings,
};
use pretty_assertions::assert_eq;
use rstest::rstest;

/// Прогнозирует последнюю группу входа без изменений.
#[derive(Default)]
struct PersistenceModel {
    trained_on: Option<(usize, usize)>,
}

impl SequenceModel for PersistenceModel {
    fn fit(
        &mut self,
        x: &GroupCollection,
        y: &[f64],
        params: FitParams,
    ) -> Result<TrainingHistory, ModelError> {
        self.trained_on = Some((x.len(), y.len()));
        Ok(TrainingHistory {
            epochs: params.epochs,
            samples: x.len(),
            initial_loss: 0.0,
            final_loss: 0.0,
            finished_at: DateTime::<Utc>::UNIX_EPOCH,
        })
    }

    fn predict(&self, x: &GroupCollection) -> Result<Vec<f64>, ModelError> {
        Ok(x.last().ok_or("empty history")?.to_vec())
    }

    fn save(&self, _path: &Path) -> Result<(), ModelError> {
        Ok(())
    }

    fn load(_path: &Path) -> Result<Self, ModelError> {
        Ok(Self::default())
    }
}

fn first_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 6, 1).unwrap()
}

fn weekly(group_size: usize) -> WindowSettings {
    WindowSettings {
        group_size,
        ..WindowSettings::default()
    }
}

#[test]
fn single_week_normalizes_and_restores() {
    let series = [100.0, 110.0, 121.0, 90.0, 99.0, 108.9, 119.79];
    let groups = create_groups(&series, 7, 0, true).unwrap();
    assert_eq!(groups.shape(), (1, 1, 7));

    let expected = [0.0, 0.1, 0.21, -0.1, -0.01, 0.089, 0.1979];
    let normalized = groups.group(0).unwrap();
    for (value, expected) in normalized.iter().zip(expected) {
        assert!((value - expected).abs() < 1e-9);
    }

    let restored = point_relative_denormalize(normalized, 100.0);
    for (value, original) in restored.iter().zip(series) {
        assert!((value - original).abs() < 1e-9);
    }

    let pair = split_supervised(&groups).unwrap();
    assert!(pair.x.is_empty());
    assert_eq!(pair.y.len(), 7);
}

#[test]
fn fifteen_points_keep_two_weeks() {
    let series = Series::daily(first_day(), (0..15).map(|v| 50.0 + v as f64).collect()).unwrap();
    let prepared = PreparedSeries::build(series, weekly(7)).unwrap();

    assert_eq!(prepared.groups().len(), 2);
    assert_eq!(prepared.training_pair().x.shape(), (1, 1, 7));
    assert_eq!(
        prepared.reference(),
        &SeriesReference {
            value: 63.0,
            date: first_day() + Duration::days(13),
        }
    );
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(6)]
fn trailing_partial_group_is_discarded(#[case] extra: usize) {
    let values = (0..21 + extra).map(|v| 1.0 + v as f64).collect::<Vec<_>>();
    let groups = create_groups(&values, 7, 0, false).unwrap();
    assert_eq!(groups.len(), 3);
    assert_eq!(groups.last(), Some(&values[14..21]));
}

#[test]
fn training_and_forecast_through_stub_model() {
    let values = (0..30).map(|v| 100.0 + (v % 7) as f64).collect();
    let series = Series::daily(first_day(), values).unwrap();
    let prepared = PreparedSeries::build(series, weekly(7)).unwrap();
    let mut forecaster = Forecaster::new(PersistenceModel::default(), prepared);

    forecaster.train(None, FitParams::default()).unwrap();
    assert_eq!(forecaster.model().trained_on, Some((3, 7)));

    let records = forecaster.predict_records().unwrap();
    assert_eq!(records.len(), 7);
    // 28 точек в группах: опорная дата — индекс 27
    assert_eq!(records[0].date, first_day() + Duration::days(28));
    assert_eq!(records[6].date, first_day() + Duration::days(34));
    // повторяющийся недельный паттерн восстанавливается от опорного значения 106
    let predicted = records.iter().map(|record| record.value).collect::<Vec<_>>();
    assert_eq!(
        predicted,
        vec![106.0, 107.06, 108.12, 109.18, 110.24, 111.3, 112.36]
    );
}

#[test]
fn evaluation_is_repeatable_and_space_aware() {
    let values = (0..28).map(|v| 10.0 + v as f64).collect();
    let series = Series::daily(first_day(), values).unwrap();
    let settings = WindowSettings {
        holdout: 1,
        ..weekly(7)
    };
    let forecaster = Forecaster::new(
        PersistenceModel::default(),
        PreparedSeries::build(series, settings).unwrap(),
    );

    let requests = [
        MetricRequest::new(Metric::Mse, MetricSpace::Normalized),
        MetricRequest::new(Metric::Rmse, MetricSpace::Denormalized),
    ];
    let first = forecaster.evaluate(&requests).unwrap();
    let second = forecaster.evaluate(&requests).unwrap();
    assert_eq!(first, second);
    assert!(first.get(Metric::Mse).is_some());
    assert!(first.get(Metric::Mape).is_none());
}

#[test]
fn too_short_series_is_rejected() {
    let series = Series::daily(first_day(), vec![1.0; 13]).unwrap();
    let err = PreparedSeries::build(series, weekly(7)).unwrap_err();
    assert!(matches!(
        err,
        ForecastError::InsufficientData {
            required: 14,
            available: 13
        }
    ));
}

#[test]
fn linear_model_plugs_into_forecaster() {
    let values = (0..42).map(|v| 200.0 + ((v % 7) as f64) * 3.0).collect();
    let series = Series::daily(first_day(), values).unwrap();
    let prepared = PreparedSeries::build(series, weekly(7)).unwrap();
    let model = LinearSequenceModel::new(7, LinearModelConfig::default());
    let mut forecaster = Forecaster::new(model, prepared);

    let params = FitParams {
        epochs: 200,
        ..FitParams::default()
    };
    forecaster.train(None, params).unwrap();
    assert!(forecaster.last_trained().is_some());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.json.gz");
    forecaster.save(&path).unwrap();
    let restored = LinearSequenceModel::load(&path).unwrap();
    assert_eq!(restored.group_size(), 7);
    assert_eq!(
        restored.last_trained(),
        forecaster.model().last_trained()
    );

    let forecast = forecaster.predict_values().unwrap();
    assert_eq!(forecast.len(), 7);
    assert!(forecast.iter().all(|value| value.is_finite()));
}
