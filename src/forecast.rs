//! Прогноз: подготовленное состояние ряда, запуск модели, денормализация и привязка к датам.

use std::error::Error;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;

use crate::constants::{DATE_FORMAT, round_decimals};
use crate::error::{ForecastError, Result};
use crate::evaluation::{Evaluation, MetricRequest, MetricSpace, evaluate};
use crate::normalization::point_relative_denormalize;
use crate::reference::SeriesReference;
use crate::sequence::{FitParams, SequenceModel, TrainingHistory};
use crate::series::Series;
use crate::windowing::{GroupCollection, SupervisedPair, TrainingWindows, WindowSettings, prepare_training};

/// Ряд и всё, что из него выводится. Меняется только целиком через [`PreparedSeries::rebuild`].
#[derive(Clone, Debug)]
pub struct PreparedSeries {
    settings: WindowSettings,
    series: Series,
    windows: TrainingWindows,
    reference: SeriesReference,
}

impl PreparedSeries {
    pub fn build(series: Series, settings: WindowSettings) -> Result<Self> {
        let windows = prepare_training(series.values(), &settings)?;
        let reference = SeriesReference::track(&series, settings.group_size, settings.start)?;
        tracing::debug!(
            observations = series.len(),
            groups = windows.groups.len(),
            discarded = SeriesReference::remainder(&series, settings.group_size, settings.start),
            reference_date = %reference.date.format(DATE_FORMAT),
            reference_value = reference.value,
            "Prepared series"
        );
        Ok(Self {
            settings,
            series,
            windows,
            reference,
        })
    }

    /// Пересчитывает окна и опорную точку для нового ряда; при ошибке старое состояние не трогается.
    pub fn rebuild(&mut self, series: Series) -> Result<()> {
        *self = Self::build(series, self.settings)?;
        Ok(())
    }

    /// То же для новых параметров нарезки (например, другого holdout).
    pub fn reconfigure(&mut self, settings: WindowSettings) -> Result<()> {
        *self = Self::build(self.series.clone(), settings)?;
        Ok(())
    }

    pub const fn settings(&self) -> &WindowSettings {
        &self.settings
    }

    pub const fn series(&self) -> &Series {
        &self.series
    }

    pub const fn groups(&self) -> &GroupCollection {
        &self.windows.groups
    }

    pub const fn training_pair(&self) -> &SupervisedPair {
        &self.windows.pair
    }

    pub fn holdout_groups(&self) -> GroupCollection {
        self.windows.groups.slice(self.windows.holdout.clone())
    }

    pub const fn reference(&self) -> &SeriesReference {
        &self.reference
    }

    /// Вход для прогноза вперёд: последние группы того же числа, что и в обучающей истории.
    pub fn forecast_input(&self) -> GroupCollection {
        let total = self.windows.groups.len();
        let windows = self.windows.pair.x.len();
        self.windows.groups.slice(total - windows..total)
    }

    /// Приводит выход модели к цене через опорную точку; без нормализации ничего не меняет.
    pub fn denormalize(&self, values: &[f64]) -> Vec<f64> {
        self.denormalize_from(values, self.reference.value)
    }

    fn denormalize_from(&self, values: &[f64], anchor: f64) -> Vec<f64> {
        if self.settings.normalize {
            point_relative_denormalize(values, anchor)
        } else {
            values.to_vec()
        }
    }

    /// Сырые наблюдения группы `idx` в том виде, в каком они пришли из ряда.
    pub fn observed_group(&self, idx: usize) -> Option<&[f64]> {
        let group_size = self.settings.group_size;
        let offset = self.settings.start + idx * group_size;
        self.series.values().get(offset..offset + group_size)
    }

    /// Последнее сырое наблюдение перед группой `idx`: опорная точка для её прогноза.
    fn anchor_before(&self, idx: usize) -> Option<f64> {
        let offset = self.settings.start + idx * self.settings.group_size;
        self.series.values().get(offset.checked_sub(1)?).copied()
    }

    /// Оцениваемые группы: отложенные, а без них последняя группа обучающей пары.
    fn evaluation_targets(&self) -> Vec<EvaluationTarget<'_>> {
        let windows = self.windows.pair.x.len();
        let indices = if self.windows.holdout.is_empty() {
            windows..windows + 1
        } else {
            self.windows.holdout.clone()
        };
        indices
            .filter_map(|idx| {
                Some(EvaluationTarget {
                    input: self.windows.groups.slice(idx - windows..idx),
                    normalized: self.windows.groups.group(idx)?,
                    observed: self.observed_group(idx)?,
                    anchor: self.anchor_before(idx)?,
                })
            })
            .collect()
    }
}

struct EvaluationTarget<'a> {
    input: GroupCollection,
    normalized: &'a [f64],
    observed: &'a [f64],
    anchor: f64,
}

/// Одна точка прогноза.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PredictionRecord {
    pub date: NaiveDate,
    #[serde(rename = "prediction")]
    pub value: f64,
}

/// Денормализованный прогноз с датами; из него строятся оба вида вывода.
#[derive(Clone, Debug, PartialEq)]
pub struct Forecast {
    pub dates: Vec<NaiveDate>,
    pub values: Vec<f64>,
}

impl Forecast {
    fn assemble(reference: &SeriesReference, values: Vec<f64>) -> Self {
        let dates = (1..=values.len())
            .map(|step| reference.date + Duration::days(step as i64))
            .collect();
        Self { dates, values }
    }

    pub fn records(&self) -> Vec<PredictionRecord> {
        self.dates
            .iter()
            .zip(&self.values)
            .map(|(date, value)| PredictionRecord {
                date: *date,
                value: round_decimals(*value),
            })
            .collect()
    }

    pub fn into_values(self) -> Vec<f64> {
        self.values
    }
}

/// Модель вместе с подготовленным рядом.
pub struct Forecaster<M> {
    model: M,
    prepared: PreparedSeries,
    history: Option<TrainingHistory>,
}

impl<M: SequenceModel> Forecaster<M> {
    pub const fn new(model: M, prepared: PreparedSeries) -> Self {
        Self {
            model,
            prepared,
            history: None,
        }
    }

    /// Обучает модель; если передан новый ряд, сначала пересобирает состояние.
    pub fn train(&mut self, data: Option<Series>, params: FitParams) -> Result<&TrainingHistory> {
        if let Some(series) = data {
            self.prepared.rebuild(series)?;
        }
        let pair = self.prepared.training_pair();
        let history = self
            .model
            .fit(&pair.x, &pair.y, params)
            .map_err(ForecastError::Model)?;
        tracing::info!(
            epochs = history.epochs,
            samples = history.samples,
            final_loss = history.final_loss,
            "Sequence model trained"
        );
        Ok(self.history.insert(history))
    }

    pub fn forecast(&self) -> Result<Forecast> {
        let raw = self.run_model(&self.prepared.forecast_input())?;
        let values = self.prepared.denormalize(&raw);
        Ok(Forecast::assemble(self.prepared.reference(), values))
    }

    pub fn predict_records(&self) -> Result<Vec<PredictionRecord>> {
        self.forecast().map(|forecast| forecast.records())
    }

    pub fn predict_values(&self) -> Result<Vec<f64>> {
        self.forecast().map(Forecast::into_values)
    }

    /// Каждая метрика считается в том пространстве, которое указано в запросе.
    /// В ценовом пространстве факт — наблюдённые цены, прогноз привязан к наблюдению перед группой.
    pub fn evaluate(&self, requests: &[MetricRequest]) -> Result<Evaluation> {
        let targets = self.prepared.evaluation_targets();
        if targets.is_empty() {
            return Err(ForecastError::EmptyInput);
        }
        let mut normalized = (Vec::new(), Vec::new());
        let mut prices = (Vec::new(), Vec::new());
        for target in targets {
            let predicted = self.run_model(&target.input)?;
            prices
                .1
                .extend(self.prepared.denormalize_from(&predicted, target.anchor));
            prices.0.extend_from_slice(target.observed);
            normalized.0.extend_from_slice(target.normalized);
            normalized.1.extend(predicted);
        }

        let mut evaluation = Evaluation::default();
        for (space, (truth, predicted)) in [
            (MetricSpace::Normalized, &normalized),
            (MetricSpace::Denormalized, &prices),
        ] {
            let metrics = requests
                .iter()
                .filter(|request| request.space == space)
                .map(|request| request.metric)
                .collect::<Vec<_>>();
            if !metrics.is_empty() {
                evaluation.merge(evaluate(truth, predicted, &metrics)?);
            }
        }
        Ok(evaluation)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.model.save(path).map_err(ForecastError::Model)
    }

    pub const fn model(&self) -> &M {
        &self.model
    }

    pub const fn prepared(&self) -> &PreparedSeries {
        &self.prepared
    }

    pub fn last_trained(&self) -> Option<DateTime<Utc>> {
        self.history.as_ref().map(|history| history.finished_at)
    }

    fn run_model(&self, input: &GroupCollection) -> Result<Vec<f64>> {
        let output = self.model.predict(input).map_err(ForecastError::Model)?;
        let group_size = self.prepared.settings().group_size;
        if output.len() != group_size {
            return Err(ForecastError::InvalidModelOutput(format!(
                "expected {group_size} values, got {}",
                output.len()
            )));
        }
        if let Some(step) = output.iter().position(|value| !value.is_finite()) {
            return Err(ForecastError::InvalidModelOutput(format!(
                "value at step {step} is not finite"
            )));
        }
        Ok(output)
    }
}

/// Сохраняет прогноз в CSV `date,prediction`.
pub fn write_forecast_csv(forecast: &Forecast, output_path: &Path) -> std::result::Result<(), Box<dyn Error>> {
    if let Some(parent) = output_path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let mut writer = csv::Writer::from_path(output_path)?;
    writer.write_record(["date", "prediction"])?;
    for (date, value) in forecast.dates.iter().zip(&forecast.values) {
        writer.write_record([date.format(DATE_FORMAT).to_string(), format!("{value:.6}")])?;
    }
    writer.flush()?;
    Ok(())
}
