//! Оконное прогнозирование цен: нормализация, нарезка на группы, опорная точка,
//! сборка прогноза и метрики ошибки поверх обучаемой последовательной модели.

pub mod config;
pub mod constants;
pub mod data;
pub mod error;
pub mod evaluation;
pub mod fetch;
pub mod forecast;
pub mod model;
pub mod normalization;
pub mod payload;
pub mod reference;
pub mod sequence;
pub mod series;
pub mod windowing;

pub use error::{ForecastError, ModelError, Result};
pub use evaluation::{Evaluation, Metric, MetricRequest, MetricSpace};
pub use forecast::{Forecast, Forecaster, PredictionRecord, PreparedSeries};
pub use model::{LinearModelConfig, LinearSequenceModel};
pub use reference::SeriesReference;
pub use sequence::{FitParams, SequenceModel, TrainingHistory};
pub use series::{CsvSource, DataSource, Series};
pub use windowing::{GroupCollection, SupervisedPair, WindowSettings};
