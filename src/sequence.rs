//! Граница с обучаемой последовательной моделью: ядро знает только `fit`, `predict`, `save`, `load`.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_BATCH_SIZE, DEFAULT_EPOCHS};
use crate::error::ModelError;
use crate::windowing::GroupCollection;

/// Параметры обучения, которые ядро передаёт модели, не интерпретируя их.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FitParams {
    pub epochs: u64,
    pub batch_size: usize,
    pub verbose: u8,
}

impl Default for FitParams {
    fn default() -> Self {
        Self {
            epochs: DEFAULT_EPOCHS,
            batch_size: DEFAULT_BATCH_SIZE,
            verbose: 0,
        }
    }
}

/// Итог обучения.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: u64,
    pub samples: usize,
    pub initial_loss: f64,
    pub final_loss: f64,
    pub finished_at: DateTime<Utc>,
}

/// `x` имеет форму `(1, windows, g)`, цель и прогноз — `(1, g)`.
pub trait SequenceModel {
    fn fit(
        &mut self,
        x: &GroupCollection,
        y: &[f64],
        params: FitParams,
    ) -> Result<TrainingHistory, ModelError>;

    fn predict(&self, x: &GroupCollection) -> Result<Vec<f64>, ModelError>;

    fn save(&self, path: &Path) -> Result<(), ModelError>;

    fn load(path: &Path) -> Result<Self, ModelError>
    where
        Self: Sized;
}
