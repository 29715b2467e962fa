//! Обучаемая линейная модель перехода между группами: `следующая = W · текущая + b`.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use argmin::core::{CostFunction, Error as ArgminError, Executor, Gradient, State};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::sequence::{FitParams, SequenceModel, TrainingHistory};
use crate::windowing::{GroupCollection, WindowSettings};

const DEFAULT_HISTORY: usize = 10;
const DEFAULT_RIDGE: f64 = 1e-3;
const DEFAULT_TOL_GRAD: f64 = 1e-8;
const DEFAULT_TOL_COST: f64 = 1e-10;
const LARGE_COST: f64 = 1e30;
const BLOB_FORMAT: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinearModelConfig {
    /// Штраф L2 на веса перехода (смещение не штрафуется).
    pub ridge: f64,
    /// Глубина памяти L-BFGS.
    pub history: usize,
}

impl Default for LinearModelConfig {
    fn default() -> Self {
        Self {
            ridge: DEFAULT_RIDGE,
            history: DEFAULT_HISTORY,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LinearSequenceModel {
    group_size: usize,
    config: LinearModelConfig,
    /// `group_size²` весов по строкам, затем `group_size` смещений.
    params: Vec<f64>,
    /// Обучалась ли модель на нормализованных группах.
    normalize: bool,
    history: Option<TrainingHistory>,
}

/// Содержимое файла модели (gzip + JSON).
#[derive(Debug, Serialize, Deserialize)]
struct ModelBlob {
    format: u32,
    group_size: usize,
    config: LinearModelConfig,
    params: Vec<f64>,
    #[serde(default = "default_normalize")]
    normalize: bool,
    history: Option<TrainingHistory>,
}

const fn default_normalize() -> bool {
    true
}

impl LinearSequenceModel {
    /// Необученная модель: нулевые веса, прогноз «без изменений» в нормализованном пространстве.
    pub fn new(group_size: usize, config: LinearModelConfig) -> Self {
        Self {
            group_size,
            config,
            params: vec![0.0; param_len(group_size)],
            normalize: true,
            history: None,
        }
    }

    #[must_use]
    pub const fn with_normalize(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    pub const fn normalize(&self) -> bool {
        self.normalize
    }

    /// Модель применима только к окнам той же длины и той же нормализации, на которых обучалась.
    pub fn check_settings(&self, settings: &WindowSettings) -> Result<(), String> {
        if self.group_size != settings.group_size {
            return Err(format!(
                "model was trained for period length {}, configured {}",
                self.group_size, settings.group_size
            ));
        }
        if self.normalize != settings.normalize {
            return Err(format!(
                "model was trained with normalize = {}, configured {}",
                self.normalize, settings.normalize
            ));
        }
        Ok(())
    }

    pub const fn group_size(&self) -> usize {
        self.group_size
    }

    pub const fn config(&self) -> &LinearModelConfig {
        &self.config
    }

    pub const fn history(&self) -> Option<&TrainingHistory> {
        self.history.as_ref()
    }

    pub fn last_trained(&self) -> Option<DateTime<Utc>> {
        self.history.as_ref().map(|history| history.finished_at)
    }

    fn check_group_size(&self, x: &GroupCollection) -> Result<(), ModelError> {
        if x.group_size() != self.group_size {
            return Err(format!(
                "model expects groups of {}, got {}",
                self.group_size,
                x.group_size()
            )
            .into());
        }
        Ok(())
    }
}

impl SequenceModel for LinearSequenceModel {
    fn fit(
        &mut self,
        x: &GroupCollection,
        y: &[f64],
        params: FitParams,
    ) -> Result<TrainingHistory, ModelError> {
        self.check_group_size(x)?;
        if x.is_empty() {
            return Err("cannot fit on an empty history".into());
        }
        if y.len() != self.group_size {
            return Err(format!("target must have {} values, got {}", self.group_size, y.len()).into());
        }
        if params.epochs == 0 {
            return Err("epochs must be positive".into());
        }

        let problem = TransitionProblem::new(x, y, self.config.ridge);
        let samples = problem.samples();
        let init = self.params.clone();
        let initial_loss = problem.cost(&init)?;

        let linesearch = MoreThuenteLineSearch::new().with_c(1e-4, 0.9)?;
        let solver = LBFGS::new(linesearch, self.config.history.max(1))
            .with_tolerance_grad(DEFAULT_TOL_GRAD)?
            .with_tolerance_cost(DEFAULT_TOL_COST)?;
        let result = Executor::new(problem, solver)
            .configure(|state| state.param(init).max_iters(params.epochs))
            .run()?;

        let fitted = result
            .state
            .get_param()
            .ok_or("no parameters returned from optimizer")?
            .clone();
        if fitted.iter().any(|value| !value.is_finite()) {
            return Err("optimizer produced non-finite weights".into());
        }
        self.params = fitted;

        let history = TrainingHistory {
            epochs: result.state.get_iter(),
            samples,
            initial_loss,
            final_loss: result.state.get_cost(),
            finished_at: Utc::now(),
        };
        if params.verbose > 0 {
            tracing::info!(
                epochs = history.epochs,
                max_epochs = params.epochs,
                batch_size = params.batch_size,
                samples,
                initial_loss,
                final_loss = history.final_loss,
                "Linear sequence model fitted"
            );
        }
        self.history = Some(history.clone());
        Ok(history)
    }

    fn predict(&self, x: &GroupCollection) -> Result<Vec<f64>, ModelError> {
        self.check_group_size(x)?;
        let last = x.last().ok_or("cannot predict from an empty history")?;
        Ok(apply(&self.params, self.group_size, last))
    }

    fn save(&self, path: &Path) -> Result<(), ModelError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let blob = ModelBlob {
            format: BLOB_FORMAT,
            group_size: self.group_size,
            config: self.config,
            params: self.params.clone(),
            normalize: self.normalize,
            history: self.history.clone(),
        };
        let file = File::create(path)?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        serde_json::to_writer(&mut encoder, &blob)?;
        encoder.finish()?.flush()?;
        Ok(())
    }

    fn load(path: &Path) -> Result<Self, ModelError> {
        let file = File::open(path)
            .map_err(|err| format!("Failed to open model {}: {err}", path.display()))?;
        let blob: ModelBlob = serde_json::from_reader(GzDecoder::new(BufReader::new(file)))?;
        if blob.format != BLOB_FORMAT {
            return Err(format!("unsupported model format {}", blob.format).into());
        }
        if blob.group_size == 0 || blob.params.len() != param_len(blob.group_size) {
            return Err(format!(
                "model {} is corrupted: {} parameters for group size {}",
                path.display(),
                blob.params.len(),
                blob.group_size
            )
            .into());
        }
        Ok(Self {
            group_size: blob.group_size,
            config: blob.config,
            params: blob.params,
            normalize: blob.normalize,
            history: blob.history,
        })
    }
}

const fn param_len(group_size: usize) -> usize {
    group_size * group_size + group_size
}

fn apply(params: &[f64], group_size: usize, input: &[f64]) -> Vec<f64> {
    let (weights, bias) = params.split_at(group_size * group_size);
    weights
        .chunks_exact(group_size)
        .zip(bias)
        .map(|(row, b)| row.iter().zip(input).fold(*b, |acc, (w, v)| w.mul_add(*v, acc)))
        .collect()
}

/// Все соседние пары групп истории плюс переход от последней группы к цели.
#[derive(Clone)]
struct TransitionProblem {
    inputs: Vec<Vec<f64>>,
    targets: Vec<Vec<f64>>,
    group_size: usize,
    ridge: f64,
}

impl TransitionProblem {
    fn new(x: &GroupCollection, y: &[f64], ridge: f64) -> Self {
        let inputs: Vec<Vec<f64>> = x.groups().map(<[f64]>::to_vec).collect();
        let targets = inputs
            .iter()
            .skip(1)
            .cloned()
            .chain(std::iter::once(y.to_vec()))
            .collect();
        Self {
            inputs,
            targets,
            group_size: x.group_size(),
            ridge: ridge.max(0.0),
        }
    }

    fn samples(&self) -> usize {
        self.inputs.len()
    }

    fn scale(&self) -> f64 {
        (self.inputs.len() * self.group_size) as f64
    }
}

impl CostFunction for TransitionProblem {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> Result<Self::Output, ArgminError> {
        if param.len() != param_len(self.group_size) {
            return Ok(LARGE_COST);
        }
        let mut sse = 0.0;
        for (input, target) in self.inputs.iter().zip(&self.targets) {
            for (pred, actual) in apply(param, self.group_size, input).iter().zip(target) {
                let diff = pred - actual;
                sse += diff * diff;
            }
        }
        let penalty = param[..self.group_size * self.group_size]
            .iter()
            .map(|w| w * w)
            .sum::<f64>();
        Ok(self.ridge.mul_add(penalty, sse / self.scale()))
    }
}

impl Gradient for TransitionProblem {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, param: &Self::Param) -> Result<Self::Gradient, ArgminError> {
        let g = self.group_size;
        if param.len() != param_len(g) {
            return Ok(vec![0.0; param.len()]);
        }
        let mut grad = vec![0.0; param.len()];
        let factor = 2.0 / self.scale();
        for (input, target) in self.inputs.iter().zip(&self.targets) {
            let pred = apply(param, g, input);
            for (row, (p, t)) in pred.iter().zip(target).enumerate() {
                let residual = factor * (p - t);
                for (col, value) in input.iter().enumerate() {
                    grad[row * g + col] += residual * value;
                }
                grad[g * g + row] += residual;
            }
        }
        for (grad_w, w) in grad.iter_mut().zip(param).take(g * g) {
            *grad_w += 2.0 * self.ridge * w;
        }
        Ok(grad)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn collection(group_size: usize, values: &[f64]) -> GroupCollection {
        GroupCollection::new(group_size, values.to_vec()).unwrap()
    }

    #[test]
    fn untrained_model_predicts_zero_change() {
        let model = LinearSequenceModel::new(3, LinearModelConfig::default());
        let prediction = model.predict(&collection(3, &[0.0, 0.1, 0.2])).unwrap();
        assert_eq!(prediction, vec![0.0, 0.0, 0.0]);
        assert_eq!(model.last_trained(), None);
    }

    #[test]
    fn fit_learns_repeating_pattern() {
        let pattern = [0.0, 0.05, -0.02];
        let x = collection(3, &pattern.repeat(4));
        let mut model = LinearSequenceModel::new(3, LinearModelConfig::default());
        let history = model.fit(&x, &pattern, FitParams::default()).unwrap();

        assert_eq!(history.samples, 4);
        assert!(history.final_loss < history.initial_loss);
        let prediction = model.predict(&x).unwrap();
        for (p, t) in prediction.iter().zip(pattern) {
            assert!((p - t).abs() < 1e-2, "{prediction:?}");
        }
        assert!(model.last_trained().is_some());
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let x = collection(2, &[0.0, 0.3, 0.0, -0.1]);
        let problem = TransitionProblem::new(&x, &[0.0, 0.2], 0.01);
        let param = vec![0.1, -0.2, 0.3, 0.4, 0.05, -0.05];
        let grad = problem.gradient(&param).unwrap();
        for idx in 0..param.len() {
            let step = 1e-6;
            let mut plus = param.clone();
            let mut minus = param.clone();
            plus[idx] += step;
            minus[idx] -= step;
            let numeric =
                (problem.cost(&plus).unwrap() - problem.cost(&minus).unwrap()) / (2.0 * step);
            assert!((numeric - grad[idx]).abs() < 1e-6, "idx={idx}");
        }
    }

    #[test]
    fn rejects_mismatched_shapes() {
        let mut model = LinearSequenceModel::new(3, LinearModelConfig::default());
        assert!(model.predict(&collection(2, &[1.0, 2.0])).is_err());
        assert!(model.predict(&GroupCollection::empty(3)).is_err());
        assert!(
            model
                .fit(&collection(3, &[0.0; 3]), &[0.0; 2], FitParams::default())
                .is_err()
        );
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models").join("model.json.gz");
        let x = collection(2, &[0.0, 0.1, 0.0, 0.2]);
        let mut model = LinearSequenceModel::new(2, LinearModelConfig::default());
        model
            .fit(&x, &[0.0, 0.3], FitParams { epochs: 50, ..FitParams::default() })
            .unwrap();
        model.save(&path).unwrap();

        let loaded = LinearSequenceModel::load(&path).unwrap();
        assert_eq!(loaded.group_size(), 2);
        assert_eq!(loaded.config(), model.config());
        assert_eq!(loaded.history().map(|h| h.epochs), model.history().map(|h| h.epochs));
        let expected = model.predict(&x).unwrap();
        for (a, b) in loaded.predict(&x).unwrap().iter().zip(&expected) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn loaded_model_checks_window_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.json.gz");
        LinearSequenceModel::new(3, LinearModelConfig::default())
            .with_normalize(false)
            .save(&path)
            .unwrap();

        let loaded = LinearSequenceModel::load(&path).unwrap();
        assert!(!loaded.normalize());
        let raw = WindowSettings {
            group_size: 3,
            normalize: false,
            ..WindowSettings::default()
        };
        assert!(loaded.check_settings(&raw).is_ok());

        let err = loaded
            .check_settings(&WindowSettings {
                normalize: true,
                ..raw
            })
            .unwrap_err();
        assert!(err.contains("normalize"), "{err}");
        assert!(loaded.check_settings(&WindowSettings::default()).is_err());
    }

    #[test]
    fn load_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json.gz");
        fs::write(&path, b"not a model").unwrap();
        assert!(LinearSequenceModel::load(&path).is_err());
        assert!(LinearSequenceModel::load(&dir.path().join("missing")).is_err());
    }
}
