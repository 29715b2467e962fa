//! TOML-конфигурация: необязательные секции поверх встроенных значений по умолчанию.

use std::fs;
use std::path::Path;

use chrono::NaiveDate;
use serde::Deserialize;

use crate::constants::{DATE_FORMAT, DEFAULT_VARIABLE};
use crate::model::LinearModelConfig;
use crate::sequence::FitParams;
use crate::windowing::WindowSettings;

pub const DEFAULT_MODEL_CONFIG: &str = "config/model.toml";
const DEFAULT_TICKER: &str = "bitcoin";
const DEFAULT_VS_CURRENCY: &str = "usd";
const DEFAULT_START_DATE: (i32, u32, u32) = (2017, 1, 1);

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    data: Option<DataFile>,
    windowing: Option<WindowingFile>,
    training: Option<TrainingFile>,
    model: Option<ModelFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DataFile {
    variable: Option<String>,
    ticker: Option<String>,
    vs_currency: Option<String>,
    start_date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WindowingFile {
    #[serde(alias = "group_size")]
    period_length: Option<usize>,
    holdout: Option<usize>,
    normalize: Option<bool>,
    start: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TrainingFile {
    epochs: Option<u64>,
    batch_size: Option<usize>,
    verbose: Option<u8>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModelFile {
    ridge: Option<f64>,
    history: Option<usize>,
}

/// Откуда и что загружать.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataConfig {
    pub variable: String,
    pub ticker: String,
    pub vs_currency: String,
    pub start_date: NaiveDate,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            variable: DEFAULT_VARIABLE.to_string(),
            ticker: DEFAULT_TICKER.to_string(),
            vs_currency: DEFAULT_VS_CURRENCY.to_string(),
            start_date: NaiveDate::from_ymd_opt(
                DEFAULT_START_DATE.0,
                DEFAULT_START_DATE.1,
                DEFAULT_START_DATE.2,
            )
            .unwrap_or_default(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolvedConfig {
    pub data: DataConfig,
    pub windowing: WindowSettings,
    pub training: FitParams,
    pub model: LinearModelConfig,
}

/// Переопределения из командной строки и окружения; применяются поверх файла.
#[derive(Clone, Copy, Debug, Default)]
pub struct Overrides {
    pub period_length: Option<usize>,
    pub holdout: Option<usize>,
    pub epochs: Option<u64>,
}

impl ResolvedConfig {
    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(period_length) = overrides.period_length {
            self.windowing.group_size = period_length;
        }
        if let Some(holdout) = overrides.holdout {
            self.windowing.holdout = holdout;
        }
        if let Some(epochs) = overrides.epochs {
            self.training.epochs = epochs;
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.windowing.group_size == 0 {
            return Err("windowing.period_length must be > 0".to_string());
        }
        if self.training.epochs == 0 {
            return Err("training.epochs must be > 0".to_string());
        }
        if self.training.batch_size == 0 {
            return Err("training.batch_size must be > 0".to_string());
        }
        if !self.model.ridge.is_finite() || self.model.ridge < 0.0 {
            return Err("model.ridge must be >= 0".to_string());
        }
        if self.model.history == 0 {
            return Err("model.history must be > 0".to_string());
        }
        if self.data.variable.trim().is_empty() {
            return Err("data.variable must not be empty".to_string());
        }
        if self.data.ticker.trim().is_empty() {
            return Err("data.ticker must not be empty".to_string());
        }
        Ok(())
    }
}

/// Загружает конфигурацию; отсутствие файла по умолчанию не ошибка.
pub fn load_config(path: &Path) -> Result<ResolvedConfig, String> {
    if !path.exists() {
        if path == Path::new(DEFAULT_MODEL_CONFIG) {
            tracing::info!(
                "Model config {} not found, using built-in defaults",
                path.display()
            );
            return Ok(ResolvedConfig::default());
        }
        return Err(format!("Model config {} does not exist", path.display()));
    }

    let raw = fs::read_to_string(path)
        .map_err(|err| format!("Failed to read model config {}: {err}", path.display()))?;
    parse_config(&raw).map_err(|err| format!("Invalid model config {}: {err}", path.display()))
}

fn parse_config(raw: &str) -> Result<ResolvedConfig, String> {
    let file: ConfigFile = toml::from_str(raw).map_err(|err| err.to_string())?;
    let mut cfg = ResolvedConfig::default();

    if let Some(data) = file.data {
        if let Some(variable) = data.variable {
            cfg.data.variable = variable;
        }
        if let Some(ticker) = data.ticker {
            cfg.data.ticker = ticker.to_lowercase();
        }
        if let Some(vs_currency) = data.vs_currency {
            cfg.data.vs_currency = vs_currency.to_lowercase();
        }
        if let Some(start_date) = data.start_date {
            cfg.data.start_date = NaiveDate::parse_from_str(&start_date, DATE_FORMAT)
                .map_err(|err| format!("data.start_date '{start_date}': {err}"))?;
        }
    }
    if let Some(windowing) = file.windowing {
        if let Some(period_length) = windowing.period_length {
            cfg.windowing.group_size = period_length;
        }
        if let Some(holdout) = windowing.holdout {
            cfg.windowing.holdout = holdout;
        }
        if let Some(normalize) = windowing.normalize {
            cfg.windowing.normalize = normalize;
        }
        if let Some(start) = windowing.start {
            cfg.windowing.start = start;
        }
    }
    if let Some(training) = file.training {
        if let Some(epochs) = training.epochs {
            cfg.training.epochs = epochs;
        }
        if let Some(batch_size) = training.batch_size {
            cfg.training.batch_size = batch_size;
        }
        if let Some(verbose) = training.verbose {
            cfg.training.verbose = verbose;
        }
    }
    if let Some(model) = file.model {
        if let Some(ridge) = model.ridge {
            cfg.model.ridge = ridge;
        }
        if let Some(history) = model.history {
            cfg.model.history = history;
        }
    }

    cfg.validate()?;
    Ok(cfg)
}
