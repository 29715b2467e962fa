//! JSON-ответы `predict` и `status`.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::evaluation::Evaluation;
use crate::forecast::PredictionRecord;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PredictPayload {
    pub version: &'static str,
    pub success: bool,
    pub message: String,
    pub period_length: usize,
    pub result: Vec<PredictionRecord>,
}

impl PredictPayload {
    pub fn new(period_length: usize, result: Vec<PredictionRecord>) -> Self {
        Self {
            version: VERSION,
            success: true,
            message: format!("Forecast for the next {period_length} days"),
            period_length,
            result,
        }
    }

    pub fn failure(period_length: usize, message: impl Into<String>) -> Self {
        Self {
            version: VERSION,
            success: false,
            message: message.into(),
            period_length,
            result: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ModelStatus {
    pub name: String,
    #[serde(with = "last_trained_format")]
    pub last_trained: Option<DateTime<Utc>>,
    pub error_rates: Evaluation,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusPayload {
    pub version: &'static str,
    pub success: bool,
    pub message: String,
    pub model: ModelStatus,
}

impl StatusPayload {
    pub fn new(model: ModelStatus) -> Self {
        Self {
            version: VERSION,
            success: true,
            message: "Model is ready".to_string(),
            model,
        }
    }

    pub fn failure(model: ModelStatus, message: impl Into<String>) -> Self {
        Self {
            version: VERSION,
            success: false,
            message: message.into(),
            model,
        }
    }
}

/// `last_trained` пишется строкой; для ни разу не обученной модели — пустой.
mod last_trained_format {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::Serializer;

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let text = value
            .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default();
        serializer.serialize_str(&text)
    }
}
