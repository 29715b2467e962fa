//! Ошибки ядра: нормализация, нарезка окон, оценка и внешняя модель.

use thiserror::Error;

/// Ошибка, которую возвращает внешняя последовательная модель.
pub type ModelError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum ForecastError {
    /// Нормализация не определена (нулевая дисперсия, нулевой диапазон, нулевой якорь).
    #[error("undefined normalization: {0}")]
    UndefinedNormalization(&'static str),

    #[error("insufficient data: need at least {required} observations, got {available}")]
    InsufficientData { required: usize, available: usize },

    #[error("group size must be positive")]
    InvalidGroupSize,

    #[error("invalid series: {0}")]
    InvalidSeries(String),

    #[error("length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("cannot evaluate an empty series")]
    EmptyInput,

    /// MAPE делит на фактическое значение, поэтому ноль в нём недопустим.
    #[error("mape is undefined: ground truth is zero at position {index}")]
    ZeroGroundTruth { index: usize },

    #[error("invalid model output: {0}")]
    InvalidModelOutput(String),

    #[error("sequence model failed: {0}")]
    Model(#[source] ModelError),
}

pub type Result<T> = std::result::Result<T, ForecastError>;
