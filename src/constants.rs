//! Общие константы: форматы дат, имена колонок и значения по умолчанию.

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const DATE_COLUMN: &str = "date";
pub const DEFAULT_VARIABLE: &str = "close";

pub const DEFAULT_PERIOD_LENGTH: usize = 7;
pub const DEFAULT_HOLDOUT: usize = 0;
pub const DEFAULT_EPOCHS: u64 = 300;
pub const DEFAULT_BATCH_SIZE: usize = 1;

/// Точность округления прогнозов и метрик (знаков после запятой).
pub const ROUND_DECIMALS: i32 = 2;

pub fn round_decimals(value: f64) -> f64 {
    let factor = 10f64.powi(ROUND_DECIMALS);
    (value * factor).round() / factor
}
