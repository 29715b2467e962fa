//! Опорная точка для денормализации: последнее сырое наблюдение последней целой группы.

use chrono::NaiveDate;
use serde::Serialize;

use crate::error::{ForecastError, Result};
use crate::series::Series;
use crate::windowing::retained_len;

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct SeriesReference {
    pub value: f64,
    pub date: NaiveDate,
}

impl SeriesReference {
    /// Берёт последнее наблюдение, попавшее в целую группу; отброшенный хвост не учитывается.
    pub fn track(series: &Series, group_size: usize, start: usize) -> Result<Self> {
        if group_size == 0 {
            return Err(ForecastError::InvalidGroupSize);
        }
        let retained = retained_len(series.len(), group_size, start);
        if retained == 0 {
            return Err(ForecastError::InsufficientData {
                required: start + group_size,
                available: series.len(),
            });
        }
        let (date, value) = series
            .observation(start + retained - 1)
            .ok_or(ForecastError::InsufficientData {
                required: start + retained,
                available: series.len(),
            })?;
        Ok(Self { value, date })
    }

    /// Сколько последних наблюдений не вошло в группы.
    pub const fn remainder(series: &Series, group_size: usize, start: usize) -> usize {
        series.len().saturating_sub(start) - retained_len(series.len(), group_size, start)
    }
}
