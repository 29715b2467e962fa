//! Нормализации временных рядов: z-score, относительно первой точки и min-max.

use crate::error::{ForecastError, Result};

/// Границы min-max по умолчанию.
pub const UNIT_BOUNDS: (f64, f64) = (0.0, 1.0);

/// Стандартизует ряд по среднему и стандартному отклонению генеральной совокупности (делитель N).
pub fn z_score(series: &[f64]) -> Result<Vec<f64>> {
    if series.is_empty() {
        return Err(ForecastError::UndefinedNormalization("z-score of an empty series"));
    }
    let n = series.len() as f64;
    let mean = series.iter().sum::<f64>() / n;
    let variance = series
        .iter()
        .map(|value| {
            let diff = value - mean;
            diff * diff
        })
        .sum::<f64>()
        / n;
    let std = variance.sqrt();
    if std == 0.0 || !std.is_finite() {
        return Err(ForecastError::UndefinedNormalization("z-score of a zero-variance series"));
    }
    Ok(series.iter().map(|value| (value - mean) / std).collect())
}

/// Выражает каждую точку как относительное изменение от первой: `s[i] / s[0] - 1`.
pub fn point_relative_normalize(series: &[f64]) -> Result<Vec<f64>> {
    let anchor = *series.first().ok_or(ForecastError::UndefinedNormalization(
        "point-relative normalization of an empty series",
    ))?;
    if anchor == 0.0 {
        return Err(ForecastError::UndefinedNormalization(
            "point-relative normalization anchored at zero",
        ));
    }
    Ok(series.iter().map(|value| value / anchor - 1.0).collect())
}

/// Обратное преобразование: `last_value * (s[i] + 1)`.
pub fn point_relative_denormalize(series: &[f64], last_value: f64) -> Vec<f64> {
    series
        .iter()
        .map(|value| last_value.mul_add(*value, last_value))
        .collect()
}

/// Масштабирует ряд в диапазон `bounds` по его минимуму и максимуму.
pub fn minmax_normalize(series: &[f64], bounds: (f64, f64)) -> Result<Vec<f64>> {
    let (low, high) = bounds;
    let (min, max) = series
        .iter()
        .fold(None, |acc: Option<(f64, f64)>, &value| match acc {
            Some((min, max)) => Some((min.min(value), max.max(value))),
            None => Some((value, value)),
        })
        .ok_or(ForecastError::UndefinedNormalization("min-max of an empty series"))?;
    let range = max - min;
    if range == 0.0 || !range.is_finite() {
        return Err(ForecastError::UndefinedNormalization("min-max of a zero-range series"));
    }
    Ok(series
        .iter()
        .map(|value| ((value - min) / range).mul_add(high - low, low))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: f64 = 1e-9;

    fn assert_close(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < TOLERANCE, "{actual:?} != {expected:?}");
        }
    }

    #[test]
    fn point_relative_anchors_on_first_element() {
        let series = [100.0, 110.0, 121.0, 90.0, 99.0, 108.9, 119.79];
        let normalized = point_relative_normalize(&series).unwrap();
        assert_close(&normalized, &[0.0, 0.1, 0.21, -0.1, -0.01, 0.089, 0.1979]);
    }

    #[test]
    fn point_relative_round_trip() {
        let series = [3.5, 7.25, 1.0, 12.0, 9.75];
        let normalized = point_relative_normalize(&series).unwrap();
        assert_close(&point_relative_denormalize(&normalized, series[0]), &series);
    }

    #[test]
    fn point_relative_rejects_zero_anchor() {
        assert!(matches!(
            point_relative_normalize(&[0.0, 1.0]),
            Err(ForecastError::UndefinedNormalization(_))
        ));
        assert!(point_relative_normalize(&[]).is_err());
    }

    #[test]
    fn z_score_uses_population_deviation() {
        // mean = 5, population std = 2
        let series = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let scored = z_score(&series).unwrap();
        assert_close(&scored, &[-1.5, -0.5, -0.5, -0.5, 0.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn z_score_rejects_constant_series() {
        assert!(matches!(
            z_score(&[3.0, 3.0, 3.0]),
            Err(ForecastError::UndefinedNormalization(_))
        ));
    }

    #[test]
    fn minmax_scales_into_bounds() {
        let scaled = minmax_normalize(&[10.0, 15.0, 20.0], UNIT_BOUNDS).unwrap();
        assert_close(&scaled, &[0.0, 0.5, 1.0]);

        let scaled = minmax_normalize(&[10.0, 15.0, 20.0], (-1.0, 1.0)).unwrap();
        assert_close(&scaled, &[-1.0, 0.0, 1.0]);
    }

    #[test]
    fn minmax_rejects_zero_range() {
        assert!(minmax_normalize(&[4.0, 4.0], UNIT_BOUNDS).is_err());
        assert!(minmax_normalize(&[], UNIT_BOUNDS).is_err());
    }
}
