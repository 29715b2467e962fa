//! Временной ряд цен: проверка инвариантов, загрузка из CSV и сборка дневного ряда из сырых точек.

use std::collections::BTreeMap;
use std::error::Error;
use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use itertools::Itertools;

use crate::constants::{DATE_COLUMN, DATE_FORMAT};
use crate::error::{ForecastError, Result};

const HISTORY_HEADER: [&str; 4] = [DATE_COLUMN, "close", "market_cap", "volume"];
/// Самый длинный пропуск (в днях), который ещё допустимо заполнить интерполяцией.
pub const MAX_INTERPOLATED_GAP_DAYS: i64 = 7;

/// Упорядоченный ряд: даты строго возрастают, значения конечны.
#[derive(Clone, Debug, PartialEq)]
pub struct Series {
    dates: Vec<NaiveDate>,
    values: Vec<f64>,
}

impl Series {
    pub fn new(dates: Vec<NaiveDate>, values: Vec<f64>) -> Result<Self> {
        if dates.len() != values.len() {
            return Err(ForecastError::LengthMismatch {
                expected: dates.len(),
                actual: values.len(),
            });
        }
        if let Some((prev, next)) = dates.iter().tuple_windows().find(|(prev, next)| next <= prev) {
            return Err(ForecastError::InvalidSeries(format!(
                "dates must be strictly increasing: {} is followed by {}",
                prev.format(DATE_FORMAT),
                next.format(DATE_FORMAT)
            )));
        }
        if let Some(idx) = values.iter().position(|value| !value.is_finite()) {
            return Err(ForecastError::InvalidSeries(format!(
                "value at {} is not finite",
                dates[idx].format(DATE_FORMAT)
            )));
        }
        Ok(Self { dates, values })
    }

    /// Ряд из последовательных дней, начиная с `first_date`.
    pub fn daily(first_date: NaiveDate, values: Vec<f64>) -> Result<Self> {
        let dates = (0..values.len())
            .map(|offset| first_date + Duration::days(offset as i64))
            .collect();
        Self::new(dates, values)
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub const fn len(&self) -> usize {
        self.values.len()
    }

    pub const fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn observation(&self, idx: usize) -> Option<(NaiveDate, f64)> {
        Some((*self.dates.get(idx)?, *self.values.get(idx)?))
    }
}

/// Источник исторических данных; ядро знает о нём только то, что он отдаёт `Series`.
pub trait DataSource {
    fn fetch(&self) -> std::result::Result<Series, Box<dyn Error>>;
}

/// CSV с колонкой `date` (ISO) и числовой колонкой `variable`.
#[derive(Clone, Debug)]
pub struct CsvSource {
    path: PathBuf,
    variable: String,
}

impl CsvSource {
    pub fn new(path: impl Into<PathBuf>, variable: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            variable: variable.into(),
        }
    }
}

impl DataSource for CsvSource {
    fn fetch(&self) -> std::result::Result<Series, Box<dyn Error>> {
        load_series(&self.path, &self.variable)
    }
}

impl DataSource for Series {
    fn fetch(&self) -> std::result::Result<Series, Box<dyn Error>> {
        Ok(self.clone())
    }
}

/// Читает CSV и сортирует строки по дате (экспорты бывают в обратном порядке).
pub fn load_series(csv_path: &Path, variable: &str) -> std::result::Result<Series, Box<dyn Error>> {
    let mut reader = csv::Reader::from_path(csv_path)?;
    let headers = reader.headers()?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|header| header.trim() == name)
            .ok_or_else(|| format!("column '{name}' not found in {}", csv_path.display()))
    };
    let date_idx = column(DATE_COLUMN)?;
    let value_idx = column(variable)?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let raw_date = record.get(date_idx).unwrap_or_default().trim();
        let date = NaiveDate::parse_from_str(raw_date, DATE_FORMAT)
            .map_err(|err| format!("failed to parse date '{raw_date}': {err}"))?;
        let raw_value = record.get(value_idx).unwrap_or_default().trim();
        let value: f64 = raw_value
            .parse()
            .map_err(|err| format!("failed to parse {variable} '{raw_value}': {err}"))?;
        rows.push((date, value));
    }
    if rows.is_empty() {
        return Err(format!("no rows in {}", csv_path.display()).into());
    }
    rows.sort_by_key(|(date, _)| *date);

    let (dates, values) = rows.into_iter().unzip();
    Ok(Series::new(dates, values)?)
}

/// Сырая точка из внешнего источника.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub market_cap: f64,
    pub volume: f64,
}

/// Одна строка дневной истории.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DailyPrice {
    pub date: NaiveDate,
    pub close: f64,
    pub market_cap: f64,
    pub volume: f64,
}

/// Собирает непрерывный дневной ряд: последняя точка дня становится закрытием, пропуски интерполируются.
pub fn build_daily_prices(points: &[PricePoint]) -> std::result::Result<Vec<DailyPrice>, String> {
    let buckets: BTreeMap<NaiveDate, PricePoint> =
        points.iter().fold(BTreeMap::new(), |mut acc, point| {
            let date = point.timestamp.date_naive();
            let replace = acc
                .get(&date)
                .is_none_or(|known: &PricePoint| known.timestamp <= point.timestamp);
            if replace {
                acc.insert(date, *point);
            }
            acc
        });

    let (Some(first_date), Some(last_date)) =
        (buckets.keys().next().copied(), buckets.keys().next_back().copied())
    else {
        return Err("No data available".to_string());
    };

    if let Some((before, after)) = buckets
        .keys()
        .tuple_windows()
        .find(|(before, after)| (**after - **before).num_days() - 1 > MAX_INTERPOLATED_GAP_DAYS)
    {
        return Err(format!(
            "{} days missing between {} and {}, more than {MAX_INTERPOLATED_GAP_DAYS} can be interpolated",
            (*after - *before).num_days() - 1,
            before.format(DATE_FORMAT),
            after.format(DATE_FORMAT)
        ));
    }

    let span_days = (last_date - first_date).num_days() as usize;
    let dates = (0..=span_days)
        .map(|offset| first_date + Duration::days(offset as i64))
        .collect_vec();
    let pick = |field: fn(&PricePoint) -> f64| {
        let known = dates
            .iter()
            .map(|date| buckets.get(date).map(field))
            .collect_vec();
        interpolate_gaps(known)
    };
    let close = pick(|point| point.price);
    let market_cap = pick(|point| point.market_cap);
    let volume = pick(|point| point.volume);

    let filled = dates.len() - buckets.len();
    if filled > 0 {
        tracing::warn!(days = filled, "Interpolated missing days in price history");
    }

    Ok(dates
        .into_iter()
        .zip(close)
        .zip(market_cap)
        .zip(volume)
        .map(|(((date, close), market_cap), volume)| DailyPrice {
            date,
            close,
            market_cap,
            volume,
        })
        .collect())
}

/// Записывает дневную историю в CSV, создавая директорию при необходимости.
pub fn write_history_csv(prices: &[DailyPrice], file_path: &Path) -> std::result::Result<(), String> {
    if let Some(parent) = file_path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .map_err(|err| format!("Failed to create {}: {err}", parent.display()))?;
    }
    let file = fs::File::create(file_path)
        .map_err(|err| format!("Failed to create CSV {}: {err}", file_path.display()))?;
    let mut writer = csv::Writer::from_writer(BufWriter::new(file));
    writer.write_record(HISTORY_HEADER).map_err(|err| {
        format!(
            "Failed to write CSV header to {}: {err}",
            file_path.display()
        )
    })?;
    for price in prices {
        writer
            .write_record([
                price.date.format(DATE_FORMAT).to_string(),
                price.close.to_string(),
                price.market_cap.to_string(),
                price.volume.to_string(),
            ])
            .map_err(|err| format!("Failed to write CSV row to {}: {err}", file_path.display()))?;
    }
    writer
        .flush()
        .map_err(|err| format!("Failed to flush CSV {}: {err}", file_path.display()))?;
    Ok(())
}

/// Линейно интерполирует пропуски между известными точками; края тянутся ближайшим значением.
fn interpolate_gaps(mut values: Vec<Option<f64>>) -> Vec<f64> {
    let mut last_known: Option<usize> = None;
    for idx in 0..values.len() {
        let Some(end_val) = values[idx] else {
            continue;
        };
        match last_known.and_then(|start| values[start].map(|start_val| (start, start_val))) {
            Some((start, start_val)) if idx - start > 1 => {
                let gap = idx - start;
                for (offset, slot) in ((start + 1)..idx).enumerate() {
                    let ratio = (offset as f64 + 1.0) / gap as f64;
                    values[slot] = Some((end_val - start_val).mul_add(ratio, start_val));
                }
            }
            Some(_) => {}
            None => {
                for placeholder in values.iter_mut().take(idx) {
                    *placeholder = Some(end_val);
                }
            }
        }
        last_known = Some(idx);
    }

    let fallback = last_known.and_then(|idx| values[idx]).unwrap_or_default();
    values
        .into_iter()
        .map(|value| value.unwrap_or(fallback))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use tempfile::NamedTempFile;

    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    #[test]
    fn rejects_unordered_dates() {
        let err = Series::new(vec![day(2), day(1)], vec![1.0, 2.0]).unwrap_err();
        assert!(matches!(err, ForecastError::InvalidSeries(_)));
        assert!(Series::new(vec![day(1), day(1)], vec![1.0, 2.0]).is_err());
    }

    #[test]
    fn rejects_non_finite_values() {
        assert!(Series::new(vec![day(1), day(2)], vec![1.0, f64::NAN]).is_err());
        assert!(Series::new(vec![day(1)], vec![1.0, 2.0]).is_err());
    }

    #[test]
    fn loads_descending_csv_in_ascending_order() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "date,open,close").unwrap();
        writeln!(file, "2024-01-03,1,30.5").unwrap();
        writeln!(file, "2024-01-02,1,20.5").unwrap();
        writeln!(file, "2024-01-01,1,10.5").unwrap();
        file.flush().unwrap();

        let series = CsvSource::new(file.path(), "close").fetch().unwrap();
        assert_eq!(series.dates(), &[day(1), day(2), day(3)]);
        assert_eq!(series.values(), &[10.5, 20.5, 30.5]);
    }

    #[test]
    fn missing_column_is_reported() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "date,close").unwrap();
        writeln!(file, "2024-01-01,1").unwrap();
        file.flush().unwrap();

        let err = load_series(file.path(), "volume").unwrap_err();
        assert!(err.to_string().contains("volume"));
    }

    #[test]
    fn daily_prices_keep_last_point_and_fill_gaps() {
        let point = |d: u32, hour: u32, price: f64| PricePoint {
            timestamp: Utc.with_ymd_and_hms(2024, 1, d, hour, 0, 0).unwrap(),
            price,
            market_cap: price * 10.0,
            volume: 1.0,
        };
        let points = [
            point(1, 12, 11.0),
            point(1, 0, 10.0),
            point(4, 0, 40.0),
            point(5, 0, 50.0),
        ];
        let prices = build_daily_prices(&points).unwrap();

        assert_eq!(prices.len(), 5);
        assert_eq!(prices.first().map(|price| price.date), Some(day(1)));
        let expected = [11.0, 20.0 + 2.0 / 3.0, 30.0 + 1.0 / 3.0, 40.0, 50.0];
        for (price, expected) in prices.iter().zip(expected) {
            assert!((price.close - expected).abs() < 1e-9, "{price:?}");
        }
        assert!((prices[1].market_cap - 10.0 * (20.0 + 2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn long_gaps_are_not_interpolated() {
        let point = |d: u32| PricePoint {
            timestamp: Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap(),
            price: 1.0,
            market_cap: 1.0,
            volume: 1.0,
        };
        let err = build_daily_prices(&[point(1), point(2), point(24)]).unwrap_err();
        assert!(err.contains("21 days missing"), "{err}");

        // ровно неделя пропуска ещё заполняется
        assert_eq!(build_daily_prices(&[point(1), point(9)]).unwrap().len(), 9);
    }

    #[test]
    fn empty_points_are_rejected() {
        assert!(build_daily_prices(&[]).is_err());
    }

    #[test]
    fn history_csv_round_trips_through_loader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history.csv");
        let prices = [
            DailyPrice {
                date: day(1),
                close: 1.5,
                market_cap: 10.0,
                volume: 2.0,
            },
            DailyPrice {
                date: day(2),
                close: 2.5,
                market_cap: 20.0,
                volume: 3.0,
            },
        ];
        write_history_csv(&prices, &path).unwrap();

        let series = load_series(&path, "market_cap").unwrap();
        assert_eq!(series.values(), &[10.0, 20.0]);
    }
}
