//! Загрузка дневной истории цен из CoinGecko и запись её в CSV.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use futures::{StreamExt, stream};
use itertools::Itertools;
use tqdm::pbar;
use tracing::{info, warn};

use crate::config::DataConfig;
use crate::fetch::{self, MarketChart};
use crate::series::{DailyPrice, PricePoint, build_daily_prices, write_history_csv};

const FETCH_CONCURRENCY: usize = 4;
const CHUNK_DAYS: i64 = 365;
const POINTS_CAPACITY: usize = 5000;

/// Интервалы `[from, to)` в секундах, покрывающие период не длиннее года каждый.
pub fn chunk_ranges(from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<(i64, i64)> {
    let step = CHUNK_DAYS * 24 * 60 * 60;
    let (from, to) = (from.timestamp(), to.timestamp());
    (0..)
        .map(|idx| from + idx * step)
        .take_while(|start| *start < to)
        .map(|start| (start, (start + step).min(to)))
        .collect()
}

/// Склеивает три ряда ответа по отметке времени; капитализация и объём могут отсутствовать.
pub fn chart_points(chart: &MarketChart) -> Result<Vec<PricePoint>, String> {
    let by_timestamp = |series: &[(f64, f64)]| -> HashMap<i64, f64> {
        series
            .iter()
            .map(|(timestamp_ms, value)| (*timestamp_ms as i64, *value))
            .collect()
    };
    let market_caps = by_timestamp(&chart.market_caps);
    let volumes = by_timestamp(&chart.total_volumes);

    let mut unmatched = 0_usize;
    let points = chart
        .prices
        .iter()
        .map(|(timestamp_ms, price)| {
            let key = *timestamp_ms as i64;
            let timestamp = DateTime::<Utc>::from_timestamp_millis(key)
                .ok_or_else(|| format!("Failed to build timestamp from {timestamp_ms}"))?;
            let market_cap = market_caps.get(&key).copied();
            let volume = volumes.get(&key).copied();
            if market_cap.is_none() || volume.is_none() {
                unmatched += 1;
            }
            Ok(PricePoint {
                timestamp,
                price: *price,
                market_cap: market_cap.unwrap_or_default(),
                volume: volume.unwrap_or_default(),
            })
        })
        .collect::<Result<Vec<_>, String>>()?;
    if unmatched > 0 {
        warn!(points = unmatched, "Price points without market cap or volume");
    }
    Ok(points)
}

/// Скачивает историю с `cfg.start_date` по текущий момент кусками по году.
pub async fn fetch_history(
    client: &reqwest::Client,
    cfg: &DataConfig,
    max_retries: u32,
    delay: Duration,
) -> Result<Vec<DailyPrice>, String> {
    let from = start_of_day(cfg.start_date);
    let ranges = chunk_ranges(from, Utc::now());
    let chunks = ranges.len();
    if ranges.is_empty() {
        return Err(format!(
            "Start date {} is in the future",
            cfg.start_date
        ));
    }
    info!(
        ticker = %cfg.ticker,
        vs_currency = %cfg.vs_currency,
        chunks,
        "Fetching price history..."
    );

    let mut points = Vec::with_capacity(POINTS_CAPACITY);
    let mut pbar = pbar(Some(chunks));
    let stream = stream::iter(ranges.into_iter()).map(|(start, end)| async move {
        let url = fetch::market_chart_url(&cfg.ticker, &cfg.vs_currency, start, end);
        let content = fetch::fetch_url(client, &url, max_retries, delay)
            .await
            .map_err(|err| format!("Failed to fetch {url}: {err}"))?;
        let chart: MarketChart = serde_json::from_slice(&content)
            .map_err(|err| format!("Failed to deserialize JSON: {err}"))?;
        chart_points(&chart)
    });
    let mut buffered = stream.buffer_unordered(FETCH_CONCURRENCY);

    let mut failed = 0_usize;
    while let Some(result) = buffered.next().await {
        match result {
            Ok(mut chunk) => points.append(&mut chunk),
            Err(err) => {
                warn!(error = %err, "Failed to fetch price chunk");
                failed += 1;
            }
        }
        if let Err(err) = pbar.update(1) {
            warn!(error = %err, "Failed to update progress bar");
        }
    }
    // пропавший кусок — это год без данных, интерполировать его нельзя
    if failed > 0 {
        return Err(format!("{failed} of {chunks} price chunks failed to download"));
    }

    let points = points
        .into_iter()
        .sorted_by_key(|point| point.timestamp)
        .collect_vec();
    build_daily_prices(&points)
}

/// Скачивает историю и сразу пишет CSV `date,close,market_cap,volume`.
pub async fn download_history(
    client: &reqwest::Client,
    cfg: &DataConfig,
    output: &Path,
    max_retries: u32,
    delay: Duration,
) -> Result<usize, String> {
    let prices = fetch_history(client, cfg, max_retries, delay).await?;
    write_history_csv(&prices, output)?;
    Ok(prices.len())
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}
