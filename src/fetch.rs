use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Error};
use serde::Deserialize;
use std::time::Duration;
use std::{env, fmt};
use tracing::{info, warn};

const HTTPS_PROXY_ENV: &str = "HTTPS_PROXY";
const API_KEY_ENV: &str = "COINGECKO_API_KEY";
const API_KEY_HEADER: &str = "x-cg-demo-api-key";
const MARKET_CHART_BASE: &str = "https://api.coingecko.com/api/v3/coins";

#[derive(Debug)]
pub enum FetchError {
    Request(reqwest::Error),
    NoAttempts,
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(err) => write!(f, "{err}"),
            Self::NoAttempts => f.write_str("Request attempts were not performed"),
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Request(err) => Some(err),
            Self::NoAttempts => None,
        }
    }
}

/// Ответ `market_chart/range`: пары `[timestamp_ms, value]`.
#[derive(Debug, Deserialize)]
pub struct MarketChart {
    pub prices: Vec<(f64, f64)>,
    #[serde(default)]
    pub market_caps: Vec<(f64, f64)>,
    #[serde(default)]
    pub total_volumes: Vec<(f64, f64)>,
}

pub fn build_client() -> Result<Client, String> {
    let mut headers = HeaderMap::new();
    if let Ok(key) = env::var(API_KEY_ENV) {
        let value = HeaderValue::from_str(&key)
            .map_err(|err| format!("Invalid {API_KEY_ENV}: {err}"))?;
        headers.insert(API_KEY_HEADER, value);
    }
    let builder = Client::builder().default_headers(headers);
    let builder = match env::var(HTTPS_PROXY_ENV) {
        Ok(val) => {
            info!(proxy = %val, "Using HTTPS proxy");
            let proxy = reqwest::Proxy::https(&val)
                .map_err(|err| format!("Invalid {HTTPS_PROXY_ENV} '{val}': {err}"))?;
            builder.proxy(proxy)
        }
        Err(e) => {
            warn!(error = %e, "Couldn't interpret HTTPS_PROXY");
            builder
        }
    };
    builder
        .build()
        .map_err(|err| format!("Failed to build HTTP client: {err}"))
}

pub fn market_chart_url(ticker: &str, vs_currency: &str, from: i64, to: i64) -> String {
    format!("{MARKET_CHART_BASE}/{ticker}/market_chart/range?vs_currency={vs_currency}&from={from}&to={to}")
}

/// Запрашивает URL и повторяет попытки при сетевых/HTTP ошибках.
pub async fn fetch_url(
    client: &Client,
    url: &str,
    max_retries: u32,
    delay: Duration,
) -> Result<Bytes, FetchError> {
    let mut last_error: Option<Error> = None;
    for attempt in 0..max_retries {
        match client.get(url).send().await {
            Ok(response) => match response.error_for_status() {
                Ok(success_response) => {
                    return success_response.bytes().await.map_err(FetchError::Request);
                }
                Err(err) => {
                    warn!(
                        attempt = attempt + 1,
                        status = ?err.status(),
                        error = %err,
                        "HTTP request failed"
                    );
                    last_error = Some(err);
                }
            },
            Err(err) => {
                warn!(
                    attempt = attempt + 1,
                    error = %err,
                    "HTTP request failed"
                );
                last_error = Some(err);
            }
        }

        if attempt + 1 < max_retries {
            warn!(
                attempt = attempt + 1,
                delay_secs = delay.as_secs(),
                "Retrying request"
            );
            tokio::time::sleep(delay).await;
        }
    }

    last_error.map_or_else(
        || Err(FetchError::NoAttempts),
        |err| Err(FetchError::Request(err)),
    )
}
