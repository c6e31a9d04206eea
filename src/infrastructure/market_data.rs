use crate::domain::ports::MarketDataProvider;
use crate::domain::types::{CompanyNews, FinancialMetrics, InsiderTrade, PriceBar};
use crate::infrastructure::http::HttpSettings;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

const DEFAULT_BASE: &str = "https://api.financialdatasets.ai";

/// REST market-data client with an in-process price cache, so tools sharing
/// a lookback window within one run hit the API once.
pub struct FinancialDatasetsClient {
    client: ClientWithMiddleware,
    api_key: String,
    base_url: String,
    price_cache: Mutex<HashMap<String, Vec<PriceBar>>>,
}

#[derive(Deserialize)]
struct RawPrice {
    time: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: f64,
}

#[derive(Deserialize)]
struct PricesResponse {
    #[serde(default)]
    prices: Vec<RawPrice>,
}

#[derive(Deserialize)]
struct MetricsResponse {
    #[serde(default)]
    financial_metrics: Vec<FinancialMetrics>,
}

#[derive(Deserialize)]
struct RawInsiderTrade {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    transaction_date: Option<String>,
    #[serde(default)]
    transaction_shares: Option<f64>,
    #[serde(default)]
    transaction_price_per_share: Option<f64>,
}

#[derive(Deserialize)]
struct InsiderTradesResponse {
    #[serde(default)]
    insider_trades: Vec<RawInsiderTrade>,
}

#[derive(Deserialize)]
struct RawNews {
    title: String,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Deserialize)]
struct NewsResponse {
    #[serde(default)]
    news: Vec<RawNews>,
}

#[derive(Deserialize)]
struct MarketCapResponse {
    #[serde(default)]
    market_cap: Option<f64>,
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.get(..10)?, "%Y-%m-%d").ok()
}

impl FinancialDatasetsClient {
    pub fn new(api_key: impl Into<String>, base_url: Option<String>, http: &HttpSettings) -> Self {
        Self {
            client: http.build_client(),
            api_key: api_key.into(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE.to_string()),
            price_cache: Mutex::new(HashMap::new()),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path_and_query: String) -> Result<T> {
        let url = format!("{}{}", self.base_url, path_and_query);
        debug!("MarketData: GET {}", path_and_query);
        let response = self
            .client
            .get(&url)
            .header("X-API-KEY", &self.api_key)
            .send()
            .await
            .context("market data request failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("market data API returned {status}: {text}"));
        }
        response
            .json::<T>()
            .await
            .context("market data response was not valid JSON")
    }
}

#[async_trait]
impl MarketDataProvider for FinancialDatasetsClient {
    async fn prices(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceBar>> {
        let cache_key = format!("{ticker}:{start}:{end}");
        if let Some(cached) = self.price_cache.lock().unwrap().get(&cache_key) {
            return Ok(cached.clone());
        }

        let response: PricesResponse = self
            .get_json(format!(
                "/prices/?ticker={ticker}&interval=day&interval_multiplier=1\
                 &start_date={start}&end_date={end}"
            ))
            .await?;

        let mut bars: Vec<PriceBar> = response
            .prices
            .into_iter()
            .filter_map(|raw| {
                Some(PriceBar {
                    ticker: ticker.to_string(),
                    date: parse_date(&raw.time)?,
                    open: raw.open,
                    high: raw.high,
                    low: raw.low,
                    close: raw.close,
                    volume: raw.volume,
                })
            })
            .collect();
        bars.sort_by_key(|bar| bar.date);

        self.price_cache
            .lock()
            .unwrap()
            .insert(cache_key, bars.clone());
        Ok(bars)
    }

    async fn financial_metrics(
        &self,
        ticker: &str,
        end: NaiveDate,
        period: &str,
        limit: usize,
    ) -> Result<Vec<FinancialMetrics>> {
        let response: MetricsResponse = self
            .get_json(format!(
                "/financial-metrics/?ticker={ticker}&report_period_lte={end}\
                 &limit={limit}&period={period}"
            ))
            .await?;
        Ok(response.financial_metrics)
    }

    async fn insider_trades(
        &self,
        ticker: &str,
        start: Option<NaiveDate>,
        end: NaiveDate,
        limit: usize,
    ) -> Result<Vec<InsiderTrade>> {
        let mut query = format!(
            "/insider-trades/?ticker={ticker}&filing_date_lte={end}&limit={limit}"
        );
        if let Some(start) = start {
            query.push_str(&format!("&filing_date_gte={start}"));
        }
        let response: InsiderTradesResponse = self.get_json(query).await?;
        Ok(response
            .insider_trades
            .into_iter()
            .map(|raw| InsiderTrade {
                ticker: ticker.to_string(),
                insider_name: raw.name,
                transaction_date: raw.transaction_date.as_deref().and_then(parse_date),
                transaction_shares: raw.transaction_shares,
                transaction_price_per_share: raw.transaction_price_per_share,
            })
            .collect())
    }

    async fn company_news(
        &self,
        ticker: &str,
        start: Option<NaiveDate>,
        end: NaiveDate,
        limit: usize,
    ) -> Result<Vec<CompanyNews>> {
        let mut query = format!("/news/?ticker={ticker}&end_date={end}&limit={limit}");
        if let Some(start) = start {
            query.push_str(&format!("&start_date={start}"));
        }
        let response: NewsResponse = self.get_json(query).await?;
        Ok(response
            .news
            .into_iter()
            .map(|raw| CompanyNews {
                ticker: ticker.to_string(),
                title: raw.title,
                date: raw.date.as_deref().and_then(parse_date),
                source: raw.source,
                url: raw.url,
            })
            .collect())
    }

    async fn market_cap(&self, ticker: &str, end: NaiveDate) -> Result<Option<f64>> {
        let response: MarketCapResponse = self
            .get_json(format!("/market-cap/?ticker={ticker}&end_date={end}"))
            .await?;
        Ok(response.market_cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_parsing_handles_timestamps_and_dates() {
        assert_eq!(
            parse_date("2024-05-06"),
            NaiveDate::from_ymd_opt(2024, 5, 6)
        );
        assert_eq!(
            parse_date("2024-05-06T15:30:00Z"),
            NaiveDate::from_ymd_opt(2024, 5, 6)
        );
        assert_eq!(parse_date("bad"), None);
    }
}
