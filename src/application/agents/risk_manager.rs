use crate::domain::ports::{ExchangeCalendar, MarketDataProvider};
use crate::domain::state::{DayState, EngineMode};
use crate::domain::types::{
    BasicRiskAssessment, PositionRiskAssessment, PriceBar, RiskAssessment, RiskLevel,
    VolatilityInfo,
};
use crate::infrastructure::calendar::naive_previous_weekday;
use chrono::{Days, NaiveDate};
use statrs::statistics::{Data, Distribution};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const RISK_MANAGER_ID: &str = "risk_manager";

/// Volatility lookback: the most recent min(60, n) daily returns.
const VOL_LOOKBACK: usize = 60;
/// Rolling window for the volatility percentile.
const ROLLING_WINDOW: usize = 30;
/// Calendar days of history fetched behind the volatility window end.
const HISTORY_DAYS: u64 = 120;
/// Base position limit before the volatility multiplier (portfolio mode).
const BASE_POSITION_LIMIT: f64 = 0.35;

/// Per-ticker volatility and position-limit assessment. The volatility window
/// always ends on the last trading day before the analysis date, so the
/// analysis day's own bar never contaminates it.
pub struct RiskManagerAgent {
    market: Arc<dyn MarketDataProvider>,
    calendar: Option<Arc<dyn ExchangeCalendar>>,
}

impl RiskManagerAgent {
    pub fn new(
        market: Arc<dyn MarketDataProvider>,
        calendar: Option<Arc<dyn ExchangeCalendar>>,
    ) -> Self {
        Self { market, calendar }
    }

    pub async fn execute(&self, state: &DayState) -> BTreeMap<String, RiskAssessment> {
        let window_end = self.window_end(state.trading_date).await;

        // First pass: current prices for every ticker, needed for the shared
        // portfolio value in portfolio mode.
        let mut history: BTreeMap<String, Vec<PriceBar>> = BTreeMap::new();
        let mut current_prices: BTreeMap<String, f64> = BTreeMap::new();
        for ticker in &state.tickers {
            let bars = self.fetch_history(ticker, window_end).await;
            let price = self
                .fetch_current_price(ticker, state.trading_date, state.is_live_mode, &bars)
                .await;
            current_prices.insert(ticker.clone(), price);
            history.insert(ticker.clone(), bars);
        }

        let mut assessments = BTreeMap::new();
        for ticker in &state.tickers {
            let bars = history.get(ticker).cloned().unwrap_or_default();
            let price = current_prices.get(ticker).copied().unwrap_or(0.0);
            let assessment = match state.mode {
                EngineMode::Signal => self.basic_assessment(ticker, &bars, price),
                EngineMode::Portfolio => {
                    self.position_assessment(ticker, &bars, price, state, &current_prices)
                }
            };
            assessments.insert(ticker.clone(), assessment);
        }
        assessments
    }

    async fn window_end(&self, trading_date: NaiveDate) -> NaiveDate {
        if let Some(calendar) = &self.calendar {
            if let Ok(day) = calendar
                .last_trading_day(trading_date.pred_opt().unwrap_or(trading_date))
                .await
            {
                return day;
            }
        }
        naive_previous_weekday(trading_date)
    }

    async fn fetch_history(&self, ticker: &str, window_end: NaiveDate) -> Vec<PriceBar> {
        let start = window_end
            .checked_sub_days(Days::new(HISTORY_DAYS))
            .unwrap_or(window_end);
        match self.market.prices(ticker, start, window_end).await {
            Ok(mut bars) => {
                bars.sort_by_key(|bar| bar.date);
                bars
            }
            Err(e) => {
                warn!("RiskManager: no price history for {}: {}", ticker, e);
                Vec::new()
            }
        }
    }

    /// Current price: the analysis-day open in the live pre-market view, its
    /// close otherwise (e.g. the deferred post-close re-run); previous close
    /// when the analysis-day bar is unavailable.
    async fn fetch_current_price(
        &self,
        ticker: &str,
        trading_date: NaiveDate,
        is_live_mode: bool,
        history: &[PriceBar],
    ) -> f64 {
        match self.market.prices(ticker, trading_date, trading_date).await {
            Ok(bars) if !bars.is_empty() => {
                let bar = &bars[0];
                if is_live_mode { bar.open } else { bar.close }
            }
            _ => {
                debug!(
                    "RiskManager: no bar for {} on {}, falling back to previous close",
                    ticker, trading_date
                );
                history.last().map(|bar| bar.close).unwrap_or(0.0)
            }
        }
    }

    fn basic_assessment(&self, ticker: &str, bars: &[PriceBar], price: f64) -> RiskAssessment {
        let Some(vol) = volatility_metrics(bars) else {
            return RiskAssessment::Basic(BasicRiskAssessment {
                risk_level: RiskLevel::Unknown,
                risk_score: 50,
                current_price: price,
                volatility_info: default_volatility(),
                risk_assessment: format!("{ticker}: insufficient price history for risk analysis"),
            });
        };

        let (risk_level, risk_score, assessment) = classify_risk(ticker, &vol);
        RiskAssessment::Basic(BasicRiskAssessment {
            risk_level,
            risk_score,
            current_price: price,
            volatility_info: vol,
            risk_assessment: assessment,
        })
    }

    fn position_assessment(
        &self,
        ticker: &str,
        bars: &[PriceBar],
        price: f64,
        state: &DayState,
        current_prices: &BTreeMap<String, f64>,
    ) -> RiskAssessment {
        let Some(portfolio) = &state.portfolio else {
            return RiskAssessment::Position(PositionRiskAssessment {
                current_price: price,
                max_shares: 0,
                remaining_position_limit: 0.0,
                volatility_metrics: default_volatility(),
                reasoning: format!("{ticker}: no portfolio in state, position sizing disabled"),
            });
        };

        let vol = volatility_metrics(bars).unwrap_or_else(default_volatility);
        if price <= 0.0 {
            return RiskAssessment::Position(PositionRiskAssessment {
                current_price: 0.0,
                max_shares: 0,
                remaining_position_limit: 0.0,
                volatility_metrics: vol,
                reasoning: format!("{ticker}: no current price, position sizing disabled"),
            });
        }

        let total_value = portfolio.total_value(current_prices);
        let limit_pct = BASE_POSITION_LIMIT * volatility_multiplier(vol.annualized_volatility);
        let position_limit = total_value * limit_pct;

        let position = portfolio.position(ticker);
        let net_value = (position.long as f64 - position.short as f64) * price;
        let remaining_limit = (position_limit - net_value.abs()).max(0.0);

        let cash = rust_decimal::prelude::ToPrimitive::to_f64(&portfolio.cash).unwrap_or(0.0);
        let max_shares = (remaining_limit.min(cash) / price).floor().max(0.0) as u64;

        RiskAssessment::Position(PositionRiskAssessment {
            current_price: price,
            max_shares,
            remaining_position_limit: remaining_limit,
            volatility_metrics: vol.clone(),
            reasoning: format!(
                "{ticker}: annualized vol {:.1}% gives a {:.1}% position limit \
                 ({:.0} of {:.0} portfolio value); {:.0} headroom allows {} shares at {:.2}",
                vol.annualized_volatility * 100.0,
                limit_pct * 100.0,
                position_limit,
                total_value,
                remaining_limit,
                max_shares,
                price
            ),
        })
    }
}

/// Extracts prices known to the latest risk pass, for the portfolio manager
/// and the trade executor.
pub fn current_prices_from_risk(
    assessments: &BTreeMap<String, RiskAssessment>,
) -> BTreeMap<String, f64> {
    assessments
        .iter()
        .filter(|(_, a)| a.current_price() > 0.0)
        .map(|(ticker, a)| (ticker.clone(), a.current_price()))
        .collect()
}

fn default_volatility() -> VolatilityInfo {
    VolatilityInfo {
        daily_volatility: 0.025,
        annualized_volatility: 0.25,
        volatility_percentile: 50.0,
        data_points: 0,
    }
}

/// Daily-return volatility over the most recent min(60, n) returns, with a
/// rolling-30-day percentile when enough history exists.
pub fn volatility_metrics(bars: &[PriceBar]) -> Option<VolatilityInfo> {
    if bars.len() < 2 {
        return None;
    }

    let returns: Vec<f64> = bars
        .windows(2)
        .filter(|w| w[0].close > 0.0)
        .map(|w| w[1].close / w[0].close - 1.0)
        .collect();
    if returns.len() < 2 {
        return None;
    }

    let window = returns.len().min(VOL_LOOKBACK);
    let recent = &returns[returns.len() - window..];
    let daily_vol = Data::new(recent.to_vec()).std_dev().unwrap_or(0.0);
    let annualized_vol = daily_vol * 252.0_f64.sqrt();

    let volatility_percentile = if returns.len() >= ROLLING_WINDOW {
        let rolling: Vec<f64> = returns
            .windows(ROLLING_WINDOW)
            .map(|w| Data::new(w.to_vec()).std_dev().unwrap_or(0.0))
            .collect();
        if rolling.is_empty() {
            50.0
        } else {
            let below = rolling.iter().filter(|v| **v <= daily_vol).count();
            below as f64 / rolling.len() as f64 * 100.0
        }
    } else {
        50.0
    };

    Some(VolatilityInfo {
        daily_volatility: if daily_vol.is_nan() { 0.025 } else { daily_vol },
        annualized_volatility: if annualized_vol.is_nan() { 0.25 } else { annualized_vol },
        volatility_percentile,
        data_points: window,
    })
}

/// Annualized-volatility bands -> risk level and score, with percentile and
/// small-sample adjustments.
fn classify_risk(ticker: &str, vol: &VolatilityInfo) -> (RiskLevel, u32, String) {
    let annualized = vol.annualized_volatility;
    let percentile = vol.volatility_percentile;

    let (level, mut score, mut assessment) = if annualized < 0.15 {
        if percentile < 30.0 {
            (
                RiskLevel::Low,
                15,
                format!(
                    "{ticker}: low risk, annualized volatility {:.1}%, currently at a historical low",
                    annualized * 100.0
                ),
            )
        } else {
            (
                RiskLevel::Low,
                25,
                format!(
                    "{ticker}: low risk, annualized volatility {:.1}%, price swings are mild",
                    annualized * 100.0
                ),
            )
        }
    } else if annualized < 0.30 {
        if percentile > 70.0 {
            (
                RiskLevel::Medium,
                65,
                format!(
                    "{ticker}: medium risk, annualized volatility {:.1}%, volatility is rising",
                    annualized * 100.0
                ),
            )
        } else {
            (
                RiskLevel::Medium,
                50,
                format!(
                    "{ticker}: medium risk, annualized volatility {:.1}%, within the normal range",
                    annualized * 100.0
                ),
            )
        }
    } else if annualized < 0.50 {
        (
            RiskLevel::High,
            75,
            format!(
                "{ticker}: high risk, annualized volatility {:.1}%, large price swings",
                annualized * 100.0
            ),
        )
    } else {
        (
            RiskLevel::VeryHigh,
            90,
            format!(
                "{ticker}: very high risk, annualized volatility {:.1}%, extreme price swings",
                annualized * 100.0
            ),
        )
    };

    if vol.data_points < 10 {
        assessment.push_str(&format!(" (only {} data points)", vol.data_points));
        score = (score + 10).min(100);
    }

    (level, score.min(100), assessment)
}

/// Interpolated position-limit multiplier: 1.3 for very low volatility down
/// to 0.4 for very high, clamped to [0.4, 1.3].
pub fn volatility_multiplier(annualized_volatility: f64) -> f64 {
    let multiplier = if annualized_volatility < 0.15 {
        1.3
    } else if annualized_volatility < 0.30 {
        1.1 - (annualized_volatility - 0.15) * 0.8
    } else if annualized_volatility < 0.50 {
        0.8 - (annualized_volatility - 0.30) * 0.6
    } else {
        0.4
    };
    multiplier.clamp(0.4, 1.3)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bars_from_closes(closes: &[f64]) -> Vec<PriceBar> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| PriceBar {
                ticker: "TEST".to_string(),
                date: start.checked_add_days(Days::new(i as u64)).unwrap(),
                open: close,
                high: close,
                low: close,
                close,
                volume: 1000.0,
            })
            .collect()
    }

    #[test]
    fn volatility_of_flat_series_is_zero() {
        let bars = bars_from_closes(&[100.0; 40]);
        let vol = volatility_metrics(&bars).unwrap();
        assert_eq!(vol.daily_volatility, 0.0);
        assert_eq!(vol.annualized_volatility, 0.0);
    }

    #[test]
    fn volatility_window_caps_at_sixty_returns() {
        let closes: Vec<f64> = (0..200).map(|i| 100.0 + (i % 7) as f64).collect();
        let bars = bars_from_closes(&closes);
        let vol = volatility_metrics(&bars).unwrap();
        assert_eq!(vol.data_points, 60);
    }

    #[test]
    fn too_little_history_yields_none() {
        assert!(volatility_metrics(&bars_from_closes(&[100.0])).is_none());
        assert!(volatility_metrics(&[]).is_none());
    }

    #[test]
    fn multiplier_interpolation_and_clamping() {
        assert_eq!(volatility_multiplier(0.10), 1.3);
        assert!((volatility_multiplier(0.20) - 1.06).abs() < 1e-9);
        assert!((volatility_multiplier(0.40) - 0.74).abs() < 1e-9);
        assert_eq!(volatility_multiplier(0.80), 0.4);
    }

    #[test]
    fn risk_bands_match_base_scores() {
        let vol = |annualized: f64| VolatilityInfo {
            daily_volatility: annualized / 252.0_f64.sqrt(),
            annualized_volatility: annualized,
            volatility_percentile: 50.0,
            data_points: 60,
        };
        assert_eq!(classify_risk("T", &vol(0.10)).1, 25);
        assert_eq!(classify_risk("T", &vol(0.20)).1, 50);
        assert_eq!(classify_risk("T", &vol(0.40)).1, 75);
        assert_eq!(classify_risk("T", &vol(0.60)).1, 90);
    }

    #[tokio::test]
    async fn analysis_day_bar_never_enters_the_volatility_window() {
        use crate::domain::state::{DayState, EngineMode};
        use crate::infrastructure::mock::{FixtureMarketData, make_bars};
        use std::sync::Arc;

        let trading_date = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap(); // Monday
        let market = Arc::new(FixtureMarketData::empty());

        // Calm history, then a violent move on the analysis day itself.
        let mut bars = make_bars(
            "AAPL",
            NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            NaiveDate::from_ymd_opt(2024, 5, 3).unwrap(),
            |_| (100.0, 100.0),
        );
        bars.push(PriceBar {
            ticker: "AAPL".to_string(),
            date: trading_date,
            open: 100.0,
            high: 520.0,
            low: 95.0,
            close: 500.0,
            volume: 1_000_000.0,
        });
        market.set_bars("AAPL", bars);

        let state = DayState::new(
            trading_date,
            vec!["AAPL".to_string()],
            EngineMode::Signal,
            false,
        );
        let agent = RiskManagerAgent::new(market, None);
        let assessments = agent.execute(&state).await;

        match &assessments["AAPL"] {
            RiskAssessment::Basic(basic) => {
                // The crash day is visible in the price, never in the window.
                assert_eq!(basic.current_price, 500.0);
                assert_eq!(basic.volatility_info.daily_volatility, 0.0);
                assert_eq!(basic.risk_level, RiskLevel::Low);
            }
            other => panic!("expected basic assessment, got {other:?}"),
        }
    }

    #[test]
    fn small_sample_penalty_applies() {
        let vol = VolatilityInfo {
            daily_volatility: 0.01,
            annualized_volatility: 0.10,
            volatility_percentile: 50.0,
            data_points: 5,
        };
        let (_, score, assessment) = classify_risk("T", &vol);
        assert_eq!(score, 35);
        assert!(assessment.contains("5 data points"));
    }
}
