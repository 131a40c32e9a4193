use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::indicators::Indicators;
use crate::core::error::DataError;

const HISTORY_WINDOW: usize = 64;
const VOLATILITY_PERIOD: usize = 20;

/// Column order of `FeatureVector::values`.
pub const FEATURE_NAMES: [&str; 10] = [
    "close",
    "return_1",
    "range_pct",
    "sma20_gap",
    "sma50_gap",
    "rsi14",
    "bollinger_pos",
    "volatility",
    "volume_ratio",
    "sentiment",
];

/// Raw market state for one symbol as delivered by the data feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
    /// Previous closes, oldest first, not including `close`.
    #[serde(default)]
    pub closes: Vec<f64>,
    #[serde(default)]
    pub volumes: Vec<f64>,
    /// Auxiliary sentiment score in `[-1, 1]`.
    #[serde(default)]
    pub sentiment: Option<f64>,
}

impl MarketSnapshot {
    pub fn new(symbol: impl Into<String>, timestamp: DateTime<Utc>, close: f64) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp,
            open: Some(close),
            high: Some(close),
            low: Some(close),
            close: Some(close),
            volume: Some(0.0),
            closes: Vec::new(),
            volumes: Vec::new(),
            sentiment: None,
        }
    }

    pub fn last_price(&self) -> Option<f64> {
        self.close.filter(|p| p.is_finite() && *p > 0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureVector {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    values: Vec<f64>,
}

impl FeatureVector {
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        FEATURE_NAMES
            .iter()
            .position(|n| *n == name)
            .and_then(|i| self.values.get(i).copied())
    }

    pub fn close(&self) -> f64 {
        self.values[0]
    }

    /// Fractional volatility of returns.
    pub fn volatility(&self) -> f64 {
        self.values[7]
    }

    /// Volatility in price units, the denominator of position sizing.
    pub fn price_volatility(&self) -> f64 {
        self.close() * self.volatility()
    }

    pub fn sentiment(&self) -> f64 {
        self.values[9]
    }

    #[cfg(test)]
    pub(crate) fn from_values(symbol: &str, values: Vec<f64>) -> Self {
        assert_eq!(values.len(), FEATURE_NAMES.len());
        Self {
            symbol: symbol.to_string(),
            timestamp: Utc::now(),
            values,
        }
    }
}

/// Turns snapshots into feature vectors. Holds configuration only.
#[derive(Debug, Clone)]
pub struct FeatureBuilder {
    staleness_threshold_ms: u64,
}

impl FeatureBuilder {
    pub fn new(staleness_threshold_ms: u64) -> Self {
        Self {
            staleness_threshold_ms,
        }
    }

    /// Builds the feature vector for `snapshot` as seen at `now`.
    ///
    /// Missing OHLCV fields are taken from `previous` (the last raw snapshot of
    /// the same symbol). A field missing from both counts as more than one tick
    /// of missing data and fails the whole snapshot.
    pub fn build(
        &self,
        snapshot: &MarketSnapshot,
        previous: Option<&MarketSnapshot>,
        now: DateTime<Utc>,
    ) -> Result<FeatureVector, DataError> {
        let symbol = snapshot.symbol.as_str();
        let age_ms = (now - snapshot.timestamp).num_milliseconds();
        if age_ms > self.staleness_threshold_ms as i64 {
            return Err(DataError::StaleData {
                symbol: symbol.to_string(),
                age_ms,
                threshold_ms: self.staleness_threshold_ms,
            });
        }

        let previous = previous.filter(|p| p.symbol == snapshot.symbol);
        // A non-finite value counts as missing, so it is forward-filled like one.
        let fill = |field: &'static str,
                    current: Option<f64>,
                    last: fn(&MarketSnapshot) -> Option<f64>|
         -> Result<f64, DataError> {
            current
                .filter(|v| v.is_finite())
                .or_else(|| previous.and_then(last).filter(|v| v.is_finite()))
                .ok_or_else(|| DataError::MissingField {
                    symbol: symbol.to_string(),
                    field,
                })
        };
        let positive = |price: f64| -> Result<f64, DataError> {
            if price > 0.0 {
                Ok(price)
            } else {
                Err(DataError::InvalidPrice {
                    symbol: symbol.to_string(),
                    price,
                })
            }
        };

        let close = positive(fill("close", snapshot.close, |s| s.close)?)?;
        let high = positive(fill("high", snapshot.high, |s| s.high)?)?;
        let low = positive(fill("low", snapshot.low, |s| s.low)?)?;
        positive(fill("open", snapshot.open, |s| s.open)?)?;
        let volume = fill("volume", snapshot.volume, |s| s.volume)?.max(0.0);
        let sentiment = snapshot
            .sentiment
            .filter(|v| v.is_finite())
            .or_else(|| previous.and_then(|p| p.sentiment).filter(|v| v.is_finite()))
            .unwrap_or(0.0)
            .clamp(-1.0, 1.0);

        if let Some(bad) = snapshot.closes.iter().find(|p| !(p.is_finite() && **p > 0.0)) {
            return Err(DataError::InvalidPrice {
                symbol: symbol.to_string(),
                price: *bad,
            });
        }
        if snapshot.volumes.iter().any(|v| !v.is_finite()) {
            return Err(DataError::MissingField {
                symbol: symbol.to_string(),
                field: "volumes",
            });
        }

        let mut prices = snapshot.closes.clone();
        prices.push(close);
        let mut volumes = snapshot.volumes.clone();
        volumes.resize(snapshot.closes.len(), 0.0);
        volumes.push(volume);
        let ind = Indicators::from_series(&prices, &volumes, HISTORY_WINDOW);

        let prev_close = snapshot.closes.last().copied().filter(|p| *p > 0.0);
        let return_1 = prev_close.map(|p| close / p - 1.0).unwrap_or(0.0);
        let range_pct = ((high - low) / close).max(0.0);
        let gap = |period| ind.sma(period).map(|sma| close / sma - 1.0).unwrap_or(0.0);
        let rsi = ind.rsi(14).map(|r| r / 100.0).unwrap_or(0.5);
        let bollinger_pos = match ind.bollinger_bands(20, 2.0) {
            Some((upper, _, lower)) if upper > lower => (close - lower) / (upper - lower) - 0.5,
            _ => 0.0,
        };
        let volatility = ind.volatility(VOLATILITY_PERIOD).unwrap_or(range_pct);
        let volume_ratio = ind.volume_ratio(VOLATILITY_PERIOD).unwrap_or(1.0);

        Ok(FeatureVector {
            symbol: symbol.to_string(),
            timestamp: snapshot.timestamp,
            values: vec![
                close,
                return_1,
                range_pct,
                gap(20),
                gap(50),
                rsi,
                bollinger_pos,
                volatility,
                volume_ratio,
                sentiment,
            ],
        })
    }
}
