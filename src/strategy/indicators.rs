use std::collections::VecDeque;

/// Rolling price/volume window used by the feature builder.
pub struct Indicators {
    prices: VecDeque<f64>,
    volumes: VecDeque<f64>,
    max_len: usize,
}

impl Indicators {
    pub fn new(max_len: usize) -> Self {
        Self {
            prices: VecDeque::with_capacity(max_len),
            volumes: VecDeque::with_capacity(max_len),
            max_len,
        }
    }

    /// Builds a window from oldest-first series, keeping the newest `max_len` points.
    pub fn from_series(prices: &[f64], volumes: &[f64], max_len: usize) -> Self {
        let mut indicators = Self::new(max_len);
        for (i, price) in prices.iter().enumerate() {
            let volume = volumes.get(i).copied().unwrap_or(0.0);
            indicators.add_data(*price, volume);
        }
        indicators
    }

    pub fn add_data(&mut self, price: f64, volume: f64) {
        if self.prices.len() >= self.max_len {
            self.prices.pop_front();
            self.volumes.pop_front();
        }

        self.prices.push_back(price);
        self.volumes.push_back(volume);
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    pub fn sma(&self, period: usize) -> Option<f64> {
        if period == 0 || self.prices.len() < period {
            return None;
        }

        let sum: f64 = self.prices.iter().rev().take(period).sum();
        Some(sum / period as f64)
    }

    /// EMA seeded with the SMA of the first `period` points.
    pub fn ema(&self, period: usize) -> Option<f64> {
        if period == 0 || self.prices.len() < period {
            return None;
        }

        let multiplier = 2.0 / (period as f64 + 1.0);
        let mut ema = self.prices.iter().take(period).sum::<f64>() / period as f64;

        for price in self.prices.iter().skip(period) {
            ema = (price - ema) * multiplier + ema;
        }

        Some(ema)
    }

    pub fn rsi(&self, period: usize) -> Option<f64> {
        if period == 0 || self.prices.len() < period + 1 {
            return None;
        }

        let mut gains = 0.0;
        let mut losses = 0.0;

        for i in (self.prices.len() - period)..self.prices.len() {
            let change = self.prices[i] - self.prices[i - 1];
            if change > 0.0 {
                gains += change;
            } else {
                losses += -change;
            }
        }

        let avg_gain = gains / period as f64;
        let avg_loss = losses / period as f64;

        if avg_loss == 0.0 {
            return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
        }

        let rs = avg_gain / avg_loss;
        Some(100.0 - (100.0 / (1.0 + rs)))
    }

    pub fn bollinger_bands(&self, period: usize, std_dev: f64) -> Option<(f64, f64, f64)> {
        let sma = self.sma(period)?;

        let variance: f64 = self
            .prices
            .iter()
            .rev()
            .take(period)
            .map(|p| (p - sma).powi(2))
            .sum::<f64>()
            / period as f64;

        let std = variance.sqrt();
        let upper = sma + (std_dev * std);
        let lower = sma - (std_dev * std);

        Some((upper, sma, lower))
    }

    /// Standard deviation of simple returns over the last `period` returns.
    pub fn volatility(&self, period: usize) -> Option<f64> {
        if period < 2 || self.prices.len() < period + 1 {
            return None;
        }

        let start = self.prices.len() - period;
        let returns: Vec<f64> = (start..self.prices.len())
            .filter(|&i| self.prices[i - 1] != 0.0)
            .map(|i| self.prices[i] / self.prices[i - 1] - 1.0)
            .collect();
        if returns.len() < 2 {
            return None;
        }

        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
            / (returns.len() - 1) as f64;

        Some(variance.sqrt())
    }

    pub fn volume_ratio(&self, period: usize) -> Option<f64> {
        if period == 0 || self.volumes.len() < period {
            return None;
        }

        let recent_avg: f64 = self.volumes.iter().rev().take(period).sum::<f64>() / period as f64;
        if recent_avg == 0.0 {
            return None;
        }
        let latest = *self.volumes.back()?;

        Some(latest / recent_avg)
    }
}
