use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::portfolio::{PortfolioState, PositionSide};
use crate::strategy::{FeatureVector, FusedSignal};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Max notional per symbol as a fraction of equity.
    pub max_position_size: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub max_open_trades: usize,
    pub max_daily_trades: u32,
    /// Fraction below peak equity that trips the breaker.
    pub max_drawdown: f64,
    pub breaker_cooldown_ms: u64,
    pub risk_budget_fraction: f64,
    pub risk_multiplier: f64,
    pub min_confidence: f64,
    /// Max notional per correlation group as a fraction of equity.
    pub max_correlated_exposure: f64,
    /// Symbol to group. Ungrouped symbols form their own group.
    pub correlation_groups: HashMap<String, String>,
    pub evaluation_deadline_ms: u64,
    /// Scale size by volatility regime before the cap.
    pub regime_size_adjustment: bool,
    /// Blend the volatility size with a Kelly size from the realized trade record.
    pub kelly_sizing: bool,
    /// Realized trades needed before the Kelly blend applies.
    pub kelly_min_trades: u32,
    /// Pairwise return correlations, looked up in either direction.
    pub correlations: HashMap<String, HashMap<String, f64>>,
    /// Correlation with a held symbol above which the size shrinks.
    pub correlation_threshold: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_size: 0.20,
            stop_loss_pct: 0.02,
            take_profit_pct: 0.04,
            max_open_trades: 3,
            max_daily_trades: 10,
            max_drawdown: 0.15,
            breaker_cooldown_ms: 3_600_000,
            risk_budget_fraction: 0.01,
            risk_multiplier: 2.0,
            min_confidence: 0.6,
            max_correlated_exposure: 0.5,
            correlation_groups: HashMap::new(),
            evaluation_deadline_ms: 50,
            regime_size_adjustment: false,
            kelly_sizing: false,
            kelly_min_trades: 20,
            correlations: HashMap::new(),
            correlation_threshold: 0.5,
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<(), String> {
        let fraction = |name: &str, value: f64| {
            if value.is_finite() && value > 0.0 && value <= 1.0 {
                Ok(())
            } else {
                Err(format!("risk.{} must be in (0, 1], got {}", name, value))
            }
        };
        fraction("max_position_size", self.max_position_size)?;
        fraction("stop_loss_pct", self.stop_loss_pct)?;
        fraction("max_drawdown", self.max_drawdown)?;
        fraction("risk_budget_fraction", self.risk_budget_fraction)?;
        if !(self.take_profit_pct.is_finite() && self.take_profit_pct > 0.0) {
            return Err(format!("risk.take_profit_pct must be positive, got {}", self.take_profit_pct));
        }
        if !(self.max_correlated_exposure.is_finite() && self.max_correlated_exposure > 0.0) {
            return Err("risk.max_correlated_exposure must be positive".to_string());
        }
        if !(self.risk_multiplier.is_finite() && self.risk_multiplier > 0.0) {
            return Err("risk.risk_multiplier must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(format!("risk.min_confidence must be in [0, 1], got {}", self.min_confidence));
        }
        if self.max_open_trades == 0 || self.max_daily_trades == 0 {
            return Err("risk.max_open_trades and risk.max_daily_trades must be at least 1".to_string());
        }
        if self.evaluation_deadline_ms == 0 {
            return Err("risk.evaluation_deadline_ms must be positive".to_string());
        }
        if !(0.0..1.0).contains(&self.correlation_threshold) {
            return Err(format!(
                "risk.correlation_threshold must be in [0, 1), got {}",
                self.correlation_threshold
            ));
        }
        for (a, row) in &self.correlations {
            for (b, rho) in row {
                if !(rho.is_finite() && (-1.0..=1.0).contains(rho)) {
                    return Err(format!("risk.correlations.{}.{} must be in [-1, 1], got {}", a, b, rho));
                }
            }
        }
        Ok(())
    }

    fn correlation(&self, a: &str, b: &str) -> Option<f64> {
        self.correlations
            .get(a)
            .and_then(|row| row.get(b))
            .or_else(|| self.correlations.get(b).and_then(|row| row.get(a)))
            .copied()
    }

    fn group_of<'a>(&'a self, symbol: &'a str) -> &'a str {
        self.correlation_groups
            .get(symbol)
            .map(String::as_str)
            .unwrap_or(symbol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskState {
    Idle,
    Evaluating,
    Approved,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    DrawdownBreach,
    MaxDailyTrades,
    MaxOpenTrades,
    ExposureLimit,
    LowConfidence,
    PositionExists,
    NoSignal,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::DrawdownBreach => "drawdown_breach",
            BlockReason::MaxDailyTrades => "max_daily_trades",
            BlockReason::MaxOpenTrades => "max_open_trades",
            BlockReason::ExposureLimit => "exposure_limit",
            BlockReason::LowConfidence => "low_confidence",
            BlockReason::PositionExists => "position_exists",
            BlockReason::NoSignal => "no_signal",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sized order the risk manager let through.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovedOrder {
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RiskDecision {
    Approved(ApprovedOrder),
    Blocked(BlockReason),
}

impl RiskDecision {
    pub fn state(&self) -> RiskState {
        match self {
            RiskDecision::Approved(_) => RiskState::Approved,
            RiskDecision::Blocked(_) => RiskState::Blocked,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Breaker {
    Armed,
    Tripped { since: DateTime<Utc>, drawdown: f64 },
}

/// Gates fused signals against portfolio-wide limits.
///
/// Shared by all symbol workers behind one lock, so evaluations are serialized
/// and the drawdown check always reads a single consistent aggregate.
#[derive(Debug)]
pub struct RiskManager {
    config: RiskConfig,
    state: RiskState,
    breaker: Breaker,
    /// Notional of approved entries not yet terminal, by symbol.
    in_flight: HashMap<String, f64>,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            state: RiskState::Idle,
            breaker: Breaker::Armed,
            in_flight: HashMap::new(),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn state(&self) -> RiskState {
        self.state
    }

    pub fn breaker_tripped(&self) -> bool {
        matches!(self.breaker, Breaker::Tripped { .. })
    }

    pub fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.breaker {
            Breaker::Tripped { since, .. } => {
                now - since >= ChronoDuration::milliseconds(self.config.breaker_cooldown_ms as i64)
            }
            Breaker::Armed => false,
        }
    }

    /// Re-arms the breaker. The caller rebases the ledger's peak equity.
    pub fn reset_breaker(&mut self) {
        if let Breaker::Tripped { drawdown, .. } = self.breaker {
            tracing::info!("🔄 Drawdown breaker reset (tripped at {:.2}%)", drawdown * 100.0);
        }
        self.breaker = Breaker::Armed;
    }

    /// Releases the reservation held by an approved entry once its order is terminal.
    pub fn release(&mut self, symbol: &str) {
        self.in_flight.remove(symbol);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Evaluates with the configured deadline. `None` means the deadline was overrun
    /// and the signal must be treated as flat.
    pub fn evaluate_within_deadline(
        &mut self,
        signal: &FusedSignal,
        features: &FeatureVector,
        portfolio: &PortfolioState,
        now: DateTime<Utc>,
    ) -> Option<RiskDecision> {
        let deadline = Duration::from_millis(self.config.evaluation_deadline_ms);
        let started = Instant::now();
        let decision = self.evaluate(signal, features, portfolio, now);
        if started.elapsed() > deadline {
            tracing::warn!(
                "⏱️  Risk evaluation for {} overran {:?}; signal dropped",
                signal.symbol,
                deadline
            );
            if matches!(decision, RiskDecision::Approved(_)) {
                self.release(&signal.symbol);
            }
            self.state = RiskState::Idle;
            return None;
        }
        Some(decision)
    }

    pub fn evaluate(
        &mut self,
        signal: &FusedSignal,
        features: &FeatureVector,
        portfolio: &PortfolioState,
        now: DateTime<Utc>,
    ) -> RiskDecision {
        self.state = RiskState::Evaluating;
        let decision = match self.check(signal, features, portfolio, now) {
            Ok(order) => {
                self.in_flight.insert(order.symbol.clone(), order.size * order.entry_price);
                tracing::info!(
                    "✅ {} {} approved: size {:.6} @ {:.4} (SL {:.4}, TP {:.4})",
                    order.symbol,
                    order.side.as_str(),
                    order.size,
                    order.entry_price,
                    order.stop_loss,
                    order.take_profit
                );
                RiskDecision::Approved(order)
            }
            Err(reason) => {
                if reason != BlockReason::NoSignal {
                    tracing::debug!("❌ {} blocked: {}", signal.symbol, reason);
                }
                RiskDecision::Blocked(reason)
            }
        };
        self.state = decision.state();
        decision
    }

    fn check(
        &mut self,
        signal: &FusedSignal,
        features: &FeatureVector,
        portfolio: &PortfolioState,
        now: DateTime<Utc>,
    ) -> Result<ApprovedOrder, BlockReason> {
        if self.breaker_tripped() {
            return Err(BlockReason::DrawdownBreach);
        }
        if portfolio.drawdown >= self.config.max_drawdown {
            tracing::error!(
                "🚨 Drawdown {:.2}% reached limit {:.2}%; trading blocked",
                portfolio.drawdown * 100.0,
                self.config.max_drawdown * 100.0
            );
            self.breaker = Breaker::Tripped {
                since: now,
                drawdown: portfolio.drawdown,
            };
            return Err(BlockReason::DrawdownBreach);
        }

        let side = match PositionSide::from_action(signal.action) {
            Some(side) if signal.fusion_error.is_none() => side,
            _ => return Err(BlockReason::NoSignal),
        };
        let symbol = signal.symbol.as_str();

        // Approved entries still executing count against both caps.
        let pending = self
            .in_flight
            .keys()
            .filter(|s| !portfolio.has_position(s))
            .count();
        if portfolio.daily_trades as usize + pending >= self.config.max_daily_trades as usize {
            return Err(BlockReason::MaxDailyTrades);
        }
        if portfolio.open_trades + pending >= self.config.max_open_trades {
            return Err(BlockReason::MaxOpenTrades);
        }
        if portfolio.has_position(symbol) || self.in_flight.contains_key(symbol) {
            return Err(BlockReason::PositionExists);
        }

        let price = features.close();
        let equity = portfolio.equity;
        if !(price.is_finite() && price > 0.0 && equity > 0.0) {
            return Err(BlockReason::ExposureLimit);
        }

        let size = self.position_size(symbol, features, portfolio);
        if !(size.is_finite() && size > 0.0) {
            return Err(BlockReason::ExposureLimit);
        }

        let group = self.config.group_of(symbol);
        let group_exposure: f64 = portfolio
            .positions
            .values()
            .filter(|p| self.config.group_of(&p.symbol) == group)
            .map(|p| p.notional())
            .chain(
                self.in_flight
                    .iter()
                    .filter(|(s, _)| self.config.group_of(s) == group)
                    .map(|(_, notional)| *notional),
            )
            .sum();
        if group_exposure + size * price > self.config.max_correlated_exposure * equity + 1e-9 {
            return Err(BlockReason::ExposureLimit);
        }

        if signal.confidence < self.config.min_confidence {
            return Err(BlockReason::LowConfidence);
        }

        let (stop_loss, take_profit) = match side {
            PositionSide::Long => (
                price * (1.0 - self.config.stop_loss_pct),
                price * (1.0 + self.config.take_profit_pct),
            ),
            PositionSide::Short => (
                price * (1.0 + self.config.stop_loss_pct),
                price * (1.0 - self.config.take_profit_pct),
            ),
        };

        Ok(ApprovedOrder {
            symbol: symbol.to_string(),
            side,
            size,
            entry_price: price,
            stop_loss,
            take_profit,
            confidence: signal.confidence,
        })
    }

    /// Volatility-targeted size, capped so one symbol never exceeds
    /// `max_position_size × equity` in notional.
    ///
    /// Before the cap the size is scaled by regime when enabled, shrunk when `symbol`
    /// correlates with a held or in-flight symbol, and blended with the Kelly size
    /// once enough trades are recorded.
    pub fn position_size(&self, symbol: &str, features: &FeatureVector, portfolio: &PortfolioState) -> f64 {
        let equity = portfolio.equity;
        let price = features.close();
        let cap = self.config.max_position_size * equity / price;
        let price_volatility = features.price_volatility();

        let raw = if price_volatility.is_finite() && price_volatility > 0.0 {
            (self.config.risk_budget_fraction * equity)
                / (price_volatility * self.config.risk_multiplier)
        } else {
            cap
        };

        let mut adjusted = if self.config.regime_size_adjustment {
            raw * regime_multiplier(features.volatility())
        } else {
            raw
        };

        let max_correlation = portfolio
            .positions
            .keys()
            .chain(self.in_flight.keys())
            .filter(|held| held.as_str() != symbol)
            .filter_map(|held| self.config.correlation(symbol, held))
            .map(f64::abs)
            .fold(0.0, f64::max);
        if max_correlation > self.config.correlation_threshold {
            adjusted *= (1.0 - (max_correlation - self.config.correlation_threshold)).max(0.5);
        }

        if self.config.kelly_sizing && portfolio.trade_stats.trades() >= self.config.kelly_min_trades {
            if let Some(kelly) = portfolio.trade_stats.kelly_fraction() {
                let fraction = kelly.clamp(0.0, self.config.max_position_size);
                adjusted = (adjusted + fraction * equity / price) / 2.0;
            }
        }

        tracing::debug!(
            "📊 Position sizing: equity=${:.2}, vol={:.4}, raw={:.6}, cap={:.6}",
            equity,
            price_volatility,
            adjusted,
            cap
        );
        adjusted.min(cap)
    }
}

/// Larger in calm markets, smaller in turbulent ones.
fn regime_multiplier(volatility: f64) -> f64 {
    if volatility >= 0.03 {
        0.8
    } else if volatility < 0.01 {
        1.2
    } else {
        1.0
    }
}
