//! Process configuration from the environment.
//!
//! One variable per field, each with a default. `Config::validate` runs at
//! start-up; any `EngineError::Config` it returns is fatal.

use std::str::FromStr;

use crate::engine::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::exchange::paper::FaultProfile;
use crate::exchange::retry::RetryConfig;
use crate::feed::SyntheticConfig;
use crate::indicators::IndicatorConfig;
use crate::lifecycle::LifecycleConfig;
use crate::regime::ClassifierConfig;
use crate::risk::GateConfig;
use crate::selector::SelectorConfig;
use crate::strategies::StrategyConfig;
use crate::strategy::RiskParameters;

#[derive(Debug, Clone)]
pub struct Config {
    pub engine: EngineConfig,
    pub classifier: ClassifierConfig,
    pub selector: SelectorConfig,
    pub gate: GateConfig,
    pub lifecycle: LifecycleConfig,
    pub strategies: StrategyConfig,
    pub indicators: IndicatorConfig,
    pub synthetic: SyntheticConfig,
    /// `:memory:` keeps the ledger in process only
    pub sqlite_path: String,
    pub paper_slip: f64,
    pub faults: FaultProfile,
    /// Starting value for the operator-set health signal; unset disables it
    pub health_initial: Option<f64>,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

pub fn parse_symbols(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    pub fn from_env() -> Self {
        let engine = EngineConfig::default();
        let classifier = ClassifierConfig::default();
        let gate = GateConfig::default();
        let lifecycle = LifecycleConfig::default();
        let indicators = IndicatorConfig::default();
        let strat = StrategyConfig::default();
        let synth = SyntheticConfig::default();
        let cycle_interval_ms = env_or("CYCLE_MS", engine.cycle_interval_ms);

        Self {
            engine: EngineConfig {
                symbols: std::env::var("SYMBOLS")
                    .map(|v| parse_symbols(&v))
                    .unwrap_or(engine.symbols),
                cycle_interval_ms,
                snapshot_timeout_ms: env_or("SNAPSHOT_TIMEOUT_MS", engine.snapshot_timeout_ms),
                max_cycles: env_opt("MAX_CYCLES"),
            },
            classifier: ClassifierConfig {
                trend_threshold: env_or("TREND_THRESHOLD", classifier.trend_threshold),
                volatility_percentile_threshold: env_or(
                    "VOL_PCT_THRESHOLD",
                    classifier.volatility_percentile_threshold,
                ),
                breakout_sigma: env_or("BREAKOUT_SIGMA", classifier.breakout_sigma),
                min_confidence: env_or("MIN_CONFIDENCE", classifier.min_confidence),
            },
            selector: SelectorConfig {
                min_trades: env_or("MIN_TRADES", SelectorConfig::default().min_trades),
            },
            gate: GateConfig {
                starting_capital: env_or("STARTING_CAPITAL", gate.starting_capital),
                max_session_drawdown_frac: env_or("MAX_SESSION_DD_FRAC", gate.max_session_drawdown_frac),
                max_consecutive_losses: env_or("MAX_CONSEC_LOSSES", gate.max_consecutive_losses),
                health_critical: env_or("HEALTH_CRITICAL", gate.health_critical),
                stale_after_ms: env_or("STALE_AFTER_MS", gate.stale_after_ms),
            },
            lifecycle: LifecycleConfig {
                order_timeout_ms: env_or("ORDER_TIMEOUT_MS", lifecycle.order_timeout_ms),
                confirm_polls: env_or("CONFIRM_POLLS", lifecycle.confirm_polls),
                confirm_retry: RetryConfig {
                    max_retries: lifecycle.confirm_retry.max_retries,
                    base_delay_ms: env_or("CONFIRM_DELAY_MS", lifecycle.confirm_retry.base_delay_ms),
                    max_delay_ms: env_or("CONFIRM_MAX_DELAY_MS", lifecycle.confirm_retry.max_delay_ms),
                    jitter_factor: lifecycle.confirm_retry.jitter_factor,
                },
                close_retry: RetryConfig {
                    max_retries: env_or("CLOSE_RETRIES", lifecycle.close_retry.max_retries),
                    base_delay_ms: env_or("RETRY_BASE_MS", lifecycle.close_retry.base_delay_ms),
                    max_delay_ms: env_or("RETRY_MAX_MS", lifecycle.close_retry.max_delay_ms),
                    jitter_factor: env_or("RETRY_JITTER", lifecycle.close_retry.jitter_factor),
                },
            },
            strategies: StrategyConfig {
                trend_entry_momentum: env_or("TREND_ENTRY_MOM", strat.trend_entry_momentum),
                trend_exit_momentum: env_or("TREND_EXIT_MOM", strat.trend_exit_momentum),
                oversold: env_or("OVERSOLD", strat.oversold),
                overbought: env_or("OVERBOUGHT", strat.overbought),
                revert_exit: env_or("REVERT_EXIT", strat.revert_exit),
                trend_risk: RiskParameters {
                    stop_loss_fraction: env_or("TREND_STOP", strat.trend_risk.stop_loss_fraction),
                    take_profit_fraction: env_or("TREND_TARGET", strat.trend_risk.take_profit_fraction),
                    position_size_fraction: env_or("TREND_SIZE", strat.trend_risk.position_size_fraction),
                },
                range_risk: RiskParameters {
                    stop_loss_fraction: env_or("RANGE_STOP", strat.range_risk.stop_loss_fraction),
                    take_profit_fraction: env_or("RANGE_TARGET", strat.range_risk.take_profit_fraction),
                    position_size_fraction: env_or("RANGE_SIZE", strat.range_risk.position_size_fraction),
                },
            },
            indicators: IndicatorConfig {
                ma_fast: env_or("MA_FAST", indicators.ma_fast),
                ma_slow: env_or("MA_SLOW", indicators.ma_slow),
                rsi_period: env_or("RSI_PERIOD", indicators.rsi_period),
                atr_period: env_or("ATR_PERIOD", indicators.atr_period),
                band_period: env_or("BAND_PERIOD", indicators.band_period),
                band_mult: env_or("BAND_MULT", indicators.band_mult),
                trend_period: env_or("TREND_PERIOD", indicators.trend_period),
            },
            synthetic: SyntheticConfig {
                start_price: env_or("SYN_START_PRICE", synth.start_price),
                drift: env_or("SYN_DRIFT", synth.drift),
                volatility: env_or("SYN_VOL", synth.volatility),
                window: env_or("WINDOW", synth.window),
                candle_ms: env_or("SYN_CANDLE_MS", synth.candle_ms),
                seed: env_or("SYN_SEED", synth.seed),
            },
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./regimefx.sqlite".to_string()),
            paper_slip: env_or("PAPER_SLIP", 0.0005),
            faults: FaultProfile {
                reject_rate: env_or("FAULT_REJECT_RATE", 0.0),
                hang_rate: env_or("FAULT_HANG_RATE", 0.0),
                pending_rate: env_or("FAULT_PENDING_RATE", 0.0),
                close_fail_rate: env_or("FAULT_CLOSE_FAIL_RATE", 0.0),
            },
            health_initial: env_opt("HEALTH_VALUE"),
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        self.engine.validate()?;
        self.classifier.validate()?;
        self.selector.validate()?;
        self.gate.validate()?;
        self.lifecycle.validate()?;
        self.strategies.validate()?;
        self.indicators.validate()?;
        if self.synthetic.window < self.indicators.min_candles() {
            return Err(EngineError::config(
                "synthetic.window",
                format!("need at least {} candles for indicators", self.indicators.min_candles()),
            ));
        }
        if !(self.synthetic.start_price > 0.0 && self.synthetic.volatility >= 0.0) {
            return Err(EngineError::config("synthetic", "start price must be positive, volatility non-negative"));
        }
        if !(0.0..0.1).contains(&self.paper_slip) {
            return Err(EngineError::config("paper_slip", "must be in [0, 0.1)"));
        }
        let rates = [
            ("faults.reject_rate", self.faults.reject_rate),
            ("faults.hang_rate", self.faults.hang_rate),
            ("faults.pending_rate", self.faults.pending_rate),
            ("faults.close_fail_rate", self.faults.close_fail_rate),
        ];
        for (name, rate) in rates {
            if !(0.0..=1.0).contains(&rate) {
                return Err(EngineError::config(name, "must be in [0, 1]"));
            }
        }
        if self.sqlite_path.trim().is_empty() {
            return Err(EngineError::config("sqlite_path", "must not be empty"));
        }
        Ok(())
    }
}
