//! Hard risk gate between the advisory layers and execution.
//!
//! The gate evaluates a fixed, configured list of independent checks. Each
//! check yields nothing or one reason code; the decision is BLOCK iff any
//! reason was produced. A check that cannot be evaluated produces a reason.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::canonical::{digest_of, sha256_hex};
use crate::evidence::{schema, EvidencePack};
use crate::kill_switch::KillSwitch;
use crate::logging::{log_gate_decision, log_risk_check};
use crate::scope::ScopeTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    DataMissing,
    DataStale,
    ExposureUnavailable,
    MaxExposure,
    DailyLossUnavailable,
    MaxDailyLoss,
    TradeCountUnavailable,
    MaxTradesPerDay,
    CooldownAfterLoss,
    SpreadUnavailable,
    SpreadTooWide,
    VolatilityUnavailable,
    VolatilityTooHigh,
    UpstreamEvidenceMissing,
    UpstreamSchemaInvalid,
    UpstreamScopeViolation,
    UpstreamBlockingFinding,
    KillSwitchEngaged,
    CheckTimeout,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::DataMissing => "DATA_MISSING",
            ReasonCode::DataStale => "DATA_STALE",
            ReasonCode::ExposureUnavailable => "EXPOSURE_UNAVAILABLE",
            ReasonCode::MaxExposure => "MAX_EXPOSURE",
            ReasonCode::DailyLossUnavailable => "DAILY_LOSS_UNAVAILABLE",
            ReasonCode::MaxDailyLoss => "MAX_DAILY_LOSS",
            ReasonCode::TradeCountUnavailable => "TRADE_COUNT_UNAVAILABLE",
            ReasonCode::MaxTradesPerDay => "MAX_TRADES_PER_DAY",
            ReasonCode::CooldownAfterLoss => "COOLDOWN_AFTER_LOSS",
            ReasonCode::SpreadUnavailable => "SPREAD_UNAVAILABLE",
            ReasonCode::SpreadTooWide => "SPREAD_TOO_WIDE",
            ReasonCode::VolatilityUnavailable => "VOLATILITY_UNAVAILABLE",
            ReasonCode::VolatilityTooHigh => "VOLATILITY_TOO_HIGH",
            ReasonCode::UpstreamEvidenceMissing => "UPSTREAM_EVIDENCE_MISSING",
            ReasonCode::UpstreamSchemaInvalid => "UPSTREAM_SCHEMA_INVALID",
            ReasonCode::UpstreamScopeViolation => "UPSTREAM_SCOPE_VIOLATION",
            ReasonCode::UpstreamBlockingFinding => "UPSTREAM_BLOCKING_FINDING",
            ReasonCode::KillSwitchEngaged => "KILL_SWITCH_ENGAGED",
            ReasonCode::CheckTimeout => "CHECK_TIMEOUT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateStatus {
    Allow,
    Block,
}

impl GateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateStatus::Allow => "ALLOW",
            GateStatus::Block => "BLOCK",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    DataFreshness,
    Exposure,
    DailyLoss,
    TradeCount,
    Cooldown,
    SpreadVolatility,
    UpstreamEvidence,
    KillSwitch,
}

impl CheckKind {
    pub fn default_order() -> Vec<CheckKind> {
        vec![
            CheckKind::KillSwitch,
            CheckKind::DataFreshness,
            CheckKind::Exposure,
            CheckKind::DailyLoss,
            CheckKind::TradeCount,
            CheckKind::Cooldown,
            CheckKind::SpreadVolatility,
            CheckKind::UpstreamEvidence,
        ]
    }
}

/// Deployment configuration. None of these values are hard-coded policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_data_age_secs: u64,
    /// Notional exposure as a fraction of equity.
    pub max_exposure_pct: f64,
    /// Absolute currency loss (realized + unrealized) allowed per day.
    pub max_daily_loss: f64,
    pub max_trades_per_day: u32,
    pub cooldown_after_loss_secs: u64,
    pub max_spread_bps: f64,
    pub max_volatility: f64,
    pub required_upstream: Vec<String>,
    pub check_order: Vec<CheckKind>,
    pub eval_budget_ms: u64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_data_age_secs: 60,
            max_exposure_pct: 0.10,
            max_daily_loss: 100.0,
            max_trades_per_day: 3,
            cooldown_after_loss_secs: 600,
            max_spread_bps: 25.0,
            max_volatility: 0.05,
            required_upstream: vec![
                "research".to_string(),
                "outlook".to_string(),
                "advisory".to_string(),
                "critic".to_string(),
            ],
            check_order: CheckKind::default_order(),
            eval_budget_ms: 250,
        }
    }
}

/// Live risk inputs. `None` means the value could not be obtained.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskInputs {
    pub symbol: String,
    pub data_as_of: Option<DateTime<Utc>>,
    pub equity: Option<f64>,
    pub exposure_notional: Option<f64>,
    pub realized_pnl_today: Option<f64>,
    pub unrealized_pnl: Option<f64>,
    pub trades_today: Option<u32>,
    /// `None` here means no loss has been recorded, not that the value is unknown.
    pub last_loss_at: Option<DateTime<Utc>>,
    pub spread_bps: Option<f64>,
    pub volatility: Option<f64>,
}

impl RiskInputs {
    /// Canonical digest. NaN and infinities are tagged so they never collide
    /// with a missing value.
    pub fn digest(&self) -> String {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            let floats = [
                ("equity", self.equity),
                ("exposure_notional", self.exposure_notional),
                ("realized_pnl_today", self.realized_pnl_today),
                ("unrealized_pnl", self.unrealized_pnl),
                ("spread_bps", self.spread_bps),
                ("volatility", self.volatility),
            ];
            for (key, x) in floats {
                if let Some(x) = x.filter(|x| !x.is_finite()) {
                    let tag = if x.is_nan() { "NaN" } else if x > 0.0 { "+Inf" } else { "-Inf" };
                    map.insert(key.to_string(), json!({ "non_finite": tag }));
                }
            }
        }
        digest_of(&value).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskGateDecision {
    pub gate_id: String,
    pub status: GateStatus,
    pub reasons: Vec<ReasonCode>,
    pub as_of_utc: DateTime<Utc>,
    pub inputs_snapshot_digest: String,
}

impl RiskGateDecision {
    pub fn is_allow(&self) -> bool {
        self.status == GateStatus::Allow && self.reasons.is_empty()
    }

    pub fn reason_strings(&self) -> Vec<String> {
        self.reasons.iter().map(|r| r.as_str().to_string()).collect()
    }

    /// Canonical digest of the whole decision.
    pub fn decision_hash(&self) -> String {
        digest_of(self).unwrap_or_default()
    }
}

pub struct RiskGate {
    limits: RiskLimits,
    scopes: Arc<ScopeTable>,
    kill_switch: Option<KillSwitch>,
}

impl RiskGate {
    pub fn new(limits: RiskLimits, scopes: Arc<ScopeTable>) -> Self {
        Self { limits, scopes, kill_switch: None }
    }

    pub fn with_kill_switch(mut self, kill_switch: KillSwitch) -> Self {
        self.kill_switch = Some(kill_switch);
        self
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Deterministic for identical `(inputs, upstream, now)`.
    pub fn evaluate(&self, inputs: &RiskInputs, upstream: &[EvidencePack], now: DateTime<Utc>) -> RiskGateDecision {
        let started = Instant::now();
        let budget = Duration::from_millis(self.limits.eval_budget_ms);
        let mut reasons = Vec::new();

        for check in &self.limits.check_order {
            if started.elapsed() > budget {
                reasons.push(ReasonCode::CheckTimeout);
                break;
            }
            let outcome = match check {
                CheckKind::KillSwitch => self.check_kill_switch(),
                CheckKind::DataFreshness => self.check_freshness(inputs, now),
                CheckKind::Exposure => self.check_exposure(inputs),
                CheckKind::DailyLoss => self.check_daily_loss(inputs),
                CheckKind::TradeCount => self.check_trade_count(inputs),
                CheckKind::Cooldown => self.check_cooldown(inputs, now),
                CheckKind::SpreadVolatility => self.check_spread_volatility(inputs),
                CheckKind::UpstreamEvidence => self.check_upstream(upstream),
            };
            if let Some(reason) = outcome {
                reasons.push(reason);
            }
        }

        let inputs_snapshot_digest = inputs.digest();
        let status = if reasons.is_empty() { GateStatus::Allow } else { GateStatus::Block };
        let as_of = now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let gate_id = format!(
            "gate-{}",
            &sha256_hex(format!("{}|{}", inputs_snapshot_digest, as_of).as_bytes())[..16]
        );
        let decision = RiskGateDecision {
            gate_id,
            status,
            reasons,
            as_of_utc: now,
            inputs_snapshot_digest,
        };
        log_gate_decision(
            &decision.gate_id,
            decision.status.as_str(),
            &decision.reason_strings(),
            &decision.inputs_snapshot_digest,
        );
        decision
    }

    fn check_kill_switch(&self) -> Option<ReasonCode> {
        match &self.kill_switch {
            Some(ks) if ks.is_engaged() => Some(ReasonCode::KillSwitchEngaged),
            _ => None,
        }
    }

    fn check_freshness(&self, inputs: &RiskInputs, now: DateTime<Utc>) -> Option<ReasonCode> {
        let Some(as_of) = inputs.data_as_of else {
            return Some(ReasonCode::DataMissing);
        };
        let age = now.signed_duration_since(as_of).num_seconds();
        // data stamped in the future is as untrustworthy as old data
        if age < 0 || age as u64 > self.limits.max_data_age_secs {
            log_risk_check("data_freshness", "block", age as f64, self.limits.max_data_age_secs as f64);
            return Some(ReasonCode::DataStale);
        }
        None
    }

    fn check_exposure(&self, inputs: &RiskInputs) -> Option<ReasonCode> {
        let (Some(equity), Some(notional)) = (inputs.equity, inputs.exposure_notional) else {
            return Some(ReasonCode::ExposureUnavailable);
        };
        if !equity.is_finite() || !notional.is_finite() || equity <= 0.0 {
            return Some(ReasonCode::ExposureUnavailable);
        }
        let exposure = notional.abs() / equity;
        if exposure > self.limits.max_exposure_pct {
            log_risk_check("exposure", "block", exposure, self.limits.max_exposure_pct);
            return Some(ReasonCode::MaxExposure);
        }
        None
    }

    fn check_daily_loss(&self, inputs: &RiskInputs) -> Option<ReasonCode> {
        let (Some(realized), Some(unrealized)) = (inputs.realized_pnl_today, inputs.unrealized_pnl) else {
            return Some(ReasonCode::DailyLossUnavailable);
        };
        let total = realized + unrealized;
        if !total.is_finite() {
            return Some(ReasonCode::DailyLossUnavailable);
        }
        if total < 0.0 && total.abs() >= self.limits.max_daily_loss {
            log_risk_check("daily_loss", "block", total.abs(), self.limits.max_daily_loss);
            return Some(ReasonCode::MaxDailyLoss);
        }
        None
    }

    fn check_trade_count(&self, inputs: &RiskInputs) -> Option<ReasonCode> {
        let Some(trades) = inputs.trades_today else {
            return Some(ReasonCode::TradeCountUnavailable);
        };
        if trades >= self.limits.max_trades_per_day {
            log_risk_check("trade_count", "block", trades as f64, self.limits.max_trades_per_day as f64);
            return Some(ReasonCode::MaxTradesPerDay);
        }
        None
    }

    fn check_cooldown(&self, inputs: &RiskInputs, now: DateTime<Utc>) -> Option<ReasonCode> {
        let last_loss = inputs.last_loss_at?;
        let since = now.signed_duration_since(last_loss).num_seconds();
        if since < 0 || (since as u64) < self.limits.cooldown_after_loss_secs {
            return Some(ReasonCode::CooldownAfterLoss);
        }
        None
    }

    fn check_spread_volatility(&self, inputs: &RiskInputs) -> Option<ReasonCode> {
        let Some(spread) = inputs.spread_bps.filter(|s| s.is_finite()) else {
            return Some(ReasonCode::SpreadUnavailable);
        };
        if spread > self.limits.max_spread_bps {
            return Some(ReasonCode::SpreadTooWide);
        }
        let Some(vol) = inputs.volatility.filter(|v| v.is_finite()) else {
            return Some(ReasonCode::VolatilityUnavailable);
        };
        if vol > self.limits.max_volatility {
            return Some(ReasonCode::VolatilityTooHigh);
        }
        None
    }

    fn check_upstream(&self, upstream: &[EvidencePack]) -> Option<ReasonCode> {
        for layer in &self.limits.required_upstream {
            let Some(pack) = upstream.iter().rev().find(|p| p.layer_id() == layer) else {
                return Some(ReasonCode::UpstreamEvidenceMissing);
            };
            if schema::validate(pack).is_err() {
                return Some(ReasonCode::UpstreamSchemaInvalid);
            }
            if schema::check_scope(pack, &self.scopes).is_err() {
                return Some(ReasonCode::UpstreamScopeViolation);
            }
            if pack.has_blocking_finding() {
                return Some(ReasonCode::UpstreamBlockingFinding);
            }
        }
        None
    }
}
