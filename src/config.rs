use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::exec::{ExecConfig, OrphanPolicy, RetryConfig};
use crate::registry::{ModelProfile, ModelRegistry};
use crate::risk::{CheckKind, RiskLimits};
use crate::scope::{CapabilityScope, ScopeTable};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub symbol: String,
    pub git_ref: String,
    pub sqlite_path: String,
    pub wal_path: String,
    pub wal_fsync: bool,
    pub scopes_path: Option<String>,
    pub registry_path: Option<String>,
    /// JSON file holding one cycle input or a list of them, re-read every cycle.
    pub inputs_path: String,
    pub kill_file: String,
    pub kill_poll_ms: u64,
    /// Operator HMAC secret. Empty means no token will ever verify.
    pub operator_secret: String,
    pub invoke_timeout_ms: u64,
    pub llm_timeout_ms: u64,
    /// 0 means one worker per CPU.
    pub worker_threads: usize,
    pub cycle_secs: u64,
    pub reconcile_secs: u64,
    /// How long in-flight runs get to unwind after ctrl-c.
    pub shutdown_grace_ms: u64,
    pub auto_approve: bool,
    pub risk: RiskLimits,
    pub exec: ExecConfig,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = RiskLimits::default();
        let check_order = std::env::var("RISK_CHECK_ORDER")
            .ok()
            .and_then(|v| parse_check_order(&v))
            .unwrap_or(defaults.check_order.clone());
        let required_upstream = std::env::var("RISK_REQUIRED_UPSTREAM")
            .ok()
            .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or(defaults.required_upstream.clone());
        let risk = RiskLimits {
            max_data_age_secs: env_or("MAX_DATA_AGE_SECS", defaults.max_data_age_secs),
            max_exposure_pct: env_or("MAX_EXPOSURE_PCT", defaults.max_exposure_pct),
            max_daily_loss: env_or("MAX_DAILY_LOSS", defaults.max_daily_loss),
            max_trades_per_day: env_or("MAX_TRADES_DAY", defaults.max_trades_per_day),
            cooldown_after_loss_secs: env_or("COOLDOWN_SECS", defaults.cooldown_after_loss_secs),
            max_spread_bps: env_or("MAX_SPREAD_BPS", defaults.max_spread_bps),
            max_volatility: env_or("MAX_VOLATILITY", defaults.max_volatility),
            required_upstream,
            check_order,
            eval_budget_ms: env_or("RISK_EVAL_BUDGET_MS", defaults.eval_budget_ms),
        };
        let retry_defaults = RetryConfig::default();
        let exec = ExecConfig {
            decision_max_age_secs: env_or("DECISION_MAX_AGE_SECS", 30),
            retry: RetryConfig {
                max_retries: env_or("VENUE_MAX_RETRIES", retry_defaults.max_retries),
                base_delay_ms: env_or("VENUE_BASE_DELAY_MS", retry_defaults.base_delay_ms),
                max_delay_ms: env_or("VENUE_MAX_DELAY_MS", retry_defaults.max_delay_ms),
                jitter_factor: env_or("VENUE_JITTER", retry_defaults.jitter_factor),
            },
            orphan_policy: env_or("ORPHAN_POLICY", OrphanPolicy::Cancel),
            closed_retention_secs: env_or("CLOSED_RETENTION_SECS", 3_600),
        };
        Self {
            symbol: std::env::var("SYMBOL").unwrap_or_else(|_| "NQ".to_string()),
            git_ref: std::env::var("GIT_REF").unwrap_or_else(|_| "unknown".to_string()),
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./govfx.sqlite".to_string()),
            wal_path: std::env::var("WAL_PATH").unwrap_or_else(|_| "./orders.wal".to_string()),
            wal_fsync: env_flag("WAL_FSYNC", true),
            scopes_path: std::env::var("SCOPES_PATH").ok(),
            registry_path: std::env::var("REGISTRY_PATH").ok(),
            inputs_path: std::env::var("INPUTS_PATH").unwrap_or_else(|_| "./inputs.json".to_string()),
            kill_file: std::env::var("KILL_FILE").unwrap_or_else(|_| "/tmp/GOVFX_STOP".to_string()),
            kill_poll_ms: env_or("KILL_POLL_MS", 500),
            operator_secret: std::env::var("OPERATOR_SECRET").unwrap_or_default(),
            invoke_timeout_ms: env_or("INVOKE_TIMEOUT_MS", 30_000),
            llm_timeout_ms: env_or("LLM_TIMEOUT_MS", 25_000),
            worker_threads: env_or("WORKER_THREADS", 0),
            cycle_secs: env_or("CYCLE_SECS", 60),
            reconcile_secs: env_or("RECONCILE_SECS", 30),
            shutdown_grace_ms: env_or("SHUTDOWN_GRACE_MS", 5_000),
            auto_approve: env_flag("AUTO_APPROVE", false),
            risk,
            exec,
        }
    }

    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_millis(self.invoke_timeout_ms)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_millis(self.llm_timeout_ms)
    }

    /// JSON file when `SCOPES_PATH` is set, the built-in six-layer table otherwise.
    pub fn load_scopes(&self) -> Result<ScopeTable> {
        match &self.scopes_path {
            Some(path) => load_scopes(path),
            None => Ok(ScopeTable::default_pipeline()),
        }
    }

    pub fn load_registry(&self) -> Result<ModelRegistry> {
        match &self.registry_path {
            Some(path) => load_registry(path),
            None => Ok(ModelRegistry::default_pipeline()),
        }
    }
}

/// Comma-separated snake_case check names, e.g. `kill_switch,data_freshness`.
pub fn parse_check_order(s: &str) -> Option<Vec<CheckKind>> {
    let quoted: Vec<String> = s
        .split(',')
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| format!("\"{}\"", p))
        .collect();
    if quoted.is_empty() {
        return None;
    }
    serde_json::from_str(&format!("[{}]", quoted.join(","))).ok()
}

pub fn load_scopes(path: impl AsRef<Path>) -> Result<ScopeTable> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading scopes {}", path.display()))?;
    let scopes: Vec<CapabilityScope> =
        serde_json::from_str(&raw).with_context(|| format!("parsing scopes {}", path.display()))?;
    Ok(ScopeTable::from_scopes(scopes)?)
}

pub fn load_registry(path: impl AsRef<Path>) -> Result<ModelRegistry> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading registry {}", path.display()))?;
    let profiles: Vec<ModelProfile> =
        serde_json::from_str(&raw).with_context(|| format!("parsing registry {}", path.display()))?;
    Ok(ModelRegistry::from_profiles(profiles))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_check_order() {
        let order = parse_check_order("kill_switch, trade_count").unwrap();
        assert_eq!(order, vec![CheckKind::KillSwitch, CheckKind::TradeCount]);
        assert!(parse_check_order("kill_switch,bogus").is_none());
        assert!(parse_check_order(" ").is_none());
    }

    #[test]
    fn test_scope_file_rejects_read_only_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scopes.json");
        std::fs::write(
            &path,
            r#"[{"layer_id":"research","allowed_actions":["READ_MARKET_DATA","SUBMIT_ORDER"],"read_only":true,"max_autonomy":"READ_ONLY"}]"#,
        )
        .unwrap();
        assert!(load_scopes(&path).is_err());
    }

    #[test]
    fn test_registry_file_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(
            &path,
            r#"[{"model_id":"m","version":"2","layer_id":"research","priority":1,"autonomy":"RECOMMEND",
                "capabilities":["READ_MARKET_DATA"],"kind":{"type":"deterministic_algorithm","algorithm":"summarize"}}]"#,
        )
        .unwrap();
        let reg = load_registry(&path).unwrap();
        assert_eq!(reg.candidates("research")[0].qualified_id(), "m@2");
    }
}
