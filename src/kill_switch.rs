//! Out-of-band halt authority.
//!
//! The switch is an explicitly owned handle, cloned into every component
//! that must observe it. Readers only perform an atomic load.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::auth::OperatorAuth;
use crate::cancel::CancellationToken;
use crate::error::NotAuthorized;
use crate::logging::log_kill_switch;

pub const ACTION_ARM: &str = "arm";
pub const ACTION_RESET: &str = "reset";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KillSwitchState {
    pub armed: bool,
    pub engaged: bool,
    pub engaged_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

/// Everything engage and reset change together, including the flag's
/// cancellation token, lives behind one lock.
#[derive(Debug, Default)]
struct Detail {
    engaged_at: Option<DateTime<Utc>>,
    reason: Option<String>,
    used_nonces: HashSet<String>,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct Inner {
    armed: AtomicBool,
    engaged: AtomicBool,
    detail: Mutex<Detail>,
    auth: OperatorAuth,
}

#[derive(Debug, Clone)]
pub struct KillSwitch {
    inner: Arc<Inner>,
}

impl KillSwitch {
    pub fn new(auth: OperatorAuth) -> Self {
        Self {
            inner: Arc::new(Inner {
                armed: AtomicBool::new(false),
                engaged: AtomicBool::new(false),
                detail: Mutex::new(Detail::default()),
                auth,
            }),
        }
    }

    /// Never blocks on I/O. Safe to call from any component.
    pub fn is_engaged(&self) -> bool {
        self.inner.engaged.load(Ordering::Acquire)
    }

    pub fn is_armed(&self) -> bool {
        self.inner.armed.load(Ordering::Acquire)
    }

    fn detail(&self) -> std::sync::MutexGuard<'_, Detail> {
        match self.inner.detail.lock() {
            Ok(d) => d,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Always succeeds; repeated calls keep the first reason.
    pub fn engage(&self, reason: &str) {
        {
            let mut detail = self.detail();
            if self.inner.engaged.load(Ordering::Acquire) {
                return;
            }
            detail.engaged_at = Some(Utc::now());
            detail.reason = Some(reason.to_string());
            self.inner.engaged.store(true, Ordering::Release);
            detail.cancel.cancel();
        }
        log_kill_switch("engaged", Some(reason));
    }

    /// Automatic trigger: engages only when an operator has armed the switch.
    pub fn trip(&self, reason: &str) -> bool {
        if !self.is_armed() {
            log_kill_switch("trip_ignored_unarmed", Some(reason));
            return false;
        }
        self.engage(reason);
        true
    }

    fn consume(&self, action: &str, operator_token: &str) -> Result<(), NotAuthorized> {
        let nonce = self.inner.auth.verify(action, operator_token).ok_or(NotAuthorized)?;
        let mut detail = self.inner.detail.lock().map_err(|_| NotAuthorized)?;
        if !detail.used_nonces.insert(format!("{}:{}", action, nonce)) {
            return Err(NotAuthorized);
        }
        Ok(())
    }

    pub fn arm(&self, operator_token: &str) -> Result<(), NotAuthorized> {
        if let Err(e) = self.consume(ACTION_ARM, operator_token) {
            log_kill_switch("arm_rejected", None);
            return Err(e);
        }
        self.inner.armed.store(true, Ordering::Release);
        log_kill_switch("armed", None);
        Ok(())
    }

    /// Only an operator token clears an engaged switch. State is unchanged on rejection.
    pub fn reset(&self, operator_token: &str) -> Result<(), NotAuthorized> {
        if let Err(e) = self.consume(ACTION_RESET, operator_token) {
            log_kill_switch("reset_rejected", None);
            return Err(e);
        }
        {
            let mut detail = self.detail();
            detail.engaged_at = None;
            detail.reason = None;
            detail.cancel = CancellationToken::new();
            self.inner.engaged.store(false, Ordering::Release);
        }
        log_kill_switch("reset", None);
        Ok(())
    }

    /// Token cancelled on the next engagement; replaced on reset.
    pub fn cancel_token(&self) -> CancellationToken {
        self.detail().cancel.clone()
    }

    pub fn state(&self) -> KillSwitchState {
        let (engaged_at, reason) = {
            let d = self.detail();
            (d.engaged_at, d.reason.clone())
        };
        KillSwitchState {
            armed: self.is_armed(),
            engaged: self.is_engaged(),
            engaged_at,
            reason,
        }
    }
}

/// Polls for an operator kill file and engages the switch when it appears.
/// The file's first line, if any, becomes the reason.
pub async fn watch_kill_file(switch: KillSwitch, path: PathBuf, interval: Duration, shutdown: CancellationToken) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        if !switch.is_engaged() && path.exists() {
            let reason = std::fs::read_to_string(&path)
                .ok()
                .and_then(|s| s.lines().next().map(|l| l.trim().to_string()))
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "kill file present".to_string());
            switch.engage(&reason);
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.cancelled() => return,
        }
    }
}
