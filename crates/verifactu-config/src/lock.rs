// SPDX-License-Identifier: MIT OR Apache-2.0
//! The once-only mode/module lock (spec §4.D).

use chrono::{DateTime, FixedOffset, Datelike};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use verifactu_core::{OperatingMode, VerifactuError};

/// Outcome of the most recent reconciliation attempt, surfaced through the
/// configuration record (spec §3 "Reconciliation summary").
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ReconciliationSummary {
    /// When the attempt ran.
    pub attempted_at: DateTime<FixedOffset>,
    /// Outcome status string (e.g. `"synced"`, `"mismatch_detected"`).
    pub status: String,
    /// Human-readable detail.
    pub message: String,
}

/// Mutable lock-related state, separated from the plain [`crate::VerifactuConfig`]
/// so the two can evolve at different rates and be guarded independently.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct LockState {
    /// Whether the operating mode has ever been locked.
    pub mode_locked: bool,
    /// Instant the mode was locked, if it has been.
    pub mode_locked_at: Option<DateTime<FixedOffset>>,
    /// Actor (user/system identifier) that triggered the lock.
    pub mode_locked_by: Option<String>,
    /// Fiscal year the lock applies to.
    pub fiscal_year_locked: Option<i32>,
    /// Whether the VERI*FACTU module has ever been activated.
    pub module_activated: bool,
    /// Date of the first record ever built under this configuration.
    pub first_record_date: Option<chrono::NaiveDate>,
    /// Most recent reconciliation outcome.
    pub reconciliation: Option<ReconciliationSummary>,
}

/// Guards [`LockState`] behind a `tokio::sync::RwLock`, enforcing the
/// fiscal-year mode lock and module-protection invariants (spec §4.D).
///
/// Mirrors the explicitly-constructed-service redesign spec §9 calls for in
/// place of a process-wide singleton: callers own one `LockKeeper` per
/// issuer and pass it through, rather than reaching a global.
#[derive(Debug, Default)]
pub struct LockKeeper {
    state: RwLock<LockState>,
    path: Option<PathBuf>,
}

impl LockKeeper {
    /// Construct an in-memory-only keeper from existing state, with no
    /// durable backing (tests, and anywhere persistence is handled by the
    /// caller another way).
    #[must_use]
    pub fn new(state: LockState) -> Self {
        Self {
            state: RwLock::new(state),
            path: None,
        }
    }

    /// Open (creating if absent) a keeper whose state is durable across
    /// process restarts, mirroring `FileRecoveryPointerStore::open`'s
    /// read-whole-file-or-default-then-rewrite-on-write shape — the once-
    /// only mode lock is worthless if a fresh CLI process each time starts
    /// from [`LockState::default`].
    ///
    /// # Errors
    ///
    /// Returns [`VerifactuError::SerializationError`] if `path` exists but
    /// does not contain valid JSON.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, VerifactuError> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| VerifactuError::SerializationError(e.to_string()))?,
            Err(_) => LockState::default(),
        };
        Ok(Self {
            state: RwLock::new(state),
            path: Some(path),
        })
    }

    async fn persist(&self, state: &LockState) -> Result<(), VerifactuError> {
        let Some(path) = &self.path else { return Ok(()) };
        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|e| VerifactuError::SerializationError(e.to_string()))?;
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| VerifactuError::IoError(e.to_string()))
    }

    /// Current lock state, cloned.
    pub async fn get(&self) -> LockState {
        self.state.read().await.clone()
    }

    /// Whether the operating mode may currently be changed.
    ///
    /// `true` iff unlocked, or locked for a fiscal year other than `now`'s.
    pub async fn can_change_mode(&self, now: DateTime<FixedOffset>) -> bool {
        let state = self.state.read().await;
        match (state.mode_locked, state.fiscal_year_locked) {
            (false, _) => true,
            (true, Some(locked_year)) => locked_year != now.year(),
            (true, None) => false,
        }
    }

    /// Attempt to change the operating mode, enforcing the fiscal-year lock.
    ///
    /// # Errors
    ///
    /// Returns [`VerifactuError::ModeLocked`] if the mode is locked for the
    /// current fiscal year.
    pub async fn try_change_mode(
        &self,
        _new_mode: OperatingMode,
        now: DateTime<FixedOffset>,
    ) -> Result<(), VerifactuError> {
        if self.can_change_mode(now).await {
            Ok(())
        } else {
            Err(VerifactuError::ModeLocked)
        }
    }

    /// Lock the operating mode for the current fiscal year. Called
    /// atomically with the first successful record append (spec §4.C step
    /// 8). Idempotent: re-locking within the same fiscal year is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`VerifactuError::IoError`]/[`VerifactuError::SerializationError`]
    /// if the updated state could not be persisted.
    pub async fn lock_mode(&self, actor: &str, now: DateTime<FixedOffset>) -> Result<(), VerifactuError> {
        let mut state = self.state.write().await;
        if state.mode_locked && state.fiscal_year_locked == Some(now.year()) {
            return Ok(());
        }
        state.mode_locked = true;
        state.mode_locked_at = Some(now);
        state.mode_locked_by = Some(actor.to_string());
        state.fiscal_year_locked = Some(now.year());
        self.persist(&state).await
    }

    /// Mark the module as activated and record the first record's date.
    /// No-op if already activated.
    ///
    /// # Errors
    ///
    /// Returns [`VerifactuError::IoError`]/[`VerifactuError::SerializationError`]
    /// if the updated state could not be persisted.
    pub async fn activate_module(&self, first_record_date: chrono::NaiveDate) -> Result<(), VerifactuError> {
        let mut state = self.state.write().await;
        if state.module_activated {
            return Ok(());
        }
        state.module_activated = true;
        state.first_record_date = Some(first_record_date);
        self.persist(&state).await
    }

    /// Whether the module may currently be deactivated.
    ///
    /// Allowed only when it has never been activated, or the caller
    /// confirms (via `chain_is_empty`) the issuer's chain holds no
    /// records — spec §4.D: `!module_activated && chain_store_is_empty()`.
    pub async fn can_deactivate_module(&self, chain_is_empty: bool) -> bool {
        let state = self.state.read().await;
        !state.module_activated && chain_is_empty
    }

    /// Attempt to deactivate the module.
    ///
    /// # Errors
    ///
    /// Returns [`VerifactuError::ModuleProtected`] if the module has been
    /// activated or the chain is non-empty.
    pub async fn try_deactivate_module(
        &self,
        chain_is_empty: bool,
    ) -> Result<(), VerifactuError> {
        if self.can_deactivate_module(chain_is_empty).await {
            Ok(())
        } else {
            Err(VerifactuError::ModuleProtected(
                "module has been activated and cannot be deactivated".to_string(),
            ))
        }
    }

    /// Record the outcome of a reconciliation attempt.
    ///
    /// # Errors
    ///
    /// Returns [`VerifactuError::IoError`]/[`VerifactuError::SerializationError`]
    /// if the updated state could not be persisted.
    pub async fn mark_reconciliation(&self, summary: ReconciliationSummary) -> Result<(), VerifactuError> {
        let mut state = self.state.write().await;
        state.reconciliation = Some(summary);
        self.persist(&state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(y, m, d, 0, 0, 0)
            .unwrap()
    }

    #[tokio::test]
    async fn unlocked_allows_mode_change() {
        let keeper = LockKeeper::default();
        assert!(keeper.can_change_mode(at(2024, 6, 1)).await);
    }

    #[tokio::test]
    async fn scenario_3_mode_lock_within_fiscal_year_blocks_then_next_year_allows() {
        let keeper = LockKeeper::default();
        keeper.lock_mode("system", at(2024, 12, 25)).await.unwrap();

        assert!(!keeper.can_change_mode(at(2024, 12, 26)).await);
        assert!(matches!(
            keeper.try_change_mode(OperatingMode::NoVerifactu, at(2024, 12, 26)).await,
            Err(VerifactuError::ModeLocked)
        ));

        assert!(keeper.can_change_mode(at(2025, 1, 2)).await);
        keeper
            .try_change_mode(OperatingMode::NoVerifactu, at(2025, 1, 2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lock_mode_is_idempotent_within_fiscal_year() {
        let keeper = LockKeeper::default();
        keeper.lock_mode("a", at(2024, 1, 1)).await.unwrap();
        keeper.lock_mode("b", at(2024, 6, 1)).await.unwrap();
        let state = keeper.get().await;
        assert_eq!(state.mode_locked_by.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn module_cannot_deactivate_once_activated() {
        let keeper = LockKeeper::default();
        keeper
            .activate_module(chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
            .await
            .unwrap();
        assert!(!keeper.can_deactivate_module(true).await);
        assert!(keeper.try_deactivate_module(true).await.is_err());
    }

    #[tokio::test]
    async fn module_deactivation_requires_empty_chain() {
        let keeper = LockKeeper::default();
        assert!(!keeper.can_deactivate_module(false).await);
        assert!(keeper.can_deactivate_module(true).await);
    }

    #[tokio::test]
    async fn open_loads_nonexistent_path_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let keeper = LockKeeper::open(dir.path().join("lock.json")).await.unwrap();
        assert_eq!(keeper.get().await, LockState::default());
    }

    #[tokio::test]
    async fn lock_mode_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock.json");

        let keeper = LockKeeper::open(&path).await.unwrap();
        keeper.lock_mode("system", at(2024, 12, 25)).await.unwrap();

        let reopened = LockKeeper::open(&path).await.unwrap();
        let state = reopened.get().await;
        assert!(state.mode_locked);
        assert_eq!(state.fiscal_year_locked, Some(2024));
        assert_eq!(state.mode_locked_by.as_deref(), Some("system"));
    }
}
