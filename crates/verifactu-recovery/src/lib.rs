// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use verifactu_core::VerifactuError;

/// Where a recovery pointer's hash came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointerSource {
    /// Written by the Reconciliation Service after comparing with the
    /// tax authority.
    Reconciliation,
    /// Entered directly by an administrator.
    Manual,
}

/// The chain-continuation hash to use for an issuer whose local chain
/// store holds no records (spec §3 "Recovery pointer").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryPointer {
    /// The hash the next record built for this issuer must link to.
    pub hash: String,
    /// Where this pointer came from.
    pub source: PointerSource,
    /// The invoice number the pointer's hash corresponds to, if known.
    pub invoice_number: Option<String>,
    /// When the pointer was set.
    pub set_at: DateTime<FixedOffset>,
}

/// Per-issuer recovery pointer storage.
#[async_trait]
pub trait RecoveryPointerStore: Send + Sync {
    /// The current pointer for `issuer`, if one has been set.
    async fn get(&self, issuer: &str) -> Result<Option<RecoveryPointer>, VerifactuError>;

    /// Set (overwriting any existing) pointer for `issuer`.
    async fn set(&self, issuer: &str, pointer: RecoveryPointer) -> Result<(), VerifactuError>;

    /// Clear the pointer for `issuer`, e.g. once it has been consumed by
    /// the first record built after recovery.
    async fn clear(&self, issuer: &str) -> Result<(), VerifactuError>;
}

/// A [`RecoveryPointerStore`] backed by a single JSON file mapping issuer
/// NIF to pointer, rewritten in full on every mutation — the map is small
/// (one entry per issuer) so a compact-on-write strategy is simpler than
/// `verifactu-store`'s append-only log and carries no meaningful cost.
pub struct FileRecoveryPointerStore {
    path: PathBuf,
    pointers: RwLock<HashMap<String, RecoveryPointer>>,
}

impl FileRecoveryPointerStore {
    /// Open (creating if absent) a recovery pointer store backed by `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, VerifactuError> {
        let path = path.as_ref().to_path_buf();
        let pointers = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| VerifactuError::SerializationError(e.to_string()))?,
            Err(_) => HashMap::new(),
        };
        Ok(Self {
            path,
            pointers: RwLock::new(pointers),
        })
    }

    async fn persist(&self, pointers: &HashMap<String, RecoveryPointer>) -> Result<(), VerifactuError> {
        let bytes = serde_json::to_vec_pretty(pointers)
            .map_err(|e| VerifactuError::SerializationError(e.to_string()))?;
        tokio::fs::write(&self.path, bytes)
            .await
            .map_err(|e| VerifactuError::IoError(e.to_string()))
    }
}

#[async_trait]
impl RecoveryPointerStore for FileRecoveryPointerStore {
    async fn get(&self, issuer: &str) -> Result<Option<RecoveryPointer>, VerifactuError> {
        Ok(self.pointers.read().await.get(issuer).cloned())
    }

    async fn set(&self, issuer: &str, pointer: RecoveryPointer) -> Result<(), VerifactuError> {
        let mut pointers = self.pointers.write().await;
        pointers.insert(issuer.to_string(), pointer);
        self.persist(&pointers).await
    }

    async fn clear(&self, issuer: &str) -> Result<(), VerifactuError> {
        let mut pointers = self.pointers.write().await;
        pointers.remove(issuer);
        self.persist(&pointers).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0).unwrap().with_ymd_and_hms(2024, 12, 25, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRecoveryPointerStore::open(dir.path().join("pointers.json")).await.unwrap();
        store
            .set(
                "B12345678",
                RecoveryPointer {
                    hash: "H".to_string(),
                    source: PointerSource::Reconciliation,
                    invoice_number: None,
                    set_at: at(),
                },
            )
            .await
            .unwrap();
        let got = store.get("B12345678").await.unwrap().unwrap();
        assert_eq!(got.hash, "H");
    }

    #[tokio::test]
    async fn unknown_issuer_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRecoveryPointerStore::open(dir.path().join("pointers.json")).await.unwrap();
        assert!(store.get("NOPE").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_removes_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRecoveryPointerStore::open(dir.path().join("pointers.json")).await.unwrap();
        store
            .set(
                "B12345678",
                RecoveryPointer {
                    hash: "H".to_string(),
                    source: PointerSource::Manual,
                    invoice_number: None,
                    set_at: at(),
                },
            )
            .await
            .unwrap();
        store.clear("B12345678").await.unwrap();
        assert!(store.get("B12345678").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reopen_replays_persisted_pointers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pointers.json");
        {
            let store = FileRecoveryPointerStore::open(&path).await.unwrap();
            store
                .set(
                    "B12345678",
                    RecoveryPointer {
                        hash: "H".to_string(),
                        source: PointerSource::Reconciliation,
                        invoice_number: Some("F2024-001".to_string()),
                        set_at: at(),
                    },
                )
                .await
                .unwrap();
        }
        let reopened = FileRecoveryPointerStore::open(&path).await.unwrap();
        let got = reopened.get("B12345678").await.unwrap().unwrap();
        assert_eq!(got.invoice_number.as_deref(), Some("F2024-001"));
    }
}
