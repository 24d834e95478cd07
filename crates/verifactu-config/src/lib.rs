// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Configuration loading/validation and the once-only mode/module lock,
//! split the way `abp-config` separates plain data (`BackplaneConfig`)
//! from the load/parse/validate free functions around it.

mod lock;

pub use lock::{LockKeeper, LockState, ReconciliationSummary};

use chrono::{DateTime, FixedOffset};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use verifactu_core::{Environment, OperatingMode};

/// Errors that can occur loading or validating a [`VerifactuConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },
    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },
    /// Semantic validation failed.
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Process-wide VERI*FACTU configuration (spec §3 "Configuration").
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct VerifactuConfig {
    /// Whether real-time transmission to the tax authority is enabled.
    pub mode: OperatingMode,
    /// Production or testing AEAT endpoint set.
    pub environment: Environment,
    /// Software name reported in the `Cabecera` block.
    pub software_name: String,
    /// Software version reported in the `Cabecera` block.
    pub software_version: String,
    /// Path to the PKCS#12 client certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_path: Option<String>,
    /// Certificate expiry, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_expiry: Option<DateTime<FixedOffset>>,
    /// Whether records are submitted automatically after being built.
    #[serde(default)]
    pub auto_transmit: bool,
    /// Base retry interval in minutes (1–60).
    #[serde(default = "default_retry_interval_minutes")]
    pub retry_interval_minutes: u32,
    /// Maximum automatic retry attempts (1–100).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_retry_interval_minutes() -> u32 {
    1
}

fn default_max_retries() -> u32 {
    10
}

impl Default for VerifactuConfig {
    fn default() -> Self {
        Self {
            mode: OperatingMode::NoVerifactu,
            environment: Environment::Testing,
            software_name: "verifactu-engine".to_string(),
            software_version: verifactu_core::CONTRACT_VERSION.to_string(),
            certificate_path: None,
            certificate_expiry: None,
            auto_transmit: false,
            retry_interval_minutes: default_retry_interval_minutes(),
            max_retries: default_max_retries(),
        }
    }
}

impl VerifactuConfig {
    /// Selected AEAT endpoint base for this environment (spec §6).
    #[must_use]
    pub fn aeat_endpoint(&self) -> &'static str {
        match self.environment {
            Environment::Production => {
                "https://www2.agenciatributaria.gob.es/wlpl/TIKE-CONT/ws/SusuFactFSSWS/SistemaFacturacion"
            }
            Environment::Testing => {
                "https://prewww2.aeat.es/wlpl/TIKE-CONT/ws/SusuFactFSSWS/SistemaFacturacion"
            }
        }
    }

    /// Days until certificate expiry, if a certificate is configured.
    #[must_use]
    pub fn days_until_certificate_expiry(&self, now: DateTime<FixedOffset>) -> Option<i64> {
        self.certificate_expiry
            .map(|expiry| (expiry - now).num_days())
    }

    /// Whether the certificate is within its expiry warning window (or
    /// already expired) as of `now`, mirroring `services/contingency.py`'s
    /// `check_health` branch on `config.is_certificate_expiring()`.
    #[must_use]
    pub fn is_certificate_expiring(&self, now: DateTime<FixedOffset>) -> bool {
        matches!(
            self.days_until_certificate_expiry(now),
            Some(days) if days <= CERTIFICATE_EXPIRY_WARNING_DAYS
        )
    }
}

/// Days before (or past) certificate expiry at which `check_health` starts
/// reporting an issue.
const CERTIFICATE_EXPIRY_WARNING_DAYS: i64 = 30;

/// A change to apply to a [`VerifactuConfig`] through [`update`] (spec
/// §4.D `update(patch)`) — every field is optional so a caller only names
/// what it wants to change.
#[derive(Debug, Clone, Default)]
pub struct ConfigPatch {
    /// New operating mode, if changing it.
    pub mode: Option<OperatingMode>,
    /// New environment, if changing it.
    pub environment: Option<Environment>,
    /// New certificate path, if changing it.
    pub certificate_path: Option<String>,
    /// New auto-transmit flag, if changing it.
    pub auto_transmit: Option<bool>,
}

/// The only gateway through which [`VerifactuConfig`] is mutated after
/// load, so the fiscal-year mode lock and module-deactivation protection
/// (spec §4.D) are enforced no matter which caller — an env override at
/// startup or an administrative CLI command — is doing the mutating.
///
/// # Errors
///
/// Returns [`verifactu_core::VerifactuError::ModeLocked`] if `patch.mode`
/// differs from `config.mode` and [`LockKeeper::can_change_mode`] is
/// `false`. Returns [`verifactu_core::VerifactuError::ModuleProtected`] if
/// `patch.mode` would move the operating mode away from
/// [`OperatingMode::Verifactu`] while the module is protected (spec §4.D:
/// `!module_activated && chain_store_is_empty()`).
pub async fn update(
    lock: &LockKeeper,
    config: &mut VerifactuConfig,
    patch: ConfigPatch,
    now: DateTime<FixedOffset>,
    chain_is_empty: bool,
) -> Result<(), verifactu_core::VerifactuError> {
    if let Some(mode) = patch.mode {
        if mode != config.mode {
            if config.mode == OperatingMode::Verifactu && mode != OperatingMode::Verifactu {
                lock.try_deactivate_module(chain_is_empty).await?;
            }
            lock.try_change_mode(mode, now).await?;
            config.mode = mode;
        }
    }
    if let Some(environment) = patch.environment {
        config.environment = environment;
    }
    if let Some(certificate_path) = patch.certificate_path {
        config.certificate_path = Some(certificate_path);
    }
    if let Some(auto_transmit) = patch.auto_transmit {
        config.auto_transmit = auto_transmit;
    }
    Ok(())
}

/// Load a [`VerifactuConfig`] from an optional TOML file path.
///
/// Environment variable overrides are applied on top in both cases.
///
/// # Errors
///
/// Returns [`ConfigError::FileNotFound`] if `path` is given but unreadable,
/// or [`ConfigError::ParseError`]/[`ConfigError::ValidationError`] if the
/// content is malformed or fails validation, or a mode override is
/// rejected by `lock` (wrapped as [`ConfigError::ValidationError`]).
pub async fn load_config(
    path: Option<&Path>,
    lock: &LockKeeper,
    now: DateTime<FixedOffset>,
) -> Result<VerifactuConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => VerifactuConfig::default(),
    };
    apply_env_overrides(&mut config, lock, now).await?;
    validate_config(&config)?;
    Ok(config)
}

/// Parse a TOML string into a [`VerifactuConfig`].
///
/// # Errors
///
/// Returns [`ConfigError::ParseError`] if the content is not valid TOML or
/// does not match the expected shape.
pub fn parse_toml(content: &str) -> Result<VerifactuConfig, ConfigError> {
    toml::from_str::<VerifactuConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

/// Write `config` to `path` as TOML, the write-back counterpart to
/// [`load_config`]'s read side — administrative mutations made through
/// [`update`] only outlive the current process once they are saved here.
///
/// # Errors
///
/// Returns [`ConfigError::ParseError`] wrapping the TOML serialization
/// failure (none of `VerifactuConfig`'s fields are expected to produce
/// one) or a [`ConfigError::ValidationError`] if the write to `path` fails.
pub fn save_config(path: &Path, config: &VerifactuConfig) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config).map_err(|e| ConfigError::ParseError { reason: e.to_string() })?;
    std::fs::write(path, content).map_err(|e| ConfigError::ValidationError {
        reasons: vec![format!("failed to write {}: {e}", path.display())],
    })
}

/// Apply environment variable overrides, routed through [`update`] so a
/// `VERIFACTU_MODE` override is subject to the same fiscal-year mode lock
/// as any other mutation.
///
/// Recognised variables:
/// - `VERIFACTU_MODE` (`verifactu` | `no_verifactu`)
/// - `VERIFACTU_ENVIRONMENT` (`production` | `testing`)
/// - `VERIFACTU_CERTIFICATE_PATH`
/// - `VERIFACTU_AUTO_TRANSMIT` (`true` | `false`)
///
/// `chain_is_empty` is fixed to `true`: at config-load time no issuer-scoped
/// chain is available to consult yet, so whether the module has ever been
/// activated (durable inside `lock`) is the binding signal.
///
/// # Errors
///
/// Returns [`ConfigError::ValidationError`] if the mode override is
/// rejected by `lock` (mode locked for the current fiscal year, or the
/// module is protected against deactivation).
pub async fn apply_env_overrides(
    config: &mut VerifactuConfig,
    lock: &LockKeeper,
    now: DateTime<FixedOffset>,
) -> Result<(), ConfigError> {
    let mut patch = ConfigPatch::default();
    if let Ok(val) = std::env::var("VERIFACTU_MODE") {
        patch.mode = match val.as_str() {
            "verifactu" => Some(OperatingMode::Verifactu),
            "no_verifactu" => Some(OperatingMode::NoVerifactu),
            _ => None,
        };
    }
    if let Ok(val) = std::env::var("VERIFACTU_ENVIRONMENT") {
        patch.environment = match val.as_str() {
            "production" => Some(Environment::Production),
            "testing" => Some(Environment::Testing),
            _ => None,
        };
    }
    if let Ok(val) = std::env::var("VERIFACTU_CERTIFICATE_PATH") {
        patch.certificate_path = Some(val);
    }
    if let Ok(val) = std::env::var("VERIFACTU_AUTO_TRANSMIT") {
        if let Ok(parsed) = val.parse::<bool>() {
            patch.auto_transmit = Some(parsed);
        }
    }
    update(lock, config, patch, now, true)
        .await
        .map_err(|e| ConfigError::ValidationError {
            reasons: vec![e.to_string()],
        })
}

/// Validate a parsed configuration.
///
/// # Errors
///
/// Returns [`ConfigError::ValidationError`] listing every problem found.
pub fn validate_config(config: &VerifactuConfig) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.retry_interval_minutes == 0 || config.retry_interval_minutes > 60 {
        errors.push(format!(
            "retry_interval_minutes {} out of range (1..=60)",
            config.retry_interval_minutes
        ));
    }
    if config.max_retries == 0 || config.max_retries > 100 {
        errors.push(format!(
            "max_retries {} out of range (1..=100)",
            config.max_retries
        ));
    }
    if config.mode == OperatingMode::Verifactu && config.certificate_path.is_none() {
        errors.push("mode=verifactu requires certificate_path".to_string());
    }
    if config.software_name.trim().is_empty() {
        errors.push("software_name must not be empty".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        validate_config(&VerifactuConfig::default()).unwrap();
    }

    #[test]
    fn verifactu_mode_requires_certificate() {
        let cfg = VerifactuConfig {
            mode: OperatingMode::Verifactu,
            ..Default::default()
        };
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn retry_interval_out_of_range_rejected() {
        let cfg = VerifactuConfig {
            retry_interval_minutes: 0,
            ..Default::default()
        };
        assert!(validate_config(&cfg).is_err());
        let cfg = VerifactuConfig {
            retry_interval_minutes: 61,
            ..Default::default()
        };
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn endpoint_selection_matches_environment() {
        let mut cfg = VerifactuConfig {
            environment: Environment::Production,
            ..Default::default()
        };
        assert!(cfg.aeat_endpoint().contains("www2.agenciatributaria"));
        cfg.environment = Environment::Testing;
        assert!(cfg.aeat_endpoint().contains("prewww2.aeat.es"));
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<FixedOffset> {
        use chrono::TimeZone;
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(y, m, d, 0, 0, 0)
            .unwrap()
    }

    #[tokio::test]
    #[allow(unsafe_code)]
    async fn env_override_parses_mode() {
        // SAFETY: test runs single-threaded with respect to this var via serial execution.
        unsafe {
            std::env::set_var("VERIFACTU_MODE", "verifactu");
        }
        let mut cfg = VerifactuConfig::default();
        let lock = LockKeeper::default();
        apply_env_overrides(&mut cfg, &lock, at(2024, 6, 1))
            .await
            .unwrap();
        assert_eq!(cfg.mode, OperatingMode::Verifactu);
        unsafe {
            std::env::remove_var("VERIFACTU_MODE");
        }
    }

    #[tokio::test]
    async fn load_missing_file_gives_file_not_found() {
        let lock = LockKeeper::default();
        let err = load_config(Some(Path::new("/nonexistent/verifactu.toml")), &lock, at(2024, 6, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[tokio::test]
    async fn load_from_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("verifactu.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "mode = \"no_verifactu\"\nenvironment = \"testing\"\nsoftware_name = \"acme-pos\"\nsoftware_version = \"1.0\""
        )
        .unwrap();
        let lock = LockKeeper::default();
        let cfg = load_config(Some(&path), &lock, at(2024, 6, 1)).await.unwrap();
        assert_eq!(cfg.software_name, "acme-pos");
    }

    #[test]
    fn parse_invalid_toml_gives_parse_error() {
        let err = parse_toml("this is [not valid toml =").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }
}
