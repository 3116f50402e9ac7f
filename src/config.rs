//! TOML configuration file support.
//!
//! Loads from (in order):
//! 1. An explicit path
//! 2. `fishoil.toml` next to the executable
//! 3. `$HOME/.config/fishoil/config.toml`
//! 4. Built-in defaults
//!
//! Environment variables (`FISHOIL_LEDGER`, `FISHOIL_LOG_LEVEL`,
//! `FISHOIL_VERIFY_URL`) override file values via [`FishoilConfig::apply_env`].

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, ResultExt as _};
use crate::fraud::{FraudEngine, FraudThresholds};
use crate::report::DEFAULT_VERIFY_BASE_URL;
use crate::stage::StageProcessor;

// ---------------------------------------------------------------------------
// Config structs (map 1-to-1 with the TOML sections)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FishoilConfig {
    pub paths: PathsConfig,
    pub logging: LoggingConfig,
    pub fraud: FraudThresholds,
    pub verification: VerificationConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// JSON-lines receipt ledger.
    pub ledger: PathBuf,
    pub report_out_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Path to a JSON-lines structured log file. Empty string means no file
    /// logging.
    pub json_log_file: String,
    /// Emit JSON to stdout instead of human-readable stderr output.
    pub json_stdout: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub base_url: String,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            ledger: PathBuf::from("receipts.jsonl"),
            report_out_dir: PathBuf::from("fishoil-verification"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_log_file: String::new(),
            json_stdout: false,
        }
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_VERIFY_BASE_URL.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl FishoilConfig {
    /// Try to load from a specific path. Returns `Ok(default)` if the file
    /// does not exist; returns `Err` if the file exists but is malformed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .ctx_config(&format!("read config file {}", path.display()))?;
        let cfg: FishoilConfig = toml::from_str(&text).ctx_config("parse config TOML")?;
        Ok(cfg)
    }

    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(p) = explicit {
            return Self::load_from(p);
        }

        if let Ok(exe) = std::env::current_exe() {
            let candidate = exe.with_file_name("fishoil.toml");
            if candidate.exists() {
                return Self::load_from(&candidate);
            }
        }

        if let Some(home) = std::env::var_os("HOME") {
            let candidate = PathBuf::from(home)
                .join(".config")
                .join("fishoil")
                .join("config.toml");
            if candidate.exists() {
                return Self::load_from(&candidate);
            }
        }

        Ok(Self::default())
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) {
        if let Ok(ledger) = std::env::var("FISHOIL_LEDGER") {
            self.paths.ledger = PathBuf::from(ledger);
        }
        if let Ok(level) = std::env::var("FISHOIL_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(url) = std::env::var("FISHOIL_VERIFY_URL") {
            self.verification.base_url = url;
        }
    }

    /// Stage processor backed by the configured fraud thresholds.
    pub fn stage_processor(&self) -> StageProcessor {
        StageProcessor::new(FraudEngine::new(self.fraud.clone()))
    }
}
