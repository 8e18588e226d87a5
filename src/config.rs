use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::monitor::{
    MonitorOptions, DEFAULT_FULLSCREEN_INITIAL_DELAY, DEFAULT_FULLSCREEN_RETRY_DELAY,
};

const DEFAULT_DB_PATH: &str = "proctor.db";
const DEFAULT_AUDIT_URL: &str = "http://127.0.0.1:8000/api";
const DEFAULT_AUDIT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Deserialize, Default)]
struct MonitorConfigFile {
    db_path: Option<String>,
    audit: Option<AuditConfigFile>,
    fullscreen: Option<FullscreenConfigFile>,
    clear_on_block: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct AuditConfigFile {
    url: Option<String>,
    token: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct FullscreenConfigFile {
    initial_delay_ms: Option<u64>,
    retry_delay_ms: Option<u64>,
}

#[derive(Clone)]
pub struct MonitorConfig {
    pub db_path: String,
    pub audit: AuditSettings,
    pub fullscreen_initial_delay: Duration,
    pub fullscreen_retry_delay: Duration,
    pub clear_on_block: bool,
}

#[derive(Clone)]
pub struct AuditSettings {
    pub url: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl std::fmt::Debug for AuditSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditSettings")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl std::fmt::Debug for MonitorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorConfig")
            .field("db_path", &self.db_path)
            .field("audit", &self.audit)
            .field("fullscreen_initial_delay", &self.fullscreen_initial_delay)
            .field("fullscreen_retry_delay", &self.fullscreen_retry_delay)
            .field("clear_on_block", &self.clear_on_block)
            .finish()
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        // Defaults cannot fail validation.
        Self::from_file(MonitorConfigFile::default())
    }
}

impl MonitorConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PROCTOR_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: MonitorConfigFile) -> Self {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let audit = AuditSettings {
            url: file
                .audit
                .as_ref()
                .and_then(|audit| audit.url.clone())
                .unwrap_or_else(|| DEFAULT_AUDIT_URL.to_string()),
            token: file.audit.as_ref().and_then(|audit| audit.token.clone()),
            timeout: Duration::from_secs(
                file.audit
                    .as_ref()
                    .and_then(|audit| audit.timeout_secs)
                    .unwrap_or(DEFAULT_AUDIT_TIMEOUT_SECS),
            ),
        };
        let fullscreen_initial_delay = file
            .fullscreen
            .as_ref()
            .and_then(|fs| fs.initial_delay_ms)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_FULLSCREEN_INITIAL_DELAY);
        let fullscreen_retry_delay = file
            .fullscreen
            .and_then(|fs| fs.retry_delay_ms)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_FULLSCREEN_RETRY_DELAY);
        Self {
            db_path,
            audit,
            fullscreen_initial_delay,
            fullscreen_retry_delay,
            clear_on_block: file.clear_on_block.unwrap_or(false),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("PROCTOR_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(url) = std::env::var("PROCTOR_AUDIT_URL") {
            if !url.trim().is_empty() {
                self.audit.url = url.trim().to_string();
            }
        }
        if let Ok(token) = std::env::var("PROCTOR_AUDIT_TOKEN") {
            if !token.trim().is_empty() {
                self.audit.token = Some(token.trim().to_string());
            }
        }
        if let Ok(timeout) = std::env::var("PROCTOR_AUDIT_TIMEOUT_SECS") {
            let seconds: u64 = timeout.parse().map_err(|_| {
                anyhow!("PROCTOR_AUDIT_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.audit.timeout = Duration::from_secs(seconds);
        }
        if let Ok(delay) = std::env::var("PROCTOR_FULLSCREEN_INITIAL_DELAY_MS") {
            self.fullscreen_initial_delay = parse_millis("PROCTOR_FULLSCREEN_INITIAL_DELAY_MS", &delay)?;
        }
        if let Ok(delay) = std::env::var("PROCTOR_FULLSCREEN_RETRY_DELAY_MS") {
            self.fullscreen_retry_delay = parse_millis("PROCTOR_FULLSCREEN_RETRY_DELAY_MS", &delay)?;
        }
        if let Ok(flag) = std::env::var("PROCTOR_CLEAR_ON_BLOCK") {
            self.clear_on_block = parse_bool("PROCTOR_CLEAR_ON_BLOCK", &flag)?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        crate::audit::audit_endpoint(&self.audit.url)?;
        if self.audit.timeout.as_secs() == 0 {
            return Err(anyhow!("audit timeout must be greater than zero"));
        }
        if self.fullscreen_retry_delay.is_zero() {
            return Err(anyhow!("fullscreen retry delay must be greater than zero"));
        }
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        Ok(())
    }

    pub fn monitor_options(&self) -> MonitorOptions {
        MonitorOptions {
            fullscreen_initial_delay: self.fullscreen_initial_delay,
            fullscreen_retry_delay: self.fullscreen_retry_delay,
            clear_storage_on_block: self.clear_on_block,
        }
    }
}

fn read_config_file(path: &Path) -> Result<MonitorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn parse_millis(name: &str, value: &str) -> Result<Duration> {
    let millis: u64 = value
        .trim()
        .parse()
        .map_err(|_| anyhow!("{} must be an integer number of milliseconds", name))?;
    Ok(Duration::from_millis(millis))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(anyhow!("{} must be true or false", name)),
    }
}
