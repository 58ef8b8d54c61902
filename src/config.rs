use chrono::{DateTime, Utc};
use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
    pub github: GitHubConfig,
}

/// Capacity, retry and breaker constants handed to every scheduling component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Slots the downstream system grants per recharge period.
    pub total_slots: usize,
    /// Minutes before a consumed slot is available again.
    pub recharge_minutes: i64,
    /// An item is dropped once its retry count reaches this.
    pub retry_ceiling: u32,
    /// Added on top of every observed throttle duration.
    pub safety_buffer_secs: i64,
    /// Consecutive unexpected errors that open the breaker.
    pub breaker_threshold: usize,
    /// Trailing window the breaker looks at.
    pub breaker_window_secs: i64,
    pub trigger_timeout_secs: u64,
    pub post_trigger_delay_ms: u64,
    /// How long a pass lease stays valid if its holder dies.
    pub lock_ttl_secs: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            total_slots: 15,
            recharge_minutes: 30,
            retry_ceiling: 3,
            safety_buffer_secs: 120,
            breaker_threshold: 5,
            breaker_window_secs: 300,
            trigger_timeout_secs: 30,
            post_trigger_delay_ms: 2000,
            lock_ttl_secs: 900,
        }
    }
}

/// Upper bound for every configured period, in seconds (one year).
const MAX_PERIOD_SECS: i64 = 366 * 24 * 60 * 60;

impl SchedulerConfig {
    // Periods are clamped so an unvalidated value can never overflow date arithmetic.

    pub fn recharge_period(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.recharge_minutes.clamp(0, MAX_PERIOD_SECS / 60) * 60)
    }

    pub fn safety_buffer(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.safety_buffer_secs.clamp(0, MAX_PERIOD_SECS))
    }

    pub fn breaker_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.breaker_window_secs.clamp(0, MAX_PERIOD_SECS))
    }

    pub fn lock_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lock_ttl_secs.clamp(0, MAX_PERIOD_SECS))
    }

    /// Reject periods that are non-positive (negative for the buffer) or longer than a year.
    pub fn validate(&self) -> Result<()> {
        let periods = [
            ("scheduler.recharge_minutes", self.recharge_minutes.saturating_mul(60), 1),
            ("scheduler.safety_buffer_secs", self.safety_buffer_secs, 0),
            ("scheduler.breaker_window_secs", self.breaker_window_secs, 1),
            ("scheduler.lock_ttl_secs", self.lock_ttl_secs, 1),
        ];
        for (name, secs, min) in periods {
            if secs < min || secs > MAX_PERIOD_SECS {
                return Err(eyre!(
                    "{} out of range: must be between {} and {} seconds",
                    name,
                    min,
                    MAX_PERIOD_SECS
                ));
            }
        }
        Ok(())
    }

    /// Cutoff for pruning history older than `days`, never cutting into the history horizon.
    pub fn prune_cutoff(&self, now: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>> {
        if days < 0 {
            return Err(eyre!("--days must not be negative, got {}", days));
        }
        let age = chrono::Duration::try_days(days)
            .ok_or_else(|| eyre!("--days {} is too large", days))?
            .max(self.history_horizon());
        now.checked_sub_signed(age)
            .ok_or_else(|| eyre!("--days {} reaches before the earliest representable date", days))
    }

    pub fn trigger_timeout(&self) -> Duration {
        Duration::from_secs(self.trigger_timeout_secs)
    }

    pub fn post_trigger_delay(&self) -> Duration {
        Duration::from_millis(self.post_trigger_delay_ms)
    }

    /// Longest look-back any window query needs; older history can be pruned.
    pub fn history_horizon(&self) -> chrono::Duration {
        self.recharge_period().max(self.breaker_window())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("retrigger")
                .join("retrigger.db"),
            busy_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    pub api_url: String,
    pub token_env: String,
    pub username_env: String,
    pub bot_login: String,
    pub settle_delay_ms: u64,
    pub reassign_pause_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            token_env: "GITHUB_TOKEN".to_string(),
            username_env: "GITHUB_USERNAME".to_string(),
            bot_login: "traycerai[bot]".to_string(),
            settle_delay_ms: 2000,
            reassign_pause_ms: 500,
            request_timeout_secs: 30,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            scheduler: SchedulerConfig::default(),
            storage: StorageConfig::default(),
            github: GitHubConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try primary location: ~/.config/<project>/<project>.yml
        if let Some(config_dir) = dirs::config_dir() {
            let project_name = env!("CARGO_PKG_NAME");
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let project_name = env!("CARGO_PKG_NAME");
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.scheduler.validate().context("Invalid scheduler config")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}
