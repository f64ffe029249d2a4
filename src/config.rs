use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub rate: RateConfig,
    #[serde(default)]
    pub delay: DelayConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Channels to watch, as `@username` or numeric chat id
    pub sources: Vec<String>,
    /// Channels every admitted message is relayed to, in order
    pub destinations: Vec<String>,
}

/// Per-window send ceilings
#[derive(Debug, Deserialize, Clone)]
pub struct RateConfig {
    #[serde(default = "default_per_minute")]
    pub per_minute: u32,
    #[serde(default = "default_per_hour")]
    pub per_hour: u32,
    #[serde(default = "default_per_day")]
    pub per_day: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DelayConfig {
    #[serde(default = "default_min_delay")]
    pub min_secs: f64,
    #[serde(default = "default_max_delay")]
    pub max_secs: f64,
    #[serde(default = "default_burst_penalty")]
    pub burst_penalty_secs: f64,
    #[serde(default = "default_burst_lookback")]
    pub burst_lookback_secs: f64,
    #[serde(default = "default_multiplier_floor")]
    pub multiplier_floor: f64,
    /// Optional upper bound; unbounded when absent
    #[serde(default)]
    pub multiplier_ceiling: Option<f64>,
    #[serde(default = "default_success_factor")]
    pub success_factor: f64,
    #[serde(default = "default_error_factor")]
    pub error_factor: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    /// IANA zone name used for every wall-clock decision
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_work_start")]
    pub work_start_hour: u32,
    #[serde(default = "default_work_end")]
    pub work_end_hour: u32,
    #[serde(default = "default_safe_start")]
    pub safe_start_hour: u32,
    #[serde(default = "default_safe_end")]
    pub safe_end_hour: u32,
    #[serde(default = "default_weekend_probability")]
    pub weekend_probability: f64,
    #[serde(default = "default_off_hours_probability")]
    pub off_hours_probability: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackoffConfig {
    #[serde(default = "default_cooldown_base")]
    pub cooldown_base_secs: u64,
    #[serde(default = "default_cap_exponent")]
    pub cap_exponent: u32,
    /// Flood-wait hints above this escalate to a pause
    #[serde(default = "default_flood_pause_threshold")]
    pub flood_pause_threshold_secs: u64,
    /// Dangerous-error cooldowns above this escalate to a pause
    #[serde(default = "default_dangerous_pause_threshold")]
    pub dangerous_pause_threshold_secs: u64,
    #[serde(default = "default_transient_sleep_cap")]
    pub transient_sleep_cap_secs: u64,
    /// Hard cap applied to every cooldown sleep
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: u64,
    #[serde(default = "default_fatal_keywords")]
    pub fatal_keywords: Vec<String>,
    #[serde(default = "default_dangerous_keywords")]
    pub dangerous_keywords: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DedupConfig {
    #[serde(default = "default_dedup_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StatusConfig {
    /// Cron expression (with seconds) for the resume monitor
    #[serde(default = "default_monitor_cron")]
    pub monitor_cron: String,
    #[serde(default = "default_report_cron")]
    pub report_cron: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    /// Channel that receives batched INFO+ log lines and status reports
    #[serde(default)]
    pub channel: Option<String>,
}

fn default_per_minute() -> u32 {
    3
}

fn default_per_hour() -> u32 {
    25
}

fn default_per_day() -> u32 {
    400
}

fn default_min_delay() -> f64 {
    5.0
}

fn default_max_delay() -> f64 {
    20.0
}

fn default_burst_penalty() -> f64 {
    45.0
}

fn default_burst_lookback() -> f64 {
    10.0
}

fn default_multiplier_floor() -> f64 {
    0.5
}

fn default_success_factor() -> f64 {
    0.9
}

fn default_error_factor() -> f64 {
    2.0
}

fn default_timezone() -> String {
    "Asia/Shanghai".to_string()
}

fn default_work_start() -> u32 {
    9
}

fn default_work_end() -> u32 {
    18
}

fn default_safe_start() -> u32 {
    7
}

fn default_safe_end() -> u32 {
    23
}

fn default_weekend_probability() -> f64 {
    0.5
}

fn default_off_hours_probability() -> f64 {
    0.3
}

fn default_cooldown_base() -> u64 {
    120
}

fn default_cap_exponent() -> u32 {
    5
}

fn default_flood_pause_threshold() -> u64 {
    300
}

fn default_dangerous_pause_threshold() -> u64 {
    600
}

fn default_transient_sleep_cap() -> u64 {
    60
}

fn default_max_wait() -> u64 {
    3600
}

fn default_fatal_keywords() -> Vec<String> {
    crate::policy::backoff::FATAL_PATTERNS
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_dangerous_keywords() -> Vec<String> {
    crate::policy::backoff::DANGEROUS_PATTERNS
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_dedup_capacity() -> usize {
    1000
}

fn default_monitor_cron() -> String {
    "0 * * * * *".to_string()
}

fn default_report_cron() -> String {
    "0 */30 * * * *".to_string()
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            per_minute: default_per_minute(),
            per_hour: default_per_hour(),
            per_day: default_per_day(),
        }
    }
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            min_secs: default_min_delay(),
            max_secs: default_max_delay(),
            burst_penalty_secs: default_burst_penalty(),
            burst_lookback_secs: default_burst_lookback(),
            multiplier_floor: default_multiplier_floor(),
            multiplier_ceiling: None,
            success_factor: default_success_factor(),
            error_factor: default_error_factor(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            work_start_hour: default_work_start(),
            work_end_hour: default_work_end(),
            safe_start_hour: default_safe_start(),
            safe_end_hour: default_safe_end(),
            weekend_probability: default_weekend_probability(),
            off_hours_probability: default_off_hours_probability(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            cooldown_base_secs: default_cooldown_base(),
            cap_exponent: default_cap_exponent(),
            flood_pause_threshold_secs: default_flood_pause_threshold(),
            dangerous_pause_threshold_secs: default_dangerous_pause_threshold(),
            transient_sleep_cap_secs: default_transient_sleep_cap(),
            max_wait_secs: default_max_wait(),
            fatal_keywords: default_fatal_keywords(),
            dangerous_keywords: default_dangerous_keywords(),
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: default_dedup_capacity(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            monitor_cron: default_monitor_cron(),
            report_cron: default_report_cron(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.telegram.sources.is_empty() {
            bail!("[telegram] sources must list at least one channel");
        }
        if self.telegram.destinations.is_empty() {
            bail!("[telegram] destinations must list at least one channel");
        }

        let d = &self.delay;
        if d.min_secs < 0.0 || d.max_secs < d.min_secs {
            bail!(
                "[delay] needs 0 <= min_secs <= max_secs (got {} / {})",
                d.min_secs,
                d.max_secs
            );
        }
        if d.multiplier_floor <= 0.0 {
            bail!("[delay] multiplier_floor must be positive");
        }
        if let Some(ceiling) = d.multiplier_ceiling {
            if ceiling < d.multiplier_floor {
                bail!("[delay] multiplier_ceiling must not be below multiplier_floor");
            }
        }
        if !(0.0 < d.success_factor && d.success_factor <= 1.0) {
            bail!("[delay] success_factor must be in (0, 1]");
        }
        if d.error_factor < 1.0 {
            bail!("[delay] error_factor must be at least 1.0");
        }

        let s = &self.schedule;
        if s.work_start_hour >= s.work_end_hour || s.work_end_hour > 24 {
            bail!("[schedule] work hours must satisfy start < end <= 24");
        }
        if s.safe_start_hour >= s.safe_end_hour || s.safe_end_hour > 24 {
            bail!("[schedule] safe hours must satisfy start < end <= 24");
        }
        for (name, p) in [
            ("weekend_probability", s.weekend_probability),
            ("off_hours_probability", s.off_hours_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                bail!("[schedule] {} must be within [0, 1]", name);
            }
        }

        if self.dedup.capacity == 0 {
            bail!("[dedup] capacity must be positive");
        }

        Ok(())
    }
}
