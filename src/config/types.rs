use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub provider: ProviderConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    pub window: WindowConfig,
    #[serde(default)]
    pub batches: BatchConfig,
    #[serde(default)]
    pub rendering: RenderingConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub web: WebConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    pub api_key: String,
    pub api_secret: String,
    #[serde(default = "default_provider_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_api_url() -> String {
    "https://rest.nexmo.com/sms/json".to_string()
}

fn default_provider_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum provider requests per second
    #[serde(default = "default_tps")]
    pub tps: u32,
    /// Attempts allowed per message while the provider keeps throttling.
    /// Unset means retry until accepted or rejected.
    #[serde(default)]
    pub max_throttle_retries: Option<u32>,
    /// Number of records rendered and in flight at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tps: default_tps(),
            max_throttle_retries: None,
            concurrency: default_concurrency(),
        }
    }
}

fn default_tps() -> u32 {
    30
}

fn default_concurrency() -> usize {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    #[serde(with = "clock_time")]
    pub end: NaiveTime,
    #[serde(default, with = "clock_time::optional")]
    pub start: Option<NaiveTime>,
    /// Offset of the window's local clock from UTC
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default = "default_days")]
    pub days: Vec<Weekday>,
    #[serde(default = "default_safety_factor")]
    pub safety_factor: f64,
}

fn default_days() -> Vec<Weekday> {
    vec![
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
    ]
}

fn default_safety_factor() -> f64 {
    0.9
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_pending_prefix")]
    pub pending_prefix: String,
    #[serde(default = "default_archive_prefix")]
    pub archive_prefix: String,
    #[serde(default = "default_output_prefix")]
    pub output_prefix: String,
    #[serde(default)]
    pub columns: ColumnConfig,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            pending_prefix: default_pending_prefix(),
            archive_prefix: default_archive_prefix(),
            output_prefix: default_output_prefix(),
            columns: ColumnConfig::default(),
        }
    }
}

fn default_delimiter() -> char {
    ';'
}

fn default_pending_prefix() -> String {
    "send/".to_string()
}

fn default_archive_prefix() -> String {
    "processed/".to_string()
}

fn default_output_prefix() -> String {
    "output/".to_string()
}

/// Names of the batch columns the dispatcher reads directly.
/// Every other column is only reachable through template placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnConfig {
    #[serde(default = "default_template_id_column")]
    pub template_id: String,
    #[serde(default = "default_phone_column")]
    pub phone: String,
    #[serde(default = "default_reference_column")]
    pub reference: String,
}

impl Default for ColumnConfig {
    fn default() -> Self {
        Self {
            template_id: default_template_id_column(),
            phone: default_phone_column(),
            reference: default_reference_column(),
        }
    }
}

fn default_template_id_column() -> String {
    "ID_SMSTEXT".to_string()
}

fn default_phone_column() -> String {
    "MOBILTELEFONNUMMER".to_string()
}

fn default_reference_column() -> String {
    "ID".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenderingConfig {
    #[serde(default)]
    pub missing_field: MissingFieldPolicy,
}

/// What a placeholder naming a field the record does not have turns into
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingFieldPolicy {
    /// Substitute an empty string
    #[default]
    Blank,
    /// Substitute the literal text `undefined`
    Undefined,
    /// Fail the record with a render error
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the artifact store
    pub artifacts: PathBuf,
    /// DuckDB file holding templates and checkpoint state
    pub state: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lease", with = "humantime_serde")]
    pub lease: Duration,
    #[serde(default = "default_keep_alive", with = "humantime_serde")]
    pub keep_alive: Option<Duration>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease: default_lease(),
            keep_alive: default_keep_alive(),
        }
    }
}

fn default_lease() -> Duration {
    Duration::from_secs(2 * 3600)
}

fn default_keep_alive() -> Option<Duration> {
    Some(Duration::from_secs(60))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Six-field cron expression (seconds first), evaluated in UTC
    #[serde(default = "default_schedule")]
    pub schedule: String,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            schedule: default_schedule(),
        }
    }
}

fn default_schedule() -> String {
    "0 0,30 * * * *".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:3000".to_string()
}

// Clock times are written as "HH:MM" or "HH:MM:SS"
mod clock_time {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&time.format("%H:%M:%S").to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_clock_time(&s).map_err(serde::de::Error::custom)
    }

    pub fn parse_clock_time(s: &str) -> Result<NaiveTime, String> {
        let s = s.trim();
        NaiveTime::parse_from_str(s, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
            .map_err(|_| format!("invalid clock time '{}', expected HH:MM", s))
    }

    pub mod optional {
        use chrono::NaiveTime;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(time: &Option<NaiveTime>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match time {
                Some(t) => super::serialize(t, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveTime>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s: Option<String> = Option::deserialize(deserializer)?;
            match s {
                Some(s) => super::parse_clock_time(&s)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }
}
