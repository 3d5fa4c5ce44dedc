use std::time::Duration;

const DEFAULT_API_BASE_URL: &str = "https://developer.api.autodesk.com";
const DEFAULT_BATCH_SIZE: u64 = 100;
const DEFAULT_MAX_CONCURRENCY: u64 = 8;
const DEFAULT_MAX_IN_FLIGHT: u64 = 5;
const DEFAULT_API_RETRY_COUNT: u64 = 3;
const DEFAULT_API_RETRY_BACKOFF_MS: u64 = 1_000;
const DEFAULT_API_RETRY_BACKOFF_MAX_MS: u64 = 30_000;
const DEFAULT_MEMORY_THRESHOLD: f64 = 0.8;
const DEFAULT_MEMORY_CEILING_MB: u64 = 1024;
const DEFAULT_INTER_CALL_DELAY_MS: u64 = 20;
const DEFAULT_ATTR_BATCH_SIZE: u64 = 50;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;
const DEFAULT_LOG_LEVEL: &str = "info";

/// Throughput presets. Each one sets the batch size, inter-call delay, per-tier concurrency and
/// memory ceiling together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PerformanceMode {
    #[default]
    Standard,
    HighPerformance,
    MemoryOptimized,
}

impl PerformanceMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "standard" => Some(Self::Standard),
            "high_performance" => Some(Self::HighPerformance),
            "memory_optimized" => Some(Self::MemoryOptimized),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::HighPerformance => "high_performance",
            Self::MemoryOptimized => "memory_optimized",
        }
    }

    /// `(batch_size, inter_call_delay_ms, max_concurrency_per_tier, memory_ceiling_mb)`
    fn preset(&self) -> (usize, u64, usize, u64) {
        match self {
            Self::Standard => (
                DEFAULT_BATCH_SIZE as usize,
                DEFAULT_INTER_CALL_DELAY_MS,
                DEFAULT_MAX_CONCURRENCY as usize,
                DEFAULT_MEMORY_CEILING_MB,
            ),
            Self::HighPerformance => (200, 10, 16, 2048),
            Self::MemoryOptimized => (50, 50, 4, 512),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub batch_size: usize,
    pub max_concurrency_per_tier: usize,
    pub max_in_flight: usize,
    /// Total attempts per remote call, the first one included.
    pub api_retry_count: u32,
    pub api_retry_jitter: bool,
    pub api_retry_backoff_base: Duration,
    pub api_retry_backoff_max: Duration,
    pub memory_threshold_fraction: f64,
    pub memory_ceiling_bytes: u64,
    pub inter_call_delay: Duration,
    pub attribute_batch_size: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// `None` uses the per-user data directory.
    pub database_url: Option<String>,
    pub api_base_url: String,
    pub hub_id: Option<String>,
    /// Default for runs that do not say whether to mirror custom attributes.
    pub include_attributes: bool,
    pub log_level: String,
    pub performance_mode: PerformanceMode,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE as usize,
            max_concurrency_per_tier: DEFAULT_MAX_CONCURRENCY as usize,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT as usize,
            api_retry_count: DEFAULT_API_RETRY_COUNT as u32,
            api_retry_jitter: false,
            api_retry_backoff_base: Duration::from_millis(DEFAULT_API_RETRY_BACKOFF_MS),
            api_retry_backoff_max: Duration::from_millis(DEFAULT_API_RETRY_BACKOFF_MAX_MS),
            memory_threshold_fraction: DEFAULT_MEMORY_THRESHOLD,
            memory_ceiling_bytes: DEFAULT_MEMORY_CEILING_MB * 1024 * 1024,
            inter_call_delay: Duration::from_millis(DEFAULT_INTER_CALL_DELAY_MS),
            attribute_batch_size: DEFAULT_ATTR_BATCH_SIZE as usize,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            database_url: None,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            hub_id: None,
            include_attributes: true,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            performance_mode: PerformanceMode::Standard,
        }
    }
}

impl SyncConfig {
    /// `DOCMIRROR_PERFORMANCE_MODE` picks the preset; the individual variables it covers still
    /// override it.
    pub fn from_env() -> Self {
        let performance_mode = read_string_env("DOCMIRROR_PERFORMANCE_MODE")
            .and_then(|value| PerformanceMode::parse(&value))
            .unwrap_or_default();
        let (preset_batch, preset_delay_ms, preset_concurrency, preset_ceiling_mb) =
            performance_mode.preset();
        let batch_size = read_u64_env("DOCMIRROR_BATCH_SIZE", preset_batch as u64) as usize;
        let max_concurrency_per_tier =
            read_u64_env("DOCMIRROR_MAX_CONCURRENCY", preset_concurrency as u64) as usize;
        let max_in_flight = read_u64_env("DOCMIRROR_MAX_IN_FLIGHT", DEFAULT_MAX_IN_FLIGHT) as usize;
        let api_retry_count = read_u64_env("DOCMIRROR_API_RETRY_COUNT", DEFAULT_API_RETRY_COUNT)
            .min(u64::from(u32::MAX)) as u32;
        let api_retry_jitter = read_bool_env("DOCMIRROR_API_RETRY_JITTER", false);
        let api_retry_backoff_base = Duration::from_millis(read_u64_env(
            "DOCMIRROR_API_RETRY_BACKOFF_MS",
            DEFAULT_API_RETRY_BACKOFF_MS,
        ));
        let api_retry_backoff_max = Duration::from_millis(read_u64_env(
            "DOCMIRROR_API_RETRY_BACKOFF_MAX_MS",
            DEFAULT_API_RETRY_BACKOFF_MAX_MS,
        ));
        let memory_threshold_fraction =
            read_fraction_env("DOCMIRROR_MEMORY_THRESHOLD", DEFAULT_MEMORY_THRESHOLD);
        let memory_ceiling_bytes = read_u64_env("DOCMIRROR_MEMORY_CEILING_MB", preset_ceiling_mb)
            .saturating_mul(1024 * 1024);
        let inter_call_delay = Duration::from_millis(read_u64_env_allow_zero(
            "DOCMIRROR_INTER_CALL_DELAY_MS",
            preset_delay_ms,
        ));
        let attribute_batch_size =
            read_u64_env("DOCMIRROR_ATTR_BATCH_SIZE", DEFAULT_ATTR_BATCH_SIZE) as usize;
        let connect_timeout = Duration::from_secs(read_u64_env(
            "DOCMIRROR_CONNECT_TIMEOUT_SECS",
            DEFAULT_CONNECT_TIMEOUT_SECS,
        ));
        let read_timeout = Duration::from_secs(read_u64_env(
            "DOCMIRROR_READ_TIMEOUT_SECS",
            DEFAULT_READ_TIMEOUT_SECS,
        ));
        let database_url = read_string_env("DOCMIRROR_DATABASE_URL");
        let api_base_url = read_string_env("DOCMIRROR_API_BASE_URL")
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
        let hub_id = read_string_env("DOCMIRROR_HUB_ID");
        let include_attributes = read_bool_env("DOCMIRROR_INCLUDE_ATTRS", true);
        let log_level =
            read_string_env("DOCMIRROR_LOG").unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

        Self {
            batch_size,
            max_concurrency_per_tier,
            max_in_flight,
            api_retry_count,
            api_retry_jitter,
            api_retry_backoff_base,
            api_retry_backoff_max,
            memory_threshold_fraction,
            memory_ceiling_bytes,
            inter_call_delay,
            attribute_batch_size,
            connect_timeout,
            read_timeout,
            database_url,
            api_base_url,
            hub_id,
            include_attributes,
            log_level,
            performance_mode,
        }
    }

    /// Replaces the preset-controlled settings with those of `mode`.
    pub fn with_performance_mode(mut self, mode: PerformanceMode) -> Self {
        let (batch_size, delay_ms, concurrency, ceiling_mb) = mode.preset();
        self.batch_size = batch_size;
        self.inter_call_delay = Duration::from_millis(delay_ms);
        self.max_concurrency_per_tier = concurrency;
        self.memory_ceiling_bytes = ceiling_mb * 1024 * 1024;
        self.performance_mode = mode;
        self
    }

    /// Resident-memory level above which the scheduler reclaims between tiers.
    pub fn memory_threshold_bytes(&self) -> u64 {
        (self.memory_ceiling_bytes as f64 * self.memory_threshold_fraction) as u64
    }
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_u64_env_allow_zero(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_fraction_env(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|value| *value > 0.0 && *value <= 1.0)
        .unwrap_or(default)
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}
