use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_parse<T: FromStr>(profile: &str, key: &str, default: T) -> T {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
    pub hub: HubConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `CHATLOG_PROFILE` env var. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("CHATLOG_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            server: ServerConfig::from_env_profiled(p),
            scheduler: SchedulerConfig::from_env_profiled(p),
            hub: HubConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        let s = &self.scheduler;
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  server:     {}:{}", self.server.host, self.server.port);
        tracing::info!(
            "  scheduler:  workers={}, queue={}, results={}, retention={}s",
            s.resolved_max_workers(),
            s.max_queue_size,
            s.max_results,
            s.result_retention_secs
        );
        tracing::info!(
            "  retry:      base={}ms, cap={}s, jitter={}",
            s.retry_base_ms,
            s.retry_cap_secs,
            s.retry_jitter
        );
        tracing::info!(
            "  hub:        stale={}s, sweep={}s, buffer={}",
            self.hub.stale_threshold_secs,
            self.hub.sweep_interval_secs,
            self.hub.outbound_buffer
        );
    }
}

// ── Server ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origin: String,
}

impl ServerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "HOST", "0.0.0.0"),
            port: profiled_env_parse(p, "PORT", 3001),
            cors_origin: profiled_env_or(p, "CORS_ORIGIN", "*"),
        }
    }
}

// ── Task scheduler ────────────────────────────────────────────

/// Scheduler tuning. Every field has a default so partial TOML/JSON works.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum concurrently running tasks (and blocking pool size). 0 = num_cpus.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Capacity of the pending queue; submissions beyond it are rejected.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Upper bound on retained task results.
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// How long terminal results stay queryable after they finish.
    #[serde(default = "default_result_retention")]
    pub result_retention_secs: u64,
    /// Cadence of the expired-result sweep.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    /// Backoff base; the n-th retry waits `base * 2^n`.
    #[serde(default = "default_retry_base")]
    pub retry_base_ms: u64,
    /// Backoff ceiling.
    #[serde(default = "default_retry_cap")]
    pub retry_cap_secs: u64,
    /// Jitter ratio applied to backoff delays (0.0 = none).
    #[serde(default)]
    pub retry_jitter: f64,
    /// Capacity of the status event broadcast channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_max_workers() -> usize { 3 }
fn default_max_queue_size() -> usize { 1000 }
fn default_max_results() -> usize { 10_000 }
fn default_result_retention() -> u64 { 3600 }
fn default_cleanup_interval() -> u64 { 60 }
fn default_retry_base() -> u64 { 1000 }
fn default_retry_cap() -> u64 { 60 }
fn default_event_buffer() -> usize { 1024 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_queue_size: default_max_queue_size(),
            max_results: default_max_results(),
            result_retention_secs: default_result_retention(),
            cleanup_interval_secs: default_cleanup_interval(),
            retry_base_ms: default_retry_base(),
            retry_cap_secs: default_retry_cap(),
            retry_jitter: 0.0,
            event_buffer: default_event_buffer(),
        }
    }
}

impl SchedulerConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            max_workers: profiled_env_parse(p, "TASK_MAX_WORKERS", d.max_workers),
            max_queue_size: profiled_env_parse(p, "TASK_MAX_QUEUE_SIZE", d.max_queue_size),
            max_results: profiled_env_parse(p, "TASK_MAX_RESULTS", d.max_results),
            result_retention_secs: profiled_env_parse(
                p,
                "TASK_RESULT_RETENTION_SECS",
                d.result_retention_secs,
            ),
            cleanup_interval_secs: profiled_env_parse(
                p,
                "TASK_CLEANUP_INTERVAL_SECS",
                d.cleanup_interval_secs,
            ),
            retry_base_ms: profiled_env_parse(p, "TASK_RETRY_BASE_MS", d.retry_base_ms),
            retry_cap_secs: profiled_env_parse(p, "TASK_RETRY_CAP_SECS", d.retry_cap_secs),
            retry_jitter: profiled_env_parse(p, "TASK_RETRY_JITTER", d.retry_jitter),
            event_buffer: profiled_env_parse(p, "TASK_EVENT_BUFFER", d.event_buffer),
        }
    }

    /// Resolve worker count (0 means use available parallelism).
    pub fn resolved_max_workers(&self) -> usize {
        if self.max_workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.max_workers
        }
    }

    pub fn result_retention(&self) -> Duration {
        Duration::from_secs(self.result_retention_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn retry_cap(&self) -> Duration {
        Duration::from_secs(self.retry_cap_secs)
    }
}

// ── Notification hub ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Connections without a heartbeat for this long are dropped.
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold_secs: u64,
    /// Cadence of the liveness sweep.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Per-connection outbound queue capacity.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
    /// Cadence of the `queue_stats` room broadcast.
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

fn default_stale_threshold() -> u64 { 60 }
fn default_sweep_interval() -> u64 { 2 }
fn default_outbound_buffer() -> usize { 256 }
fn default_stats_interval() -> u64 { 5 }

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            stale_threshold_secs: default_stale_threshold(),
            sweep_interval_secs: default_sweep_interval(),
            outbound_buffer: default_outbound_buffer(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

impl HubConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            stale_threshold_secs: profiled_env_parse(
                p,
                "HUB_STALE_THRESHOLD_SECS",
                d.stale_threshold_secs,
            ),
            sweep_interval_secs: profiled_env_parse(
                p,
                "HUB_SWEEP_INTERVAL_SECS",
                d.sweep_interval_secs,
            ),
            outbound_buffer: profiled_env_parse(p, "HUB_OUTBOUND_BUFFER", d.outbound_buffer),
            stats_interval_secs: profiled_env_parse(
                p,
                "HUB_STATS_INTERVAL_SECS",
                d.stats_interval_secs,
            ),
        }
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }
}
