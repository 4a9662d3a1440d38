//! Engine configuration: defaults overridable through `FERRY_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

pub const DEFAULT_APPLICATION: &str = "ferry-project-sync";
pub const DEFAULT_RUNNER: &str = "runnerName";
pub const DEFAULT_PAGE_SIZE: usize = 500;
/// 300 ids of 36 chars keep a lookup request well under the transport size limit.
pub const DEFAULT_CHUNK_SIZE: usize = 300;
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;
pub const DEFAULT_WATERMARK_BUFFER: Duration = Duration::from_secs(120);

/// What to do when writing the window-anchoring marker fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MarkerFailurePolicy {
    /// Fail the run before any resource is fetched.
    #[default]
    Abort,
    /// Keep going without an upper window bound and persist no watermark.
    SkipWatermark,
}

impl std::str::FromStr for MarkerFailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "abort" => Ok(MarkerFailurePolicy::Abort),
            "skip-watermark" => Ok(MarkerFailurePolicy::SkipWatermark),
            other => Err(ConfigError::InvalidValue { name: "marker failure policy", value: other.to_string() }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub application: String,
    pub application_version: String,
    pub page_size: usize,
    pub chunk_size: usize,
    pub cache_capacity: usize,
    pub watermark_buffer: Duration,
    pub marker_failure: MarkerFailurePolicy,
    /// Also copy the custom objects this tool itself stores (watermarks, markers).
    pub sync_project_sync_custom_objects: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            application: DEFAULT_APPLICATION.to_string(),
            application_version: env!("CARGO_PKG_VERSION").to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            watermark_buffer: DEFAULT_WATERMARK_BUFFER,
            marker_failure: MarkerFailurePolicy::Abort,
            sync_project_sync_custom_objects: false,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<T>().ok())
}

impl SyncConfig {
    /// Defaults, then `FERRY_*` overrides. Unparseable values keep the default.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(app) = std::env::var("FERRY_APPLICATION") {
            if !app.trim().is_empty() { cfg.application = app.trim().to_string(); }
        }
        if let Some(n) = env_parse::<usize>("FERRY_PAGE_SIZE") { cfg.page_size = n; }
        if let Some(n) = env_parse::<usize>("FERRY_CHUNK_SIZE") { cfg.chunk_size = n; }
        if let Some(n) = env_parse::<usize>("FERRY_CACHE_CAP") { cfg.cache_capacity = n; }
        if let Some(secs) = env_parse::<u64>("FERRY_WATERMARK_BUFFER_SECS") { cfg.watermark_buffer = Duration::from_secs(secs); }
        if let Some(p) = env_parse::<MarkerFailurePolicy>("FERRY_MARKER_FAILURE") { cfg.marker_failure = p; }
        if let Ok(v) = std::env::var("FERRY_SYNC_OWN_CUSTOM_OBJECTS") {
            cfg.sync_project_sync_custom_objects = v == "1" || v.eq_ignore_ascii_case("true");
        }
        cfg.normalized()
    }

    /// Clamp sizes to at least 1.
    pub fn normalized(mut self) -> Self {
        self.page_size = self.page_size.max(1);
        self.chunk_size = self.chunk_size.max(1);
        self.cache_capacity = self.cache_capacity.max(1);
        self
    }

    /// Container prefix shared by every custom object this tool writes.
    pub fn own_container_prefix(&self) -> String { format!("{}.", self.application) }
}

/// Runner names scope watermarks; keep them to a safe alphabet.
pub fn validate_runner(name: &str) -> Result<String, ConfigError> {
    let ok = !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok { Ok(name.to_string()) } else { Err(ConfigError::InvalidRunner(name.to_string())) }
}
