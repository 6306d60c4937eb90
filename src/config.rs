//! Configuration for the placement dashboards

use std::time::Duration;
use url::Url;

use crate::dashboard::RefreshPolicy;
use crate::error::{DashboardError, Result};

pub const ENV_URL: &str = "SUPABASE_URL";
pub const ENV_ANON_KEY: &str = "SUPABASE_ANON_KEY";
pub const ENV_REFRESH_POLICY: &str = "PLACEMENT_REFRESH_POLICY";
pub const ENV_REQUEST_TIMEOUT: &str = "PLACEMENT_REQUEST_TIMEOUT_SECS";
pub const ENV_HEARTBEAT: &str = "PLACEMENT_HEARTBEAT_SECS";

/// Connection and refresh settings
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Project URL; auth, rest and realtime live under it
    pub supabase_url: Url,

    /// The anonymous API key sent as `apikey` on every request
    pub anon_key: String,

    /// How mounted dashboards react to change notifications
    pub refresh_policy: RefreshPolicy,

    /// HTTP request timeout
    pub request_timeout: Duration,

    /// Realtime heartbeat interval
    pub heartbeat_interval: Duration,
}

impl AppConfig {
    /// Validate the project URL and key and apply defaults
    pub fn new(url: &str, anon_key: &str) -> Result<Self> {
        let supabase_url = Url::parse(url)
            .map_err(|e| DashboardError::config(format!("invalid {} '{}': {}", ENV_URL, url, e)))?;
        if anon_key.trim().is_empty() {
            return Err(DashboardError::config("anon_key cannot be empty"));
        }

        Ok(Self {
            supabase_url,
            anon_key: anon_key.to_string(),
            refresh_policy: RefreshPolicy::default(),
            request_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
        })
    }

    /// Load from the process environment, reading `.env` first if present
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key lookup; missing optional keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup(ENV_URL)
            .ok_or_else(|| DashboardError::config(format!("{} environment variable not found", ENV_URL)))?;
        let key = lookup(ENV_ANON_KEY).ok_or_else(|| {
            DashboardError::config(format!("{} environment variable not found", ENV_ANON_KEY))
        })?;

        let mut config = Self::new(&url, &key)?;

        if let Some(policy) = lookup(ENV_REFRESH_POLICY) {
            config.refresh_policy = policy.parse()?;
        }
        if let Some(secs) = lookup(ENV_REQUEST_TIMEOUT) {
            config.request_timeout = parse_secs(ENV_REQUEST_TIMEOUT, &secs)?;
        }
        if let Some(secs) = lookup(ENV_HEARTBEAT) {
            config.heartbeat_interval = parse_secs(ENV_HEARTBEAT, &secs)?;
        }

        Ok(config)
    }

    /// Base URL string without a trailing slash, as the clients expect it
    pub fn base_url(&self) -> String {
        self.supabase_url.as_str().trim_end_matches('/').to_string()
    }

    /// Set the refresh policy
    pub fn with_refresh_policy(mut self, value: RefreshPolicy) -> Self {
        self.refresh_policy = value;
        self
    }

    /// Set the request timeout
    pub fn with_request_timeout(mut self, value: Duration) -> Self {
        self.request_timeout = value;
        self
    }

    /// Set the heartbeat interval
    pub fn with_heartbeat_interval(mut self, value: Duration) -> Self {
        self.heartbeat_interval = value;
        self
    }
}

fn parse_secs(name: &str, value: &str) -> Result<Duration> {
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(DashboardError::config(format!(
            "{} must be a positive number of seconds, got '{}'",
            name, value
        ))),
    }
}
