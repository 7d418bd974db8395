use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// First path segments owned by the fixed API routes.
const RESERVED_SEGMENTS: &[&str] = &["images", "jobs", "health"];

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Address the HTTP API listens on.
    pub bind: SocketAddr,
    /// Docker endpoint; local defaults when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_host: Option<String>,
    /// Extra attempts after a transient pull failure.
    pub pull_retries: u32,
    pub pull_backoff_ms: u64,
    /// Bounded wait used by callers awaiting a job.
    pub job_timeout_secs: u64,
    /// Limit for each discovery container run.
    pub run_timeout_secs: u64,
    /// Path under which CLI spec routes are published.
    pub route_prefix: String,
    /// Finished jobs remembered for `/jobs`.
    pub job_history: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            docker_host: None,
            pull_retries: 2,
            pull_backoff_ms: 500,
            job_timeout_secs: 180,
            run_timeout_secs: 120,
            route_prefix: "/cli".into(),
            job_history: 1000,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::figment()
            .extract::<Config>()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?
            .validated()
    }

    /// Defaults, then `clidock.toml`, `clidock.json` and `CLIDOCK_*` variables.
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("clidock.toml"))
            .merge(Json::file("clidock.json"))
            .merge(Env::prefixed("CLIDOCK_"))
    }

    fn validated(mut self) -> anyhow::Result<Self> {
        let prefix = self.route_prefix.trim_end_matches('/');
        if !prefix.starts_with('/') || prefix.len() < 2 {
            anyhow::bail!("Invalid route_prefix: {:?}", self.route_prefix);
        }
        let first = prefix[1..].split('/').next().unwrap_or_default();
        if RESERVED_SEGMENTS.contains(&first) {
            anyhow::bail!(
                "route_prefix {:?} collides with the built-in /{} routes",
                self.route_prefix,
                first
            );
        }
        if self.job_history == 0 {
            anyhow::bail!("job_history must be at least 1");
        }
        self.route_prefix = prefix.to_string();
        Ok(self)
    }

    pub fn pull_backoff(&self) -> Duration {
        Duration::from_millis(self.pull_backoff_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}
