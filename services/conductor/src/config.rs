//! Conductor configuration.

use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::compat::Version;
use crate::scheduler::{AFFINITY_FILTER, ANTI_AFFINITY_FILTER};

/// Latest compute RPC version this conductor speaks.
pub const LATEST_COMPUTE_VERSION: Version = Version::new(4, 5);

#[derive(Debug, Clone)]
pub struct ConductorConfig {
    pub log_level: String,
    pub dev_mode: bool,

    /// Placement attempts per workflow invocation (at least 1).
    pub scheduler_max_attempts: u32,

    /// Live-migration rescheduling bound; `None` is unbounded.
    pub migrate_max_retries: Option<u32>,

    /// How long a `call` waits for its reply.
    pub rpc_call_timeout: Duration,

    /// Default version cap for compute hosts without a pin.
    pub compute_version_cap: Version,

    /// Scheduler filters enabled in the deployment.
    pub scheduler_filters: Vec<String>,

    /// Hosts to register with the in-process transport in dev mode.
    pub dev_hosts: Vec<String>,

    /// Publisher id stamped on notifications.
    pub publisher_id: String,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            dev_mode: false,
            scheduler_max_attempts: 3,
            migrate_max_retries: None,
            rpc_call_timeout: Duration::from_secs(60),
            compute_version_cap: LATEST_COMPUTE_VERSION,
            scheduler_filters: default_filters(),
            dev_hosts: Vec::new(),
            publisher_id: "conductor".to_string(),
        }
    }
}

fn default_filters() -> Vec<String> {
    [
        "RetryFilter",
        "AvailabilityZoneFilter",
        "RamFilter",
        "ComputeFilter",
        ANTI_AFFINITY_FILTER,
        AFFINITY_FILTER,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl ConductorConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let log_level = lookup("FLEET_LOG_LEVEL").unwrap_or(defaults.log_level);

        let dev_mode = lookup("FLEET_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let scheduler_max_attempts = match lookup("FLEET_SCHEDULER_MAX_ATTEMPTS") {
            Some(v) => v
                .parse::<u32>()
                .context("FLEET_SCHEDULER_MAX_ATTEMPTS must be a positive integer")?,
            None => defaults.scheduler_max_attempts,
        };
        if scheduler_max_attempts == 0 {
            bail!("FLEET_SCHEDULER_MAX_ATTEMPTS must be at least 1");
        }

        let migrate_max_retries = match lookup("FLEET_MIGRATE_MAX_RETRIES") {
            Some(v) => {
                let retries: i64 = v
                    .parse()
                    .context("FLEET_MIGRATE_MAX_RETRIES must be an integer")?;
                match retries {
                    -1 => None,
                    r if r < 0 => bail!("FLEET_MIGRATE_MAX_RETRIES must be -1 or non-negative"),
                    r => Some(u32::try_from(r).context("FLEET_MIGRATE_MAX_RETRIES is too large")?),
                }
            }
            None => defaults.migrate_max_retries,
        };

        let rpc_call_timeout = match lookup("FLEET_RPC_CALL_TIMEOUT_SECS") {
            Some(v) => Duration::from_secs(
                v.parse()
                    .context("FLEET_RPC_CALL_TIMEOUT_SECS must be a number of seconds")?,
            ),
            None => defaults.rpc_call_timeout,
        };

        let compute_version_cap = match lookup("FLEET_COMPUTE_VERSION_CAP") {
            Some(v) => v
                .parse()
                .with_context(|| format!("invalid FLEET_COMPUTE_VERSION_CAP {v:?}"))?,
            None => defaults.compute_version_cap,
        };

        let scheduler_filters = lookup("FLEET_SCHEDULER_FILTERS")
            .map(|v| split_list(&v))
            .unwrap_or(defaults.scheduler_filters);

        let dev_hosts = lookup("FLEET_DEV_HOSTS")
            .map(|v| split_list(&v))
            .unwrap_or_default();

        let publisher_id = lookup("FLEET_PUBLISHER_ID").unwrap_or(defaults.publisher_id);

        Ok(Self {
            log_level,
            dev_mode,
            scheduler_max_attempts,
            migrate_max_retries,
            rpc_call_timeout,
            compute_version_cap,
            scheduler_filters,
            dev_hosts,
            publisher_id,
        })
    }

    pub fn has_filter(&self, name: &str) -> bool {
        self.scheduler_filters.iter().any(|f| f == name)
    }
}
