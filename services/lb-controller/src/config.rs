//! Controller configuration.
//!
//! Everything is env-driven; see [`Config::from_env`].

use std::{fmt, path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use lbsync_reconcile::{PollBudget, DEFAULT_MAX_RETRIES};

use crate::model::{Credentials, MonitorType};
use crate::naming::{MonitorTemplate, Naming};

/// A secret string that never shows up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Appliance driver settings.
#[derive(Debug, Clone)]
pub struct ApplianceConfig {
    pub credentials: Credentials,

    /// Accept self-signed management certificates.
    pub insecure_tls: bool,
}

/// LBaaS driver settings.
#[derive(Debug, Clone)]
pub struct LbaasConfig {
    /// LBaaS endpoint plus the user and password for Keystone.
    pub credentials: Credentials,

    /// Keystone identity endpoint.
    pub keystone_host: String,

    /// Tenant the pools live in.
    pub tenant: String,
}

/// The single active backend driver.
#[derive(Debug, Clone)]
pub enum DriverConfig {
    Appliance(ApplianceConfig),
    Lbaas(LbaasConfig),
    /// In-process backend, for dry runs.
    Memory,
}

impl DriverConfig {
    pub fn name(&self) -> &'static str {
        match self {
            DriverConfig::Appliance(_) => "appliance",
            DriverConfig::Lbaas(_) => "lbaas",
            DriverConfig::Memory => "memory",
        }
    }
}

/// Controller configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Active backend driver.
    pub driver: DriverConfig,

    /// Virtual endpoint routes are attached to, if any.
    pub virtual_endpoint: Option<String>,

    /// Polling interval and wait budget for asynchronous jobs.
    pub job_budget: PollBudget,

    /// Pool and route naming.
    pub naming: Naming,

    /// Create `/<app>` routes alongside pools.
    pub create_routes: bool,

    /// Per-application health monitor, if configured.
    pub monitor: Option<MonitorTemplate>,

    /// Routing-update feed base URL.
    pub events_url: String,

    /// Max events to fetch per poll.
    pub fetch_limit: i64,

    /// Poll interval when no new events are available, and after a failure.
    pub poll_interval: Duration,

    /// Optional cursor file to persist the last acknowledged event_id.
    pub cursor_file: Option<PathBuf>,

    /// Exit once fully caught up.
    pub once: bool,

    /// Consecutive failures of one event before it is flagged to operators.
    pub max_event_retries: u32,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let driver = match lookup("LBSYNC_DRIVER").as_deref().map(str::trim) {
            Some("appliance") => DriverConfig::Appliance(ApplianceConfig {
                credentials: Credentials {
                    host: required(&lookup, "LBSYNC_APPLIANCE_HOST")?,
                    user: required(&lookup, "LBSYNC_APPLIANCE_USER")?,
                    secret: Secret::new(required(&lookup, "LBSYNC_APPLIANCE_PASSWORD")?),
                },
                insecure_tls: flag(&lookup, "LBSYNC_APPLIANCE_INSECURE_TLS", false),
            }),
            Some("lbaas") => DriverConfig::Lbaas(LbaasConfig {
                credentials: Credentials {
                    host: required(&lookup, "LBSYNC_LBAAS_HOST")?,
                    user: required(&lookup, "LBSYNC_LBAAS_USER")?,
                    secret: Secret::new(required(&lookup, "LBSYNC_LBAAS_PASSWORD")?),
                },
                keystone_host: required(&lookup, "LBSYNC_LBAAS_KEYSTONE_HOST")?,
                tenant: required(&lookup, "LBSYNC_LBAAS_TENANT")?,
            }),
            Some("memory") => DriverConfig::Memory,
            Some(other) => {
                bail!("Unknown LBSYNC_DRIVER {other:?}. Expected appliance, lbaas or memory.")
            }
            None => bail!("Missing driver. Set LBSYNC_DRIVER to appliance, lbaas or memory."),
        };

        let virtual_endpoint = lookup("LBSYNC_VIRTUAL_ENDPOINT").filter(|v| !v.trim().is_empty());

        let job_poll_interval_ms: u64 = number(&lookup, "LBSYNC_JOB_POLL_INTERVAL_MS")?
            .unwrap_or(1000)
            .max(10);
        let job_timeout_secs: u64 = number(&lookup, "LBSYNC_JOB_TIMEOUT_SECS")?.unwrap_or(60);
        let job_budget = PollBudget {
            interval: Duration::from_millis(job_poll_interval_ms),
            max_wait: Duration::from_secs(job_timeout_secs),
        };

        let defaults = Naming::default();
        let naming = Naming {
            pool_prefix: lookup("LBSYNC_POOL_PREFIX").unwrap_or(defaults.pool_prefix),
            route_prefix: lookup("LBSYNC_ROUTE_PREFIX").unwrap_or(defaults.route_prefix),
        };

        let create_routes = flag(&lookup, "LBSYNC_CREATE_ROUTES", true);

        let monitor = match lookup("LBSYNC_MONITOR_NAME").filter(|v| !v.trim().is_empty()) {
            Some(name) => {
                let kind = match lookup("LBSYNC_MONITOR_TYPE") {
                    Some(v) => v
                        .parse::<MonitorType>()
                        .map_err(anyhow::Error::msg)
                        .context("LBSYNC_MONITOR_TYPE must be http, https or tcp.")?,
                    None => MonitorType::Http,
                };
                Some(MonitorTemplate {
                    name,
                    path: lookup("LBSYNC_MONITOR_PATH").unwrap_or_else(|| "/".to_string()),
                    up_code: number(&lookup, "LBSYNC_MONITOR_UP_CODE")?.unwrap_or(200),
                    kind,
                    interval: number(&lookup, "LBSYNC_MONITOR_INTERVAL_SECS")?.unwrap_or(5),
                    timeout: number(&lookup, "LBSYNC_MONITOR_TIMEOUT_SECS")?.unwrap_or(16),
                })
            }
            None => None,
        };

        let events_url =
            lookup("LBSYNC_EVENTS_URL").unwrap_or_else(|| "http://localhost:8080".to_string());

        let fetch_limit: i64 = number(&lookup, "LBSYNC_EVENTS_LIMIT")?
            .unwrap_or(100)
            .clamp(1, 500);

        let poll_interval_ms: u64 = number(&lookup, "LBSYNC_POLL_INTERVAL_MS")?.unwrap_or(1000);
        let poll_interval = Duration::from_millis(poll_interval_ms.max(50));

        let cursor_file = lookup("LBSYNC_CURSOR_FILE").map(PathBuf::from);

        let once = flag(&lookup, "LBSYNC_ONCE", false);

        let max_event_retries =
            number(&lookup, "LBSYNC_MAX_EVENT_RETRIES")?.unwrap_or(DEFAULT_MAX_RETRIES);

        let log_level = lookup("LBSYNC_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            driver,
            virtual_endpoint,
            job_budget,
            naming,
            create_routes,
            monitor,
            events_url,
            fetch_limit,
            poll_interval,
            cursor_file,
            once,
            max_event_retries,
            log_level,
        })
    }
}

fn required<F>(lookup: &F, key: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .with_context(|| format!("Missing {key}."))
}

fn number<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{key} must be a non-negative integer."))
}

fn flag<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_memory_driver_defaults() {
        let config = load(&[("LBSYNC_DRIVER", "memory")]).unwrap();

        assert_eq!(config.driver.name(), "memory");
        assert_eq!(config.naming, Naming::default());
        assert!(config.create_routes);
        assert!(config.monitor.is_none());
        assert!(config.virtual_endpoint.is_none());
        assert_eq!(config.job_budget.interval, Duration::from_secs(1));
        assert_eq!(config.job_budget.max_wait, Duration::from_secs(60));
        assert_eq!(config.fetch_limit, 100);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_appliance_requires_credentials() {
        let err = load(&[
            ("LBSYNC_DRIVER", "appliance"),
            ("LBSYNC_APPLIANCE_HOST", "https://bigip.example"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("LBSYNC_APPLIANCE_USER"));
    }

    #[test]
    fn test_lbaas_driver() {
        let config = load(&[
            ("LBSYNC_DRIVER", "lbaas"),
            ("LBSYNC_LBAAS_HOST", "https://lbaas.example"),
            ("LBSYNC_LBAAS_KEYSTONE_HOST", "https://keystone.example"),
            ("LBSYNC_LBAAS_USER", "svc"),
            ("LBSYNC_LBAAS_PASSWORD", "hunter2"),
            ("LBSYNC_LBAAS_TENANT", "routing"),
            ("LBSYNC_JOB_POLL_INTERVAL_MS", "1"),
            ("LBSYNC_JOB_TIMEOUT_SECS", "5"),
        ])
        .unwrap();

        let DriverConfig::Lbaas(lbaas) = &config.driver else {
            panic!("expected lbaas driver");
        };
        assert_eq!(lbaas.tenant, "routing");
        assert_eq!(lbaas.credentials.secret.expose(), "hunter2");
        assert!(!format!("{:?}", lbaas).contains("hunter2"));
        assert_eq!(config.job_budget.interval, Duration::from_millis(10));
        assert_eq!(config.job_budget.max_wait, Duration::from_secs(5));
    }

    #[test]
    fn test_unknown_driver_rejected() {
        assert!(load(&[("LBSYNC_DRIVER", "nginx")]).is_err());
        assert!(load(&[]).is_err());
    }

    #[test]
    fn test_monitor_template_from_env() {
        let config = load(&[
            ("LBSYNC_DRIVER", "memory"),
            ("LBSYNC_MONITOR_NAME", "mon-%a-%n"),
            ("LBSYNC_MONITOR_PATH", "/health"),
            ("LBSYNC_MONITOR_TYPE", "https"),
            ("LBSYNC_MONITOR_UP_CODE", "204"),
        ])
        .unwrap();

        let monitor = config.monitor.unwrap();
        assert_eq!(monitor.kind, MonitorType::Https);
        assert_eq!(monitor.up_code, 204);
        assert_eq!(monitor.interval, 5);
        assert_eq!(monitor.timeout, 16);
    }

    #[test]
    fn test_invalid_numbers_rejected() {
        let err = load(&[
            ("LBSYNC_DRIVER", "memory"),
            ("LBSYNC_EVENTS_LIMIT", "lots"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("LBSYNC_EVENTS_LIMIT"));
    }
}
