//! Backend model: the capability contract every load-balancer driver meets.
//!
//! Drivers come in two shapes:
//! - synchronous (appliance): a mutation is applied when the call returns, so
//!   mutating calls return no job ids;
//! - job-based (LBaaS): a mutation is accepted and applied later; the call
//!   returns the ids of the jobs that carry it, to be polled with
//!   [`Backend::get_job_status`].
//!
//! The controller treats both the same way: it waits for every returned job
//! before touching its cache.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use lbsync_reconcile::JobState;
use serde::{Deserialize, Serialize};

use crate::config::Secret;
use crate::error::{LbError, ObjectKind};

/// Identifier of an asynchronous backend job.
pub type JobId = String;

/// Credentials used to open (and later refresh) a backend session.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub host: String,
    pub user: String,
    pub secret: Secret,
}

/// A pool member: one gear's public address and port.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Member {
    pub address: String,
    pub port: u16,
}

impl Member {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.contains(':') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}

impl FromStr for Member {
    type Err = LbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || LbError::InvalidResponse {
            operation: "parse member".to_string(),
            detail: format!("expected address:port, got {s:?}"),
        };

        let (address, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let address = address.trim_start_matches('[').trim_end_matches(']');
        if address.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Self::new(address, port))
    }
}

impl From<lbsync_events::Gear> for Member {
    fn from(gear: lbsync_events::Gear) -> Self {
        Self::new(gear.address, gear.port)
    }
}

/// Health-check protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorType {
    Http,
    Https,
    Tcp,
}

impl MonitorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorType::Http => "http",
            MonitorType::Https => "https",
            MonitorType::Tcp => "tcp",
        }
    }
}

impl fmt::Display for MonitorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MonitorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(MonitorType::Http),
            "https" => Ok(MonitorType::Https),
            "tcp" => Ok(MonitorType::Tcp),
            other => Err(format!("unknown monitor type: {other}")),
        }
    }
}

/// A health-check definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorSpec {
    pub name: String,
    pub path: String,
    pub up_code: u16,
    #[serde(rename = "type")]
    pub kind: MonitorType,
    /// Seconds between checks.
    pub interval: u32,
    /// Seconds without a good answer before a member is marked down.
    pub timeout: u32,
}

/// Load-balancer backend driver.
///
/// Every mutating call returns the job ids that must reach
/// [`JobState::Succeeded`] before the mutation counts as applied; synchronous
/// drivers return an empty list.
#[async_trait]
pub trait Backend: Send {
    /// Short driver name for logs.
    fn driver_name(&self) -> &'static str;

    /// Open a session. Re-callable to refresh an expired session.
    async fn authenticate(&mut self, credentials: &Credentials) -> Result<(), LbError>;

    async fn list_pools(&mut self) -> Result<Vec<String>, LbError>;

    async fn list_routes(&mut self) -> Result<Vec<String>, LbError>;

    /// Routes currently attached to a virtual endpoint.
    async fn list_active_routes(&mut self) -> Result<Vec<String>, LbError>;

    async fn list_monitors(&mut self) -> Result<Vec<String>, LbError>;

    async fn create_pool(
        &mut self,
        name: &str,
        monitor: Option<&str>,
    ) -> Result<Vec<JobId>, LbError>;

    async fn delete_pool(&mut self, name: &str) -> Result<Vec<JobId>, LbError>;

    async fn get_pool_members(&mut self, pool: &str) -> Result<Vec<Member>, LbError>;

    async fn add_pool_member(&mut self, pool: &str, member: &Member)
        -> Result<Vec<JobId>, LbError>;

    async fn delete_pool_member(
        &mut self,
        pool: &str,
        member: &Member,
    ) -> Result<Vec<JobId>, LbError>;

    async fn create_route(
        &mut self,
        pool: &str,
        route: &str,
        path: &str,
    ) -> Result<Vec<JobId>, LbError>;

    async fn delete_route(&mut self, pool: &str, route: &str) -> Result<Vec<JobId>, LbError>;

    /// Attach a route to a public-facing virtual endpoint.
    async fn attach_route(&mut self, route: &str, endpoint: &str)
        -> Result<Vec<JobId>, LbError>;

    /// Detach a route from a virtual endpoint.
    async fn detach_route(&mut self, route: &str, endpoint: &str)
        -> Result<Vec<JobId>, LbError>;

    async fn create_monitor(&mut self, spec: &MonitorSpec) -> Result<Vec<JobId>, LbError>;

    /// Delete a monitor, detaching it from `pool` first when given.
    async fn delete_monitor(
        &mut self,
        name: &str,
        pool: Option<&str>,
    ) -> Result<Vec<JobId>, LbError>;

    /// State of a job returned by a mutating call.
    ///
    /// Synchronous drivers never hand out job ids, so the default rejects
    /// every lookup.
    async fn get_job_status(&mut self, job_id: &str) -> Result<JobState, LbError> {
        Err(LbError::not_found(ObjectKind::Job, job_id))
    }
}
