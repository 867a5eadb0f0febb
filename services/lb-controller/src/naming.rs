//! Deterministic names for the routing objects of an application.
//!
//! Existing deployments depend on these exact shapes:
//! - pool:  `<pool_prefix>-<app>-<namespace>`
//! - route: `<route_prefix>-<app>-<namespace>`, path `/<app>`
//!
//! The route path sends traffic straight to the pool's gears, bypassing any
//! per-application proxy in front of them.

use crate::model::{MonitorSpec, MonitorType};

/// Naming scheme for pools and routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Naming {
    pub pool_prefix: String,
    pub route_prefix: String,
}

impl Default for Naming {
    fn default() -> Self {
        Self {
            pool_prefix: "lb".to_string(),
            route_prefix: "route".to_string(),
        }
    }
}

impl Naming {
    pub fn pool_name(&self, app_name: &str, namespace: &str) -> String {
        format!("{}-{}-{}", self.pool_prefix, app_name, namespace)
    }

    pub fn route_name(&self, app_name: &str, namespace: &str) -> String {
        format!("{}-{}-{}", self.route_prefix, app_name, namespace)
    }

    pub fn route_path(&self, app_name: &str) -> String {
        format!("/{app_name}")
    }
}

/// Template for per-application health monitors.
///
/// `%a` expands to the application name and `%n` to the namespace in both
/// the monitor name and the check path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorTemplate {
    pub name: String,
    pub path: String,
    pub up_code: u16,
    pub kind: MonitorType,
    pub interval: u32,
    pub timeout: u32,
}

impl MonitorTemplate {
    /// Whether each application gets its own monitor (as opposed to one
    /// shared monitor for every pool).
    pub fn is_per_application(&self) -> bool {
        self.name.contains("%a") || self.name.contains("%n")
    }

    pub fn render(&self, app_name: &str, namespace: &str) -> MonitorSpec {
        MonitorSpec {
            name: expand(&self.name, app_name, namespace),
            path: expand(&self.path, app_name, namespace),
            up_code: self.up_code,
            kind: self.kind,
            interval: self.interval,
            timeout: self.timeout,
        }
    }
}

fn expand(template: &str, app_name: &str, namespace: &str) -> String {
    template.replace("%a", app_name).replace("%n", namespace)
}
