//! Backend-agnostic pool/route/monitor controller.
//!
//! The controller owns the [`Registry`] and the active [`Backend`]. Every
//! operation follows the same shape:
//!
//! 1. lazily load the collections it touches;
//! 2. run existence checks against the cache, failing with a logical error
//!    before any backend mutation;
//! 3. issue the backend mutation and wait for any jobs it returned;
//! 4. only then update the cache.
//!
//! A failure in step 3 never writes to the cache. When a job fails or times
//! out the backend may still apply the change later, so the collection it
//! touched is dropped back to unloaded and relisted on next access.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use lbsync_reconcile::{JobTracker, PollBudget};
use tracing::{debug, info, warn};

use crate::error::{LbError, ObjectKind};
use crate::model::{Backend, Credentials, JobId, Member, MonitorSpec};
use crate::registry::{Pool, Registry, Route};

/// Cached collection a mutation writes to.
#[derive(Debug, Clone, Copy)]
enum Affects<'a> {
    Pools,
    Members(&'a str),
    Routes,
    ActiveRoutes,
    Monitors,
}

/// Controller settings that apply to every backend.
#[derive(Debug, Clone, Default)]
pub struct ControllerSettings {
    /// Virtual endpoint new routes are attached to.
    pub virtual_endpoint: Option<String>,

    /// Polling interval and wait budget for asynchronous jobs.
    pub job_budget: PollBudget,
}

/// Pool/route/monitor controller over one backend.
pub struct Controller<B> {
    backend: B,
    registry: Registry,
    settings: ControllerSettings,
}

impl<B: Backend> Controller<B> {
    pub fn new(backend: B, settings: ControllerSettings) -> Self {
        Self {
            backend,
            registry: Registry::new(),
            settings,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Open (or refresh) the backend session.
    pub async fn authenticate(&mut self, credentials: &Credentials) -> Result<(), LbError> {
        self.backend.authenticate(credentials).await?;
        info!(
            driver = self.backend.driver_name(),
            host = %credentials.host,
            "backend session established"
        );
        Ok(())
    }

    /// Drop every cached collection; the next access relists the backend.
    pub fn invalidate(&mut self) {
        self.registry.invalidate();
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub async fn pool_names(&mut self) -> Result<Vec<String>, LbError> {
        Ok(self.pools_mut().await?.keys().cloned().collect())
    }

    pub async fn route_names(&mut self) -> Result<Vec<String>, LbError> {
        Ok(self.routes_mut().await?.keys().cloned().collect())
    }

    pub async fn active_route_names(&mut self) -> Result<Vec<String>, LbError> {
        Ok(self.active_routes_mut().await?.iter().cloned().collect())
    }

    pub async fn monitor_names(&mut self) -> Result<Vec<String>, LbError> {
        Ok(self.monitors_mut().await?.iter().cloned().collect())
    }

    pub async fn has_pool(&mut self, name: &str) -> Result<bool, LbError> {
        Ok(self.pools_mut().await?.contains_key(name))
    }

    pub async fn has_route(&mut self, name: &str) -> Result<bool, LbError> {
        Ok(self.routes_mut().await?.contains_key(name))
    }

    pub async fn has_monitor(&mut self, name: &str) -> Result<bool, LbError> {
        Ok(self.monitors_mut().await?.contains(name))
    }

    /// Handle for member operations on an existing pool.
    pub async fn pool(&mut self, name: &str) -> Result<PoolHandle<'_, B>, LbError> {
        if !self.pools_mut().await?.contains_key(name) {
            return Err(LbError::invalid_reference(
                ObjectKind::Pool,
                name,
                "member operation",
            ));
        }
        Ok(PoolHandle {
            controller: self,
            name: name.to_string(),
        })
    }

    // -------------------------------------------------------------------------
    // Pools
    // -------------------------------------------------------------------------

    /// Create a pool, optionally with a health monitor attached.
    pub async fn create_pool(
        &mut self,
        name: &str,
        monitor: Option<&str>,
    ) -> Result<&Pool, LbError> {
        if self.pools_mut().await?.contains_key(name) {
            return Err(LbError::already_exists(ObjectKind::Pool, name));
        }
        if let Some(monitor) = monitor {
            if !self.monitors_mut().await?.contains(monitor) {
                return Err(LbError::invalid_reference(
                    ObjectKind::Monitor,
                    monitor,
                    format!("pool {name}"),
                ));
            }
        }

        let jobs = self.backend.create_pool(name, monitor).await?;
        self.settle("create_pool", Affects::Pools, jobs).await?;

        info!(pool = %name, monitor = ?monitor, "pool created");
        let pool = Pool::created(name, monitor.map(str::to_string));
        let pool = self
            .pools_mut()
            .await?
            .entry(name.to_string())
            .or_insert(pool);
        Ok(&*pool)
    }

    /// Delete a pool. Rejected while a known route still points at it.
    pub async fn delete_pool(&mut self, name: &str) -> Result<(), LbError> {
        if !self.pools_mut().await?.contains_key(name) {
            return Err(LbError::not_found(ObjectKind::Pool, name));
        }
        if let Some(route) = self.registry.route_referencing(name) {
            return Err(LbError::InUse {
                pool: name.to_string(),
                route: route.name.clone(),
            });
        }

        let jobs = self.backend.delete_pool(name).await?;
        self.settle("delete_pool", Affects::Pools, jobs).await?;

        self.pools_mut().await?.remove(name);
        info!(pool = %name, "pool deleted");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Members
    // -------------------------------------------------------------------------

    /// Members of a pool, fetched from the backend on first access.
    pub async fn members(&mut self, pool: &str) -> Result<Vec<Member>, LbError> {
        Ok(self.members_mut(pool).await?.iter().cloned().collect())
    }

    async fn add_member(&mut self, pool: &str, member: Member) -> Result<(), LbError> {
        if self.members_mut(pool).await?.contains(&member) {
            return Err(LbError::already_exists(
                ObjectKind::Member,
                format!("{member} in pool {pool}"),
            ));
        }

        let jobs = self.backend.add_pool_member(pool, &member).await?;
        self.settle("add_pool_member", Affects::Members(pool), jobs).await?;

        info!(pool = %pool, member = %member, "pool member added");
        self.members_mut(pool).await?.insert(member);
        Ok(())
    }

    async fn delete_member(&mut self, pool: &str, member: Member) -> Result<(), LbError> {
        if !self.members_mut(pool).await?.contains(&member) {
            return Err(LbError::not_found(
                ObjectKind::Member,
                format!("{member} in pool {pool}"),
            ));
        }

        let jobs = self.backend.delete_pool_member(pool, &member).await?;
        self.settle("delete_pool_member", Affects::Members(pool), jobs).await?;

        info!(pool = %pool, member = %member, "pool member deleted");
        self.members_mut(pool).await?.remove(&member);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Routes
    // -------------------------------------------------------------------------

    /// Create a route for `path` to `pool`, attaching it to the configured
    /// virtual endpoint if there is one.
    pub async fn create_route(
        &mut self,
        pool: &str,
        route: &str,
        path: &str,
    ) -> Result<(), LbError> {
        if self.routes_mut().await?.contains_key(route) {
            return Err(LbError::already_exists(ObjectKind::Route, route));
        }
        if !self.pools_mut().await?.contains_key(pool) {
            return Err(LbError::invalid_reference(
                ObjectKind::Pool,
                pool,
                format!("route {route}"),
            ));
        }

        let jobs = self.backend.create_route(pool, route, path).await?;
        self.settle("create_route", Affects::Routes, jobs).await?;

        self.routes_mut().await?.insert(
            route.to_string(),
            Route {
                name: route.to_string(),
                pool: Some(pool.to_string()),
                path: Some(path.to_string()),
            },
        );
        info!(route = %route, pool = %pool, path = %path, "route created");

        self.attach_route(route).await
    }

    /// Attach an existing route to the configured virtual endpoint.
    ///
    /// Does nothing when no endpoint is configured or the route is already
    /// active.
    pub async fn attach_route(&mut self, route: &str) -> Result<(), LbError> {
        if !self.routes_mut().await?.contains_key(route) {
            return Err(LbError::not_found(ObjectKind::Route, route));
        }
        let Some(endpoint) = self.settings.virtual_endpoint.clone() else {
            return Ok(());
        };
        if self.active_routes_mut().await?.contains(route) {
            return Ok(());
        }

        let jobs = self.backend.attach_route(route, &endpoint).await?;
        self.settle("attach_route", Affects::ActiveRoutes, jobs).await?;

        self.active_routes_mut().await?.insert(route.to_string());
        info!(route = %route, endpoint = %endpoint, "route attached");
        Ok(())
    }

    /// Detach (if active) and delete a route. The pool is left alone.
    pub async fn delete_route(&mut self, pool: &str, route: &str) -> Result<(), LbError> {
        let Some(known) = self.routes_mut().await?.get(route).cloned() else {
            return Err(LbError::not_found(ObjectKind::Route, route));
        };
        if let Some(owner) = known.pool.as_deref() {
            if owner != pool {
                return Err(LbError::invalid_reference(
                    ObjectKind::Route,
                    route,
                    format!("pool {pool}"),
                ));
            }
        }
        if !self.pools_mut().await?.contains_key(pool) {
            return Err(LbError::invalid_reference(
                ObjectKind::Pool,
                pool,
                format!("route {route}"),
            ));
        }

        let active = self.active_routes_mut().await?.contains(route);
        let endpoint = match (active, self.settings.virtual_endpoint.clone()) {
            (true, Some(endpoint)) => Some(endpoint),
            (true, None) => {
                return Err(LbError::invalid_reference(
                    ObjectKind::VirtualEndpoint,
                    "(unconfigured)",
                    format!("active route {route}"),
                ))
            }
            (false, _) => None,
        };

        if let Some(endpoint) = endpoint {
            let jobs = self.backend.detach_route(route, &endpoint).await?;
            self.settle("detach_route", Affects::ActiveRoutes, jobs).await?;

            self.active_routes_mut().await?.remove(route);
            info!(route = %route, endpoint = %endpoint, "route detached");
        }

        let jobs = self.backend.delete_route(pool, route).await?;
        self.settle("delete_route", Affects::Routes, jobs).await?;

        self.routes_mut().await?.remove(route);
        info!(route = %route, pool = %pool, "route deleted");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Monitors
    // -------------------------------------------------------------------------

    pub async fn create_monitor(&mut self, spec: &MonitorSpec) -> Result<(), LbError> {
        if self.monitors_mut().await?.contains(&spec.name) {
            return Err(LbError::already_exists(ObjectKind::Monitor, &spec.name));
        }

        let jobs = self.backend.create_monitor(spec).await?;
        self.settle("create_monitor", Affects::Monitors, jobs).await?;

        self.monitors_mut().await?.insert(spec.name.clone());
        info!(
            monitor = %spec.name,
            kind = %spec.kind,
            path = %spec.path,
            up_code = spec.up_code,
            "monitor created"
        );
        Ok(())
    }

    /// Delete a monitor, detaching it from `pool` first when given.
    pub async fn delete_monitor(&mut self, name: &str, pool: Option<&str>) -> Result<(), LbError> {
        if !self.monitors_mut().await?.contains(name) {
            return Err(LbError::not_found(ObjectKind::Monitor, name));
        }
        if let Some(pool) = pool {
            if !self.pools_mut().await?.contains_key(pool) {
                return Err(LbError::invalid_reference(
                    ObjectKind::Pool,
                    pool,
                    format!("monitor {name}"),
                ));
            }
        }

        let jobs = self.backend.delete_monitor(name, pool).await?;
        self.settle("delete_monitor", Affects::Monitors, jobs).await?;

        self.monitors_mut().await?.remove(name);
        if let Some(pool) = pool {
            if let Some(entry) = self.pools_mut().await?.get_mut(pool) {
                if entry.monitor.as_deref() == Some(name) {
                    entry.monitor = None;
                }
            }
        }
        info!(monitor = %name, pool = ?pool, "monitor deleted");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Cache loading
    // -------------------------------------------------------------------------

    async fn pools_mut(&mut self) -> Result<&mut BTreeMap<String, Pool>, LbError> {
        let backend = &mut self.backend;
        self.registry
            .pools
            .get_or_try_load(|| async move {
                let names = backend.list_pools().await?;
                debug!(count = names.len(), "pools loaded from backend");
                Ok::<_, LbError>(
                    names
                        .into_iter()
                        .map(|name| (name.clone(), Pool::listed(name)))
                        .collect(),
                )
            })
            .await
    }

    async fn routes_mut(&mut self) -> Result<&mut BTreeMap<String, Route>, LbError> {
        let backend = &mut self.backend;
        self.registry
            .routes
            .get_or_try_load(|| async move {
                let names = backend.list_routes().await?;
                debug!(count = names.len(), "routes loaded from backend");
                Ok::<_, LbError>(
                    names
                        .into_iter()
                        .map(|name| (name.clone(), Route::listed(name)))
                        .collect(),
                )
            })
            .await
    }

    async fn active_routes_mut(&mut self) -> Result<&mut BTreeSet<String>, LbError> {
        let backend = &mut self.backend;
        self.registry
            .active_routes
            .get_or_try_load(|| async move {
                let names = backend.list_active_routes().await?;
                debug!(count = names.len(), "active routes loaded from backend");
                Ok::<_, LbError>(names.into_iter().collect())
            })
            .await
    }

    async fn monitors_mut(&mut self) -> Result<&mut BTreeSet<String>, LbError> {
        let backend = &mut self.backend;
        self.registry
            .monitors
            .get_or_try_load(|| async move {
                let names = backend.list_monitors().await?;
                debug!(count = names.len(), "monitors loaded from backend");
                Ok::<_, LbError>(names.into_iter().collect())
            })
            .await
    }

    async fn members_mut(&mut self, pool: &str) -> Result<&mut BTreeSet<Member>, LbError> {
        // Make sure the pool list itself is loaded before borrowing into it.
        self.pools_mut().await?;

        let backend = &mut self.backend;
        let Some(entry) = self
            .registry
            .pools
            .get_mut()
            .and_then(|pools| pools.get_mut(pool))
        else {
            return Err(LbError::invalid_reference(
                ObjectKind::Pool,
                pool,
                "member operation",
            ));
        };

        entry
            .members
            .get_or_try_load(|| async move {
                let members = backend.get_pool_members(pool).await?;
                debug!(pool = %pool, count = members.len(), "pool members loaded from backend");
                Ok::<_, LbError>(members.into_iter().collect())
            })
            .await
    }

    // -------------------------------------------------------------------------
    // Jobs
    // -------------------------------------------------------------------------

    /// Wait until every job returned by a mutation has succeeded.
    ///
    /// A failed job or an exhausted wait budget leaves the backend in an
    /// unknown, possibly partially applied state. Nothing is rolled back; the
    /// affected collection is forgotten instead.
    async fn settle(
        &mut self,
        operation: &str,
        affects: Affects<'_>,
        jobs: Vec<JobId>,
    ) -> Result<(), LbError> {
        if jobs.is_empty() {
            return Ok(());
        }

        let result = self.wait_for_jobs(operation, jobs).await;
        if let Err(e @ (LbError::JobFailed { .. } | LbError::JobTimeout { .. })) = &result {
            debug!(operation, reason = e.reason_code(), ?affects, "dropping cached collection");
            self.forget(affects);
        }
        result
    }

    async fn wait_for_jobs(&mut self, operation: &str, jobs: Vec<JobId>) -> Result<(), LbError> {
        debug!(operation, job_count = jobs.len(), "waiting for backend jobs");
        let mut tracker = JobTracker::new(jobs, self.settings.job_budget, Instant::now());

        loop {
            for job_id in tracker.pending() {
                let state = self.backend.get_job_status(&job_id).await?;
                if let Err(e) = tracker.observe(&job_id, state) {
                    warn!(operation, job_id = %job_id, error = %e, "backend job failed");
                    return Err(e.into());
                }
            }

            if tracker.is_complete() {
                debug!(operation, "backend jobs succeeded");
                return Ok(());
            }

            if let Err(e) = tracker.check_deadline(Instant::now()) {
                warn!(operation, error = %e, "gave up waiting for backend jobs");
                return Err(e.into());
            }

            tokio::time::sleep(tracker.interval()).await;
        }
    }

    fn forget(&mut self, affects: Affects<'_>) {
        match affects {
            Affects::Pools => self.registry.pools.invalidate(),
            Affects::Members(pool) => {
                if let Some(entry) = self
                    .registry
                    .pools
                    .get_mut()
                    .and_then(|pools| pools.get_mut(pool))
                {
                    entry.members.invalidate();
                }
            }
            Affects::Routes => self.registry.routes.invalidate(),
            Affects::ActiveRoutes => self.registry.active_routes.invalidate(),
            Affects::Monitors => self.registry.monitors.invalidate(),
        }
    }
}

/// Member operations on one pool.
pub struct PoolHandle<'a, B> {
    controller: &'a mut Controller<B>,
    name: String,
}

impl<B: Backend> PoolHandle<'_, B> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn members(&mut self) -> Result<Vec<Member>, LbError> {
        self.controller.members(&self.name).await
    }

    /// Add `address:port`; fails with `AlreadyExists` if it is already a
    /// member.
    pub async fn add_member(&mut self, address: &str, port: u16) -> Result<(), LbError> {
        self.controller
            .add_member(&self.name, Member::new(address, port))
            .await
    }

    /// Remove `address:port`; fails with `NotFound` if it is not a member.
    pub async fn delete_member(&mut self, address: &str, port: u16) -> Result<(), LbError> {
        self.controller
            .delete_member(&self.name, Member::new(address, port))
            .await
    }
}
