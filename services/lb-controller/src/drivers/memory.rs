//! In-memory backend for testing and dry runs.
//!
//! Holds pools, routes and monitors in process and behaves like a real
//! backend: it rejects duplicates and dangling references on its own side and
//! can be switched to job-based mode to exercise asynchronous reconciliation.
//! The handle is cheap to clone; all clones share one state, so a test can
//! hand one clone to a controller and inspect the backend through another.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use lbsync_reconcile::JobState;
use tracing::debug;

use crate::error::{LbError, ObjectKind};
use crate::model::{Backend, Credentials, JobId, Member, MonitorSpec};

/// How mutations complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobMode {
    /// Applied synchronously, no jobs (appliance-like).
    Immediate,
    /// Applied and reported through a job that has succeeded.
    Succeed,
    /// Not applied; the job reports failure.
    Fail,
    /// Not applied; the job never leaves `pending`.
    StayPending,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryPool {
    pub monitor: Option<String>,
    pub members: BTreeSet<Member>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRoute {
    pub pool: String,
    pub path: String,
    /// Virtual endpoint the route is attached to.
    pub endpoint: Option<String>,
}

/// Backend state shared by every clone of a [`MemoryBackend`].
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub pools: BTreeMap<String, MemoryPool>,
    pub routes: BTreeMap<String, MemoryRoute>,
    pub monitors: BTreeMap<String, MonitorSpec>,
    pub jobs: BTreeMap<JobId, JobState>,

    /// Every backend call, in order, by operation name.
    pub calls: Vec<String>,

    /// Number of successful `authenticate` calls.
    pub sessions: u32,

    /// Simulate lost connectivity: every call fails.
    pub unavailable: bool,

    /// Operations that fail as if the backend were down, e.g.
    /// `"create_route"`.
    pub failing: BTreeSet<String>,

    next_job: u64,
}

impl MemoryState {
    pub fn members(&self, pool: &str) -> Vec<Member> {
        self.pools
            .get(pool)
            .map(|p| p.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn active_routes(&self) -> Vec<String> {
        self.routes
            .iter()
            .filter(|(_, r)| r.endpoint.is_some())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Calls other than listings, member reads and job lookups.
    pub fn mutation_calls(&self) -> Vec<String> {
        self.calls
            .iter()
            .filter(|c| {
                !c.starts_with("list_")
                    && c.as_str() != "get_pool_members"
                    && c.as_str() != "get_job_status"
                    && c.as_str() != "authenticate"
            })
            .cloned()
            .collect()
    }

    fn issue_job(&mut self, state: JobState) -> JobId {
        self.next_job += 1;
        let id = format!("job-{}", self.next_job);
        self.jobs.insert(id.clone(), state);
        id
    }
}

/// In-process [`Backend`].
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    job_mode: JobMode,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// A synchronous backend with no objects.
    pub fn new() -> Self {
        Self::with_job_mode(JobMode::Immediate)
    }

    pub fn with_job_mode(job_mode: JobMode) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            job_mode,
        }
    }

    /// A second handle on the same state with a different job mode.
    pub fn switch_job_mode(&self, job_mode: JobMode) -> Self {
        Self {
            state: Arc::clone(&self.state),
            job_mode,
        }
    }

    /// Copy of the current backend state.
    pub fn snapshot(&self) -> MemoryState {
        self.lock().clone()
    }

    /// Mutate backend state directly, bypassing the call log. Used to seed
    /// pre-existing objects or to simulate changes made outside the
    /// controller.
    pub fn seed<F>(&self, f: F)
    where
        F: FnOnce(&mut MemoryState),
    {
        f(&mut self.lock());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Resolve a pending job, as the remote side eventually would.
    pub fn complete_job(&self, job_id: &str, state: JobState) {
        if let Some(slot) = self.lock().jobs.get_mut(job_id) {
            *slot = state;
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn call(&self, operation: &str) -> Result<MutexGuard<'_, MemoryState>, LbError> {
        let mut state = self.lock();
        state.calls.push(operation.to_string());
        if state.unavailable || state.failing.contains(operation) {
            return Err(LbError::BackendUnavailable(format!(
                "memory backend offline during {operation}"
            )));
        }
        Ok(state)
    }

    fn mutate<F>(&self, operation: &str, apply: F) -> Result<Vec<JobId>, LbError>
    where
        F: FnOnce(&mut MemoryState) -> Result<(), LbError>,
    {
        let mut state = self.call(operation)?;
        debug!(operation, job_mode = ?self.job_mode, "[MEMORY] mutation");

        match self.job_mode {
            JobMode::Immediate => {
                apply(&mut state)?;
                Ok(Vec::new())
            }
            JobMode::Succeed => {
                apply(&mut state)?;
                Ok(vec![state.issue_job(JobState::Succeeded)])
            }
            JobMode::Fail => Ok(vec![state.issue_job(JobState::Failed)]),
            JobMode::StayPending => Ok(vec![state.issue_job(JobState::Pending)]),
        }
    }
}

fn rejected(operation: &str, status: u16, body: impl Into<String>) -> LbError {
    LbError::BackendRejected {
        operation: operation.to_string(),
        status,
        body: body.into(),
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn driver_name(&self) -> &'static str {
        "memory"
    }

    async fn authenticate(&mut self, credentials: &Credentials) -> Result<(), LbError> {
        let mut state = self.call("authenticate")?;
        if credentials.user.is_empty() {
            return Err(LbError::BackendUnavailable(
                "memory backend requires a user".to_string(),
            ));
        }
        state.sessions += 1;
        Ok(())
    }

    async fn list_pools(&mut self) -> Result<Vec<String>, LbError> {
        Ok(self.call("list_pools")?.pools.keys().cloned().collect())
    }

    async fn list_routes(&mut self) -> Result<Vec<String>, LbError> {
        Ok(self.call("list_routes")?.routes.keys().cloned().collect())
    }

    async fn list_active_routes(&mut self) -> Result<Vec<String>, LbError> {
        Ok(self.call("list_active_routes")?.active_routes())
    }

    async fn list_monitors(&mut self) -> Result<Vec<String>, LbError> {
        Ok(self.call("list_monitors")?.monitors.keys().cloned().collect())
    }

    async fn create_pool(
        &mut self,
        name: &str,
        monitor: Option<&str>,
    ) -> Result<Vec<JobId>, LbError> {
        self.mutate("create_pool", |state| {
            if state.pools.contains_key(name) {
                return Err(rejected("create_pool", 409, format!("pool {name} exists")));
            }
            if let Some(monitor) = monitor {
                if !state.monitors.contains_key(monitor) {
                    return Err(rejected("create_pool", 404, format!("monitor {monitor}")));
                }
            }
            state.pools.insert(
                name.to_string(),
                MemoryPool {
                    monitor: monitor.map(str::to_string),
                    members: BTreeSet::new(),
                },
            );
            Ok(())
        })
    }

    async fn delete_pool(&mut self, name: &str) -> Result<Vec<JobId>, LbError> {
        self.mutate("delete_pool", |state| {
            if state.routes.values().any(|r| r.pool == name) {
                return Err(rejected("delete_pool", 409, format!("pool {name} in use")));
            }
            state
                .pools
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| LbError::not_found(ObjectKind::Pool, name))
        })
    }

    async fn get_pool_members(&mut self, pool: &str) -> Result<Vec<Member>, LbError> {
        let state = self.call("get_pool_members")?;
        let entry = state
            .pools
            .get(pool)
            .ok_or_else(|| LbError::not_found(ObjectKind::Pool, pool))?;
        Ok(entry.members.iter().cloned().collect())
    }

    async fn add_pool_member(
        &mut self,
        pool: &str,
        member: &Member,
    ) -> Result<Vec<JobId>, LbError> {
        self.mutate("add_pool_member", |state| {
            let entry = state
                .pools
                .get_mut(pool)
                .ok_or_else(|| LbError::not_found(ObjectKind::Pool, pool))?;
            if !entry.members.insert(member.clone()) {
                return Err(rejected("add_pool_member", 409, member.to_string()));
            }
            Ok(())
        })
    }

    async fn delete_pool_member(
        &mut self,
        pool: &str,
        member: &Member,
    ) -> Result<Vec<JobId>, LbError> {
        self.mutate("delete_pool_member", |state| {
            let entry = state
                .pools
                .get_mut(pool)
                .ok_or_else(|| LbError::not_found(ObjectKind::Pool, pool))?;
            if !entry.members.remove(member) {
                return Err(LbError::not_found(ObjectKind::Member, member.to_string()));
            }
            Ok(())
        })
    }

    async fn create_route(
        &mut self,
        pool: &str,
        route: &str,
        path: &str,
    ) -> Result<Vec<JobId>, LbError> {
        self.mutate("create_route", |state| {
            if state.routes.contains_key(route) {
                return Err(rejected("create_route", 409, format!("route {route} exists")));
            }
            if !state.pools.contains_key(pool) {
                return Err(rejected("create_route", 404, format!("pool {pool}")));
            }
            state.routes.insert(
                route.to_string(),
                MemoryRoute {
                    pool: pool.to_string(),
                    path: path.to_string(),
                    endpoint: None,
                },
            );
            Ok(())
        })
    }

    async fn delete_route(&mut self, _pool: &str, route: &str) -> Result<Vec<JobId>, LbError> {
        self.mutate("delete_route", |state| {
            match state.routes.get(route) {
                None => return Err(LbError::not_found(ObjectKind::Route, route)),
                Some(r) if r.endpoint.is_some() => {
                    return Err(rejected("delete_route", 409, format!("route {route} attached")))
                }
                Some(_) => {}
            }
            state.routes.remove(route);
            Ok(())
        })
    }

    async fn attach_route(&mut self, route: &str, endpoint: &str) -> Result<Vec<JobId>, LbError> {
        self.mutate("attach_route", |state| {
            let entry = state
                .routes
                .get_mut(route)
                .ok_or_else(|| LbError::not_found(ObjectKind::Route, route))?;
            entry.endpoint = Some(endpoint.to_string());
            Ok(())
        })
    }

    async fn detach_route(&mut self, route: &str, endpoint: &str) -> Result<Vec<JobId>, LbError> {
        self.mutate("detach_route", |state| {
            let entry = state
                .routes
                .get_mut(route)
                .ok_or_else(|| LbError::not_found(ObjectKind::Route, route))?;
            if entry.endpoint.as_deref() != Some(endpoint) {
                return Err(LbError::not_found(
                    ObjectKind::VirtualEndpoint,
                    format!("{endpoint} for route {route}"),
                ));
            }
            entry.endpoint = None;
            Ok(())
        })
    }

    async fn create_monitor(&mut self, spec: &MonitorSpec) -> Result<Vec<JobId>, LbError> {
        self.mutate("create_monitor", |state| {
            if state.monitors.contains_key(&spec.name) {
                return Err(rejected(
                    "create_monitor",
                    409,
                    format!("monitor {} exists", spec.name),
                ));
            }
            state.monitors.insert(spec.name.clone(), spec.clone());
            Ok(())
        })
    }

    async fn delete_monitor(
        &mut self,
        name: &str,
        pool: Option<&str>,
    ) -> Result<Vec<JobId>, LbError> {
        self.mutate("delete_monitor", |state| {
            if let Some(pool) = pool {
                if let Some(entry) = state.pools.get_mut(pool) {
                    if entry.monitor.as_deref() == Some(name) {
                        entry.monitor = None;
                    }
                }
            }
            if state
                .pools
                .values()
                .any(|p| p.monitor.as_deref() == Some(name))
            {
                return Err(rejected("delete_monitor", 409, format!("monitor {name} in use")));
            }
            state
                .monitors
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| LbError::not_found(ObjectKind::Monitor, name))
        })
    }

    async fn get_job_status(&mut self, job_id: &str) -> Result<JobState, LbError> {
        let state = self.call("get_job_status")?;
        state
            .jobs
            .get(job_id)
            .copied()
            .ok_or_else(|| LbError::not_found(ObjectKind::Job, job_id))
    }
}
