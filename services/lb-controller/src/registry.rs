//! Local view of the backend's routing objects.
//!
//! Each collection starts [`CacheState::Unloaded`] and is filled by one full
//! listing from the backend the first time it is needed. After that the
//! controller mutates it in place, and only after the backend has confirmed
//! the matching change.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;

use crate::model::Member;

/// Load state of a cached collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Never fetched (or invalidated); the next access lists the backend.
    Unloaded,
    /// Filled from the backend and kept current by confirmed mutations.
    Loaded,
}

/// A lazily loaded collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cached<T> {
    value: Option<T>,
}

impl<T> Default for Cached<T> {
    fn default() -> Self {
        Self::unloaded()
    }
}

impl<T> Cached<T> {
    pub fn unloaded() -> Self {
        Self { value: None }
    }

    pub fn loaded(value: T) -> Self {
        Self { value: Some(value) }
    }

    pub fn state(&self) -> CacheState {
        match self.value {
            Some(_) => CacheState::Loaded,
            None => CacheState::Unloaded,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.state() == CacheState::Loaded
    }

    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.value.as_mut()
    }

    /// Mark the collection loaded with `value`.
    pub fn load(&mut self, value: T) -> &mut T {
        self.value.insert(value)
    }

    /// Return the loaded value, running `load` first if there is none.
    ///
    /// A failed load leaves the collection unloaded.
    pub async fn get_or_try_load<F, Fut, E>(&mut self, load: F) -> Result<&mut T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let value = match self.value.take() {
            Some(value) => value,
            None => load().await?,
        };
        Ok(self.value.insert(value))
    }

    /// Drop the loaded value so the next access reloads from the backend.
    pub fn invalidate(&mut self) {
        self.value = None;
    }
}

/// A cached pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pool {
    pub name: String,

    /// Monitor attached at creation, when known.
    pub monitor: Option<String>,

    /// Members, loaded on first member operation.
    pub members: Cached<BTreeSet<Member>>,
}

impl Pool {
    /// A pool discovered by listing; members not fetched yet.
    pub fn listed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            monitor: None,
            members: Cached::unloaded(),
        }
    }

    /// A pool this controller just created; it has no members.
    pub fn created(name: impl Into<String>, monitor: Option<String>) -> Self {
        Self {
            name: name.into(),
            monitor,
            members: Cached::loaded(BTreeSet::new()),
        }
    }

    /// Loaded members as a sorted list, or `None` if not fetched yet.
    pub fn member_list(&self) -> Option<Vec<Member>> {
        self.members.get().map(|m| m.iter().cloned().collect())
    }
}

/// A cached route.
///
/// Routes discovered by listing only carry their name; pool and path are
/// known for routes this controller created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub name: String,
    pub pool: Option<String>,
    pub path: Option<String>,
}

impl Route {
    pub fn listed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pool: None,
            path: None,
        }
    }
}

/// Registry of pools, routes, active routes and monitors.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    pub pools: Cached<BTreeMap<String, Pool>>,
    pub routes: Cached<BTreeMap<String, Route>>,
    pub active_routes: Cached<BTreeSet<String>>,
    pub monitors: Cached<BTreeSet<String>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// First route known to point at `pool`.
    pub fn route_referencing(&self, pool: &str) -> Option<&Route> {
        self.routes
            .get()?
            .values()
            .find(|route| route.pool.as_deref() == Some(pool))
    }

    /// Forget everything; the next access reloads from the backend.
    pub fn invalidate(&mut self) {
        self.pools.invalidate();
        self.routes.invalidate();
        self.active_routes.invalidate();
        self.monitors.invalidate();
    }
}
