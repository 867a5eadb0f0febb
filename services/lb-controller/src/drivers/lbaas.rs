//! Cloud LBaaS driver.
//!
//! Sessions come from a Keystone v2 identity endpoint. Every mutation is
//! answered with `202 Accepted` and a list of job ids; the change is only in
//! effect once each job reports `COMPLETED`. Job status is read from
//! `.../jobs/<id>`.

use async_trait::async_trait;
use lbsync_reconcile::JobState;
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{build_client, check_status, decode, is_unauthorized, session_rejected, ApiPath};
use crate::config::LbaasConfig;
use crate::error::LbError;
use crate::model::{Backend, Credentials, JobId, Member, MonitorSpec};

const AUTH_HEADER: &str = "X-Auth-Token";
const TOKENS_PATH: &str = "/v2.0/tokens";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access: Access,
}

#[derive(Debug, Deserialize)]
struct Access {
    token: Token,
}

#[derive(Debug, Deserialize)]
struct Token {
    id: String,
    #[serde(default)]
    tenant: Option<Tenant>,
}

#[derive(Debug, Deserialize)]
struct Tenant {
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct JobsResponse {
    #[serde(default)]
    jobs: Vec<JobId>,
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    job: Job,
}

#[derive(Debug, Deserialize)]
struct Job {
    status: String,
}

#[derive(Debug, Deserialize)]
struct Named {
    name: String,
}

#[derive(Debug, Deserialize)]
struct PoolsResponse {
    #[serde(default)]
    pools: Vec<Named>,
}

#[derive(Debug, Deserialize)]
struct MonitorsResponse {
    #[serde(default)]
    monitors: Vec<Named>,
}

#[derive(Debug, Deserialize)]
struct MembersResponse {
    #[serde(default)]
    members: Vec<Member>,
}

#[derive(Debug, Deserialize)]
struct RoutesResponse {
    #[serde(default)]
    routes: Vec<RouteItem>,
}

#[derive(Debug, Deserialize)]
struct RouteItem {
    name: String,
    #[serde(default)]
    state: Option<String>,
}

fn job_state(job_id: &str, status: &str) -> Result<JobState, LbError> {
    match status.to_ascii_uppercase().as_str() {
        "PENDING" | "QUEUED" | "RUNNING" => Ok(JobState::Pending),
        "COMPLETED" | "SUCCEEDED" => Ok(JobState::Succeeded),
        "FAILED" | "ERROR" => Ok(JobState::Failed),
        other => Err(LbError::InvalidResponse {
            operation: "get_job_status".to_string(),
            detail: format!("job {job_id} has unknown status {other:?}"),
        }),
    }
}

struct Session {
    base_url: String,
    tenant_id: String,
    token: String,
}

/// Job-based cloud load-balancer backend.
pub struct LbaasBackend {
    client: reqwest::Client,
    keystone_host: String,
    tenant: String,
    credentials: Option<Credentials>,
    session: Option<Session>,
}

impl LbaasBackend {
    /// Build the driver. No request is made until [`Backend::authenticate`].
    pub fn new(config: &LbaasConfig) -> Result<Self, LbError> {
        Ok(Self {
            client: build_client(false)?,
            keystone_host: config.keystone_host.trim_end_matches('/').to_string(),
            tenant: config.tenant.clone(),
            credentials: None,
            session: None,
        })
    }

    fn session(&self) -> Result<&Session, LbError> {
        self.session
            .as_ref()
            .ok_or_else(|| LbError::BackendUnavailable("LBaaS session not open".to_string()))
    }

    async fn login(&mut self) -> Result<(), LbError> {
        let Some(credentials) = self.credentials.clone() else {
            return Err(LbError::BackendUnavailable(
                "LBaaS session not open".to_string(),
            ));
        };
        let resp = ApiPath::new(TOKENS_PATH)
            .request(&self.client, Method::POST, &self.keystone_host)?
            .json(&json!({
                "auth": {
                    "passwordCredentials": {
                        "username": credentials.user,
                        "password": credentials.secret.expose(),
                    },
                    "tenantName": self.tenant,
                }
            }))
            .send()
            .await?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(LbError::BackendUnavailable(format!(
                "identity service rejected credentials for {}",
                credentials.user
            )));
        }
        let resp = check_status("authenticate", resp).await?;
        let token: TokenResponse = decode("authenticate", resp).await?;

        let tenant_id = token
            .access
            .token
            .tenant
            .map(|t| t.id)
            .unwrap_or_else(|| self.tenant.clone());
        debug!(tenant_id = %tenant_id, "LBaaS token issued");

        self.session = Some(Session {
            base_url: credentials.host.trim_end_matches('/').to_string(),
            tenant_id,
            token: token.access.token.id,
        });
        Ok(())
    }

    /// `/loadbalancers/tenant/<tenant>/<resource...>`
    fn tenant_path(&self, resource: &[&str]) -> Result<ApiPath, LbError> {
        let session = self.session()?;
        let path = ApiPath::new("/loadbalancers/tenant").push(session.tenant_id.as_str());
        Ok(resource.iter().fold(path, |path, segment| path.push(*segment)))
    }

    async fn dispatch(
        &self,
        method: Method,
        path: &ApiPath,
        body: Option<&Value>,
    ) -> Result<Response, LbError> {
        let session = self.session()?;
        let mut req = path
            .request(&self.client, method, &session.base_url)?
            .header(AUTH_HEADER, &session.token);
        if let Some(body) = body {
            req = req.json(body);
        }
        Ok(req.send().await?)
    }

    /// Send a request, re-authenticating once if the token has expired.
    async fn send(
        &mut self,
        operation: &str,
        method: Method,
        path: &ApiPath,
        body: Option<Value>,
    ) -> Result<Response, LbError> {
        let resp = self.dispatch(method.clone(), path, body.as_ref()).await?;
        let resp = if is_unauthorized(&resp) {
            warn!(operation, "LBaaS token expired; authenticating again");
            self.login().await?;
            let retry = self.dispatch(method, path, body.as_ref()).await?;
            if is_unauthorized(&retry) {
                return Err(session_rejected(operation));
            }
            retry
        } else {
            resp
        };
        check_status(operation, resp).await
    }

    async fn get<T>(&mut self, operation: &str, resource: &[&str]) -> Result<T, LbError>
    where
        T: serde::de::DeserializeOwned,
    {
        let path = self.tenant_path(resource)?;
        let resp = self.send(operation, Method::GET, &path, None).await?;
        decode(operation, resp).await
    }

    /// Issue a mutation and return the job ids it was queued under.
    async fn submit(
        &mut self,
        operation: &str,
        method: Method,
        path: &ApiPath,
        body: Option<Value>,
    ) -> Result<Vec<JobId>, LbError> {
        let resp = self.send(operation, method, path, body).await?;
        let raw = resp.text().await?;
        let jobs = if raw.trim().is_empty() {
            JobsResponse::default()
        } else {
            serde_json::from_str::<JobsResponse>(&raw).map_err(|e| LbError::InvalidResponse {
                operation: operation.to_string(),
                detail: e.to_string(),
            })?
        };
        debug!(operation, jobs = ?jobs.jobs, "LBaaS request accepted");
        Ok(jobs.jobs)
    }
}

#[async_trait]
impl Backend for LbaasBackend {
    fn driver_name(&self) -> &'static str {
        "lbaas"
    }

    async fn authenticate(&mut self, credentials: &Credentials) -> Result<(), LbError> {
        self.credentials = Some(credentials.clone());
        self.session = None;
        self.login().await
    }

    async fn list_pools(&mut self) -> Result<Vec<String>, LbError> {
        let resp: PoolsResponse = self.get("list_pools", &["pools"]).await?;
        Ok(resp.pools.into_iter().map(|p| p.name).collect())
    }

    async fn list_routes(&mut self) -> Result<Vec<String>, LbError> {
        let resp: RoutesResponse = self.get("list_routes", &["routes"]).await?;
        Ok(resp.routes.into_iter().map(|r| r.name).collect())
    }

    async fn list_active_routes(&mut self) -> Result<Vec<String>, LbError> {
        let resp: RoutesResponse = self.get("list_active_routes", &["routes"]).await?;
        Ok(resp
            .routes
            .into_iter()
            .filter(|r| r.state.as_deref() == Some("active"))
            .map(|r| r.name)
            .collect())
    }

    async fn list_monitors(&mut self) -> Result<Vec<String>, LbError> {
        let resp: MonitorsResponse = self.get("list_monitors", &["monitors"]).await?;
        Ok(resp.monitors.into_iter().map(|m| m.name).collect())
    }

    async fn create_pool(
        &mut self,
        name: &str,
        monitor: Option<&str>,
    ) -> Result<Vec<JobId>, LbError> {
        let path = self.tenant_path(&["pools"])?;
        let body = json!({ "pool": { "name": name, "monitor": monitor } });
        self.submit("create_pool", Method::POST, &path, Some(body))
            .await
    }

    async fn delete_pool(&mut self, name: &str) -> Result<Vec<JobId>, LbError> {
        let path = self.tenant_path(&["pools", name])?;
        self.submit("delete_pool", Method::DELETE, &path, None).await
    }

    async fn get_pool_members(&mut self, pool: &str) -> Result<Vec<Member>, LbError> {
        let resp: MembersResponse = self
            .get("get_pool_members", &["pools", pool, "members"])
            .await?;
        Ok(resp.members)
    }

    async fn add_pool_member(
        &mut self,
        pool: &str,
        member: &Member,
    ) -> Result<Vec<JobId>, LbError> {
        let path = self.tenant_path(&["pools", pool, "members"])?;
        let body = json!({ "member": member });
        self.submit("add_pool_member", Method::POST, &path, Some(body))
            .await
    }

    async fn delete_pool_member(
        &mut self,
        pool: &str,
        member: &Member,
    ) -> Result<Vec<JobId>, LbError> {
        let key = format!("{}:{}", member.address, member.port);
        let path = self.tenant_path(&["pools", pool, "members", key.as_str()])?;
        self.submit("delete_pool_member", Method::DELETE, &path, None)
            .await
    }

    async fn create_route(
        &mut self,
        pool: &str,
        route: &str,
        path: &str,
    ) -> Result<Vec<JobId>, LbError> {
        let url = self.tenant_path(&["routes"])?;
        let body = json!({ "route": { "name": route, "pool": pool, "path": path } });
        self.submit("create_route", Method::POST, &url, Some(body))
            .await
    }

    async fn delete_route(&mut self, _pool: &str, route: &str) -> Result<Vec<JobId>, LbError> {
        let path = self.tenant_path(&["routes", route])?;
        self.submit("delete_route", Method::DELETE, &path, None).await
    }

    async fn attach_route(&mut self, route: &str, endpoint: &str) -> Result<Vec<JobId>, LbError> {
        let path = self.tenant_path(&["routes", route, "state"])?;
        let body = json!({ "state": "active", "endpoint": endpoint });
        self.submit("attach_route", Method::PUT, &path, Some(body))
            .await
    }

    async fn detach_route(&mut self, route: &str, endpoint: &str) -> Result<Vec<JobId>, LbError> {
        let path = self.tenant_path(&["routes", route, "state"])?;
        let body = json!({ "state": "inactive", "endpoint": endpoint });
        self.submit("detach_route", Method::PUT, &path, Some(body))
            .await
    }

    async fn create_monitor(&mut self, spec: &MonitorSpec) -> Result<Vec<JobId>, LbError> {
        let path = self.tenant_path(&["monitors"])?;
        let body = json!({ "monitor": spec });
        self.submit("create_monitor", Method::POST, &path, Some(body))
            .await
    }

    async fn delete_monitor(
        &mut self,
        name: &str,
        pool: Option<&str>,
    ) -> Result<Vec<JobId>, LbError> {
        let mut path = self.tenant_path(&["monitors", name])?;
        if let Some(pool) = pool {
            path = path.query("pool", pool);
        }
        self.submit("delete_monitor", Method::DELETE, &path, None)
            .await
    }

    async fn get_job_status(&mut self, job_id: &str) -> Result<JobState, LbError> {
        let resp: JobResponse = self.get("get_job_status", &["jobs", job_id]).await?;
        job_state(job_id, &resp.job.status)
    }
}
