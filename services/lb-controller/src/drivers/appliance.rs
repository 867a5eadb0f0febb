//! Appliance driver.
//!
//! Talks to the appliance's REST management API. Every call is synchronous:
//! when the response arrives the change is in effect, so mutations never
//! return job ids.
//!
//! Objects live in the `Common` partition and are addressed as
//! `~Common~<name>`. Routes are HTTP-class profiles; a route is active while
//! the profile is listed on the configured virtual server.

use async_trait::async_trait;
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{build_client, check_status, decode, is_unauthorized, session_rejected, ApiPath};
use crate::config::ApplianceConfig;
use crate::error::{LbError, ObjectKind};
use crate::model::{Backend, Credentials, JobId, Member, MonitorSpec, MonitorType};

const AUTH_HEADER: &str = "X-F5-Auth-Token";
const PARTITION: &str = "Common";

const LOGIN_PATH: &str = "/mgmt/shared/authn/login";
const POOL_PATH: &str = "/mgmt/tm/ltm/pool";
const ROUTE_PATH: &str = "/mgmt/tm/ltm/profile/httpclass";
const VIRTUAL_PATH: &str = "/mgmt/tm/ltm/virtual";
const MONITOR_PATH: &str = "/mgmt/tm/ltm/monitor";

const MONITOR_KINDS: [MonitorType; 3] = [MonitorType::Http, MonitorType::Https, MonitorType::Tcp];

#[derive(Debug, Deserialize)]
struct Collection {
    #[serde(default)]
    items: Vec<NamedItem>,
}

impl Collection {
    fn names(self) -> Vec<String> {
        self.items.into_iter().map(|i| i.name).collect()
    }
}

#[derive(Debug, Deserialize)]
struct NamedItem {
    name: String,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: LoginToken,
}

#[derive(Debug, Deserialize)]
struct LoginToken {
    token: String,
}

fn qualified(name: &str) -> String {
    format!("~{PARTITION}~{name}")
}

fn pool_path(pool: &str) -> ApiPath {
    ApiPath::new(POOL_PATH).push(qualified(pool))
}

fn profiles_path(endpoint: &str) -> ApiPath {
    ApiPath::new(VIRTUAL_PATH)
        .push(qualified(endpoint))
        .push("profiles")
}

fn monitor_path(kind: MonitorType) -> ApiPath {
    ApiPath::new(MONITOR_PATH).push(kind.to_string())
}

/// Synchronous appliance backend.
pub struct ApplianceBackend {
    client: reqwest::Client,
    virtual_endpoint: Option<String>,
    base_url: Option<String>,
    credentials: Option<Credentials>,
    token: Option<String>,
}

impl ApplianceBackend {
    /// Build the driver. No request is made until [`Backend::authenticate`].
    ///
    /// `virtual_endpoint` is the virtual server whose profile list decides
    /// which routes count as active.
    pub fn new(config: &ApplianceConfig, virtual_endpoint: Option<String>) -> Result<Self, LbError> {
        Ok(Self {
            client: build_client(config.insecure_tls)?,
            virtual_endpoint,
            base_url: None,
            credentials: None,
            token: None,
        })
    }

    fn base_url(&self) -> Result<&str, LbError> {
        self.base_url
            .as_deref()
            .ok_or_else(|| LbError::BackendUnavailable("appliance session not open".to_string()))
    }

    async fn login(&mut self) -> Result<(), LbError> {
        let Some(credentials) = self.credentials.clone() else {
            return Err(LbError::BackendUnavailable(
                "appliance session not open".to_string(),
            ));
        };
        let resp = ApiPath::new(LOGIN_PATH)
            .request(&self.client, Method::POST, self.base_url()?)?
            .json(&json!({
                "username": credentials.user,
                "password": credentials.secret.expose(),
                "loginProviderName": "tmos",
            }))
            .send()
            .await?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(LbError::BackendUnavailable(format!(
                "appliance rejected credentials for {}",
                credentials.user
            )));
        }
        let resp = check_status("login", resp).await?;
        let login: LoginResponse = decode("login", resp).await?;

        self.token = Some(login.token.token);
        debug!(host = %credentials.host, "appliance login succeeded");
        Ok(())
    }

    async fn dispatch(
        &self,
        method: Method,
        path: &ApiPath,
        body: Option<&Value>,
    ) -> Result<Response, LbError> {
        let mut req = path.request(&self.client, method, self.base_url()?)?;
        if let Some(token) = &self.token {
            req = req.header(AUTH_HEADER, token);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        Ok(req.send().await?)
    }

    /// Send a request, logging in again once if the session has expired.
    async fn send(
        &mut self,
        operation: &str,
        method: Method,
        path: &ApiPath,
        body: Option<Value>,
    ) -> Result<Response, LbError> {
        let resp = self.dispatch(method.clone(), path, body.as_ref()).await?;
        let resp = if is_unauthorized(&resp) {
            warn!(operation, "appliance session expired; logging in again");
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

    async fn names(&mut self, operation: &str, path: &ApiPath) -> Result<Vec<String>, LbError> {
        let resp = self.send(operation, Method::GET, path, None).await?;
        let collection: Collection = decode(operation, resp).await?;
        Ok(collection.names())
    }

    async fn mutate(
        &mut self,
        operation: &str,
        method: Method,
        path: &ApiPath,
        body: Option<Value>,
    ) -> Result<Vec<JobId>, LbError> {
        self.send(operation, method, path, body).await?;
        debug!(operation, path = ?path.segments, "appliance change applied");
        Ok(Vec::new())
    }

    /// Find which monitor collection holds `name`.
    async fn monitor_kind(&mut self, name: &str) -> Result<MonitorType, LbError> {
        for kind in MONITOR_KINDS {
            let path = monitor_path(kind).push(qualified(name));
            match self.send("get_monitor", Method::GET, &path, None).await {
                Ok(_) => return Ok(kind),
                Err(LbError::BackendRejected { status: 404, .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(LbError::not_found(ObjectKind::Monitor, name))
    }
}

#[async_trait]
impl Backend for ApplianceBackend {
    fn driver_name(&self) -> &'static str {
        "appliance"
    }

    async fn authenticate(&mut self, credentials: &Credentials) -> Result<(), LbError> {
        self.base_url = Some(credentials.host.trim_end_matches('/').to_string());
        self.credentials = Some(credentials.clone());
        self.token = None;
        self.login().await
    }

    async fn list_pools(&mut self) -> Result<Vec<String>, LbError> {
        self.names("list_pools", &ApiPath::new(POOL_PATH)).await
    }

    async fn list_routes(&mut self) -> Result<Vec<String>, LbError> {
        self.names("list_routes", &ApiPath::new(ROUTE_PATH)).await
    }

    async fn list_active_routes(&mut self) -> Result<Vec<String>, LbError> {
        let Some(endpoint) = self.virtual_endpoint.clone() else {
            return Ok(Vec::new());
        };

        let routes = self.list_routes().await?;
        let profiles = self
            .names("list_active_routes", &profiles_path(&endpoint))
            .await?;

        Ok(profiles
            .into_iter()
            .filter(|p| routes.contains(p))
            .collect())
    }

    async fn list_monitors(&mut self) -> Result<Vec<String>, LbError> {
        let mut names = Vec::new();
        for kind in MONITOR_KINDS {
            names.extend(self.names("list_monitors", &monitor_path(kind)).await?);
        }
        Ok(names)
    }

    async fn create_pool(
        &mut self,
        name: &str,
        monitor: Option<&str>,
    ) -> Result<Vec<JobId>, LbError> {
        let mut body = json!({
            "name": name,
            "partition": PARTITION,
            "loadBalancingMode": "round-robin",
        });
        if let Some(monitor) = monitor {
            body["monitor"] = json!(format!("/{PARTITION}/{monitor}"));
        }
        self.mutate("create_pool", Method::POST, &ApiPath::new(POOL_PATH), Some(body))
            .await
    }

    async fn delete_pool(&mut self, name: &str) -> Result<Vec<JobId>, LbError> {
        self.mutate("delete_pool", Method::DELETE, &pool_path(name), None)
            .await
    }

    async fn get_pool_members(&mut self, pool: &str) -> Result<Vec<Member>, LbError> {
        let path = pool_path(pool).push("members");
        self.names("get_pool_members", &path)
            .await?
            .iter()
            .map(|name| name.parse::<Member>())
            .collect()
    }

    async fn add_pool_member(
        &mut self,
        pool: &str,
        member: &Member,
    ) -> Result<Vec<JobId>, LbError> {
        let path = pool_path(pool).push("members");
        let body = json!({
            "name": member.to_string(),
            "partition": PARTITION,
            "address": member.address,
        });
        self.mutate("add_pool_member", Method::POST, &path, Some(body))
            .await
    }

    async fn delete_pool_member(
        &mut self,
        pool: &str,
        member: &Member,
    ) -> Result<Vec<JobId>, LbError> {
        let path = pool_path(pool)
            .push("members")
            .push(qualified(&member.to_string()));
        self.mutate("delete_pool_member", Method::DELETE, &path, None)
            .await
    }

    async fn create_route(
        &mut self,
        pool: &str,
        route: &str,
        path: &str,
    ) -> Result<Vec<JobId>, LbError> {
        let body = json!({
            "name": route,
            "partition": PARTITION,
            "pool": format!("/{PARTITION}/{pool}"),
            "paths": format!("{path}(/.*)?$"),
        });
        self.mutate("create_route", Method::POST, &ApiPath::new(ROUTE_PATH), Some(body))
            .await
    }

    async fn delete_route(&mut self, _pool: &str, route: &str) -> Result<Vec<JobId>, LbError> {
        let path = ApiPath::new(ROUTE_PATH).push(qualified(route));
        self.mutate("delete_route", Method::DELETE, &path, None).await
    }

    async fn attach_route(&mut self, route: &str, endpoint: &str) -> Result<Vec<JobId>, LbError> {
        let path = profiles_path(endpoint);
        let body = json!({
            "name": route,
            "partition": PARTITION,
            "context": "all",
        });
        self.mutate("attach_route", Method::POST, &path, Some(body))
            .await
    }

    async fn detach_route(&mut self, route: &str, endpoint: &str) -> Result<Vec<JobId>, LbError> {
        let path = profiles_path(endpoint).push(qualified(route));
        self.mutate("detach_route", Method::DELETE, &path, None)
            .await
    }

    async fn create_monitor(&mut self, spec: &MonitorSpec) -> Result<Vec<JobId>, LbError> {
        let mut body = json!({
            "name": spec.name,
            "partition": PARTITION,
            "interval": spec.interval,
            "timeout": spec.timeout,
        });
        if spec.kind != MonitorType::Tcp {
            body["send"] = json!(format!("GET {} HTTP/1.0\\r\\n\\r\\n", spec.path));
            body["recv"] = json!(format!("^HTTP/1\\.[01] {}", spec.up_code));
        }
        self.mutate("create_monitor", Method::POST, &monitor_path(spec.kind), Some(body))
            .await
    }

    async fn delete_monitor(
        &mut self,
        name: &str,
        pool: Option<&str>,
    ) -> Result<Vec<JobId>, LbError> {
        if let Some(pool) = pool {
            self.send(
                "detach_monitor",
                Method::PATCH,
                &pool_path(pool),
                Some(json!({ "monitor": "none" })),
            )
            .await?;
        }

        let kind = self.monitor_kind(name).await?;
        let path = monitor_path(kind).push(qualified(name));
        self.mutate("delete_monitor", Method::DELETE, &path, None)
            .await
    }
}
