//! Backend drivers.
//!
//! - [`appliance`]: synchronous hardware/virtual appliance over its REST
//!   management API.
//! - [`lbaas`]: cloud load-balancer service; every mutation is an
//!   asynchronous job.
//! - [`memory`]: in-process backend for tests and dry runs.

pub mod appliance;
pub mod lbaas;
pub mod memory;

pub use appliance::ApplianceBackend;
pub use lbaas::LbaasBackend;
pub use memory::{JobMode, MemoryBackend};

use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;

use crate::error::LbError;

const USER_AGENT: &str = concat!("lbsync-controller/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A resource path below a driver's base URL.
///
/// Segments and query values are kept raw and percent-encoded only when the
/// request is built, so object names never change the shape of the URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ApiPath {
    segments: Vec<String>,
    query: Vec<(&'static str, String)>,
}

impl ApiPath {
    /// Start from a fixed `/`-separated prefix.
    fn new(prefix: &str) -> Self {
        Self {
            segments: prefix
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            query: Vec::new(),
        }
    }

    /// Append one segment; `/` inside it is encoded, not split.
    fn push(mut self, segment: impl Into<String>) -> Self {
        self.segments.push(segment.into());
        self
    }

    fn query(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.query.push((key, value.into()));
        self
    }

    fn url(&self, base: &str) -> Result<Url, LbError> {
        let mut url = Url::parse(base).map_err(|e| {
            LbError::BackendUnavailable(format!("invalid backend URL {base}: {e}"))
        })?;
        url.path_segments_mut()
            .map_err(|()| LbError::BackendUnavailable(format!("backend URL {base} has no path")))?
            .pop_if_empty()
            .extend(&self.segments);
        Ok(url)
    }

    /// Start a request for this path on `client`.
    fn request(
        &self,
        client: &reqwest::Client,
        method: reqwest::Method,
        base: &str,
    ) -> Result<RequestBuilder, LbError> {
        let req = client.request(method, self.url(base)?);
        Ok(if self.query.is_empty() {
            req
        } else {
            req.query(&self.query)
        })
    }
}

fn build_client(insecure_tls: bool) -> Result<reqwest::Client, LbError> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(REQUEST_TIMEOUT)
        .danger_accept_invalid_certs(insecure_tls)
        .build()
        .map_err(|e| LbError::BackendUnavailable(format!("failed to build HTTP client: {e}")))
}

/// Turn a non-success status into an error. 5xx counts as unavailable,
/// anything else as a rejection of the request.
async fn check_status(operation: &str, resp: Response) -> Result<Response, LbError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    if status.is_server_error() {
        return Err(LbError::BackendUnavailable(format!(
            "{operation} failed (status={status}): {body}"
        )));
    }
    Err(LbError::BackendRejected {
        operation: operation.to_string(),
        status: status.as_u16(),
        body,
    })
}

async fn decode<T: DeserializeOwned>(operation: &str, resp: Response) -> Result<T, LbError> {
    let raw = resp.text().await?;
    serde_json::from_str(&raw).map_err(|e| LbError::InvalidResponse {
        operation: operation.to_string(),
        detail: e.to_string(),
    })
}

fn is_unauthorized(resp: &Response) -> bool {
    resp.status() == StatusCode::UNAUTHORIZED
}

fn session_rejected(operation: &str) -> LbError {
    LbError::BackendUnavailable(format!("{operation}: session rejected after re-authentication"))
}
