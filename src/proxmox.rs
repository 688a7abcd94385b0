use crate::config::ProxmoxConfig;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Response};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const API_BASE_PATH: &str = "/api2/json";
pub const NODES_PATH: &str = "/nodes";
const AUTH_SCHEME: &str = "PVEAPIToken=";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestKind {
    Qemu,
    Lxc,
}

impl GuestKind {
    pub const ALL: [GuestKind; 2] = [GuestKind::Qemu, GuestKind::Lxc];

    pub fn as_str(self) -> &'static str {
        match self {
            GuestKind::Qemu => "qemu",
            GuestKind::Lxc => "lxc",
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transport error calling {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered with HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("no response from {url} within {timeout_secs}s")]
    Timeout { url: String, timeout_secs: u64 },
    #[error("malformed response from {path}: {reason}")]
    Malformed { path: String, reason: String },
    #[error("guest record is missing '{key}'")]
    MissingKey { key: String },
    #[error("unusable response from {path}: {reason}")]
    Empty { path: String, reason: String },
}

/// Failure classes that end up in the published state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transport,
    Timeout,
    Enumeration,
    Validation,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 4] = [
        ErrorCategory::Transport,
        ErrorCategory::Timeout,
        ErrorCategory::Enumeration,
        ErrorCategory::Validation,
    ];

    pub fn label(self) -> &'static str {
        match self {
            ErrorCategory::Transport => "Error - Client Error",
            ErrorCategory::Timeout => "Error - Timeout Error",
            ErrorCategory::Enumeration => "Error - JSON Parsing Error",
            ErrorCategory::Validation => "Error - ValueError",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Transport => "transport",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Enumeration => "enumeration",
            ErrorCategory::Validation => "validation",
        }
    }
}

impl ApiError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ApiError::Transport { .. } | ApiError::Status { .. } => ErrorCategory::Transport,
            ApiError::Timeout { .. } => ErrorCategory::Timeout,
            ApiError::Malformed { .. } | ApiError::MissingKey { .. } => ErrorCategory::Enumeration,
            ApiError::Empty { .. } => ErrorCategory::Validation,
        }
    }

    fn from_reqwest(url: &str, timeout: Duration, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout {
                url: url.to_string(),
                timeout_secs: timeout.as_secs(),
            }
        } else {
            ApiError::Transport {
                url: url.to_string(),
                source: err,
            }
        }
    }
}

/// Token-authenticated client for the `/api2/json` tree of one Proxmox VE host.
#[derive(Debug, Clone)]
pub struct ProxmoxClient {
    http: Client,
    base_url: String,
    auth_header: String,
    timeout: Duration,
}

impl ProxmoxClient {
    pub fn new(cfg: &ProxmoxConfig) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .user_agent(concat!("pvewatch/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(!cfg.verify_tls)
            .build()?;
        Ok(Self {
            http,
            base_url: cfg.base_url(),
            auth_header: format!("{AUTH_SCHEME}{}", cfg.api_token.trim()),
            timeout: Duration::from_secs(cfg.request_timeout_secs),
        })
    }

    pub fn url_for(&self, path_suffix: &str) -> String {
        format!("{}{}{}", self.base_url, API_BASE_PATH, path_suffix)
    }

    /// Single authenticated GET below the API base path.
    pub async fn fire_api_call(&self, path_suffix: &str) -> Result<Response, ApiError> {
        let url = self.url_for(path_suffix);
        debug!(url = %url, "proxmox request");

        let response = self
            .http
            .get(&url)
            .header(AUTHORIZATION, &self.auth_header)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| ApiError::from_reqwest(&url, self.timeout, err))?;

        let status = response.status();
        debug!(url = %url, status = status.as_u16(), "proxmox response");
        if !status.is_success() {
            return Err(ApiError::Status {
                url,
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    /// Fetches `path_suffix` and unwraps the `data` list of the response envelope.
    pub async fn get_data(&self, path_suffix: &str) -> Result<Vec<Value>, ApiError> {
        let response = self.fire_api_call(path_suffix).await?;
        let body = response
            .text()
            .await
            .map_err(|err| ApiError::from_reqwest(&self.url_for(path_suffix), self.timeout, err))?;
        parse_data_list(path_suffix, &body)
    }

    pub async fn list_nodes(&self) -> Result<Vec<String>, ApiError> {
        let nodes = self.get_data(NODES_PATH).await?;
        let names = nodes
            .iter()
            .map(|node| {
                node.get("node")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| ApiError::Malformed {
                        path: NODES_PATH.to_string(),
                        reason: "node entry without a 'node' name".to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        info!(count = names.len(), "proxmox nodes listed");
        Ok(names)
    }

    pub async fn list_guests(&self, node: &str, kind: GuestKind) -> Result<Vec<Value>, ApiError> {
        self.get_data(&guests_path(node, kind)).await
    }
}

pub fn guests_path(node: &str, kind: GuestKind) -> String {
    format!("{NODES_PATH}/{node}/{}", kind.as_str())
}

pub fn parse_data_list(path: &str, body: &str) -> Result<Vec<Value>, ApiError> {
    if body.trim().is_empty() {
        return Err(ApiError::Empty {
            path: path.to_string(),
            reason: "body is empty".to_string(),
        });
    }

    // undecodable bodies (HTML error pages, truncated JSON) count as empty
    let value: Value = serde_json::from_str(body).map_err(|err| ApiError::Empty {
        path: path.to_string(),
        reason: format!("body is not JSON: {err}"),
    })?;

    match value {
        Value::Null => Err(ApiError::Empty {
            path: path.to_string(),
            reason: "body is null".to_string(),
        }),
        Value::Object(mut envelope) => match envelope.remove("data") {
            Some(Value::Array(items)) => Ok(items),
            Some(Value::Null) => Err(ApiError::Empty {
                path: path.to_string(),
                reason: "data is null".to_string(),
            }),
            Some(other) => Err(ApiError::Malformed {
                path: path.to_string(),
                reason: format!("data is not a list: {other}"),
            }),
            None => Err(ApiError::Malformed {
                path: path.to_string(),
                reason: "no data field".to_string(),
            }),
        },
        other => Err(ApiError::Malformed {
            path: path.to_string(),
            reason: format!("unexpected body: {other}"),
        }),
    }
}
