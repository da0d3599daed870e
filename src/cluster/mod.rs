//! Cluster access for the update engine
//!
//! This module defines the narrow `ClusterApi` trait that every updater talks to,
//! plus the error taxonomy shared by all cluster calls:
//! - `KubeClusterApi`: production implementation over kube-rs
//! - `connector`: turns caller credentials into a verified `ClusterConnection`
//! - `credentials`: managed-cluster credential exchange

pub mod connector;
pub mod credentials;
pub mod kube_api;

#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use thiserror::Error;

pub use connector::{
    normalize_address, ClientFactory, ClientTarget, ClusterConnection, ClusterCredentials,
    ClusterKind, ConnectError, Connector, KubeClientFactory, TlsPolicy, TlsTrust,
    DEFAULT_PROBE_TIMEOUT, DEFAULT_SECURE_PORT,
};
pub use credentials::{
    CredentialExchange, EksCredentialExchange, HttpCredentialExchange, ManagedClusterAccess,
    ManagedCredentials,
};
pub use kube_api::KubeClusterApi;

/// Errors returned by cluster API calls
///
/// Every `ClusterApi` implementation maps its transport errors onto this set,
/// so updaters can decide retry/compensation without knowing the client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Unreachable(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict(_))
    }

    /// The API server reports a create into a missing namespace as
    /// `namespaces "<ns>" not found`.
    pub fn is_namespace_missing(&self) -> bool {
        match self {
            ClusterError::NotFound(message) => message.contains("namespaces \""),
            _ => false,
        }
    }

    /// Classify a kube-rs error into the cluster error taxonomy
    pub fn from_kube(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(response) => {
                let message = response.message.clone();
                match response.code {
                    401 => ClusterError::Unauthorized(message),
                    403 => ClusterError::Forbidden(message),
                    404 => ClusterError::NotFound(message),
                    409 => ClusterError::Conflict(message),
                    504 => ClusterError::Timeout(message),
                    _ => ClusterError::Other(message),
                }
            }
            kube::Error::Auth(e) => ClusterError::Unauthorized(e.to_string()),
            other => classify_transport_message(error_chain(&other)),
        }
    }
}

impl From<kube::Error> for ClusterError {
    fn from(error: kube::Error) -> Self {
        ClusterError::from_kube(error)
    }
}

/// Render an error with its full `source()` chain
///
/// hyper wraps the interesting part ("Connection refused") a few levels deep.
pub(crate) fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

/// Classify a transport failure by its message
pub(crate) fn classify_transport_message(message: String) -> ClusterError {
    let lower = message.to_lowercase();
    if lower.contains("credentials") || lower.contains("unauthorized") {
        ClusterError::Unauthorized(message)
    } else if lower.contains("connection refused")
        || lower.contains("no route to host")
        || lower.contains("dns error")
        || lower.contains("failed to lookup address")
        || lower.contains("name or service not known")
    {
        ClusterError::Unreachable(message)
    } else if lower.contains("timed out") || lower.contains("deadline has elapsed") {
        ClusterError::Timeout(message)
    } else {
        ClusterError::Other(message)
    }
}

/// Namespace-scoped cluster operations consumed by the update engine
///
/// Updates are full-object replaces, so the server rejects stale
/// `resourceVersion`s with `ClusterError::Conflict`.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Lightweight liveness call ("get server version")
    async fn server_version(&self) -> Result<String, ClusterError>;

    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Deployment, ClusterError>;

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, ClusterError>;

    async fn update_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, ClusterError>;

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    /// List pods matching a formatted label selector (`app=web,tier in (a,b)`)
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, ClusterError>;

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>, ClusterError>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ClusterError>;

    async fn create_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, ClusterError>;

    async fn update_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, ClusterError>;

    async fn create_namespace(&self, name: &str) -> Result<(), ClusterError>;
}

/// Format a `LabelSelector` the way the API server's `labelSelector` query expects
///
/// `matchLabels` become `k=v`; `matchExpressions` support `In`, `NotIn`,
/// `Exists` and `DoesNotExist`. Terms are sorted for stable output.
pub fn format_label_selector(selector: &LabelSelector) -> String {
    let mut terms: Vec<String> = selector
        .match_labels
        .iter()
        .flatten()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect();

    for expr in selector.match_expressions.iter().flatten() {
        let mut values = expr.values.clone().unwrap_or_default();
        values.sort();
        let term = match expr.operator.as_str() {
            "In" => format!("{} in ({})", expr.key, values.join(",")),
            "NotIn" => format!("{} notin ({})", expr.key, values.join(",")),
            "Exists" => expr.key.clone(),
            "DoesNotExist" => format!("!{}", expr.key),
            _ => continue,
        };
        terms.push(term);
    }

    terms.sort();
    terms.join(",")
}
