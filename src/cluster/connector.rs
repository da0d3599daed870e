//! Cluster Connector
//!
//! Turns caller-supplied credentials into a verified `ClusterConnection`.
//! Two credential kinds are supported:
//! - Generic: address (+ optional port) and a bearer token
//! - Managed: cloud access/secret key pair exchanged for an endpoint, CA and token
//!
//! A handle is only returned after `server_version` answered within the probe
//! timeout. The probe races timeout and caller cancellation; cancellation is
//! a benign abort (`Ok(None)`), not an error.

use super::credentials::{decode_certificate_authority, CredentialExchange, ManagedCredentials};
use super::{ClusterApi, ClusterError, KubeClusterApi};
use crate::cancel::CancelSignal;
use async_trait::async_trait;
use kube::config::{KubeConfigOptions, Kubeconfig};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Liveness probe bound
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Well-known secure API server port tried when none was given
pub const DEFAULT_SECURE_PORT: &str = "6443";

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("missing cluster credentials: {0}")]
    MissingCredentials(String),

    #[error("invalid cluster credentials: {0}")]
    InvalidCredentials(String),

    #[error("please provide valid credentials: {0}")]
    Unauthorized(String),

    #[error("cannot reach the kubernetes cluster at {endpoint} - please check the address and the port provided or the status of the server")]
    Unreachable { endpoint: String },

    #[error("timed out after {timeout:?} waiting for the kubernetes cluster at {endpoint}")]
    Timeout { endpoint: String, timeout: Duration },

    #[error("credential exchange failed: {0}")]
    CredentialExchange(String),

    #[error("error while connecting to the cluster: {0}")]
    Internal(String),
}

impl ConnectError {
    fn from_probe(error: ClusterError, endpoint: &str, timeout: Duration) -> Self {
        match error {
            ClusterError::Unauthorized(m) | ClusterError::Forbidden(m) => {
                ConnectError::Unauthorized(m)
            }
            ClusterError::Unreachable(_) => ConnectError::Unreachable {
                endpoint: endpoint.to_string(),
            },
            ClusterError::Timeout(_) => ConnectError::Timeout {
                endpoint: endpoint.to_string(),
                timeout,
            },
            other => ConnectError::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterKind {
    Generic,
    Managed,
}

impl ClusterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterKind::Generic => "generic",
            ClusterKind::Managed => "managed",
        }
    }
}

/// TLS trust policy for generic clusters
///
/// `InsecureSkipVerify` must be opted into through configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsPolicy {
    #[default]
    Verify,
    InsecureSkipVerify,
}

/// How the built client trusts the API server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsTrust {
    /// Platform roots
    Platform,
    /// Skip verification
    Insecure,
    /// Base64 PEM bundle resolved for a managed cluster
    CertificateAuthority(String),
}

/// Caller-supplied credentials
#[derive(Clone, PartialEq, Eq)]
pub enum ClusterCredentials {
    Generic {
        address: String,
        port: Option<String>,
        token: String,
    },
    Managed(ManagedCredentials),
}

impl ClusterCredentials {
    pub fn kind(&self) -> ClusterKind {
        match self {
            ClusterCredentials::Generic { .. } => ClusterKind::Generic,
            ClusterCredentials::Managed(_) => ClusterKind::Managed,
        }
    }
}

impl fmt::Debug for ClusterCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterCredentials::Generic { address, port, .. } => f
                .debug_struct("Generic")
                .field("address", address)
                .field("port", port)
                .field("token", &"<redacted>")
                .finish(),
            ClusterCredentials::Managed(managed) => fmt::Debug::fmt(managed, f),
        }
    }
}

/// Everything needed to build a client for one endpoint
#[derive(Clone, PartialEq, Eq)]
pub struct ClientTarget {
    pub server: String,
    pub token: String,
    pub trust: TlsTrust,
}

/// Builds a `ClusterApi` for a target; swapped out in tests
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn build(
        &self,
        target: &ClientTarget,
        connect_timeout: Duration,
    ) -> Result<Arc<dyn ClusterApi>, ConnectError>;
}

/// Production factory: in-memory kubeconfig -> `kube::Client`
pub struct KubeClientFactory;

impl KubeClientFactory {
    fn kubeconfig(target: &ClientTarget) -> Result<Kubeconfig, ConnectError> {
        let mut cluster = serde_json::json!({ "server": target.server });
        match &target.trust {
            TlsTrust::Platform => {}
            TlsTrust::Insecure => {
                cluster["insecure-skip-tls-verify"] = serde_json::Value::Bool(true);
            }
            TlsTrust::CertificateAuthority(data) => {
                cluster["certificate-authority-data"] = serde_json::Value::String(data.clone());
            }
        }

        let document = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Config",
            "clusters": [{ "name": "target", "cluster": cluster }],
            "users": [{ "name": "target", "user": { "token": target.token } }],
            "contexts": [{ "name": "target", "context": { "cluster": "target", "user": "target" } }],
            "current-context": "target",
        });

        serde_json::from_value(document)
            .map_err(|e| ConnectError::Internal(format!("failed to build kubeconfig: {}", e)))
    }
}

#[async_trait]
impl ClientFactory for KubeClientFactory {
    async fn build(
        &self,
        target: &ClientTarget,
        connect_timeout: Duration,
    ) -> Result<Arc<dyn ClusterApi>, ConnectError> {
        let kubeconfig = Self::kubeconfig(target)?;
        let mut config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| ConnectError::InvalidCredentials(e.to_string()))?;
        config.connect_timeout = Some(connect_timeout);

        let client = kube::Client::try_from(config)
            .map_err(|e| ConnectError::Internal(format!("failed to create kubernetes client: {}", e)))?;
        Ok(Arc::new(KubeClusterApi::new(client)))
    }
}

/// A verified, request-scoped cluster handle
#[derive(Clone)]
pub struct ClusterConnection {
    /// Final API endpoint, including a fallback port if one was used
    pub endpoint: String,
    pub kind: ClusterKind,
    pub server_version: String,
    pub api: Arc<dyn ClusterApi>,
}

impl fmt::Debug for ClusterConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConnection")
            .field("endpoint", &self.endpoint)
            .field("kind", &self.kind)
            .field("server_version", &self.server_version)
            .finish()
    }
}

enum Probe {
    Alive(String),
    Aborted,
}

/// Normalise an address to the secure scheme
///
/// `10.0.0.1` and `http://10.0.0.1` both become `https://10.0.0.1`.
pub fn normalize_address(address: &str) -> String {
    let trimmed = address.trim().trim_end_matches('/');
    if trimmed.starts_with("https://") {
        trimmed.to_string()
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("https://{}", rest)
    } else {
        format!("https://{}", trimmed)
    }
}

pub struct Connector {
    factory: Arc<dyn ClientFactory>,
    exchange: Option<Arc<dyn CredentialExchange>>,
    tls_policy: TlsPolicy,
    probe_timeout: Duration,
}

impl Connector {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            factory,
            exchange: None,
            tls_policy: TlsPolicy::default(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_credential_exchange(mut self, exchange: Arc<dyn CredentialExchange>) -> Self {
        self.exchange = Some(exchange);
        self
    }

    pub fn with_tls_policy(mut self, tls_policy: TlsPolicy) -> Self {
        self.tls_policy = tls_policy;
        self
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    /// Connect and verify liveness
    ///
    /// # Returns
    /// * `Ok(Some(connection))` - probe succeeded
    /// * `Ok(None)` - the caller cancelled during the probe
    /// * `Err(ConnectError)` - credentials rejected, unreachable, or timed out
    pub async fn connect(
        &self,
        credentials: &ClusterCredentials,
        cancel: &CancelSignal,
    ) -> Result<Option<ClusterConnection>, ConnectError> {
        match credentials {
            ClusterCredentials::Generic {
                address,
                port,
                token,
            } => self.connect_generic(address, port.as_deref(), token, cancel).await,
            ClusterCredentials::Managed(managed) => self.connect_managed(managed, cancel).await,
        }
    }

    async fn connect_generic(
        &self,
        address: &str,
        port: Option<&str>,
        token: &str,
        cancel: &CancelSignal,
    ) -> Result<Option<ClusterConnection>, ConnectError> {
        if address.trim().is_empty() {
            return Err(ConnectError::MissingCredentials(
                "please provide the cluster address".to_string(),
            ));
        }
        if token.is_empty() {
            return Err(ConnectError::MissingCredentials(
                "please provide a bearer token".to_string(),
            ));
        }

        let address = normalize_address(address);
        let trust = match self.tls_policy {
            TlsPolicy::Verify => TlsTrust::Platform,
            TlsPolicy::InsecureSkipVerify => TlsTrust::Insecure,
        };
        let mut port = port.filter(|p| !p.is_empty()).map(str::to_string);

        loop {
            let endpoint = match &port {
                Some(p) => format!("{}:{}", address, p),
                None => address.clone(),
            };
            info!(endpoint = %endpoint, "Authenticating to cluster");

            let target = ClientTarget {
                server: endpoint.clone(),
                token: token.to_string(),
                trust: trust.clone(),
            };
            let api = self.factory.build(&target, self.probe_timeout).await?;

            match self.probe(api.as_ref(), &endpoint, cancel).await {
                Ok(Probe::Alive(server_version)) => {
                    info!(endpoint = %endpoint, version = %server_version, "Connected to the cluster");
                    return Ok(Some(ClusterConnection {
                        endpoint,
                        kind: ClusterKind::Generic,
                        server_version,
                        api,
                    }));
                }
                Ok(Probe::Aborted) => {
                    info!(endpoint = %endpoint, "Request cancelled while getting server version");
                    return Ok(None);
                }
                Err(e) if port.is_none() => {
                    warn!(
                        endpoint = %endpoint,
                        error = %e,
                        "Cluster probe failed, trying again with port {}",
                        DEFAULT_SECURE_PORT
                    );
                    port = Some(DEFAULT_SECURE_PORT.to_string());
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "Error while connecting to the cluster");
                    return Err(e);
                }
            }
        }
    }

    async fn connect_managed(
        &self,
        credentials: &ManagedCredentials,
        cancel: &CancelSignal,
    ) -> Result<Option<ClusterConnection>, ConnectError> {
        if credentials.region.is_empty()
            || credentials.cluster_name.is_empty()
            || credentials.access_key_id.is_empty()
            || credentials.secret_access_key.is_empty()
        {
            return Err(ConnectError::MissingCredentials(
                "please provide cluster-name, access-key-id, secret-access-key and region"
                    .to_string(),
            ));
        }

        let exchange = self.exchange.as_ref().ok_or_else(|| {
            ConnectError::InvalidCredentials(
                "managed clusters are not enabled on this server".to_string(),
            )
        })?;

        info!(
            cluster = %credentials.cluster_name,
            region = %credentials.region,
            "Checking connection to the managed cluster"
        );
        let access = exchange.exchange(credentials).await?;

        // Reject a malformed CA before handing it to the TLS stack
        decode_certificate_authority(&access.certificate_authority_data)?;

        let endpoint = normalize_address(&access.endpoint);
        let target = ClientTarget {
            server: endpoint.clone(),
            token: access.token.clone(),
            trust: TlsTrust::CertificateAuthority(access.certificate_authority_data.clone()),
        };
        let api = self.factory.build(&target, self.probe_timeout).await?;

        match self.probe(api.as_ref(), &endpoint, cancel).await? {
            Probe::Alive(server_version) => {
                info!(endpoint = %endpoint, version = %server_version, "Connected to the cluster");
                Ok(Some(ClusterConnection {
                    endpoint,
                    kind: ClusterKind::Managed,
                    server_version,
                    api,
                }))
            }
            Probe::Aborted => {
                info!(endpoint = %endpoint, "Request cancelled while getting server version");
                Ok(None)
            }
        }
    }

    /// Race the version call against the timeout and caller cancellation
    async fn probe(
        &self,
        api: &dyn ClusterApi,
        endpoint: &str,
        cancel: &CancelSignal,
    ) -> Result<Probe, ConnectError> {
        let mut cancel = cancel.clone();
        tokio::select! {
            result = api.server_version() => match result {
                Ok(version) => Ok(Probe::Alive(version)),
                Err(e) => Err(ConnectError::from_probe(e, endpoint, self.probe_timeout)),
            },
            _ = tokio::time::sleep(self.probe_timeout) => Err(ConnectError::Timeout {
                endpoint: endpoint.to_string(),
                timeout: self.probe_timeout,
            }),
            _ = cancel.cancelled() => Ok(Probe::Aborted),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "connector_test.rs"]
mod tests;
