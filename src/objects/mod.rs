//! Object creation
//!
//! Creates typed Kubernetes objects without ever overwriting: an existing
//! object is a conflict. A missing target namespace is created on demand.

use crate::cluster::{ClusterApi, ClusterError};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use serde::Serialize;
use std::str::FromStr;
use thiserror::Error;
use tracing::{info, warn};

/// Namespace used when an object does not name one
pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CreateError {
    #[error("{0}")]
    Invalid(String),

    #[error("{kind} has no metadata.name")]
    MissingName { kind: &'static str },

    #[error("cannot access {name} in namespace {namespace}. Namespace doesn't exist or Forbidden")]
    Unauthorized { name: String, namespace: String },

    #[error("cannot access {name} in the namespace {namespace}")]
    Forbidden { name: String, namespace: String },

    #[error("{name} already exists in namespace {namespace}")]
    AlreadyExists { name: String, namespace: String },

    #[error("error on creating object {name}: {message}")]
    Internal { name: String, message: String },
}

/// The object kinds accepted for creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Deployment,
    Service,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Deployment => "Deployment",
            ObjectKind::Service => "Service",
        }
    }
}

impl FromStr for ObjectKind {
    type Err = CreateError;

    fn from_str(kind: &str) -> Result<Self, Self::Err> {
        match kind {
            "Deployment" => Ok(ObjectKind::Deployment),
            "Service" => Ok(ObjectKind::Service),
            other => Err(CreateError::Invalid(format!(
                "unsupported kind {:?}: expected Deployment or Service",
                other
            ))),
        }
    }
}

/// A typed object; adding a kind means adding a variant
#[derive(Debug, Clone, PartialEq)]
pub enum KubeObject {
    Deployment(Deployment),
    Service(Service),
}

impl KubeObject {
    /// Decode one JSON object of the given kind
    pub fn from_json(kind: ObjectKind, value: serde_json::Value) -> Result<Self, CreateError> {
        let decoded = match kind {
            ObjectKind::Deployment => serde_json::from_value(value).map(KubeObject::Deployment),
            ObjectKind::Service => serde_json::from_value(value).map(KubeObject::Service),
        };
        decoded.map_err(|e| CreateError::Invalid(format!("invalid {}: {}", kind.as_str(), e)))
    }

    /// Decode a JSON body holding one object or an array of them
    pub fn decode_body(kind: ObjectKind, body: serde_json::Value) -> Result<Vec<Self>, CreateError> {
        match body {
            serde_json::Value::Array(items) => {
                if items.is_empty() {
                    return Err(CreateError::Invalid(format!("no {} provided", kind.as_str())));
                }
                items
                    .into_iter()
                    .map(|item| Self::from_json(kind, item))
                    .collect()
            }
            single => Ok(vec![Self::from_json(kind, single)?]),
        }
    }

    /// Decode one manifest, dispatching on its own `kind` field
    pub fn from_manifest(value: serde_json::Value) -> Result<Self, CreateError> {
        let kind = value
            .get("kind")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| CreateError::Invalid("object has no kind".to_string()))?
            .parse::<ObjectKind>()?;
        Self::from_json(kind, value)
    }

    /// Decode a mixed upload: one manifest or an array of any supported kinds
    pub fn decode_manifests(body: serde_json::Value) -> Result<Vec<Self>, CreateError> {
        match body {
            serde_json::Value::Array(items) => {
                if items.is_empty() {
                    return Err(CreateError::Invalid("no object provided".to_string()));
                }
                items.into_iter().map(Self::from_manifest).collect()
            }
            single => Ok(vec![Self::from_manifest(single)?]),
        }
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            KubeObject::Deployment(_) => ObjectKind::Deployment,
            KubeObject::Service(_) => ObjectKind::Service,
        }
    }

    pub fn name(&self) -> Option<&str> {
        let name = match self {
            KubeObject::Deployment(d) => d.metadata.name.as_deref(),
            KubeObject::Service(s) => s.metadata.name.as_deref(),
        };
        name.filter(|n| !n.is_empty())
    }

    pub fn namespace(&self) -> Option<&str> {
        let namespace = match self {
            KubeObject::Deployment(d) => d.metadata.namespace.as_deref(),
            KubeObject::Service(s) => s.metadata.namespace.as_deref(),
        };
        namespace.filter(|n| !n.is_empty())
    }

    pub fn set_namespace(&mut self, namespace: &str) {
        let slot = match self {
            KubeObject::Deployment(d) => &mut d.metadata.namespace,
            KubeObject::Service(s) => &mut s.metadata.namespace,
        };
        *slot = Some(namespace.to_string());
    }

    /// GET the object from the cluster; only the outcome matters
    pub async fn fetch(&self, api: &dyn ClusterApi) -> Result<(), ClusterError> {
        let namespace = self.namespace().unwrap_or(DEFAULT_NAMESPACE);
        let name = self.name().unwrap_or_default();
        match self {
            KubeObject::Deployment(_) => api.get_deployment(namespace, name).await.map(|_| ()),
            KubeObject::Service(_) => api.get_service(namespace, name).await.map(|_| ()),
        }
    }

    pub async fn create(&self, api: &dyn ClusterApi) -> Result<KubeObject, ClusterError> {
        let namespace = self.namespace().unwrap_or(DEFAULT_NAMESPACE);
        match self {
            KubeObject::Deployment(d) => api
                .create_deployment(namespace, d)
                .await
                .map(KubeObject::Deployment),
            KubeObject::Service(s) => api
                .create_service(namespace, s)
                .await
                .map(KubeObject::Service),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedObject {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub namespace_created: bool,
    pub message: String,
}

/// Create `object` unless it already exists
///
/// # Returns
/// * `Ok(CreatedObject)` - created, possibly after creating its namespace
/// * `Err(CreateError::AlreadyExists)` - never overwritten
/// * `Err(_)` - permission problem or unexpected failure
pub async fn create_object(
    api: &dyn ClusterApi,
    mut object: KubeObject,
) -> Result<CreatedObject, CreateError> {
    let kind = object.kind().as_str();
    let name = object
        .name()
        .ok_or(CreateError::MissingName { kind })?
        .to_string();
    if object.namespace().is_none() {
        object.set_namespace(DEFAULT_NAMESPACE);
    }
    let namespace = object.namespace().unwrap_or(DEFAULT_NAMESPACE).to_string();

    info!(kind = kind, name = %name, namespace = %namespace, "Creating object");

    match object.fetch(api).await {
        Ok(()) => {
            info!(kind = kind, name = %name, "Object already exists");
            return Err(CreateError::AlreadyExists { name, namespace });
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(classify(e, &name, &namespace)),
    }

    let mut namespace_created = false;
    let created = loop {
        match object.create(api).await {
            Ok(created) => break created,
            Err(e) if e.is_namespace_missing() && !namespace_created => {
                info!(namespace = %namespace, "Namespace not found, creating it");
                match api.create_namespace(&namespace).await {
                    Ok(()) => {}
                    // Someone else created it in the meantime
                    Err(ns_err) if ns_err.is_conflict() => {}
                    Err(ns_err) => return Err(classify(ns_err, &name, &namespace)),
                }
                namespace_created = true;
            }
            Err(e) => {
                warn!(kind = kind, name = %name, namespace = %namespace, error = %e, "Error on creating object");
                return Err(classify(e, &name, &namespace));
            }
        }
    };

    let created_name = created.name().unwrap_or(&name).to_string();
    info!(kind = kind, name = %created_name, namespace = %namespace, "Object created");
    Ok(CreatedObject {
        kind: kind.to_string(),
        message: format!("{} created successfully.", created_name),
        name: created_name,
        namespace,
        namespace_created,
    })
}

fn classify(error: ClusterError, name: &str, namespace: &str) -> CreateError {
    let name = name.to_string();
    let namespace = namespace.to_string();
    match error {
        ClusterError::Unauthorized(_) => CreateError::Unauthorized { name, namespace },
        ClusterError::Forbidden(_) => CreateError::Forbidden { name, namespace },
        ClusterError::Conflict(_) => CreateError::AlreadyExists { name, namespace },
        other => CreateError::Internal {
            name,
            message: other.to_string(),
        },
    }
}
