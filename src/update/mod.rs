//! Deployment update engine
//!
//! This module defines the `Updater` trait and an implementation per update strategy:
//! - RollingUpdater: in-place rolling update under conflict retry
//! - RecreateUpdater: in-place update that replaces all pods at once
//! - BlueGreenUpdater: clone, retarget the Service, relabel the old version
//!
//! `ab-testing` and `canary` are recognised identifiers but have no updater yet.

pub mod blue_green;
pub mod readiness;
pub mod retry;
pub mod rolling;
pub mod saga;
pub mod status;
pub mod surge;

use crate::cluster::{ClusterApi, ClusterError};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::info;

pub use blue_green::{rollback, BlueGreenUpdater, RollbackOutcome};
pub use readiness::ReadinessPoller;
pub use retry::{retry_on_conflict, RetryPolicy};
pub use rolling::{RecreateUpdater, RollingUpdater};
pub use status::{read_deployment_status, DeploymentStatusReport};
pub use surge::{RollingParameters, SurgeValue};

/// Errors surfaced by the update engine
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("{0}")]
    Validation(String),

    #[error("strategy {0} is not supported yet")]
    UnsupportedStrategy(Strategy),

    #[error("deployment {name} not found in namespace {namespace}")]
    DeploymentNotFound { namespace: String, name: String },

    #[error("associated service not found for deployment {0}")]
    ServiceNotFound(String),

    #[error("multiple services match deployment {deployment}: {}", .candidates.join(", "))]
    AmbiguousService {
        deployment: String,
        candidates: Vec<String>,
    },

    #[error("service {service} selects unknown version {version:?}, expected blue or green")]
    UnknownVersion { service: String, version: String },

    #[error("{context}: {source}")]
    Cluster {
        context: String,
        source: ClusterError,
    },

    #[error("{operation} still conflicting after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: String,
    },

    #[error("new deployment {name} not ready in time after {attempts} checks")]
    NotReady { name: String, attempts: u32 },

    #[error("{failure} (rolled back: {})", .undone.join(", "))]
    RolledBack {
        failure: Box<UpdateError>,
        undone: Vec<String>,
    },

    #[error("{failure}; rollback also failed: {}", .failures.join("; "))]
    CompensationFailed {
        failure: Box<UpdateError>,
        failures: Vec<String>,
    },
}

impl UpdateError {
    pub(crate) fn cluster(context: impl Into<String>, source: ClusterError) -> Self {
        UpdateError::Cluster {
            context: context.into(),
            source,
        }
    }

    /// Map a GET failure, turning not-found into `DeploymentNotFound`
    pub(crate) fn from_get(target: &DeploymentRef, source: ClusterError) -> Self {
        if source.is_not_found() {
            UpdateError::DeploymentNotFound {
                namespace: target.namespace.clone(),
                name: target.name.clone(),
            }
        } else {
            UpdateError::cluster(format!("failed to get deployment {}", target.name), source)
        }
    }

    /// Optimistic-concurrency rejection from the API server
    pub fn is_conflict(&self) -> bool {
        matches!(self, UpdateError::Cluster { source, .. } if source.is_conflict())
    }
}

/// Update strategy identifiers accepted on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    RollingUpdate,
    Recreate,
    BlueGreen,
    AbTesting,
    Canary,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RollingUpdate => "rolling-update",
            Strategy::Recreate => "recreate",
            Strategy::BlueGreen => "blue-green",
            Strategy::AbTesting => "ab-testing",
            Strategy::Canary => "canary",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rolling-update" => Ok(Strategy::RollingUpdate),
            "recreate" => Ok(Strategy::Recreate),
            "blue-green" => Ok(Strategy::BlueGreen),
            "ab-testing" => Ok(Strategy::AbTesting),
            "canary" => Ok(Strategy::Canary),
            other => Err(UpdateError::Validation(format!("Invalid strategy {:?}", other))),
        }
    }
}

/// Namespace + name of the deployment being updated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentRef {
    pub namespace: String,
    pub name: String,
}

impl DeploymentRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for DeploymentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Reported for a body that is missing required fields or does not parse
pub const INVALID_FORM: &str =
    "Invalid form - Please provide at least deployment's image, replicas and strategy used";

/// Update request body
///
/// Missing required fields deserialize to empty values so `into_plan` can
/// report them together.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateRequest {
    #[serde(default)]
    pub strategy: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub max_unavailable: Option<String>,
    #[serde(default)]
    pub max_surge: Option<String>,
}

/// A validated update, ready to hand to an `Updater`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePlan {
    pub target: DeploymentRef,
    pub strategy: Strategy,
    pub image: String,
    pub replicas: i32,
    pub container: Option<String>,
    /// Resolved only for `rolling-update`
    pub rolling: Option<RollingParameters>,
}

impl UpdateRequest {
    /// Validate the request without touching the cluster
    pub fn into_plan(self, target: DeploymentRef) -> Result<UpdatePlan, UpdateError> {
        if self.strategy.trim().is_empty() || self.image.trim().is_empty() || self.replicas <= 0 {
            return Err(UpdateError::Validation(INVALID_FORM.to_string()));
        }
        let strategy: Strategy = self.strategy.trim().parse()?;

        let rolling = match strategy {
            Strategy::RollingUpdate => Some(RollingParameters::resolve(
                self.max_unavailable.as_deref(),
                self.max_surge.as_deref(),
            )?),
            _ => None,
        };

        Ok(UpdatePlan {
            target,
            strategy,
            image: self.image.trim().to_string(),
            replicas: self.replicas,
            container: self.container.filter(|c| !c.trim().is_empty()),
            rolling,
        })
    }
}

/// Result of a successful update
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOutcome {
    pub strategy: String,
    pub deployment: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub green_deployment: Option<String>,
}

/// Per-strategy update behaviour
#[async_trait]
pub trait Updater: Send + Sync {
    /// Strategy name for logging and metrics
    fn name(&self) -> &'static str;

    /// Apply the plan against the cluster
    async fn update(
        &self,
        api: &dyn ClusterApi,
        plan: &UpdatePlan,
    ) -> Result<UpdateOutcome, UpdateError>;
}

/// Knobs shared by the updaters, filled from server configuration
#[derive(Debug, Clone, Default)]
pub struct UpdaterOptions {
    pub retry: RetryPolicy,
    pub verify_green: bool,
    pub readiness: ReadinessPoller,
}

/// Select the updater for a strategy
///
/// Reserved strategies are rejected as unsupported.
pub fn select_updater(
    strategy: Strategy,
    options: &UpdaterOptions,
) -> Result<Box<dyn Updater>, UpdateError> {
    let updater: Box<dyn Updater> = match strategy {
        Strategy::RollingUpdate => Box::new(RollingUpdater::new(options.retry.clone())),
        Strategy::Recreate => Box::new(RecreateUpdater::new(options.retry.clone())),
        Strategy::BlueGreen => Box::new(BlueGreenUpdater::new(
            options.verify_green,
            options.readiness.clone(),
        )),
        Strategy::AbTesting | Strategy::Canary => {
            return Err(UpdateError::UnsupportedStrategy(strategy))
        }
    };
    info!(strategy = updater.name(), "Selected updater");
    Ok(updater)
}

/// Point a container of the pod template at a new image
///
/// With no container name the first container is used.
pub(crate) fn set_container_image(
    deployment: &mut Deployment,
    container: Option<&str>,
    image: &str,
) -> Result<(), UpdateError> {
    let name = deployment.metadata.name.clone().unwrap_or_default();
    let containers = deployment
        .spec
        .as_mut()
        .and_then(|spec| spec.template.spec.as_mut())
        .map(|pod| &mut pod.containers)
        .filter(|containers| !containers.is_empty())
        .ok_or_else(|| {
            UpdateError::Validation(format!("deployment {} has no containers", name))
        })?;

    let target = match container {
        Some(wanted) => containers
            .iter_mut()
            .find(|c| c.name == wanted)
            .ok_or_else(|| {
                UpdateError::Validation(format!(
                    "container {} not found in deployment {}",
                    wanted, name
                ))
            })?,
        None => &mut containers[0],
    };
    target.image = Some(image.to_string());
    Ok(())
}
