//! Blue-Green update strategy
//!
//! Runs two full deployments side by side and flips the Service between them:
//! 1. read the current ("blue") deployment
//! 2. find the one Service whose selector matches its pod template
//! 3. create `<name>-green` with the new image and replica count
//! 4. optionally wait for green to become available
//! 5. point the Service at `version=green`
//! 6. label the old pod template `version=blue`
//!
//! Every step after 3 that fails before the Service switch deletes green
//! again. Conflicts are not retried here: retrying a half-applied sequence
//! risks doing a step twice.

use super::saga::{Compensation, Saga};
use super::{
    set_container_image, DeploymentRef, ReadinessPoller, Strategy, UpdateError, UpdateOutcome,
    UpdatePlan, Updater,
};
use crate::cluster::ClusterApi;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Pod-template / selector label that tells the two colours apart
pub const VERSION_LABEL: &str = "version";
pub const BLUE: &str = "blue";
pub const GREEN: &str = "green";

/// Written by the deployment controller; must not be copied onto a new object
const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

pub struct BlueGreenUpdater {
    verify_green: bool,
    readiness: ReadinessPoller,
}

impl BlueGreenUpdater {
    pub fn new(verify_green: bool, readiness: ReadinessPoller) -> Self {
        Self {
            verify_green,
            readiness,
        }
    }
}

#[async_trait]
impl Updater for BlueGreenUpdater {
    fn name(&self) -> &'static str {
        Strategy::BlueGreen.as_str()
    }

    async fn update(
        &self,
        api: &dyn ClusterApi,
        plan: &UpdatePlan,
    ) -> Result<UpdateOutcome, UpdateError> {
        let target = &plan.target;
        let namespace = target.namespace.as_str();
        info!(
            deployment = %target,
            image = %plan.image,
            replicas = plan.replicas,
            verify = self.verify_green,
            "Updating deployment using blue/green strategy"
        );

        let (blue, services) = read_deployment_and_services(api, target).await?;
        let service = find_associated_service(&services, &target.name, &template_labels(&blue), None)?
            .clone();
        info!(
            deployment = %target,
            service = %object_name(&service.metadata.name),
            "Found associated service"
        );

        let green = build_green_deployment(&blue, plan)?;
        let green_name = object_name(&green.metadata.name);
        api.create_deployment(namespace, &green)
            .await
            .map_err(|e| {
                UpdateError::cluster(format!("failed to create new deployment {}", green_name), e)
            })?;
        info!(deployment = %green_name, namespace = %namespace, "Created green deployment");

        let mut saga = Saga::new();
        saga.record(Compensation::DeleteDeployment {
            namespace: namespace.to_string(),
            name: green_name.clone(),
        });

        if self.verify_green {
            if let Err(e) = self
                .readiness
                .wait_until_available(api, namespace, &green_name)
                .await
            {
                return Err(saga.abort(api, e).await);
            }
        }

        if let Err(e) = retarget_service(api, namespace, service, GREEN).await {
            return Err(saga.abort(api, e).await);
        }
        saga.commit();

        // Traffic is on green from here; a relabel failure leaves green in place
        relabel_version(api, target, BLUE).await?;

        info!(
            deployment = %target,
            green = %green_name,
            "Blue/green update completed"
        );
        Ok(UpdateOutcome {
            strategy: Strategy::BlueGreen.to_string(),
            deployment: target.name.clone(),
            message: format!(
                "Deployment {} updated using blue/green strategy, traffic now served by {}",
                target.name, green_name
            ),
            green_deployment: Some(green_name),
        })
    }
}

/// Name of the green deployment cloned from `name`
pub fn green_name(name: &str) -> String {
    format!("{}-{}", name, GREEN)
}

/// Clone `blue` into a new, unsaved deployment carrying the plan's image and replicas
///
/// Server-assigned identity (uid, resourceVersion, timestamps, status) is
/// stripped so the API server treats it as a new object. Owner references
/// and finalizers stay with blue.
pub fn build_green_deployment(blue: &Deployment, plan: &UpdatePlan) -> Result<Deployment, UpdateError> {
    let mut green = blue.clone();

    let meta = &mut green.metadata;
    meta.name = Some(green_name(&plan.target.name));
    meta.namespace = Some(plan.target.namespace.clone());
    meta.resource_version = None;
    meta.uid = None;
    meta.creation_timestamp = None;
    meta.deletion_timestamp = None;
    meta.generation = None;
    meta.managed_fields = None;
    meta.self_link = None;
    meta.owner_references = None;
    meta.finalizers = None;
    if let Some(annotations) = meta.annotations.as_mut() {
        annotations.remove(REVISION_ANNOTATION);
    }
    green.status = None;

    set_container_image(&mut green, plan.container.as_deref(), &plan.image)?;

    let spec = green.spec.get_or_insert_with(Default::default);
    spec.replicas = Some(plan.replicas);
    spec.template
        .metadata
        .get_or_insert_with(Default::default)
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(VERSION_LABEL.to_string(), GREEN.to_string());
    // Keep the green ReplicaSet from adopting blue pods
    if let Some(match_labels) = spec.selector.match_labels.as_mut() {
        match_labels.insert(VERSION_LABEL.to_string(), GREEN.to_string());
    }

    Ok(green)
}

/// Does a Service selector pick the given pod labels?
///
/// The selector must be non-empty after dropping `ignore_key`; services
/// without a selector are never treated as associated.
pub fn selector_matches(
    selector: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
    ignore_key: Option<&str>,
) -> bool {
    let mut relevant = selector
        .iter()
        .filter(|(key, _)| Some(key.as_str()) != ignore_key)
        .peekable();
    if relevant.peek().is_none() {
        return false;
    }
    relevant.all(|(key, value)| labels.get(key) == Some(value))
}

/// The single Service whose selector matches `labels`
///
/// No match is `ServiceNotFound`, more than one is `AmbiguousService`.
pub fn find_associated_service<'a>(
    services: &'a [Service],
    deployment: &str,
    labels: &BTreeMap<String, String>,
    ignore_key: Option<&str>,
) -> Result<&'a Service, UpdateError> {
    let matches: Vec<&Service> = services
        .iter()
        .filter(|service| {
            service
                .spec
                .as_ref()
                .and_then(|spec| spec.selector.as_ref())
                .is_some_and(|selector| selector_matches(selector, labels, ignore_key))
        })
        .collect();

    match matches.as_slice() {
        [] => Err(UpdateError::ServiceNotFound(deployment.to_string())),
        [service] => Ok(*service),
        many => {
            let mut candidates: Vec<String> = many
                .iter()
                .map(|s| object_name(&s.metadata.name))
                .collect();
            candidates.sort();
            warn!(deployment = %deployment, candidates = ?candidates, "Ambiguous service match");
            Err(UpdateError::AmbiguousService {
                deployment: deployment.to_string(),
                candidates,
            })
        }
    }
}

/// Fetch the deployment and the namespace's services concurrently
async fn read_deployment_and_services(
    api: &dyn ClusterApi,
    target: &DeploymentRef,
) -> Result<(Deployment, Vec<Service>), UpdateError> {
    let deployment = async {
        api.get_deployment(&target.namespace, &target.name)
            .await
            .map_err(|e| UpdateError::from_get(target, e))
    };
    let services = async {
        api.list_services(&target.namespace)
            .await
            .map_err(|e| UpdateError::cluster("failed to list services", e))
    };
    futures::try_join!(deployment, services)
}

fn template_labels(deployment: &Deployment) -> BTreeMap<String, String> {
    deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.metadata.as_ref())
        .and_then(|meta| meta.labels.clone())
        .unwrap_or_default()
}

fn object_name(name: &Option<String>) -> String {
    name.clone().unwrap_or_default()
}

/// Set `version=<version>` on the Service selector and replace it
async fn retarget_service(
    api: &dyn ClusterApi,
    namespace: &str,
    mut service: Service,
    version: &str,
) -> Result<Service, UpdateError> {
    let name = object_name(&service.metadata.name);
    service
        .spec
        .get_or_insert_with(Default::default)
        .selector
        .get_or_insert_with(BTreeMap::new)
        .insert(VERSION_LABEL.to_string(), version.to_string());

    let updated = api
        .update_service(namespace, &service)
        .await
        .map_err(|e| UpdateError::cluster(format!("failed to update service {}", name), e))?;
    info!(service = %name, version = %version, "Service retargeted");
    Ok(updated)
}

/// Label the deployment's pod template with `version=<version>`
async fn relabel_version(
    api: &dyn ClusterApi,
    target: &DeploymentRef,
    version: &str,
) -> Result<(), UpdateError> {
    let mut deployment = api
        .get_deployment(&target.namespace, &target.name)
        .await
        .map_err(|e| UpdateError::cluster("failed to redefine the old deployment", e))?;

    let labels = deployment
        .spec
        .get_or_insert_with(Default::default)
        .template
        .metadata
        .get_or_insert_with(Default::default)
        .labels
        .get_or_insert_with(BTreeMap::new);
    if labels.get(VERSION_LABEL).map(String::as_str) == Some(version) {
        debug!(deployment = %target, version = %version, "Deployment already labelled");
        return Ok(());
    }
    labels.insert(VERSION_LABEL.to_string(), version.to_string());

    api.update_deployment(&target.namespace, &deployment)
        .await
        .map_err(|e| UpdateError::cluster("failed to redefine the old deployment", e))?;
    info!(deployment = %target, version = %version, "Old deployment relabelled");
    Ok(())
}

/// Result of flipping a Service back to the other colour
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackOutcome {
    pub service: String,
    pub active_version: String,
    pub message: String,
}

/// Point the deployment's Service at whichever colour is not active
///
/// The Service is found by matching its selector against the pod template
/// with the `version` key ignored, so either colour's deployment works.
pub async fn rollback(
    api: &dyn ClusterApi,
    target: &DeploymentRef,
) -> Result<RollbackOutcome, UpdateError> {
    info!(deployment = %target, "Rolling back blue/green deployment");

    let (deployment, services) = read_deployment_and_services(api, target).await?;
    let service = find_associated_service(
        &services,
        &target.name,
        &template_labels(&deployment),
        Some(VERSION_LABEL),
    )?
    .clone();
    let service_name = object_name(&service.metadata.name);

    let current = service
        .spec
        .as_ref()
        .and_then(|spec| spec.selector.as_ref())
        .and_then(|selector| selector.get(VERSION_LABEL))
        .cloned()
        .unwrap_or_default();
    let previous = match current.as_str() {
        GREEN => BLUE,
        BLUE => GREEN,
        _ => {
            return Err(UpdateError::UnknownVersion {
                service: service_name,
                version: current,
            })
        }
    };

    retarget_service(api, &target.namespace, service, previous).await?;

    Ok(RollbackOutcome {
        message: format!("Service {} now routes to the {} version", service_name, previous),
        service: service_name,
        active_version: previous.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "blue_green_test.rs"]
mod tests;
