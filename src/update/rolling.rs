//! In-place update strategies
//!
//! Rolling update and recreate both mutate the existing Deployment: set the
//! replica count, the strategy block and the container image, then replace the
//! object. The read-modify-write cycle runs under `retry_on_conflict` because
//! the control plane keeps writing to the same object.

use super::{
    retry_on_conflict, set_container_image, RetryPolicy, RollingParameters, Strategy,
    UpdateError, UpdateOutcome, UpdatePlan, Updater,
};
use crate::cluster::ClusterApi;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStrategy, RollingUpdateDeployment};
use tracing::info;

const ROLLING_UPDATE_TYPE: &str = "RollingUpdate";
const RECREATE_TYPE: &str = "Recreate";

/// Rolling update handler
///
/// Pods are replaced gradually within the maxUnavailable/maxSurge budget.
pub struct RollingUpdater {
    retry: RetryPolicy,
}

impl RollingUpdater {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }
}

#[async_trait]
impl Updater for RollingUpdater {
    fn name(&self) -> &'static str {
        Strategy::RollingUpdate.as_str()
    }

    async fn update(
        &self,
        api: &dyn ClusterApi,
        plan: &UpdatePlan,
    ) -> Result<UpdateOutcome, UpdateError> {
        let params = plan.rolling.unwrap_or_default();
        info!(
            deployment = %plan.target,
            image = %plan.image,
            replicas = plan.replicas,
            max_unavailable = %params.max_unavailable,
            max_surge = %params.max_surge,
            "Updating deployment using rolling update strategy"
        );

        let strategy = rolling_strategy(&params);
        apply_in_place(api, plan, &strategy, &self.retry).await?;

        info!(deployment = %plan.target, "Deployment updated successfully");
        Ok(outcome(plan))
    }
}

/// Recreate handler
///
/// All old pods are killed before new ones start; rolling parameters are cleared.
pub struct RecreateUpdater {
    retry: RetryPolicy,
}

impl RecreateUpdater {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }
}

#[async_trait]
impl Updater for RecreateUpdater {
    fn name(&self) -> &'static str {
        Strategy::Recreate.as_str()
    }

    async fn update(
        &self,
        api: &dyn ClusterApi,
        plan: &UpdatePlan,
    ) -> Result<UpdateOutcome, UpdateError> {
        info!(
            deployment = %plan.target,
            image = %plan.image,
            replicas = plan.replicas,
            "Updating deployment using recreate strategy"
        );

        let strategy = DeploymentStrategy {
            type_: Some(RECREATE_TYPE.to_string()),
            rolling_update: None,
        };
        apply_in_place(api, plan, &strategy, &self.retry).await?;

        info!(deployment = %plan.target, "Deployment updated successfully");
        Ok(outcome(plan))
    }
}

fn rolling_strategy(params: &RollingParameters) -> DeploymentStrategy {
    DeploymentStrategy {
        type_: Some(ROLLING_UPDATE_TYPE.to_string()),
        rolling_update: Some(RollingUpdateDeployment {
            max_unavailable: Some(params.max_unavailable.to_int_or_string()),
            max_surge: Some(params.max_surge.to_int_or_string()),
        }),
    }
}

fn outcome(plan: &UpdatePlan) -> UpdateOutcome {
    UpdateOutcome {
        strategy: plan.strategy.to_string(),
        deployment: plan.target.name.clone(),
        message: "Deployment updated successfully".to_string(),
        green_deployment: None,
    }
}

/// Apply the plan to a freshly read copy, retrying on conflict
async fn apply_in_place(
    api: &dyn ClusterApi,
    plan: &UpdatePlan,
    strategy: &DeploymentStrategy,
    retry: &RetryPolicy,
) -> Result<Deployment, UpdateError> {
    let operation = format!("update deployment {}", plan.target);
    retry_on_conflict(retry, &operation, || apply_once(api, plan, strategy)).await
}

async fn apply_once(
    api: &dyn ClusterApi,
    plan: &UpdatePlan,
    strategy: &DeploymentStrategy,
) -> Result<Deployment, UpdateError> {
    let target = &plan.target;
    let mut deployment = api
        .get_deployment(&target.namespace, &target.name)
        .await
        .map_err(|e| UpdateError::from_get(target, e))?;

    mutate(&mut deployment, plan, strategy)?;

    api.update_deployment(&target.namespace, &deployment)
        .await
        .map_err(|e| {
            UpdateError::cluster(format!("failed to update deployment {}", target.name), e)
        })
}

fn mutate(
    deployment: &mut Deployment,
    plan: &UpdatePlan,
    strategy: &DeploymentStrategy,
) -> Result<(), UpdateError> {
    set_container_image(deployment, plan.container.as_deref(), &plan.image)?;
    let spec = deployment.spec.get_or_insert_with(Default::default);
    spec.replicas = Some(plan.replicas);
    spec.strategy = Some(strategy.clone());
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "rolling_test.rs"]
mod tests;
