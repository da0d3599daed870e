//! Readiness polling for newly created deployments

use super::UpdateError;
use crate::cluster::ClusterApi;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Poll interval between readiness checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Checks before giving up (3 minutes at the default interval)
pub const DEFAULT_MAX_ATTEMPTS: u32 = 180;

/// Fixed-interval, bounded readiness check
///
/// Blocks the caller until the deployment's available replicas match the
/// desired count or the attempts run out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessPoller {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for ReadinessPoller {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReadinessPoller {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Wait until `available == desired`
    ///
    /// # Returns
    /// * `Ok(())` - on the first check where the counts match
    /// * `Err(UpdateError::NotReady)` - counts never matched
    /// * `Err(_)` - the deployment could not be read
    pub async fn wait_until_available(
        &self,
        api: &dyn ClusterApi,
        namespace: &str,
        name: &str,
    ) -> Result<(), UpdateError> {
        info!(
            deployment = %name,
            namespace = %namespace,
            max_attempts = self.max_attempts,
            "Waiting for deployment to become available"
        );

        for attempt in 1..=self.max_attempts {
            let deployment = api.get_deployment(namespace, name).await.map_err(|e| {
                UpdateError::cluster(format!("failed to check deployment {}", name), e)
            })?;

            let desired = deployment
                .spec
                .as_ref()
                .and_then(|s| s.replicas)
                .unwrap_or(1);
            let available = deployment
                .status
                .as_ref()
                .and_then(|s| s.available_replicas)
                .unwrap_or(0);

            if available == desired {
                info!(deployment = %name, attempt = attempt, "Deployment is available");
                return Ok(());
            }
            debug!(
                deployment = %name,
                attempt = attempt,
                available = available,
                desired = desired,
                "Deployment not available yet"
            );

            if attempt < self.max_attempts {
                tokio::time::sleep(self.interval).await;
            }
        }

        warn!(deployment = %name, attempts = self.max_attempts, "Deployment not ready in time");
        Err(UpdateError::NotReady {
            name: name.to_string(),
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::{deployment_fixture, Call, FakeCluster, Op};
    use crate::cluster::ClusterError;
    use k8s_openapi::api::apps::v1::DeploymentStatus;

    fn fast() -> ReadinessPoller {
        ReadinessPoller::new(Duration::from_millis(1), DEFAULT_MAX_ATTEMPTS)
    }

    fn gets(fake: &FakeCluster) -> usize {
        fake.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::GetDeployment(_)))
            .count()
    }

    #[test]
    fn test_default_is_three_minutes() {
        let poller = ReadinessPoller::default();
        assert_eq!(poller.interval * poller.max_attempts, Duration::from_secs(180));
    }

    #[tokio::test]
    async fn test_returns_on_first_match() {
        let fake = FakeCluster::new();
        fake.insert_deployment("default", deployment_fixture("web", &[("app", "web")], "v1", 3));
        fake.set_deployment_status(
            "default",
            "web",
            DeploymentStatus {
                available_replicas: Some(3),
                ..Default::default()
            },
        );

        fast().wait_until_available(&fake, "default", "web").await.unwrap();

        assert_eq!(gets(&fake), 1);
    }

    #[tokio::test]
    async fn test_never_ready_returns_not_ready_after_all_attempts() {
        let fake = FakeCluster::new();
        fake.insert_deployment("default", deployment_fixture("web", &[("app", "web")], "v1", 3));
        fake.set_deployment_status(
            "default",
            "web",
            DeploymentStatus {
                available_replicas: Some(1),
                ..Default::default()
            },
        );

        let err = fast()
            .wait_until_available(&fake, "default", "web")
            .await
            .unwrap_err();

        assert!(matches!(err, UpdateError::NotReady { attempts: 180, .. }));
        assert!(err.to_string().contains("not ready in time"));
        assert_eq!(gets(&fake), 180);
    }

    #[tokio::test]
    async fn test_read_error_stops_polling() {
        let fake = FakeCluster::new();
        fake.fail_next(
            Op::GetDeployment,
            ClusterError::Unreachable("connection refused".to_string()),
        );

        let err = fast()
            .wait_until_available(&fake, "default", "web")
            .await
            .unwrap_err();

        assert!(matches!(err, UpdateError::Cluster { .. }));
        assert_eq!(gets(&fake), 1);
    }
}
