//! Deployment status report
//!
//! Replica counts are taken as reported by the Deployment status; pods are
//! only inspected to explain failures.

use super::{DeploymentRef, UpdateError};
use crate::cluster::{format_label_selector, ClusterApi};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatusReport {
    pub ready_replicas: i32,
    pub available_replicas: i32,
    pub unavailable_replicas: i32,
    pub updated_replicas: i32,
    pub replica_failures: Vec<String>,
    pub message: String,
    pub checked_at: DateTime<Utc>,
}

/// Read the deployment and explain any failing containers
pub async fn read_deployment_status(
    api: &dyn ClusterApi,
    target: &DeploymentRef,
) -> Result<DeploymentStatusReport, UpdateError> {
    let deployment = api
        .get_deployment(&target.namespace, &target.name)
        .await
        .map_err(|e| UpdateError::from_get(target, e))?;

    let selector = deployment
        .spec
        .as_ref()
        .map(|s| format_label_selector(&s.selector))
        .unwrap_or_default();
    debug!(deployment = %target, selector = %selector, "Listing deployment pods");

    let pods = api
        .list_pods(&target.namespace, &selector)
        .await
        .map_err(|e| UpdateError::cluster("failed to list pods", e))?;

    let status = deployment.status.unwrap_or_default();
    let ready_replicas = status.ready_replicas.unwrap_or(0);
    let available_replicas = status.available_replicas.unwrap_or(0);

    Ok(DeploymentStatusReport {
        ready_replicas,
        available_replicas,
        unavailable_replicas: status.unavailable_replicas.unwrap_or(0),
        updated_replicas: status.updated_replicas.unwrap_or(0),
        replica_failures: collect_failures(&pods),
        message: format!(
            "Deployment {} in namespace {} has {} ready replicas and {} available replicas",
            target.name, target.namespace, ready_replicas, available_replicas
        ),
        checked_at: Utc::now(),
    })
}

/// One entry per container that is waiting or exited non-zero
pub fn collect_failures(pods: &[Pod]) -> Vec<String> {
    let mut failures = Vec::new();
    for pod in pods {
        let pod_name = pod.metadata.name.as_deref().unwrap_or("<unnamed>");
        let statuses = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref());

        for container in statuses.into_iter().flatten() {
            let Some(state) = &container.state else {
                continue;
            };
            if let Some(waiting) = &state.waiting {
                failures.push(describe(
                    pod_name,
                    &container.name,
                    waiting.reason.as_deref(),
                    waiting.message.as_deref(),
                ));
            }
            if let Some(terminated) = &state.terminated {
                if terminated.exit_code != 0 {
                    failures.push(describe(
                        pod_name,
                        &container.name,
                        terminated.reason.as_deref(),
                        terminated.message.as_deref(),
                    ));
                }
            }
        }
    }
    failures
}

fn describe(pod: &str, container: &str, reason: Option<&str>, message: Option<&str>) -> String {
    match (reason, message) {
        (Some(r), Some(m)) => format!("Pod {}: {}: {}: {}", pod, container, r, m),
        (Some(r), None) => format!("Pod {}: {}: {}", pod, container, r),
        (None, Some(m)) => format!("Pod {}: {}: {}", pod, container, m),
        (None, None) => format!("Pod {}: {}: not running", pod, container),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::{deployment_fixture, pod_fixture, Call, FakeCluster};
    use k8s_openapi::api::apps::v1::DeploymentStatus;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting,
        ContainerStatus,
    };

    fn status(name: &str, state: ContainerState) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            state: Some(state),
            ..Default::default()
        }
    }

    fn waiting(reason: &str, message: &str) -> ContainerState {
        ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some(reason.to_string()),
                message: Some(message.to_string()),
            }),
            ..Default::default()
        }
    }

    fn terminated(exit_code: i32) -> ContainerState {
        ContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code,
                reason: Some(if exit_code == 0 { "Completed" } else { "Error" }.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn running() -> ContainerState {
        ContainerState {
            running: Some(ContainerStateRunning::default()),
            ..Default::default()
        }
    }

    #[test]
    fn test_collect_failures_waiting_and_nonzero_exit() {
        let pods = vec![
            pod_fixture(
                "web-1",
                vec![status("app", waiting("ImagePullBackOff", "Back-off pulling image"))],
            ),
            pod_fixture("web-2", vec![status("app", terminated(1))]),
            pod_fixture("web-3", vec![status("app", terminated(0))]),
            pod_fixture("web-4", vec![status("app", running())]),
        ];

        let failures = collect_failures(&pods);

        assert_eq!(
            failures,
            vec![
                "Pod web-1: app: ImagePullBackOff: Back-off pulling image".to_string(),
                "Pod web-2: app: Error".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_report_trusts_deployment_status_counts() {
        let fake = FakeCluster::new();
        fake.insert_deployment("ns1", deployment_fixture("web", &[("app", "web")], "v1", 3));
        fake.set_deployment_status(
            "ns1",
            "web",
            DeploymentStatus {
                ready_replicas: Some(2),
                available_replicas: Some(2),
                unavailable_replicas: Some(1),
                updated_replicas: Some(3),
                ..Default::default()
            },
        );
        // Pod list disagrees with the counts on purpose
        fake.insert_pods(
            "ns1",
            vec![pod_fixture("web-1", vec![status("app", waiting("CrashLoopBackOff", "restarting"))])],
        );

        let report = read_deployment_status(&fake, &DeploymentRef::new("ns1", "web"))
            .await
            .unwrap();

        assert_eq!(report.ready_replicas, 2);
        assert_eq!(report.available_replicas, 2);
        assert_eq!(report.unavailable_replicas, 1);
        assert_eq!(report.updated_replicas, 3);
        assert_eq!(report.replica_failures.len(), 1);
        assert_eq!(
            report.message,
            "Deployment web in namespace ns1 has 2 ready replicas and 2 available replicas"
        );
        assert!(fake.calls().contains(&Call::ListPods("app=web".to_string())));
    }

    #[tokio::test]
    async fn test_report_for_missing_deployment() {
        let fake = FakeCluster::new();

        let err = read_deployment_status(&fake, &DeploymentRef::new("default", "ghost"))
            .await
            .unwrap_err();

        assert!(matches!(err, UpdateError::DeploymentNotFound { .. }));
    }

    #[test]
    fn test_report_serializes_camel_case() {
        let report = DeploymentStatusReport {
            ready_replicas: 1,
            available_replicas: 1,
            unavailable_replicas: 0,
            updated_replicas: 1,
            replica_failures: vec![],
            message: "ok".to_string(),
            checked_at: Utc::now(),
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["readyReplicas"], 1);
        assert_eq!(json["replicaFailures"], serde_json::json!([]));
        assert!(json.get("checkedAt").is_some());
    }
}
