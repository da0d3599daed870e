//! In-memory `ClusterApi` for tests
//!
//! Behaves like a tiny API server: objects are keyed by namespace/name,
//! every write bumps `resourceVersion`, and replaces with a stale version are
//! rejected as conflicts. Failures can be injected per operation.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::{ClusterApi, ClusterError};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus};
use k8s_openapi::api::core::v1::{
    Container, ContainerStatus, Pod, PodSpec, PodStatus, PodTemplateSpec, Service, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;

/// A recorded call against the fake cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ServerVersion,
    GetDeployment(String),
    CreateDeployment(String),
    UpdateDeployment(String),
    DeleteDeployment(String),
    ListPods(String),
    ListServices,
    GetService(String),
    CreateService(String),
    UpdateService(String),
    CreateNamespace(String),
}

/// Operation names used to inject failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    ServerVersion,
    GetDeployment,
    CreateDeployment,
    UpdateDeployment,
    DeleteDeployment,
    ListPods,
    ListServices,
    GetService,
    CreateService,
    UpdateService,
    CreateNamespace,
}

#[derive(Default)]
struct State {
    namespaces: BTreeSet<String>,
    deployments: BTreeMap<(String, String), Deployment>,
    services: BTreeMap<(String, String), Service>,
    pods: BTreeMap<String, Vec<Pod>>,
    calls: Vec<Call>,
    failures: HashMap<Op, VecDeque<ClusterError>>,
    next_version: u64,
    /// Simulates an external writer bumping the deployment between our GET and PUT
    racing_updates: u32,
    auto_ready: bool,
    hanging_probe: bool,
}

pub struct FakeCluster {
    state: Mutex<State>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    /// New fake with only the `default` namespace
    pub fn new() -> Self {
        let mut state = State {
            next_version: 1,
            ..Default::default()
        };
        state.namespaces.insert("default".to_string());
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn with_namespace(self, namespace: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .namespaces
            .insert(namespace.to_string());
        self
    }

    /// Newly created deployments report all replicas available
    pub fn with_auto_ready(self) -> Self {
        self.state.lock().unwrap().auto_ready = true;
        self
    }

    /// `server_version` never answers
    pub fn with_hanging_probe(self) -> Self {
        self.state.lock().unwrap().hanging_probe = true;
        self
    }

    pub fn insert_deployment(&self, namespace: &str, mut deployment: Deployment) {
        let mut state = self.state.lock().unwrap();
        state.namespaces.insert(namespace.to_string());
        let version = state.bump();
        deployment.metadata.namespace = Some(namespace.to_string());
        deployment.metadata.resource_version = Some(version);
        let name = deployment.metadata.name.clone().unwrap_or_default();
        state
            .deployments
            .insert((namespace.to_string(), name), deployment);
    }

    pub fn insert_service(&self, namespace: &str, mut service: Service) {
        let mut state = self.state.lock().unwrap();
        state.namespaces.insert(namespace.to_string());
        let version = state.bump();
        service.metadata.namespace = Some(namespace.to_string());
        service.metadata.resource_version = Some(version);
        let name = service.metadata.name.clone().unwrap_or_default();
        state.services.insert((namespace.to_string(), name), service);
    }

    pub fn insert_pods(&self, namespace: &str, pods: Vec<Pod>) {
        self.state
            .lock()
            .unwrap()
            .pods
            .entry(namespace.to_string())
            .or_default()
            .extend(pods);
    }

    /// Overwrite a stored deployment's status (e.g. to simulate rollout progress)
    pub fn set_deployment_status(&self, namespace: &str, name: &str, status: DeploymentStatus) {
        let mut state = self.state.lock().unwrap();
        if let Some(d) = state
            .deployments
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            d.status = Some(status);
        }
    }

    /// Queue an error for the next call to `op`
    pub fn fail_next(&self, op: Op, error: ClusterError) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// The next `count` deployment updates race with another writer and
    /// therefore carry a stale resourceVersion
    pub fn race_deployment_updates(&self, count: u32) {
        self.state.lock().unwrap().racing_updates = count;
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.state
            .lock()
            .unwrap()
            .deployments
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.state
            .lock()
            .unwrap()
            .services
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.state.lock().unwrap().namespaces.contains(namespace)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    fn enter(&self, op: Op, call: Call) -> Result<std::sync::MutexGuard<'_, State>, ClusterError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        if let Some(error) = state.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            return Err(error);
        }
        Ok(state)
    }
}

impl State {
    fn bump(&mut self) -> String {
        let version = self.next_version;
        self.next_version += 1;
        version.to_string()
    }

    fn require_namespace(&self, namespace: &str) -> Result<(), ClusterError> {
        if self.namespaces.contains(namespace) {
            Ok(())
        } else {
            Err(ClusterError::NotFound(format!(
                "namespaces \"{}\" not found",
                namespace
            )))
        }
    }
}

fn key(namespace: &str, name: &str) -> (String, String) {
    (namespace.to_string(), name.to_string())
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn server_version(&self) -> Result<String, ClusterError> {
        let hanging = {
            let state = self.enter(Op::ServerVersion, Call::ServerVersion)?;
            state.hanging_probe
        };
        if hanging {
            std::future::pending::<()>().await;
        }
        Ok("v1.30.0".to_string())
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Deployment, ClusterError> {
        let state = self.enter(Op::GetDeployment, Call::GetDeployment(name.to_string()))?;
        state
            .deployments
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| {
                ClusterError::NotFound(format!("deployments.apps \"{}\" not found", name))
            })
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, ClusterError> {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        let mut state = self.enter(Op::CreateDeployment, Call::CreateDeployment(name.clone()))?;
        state.require_namespace(namespace)?;
        if state.deployments.contains_key(&key(namespace, &name)) {
            return Err(ClusterError::Conflict(format!(
                "deployments.apps \"{}\" already exists",
                name
            )));
        }
        if deployment.metadata.resource_version.is_some() {
            return Err(ClusterError::Other(
                "resourceVersion should not be set on objects to be created".to_string(),
            ));
        }
        let mut created = deployment.clone();
        created.metadata.namespace = Some(namespace.to_string());
        created.metadata.resource_version = Some(state.bump());
        created.metadata.uid = Some(format!("uid-{}", name));
        if state.auto_ready {
            let replicas = created.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
            created.status = Some(DeploymentStatus {
                replicas: Some(replicas),
                ready_replicas: Some(replicas),
                available_replicas: Some(replicas),
                updated_replicas: Some(replicas),
                ..Default::default()
            });
        }
        state
            .deployments
            .insert(key(namespace, &name), created.clone());
        Ok(created)
    }

    async fn update_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, ClusterError> {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        let mut state = self.enter(Op::UpdateDeployment, Call::UpdateDeployment(name.clone()))?;
        if state.racing_updates > 0 {
            state.racing_updates -= 1;
            let version = state.bump();
            if let Some(stored) = state.deployments.get_mut(&key(namespace, &name)) {
                stored.metadata.resource_version = Some(version);
            }
        }
        let current_version = match state.deployments.get(&key(namespace, &name)) {
            Some(stored) => stored.metadata.resource_version.clone(),
            None => {
                return Err(ClusterError::NotFound(format!(
                    "deployments.apps \"{}\" not found",
                    name
                )))
            }
        };
        if deployment.metadata.resource_version != current_version {
            return Err(ClusterError::Conflict(format!(
                "Operation cannot be fulfilled on deployments.apps \"{}\": the object has been modified; please apply your changes to the latest version and try again",
                name
            )));
        }
        let mut updated = deployment.clone();
        updated.metadata.resource_version = Some(state.bump());
        state
            .deployments
            .insert(key(namespace, &name), updated.clone());
        Ok(updated)
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let mut state = self.enter(Op::DeleteDeployment, Call::DeleteDeployment(name.to_string()))?;
        state
            .deployments
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| {
                ClusterError::NotFound(format!("deployments.apps \"{}\" not found", name))
            })
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, ClusterError> {
        let state = self.enter(Op::ListPods, Call::ListPods(selector.to_string()))?;
        Ok(state.pods.get(namespace).cloned().unwrap_or_default())
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>, ClusterError> {
        let state = self.enter(Op::ListServices, Call::ListServices)?;
        Ok(state
            .services
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ClusterError> {
        let state = self.enter(Op::GetService, Call::GetService(name.to_string()))?;
        state
            .services
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("services \"{}\" not found", name)))
    }

    async fn create_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, ClusterError> {
        let name = service.metadata.name.clone().unwrap_or_default();
        let mut state = self.enter(Op::CreateService, Call::CreateService(name.clone()))?;
        state.require_namespace(namespace)?;
        if state.services.contains_key(&key(namespace, &name)) {
            return Err(ClusterError::Conflict(format!(
                "services \"{}\" already exists",
                name
            )));
        }
        let mut created = service.clone();
        created.metadata.namespace = Some(namespace.to_string());
        created.metadata.resource_version = Some(state.bump());
        state.services.insert(key(namespace, &name), created.clone());
        Ok(created)
    }

    async fn update_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, ClusterError> {
        let name = service.metadata.name.clone().unwrap_or_default();
        let mut state = self.enter(Op::UpdateService, Call::UpdateService(name.clone()))?;
        let current_version = match state.services.get(&key(namespace, &name)) {
            Some(stored) => stored.metadata.resource_version.clone(),
            None => {
                return Err(ClusterError::NotFound(format!(
                    "services \"{}\" not found",
                    name
                )))
            }
        };
        if service.metadata.resource_version != current_version {
            return Err(ClusterError::Conflict(format!(
                "Operation cannot be fulfilled on services \"{}\"",
                name
            )));
        }
        let mut updated = service.clone();
        updated.metadata.resource_version = Some(state.bump());
        state.services.insert(key(namespace, &name), updated.clone());
        Ok(updated)
    }

    async fn create_namespace(&self, name: &str) -> Result<(), ClusterError> {
        let mut state = self.enter(Op::CreateNamespace, Call::CreateNamespace(name.to_string()))?;
        if !state.namespaces.insert(name.to_string()) {
            return Err(ClusterError::Conflict(format!(
                "namespaces \"{}\" already exists",
                name
            )));
        }
        Ok(())
    }
}

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Deployment with one `app` container, selecting on `app` when present
pub fn deployment_fixture(
    name: &str,
    template_labels: &[(&str, &str)],
    image: &str,
    replicas: i32,
) -> Deployment {
    let template_labels = labels(template_labels);
    let selector: BTreeMap<String, String> = template_labels
        .iter()
        .filter(|(k, _)| k.as_str() != "version")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(template_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "app".to_string(),
                        image: Some(image.to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

pub fn service_fixture(name: &str, selector: &[(&str, &str)]) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: if selector.is_empty() {
                None
            } else {
                Some(labels(selector))
            },
            ..Default::default()
        }),
        status: None,
    }
}

pub fn pod_fixture(name: &str, statuses: Vec<ContainerStatus>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: None,
        status: Some(PodStatus {
            container_statuses: Some(statuses),
            ..Default::default()
        }),
    }
}
