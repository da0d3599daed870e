//! Compensation log for multi-object updates
//!
//! The cluster API has no multi-object transaction, so each step that creates
//! something records how to undo it. On failure before commit the recorded
//! undos run newest first; once committed the log is discarded.

use super::UpdateError;
use crate::cluster::ClusterApi;
use tracing::{error, info, warn};

/// Undo action for one committed step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    DeleteDeployment { namespace: String, name: String },
}

impl Compensation {
    fn describe(&self) -> String {
        match self {
            Compensation::DeleteDeployment { namespace, name } => {
                format!("deleted deployment {}/{}", namespace, name)
            }
        }
    }

    async fn run(&self, api: &dyn ClusterApi) -> Result<(), String> {
        match self {
            Compensation::DeleteDeployment { namespace, name } => {
                match api.delete_deployment(namespace, name).await {
                    Ok(()) => Ok(()),
                    // Already gone is as good as deleted
                    Err(e) if e.is_not_found() => Ok(()),
                    Err(e) => Err(format!(
                        "failed to delete deployment {}/{}: {}",
                        namespace, name, e
                    )),
                }
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct Saga {
    steps: Vec<Compensation>,
}

impl Saga {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, compensation: Compensation) {
        self.steps.push(compensation);
    }

    pub fn pending(&self) -> &[Compensation] {
        &self.steps
    }

    /// Keep everything done so far; nothing will be undone
    pub fn commit(self) {
        info!(steps = self.steps.len(), "Update committed");
    }

    /// Undo every recorded step, newest first, and wrap `failure`
    ///
    /// All compensations are attempted even if one fails. The returned error
    /// is `RolledBack` when every undo succeeded, `CompensationFailed` otherwise.
    pub async fn abort(self, api: &dyn ClusterApi, failure: UpdateError) -> UpdateError {
        warn!(error = %failure, steps = self.steps.len(), "Update failed, compensating");

        let mut undone = Vec::new();
        let mut failures = Vec::new();
        for step in self.steps.iter().rev() {
            match step.run(api).await {
                Ok(()) => {
                    info!(step = %step.describe(), "Compensation applied");
                    undone.push(step.describe());
                }
                Err(e) => {
                    error!(error = %e, "Compensation failed");
                    failures.push(e);
                }
            }
        }

        if failures.is_empty() {
            UpdateError::RolledBack {
                failure: Box::new(failure),
                undone,
            }
        } else {
            UpdateError::CompensationFailed {
                failure: Box::new(failure),
                failures,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::{deployment_fixture, Call, FakeCluster, Op};
    use crate::cluster::ClusterError;

    fn delete(name: &str) -> Compensation {
        Compensation::DeleteDeployment {
            namespace: "default".to_string(),
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_abort_undoes_newest_first() {
        let fake = FakeCluster::new();
        fake.insert_deployment("default", deployment_fixture("a", &[("app", "a")], "a:1", 1));
        fake.insert_deployment("default", deployment_fixture("b", &[("app", "b")], "b:1", 1));

        let mut saga = Saga::new();
        saga.record(delete("a"));
        saga.record(delete("b"));

        let err = saga
            .abort(&fake, UpdateError::Validation("boom".to_string()))
            .await;

        assert!(matches!(err, UpdateError::RolledBack { .. }));
        assert_eq!(
            fake.calls(),
            vec![
                Call::DeleteDeployment("b".to_string()),
                Call::DeleteDeployment("a".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_abort_reports_both_errors_when_undo_fails() {
        let fake = FakeCluster::new();
        fake.fail_next(
            Op::DeleteDeployment,
            ClusterError::Forbidden("delete is forbidden".to_string()),
        );

        let mut saga = Saga::new();
        saga.record(delete("web-green"));

        let err = saga
            .abort(&fake, UpdateError::Validation("retarget failed".to_string()))
            .await;

        let message = err.to_string();
        assert!(matches!(err, UpdateError::CompensationFailed { .. }));
        assert!(message.contains("retarget failed"), "{}", message);
        assert!(message.contains("delete is forbidden"), "{}", message);
    }

    #[tokio::test]
    async fn test_already_deleted_counts_as_undone() {
        let fake = FakeCluster::new();
        let mut saga = Saga::new();
        saga.record(delete("gone"));

        let err = saga
            .abort(&fake, UpdateError::Validation("x".to_string()))
            .await;

        assert!(matches!(err, UpdateError::RolledBack { .. }));
    }

    #[test]
    fn test_commit_keeps_steps() {
        let mut saga = Saga::new();
        saga.record(delete("web-green"));
        assert_eq!(saga.pending().len(), 1);
        saga.commit();
    }
}
