//! HTTP error responses
//!
//! Every failure leaves the server as `{"message": "..."}` with a status
//! derived from the library error that caused it.

use crate::cluster::{ClusterError, ConnectError};
use crate::objects::CreateError;
use crate::update::UpdateError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, message = %self.message, "Request failed");
        }
        (self.status, Json(json!({ "message": self.message }))).into_response()
    }
}

fn cluster_status(error: &ClusterError) -> StatusCode {
    match error {
        ClusterError::NotFound(_) => StatusCode::NOT_FOUND,
        ClusterError::Conflict(_) => StatusCode::CONFLICT,
        ClusterError::Forbidden(_) => StatusCode::FORBIDDEN,
        ClusterError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        ClusterError::Unreachable(_) => StatusCode::BAD_GATEWAY,
        ClusterError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        ClusterError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<ConnectError> for ApiError {
    fn from(error: ConnectError) -> Self {
        let status = match &error {
            ConnectError::MissingCredentials(_) | ConnectError::InvalidCredentials(_) => {
                StatusCode::BAD_REQUEST
            }
            ConnectError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ConnectError::Unreachable { .. } | ConnectError::CredentialExchange(_) => {
                StatusCode::BAD_GATEWAY
            }
            ConnectError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ConnectError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, error.to_string())
    }
}

fn update_status(error: &UpdateError) -> StatusCode {
    match error {
        UpdateError::Validation(_) | UpdateError::UnsupportedStrategy(_) => StatusCode::BAD_REQUEST,
        UpdateError::DeploymentNotFound { .. } | UpdateError::ServiceNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        UpdateError::AmbiguousService { .. } | UpdateError::UnknownVersion { .. } => {
            StatusCode::CONFLICT
        }
        UpdateError::Cluster { source, .. } => cluster_status(source),
        UpdateError::NotReady { .. } => StatusCode::GATEWAY_TIMEOUT,
        // Report the step that failed, not the cleanup
        UpdateError::RolledBack { failure, .. } => update_status(failure),
        UpdateError::RetriesExhausted { .. } | UpdateError::CompensationFailed { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<UpdateError> for ApiError {
    fn from(error: UpdateError) -> Self {
        Self::new(update_status(&error), error.to_string())
    }
}

impl From<CreateError> for ApiError {
    fn from(error: CreateError) -> Self {
        let status = match &error {
            CreateError::Invalid(_) | CreateError::MissingName { .. } => StatusCode::BAD_REQUEST,
            CreateError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            CreateError::Forbidden { .. } => StatusCode::FORBIDDEN,
            CreateError::AlreadyExists { .. } => StatusCode::CONFLICT,
            CreateError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::Strategy;
    use std::time::Duration;

    #[test]
    fn test_connect_error_statuses() {
        let cases = [
            (ConnectError::MissingCredentials("x".into()), 400),
            (ConnectError::InvalidCredentials("x".into()), 400),
            (ConnectError::Unauthorized("x".into()), 401),
            (
                ConnectError::Unreachable {
                    endpoint: "https://10.0.0.1".into(),
                },
                502,
            ),
            (
                ConnectError::Timeout {
                    endpoint: "https://10.0.0.1".into(),
                    timeout: Duration::from_secs(5),
                },
                504,
            ),
            (ConnectError::CredentialExchange("x".into()), 502),
            (ConnectError::Internal("x".into()), 500),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status.as_u16(), status);
        }
    }

    #[test]
    fn test_update_error_statuses() {
        assert_eq!(
            ApiError::from(UpdateError::UnsupportedStrategy(Strategy::Canary)).status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(UpdateError::DeploymentNotFound {
                namespace: "default".into(),
                name: "web".into(),
            })
            .status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(UpdateError::AmbiguousService {
                deployment: "web".into(),
                candidates: vec!["a".into(), "b".into()],
            })
            .status,
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(UpdateError::cluster(
                "failed to update service web",
                ClusterError::Unreachable("refused".into())
            ))
            .status,
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::from(UpdateError::NotReady {
                name: "web-green".into(),
                attempts: 180,
            })
            .status,
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_rolled_back_uses_the_failed_step_status() {
        let error = UpdateError::RolledBack {
            failure: Box::new(UpdateError::cluster(
                "failed to update service web",
                ClusterError::Forbidden("nope".into()),
            )),
            undone: vec!["delete deployment default/web-green".into()],
        };

        let api_error = ApiError::from(error);

        assert_eq!(api_error.status, StatusCode::FORBIDDEN);
        assert!(api_error.message.contains("failed to update service web"));
    }

    #[test]
    fn test_create_error_statuses() {
        assert_eq!(
            ApiError::from(CreateError::AlreadyExists {
                name: "web".into(),
                namespace: "default".into(),
            })
            .status,
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(CreateError::MissingName { kind: "Deployment" }).status,
            StatusCode::BAD_REQUEST
        );
    }
}
