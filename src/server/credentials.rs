//! Cluster credentials carried on request headers

use crate::cluster::{ClusterCredentials, ConnectError, ManagedCredentials};
use axum::http::{header::AUTHORIZATION, HeaderMap};

pub const CLUSTER_TYPE: &str = "cluster-type";
pub const CLUSTER_ADDRESS: &str = "cluster-address";
pub const CLUSTER_PORT: &str = "cluster-port";
pub const CLUSTER_REGION: &str = "cluster-region";
pub const CLUSTER_NAME: &str = "cluster-name";
pub const ACCESS_KEY_ID: &str = "access-key-id";
pub const SECRET_ACCESS_KEY: &str = "secret-access-key";

/// `cluster-type` values selecting the managed path
const MANAGED_TYPES: [&str; 2] = ["managed", "eks"];

fn header(headers: &HeaderMap, name: &str) -> Result<String, ConnectError> {
    match headers.get(name) {
        None => Ok(String::new()),
        Some(value) => value
            .to_str()
            .map(|v| v.trim().to_string())
            .map_err(|_| ConnectError::InvalidCredentials(format!("header {} is not valid text", name))),
    }
}

/// Read the caller's cluster credentials
///
/// Any other `cluster-type` (or none) is a generic cluster reached with the
/// bearer token from `Authorization`. Completeness is checked by the connector.
pub fn credentials_from_headers(headers: &HeaderMap) -> Result<ClusterCredentials, ConnectError> {
    let cluster_type = header(headers, CLUSTER_TYPE)?.to_ascii_lowercase();

    if MANAGED_TYPES.contains(&cluster_type.as_str()) {
        return Ok(ClusterCredentials::Managed(ManagedCredentials {
            region: header(headers, CLUSTER_REGION)?,
            cluster_name: header(headers, CLUSTER_NAME)?,
            access_key_id: header(headers, ACCESS_KEY_ID)?,
            secret_access_key: header(headers, SECRET_ACCESS_KEY)?,
        }));
    }

    let authorization = header(headers, AUTHORIZATION.as_str())?;
    let token = authorization
        .strip_prefix("Bearer ")
        .unwrap_or(&authorization)
        .trim()
        .to_string();
    let port = Some(header(headers, CLUSTER_PORT)?).filter(|p| !p.is_empty());

    Ok(ClusterCredentials::Generic {
        address: header(headers, CLUSTER_ADDRESS)?,
        port,
        token,
    })
}
