//! Managed-cluster credential exchange
//!
//! Cloud-managed clusters are not reached with a caller-supplied bearer token.
//! Instead the access/secret key pair is exchanged for the cluster's API
//! endpoint, its CA bundle, and a short-lived token scoped to that cluster.
//!
//! `EksCredentialExchange` does this against EKS directly. The token is the
//! one aws-iam-authenticator mints: a presigned STS `GetCallerIdentity` URL
//! bound to the cluster name.

use super::connector::ConnectError;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_eks::config::Credentials;
use aws_sdk_eks::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sigv4::http_request::{sign, SignableBody, SignableRequest, SignatureLocation, SigningSettings};
use aws_sigv4::sign::v4;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Prefix aws-iam-authenticator puts in front of the encoded presigned URL
pub const TOKEN_PREFIX: &str = "k8s-aws-v1.";

/// Signed header that binds a token to one cluster
pub const CLUSTER_ID_HEADER: &str = "x-k8s-aws-id";

/// How long the presigned URL inside a token stays valid
pub const TOKEN_EXPIRY: Duration = Duration::from_secs(60);

const CREDENTIALS_PROVIDER: &str = "kdi-k8s";

/// EKS error codes that mean the key pair itself was rejected
const REJECTED_KEY_CODES: &[&str] = &[
    "UnrecognizedClientException",
    "InvalidSignatureException",
    "AccessDeniedException",
    "ExpiredTokenException",
];

/// Access/secret key pair for a cloud-managed cluster
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct ManagedCredentials {
    pub region: String,
    pub cluster_name: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl fmt::Debug for ManagedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedCredentials")
            .field("region", &self.region)
            .field("cluster_name", &self.cluster_name)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// What the exchange hands back
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterAccess {
    pub endpoint: String,
    /// Base64-encoded PEM bundle, as cloud control APIs return it
    pub certificate_authority_data: String,
    pub token: String,
}

impl fmt::Debug for ManagedClusterAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedClusterAccess")
            .field("endpoint", &self.endpoint)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[async_trait]
pub trait CredentialExchange: Send + Sync {
    async fn exchange(
        &self,
        credentials: &ManagedCredentials,
    ) -> Result<ManagedClusterAccess, ConnectError>;
}

/// Exchange backed by an HTTP credential broker
///
/// POSTs the credential request as JSON and expects a `ManagedClusterAccess`
/// body back. Configured with `KDI_CREDENTIAL_BROKER_URL`.
pub struct HttpCredentialExchange {
    client: reqwest::Client,
    url: String,
}

impl HttpCredentialExchange {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl CredentialExchange for HttpCredentialExchange {
    async fn exchange(
        &self,
        credentials: &ManagedCredentials,
    ) -> Result<ManagedClusterAccess, ConnectError> {
        info!(
            region = %credentials.region,
            cluster = %credentials.cluster_name,
            "Exchanging managed cluster credentials"
        );

        let response = self
            .client
            .post(&self.url)
            .json(credentials)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "Credential broker unreachable");
                ConnectError::CredentialExchange(format!("credential broker unreachable: {}", e))
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(ConnectError::Unauthorized(format!(
                "cluster {} rejected the provided access key",
                credentials.cluster_name
            )));
        }
        if !status.is_success() {
            return Err(ConnectError::CredentialExchange(format!(
                "credential broker returned {}",
                status
            )));
        }

        response
            .json::<ManagedClusterAccess>()
            .await
            .map_err(|e| ConnectError::CredentialExchange(format!("invalid broker response: {}", e)))
    }
}

/// Exchange backed by the EKS control plane
///
/// `DescribeCluster` supplies the endpoint and CA bundle; the bearer token is
/// signed locally with the same key pair.
#[derive(Debug, Default, Clone, Copy)]
pub struct EksCredentialExchange;

#[async_trait]
impl CredentialExchange for EksCredentialExchange {
    async fn exchange(
        &self,
        credentials: &ManagedCredentials,
    ) -> Result<ManagedClusterAccess, ConnectError> {
        info!(
            region = %credentials.region,
            cluster = %credentials.cluster_name,
            "Describing EKS cluster"
        );

        let static_credentials = Credentials::new(
            credentials.access_key_id.clone(),
            credentials.secret_access_key.clone(),
            None,
            None,
            CREDENTIALS_PROVIDER,
        );
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(credentials.region.clone()))
            .credentials_provider(static_credentials)
            .load()
            .await;

        let output = aws_sdk_eks::Client::new(&config)
            .describe_cluster()
            .name(&credentials.cluster_name)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %DisplayErrorContext(&e), "DescribeCluster failed");
                describe_cluster_error(
                    e.code(),
                    &credentials.cluster_name,
                    &DisplayErrorContext(&e).to_string(),
                )
            })?;

        let missing = |what: &str| {
            ConnectError::CredentialExchange(format!(
                "cluster {} has no {}",
                credentials.cluster_name, what
            ))
        };
        let cluster = output.cluster().ok_or_else(|| missing("description"))?;
        let endpoint = cluster.endpoint().ok_or_else(|| missing("endpoint"))?;
        let certificate_authority_data = cluster
            .certificate_authority()
            .and_then(|ca| ca.data())
            .ok_or_else(|| missing("certificate authority"))?;

        let token = presign_token(credentials, SystemTime::now())?;
        debug!(endpoint = %endpoint, "EKS cluster described, token signed");

        Ok(ManagedClusterAccess {
            endpoint: endpoint.to_string(),
            certificate_authority_data: certificate_authority_data.to_string(),
            token,
        })
    }
}

/// Map a failed `DescribeCluster` to a connection error by its service code
fn describe_cluster_error(code: Option<&str>, cluster_name: &str, detail: &str) -> ConnectError {
    match code {
        Some(code) if REJECTED_KEY_CODES.contains(&code) => ConnectError::Unauthorized(format!(
            "the access key was rejected for cluster {}: {}",
            cluster_name, detail
        )),
        Some("ResourceNotFoundException") => ConnectError::InvalidCredentials(format!(
            "cluster {} does not exist in this region",
            cluster_name
        )),
        _ => ConnectError::CredentialExchange(format!(
            "failed to describe cluster {}: {}",
            cluster_name, detail
        )),
    }
}

/// Mint an EKS bearer token from the key pair
///
/// The token is `k8s-aws-v1.` followed by the unpadded base64url form of a
/// regional STS `GetCallerIdentity` URL, presigned at `time` for 60 seconds
/// with the cluster name as the signed `x-k8s-aws-id` header.
pub fn presign_token(
    credentials: &ManagedCredentials,
    time: SystemTime,
) -> Result<String, ConnectError> {
    let url = format!(
        "https://sts.{}.amazonaws.com/?Action=GetCallerIdentity&Version=2011-06-15",
        credentials.region
    );
    let identity = Credentials::new(
        credentials.access_key_id.clone(),
        credentials.secret_access_key.clone(),
        None,
        None,
        CREDENTIALS_PROVIDER,
    )
    .into();

    let mut settings = SigningSettings::default();
    settings.signature_location = SignatureLocation::QueryParams;
    settings.expires_in = Some(TOKEN_EXPIRY);

    let params = v4::SigningParams::builder()
        .identity(&identity)
        .region(&credentials.region)
        .name("sts")
        .time(time)
        .settings(settings)
        .build()
        .map_err(signing_failed)?
        .into();

    let signable = SignableRequest::new(
        "GET",
        url.as_str(),
        std::iter::once((CLUSTER_ID_HEADER, credentials.cluster_name.as_str())),
        SignableBody::Bytes(&[]),
    )
    .map_err(signing_failed)?;

    let (instructions, _signature) = sign(signable, &params)
        .map_err(signing_failed)?
        .into_parts();

    let mut request = axum::http::Request::builder()
        .uri(url.as_str())
        .body(())
        .map_err(signing_failed)?;
    instructions.apply_to_request_http1x(&mut request);

    Ok(format!(
        "{}{}",
        TOKEN_PREFIX,
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(request.uri().to_string())
    ))
}

fn signing_failed(error: impl fmt::Display) -> ConnectError {
    ConnectError::InvalidCredentials(format!("failed to sign token: {}", error))
}

/// Decode a base64 PEM bundle into DER certificates
///
/// Fails if the data is not base64, not PEM, or holds no certificate.
pub fn decode_certificate_authority(data: &str) -> Result<Vec<Vec<u8>>, ConnectError> {
    let pem_bytes = base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| {
            ConnectError::InvalidCredentials(format!(
                "failed to decode certificate authority: {}",
                e
            ))
        })?;

    let certificates: Vec<Vec<u8>> = pem::parse_many(&pem_bytes)
        .map_err(|e| {
            ConnectError::InvalidCredentials(format!("failed to parse certificate authority: {}", e))
        })?
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(|block| block.into_contents())
        .collect();

    if certificates.is_empty() {
        return Err(ConnectError::InvalidCredentials(
            "certificate authority contains no certificate".to_string(),
        ));
    }
    Ok(certificates)
}
