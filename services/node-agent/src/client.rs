//! Cluster API client for the join protocol.
//!
//! Join requests are `NodeJoinRequest` objects in the `nodemesh-system`
//! namespace, named after the node:
//! - the node creates one carrying its wrapped join key
//! - the issuer fills in the encrypted response and sets the `Issued` condition

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// API group and version of join requests.
pub const API_VERSION: &str = "node.nodemesh.io/v1alpha1";

/// Namespace join requests live in.
pub const JOIN_NAMESPACE: &str = "nodemesh-system";

/// Condition set by the issuer once the response is populated.
pub const ISSUED_CONDITION: &str = "Issued";

/// Cluster API errors.
#[derive(Debug, Error)]
pub enum ApiError {
    /// A join request with this name already exists.
    #[error("join request already exists")]
    AlreadyExists,

    /// No join request with this name.
    #[error("join request {0} not found")]
    NotFound(String),

    /// Unexpected HTTP status.
    #[error("api returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Transport or decoding failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// A node's request to join a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub node_name: String,

    /// Join key wrapped for the issuer.
    pub symmetric_key: String,

    pub api_server_endpoint: String,
    pub container_runtime_endpoint: String,
    pub image_service_endpoint: String,
}

/// VPN settings as issued: every field encrypted under the join key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EncryptedVpn {
    pub cidr: String,
    pub address: String,
    pub peer_private_key: String,
    pub endpoint: String,
    pub endpoint_public_key: String,
}

/// Server-side view of a join request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinRecord {
    pub node_name: String,

    /// Whether the `Issued` condition is present.
    pub issued: bool,

    /// Encrypted kubeconfig.
    pub kube_config: String,

    /// Encrypted kubelet configuration.
    pub kubelet_config: String,

    /// Encrypted VPN settings.
    pub vpn: EncryptedVpn,
}

/// Join request operations on the cluster API.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create a join request. Fails with [`ApiError::AlreadyExists`] on duplicates.
    async fn submit_join_request(&self, request: &JoinRequest) -> Result<(), ApiError>;

    /// Fetch the join request for `node_name`.
    async fn fetch_join_record(&self, node_name: &str) -> Result<JoinRecord, ApiError>;
}

/// HTTP implementation of [`ClusterApi`].
pub struct HttpClusterClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpClusterClient {
    /// Create a client for `api_server`, trusting `ca_pem` in addition to the
    /// built-in roots when given.
    pub fn new(
        api_server: &str,
        token: impl Into<String>,
        ca_pem: Option<&[u8]>,
    ) -> Result<Self, ApiError> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));
        if let Some(pem) = ca_pem {
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(pem)?);
        }

        Ok(Self {
            client: builder.build()?,
            base_url: api_server.trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn collection_url(&self) -> String {
        format!(
            "{}/apis/{}/namespaces/{}/nodejoinrequests",
            self.base_url, API_VERSION, JOIN_NAMESPACE
        )
    }
}

#[async_trait]
impl ClusterApi for HttpClusterClient {
    async fn submit_join_request(&self, request: &JoinRequest) -> Result<(), ApiError> {
        let url = self.collection_url();
        debug!(url = %url, node_name = %request.node_name, "Submitting join request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&NodeJoinRequestObject::from_request(request))
            .send()
            .await?;

        match response.status() {
            StatusCode::CONFLICT => Err(ApiError::AlreadyExists),
            status if status.is_success() => Ok(()),
            status => Err(ApiError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn fetch_join_record(&self, node_name: &str) -> Result<JoinRecord, ApiError> {
        let url = format!("{}/{}", self.collection_url(), node_name);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(ApiError::NotFound(node_name.to_string())),
            status if status.is_success() => {
                let object: NodeJoinRequestObject = response.json().await?;
                Ok(object.into_record())
            }
            status => Err(ApiError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeJoinRequestObject {
    #[serde(default)]
    api_version: String,
    #[serde(default)]
    kind: String,
    metadata: ObjectMeta,
    #[serde(default)]
    spec: NodeJoinRequestSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<NodeJoinRequestStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ObjectMeta {
    name: String,
    #[serde(default)]
    namespace: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct NodeJoinRequestSpec {
    symmetric_key: String,
    api_server_endpoint: String,
    container_runtime_endpoint: String,
    image_service_endpoint: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct NodeJoinRequestStatus {
    kube_config: String,
    kubelet_config: String,
    vpn: EncryptedVpn,
    conditions: Vec<Condition>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Condition {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default = "condition_true")]
    status: String,
}

fn condition_true() -> String {
    "True".to_string()
}

impl NodeJoinRequestObject {
    fn from_request(request: &JoinRequest) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: "NodeJoinRequest".to_string(),
            metadata: ObjectMeta {
                name: request.node_name.clone(),
                namespace: JOIN_NAMESPACE.to_string(),
            },
            spec: NodeJoinRequestSpec {
                symmetric_key: request.symmetric_key.clone(),
                api_server_endpoint: request.api_server_endpoint.clone(),
                container_runtime_endpoint: request.container_runtime_endpoint.clone(),
                image_service_endpoint: request.image_service_endpoint.clone(),
            },
            status: None,
        }
    }

    fn into_record(self) -> JoinRecord {
        let status = self.status.unwrap_or_default();
        let issued = status
            .conditions
            .iter()
            .any(|c| c.kind == ISSUED_CONDITION && c.status.eq_ignore_ascii_case("true"));

        JoinRecord {
            node_name: self.metadata.name,
            issued,
            kube_config: status.kube_config,
            kubelet_config: status.kubelet_config,
            vpn: status.vpn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_object_shape() {
        let object = NodeJoinRequestObject::from_request(&JoinRequest {
            node_name: "node-1".to_string(),
            symmetric_key: "wrapped".to_string(),
            api_server_endpoint: "https://api".to_string(),
            container_runtime_endpoint: "unix:///cri.sock".to_string(),
            image_service_endpoint: "unix:///img.sock".to_string(),
        });
        let json = serde_json::to_value(&object).unwrap();

        assert_eq!(json["apiVersion"], API_VERSION);
        assert_eq!(json["kind"], "NodeJoinRequest");
        assert_eq!(json["metadata"]["namespace"], JOIN_NAMESPACE);
        assert_eq!(json["spec"]["symmetricKey"], "wrapped");
        assert_eq!(json["spec"]["imageServiceEndpoint"], "unix:///img.sock");
        assert!(json.get("status").is_none());
    }

    #[test]
    fn test_record_without_status_is_not_issued() {
        let object: NodeJoinRequestObject = serde_json::from_value(serde_json::json!({
            "apiVersion": API_VERSION,
            "kind": "NodeJoinRequest",
            "metadata": {"name": "node-1"},
            "spec": {"symmetricKey": "wrapped"}
        }))
        .unwrap();

        let record = object.into_record();
        assert_eq!(record.node_name, "node-1");
        assert!(!record.issued);
    }

    #[test]
    fn test_issued_condition() {
        let object: NodeJoinRequestObject = serde_json::from_value(serde_json::json!({
            "apiVersion": API_VERSION,
            "kind": "NodeJoinRequest",
            "metadata": {"name": "node-1", "namespace": JOIN_NAMESPACE},
            "status": {
                "kubeConfig": "a",
                "kubeletConfig": "b",
                "vpn": {"cidr": "c", "address": "d", "peerPrivateKey": "e",
                        "endpoint": "f", "endpointPublicKey": "g"},
                "conditions": [{"type": "Issued", "status": "True"}]
            }
        }))
        .unwrap();

        let record = object.into_record();
        assert!(record.issued);
        assert_eq!(record.kube_config, "a");
        assert_eq!(record.vpn.peer_private_key, "e");
        assert_eq!(record.vpn.endpoint_public_key, "g");
    }

    #[test]
    fn test_false_condition_is_not_issued() {
        let object: NodeJoinRequestObject = serde_json::from_value(serde_json::json!({
            "apiVersion": API_VERSION,
            "kind": "NodeJoinRequest",
            "metadata": {"name": "node-1"},
            "status": {"conditions": [{"type": "Issued", "status": "False"}]}
        }))
        .unwrap();
        assert!(!object.into_record().issued);
    }
}
