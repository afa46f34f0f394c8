//! Node join flow.
//!
//! ```text
//! Uninitialized -> KeyReady -> Submitted -> Polling -> Issued -> Configured
//!        \             \           \           \          \
//!         +-------------+-----------+-----------+----------+--> Failed
//! ```
//!
//! The node wraps its join key for the cluster issuer, submits a join request
//! and polls until the issuer marks it `Issued`. Every encrypted field of the
//! response is decrypted and validated before anything is written; a single
//! bad field fails the join with nothing applied.
//!
//! A restarted flow resubmits under the same key (kept in `join.key`), and a
//! duplicate submission counts as success.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nodemesh_crypto::{decrypt_field, CryptoError, JoinPublicKey, SymmetricKey};
use nodemesh_networking::{derive_leaf_config, NetworkError, VpnDescriptor, WgInterface};
use nodemesh_reconcile::{Hypervisor, HypervisorError};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::{ApiError, ClusterApi, JoinRecord, JoinRequest};
use crate::config::{JoinSettings, NodePaths};
use crate::files;
use crate::keystore::{self, KeyStoreError};
use crate::kubelet;
use crate::systemd::{KubeletUnit, ServiceError, ServiceManager, KUBELET_SERVICE};
use crate::wireguard::{LeafMeshError, LeafMeshSetup};

/// Join flow errors.
#[derive(Debug, Error)]
pub enum JoinError {
    #[error("failed to load or generate join key: {0}")]
    KeyGeneration(#[from] KeyStoreError),

    #[error("failed to wrap join key: {0}")]
    KeyWrap(#[source] CryptoError),

    #[error("failed to submit join request: {0}")]
    Submission(#[source] ApiError),

    #[error("join request for {node_name} was not issued within {timeout:?}")]
    JoinTimeout { node_name: String, timeout: Duration },

    #[error("join cancelled")]
    Cancelled,

    #[error("failed to decrypt {field}: {source}")]
    Decryption {
        field: &'static str,
        #[source]
        source: CryptoError,
    },

    #[error("invalid mesh configuration: {0}")]
    Mesh(#[from] NetworkError),

    #[error("failed to set up mesh: {0}")]
    MeshSetup(#[source] HypervisorError),

    #[error("failed to write {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to install kubelet: {0}")]
    Install(#[source] HypervisorError),

    #[error("failed to start {unit}: {source}")]
    Service {
        unit: &'static str,
        #[source]
        source: ServiceError,
    },
}

impl From<LeafMeshError> for JoinError {
    fn from(e: LeafMeshError) -> Self {
        match e {
            LeafMeshError::Persist { path, source } => Self::Persist { path, source },
            LeafMeshError::Hypervisor(e) => Self::MeshSetup(e),
        }
    }
}

/// Where a join flow is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    Uninitialized,
    KeyReady,
    Submitted,
    Polling,
    Issued,
    Configured,
    Failed,
}

impl fmt::Display for JoinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::KeyReady => "key_ready",
            Self::Submitted => "submitted",
            Self::Polling => "polling",
            Self::Issued => "issued",
            Self::Configured => "configured",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Fully decrypted join response.
pub struct DecryptedJoinConfig {
    pub kube_config: String,
    pub kubelet_config: String,
    pub vpn: VpnDescriptor,

    /// Leaf mesh derived from `vpn`.
    pub mesh: WgInterface,
}

impl fmt::Debug for DecryptedJoinConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptedJoinConfig")
            .field("vpn_address", &self.vpn.address)
            .field("vpn_endpoint", &self.vpn.endpoint)
            .finish_non_exhaustive()
    }
}

impl DecryptedJoinConfig {
    /// Decrypt every field of `record`; any failure rejects the whole record.
    pub fn decrypt(record: &JoinRecord, key: &SymmetricKey) -> Result<Self, JoinError> {
        let field = |name: &'static str, value: &str| {
            decrypt_field(key, value).map_err(|source| JoinError::Decryption {
                field: name,
                source,
            })
        };

        let kube_config = field("kubeConfig", &record.kube_config)?;
        let kubelet_config = field("kubeletConfig", &record.kubelet_config)?;
        let vpn = VpnDescriptor {
            cidr: field("vpn.cidr", &record.vpn.cidr)?,
            address: field("vpn.address", &record.vpn.address)?,
            peer_private_key: field("vpn.peerPrivateKey", &record.vpn.peer_private_key)?,
            endpoint: field("vpn.endpoint", &record.vpn.endpoint)?,
            endpoint_public_key: field("vpn.endpointPublicKey", &record.vpn.endpoint_public_key)?,
        };
        let mesh = derive_leaf_config(&vpn)?;

        Ok(Self {
            kube_config,
            kubelet_config,
            vpn,
            mesh,
        })
    }
}

/// Joins this node to a cluster.
pub struct JoinFlow {
    settings: JoinSettings,
    paths: NodePaths,
    join_public_key: JoinPublicKey,
    api: Arc<dyn ClusterApi>,
    hypervisor: Arc<dyn Hypervisor>,
    services: Arc<dyn ServiceManager>,
    state: JoinState,
}

impl JoinFlow {
    pub fn new(
        settings: JoinSettings,
        paths: NodePaths,
        join_public_key: JoinPublicKey,
        api: Arc<dyn ClusterApi>,
        hypervisor: Arc<dyn Hypervisor>,
        services: Arc<dyn ServiceManager>,
    ) -> Self {
        Self {
            settings,
            paths,
            join_public_key,
            api,
            hypervisor,
            services,
            state: JoinState::Uninitialized,
        }
    }

    /// Current state.
    pub fn state(&self) -> JoinState {
        self.state
    }

    /// Run the flow to completion.
    ///
    /// Setting `shutdown` to `true` cancels a pending wait for the issuer.
    pub async fn run(&mut self, shutdown: watch::Receiver<bool>) -> Result<(), JoinError> {
        let result = self.run_inner(shutdown).await;
        if let Err(e) = &result {
            warn!(
                node_name = %self.settings.node_name,
                state = %self.state,
                error = %e,
                "join failed"
            );
            self.transition(JoinState::Failed);
        }
        result
    }

    async fn run_inner(&mut self, shutdown: watch::Receiver<bool>) -> Result<(), JoinError> {
        let key = keystore::load_or_generate(&self.paths.join_key())?;
        self.transition(JoinState::KeyReady);

        self.submit(&key).await?;
        self.transition(JoinState::Submitted);

        self.transition(JoinState::Polling);
        let record = self.wait_for_issued(shutdown).await?;
        self.transition(JoinState::Issued);

        let config = DecryptedJoinConfig::decrypt(&record, &key)?;
        self.apply(&config).await?;
        self.transition(JoinState::Configured);

        Ok(())
    }

    fn transition(&mut self, next: JoinState) {
        info!(
            node_name = %self.settings.node_name,
            from = %self.state,
            to = %next,
            "join state transition"
        );
        self.state = next;
    }

    async fn submit(&self, key: &SymmetricKey) -> Result<(), JoinError> {
        let request = JoinRequest {
            node_name: self.settings.node_name.clone(),
            symmetric_key: self.join_public_key.wrap(key).map_err(JoinError::KeyWrap)?,
            api_server_endpoint: self.settings.api_server.clone(),
            container_runtime_endpoint: self.settings.container_runtime_endpoint.clone(),
            image_service_endpoint: self.settings.image_service_endpoint.clone(),
        };

        match self.api.submit_join_request(&request).await {
            Ok(()) => Ok(()),
            Err(ApiError::AlreadyExists) => {
                debug!(node_name = %request.node_name, "join request already exists");
                Ok(())
            }
            Err(e) => Err(JoinError::Submission(e)),
        }
    }

    async fn wait_for_issued(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<JoinRecord, JoinError> {
        if *shutdown.borrow() {
            return Err(JoinError::Cancelled);
        }

        let node_name = &self.settings.node_name;
        let timed_out = || JoinError::JoinTimeout {
            node_name: node_name.clone(),
            timeout: self.settings.timeout,
        };
        let deadline = time::sleep(self.settings.timeout);
        tokio::pin!(deadline);

        let period = self.settings.poll_interval;
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut deadline => return Err(timed_out()),
                _ = cancelled(&mut shutdown) => return Err(JoinError::Cancelled),
                _ = ticker.tick() => {}
            }

            // An in-flight fetch still races the deadline and shutdown.
            let fetched = tokio::select! {
                _ = &mut deadline => return Err(timed_out()),
                _ = cancelled(&mut shutdown) => return Err(JoinError::Cancelled),
                fetched = self.api.fetch_join_record(node_name) => fetched,
            };
            match fetched {
                Ok(record) if record.issued => return Ok(record),
                Ok(_) => debug!(node_name = %node_name, "join request not issued yet"),
                Err(e) => debug!(node_name = %node_name, error = %e, "failed to fetch join request"),
            }
        }
    }

    async fn apply(&self, config: &DecryptedJoinConfig) -> Result<(), JoinError> {
        let settings = &self.settings;

        persist(&self.paths.kubeconfig(), config.kube_config.as_bytes())?;
        persist(&self.paths.kubelet_config(), config.kubelet_config.as_bytes())?;

        kubelet::install_kubelet(
            self.hypervisor.as_ref(),
            &settings.node_name,
            &settings.kubelet_installer_image,
        )
        .await
        .map_err(JoinError::Install)?;

        let unit = KubeletUnit {
            node_name: settings.node_name.clone(),
            kubeconfig: self.paths.kubeconfig(),
            kubelet_config: self.paths.kubelet_config(),
            container_runtime_endpoint: settings.container_runtime_endpoint.clone(),
            image_service_endpoint: settings.image_service_endpoint.clone(),
        };
        let unit_path = self.paths.kubelet_unit();
        files::write_atomic(&unit_path, unit.render().as_bytes(), files::PUBLIC_FILE_MODE)
            .map_err(|source| JoinError::Persist {
                path: unit_path,
                source,
            })?;

        self.services
            .enable_and_start(KUBELET_SERVICE)
            .await
            .map_err(|source| JoinError::Service {
                unit: KUBELET_SERVICE,
                source,
            })?;

        let mesh_config = self.paths.mesh_config();
        LeafMeshSetup {
            hypervisor: self.hypervisor.as_ref(),
            image: &settings.mesh_image,
            config_path: &mesh_config,
            debug_pods: settings.debug_pods,
        }
        .apply(&settings.node_name, &config.mesh)
        .await?;

        Ok(())
    }
}

/// Resolves once shutdown is requested. A dropped sender never cancels.
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    let requested = shutdown.wait_for(|stop| *stop).await.is_ok();
    if !requested {
        std::future::pending::<()>().await;
    }
}

fn persist(path: &std::path::Path, contents: &[u8]) -> Result<(), JoinError> {
    files::write_private(path, contents).map_err(|source| JoinError::Persist {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use nodemesh_crypto::encrypt_field;
    use nodemesh_networking::WgKeyPair;

    use super::*;
    use crate::client::EncryptedVpn;

    fn sealed_record(key: &SymmetricKey) -> JoinRecord {
        let seal = |s: &str| encrypt_field(key, s).unwrap();
        JoinRecord {
            node_name: "node-1".to_string(),
            issued: true,
            kube_config: seal("apiVersion: v1\nkind: Config\n"),
            kubelet_config: seal("kind: KubeletConfiguration\n"),
            vpn: EncryptedVpn {
                cidr: seal("10.0.0.1/24"),
                address: seal("10.0.0.2/24"),
                peer_private_key: seal(&WgKeyPair::generate().private_key.to_string()),
                endpoint: seal("198.51.100.7:31820"),
                endpoint_public_key: seal(&WgKeyPair::generate().public_key.to_string()),
            },
        }
    }

    #[test]
    fn test_decrypt_record() {
        let key = SymmetricKey::generate();
        let config = DecryptedJoinConfig::decrypt(&sealed_record(&key), &key).unwrap();

        assert_eq!(config.kube_config, "apiVersion: v1\nkind: Config\n");
        assert_eq!(config.vpn.endpoint, "198.51.100.7:31820");
        assert_eq!(config.mesh.peers.len(), 1);
    }

    #[test]
    fn test_decrypt_names_bad_field() {
        let key = SymmetricKey::generate();
        let mut record = sealed_record(&key);
        record.vpn.endpoint = "garbage".to_string();

        match DecryptedJoinConfig::decrypt(&record, &key) {
            Err(JoinError::Decryption { field, .. }) => assert_eq!(field, "vpn.endpoint"),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_decrypt_with_wrong_key() {
        let record = sealed_record(&SymmetricKey::generate());
        let err = DecryptedJoinConfig::decrypt(&record, &SymmetricKey::generate()).unwrap_err();
        assert!(matches!(
            err,
            JoinError::Decryption {
                field: "kubeConfig",
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_vpn_content_is_mesh_error() {
        let key = SymmetricKey::generate();
        let mut record = sealed_record(&key);
        record.vpn.address = encrypt_field(&key, "not-an-address").unwrap();

        assert!(matches!(
            DecryptedJoinConfig::decrypt(&record, &key),
            Err(JoinError::Mesh(_))
        ));
    }

    #[test]
    fn test_state_labels() {
        assert_eq!(JoinState::KeyReady.to_string(), "key_ready");
        assert_eq!(JoinState::Failed.to_string(), "failed");
    }
}
