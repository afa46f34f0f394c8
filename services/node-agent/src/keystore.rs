//! At-rest storage of the node's join key.
//!
//! The key is kept as lowercase hex in `<config_dir>/join.key`. It survives
//! restarts so a node that re-runs the join resubmits under the same key and
//! can still decrypt a response issued for an earlier attempt.

use std::io;
use std::path::{Path, PathBuf};

use nodemesh_crypto::{CryptoError, SymmetricKey};
use thiserror::Error;
use tracing::{debug, info};

use crate::files;

/// Errors loading or creating the join key.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed join key in {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: CryptoError,
    },
}

/// Load the join key at `path`, generating and persisting one if absent.
pub fn load_or_generate(path: &Path) -> Result<SymmetricKey, KeyStoreError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            debug!(path = %path.display(), "loaded existing join key");
            SymmetricKey::from_hex(&contents).map_err(|source| KeyStoreError::Malformed {
                path: path.to_path_buf(),
                source,
            })
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let key = SymmetricKey::generate();
            files::write_private(path, key.to_hex().as_bytes()).map_err(|source| {
                KeyStoreError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            info!(path = %path.display(), "generated new join key");
            Ok(key)
        }
        Err(source) => Err(KeyStoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
