//! Device identity
//!
//! A `PeerIdentity` names one install of the app. It is generated once and
//! persisted, then stamped on every outgoing message.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Characters used for generated identities (lowercase, no look-alikes)
const ALPHABET: &[u8] = b"23456789abcdefghjkmnpqrstuvwxyz";

/// Number of random characters after the `dev-` prefix
const SUFFIX_LENGTH: usize = 16;

/// Opaque device identifier, unique for the lifetime of an install
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        PeerIdentity(id.into())
    }

    /// Generate a fresh random identity
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();

        let mut id = String::with_capacity(4 + SUFFIX_LENGTH);
        id.push_str("dev-");
        for _ in 0..SUFFIX_LENGTH {
            let idx = rng.gen_range(0..ALPHABET.len());
            id.push(ALPHABET[idx] as char);
        }
        PeerIdentity(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerIdentity {
    fn from(s: &str) -> Self {
        PeerIdentity(s.to_string())
    }
}

impl From<String> for PeerIdentity {
    fn from(s: String) -> Self {
        PeerIdentity(s)
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Identity file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Identity file {0} is empty")]
    Empty(PathBuf),
}

/// File-backed storage for the local identity
#[derive(Debug, Clone)]
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored identity, generating and saving one on first use
    pub fn load_or_create(&self) -> Result<PeerIdentity, IdentityError> {
        if self.path.exists() {
            let contents = fs::read_to_string(&self.path)?;
            let id = contents.trim();
            if id.is_empty() {
                return Err(IdentityError::Empty(self.path.clone()));
            }
            info!("Loaded device identity from {}", self.path.display());
            return Ok(PeerIdentity::new(id));
        }

        let identity = PeerIdentity::generate();

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, identity.as_str())?;
        info!(
            "Generated device identity {} and saved it to {}",
            identity,
            self.path.display()
        );

        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("metrosync-identity-{}-{}", std::process::id(), name))
            .join("identity")
    }

    #[test]
    fn test_generated_identity_shape() {
        let id = PeerIdentity::generate();
        assert!(id.as_str().starts_with("dev-"));
        assert_eq!(id.as_str().len(), 4 + SUFFIX_LENGTH);
        assert_ne!(id, PeerIdentity::generate());
    }

    #[test]
    fn test_load_or_create_persists() {
        let path = temp_path("persist");
        let _ = fs::remove_dir_all(path.parent().unwrap());

        let store = IdentityStore::new(&path);
        let first = store.load_or_create().unwrap();
        let second = store.load_or_create().unwrap();
        assert_eq!(first, second);

        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_empty_identity_file_is_rejected() {
        let path = temp_path("empty");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "  \n").unwrap();

        let err = IdentityStore::new(&path).load_or_create().unwrap_err();
        assert!(matches!(err, IdentityError::Empty(_)));

        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }
}
