//! Credential retrieval contract.
//!
//! The engine never stores secrets: a connector asks the store once per
//! connect attempt and drops the value when the handshake is done.

use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("no credential stored for '{0}'")]
    NotFound(String),
    #[error("credential backend unavailable: {0}")]
    Unavailable(String),
}

/// Backend that maps a profile's credential reference to its secret.
pub trait CredentialStore: Send + Sync {
    fn resolve(&self, profile_id: &str) -> Result<SecretString, CredentialError>;
}

/// Process-local store, mainly for tests and embedding.
#[derive(Default)]
pub struct MemoryCredentialStore {
    secrets: RwLock<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, profile_id: impl Into<String>, secret: impl Into<String>) {
        if let Ok(mut map) = self.secrets.write() {
            map.insert(profile_id.into(), secret.into());
        }
    }

    pub fn remove(&self, profile_id: &str) {
        if let Ok(mut map) = self.secrets.write() {
            map.remove(profile_id);
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn resolve(&self, profile_id: &str) -> Result<SecretString, CredentialError> {
        let map = self
            .secrets
            .read()
            .map_err(|_| CredentialError::Unavailable("lock poisoned".into()))?;
        map.get(profile_id)
            .map(|s| SecretString::new(s.clone()))
            .ok_or_else(|| CredentialError::NotFound(profile_id.to_string()))
    }
}
