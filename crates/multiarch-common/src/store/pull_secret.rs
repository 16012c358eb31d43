//! Registry pull secrets
//!
//! Holds the cluster-wide pull secret bytes (a `{"auths": {...}}` document)
//! and the parsing shared by the global watcher and per-pod secret lookups.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Data key of `kubernetes.io/dockerconfigjson` secrets
pub const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";
/// Data key of legacy `kubernetes.io/dockercfg` secrets
pub const DOCKER_CFG_KEY: &str = ".dockercfg";

/// A docker auth file: registry host to credentials
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct DockerConfig {
    /// Credentials keyed by registry
    #[serde(default)]
    pub auths: BTreeMap<String, DockerAuth>,
}

/// Credentials for one registry
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct DockerAuth {
    /// base64 of `user:password`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    /// Plain username, used by some generators instead of `auth`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Plain password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl DockerAuth {
    /// Decode `(user, password)` from the `auth` field, falling back to the
    /// plain fields
    pub fn credentials(&self) -> Result<(String, String), Error> {
        if let Some(auth) = &self.auth {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(auth.trim())
                .map_err(|e| Error::serialization(format!("auth is not base64: {}", e)))?;
            let decoded = String::from_utf8(decoded)
                .map_err(|e| Error::serialization(format!("auth is not utf-8: {}", e)))?;
            let (user, password) = decoded
                .split_once(':')
                .ok_or_else(|| Error::serialization("auth is not user:password"))?;
            return Ok((user.to_string(), password.to_string()));
        }
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Ok((u.clone(), p.clone())),
            _ => Err(Error::serialization("auth entry has no credentials")),
        }
    }
}

impl DockerConfig {
    /// Parse an auth document and check every entry carries credentials
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        let config: DockerConfig = serde_json::from_slice(bytes)
            .map_err(|e| Error::serialization_for_kind("DockerConfig", e.to_string()))?;
        for (registry, auth) in &config.auths {
            auth.credentials().map_err(|e| {
                Error::serialization_for_kind("DockerConfig", format!("{}: {}", registry, e))
            })?;
        }
        Ok(config)
    }

    /// Merge several auth documents; later documents win per registry
    ///
    /// Unparsable documents are skipped.
    pub fn merge<'a>(documents: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut merged = DockerConfig::default();
        for doc in documents {
            if let Ok(config) = serde_json::from_slice::<DockerConfig>(doc) {
                merged.auths.extend(config.auths);
            }
        }
        merged
    }
}

/// Extract a `{"auths": ...}` document from a pull secret
///
/// Legacy `.dockercfg` payloads (registry map without the `auths` wrapper)
/// are wrapped so callers only ever see one format.
pub fn extract_auth_payload(secret: &Secret) -> Result<Vec<u8>, Error> {
    let data = secret
        .data
        .as_ref()
        .ok_or_else(|| Error::serialization_for_kind("Secret", "secret has no data"))?;

    if let Some(bytes) = data.get(DOCKER_CONFIG_JSON_KEY) {
        DockerConfig::parse(&bytes.0)?;
        return Ok(bytes.0.clone());
    }

    if let Some(bytes) = data.get(DOCKER_CFG_KEY) {
        let auths: BTreeMap<String, DockerAuth> = serde_json::from_slice(&bytes.0)
            .map_err(|e| Error::serialization_for_kind("Secret", e.to_string()))?;
        let wrapped = serde_json::to_vec(&DockerConfig { auths })
            .map_err(|e| Error::serialization_for_kind("Secret", e.to_string()))?;
        DockerConfig::parse(&wrapped)?;
        return Ok(wrapped);
    }

    Err(Error::serialization_for_kind(
        "Secret",
        format!(
            "secret has neither {} nor {}",
            DOCKER_CONFIG_JSON_KEY, DOCKER_CFG_KEY
        ),
    ))
}

/// Thread-safe holder of the global pull secret bytes (last writer wins)
#[derive(Debug, Default)]
pub struct PullSecretStore {
    current: RwLock<Option<Arc<Vec<u8>>>>,
}

impl PullSecretStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored bytes
    pub fn set(&self, bytes: Vec<u8>) {
        *self.current.write() = Some(Arc::new(bytes));
    }

    /// Forget the stored bytes
    pub fn clear(&self) {
        *self.current.write() = None;
    }

    /// Current bytes, if any
    pub fn get(&self) -> Option<Arc<Vec<u8>>> {
        self.current.read().clone()
    }
}
