//! `skopeo`-backed image inspector
//!
//! Reads the raw manifest of an image. Manifest lists and OCI indexes carry
//! the platform of every entry; a single-platform manifest needs a second
//! call for the image config, which holds the architecture.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use multiarch_common::store::DockerConfig;
use multiarch_common::Error;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::{ArchitectureSet, ImageInspector};

/// Default skopeo binary
pub const DEFAULT_SKOPEO_COMMAND: &str = "skopeo";

/// Default timeout for one skopeo invocation
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Placeholder architecture used by attestation manifests in an index
const UNKNOWN_ARCHITECTURE: &str = "unknown";

/// Transport prefix for registry references
const DOCKER_TRANSPORT: &str = "docker://";

static AUTHFILE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Inspects images by shelling out to skopeo
#[derive(Clone, Debug)]
pub struct SkopeoInspector {
    command: String,
    timeout: Duration,
}

impl Default for SkopeoInspector {
    fn default() -> Self {
        Self::new(DEFAULT_SKOPEO_COMMAND, DEFAULT_COMMAND_TIMEOUT)
    }
}

impl SkopeoInspector {
    /// Create an inspector running `command` with a per-call `timeout`
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    async fn inspect(
        &self,
        image: &str,
        mode: &str,
        authfile: Option<&Path>,
    ) -> Result<Vec<u8>, Error> {
        let reference = transport_reference(image);
        let mut cmd = Command::new(&self.command);
        cmd.arg("inspect").arg(mode).kill_on_drop(true);
        if let Some(path) = authfile {
            cmd.arg("--authfile").arg(path);
        }
        cmd.arg(&reference);

        debug!(image, mode, "Running skopeo inspect");
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                warn!(image, mode, timeout = ?self.timeout, "skopeo inspect timed out");
                Error::inspection(image, format!("timed out after {:?}", self.timeout))
            })?
            .map_err(|e| {
                Error::inspection(image, format!("failed to execute {}: {}", self.command, e))
            })?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::inspection(image, stderr.trim().to_string()))
        }
    }
}

#[async_trait]
impl ImageInspector for SkopeoInspector {
    async fn compatible_architectures(
        &self,
        image: &str,
        secrets: &[Vec<u8>],
    ) -> Result<ArchitectureSet, Error> {
        if secrets.is_empty() {
            return self.architectures(image, None).await;
        }

        let merged = DockerConfig::merge(secrets.iter().map(Vec::as_slice));
        let authfile = AuthFile::write(&merged).await?;
        let result = self.architectures(image, Some(authfile.path())).await;
        authfile.remove().await;
        result
    }
}

impl SkopeoInspector {
    async fn architectures(
        &self,
        image: &str,
        authfile: Option<&Path>,
    ) -> Result<ArchitectureSet, Error> {
        let raw = self.inspect(image, "--raw", authfile).await?;
        match parse_manifest(&raw).map_err(|e| Error::inspection(image, e))? {
            Manifest::List(set) => Ok(set),
            Manifest::Single => {
                let config = self.inspect(image, "--config", authfile).await?;
                let arch = parse_config_architecture(&config)
                    .map_err(|e| Error::inspection(image, e))?;
                Ok(std::iter::once(arch).collect())
            }
        }
    }
}

/// Prefix bare references with the registry transport
fn transport_reference(image: &str) -> String {
    if image.contains("://") {
        image.to_string()
    } else {
        format!("{}{}", DOCKER_TRANSPORT, image)
    }
}

/// What a raw manifest told us
#[derive(Debug, PartialEq)]
enum Manifest {
    /// Manifest list or OCI index with these architectures
    List(ArchitectureSet),
    /// Single-platform manifest; the architecture lives in the config
    Single,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    #[serde(default)]
    manifests: Option<Vec<Descriptor>>,
    /// Present on legacy schema 1 manifests
    #[serde(default)]
    architecture: Option<String>,
}

#[derive(Deserialize)]
struct Descriptor {
    #[serde(default)]
    platform: Option<Platform>,
}

#[derive(Deserialize)]
struct Platform {
    architecture: String,
}

#[derive(Deserialize)]
struct ImageConfig {
    architecture: Option<String>,
}

fn parse_manifest(raw: &[u8]) -> Result<Manifest, String> {
    let manifest: RawManifest =
        serde_json::from_slice(raw).map_err(|e| format!("invalid manifest: {}", e))?;

    if let Some(entries) = manifest.manifests {
        let set: ArchitectureSet = entries
            .into_iter()
            .filter_map(|d| d.platform)
            .map(|p| p.architecture)
            .filter(|a| !a.is_empty() && a != UNKNOWN_ARCHITECTURE)
            .collect();
        if set.is_empty() {
            return Err("manifest list has no platform entries".to_string());
        }
        return Ok(Manifest::List(set));
    }

    match manifest.architecture {
        Some(arch) if !arch.is_empty() => Ok(Manifest::List(std::iter::once(arch).collect())),
        _ => Ok(Manifest::Single),
    }
}

fn parse_config_architecture(raw: &[u8]) -> Result<String, String> {
    let config: ImageConfig =
        serde_json::from_slice(raw).map_err(|e| format!("invalid image config: {}", e))?;
    config
        .architecture
        .filter(|a| !a.is_empty())
        .ok_or_else(|| "image config has no architecture".to_string())
}

/// Auth document written to a private temp file
///
/// Removed by [`AuthFile::remove`] once skopeo is done. A file dropped
/// mid-inspection is removed on the blocking pool.
struct AuthFile {
    path: PathBuf,
    removed: bool,
}

impl AuthFile {
    async fn write(config: &DockerConfig) -> Result<Self, Error> {
        let bytes = serde_json::to_vec(config)
            .map_err(|e| Error::serialization_for_kind("DockerConfig", e.to_string()))?;
        let path = std::env::temp_dir().join(format!(
            "multiarch-auth-{}-{}.json",
            std::process::id(),
            AUTHFILE_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        write_private(&path, &bytes).await.map_err(|e| {
            Error::internal_with_context(
                "skopeo",
                format!("failed to write authfile {}: {}", path.display(), e),
            )
        })?;
        Ok(Self {
            path,
            removed: false,
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn remove(mut self) {
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            warn!(path = %self.path.display(), error = %e, "Failed to remove authfile");
        }
        self.removed = true;
    }
}

impl Drop for AuthFile {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        let path = std::mem::take(&mut self.path);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove_quietly(&path));
            }
            Err(_) => remove_quietly(&path),
        }
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "Failed to remove authfile");
    }
}

#[cfg(unix)]
async fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await
}

#[cfg(not(unix))]
async fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    tokio::fs::write(path, bytes).await
}
