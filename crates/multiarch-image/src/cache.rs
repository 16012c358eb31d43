//! Image architecture cache with per-image single flight
//!
//! Each image maps to a `OnceCell`; the first caller runs the inspection and
//! everyone else arriving meanwhile awaits the same cell. A failed inspection
//! leaves the cell empty so the next caller retries.
//!
//! Entries are never evicted. Image references are usually a small,
//! slowly-growing set per cluster, but a cluster churning through unique
//! digests will grow this map without bound.

use std::sync::Arc;

use dashmap::DashMap;
use multiarch_common::Error;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::{ArchitectureSet, ImageInspector};

/// Shared cache in front of an [`ImageInspector`]
pub struct ImageArchitectureCache {
    inspector: Arc<dyn ImageInspector>,
    entries: DashMap<String, Arc<OnceCell<ArchitectureSet>>>,
}

impl ImageArchitectureCache {
    /// Create an empty cache
    pub fn new(inspector: Arc<dyn ImageInspector>) -> Self {
        Self {
            inspector,
            entries: DashMap::new(),
        }
    }

    /// Architectures of `image`
    ///
    /// With `skip_cache` the cached value is not read; the fresh result
    /// replaces whatever was stored.
    pub async fn resolve(
        &self,
        image: &str,
        skip_cache: bool,
        secrets: &[Vec<u8>],
    ) -> Result<ArchitectureSet, Error> {
        if skip_cache {
            debug!(image, "Bypassing architecture cache");
            let set = self.inspector.compatible_architectures(image, secrets).await?;
            self.entries
                .insert(image.to_string(), Arc::new(OnceCell::from(set.clone())));
            return Ok(set);
        }

        // The map guard must not live across the await below
        let cell = Arc::clone(&self.entries.entry(image.to_string()).or_default());

        let set = cell
            .get_or_try_init(|| async {
                debug!(image, "Architecture cache miss");
                self.inspector.compatible_architectures(image, secrets).await
            })
            .await?;
        Ok(set.clone())
    }

    /// Cached result for `image`, if an inspection has completed
    pub fn get(&self, image: &str) -> Option<ArchitectureSet> {
        self.entries.get(image).and_then(|cell| cell.get().cloned())
    }

    /// Number of images with a slot in the cache
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
