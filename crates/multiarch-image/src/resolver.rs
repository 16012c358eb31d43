//! Intersection of image architectures across a pod

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::try_join_all;
use multiarch_common::Error;
use tracing::debug;

use crate::{ArchitectureSet, ContainerImageRef, ImageArchitectureCache};

/// Computes the architectures every image of a pod supports
#[derive(Clone)]
pub struct ArchitectureResolver {
    cache: Arc<ImageArchitectureCache>,
}

impl ArchitectureResolver {
    /// Create a resolver backed by a shared cache
    pub fn new(cache: Arc<ImageArchitectureCache>) -> Self {
        Self { cache }
    }

    /// Architectures supported by all `images`
    ///
    /// Lookups run concurrently. The first failing image aborts the rest
    /// and its error is returned; no partial set is produced. No images
    /// yield an empty set.
    pub async fn intersect(
        &self,
        images: &BTreeSet<ContainerImageRef>,
        secrets: &[Vec<u8>],
    ) -> Result<ArchitectureSet, Error> {
        let lookups = images
            .iter()
            .map(|r| self.cache.resolve(&r.image, r.skip_cache, secrets));
        let sets = try_join_all(lookups).await?;

        let mut sets = sets.into_iter();
        let Some(first) = sets.next() else {
            return Ok(ArchitectureSet::new());
        };
        let result = sets.fold(first, |acc, set| acc.intersection(&set));

        debug!(images = images.len(), architectures = %result, "Resolved pod architectures");
        Ok(result)
    }
}
