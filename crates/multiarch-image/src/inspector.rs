//! Registry inspection seam

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use multiarch_common::Error;

use crate::ArchitectureSet;

/// Looks up the architectures an image is published for
///
/// `secrets` are `{"auths": ...}` documents; later documents take
/// precedence for the same registry.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ImageInspector: Send + Sync {
    /// Architectures the image can run on
    async fn compatible_architectures(
        &self,
        image: &str,
        secrets: &[Vec<u8>],
    ) -> Result<ArchitectureSet, Error>;
}
