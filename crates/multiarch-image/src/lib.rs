//! Image architecture discovery for the multiarch placement operator
//!
//! The pod controller hands a pod's image references to
//! [`ArchitectureResolver::intersect`], which asks the shared
//! [`ImageArchitectureCache`] for each image and intersects the answers.
//! Cache misses go to an [`ImageInspector`]; [`SkopeoInspector`] is the
//! production implementation.

#![deny(missing_docs)]

mod arch;
mod cache;
mod inspector;
mod resolver;
mod skopeo;

pub use arch::{pod_images, ArchitectureSet, ContainerImageRef, PULL_POLICY_ALWAYS};
pub use cache::ImageArchitectureCache;
pub use inspector::ImageInspector;
pub use resolver::ArchitectureResolver;
pub use skopeo::{SkopeoInspector, DEFAULT_COMMAND_TIMEOUT, DEFAULT_SKOPEO_COMMAND};
