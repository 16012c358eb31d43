//! Process-wide stores shared by the webhook and the pod controller
//!
//! Each store is constructed once at startup and handed around as an `Arc`;
//! the watchers in the operator crate are the only writers.

mod config;
mod pull_secret;

pub use config::ConfigStore;
pub use pull_secret::{
    extract_auth_payload, DockerAuth, DockerConfig, PullSecretStore, DOCKER_CFG_KEY,
    DOCKER_CONFIG_JSON_KEY,
};
