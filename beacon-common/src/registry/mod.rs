//! Container registry clients used to discover the latest published digest.
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use thiserror::Error;

mod docker_hub;

pub use docker_hub::{DockerHubRegistry, Image, Tag};

pub const DOCKER_HUB_URL: &str = "https://hub.docker.com";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("repo {repo} under namespace {namespace} does not exist: {message}")]
    NotFound {
        namespace: String,
        repo: String,
        message: String,
    },
    #[error("client error ({status}) checking namespace {namespace} and repo {repo}: {message}")]
    Client {
        namespace: String,
        repo: String,
        status: StatusCode,
        message: String,
    },
    #[error("server error ({status}) checking namespace {namespace} and repo {repo}: {message}")]
    Server {
        namespace: String,
        repo: String,
        status: StatusCode,
        message: String,
    },
    #[error("error requesting {endpoint}: {error}")]
    Request {
        endpoint: String,
        error: reqwest::Error,
    },
    #[error("error decoding response from {endpoint}: {error}")]
    Decode {
        endpoint: String,
        error: reqwest::Error,
    },
    #[error("invalid registry url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("no tags found for namespace {namespace} and repo {repo}")]
    NoTags { namespace: String, repo: String },
    #[error("no images found for tag {tag}")]
    NoImages { tag: String },
}

impl RegistryError {
    /// The HTTP status that best describes this error to a caller of the daemon.
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::NotFound { .. } => StatusCode::NOT_FOUND,
            RegistryError::Client { .. } => StatusCode::BAD_REQUEST,
            RegistryError::Server { .. }
            | RegistryError::Request { .. }
            | RegistryError::Decode { .. }
            | RegistryError::InvalidUrl(_)
            | RegistryError::NoTags { .. }
            | RegistryError::NoImages { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A registry that publishes image digests for (namespace, repository) pairs.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Digest of the image with the most recently pushed tag. If that tag holds
    /// several platform images, the most recently pushed one wins.
    async fn latest_image_digest(&self, namespace: &str, repo: &str)
        -> Result<String, RegistryError>;

    /// Check that the repository exists and can be read.
    async fn test_repo(&self, namespace: &str, repo: &str) -> Result<(), RegistryError>;

    /// Base URL of the registry, for display.
    fn url(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryKind {
    Docker,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("registry type not supported: {0}")]
pub struct UnsupportedRegistry(String);

impl FromStr for RegistryKind {
    type Err = UnsupportedRegistry;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(RegistryKind::Docker),
            _ => Err(UnsupportedRegistry(s.to_owned())),
        }
    }
}

/// Build the registry client for `kind`.
pub fn build_registry(
    kind: RegistryKind,
    base_url: &str,
    request_timeout: Duration,
) -> Result<Box<dyn Registry>, RegistryError> {
    match kind {
        RegistryKind::Docker => Ok(Box::new(DockerHubRegistry::new(
            base_url,
            request_timeout,
        )?)),
    }
}
