//! Container engine access.
//!
//! Every engine is driven through its command line, so a single `CliRuntime`
//! covers both podman and docker. How commands reach the host (directly or
//! through a shell dialect) is a `CommandRunner` strategy picked once at startup.
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

mod cli;
mod runner;

pub use cli::CliRuntime;
pub use runner::{CommandRunner, ProcessRunner, ShellDialect};

#[derive(Error, Debug)]
pub enum OciError {
    #[error("error spawning `{command}`: {error}")]
    Spawn {
        command: String,
        error: std::io::Error,
    },
    #[error("`{command}` failed with {status}. Output was: {output}")]
    Command {
        command: String,
        status: String,
        output: String,
    },
    #[error("could not recognise output of `{command}`: {output}")]
    Unrecognised { command: String, output: String },
}

/// A fully qualified image reference pinned to a digest: `namespace/repo@digest`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef(String);

impl ImageRef {
    pub fn new(namespace: &str, repo: &str, digest: &str) -> Self {
        Self(format!("{namespace}/{repo}@{digest}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Container states understood by the engines' `status` filter.
/// See https://docs.docker.com/engine/reference/commandline/ps/#filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Restarting,
    Running,
    Removing,
    Paused,
    Exited,
    Dead,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Running => "running",
            ContainerStatus::Removing => "removing",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Dead => "dead",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Podman,
    Docker,
}

impl RuntimeKind {
    pub fn binary(&self) -> &'static str {
        match self {
            RuntimeKind::Podman => "podman",
            RuntimeKind::Docker => "docker",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("runtime not implemented: {0}")]
pub struct UnsupportedRuntime(String);

impl FromStr for RuntimeKind {
    type Err = UnsupportedRuntime;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "podman" => Ok(RuntimeKind::Podman),
            "docker" => Ok(RuntimeKind::Docker),
            _ => Err(UnsupportedRuntime(s.to_owned())),
        }
    }
}

/// The operations beacond needs from a container engine.
#[async_trait]
pub trait OciRuntime: Send + Sync {
    async fn pull_image(&self, image: &ImageRef) -> Result<(), OciError>;

    /// Start a detached container from `image`.
    async fn run_image(&self, image: &ImageRef) -> Result<(), OciError>;

    /// Stop every running container created from `image`. Failing to stop an
    /// individual container is logged and does not fail the call.
    async fn stop_containers_by_image(&self, image: &ImageRef) -> Result<(), OciError>;

    /// IDs of containers created from `image` in any of `statuses`.
    /// An empty `statuses` means the engine's default listing (running only).
    async fn containers_using_image(
        &self,
        image: &ImageRef,
        statuses: &[ContainerStatus],
    ) -> Result<Vec<String>, OciError>;

    async fn check_exists(&self) -> Result<bool, OciError>;

    fn runtime_type(&self) -> RuntimeKind;
}

/// Build the runtime client for `kind`, executing commands the way the host expects.
pub fn build_runtime(kind: RuntimeKind) -> Arc<dyn OciRuntime> {
    Arc::new(CliRuntime::new(
        kind,
        Arc::new(ProcessRunner::new(ShellDialect::for_host())),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_image_ref() {
        let image = ImageRef::new("library", "httpd", "sha256:e449");

        assert_eq!(image.as_str(), "library/httpd@sha256:e449");
        assert_eq!(image.to_string(), "library/httpd@sha256:e449");
    }

    #[test]
    fn parses_runtime_kind() {
        assert_eq!(RuntimeKind::from_str("podman"), Ok(RuntimeKind::Podman));
        assert_eq!(RuntimeKind::from_str("DOCKER"), Ok(RuntimeKind::Docker));
        assert_eq!(
            RuntimeKind::from_str("containerd"),
            Err(UnsupportedRuntime("containerd".to_owned()))
        );
        assert_eq!(RuntimeKind::Podman.to_string(), "podman");
    }
}
