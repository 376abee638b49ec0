use std::sync::Arc;

use async_trait::async_trait;

use super::{CommandRunner, ContainerStatus, ImageRef, OciError, OciRuntime, RuntimeKind};

/// Drives a docker-compatible engine through its command line.
pub struct CliRuntime {
    kind: RuntimeKind,
    runner: Arc<dyn CommandRunner>,
}

impl CliRuntime {
    pub fn new(kind: RuntimeKind, runner: Arc<dyn CommandRunner>) -> Self {
        Self { kind, runner }
    }

    async fn engine(&self, args: &[&str]) -> Result<String, OciError> {
        let args: Vec<String> = args.iter().map(|arg| (*arg).to_owned()).collect();

        self.runner.run(self.kind.binary(), &args).await
    }

    pub async fn stop_container(&self, container_id: &str) -> Result<(), OciError> {
        self.engine(&["stop", container_id]).await?;

        Ok(())
    }
}

#[async_trait]
impl OciRuntime for CliRuntime {
    async fn pull_image(&self, image: &ImageRef) -> Result<(), OciError> {
        self.engine(&["pull", image.as_str()]).await?;

        Ok(())
    }

    async fn run_image(&self, image: &ImageRef) -> Result<(), OciError> {
        self.engine(&["run", "--detach", image.as_str()]).await?;

        Ok(())
    }

    async fn stop_containers_by_image(&self, image: &ImageRef) -> Result<(), OciError> {
        let containers = self
            .containers_using_image(image, &[ContainerStatus::Running])
            .await?;

        for container in containers {
            if let Err(error) = self.stop_container(&container).await {
                tracing::error!(
                    container = %container,
                    image = %image,
                    %error,
                    "failed to stop container"
                );
            }
        }

        Ok(())
    }

    async fn containers_using_image(
        &self,
        image: &ImageRef,
        statuses: &[ContainerStatus],
    ) -> Result<Vec<String>, OciError> {
        let ancestor = format!("--filter=ancestor={image}");
        let status_filters: Vec<String> = statuses
            .iter()
            .map(|status| format!("--filter=status={}", status.as_str()))
            .collect();

        let mut args = vec!["ps", "--quiet", "--no-trunc"];
        if !statuses.is_empty() {
            // Without --all the engines only ever list running containers.
            args.push("--all");
        }
        args.push(&ancestor);
        args.extend(status_filters.iter().map(String::as_str));

        let output = self.engine(&args).await?;

        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect())
    }

    async fn check_exists(&self) -> Result<bool, OciError> {
        let output = self.engine(&["--version"]).await?;

        if output.to_lowercase().contains("version") {
            Ok(true)
        } else {
            Err(OciError::Unrecognised {
                command: format!("{} --version", self.kind.binary()),
                output,
            })
        }
    }

    fn runtime_type(&self) -> RuntimeKind {
        self.kind
    }
}
