use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use reqwest::header;
use serde_derive::Deserialize;
use time::OffsetDateTime;
use url::Url;

use super::{Registry, RegistryError};

/// A repository tag as listed by the Docker Hub tags API.
/// See https://docs.docker.com/docker-hub/api/latest/#tag/repositories
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Tag {
    pub name: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub tag_last_pushed: Option<OffsetDateTime>,
    #[serde(default)]
    pub images: Vec<Image>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Image {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub digest: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_pushed: Option<OffsetDateTime>,
}

impl Tag {
    /// The most recently pushed image of this tag. The first one listed wins ties.
    pub fn latest_image(&self) -> Option<&Image> {
        self.images
            .iter()
            .filter(|image| !image.digest.is_empty())
            .reduce(|latest, image| {
                if image.last_pushed > latest.last_pushed {
                    image
                } else {
                    latest
                }
            })
    }
}

/// Keep whichever of `latest` and `candidates` was pushed most recently.
fn newer_tag(latest: Option<Tag>, candidates: Vec<Tag>) -> Option<Tag> {
    candidates.into_iter().fold(latest, |latest, tag| match latest {
        Some(current) if tag.tag_last_pushed <= current.tag_last_pushed => Some(current),
        _ => Some(tag),
    })
}

#[derive(Debug, Deserialize)]
struct TagsPage {
    #[serde(default)]
    count: usize,
    next: Option<String>,
    #[serde(default)]
    results: Vec<Tag>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    detail: String,
}

impl ErrorBody {
    fn into_message(self) -> String {
        if self.message.is_empty() {
            self.detail
        } else {
            self.message
        }
    }
}

/// Registry client for Docker Hub's public v2 API.
pub struct DockerHubRegistry {
    base_url: Url,
    client: reqwest::Client,
}

impl DockerHubRegistry {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, RegistryError> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("beacond")
            .timeout(request_timeout)
            .build()
            .map_err(|error| RegistryError::Request {
                endpoint: base_url.to_string(),
                error,
            })?;

        Ok(Self { base_url, client })
    }

    // The tags endpoint does not require authentication, so it doubles as the existence check.
    fn tags_endpoint(&self, namespace: &str, repo: &str) -> Result<Url, RegistryError> {
        Ok(self
            .base_url
            .join(&format!("v2/namespaces/{namespace}/repositories/{repo}/tags"))?)
    }

    async fn get(
        &self,
        endpoint: &str,
        namespace: &str,
        repo: &str,
    ) -> Result<reqwest::Response, RegistryError> {
        let response = self
            .client
            .get(endpoint)
            .send()
            .await
            .map_err(|error| RegistryError::Request {
                endpoint: endpoint.to_owned(),
                error,
            })?;

        let status = response.status();
        if !(status.is_client_error() || status.is_server_error()) {
            return Ok(response);
        }

        let message = response
            .json::<ErrorBody>()
            .await
            .unwrap_or_default()
            .into_message();

        Err(classify_failure(status, namespace, repo, message))
    }
}

fn classify_failure(
    status: StatusCode,
    namespace: &str,
    repo: &str,
    message: String,
) -> RegistryError {
    let namespace = namespace.to_owned();
    let repo = repo.to_owned();

    if status == StatusCode::NOT_FOUND {
        RegistryError::NotFound {
            namespace,
            repo,
            message,
        }
    } else if status.is_client_error() {
        RegistryError::Client {
            namespace,
            repo,
            status,
            message,
        }
    } else {
        RegistryError::Server {
            namespace,
            repo,
            status,
            message,
        }
    }
}

#[async_trait]
impl Registry for DockerHubRegistry {
    async fn latest_image_digest(
        &self,
        namespace: &str,
        repo: &str,
    ) -> Result<String, RegistryError> {
        let mut endpoint = self.tags_endpoint(namespace, repo)?.to_string();
        let mut latest: Option<Tag> = None;
        let mut tags_checked = 0;

        loop {
            let page: TagsPage = self
                .get(&endpoint, namespace, repo)
                .await?
                .json()
                .await
                .map_err(|error| RegistryError::Decode {
                    endpoint: endpoint.clone(),
                    error,
                })?;

            let page_size = page.results.len();
            tags_checked += page_size;
            latest = newer_tag(latest, page.results);

            match page.next {
                Some(next) if page_size > 0 && tags_checked < page.count && !next.is_empty() => {
                    endpoint = next
                }
                _ => break,
            }
        }

        let tag = latest.ok_or_else(|| RegistryError::NoTags {
            namespace: namespace.to_owned(),
            repo: repo.to_owned(),
        })?;

        let digest = tag.latest_image().map(|image| image.digest.clone());

        digest.ok_or(RegistryError::NoImages { tag: tag.name })
    }

    async fn test_repo(&self, namespace: &str, repo: &str) -> Result<(), RegistryError> {
        let endpoint = self.tags_endpoint(namespace, repo)?;

        self.get(endpoint.as_str(), namespace, repo).await?;

        Ok(())
    }

    fn url(&self) -> String {
        self.base_url.as_str().trim_end_matches('/').to_owned()
    }
}
