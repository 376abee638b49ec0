use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde_derive::Deserialize;

use beacon_common::manager::{BeaconDescription, BeaconError};
use beacon_common::probe::{probe_key, ProbeSnapshot};

use super::AppState;
use crate::api::{ApiError, BaseResponse, ListProbesResponse};

#[derive(Debug, Default, Deserialize)]
pub struct ProbeParams {
    namespace: Option<String>,
    repo: Option<String>,
}

impl ProbeParams {
    /// Both parameters, or `MissingParameters` if either is absent or empty.
    fn require(self) -> Result<(String, String), ApiError> {
        match (self.namespace, self.repo) {
            (Some(namespace), Some(repo)) if !namespace.is_empty() && !repo.is_empty() => {
                Ok((namespace, repo))
            }
            _ => Err(ApiError::MissingParameters),
        }
    }
}

pub async fn list(State(state): State<AppState>) -> Json<ListProbesResponse> {
    let mut probes = state.manager.list_probes();
    probes.sort();

    Json(ListProbesResponse { probes })
}

pub async fn describe(State(state): State<AppState>) -> Json<BeaconDescription> {
    let mut description = state.manager.describe();
    description.probes.sort();

    Json(description)
}

pub async fn get(
    State(state): State<AppState>,
    Query(params): Query<ProbeParams>,
) -> Result<Json<ProbeSnapshot>, ApiError> {
    let (namespace, repo) = params.require()?;

    match state.manager.get_probe(&namespace, &repo) {
        Some(snapshot) => Ok(Json(snapshot)),
        None => Err(ApiError::Probe {
            action: "find",
            error: BeaconError::NotExist {
                key: probe_key(&namespace, &repo),
            },
            namespace,
            repo,
        }),
    }
}

/// Check the repository with the registry, then start probing it.
pub async fn create(
    State(state): State<AppState>,
    Query(params): Query<ProbeParams>,
) -> Result<(StatusCode, Json<BaseResponse>), ApiError> {
    let (namespace, repo) = params.require()?;

    if let Err(error) = state.manager.registry().test_repo(&namespace, &repo).await {
        return Err(ApiError::Repository {
            namespace,
            repo,
            error,
        });
    }

    if let Err(error) = state
        .manager
        .start_probe(&namespace, &repo, state.poll_interval)
    {
        return Err(ApiError::Probe {
            action: "create",
            namespace,
            repo,
            error,
        });
    }

    Ok((
        StatusCode::CREATED,
        Json(BaseResponse::message(format!(
            "Probe successfully created for repo {repo} at namespace {namespace}"
        ))),
    ))
}

pub async fn delete(
    State(state): State<AppState>,
    Query(params): Query<ProbeParams>,
) -> Result<(StatusCode, Json<BaseResponse>), ApiError> {
    let (namespace, repo) = params.require()?;

    if let Err(error) = state
        .manager
        .stop_probe(&namespace, &repo, state.stop_timeout)
        .await
    {
        return Err(ApiError::Probe {
            action: "delete",
            namespace,
            repo,
            error,
        });
    }

    Ok((
        StatusCode::CREATED,
        Json(BaseResponse::message(format!(
            "Probe successfully deleted for repo {repo} at namespace {namespace}"
        ))),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(namespace: Option<&str>, repo: Option<&str>) -> ProbeParams {
        ProbeParams {
            namespace: namespace.map(str::to_owned),
            repo: repo.map(str::to_owned),
        }
    }

    #[test]
    fn requires_both_parameters() {
        assert_eq!(
            params(Some("acme"), Some("app")).require().unwrap(),
            ("acme".to_owned(), "app".to_owned())
        );
        assert!(matches!(
            params(Some("acme"), None).require(),
            Err(ApiError::MissingParameters)
        ));
        assert!(matches!(
            params(Some(""), Some("app")).require(),
            Err(ApiError::MissingParameters)
        ));
        assert!(matches!(
            ProbeParams::default().require(),
            Err(ApiError::MissingParameters)
        ));
    }
}
