use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use beacon_common::manager::BeaconError;
use beacon_common::registry::RegistryError;

/// The body of most beacond responses. Empty fields are left out.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseResponse {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl BaseResponse {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListProbesResponse {
    pub probes: Vec<String>,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Missing query parameters")]
    MissingParameters,
    #[error("Could not fetch repo {repo} in namespace {namespace}")]
    Repository {
        namespace: String,
        repo: String,
        #[source]
        error: RegistryError,
    },
    #[error("Failed to {action} probe for repo {repo} at namespace {namespace}")]
    Probe {
        action: &'static str,
        namespace: String,
        repo: String,
        #[source]
        error: BeaconError,
    },
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::MissingParameters => StatusCode::BAD_REQUEST,
            ApiError::Repository { error, .. } => error.status_code(),
            ApiError::Probe { error, .. } => match error {
                BeaconError::AlreadyExists { .. } => StatusCode::CONFLICT,
                BeaconError::NotExist { .. } => StatusCode::NOT_FOUND,
                BeaconError::Timeout(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Probe {
                namespace,
                repo,
                error: BeaconError::AlreadyExists { .. },
                ..
            } => format!("Probe already exists for repo {repo} at namespace {namespace}"),
            ApiError::Probe {
                namespace,
                repo,
                error: BeaconError::NotExist { .. },
                ..
            } => format!("Probe not found for repo {repo} at namespace {namespace}"),
            _ => self.to_string(),
        }
    }

    fn detail(&self) -> String {
        match self {
            ApiError::MissingParameters => {
                "Expect namespace and repo query params to be provided".to_owned()
            }
            ApiError::Repository { error, .. } => error.to_string(),
            ApiError::Probe { error, .. } => error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, detail = %self.detail(), "request failed");
        }

        let body = BaseResponse {
            message: self.message(),
            error: self.detail(),
        };

        (status, Json(body)).into_response()
    }
}
