use axum::http::StatusCode;
use thiserror::Error;
use tracing::error;

/// Failure of a server operation, independent of the HTTP edge.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,

    #[error("forbidden")]
    Forbidden,

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Invalid(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ApiError> for StatusCode {
    fn from(err: ApiError) -> Self {
        if let ApiError::Internal(e) = &err {
            error!("Internal error: {:#}", e);
        }
        err.status()
    }
}
