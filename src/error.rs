//! The error taxonomy of §7: one enum, one place that knows how to turn a
//! variant into an HTTP status and a JSON body.

use crate::http_server::{Response, StatusCode};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("session {0} not found")]
    NotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upstream remote returned an error: {0}")]
    Upstream(String),

    #[error("backpressure: input queue is full")]
    Backpressure,
}

impl CoreError {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::InvalidArgument(_) | Self::Backpressure => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Renders this error as the JSON body the HTTP API returns.
    #[must_use]
    pub fn into_response(self) -> Response<String> {
        #[derive(Serialize)]
        struct Body {
            success: bool,
            error: String,
        }

        let status = self.status();
        let body = Body {
            success: false,
            error: self.to_string(),
        };
        let json = serde_json::to_string(&body).unwrap_or_else(|_| "{}".to_string());

        let mut builder = Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .header("Access-Control-Allow-Origin", "*");

        if matches!(self, Self::Unauthorized) {
            builder = builder.header("WWW-Authenticate", "Bearer realm=\"VibeTunnel\"");
        }

        builder.body(json).expect("response body is well-formed")
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
