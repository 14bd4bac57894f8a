//! Error taxonomy with HTTP status mapping.
//!
//! Internal failures (database, redis, docker) are logged with full detail
//! and surfaced to clients as a generic message; container ids never appear
//! in response bodies.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;

/// Which admission predicate rejected a create request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaScope {
    User,
    Credential,
    System,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Unauthenticated(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{}", quota_message(.scope, *.limit))]
    QuotaExceeded { scope: QuotaScope, limit: i64 },

    #[error("container startup failed: {status} (exit code {exit_code})")]
    ContainerStartupFailed {
        exit_code: i64,
        status: String,
        tail_logs: String,
    },

    #[error("expose failed: {0}")]
    ExposeFailed(String),

    #[error("no host ports available")]
    NoPortsAvailable,

    #[error("{service} unavailable")]
    Degraded { service: &'static str },

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Ephemeral(#[from] redis::RedisError),

    #[error(transparent)]
    Runtime(#[from] bollard::errors::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn quota_message(scope: &QuotaScope, limit: i64) -> String {
    match scope {
        QuotaScope::User => format!("Maximum sandboxes limit reached ({limit})"),
        QuotaScope::Credential => format!("Maximum sandboxes per API key reached ({limit})"),
        QuotaScope::System => format!("System sandbox capacity reached ({limit})"),
    }
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::ContainerStartupFailed { .. }
            | Error::ExposeFailed(_)
            | Error::NoPortsAvailable => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Degraded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Database(_) | Error::Ephemeral(_) | Error::Runtime(_) | Error::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = match &self {
            Error::Database(e) => {
                error!("database error: {e}");
                serde_json::json!({ "error": "internal server error" })
            }
            Error::Ephemeral(e) => {
                error!("ephemeral store error: {e}");
                serde_json::json!({ "error": "internal server error" })
            }
            Error::Runtime(e) => {
                error!("container runtime error: {e}");
                serde_json::json!({ "error": "internal server error" })
            }
            Error::Other(e) => {
                error!("internal error: {e:#}");
                serde_json::json!({ "error": "internal server error" })
            }
            Error::ContainerStartupFailed {
                exit_code,
                status,
                tail_logs,
            } => serde_json::json!({
                "error": self.to_string(),
                "exitCode": exit_code,
                "containerStatus": status,
                "logs": tail_logs,
            }),
            _ => serde_json::json!({ "error": self.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        let cases = [
            (Error::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (Error::Unauthenticated("x".into()), StatusCode::UNAUTHORIZED),
            (Error::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (Error::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                Error::QuotaExceeded {
                    scope: QuotaScope::User,
                    limit: 2,
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (Error::NoPortsAvailable, StatusCode::INTERNAL_SERVER_ERROR),
            (
                Error::Degraded { service: "redis" },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(error.status(), expected);
        }
    }

    #[test]
    fn user_quota_message_names_the_limit() {
        let err = Error::QuotaExceeded {
            scope: QuotaScope::User,
            limit: 2,
        };
        assert_eq!(err.to_string(), "Maximum sandboxes limit reached (2)");
    }

    #[test]
    fn internal_errors_do_not_leak_detail() {
        let err = Error::Other(anyhow::anyhow!("container abc123 exploded"));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
