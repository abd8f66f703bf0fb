use axum::{http::StatusCode, response::IntoResponse};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("No usable proxies: {0}")]
    NoProxies(String),

    /// Every attempt of a pooled request failed.
    #[error("Request exhausted after {attempts} attempts: {last_error}")]
    RequestExhausted { attempts: usize, last_error: String },

    #[error("Upstream returned HTTP {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Challenge solve failed: {0}")]
    Challenge(String),

    #[error("Malformed listing: {0}")]
    MalformedListing(String),

    #[error("Gift metadata missing: {0}")]
    MetadataMissing(String),

    #[error("Session token unavailable: {0}")]
    TokenUnavailable(String),

    #[error("Resource pool is closed")]
    PoolClosed,

    #[error("Cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::Database(_) | AppError::Migration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Config(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
