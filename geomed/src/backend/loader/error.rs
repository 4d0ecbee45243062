//! Loader errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Xml(#[from] quick_xml::Error),

    #[error("{0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Url(#[from] url::ParseError),

    #[error("join error")]
    Join(#[from] tokio::task::JoinError),

    #[error("missing query parameter: {0}")]
    MissingParameter(&'static str),

    #[error("\"{0}\" not found on the server")]
    LayerNotFound(String),

    #[error("no usable output format, server offers: {0}")]
    FormatUnsupported(String),

    #[error("no records available to report")]
    NoFeatures,

    #[error("unexpected response: {0}")]
    InvalidResponse(String),

    #[error("{0}")]
    Subprocess(String),

    #[error("{0}")]
    Failed(String),
}
