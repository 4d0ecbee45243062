//! Backend errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("{0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("{0}")]
    CreatePool(#[from] deadpool_postgres::CreatePoolError),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Json(#[from] serde_json::Error),

    #[error("loader: {0}")]
    Loader(#[from] super::loader::Error),

    #[error("unknown data status: \"{0}\"")]
    UnknownStatus(String),

    #[error("notification listener disconnected")]
    ListenerClosed,
}
