//! Parser error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    PgQuery(#[from] pg_query::Error),
}
