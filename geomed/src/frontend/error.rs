//! Frontend errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Parser(#[from] super::parser::Error),

    #[error("{0}")]
    Backend(#[from] crate::backend::Error),
}
