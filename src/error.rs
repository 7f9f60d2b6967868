//! The error taxonomy for the core: every fallible public entry point returns
//! one of these variants. None of them are retried internally and none are
//! recoverable -- see the module docs on `btree::cursor` for what happens to
//! a cursor after one of these is raised.

use crate::page::PageNum;

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("invalid database: {0}")]
    InvalidDatabase(String),

    #[error("corrupt page {page}: {reason}")]
    CorruptPage { page: PageNum, reason: String },

    #[error("crypto failure: {0}")]
    CryptoFailure(String),

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
