//! Error types for the docseal core library

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Certificate parse error: {0}")]
    Certificate(String),

    #[error("Unsupported digest method: {0}")]
    UnsupportedDigestMethod(String),

    #[error("Digest length mismatch: expected {expected} bytes, got {actual}")]
    DigestLength { expected: usize, actual: usize },
}
