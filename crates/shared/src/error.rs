//! Error types for linesync shared values

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("namespace must not be empty")]
    EmptyNamespace,
}
