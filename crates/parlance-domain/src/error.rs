use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid dns name: {0}")]
    InvalidDns(String),

    #[error("unknown resource type: {0}")]
    UnknownResourceType(String),
}
