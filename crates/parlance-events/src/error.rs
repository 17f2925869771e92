use parlance_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventsError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}
