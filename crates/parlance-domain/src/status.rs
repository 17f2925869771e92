//! Status-carrying errors.
//!
//! The triggering entry points attach an HTTP-style status to their error
//! chains; the API layer recovers it with [`status_code`] no matter how many
//! context wraps were added in between. The most recently attached status
//! wins; a chain without one reads as 500.

use std::fmt;

/// Context value carrying an HTTP-style status through an `anyhow` chain.
#[derive(Debug)]
pub struct StatusError {
    status: u16,
    message: String,
}

impl StatusError {
    pub fn status(&self) -> u16 {
        self.status
    }
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StatusError {}

/// Build a fresh error with a status and message.
pub fn status_error(status: u16, message: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(StatusError { status, message: message.into() })
}

/// Attach a status to an existing chain without changing its message.
pub fn with_status(status: u16, err: anyhow::Error) -> anyhow::Error {
    let message = err.to_string();
    err.context(StatusError { status, message })
}

/// Wrap a chain in a new message and attach a status to it.
pub fn wrap_with_status(
    status: u16,
    message: impl Into<String>,
    err: anyhow::Error,
) -> anyhow::Error {
    err.context(StatusError { status, message: message.into() })
}

/// Recover the most recently attached status; 500 when none is present.
pub fn status_code(err: &anyhow::Error) -> u16 {
    err.downcast_ref::<StatusError>()
        .map(StatusError::status)
        .unwrap_or(500)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn bare_chain_reads_as_500() {
        let err = anyhow!("boom").context("while doing a thing");
        assert_eq!(status_code(&err), 500);
    }

    #[test]
    fn status_survives_deep_wrapping() {
        let err = with_status(404, anyhow!("installation not found"));
        let err = err
            .context("resolving backup target")
            .context("validating request")
            .context("handling trigger")
            .context("api layer");
        assert_eq!(status_code(&err), 404);
        let chain = format!("{err:#}");
        assert!(chain.contains("installation not found"));
        assert!(chain.contains("validating request"));
    }

    #[test]
    fn most_recent_status_wins() {
        let err = status_error(404, "no such backup");
        let err = err.context("a").context("b").context("c").context("d");
        let err = wrap_with_status(400, "backup not usable for restoration", err);
        assert_eq!(status_code(&err), 400);
        assert_eq!(err.to_string(), "backup not usable for restoration");
    }

    #[test]
    fn with_status_keeps_message() {
        let err = with_status(400, anyhow!("installation is not hibernating"));
        assert_eq!(err.to_string(), "installation is not hibernating");
        assert_eq!(status_code(&err), 400);
    }
}
