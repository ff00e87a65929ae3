//! Duck-typed HTTP error mapping (spec.md §9): a single predicate
//! `is_status_error(code)` so callers can treat 404/409 as recoverable
//! without string matching.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DockerApiError {
    #[error("docker API error: {0}")]
    Bollard(#[from] bollard::errors::Error),

    #[error("hijacked stream error: {0}")]
    Hijack(String),

    #[error("exec demux framing error: {0}")]
    Demux(String),
}

impl DockerApiError {
    /// True if this error is an HTTP status error carrying exactly `code`.
    pub fn is_status_error(&self, code: u16) -> bool {
        matches!(
            self,
            DockerApiError::Bollard(bollard::errors::Error::DockerResponseServerError {
                status_code,
                ..
            }) if *status_code == code as u16
        )
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            DockerApiError::Bollard(bollard::errors::Error::DockerResponseServerError {
                status_code,
                ..
            }) => Some(*status_code as u16),
            _ => None,
        }
    }
}

pub type DockerApiResult<T> = std::result::Result<T, DockerApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_bollard_variants_never_match_status() {
        let err = DockerApiError::Hijack("eof".into());
        assert!(!err.is_status_error(404));
        assert_eq!(err.status_code(), None);
    }
}
