use thiserror::Error;

/// Failures of a single endpoint call or of evaluating its response.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EtlError {
    #[error("transient failure calling {endpoint}: {message}")]
    Transient { endpoint: String, message: String },

    #[error("{endpoint} rejected the request (http {status}): {message}")]
    Rejected {
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("invalid payload from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },

    #[error("{endpoint} response has no result set {result_set}")]
    MissingResultSet { endpoint: String, result_set: String },

    #[error("{endpoint} result set {result_set} has no field {field}")]
    MissingField {
        endpoint: String,
        result_set: String,
        field: String,
    },

    #[error("{label} failed after {attempts} attempts: {last}")]
    ExhaustedRetries {
        label: String,
        attempts: u32,
        last: String,
    },

    #[error("endpoint {0} is not in the catalog")]
    UnknownEndpoint(String),
}

impl EtlError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EtlError::Transient { .. } | EtlError::Decode { .. })
    }

    /// Contract violations point at a broken assumption, not a flaky upstream.
    pub fn is_schema_violation(&self) -> bool {
        matches!(
            self,
            EtlError::MissingResultSet { .. } | EtlError::MissingField { .. }
        )
    }
}
