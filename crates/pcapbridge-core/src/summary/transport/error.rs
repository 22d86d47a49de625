use thiserror::Error;

/// Errors returned by transport decoding.
///
/// Note: this error type lives in an internal module; the example is
/// illustrative and not compiled as a public doctest.
///
/// # Examples
/// ```text
/// use pcapbridge_core::summary::transport::error::TransportError;
///
/// let err = TransportError::MissingNetworkLayer;
/// assert!(err.to_string().contains("missing network layer"));
/// ```
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("packet slice error: {0}")]
    Slice(String),
    #[error("missing network layer in packet")]
    MissingNetworkLayer,
    #[error("missing IP payload in packet")]
    MissingIpPayload,
    #[error("segment too short: need {needed} bytes, got {actual}")]
    TooShort { needed: usize, actual: usize },
}
