use thiserror::Error;

/// Errors returned by header ABI resolution and decoding.
///
/// # Examples
/// ```
/// use pcapbridge_core::AbiError;
///
/// let err = AbiError::TooShort { needed: 16, actual: 4 };
/// assert!(err.to_string().contains("header too short"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbiError {
    #[error("no capture header layout for {pointer_width}-bit {os} ({precision} precision)")]
    Unresolved {
        pointer_width: u32,
        os: &'static str,
        precision: &'static str,
    },
    #[error("capture header too short: need {needed} bytes, got {actual}")]
    TooShort { needed: usize, actual: usize },
    #[error("{field} value {value} does not fit the {variant} layout")]
    OutOfRange {
        field: &'static str,
        value: i64,
        variant: &'static str,
    },
    #[error("handle produces {engine} headers but the dispatcher is bound to {bound}")]
    Mismatch { bound: String, engine: String },
}
