use thiserror::Error;

/// Failure opening or reading a trace file.
///
/// # Examples
/// ```text
/// use pcapbridge_core::native::offline::OfflineError;
///
/// let err = OfflineError::Pcap {
///     context: "pcap reader init",
///     message: "bad magic".to_string(),
/// };
/// assert_eq!(err.to_string(), "PCAP parse error (pcap reader init): bad magic");
/// ```
#[derive(Debug, Error)]
pub enum OfflineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PCAP parse error ({context}): {message}")]
    Pcap {
        context: &'static str,
        message: String,
    },
}
