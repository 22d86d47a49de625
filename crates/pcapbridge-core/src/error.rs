use thiserror::Error;

use crate::abi::AbiError;
use crate::handler::HandlerError;
use crate::native::offline::OfflineError;

/// Errors surfaced by capture handles and the dispatch controller.
///
/// # Examples
/// ```
/// use pcapbridge_core::BridgeError;
///
/// let err = BridgeError::Native {
///     context: "pcap_dispatch",
///     message: "read error".to_string(),
/// };
/// assert_eq!(err.to_string(), "pcap_dispatch: read error");
/// ```
#[derive(Debug, Error)]
pub enum BridgeError {
    /// No header layout is known for the handle's platform, or the handle
    /// produces a different layout than the dispatcher was bound to.
    #[error("capture header ABI: {0}")]
    Abi(#[from] AbiError),
    /// `next_ex` read timeout expired without a packet.
    #[error("timed out waiting for a packet")]
    Timeout,
    /// A native primitive reported an error; `message` is the handle's last
    /// error text.
    #[error("{context}: {message}")]
    Native {
        context: &'static str,
        message: String,
    },
    /// A handler failed and the failure policy asked to abort.
    #[error("packet handler failed: {0}")]
    Handler(#[source] HandlerError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("capture file error: {0}")]
    Capture(String),
}

impl BridgeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BridgeError::Timeout)
    }
}

impl From<OfflineError> for BridgeError {
    fn from(value: OfflineError) -> Self {
        match value {
            OfflineError::Io(err) => BridgeError::Io(err),
            OfflineError::Pcap { context, message } => {
                BridgeError::Capture(format!("{context}: {message}"))
            }
        }
    }
}
