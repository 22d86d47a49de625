//! Capture handle configuration.

use serde::{Deserialize, Serialize};

use crate::abi::TimestampPrecision;

/// Options applied when a live-like handle is opened.
///
/// Offline handles take their parameters from the trace file instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Maximum bytes captured per packet.
    pub snaplen: u32,
    /// Read timeout in milliseconds; `0` blocks until a packet arrives.
    pub timeout_ms: u64,
    pub promiscuous: bool,
    /// Kernel buffer size in bytes for libpcap handles, or queued packets
    /// for in-memory handles. `0` keeps the engine default.
    pub buffer_size: u32,
    pub immediate_mode: bool,
    pub precision: TimestampPrecision,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            snaplen: 65535,
            timeout_ms: 1000,
            promiscuous: true,
            buffer_size: 0,
            immediate_mode: true,
            precision: TimestampPrecision::Micro,
        }
    }
}
