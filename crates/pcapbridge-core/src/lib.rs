//! pcapbridge core library: the packet dispatch bridge between a native
//! packet-capture engine and Rust packet handlers.
//!
//! A capture engine exposes libpcap-shaped primitives ([`NativeCapture`]).
//! The dispatch controller ([`Dispatcher`]) drives them with a single
//! `extern "C"` trampoline, decodes every capture header through the
//! [`HeaderAbi`] bound when the handle was opened, and hands handlers
//! borrowed [`PacketRef`]s that cannot outlive the callback. Handler errors
//! and panics never cross the native boundary: they are parked in a failure
//! slot, optionally vetoed by a [`FailurePolicy`], and re-raised on the
//! calling thread once the native call has returned.
//!
//! Invariants:
//! - Exactly one header layout is bound per handle, chosen at open time.
//! - Packet views are valid only inside the scope that produced them.
//! - After an aborting failure or an interrupt no further handler call is
//!   made by the current blocking call.
//!
//! # Examples
//! ```
//! use pcapbridge_core::{Capture, CaptureConfig, DispatchOutcome, Linktype};
//!
//! let config = CaptureConfig { timeout_ms: 10, ..CaptureConfig::default() };
//! let (mut capture, feeder) = Capture::open_memory(&config, Linktype::ETHERNET)?;
//! feeder.feed(1_700_000_000, 0, vec![0u8; 60])?;
//!
//! let mut sizes = Vec::new();
//! let outcome = capture.dispatch(-1, &mut sizes, |sizes: &mut Vec<usize>, packet| {
//!     sizes.push(packet.data().len());
//!     Ok(())
//! })?;
//! assert_eq!(outcome, DispatchOutcome::Processed(1));
//! assert_eq!(sizes, vec![60]);
//! # Ok::<(), pcapbridge_core::BridgeError>(())
//! ```

use serde::{Deserialize, Serialize};

pub mod abi;
mod bridge;
pub mod capture;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod native;
pub mod packet;
pub mod sink;
pub mod stats;
pub mod summary;

pub use abi::{
    AbiError, AbiVariant, ByteOrder, HeaderAbi, PlatformInfo, TargetOs, TimestampPrecision,
};
pub use capture::Capture;
pub use config::CaptureConfig;
pub use dispatch::{DispatchOutcome, Dispatcher, Interrupter};
pub use error::BridgeError;
pub use handler::{
    ArrayHandler, FailurePolicy, FailureVerdict, FnHandler, HandlerError, HandlerFailure,
    PacketHandler, SinkHandler,
};
pub use native::{
    BreakLoop, Linktype, MemoryCapture, NativeCapture, OfflineCapture, PacketFeeder, RawCallback,
};
pub use packet::{
    HeaderView, OwnedPacket, PacketHeader, PacketRef, Scope, reinterpret_header,
    reinterpret_packet, with_scope,
};
pub use sink::{PacketSink, SavefileWriter};
pub use stats::{CaptureStat, CaptureStatEx, PCAP_STAT_EX_LEN, decode_pcap_stat, decode_pcap_stat_ex};
pub use summary::{SummaryCollector, SummaryError, summarize_offline};

#[cfg(feature = "libpcap")]
pub use native::LibpcapCapture;

/// Current report schema version.
pub const REPORT_VERSION: u32 = 1;
/// Default timestamp used when no capture time is available.
pub const DEFAULT_GENERATED_AT: &str = "1970-01-01T00:00:00Z";

/// Capture summary report with deterministic ordering.
///
/// # Examples
/// ```
/// use pcapbridge_core::{AbiVariant, ByteOrder, HeaderAbi, make_stub_report};
///
/// let abi = HeaderAbi::new(AbiVariant::Legacy32, ByteOrder::Little);
/// let report = make_stub_report("capture.pcap", 123, abi);
/// assert_eq!(report.report_version, pcapbridge_core::REPORT_VERSION);
/// assert_eq!(report.abi.header_len, 16);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    /// Report schema version (not the binary version).
    pub report_version: u32,
    pub tool: ToolInfo,
    /// RFC3339 timestamp of the last packet, or the epoch when unknown.
    pub generated_at: String,
    pub input: InputInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_summary: Option<CaptureSummary>,
    /// Header layout the capture was decoded with.
    pub abi: AbiSummary,
    /// Flow summaries in stable order.
    pub flows: Vec<FlowSummary>,
    /// Engine statistics, when the engine provides them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<CaptureStat>,
}

impl Report {
    /// Serialize as compact or pretty-printed JSON.
    ///
    /// # Errors
    /// Returns the `serde_json` error; reports built by this crate always
    /// serialize.
    pub fn to_json(&self, pretty: bool) -> serde_json::Result<String> {
        if pretty {
            serde_json::to_string_pretty(self)
        } else {
            serde_json::to_string(self)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    /// Tool version (semver).
    pub version: String,
}

/// Input capture metadata embedded in reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputInfo {
    /// Input path as provided to the tool.
    pub path: String,
    /// Input size in bytes.
    pub bytes: u64,
}

/// Packet totals and timestamp bounds.
///
/// # Examples
/// ```
/// use pcapbridge_core::CaptureSummary;
///
/// let summary = CaptureSummary {
///     packets_total: 10,
///     bytes_captured: 600,
///     bytes_on_wire: 600,
///     truncated_packets: 0,
///     linktype: 1,
///     time_start: None,
///     time_end: None,
/// };
/// assert_eq!(summary.packets_total, 10);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSummary {
    pub packets_total: u64,
    pub bytes_captured: u64,
    pub bytes_on_wire: u64,
    /// Packets whose captured length is below the original length.
    pub truncated_packets: u64,
    /// Link-layer header type (`DLT_*`).
    pub linktype: i32,
    /// RFC3339 timestamp of the earliest packet (if any).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_start: Option<String>,
    /// RFC3339 timestamp of the latest packet (if any).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_end: Option<String>,
}

/// Header ABI description embedded in reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbiSummary {
    /// Variant and byte order, e.g. `timeval-64-le`.
    pub variant: String,
    pub header_len: usize,
    pub precision: TimestampPrecision,
}

impl From<HeaderAbi> for AbiSummary {
    fn from(abi: HeaderAbi) -> Self {
        Self {
            variant: abi.name(),
            header_len: abi.header_len(),
            precision: abi.precision(),
        }
    }
}

/// Flow-level summary for a UDP or TCP endpoint pair.
///
/// # Examples
/// ```
/// use pcapbridge_core::FlowSummary;
///
/// let flow = FlowSummary {
///     app_proto: "udp".to_string(),
///     src: "192.168.0.1:5353".to_string(),
///     dst: "224.0.0.251:5353".to_string(),
///     packets: 3,
///     bytes: 120,
///     pps: None,
///     bps: None,
/// };
/// assert_eq!(flow.app_proto, "udp");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSummary {
    /// Transport protocol name (`tcp` or `udp`).
    pub app_proto: String,
    /// Source endpoint in `ip:port` form.
    pub src: String,
    /// Destination endpoint in `ip:port` form.
    pub dst: String,
    pub packets: u64,
    /// Transport payload bytes.
    pub bytes: u64,
    /// Packets per second over the capture interval.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pps: Option<f64>,
    /// Payload bytes per second over the capture interval.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bps: Option<f64>,
}

/// Build a report with base fields filled and empty aggregates.
pub fn make_stub_report(input_path: &str, input_bytes: u64, abi: HeaderAbi) -> Report {
    Report {
        report_version: REPORT_VERSION,
        tool: ToolInfo {
            name: "pcapbridge".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        generated_at: DEFAULT_GENERATED_AT.to_string(),
        input: InputInfo {
            path: input_path.to_string(),
            bytes: input_bytes,
        },
        capture_summary: None,
        abi: abi.into(),
        flows: vec![],
        stats: None,
    }
}
