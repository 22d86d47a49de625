//! Capture summary: a packet handler that aggregates totals, timestamp
//! bounds and per-flow counters into a deterministic [`Report`].

use std::collections::HashMap;
use std::path::Path;

use pcap_parser::Linktype;
use thiserror::Error;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::abi::HeaderAbi;
use crate::capture::Capture;
use crate::error::BridgeError;
use crate::handler::{HandlerError, PacketHandler};
use crate::packet::{PacketHeader, PacketRef};
use crate::{CaptureSummary, DEFAULT_GENERATED_AT, Report, make_stub_report};

mod flows;
pub mod transport;

use flows::{FlowKey, FlowStats, add_flow_stats, build_flow_summaries};
use transport::parse_transport_packet;

#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("capture error: {0}")]
    Capture(#[from] BridgeError),
}

/// Aggregates every packet it is handed.
#[derive(Debug)]
pub struct SummaryCollector {
    linktype: Linktype,
    packets_total: u64,
    bytes_captured: u64,
    bytes_on_wire: u64,
    truncated_packets: u64,
    first_ts: Option<i128>,
    last_ts: Option<i128>,
    flows: HashMap<FlowKey, FlowStats>,
}

impl SummaryCollector {
    pub fn new(linktype: Linktype) -> Self {
        Self {
            linktype,
            packets_total: 0,
            bytes_captured: 0,
            bytes_on_wire: 0,
            truncated_packets: 0,
            first_ts: None,
            last_ts: None,
            flows: HashMap::new(),
        }
    }

    pub fn packets_total(&self) -> u64 {
        self.packets_total
    }

    pub fn observe(&mut self, header: &PacketHeader, data: &[u8]) {
        self.packets_total += 1;
        self.bytes_captured += data.len() as u64;
        self.bytes_on_wire += u64::from(header.len);
        if header.caplen < header.len {
            self.truncated_packets += 1;
        }

        let ts = header.timestamp_nanos();
        self.first_ts = Some(self.first_ts.map_or(ts, |first| first.min(ts)));
        self.last_ts = Some(self.last_ts.map_or(ts, |last| last.max(ts)));

        if let Ok(Some(packet)) = parse_transport_packet(self.linktype, data) {
            add_flow_stats(&mut self.flows, &packet);
        }
    }

    /// Build the report for an input of `input_bytes` bytes at `input_path`.
    pub fn finish(self, input_path: &str, input_bytes: u64, abi: HeaderAbi) -> Report {
        let mut report = make_stub_report(input_path, input_bytes, abi);
        report.capture_summary = Some(CaptureSummary {
            packets_total: self.packets_total,
            bytes_captured: self.bytes_captured,
            bytes_on_wire: self.bytes_on_wire,
            truncated_packets: self.truncated_packets,
            linktype: self.linktype.0,
            time_start: ts_to_rfc3339(self.first_ts),
            time_end: ts_to_rfc3339(self.last_ts),
        });
        report.generated_at = report
            .capture_summary
            .as_ref()
            .and_then(|summary| summary.time_end.clone().or(summary.time_start.clone()))
            .unwrap_or_else(|| DEFAULT_GENERATED_AT.to_string());

        let duration_s = match (self.first_ts, self.last_ts) {
            (Some(start), Some(end)) if end > start => Some((end - start) as f64 / 1e9),
            _ => None,
        };
        report.flows = build_flow_summaries(self.flows, duration_s);
        report
    }
}

impl<U: ?Sized> PacketHandler<U> for SummaryCollector {
    fn handle_packet(&mut self, _user: &mut U, packet: PacketRef<'_>) -> Result<(), HandlerError> {
        self.observe(&packet.header().decode(), packet.data());
        Ok(())
    }
}

/// Summarize up to `count` packets of a trace file (`count <= 0`: all).
///
/// # Examples
/// ```no_run
/// use std::path::Path;
///
/// use pcapbridge_core::summarize_offline;
///
/// let report = summarize_offline(Path::new("capture.pcapng"), -1)?;
/// println!("report version: {}", report.report_version);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
///
/// # Errors
/// Returns `SummaryError` when the file cannot be read.
pub fn summarize_offline(path: &Path, count: i32) -> Result<Report, SummaryError> {
    let mut capture = Capture::open_offline(path)?;
    let mut collector = SummaryCollector::new(capture.datalink());
    capture.loop_with(count, &mut (), &mut collector)?;
    let input_bytes = path.metadata()?.len();
    Ok(collector.finish(&path.display().to_string(), input_bytes, capture.abi()))
}

fn ts_to_rfc3339(ts: Option<i128>) -> Option<String> {
    let ts = ts?;
    let dt = OffsetDateTime::from_unix_timestamp_nanos(ts).ok()?;
    dt.format(&Rfc3339).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{AbiVariant, ByteOrder, TimestampPrecision};
    use etherparse::PacketBuilder;

    fn udp_frame(payload: &[u8]) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([192, 168, 0, 1], [192, 168, 0, 2], 64)
            .udp(4000, 5000);
        let mut packet = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut packet, payload).unwrap();
        packet
    }

    #[test]
    fn collector_tracks_totals_and_bounds() {
        let mut collector = SummaryCollector::new(Linktype::ETHERNET);
        let frame = udp_frame(&[0u8; 10]);
        let len = frame.len() as u32;
        collector.observe(
            &PacketHeader::new(2, 0, TimestampPrecision::Micro, len, len),
            &frame,
        );
        collector.observe(
            &PacketHeader::new(1, 500_000, TimestampPrecision::Micro, len, len + 4),
            &frame,
        );

        let abi = HeaderAbi::new(AbiVariant::Timeval64, ByteOrder::Little);
        let report = collector.finish("capture.pcap", 99, abi);
        let summary = report.capture_summary.unwrap();
        assert_eq!(summary.packets_total, 2);
        assert_eq!(summary.truncated_packets, 1);
        assert_eq!(summary.bytes_on_wire, u64::from(len) * 2 + 4);
        assert_eq!(summary.time_start.as_deref(), Some("1970-01-01T00:00:01.5Z"));
        assert_eq!(summary.time_end.as_deref(), Some("1970-01-01T00:00:02Z"));
        assert_eq!(report.generated_at, "1970-01-01T00:00:02Z");
        assert_eq!(report.abi.variant, "timeval-64-le");
        assert_eq!(report.flows.len(), 1);
        assert_eq!(report.flows[0].packets, 2);
        assert_eq!(report.flows[0].pps, Some(4.0));
    }

    #[test]
    fn empty_capture_uses_default_generated_at() {
        let collector = SummaryCollector::new(Linktype::ETHERNET);
        let abi = HeaderAbi::new(AbiVariant::Legacy32, ByteOrder::Big);
        let report = collector.finish("empty.pcap", 24, abi);
        assert_eq!(report.generated_at, DEFAULT_GENERATED_AT);
        assert!(report.flows.is_empty());
    }
}
