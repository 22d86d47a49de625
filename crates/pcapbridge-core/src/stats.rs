//! Capture statistics (`struct pcap_stat` and the extended `struct
//! pcap_stat_ex`).

use serde::{Deserialize, Serialize};

use crate::abi::layout::{Field, FieldWidth};
use crate::abi::reader::HeaderReader;
use crate::abi::{AbiError, ByteOrder, TargetOs};

const PS_RECV: Field = Field::new(0, FieldWidth::U32);
const PS_DROP: Field = Field::new(4, FieldWidth::U32);
const PS_IFDROP: Field = Field::new(8, FieldWidth::U32);
/// Windows builds append `ps_capt`.
const PS_CAPT: Field = Field::new(12, FieldWidth::U32);

/// Counters reported by a capture handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureStat {
    /// Packets received by the filter.
    pub received: u32,
    /// Packets dropped for lack of buffer space.
    pub dropped: u32,
    /// Packets dropped by the interface or its driver.
    pub if_dropped: u32,
    /// Packets that reached the application; Windows only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captured: Option<u32>,
}

/// Size of `struct pcap_stat` on `os`.
pub const fn pcap_stat_len(os: TargetOs) -> usize {
    match os {
        TargetOs::Windows => PS_CAPT.end(),
        TargetOs::Unix | TargetOs::Darwin => PS_IFDROP.end(),
    }
}

/// Decode a raw `struct pcap_stat` as filled in by `pcap_stats`.
///
/// # Examples
/// ```
/// use pcapbridge_core::{ByteOrder, TargetOs, decode_pcap_stat};
///
/// let mut raw = [0u8; 12];
/// raw[0] = 7;
/// raw[4] = 1;
/// let stat = decode_pcap_stat(&raw, ByteOrder::Little, TargetOs::Unix)?;
/// assert_eq!((stat.received, stat.dropped, stat.captured), (7, 1, None));
/// # Ok::<(), pcapbridge_core::AbiError>(())
/// ```
///
/// # Errors
/// Returns `AbiError::TooShort` when `raw` is smaller than the platform's
/// structure.
pub fn decode_pcap_stat(raw: &[u8], order: ByteOrder, os: TargetOs) -> Result<CaptureStat, AbiError> {
    let reader = HeaderReader::new(raw, order);
    reader.require_len(pcap_stat_len(os))?;
    Ok(CaptureStat {
        received: reader.read_unsigned(PS_RECV) as u32,
        dropped: reader.read_unsigned(PS_DROP) as u32,
        if_dropped: reader.read_unsigned(PS_IFDROP) as u32,
        captured: matches!(os, TargetOs::Windows).then(|| reader.read_unsigned(PS_CAPT) as u32),
    })
}

// `struct pcap_stat_ex` (Npcap `pcap_stats_ex`): six 32-bit counters, then
// 64-bit interface counters in the order of `EX_COUNTERS`.
const PS_EX_SENT: Field = Field::new(16, FieldWidth::U32);
const PS_EX_NETDROP: Field = Field::new(20, FieldWidth::U32);
const EX_COUNTERS_OFFSET: usize = 24;

const fn ex_counter(index: usize) -> Field {
    Field::new(EX_COUNTERS_OFFSET + index * 8, FieldWidth::U64)
}

const EX_COUNTERS: usize = 21;

/// Size of `struct pcap_stat_ex`.
pub const PCAP_STAT_EX_LEN: usize = ex_counter(EX_COUNTERS - 1).end();

/// Extended counters from `pcap_stats_ex`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureStatEx {
    pub received: u32,
    pub dropped: u32,
    pub if_dropped: u32,
    pub captured: u32,
    /// Packets sent by the handle.
    pub sent: u32,
    /// Packets dropped by the network.
    pub net_dropped: u32,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
    pub multicast: u64,
    pub collisions: u64,
    pub rx_length_errors: u64,
    pub rx_over_errors: u64,
    pub rx_crc_errors: u64,
    pub rx_frame_errors: u64,
    pub rx_fifo_errors: u64,
    pub rx_missed_errors: u64,
    pub tx_aborted_errors: u64,
    pub tx_carrier_errors: u64,
    pub tx_fifo_errors: u64,
    pub tx_heartbeat_errors: u64,
    pub tx_window_errors: u64,
}

impl CaptureStatEx {
    /// The `struct pcap_stat` subset, as Windows reports it.
    pub fn basic(&self) -> CaptureStat {
        CaptureStat {
            received: self.received,
            dropped: self.dropped,
            if_dropped: self.if_dropped,
            captured: Some(self.captured),
        }
    }
}

/// Decode a raw `struct pcap_stat_ex`.
///
/// # Errors
/// Returns `AbiError::TooShort` when `raw` is smaller than
/// [`PCAP_STAT_EX_LEN`].
pub fn decode_pcap_stat_ex(raw: &[u8], order: ByteOrder) -> Result<CaptureStatEx, AbiError> {
    let reader = HeaderReader::new(raw, order);
    reader.require_len(PCAP_STAT_EX_LEN)?;
    let u32_at = |field| reader.read_unsigned(field) as u32;
    let counter = |index| reader.read_unsigned(ex_counter(index));
    Ok(CaptureStatEx {
        received: u32_at(PS_RECV),
        dropped: u32_at(PS_DROP),
        if_dropped: u32_at(PS_IFDROP),
        captured: u32_at(PS_CAPT),
        sent: u32_at(PS_EX_SENT),
        net_dropped: u32_at(PS_EX_NETDROP),
        rx_packets: counter(0),
        tx_packets: counter(1),
        rx_bytes: counter(2),
        tx_bytes: counter(3),
        rx_errors: counter(4),
        tx_errors: counter(5),
        rx_dropped: counter(6),
        tx_dropped: counter(7),
        multicast: counter(8),
        collisions: counter(9),
        rx_length_errors: counter(10),
        rx_over_errors: counter(11),
        rx_crc_errors: counter(12),
        rx_frame_errors: counter(13),
        rx_fifo_errors: counter(14),
        rx_missed_errors: counter(15),
        tx_aborted_errors: counter(16),
        tx_carrier_errors: counter(17),
        tx_fifo_errors: counter(18),
        tx_heartbeat_errors: counter(19),
        tx_window_errors: counter(20),
    })
}
