use std::io::{Read, Seek, SeekFrom};

use pcap_parser::Linktype;

use crate::abi::TimestampPrecision;

use super::error::OfflineError;
use super::layout;

/// Per-interface state collected from pcapng interface description blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interface {
    pub linktype: Linktype,
    pub snaplen: u32,
    pub units_per_second: u64,
}

/// Read the magic bytes and rewind the reader to the start.
///
/// # Examples
/// This helper is part of an internal module, so the example is marked as
/// text example.
/// ```text
/// use pcapbridge_core::native::offline::reader::read_magic_and_rewind;
/// use std::io::Cursor;
///
/// let bytes = [0x0a, 0x0d, 0x0d, 0x0a, 0x01];
/// let mut cursor = Cursor::new(bytes);
/// let magic = read_magic_and_rewind(&mut cursor).unwrap();
/// assert_eq!(magic, [0x0a, 0x0d, 0x0d, 0x0a]);
/// ```
///
/// # Errors
/// Returns `OfflineError` when the reader cannot be read or rewound.
pub fn read_magic_and_rewind<R: Read + Seek>(reader: &mut R) -> Result<[u8; 4], OfflineError> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    reader.seek(SeekFrom::Start(0))?;
    Ok(magic)
}

pub fn is_pcapng_magic(magic: &[u8; 4]) -> bool {
    magic == &layout::PCAPNG_MAGIC
}

/// Timestamp precision announced by a classic savefile magic, in either
/// byte order.
///
/// # Errors
/// Returns `OfflineError::Pcap` for anything that is not a savefile magic.
pub fn legacy_precision(magic: &[u8; 4]) -> Result<TimestampPrecision, OfflineError> {
    let le = u32::from_le_bytes(*magic);
    let be = u32::from_be_bytes(*magic);
    if le == layout::PCAP_MAGIC_MICRO || be == layout::PCAP_MAGIC_MICRO {
        Ok(TimestampPrecision::Micro)
    } else if le == layout::PCAP_MAGIC_NANO || be == layout::PCAP_MAGIC_NANO {
        Ok(TimestampPrecision::Nano)
    } else {
        Err(OfflineError::Pcap {
            context: "magic",
            message: format!("unknown file magic {magic:02x?}"),
        })
    }
}

/// Resolve the interface for a given interface id, defaulting to Ethernet
/// with microsecond resolution.
///
/// # Examples
/// This helper is part of an internal module, so the example is marked as
/// text example.
/// ```text
/// use pcapbridge_core::native::offline::reader::{Interface, interface_for_id};
/// use pcap_parser::Linktype;
///
/// let raw = Interface { linktype: Linktype::RAW, snaplen: 0, units_per_second: 1_000 };
/// assert_eq!(interface_for_id(&[raw], 0).linktype, Linktype::RAW);
/// assert_eq!(interface_for_id(&[raw], 1).linktype, Linktype::ETHERNET);
/// ```
pub fn interface_for_id(interfaces: &[Interface], if_id: u32) -> Interface {
    interfaces
        .get(if_id as usize)
        .copied()
        .unwrap_or(Interface {
            linktype: Linktype::ETHERNET,
            snaplen: 0,
            units_per_second: 1_000_000,
        })
}

/// Timestamp units per second for a pcapng `if_tsresol` value.
pub fn tsresol_units(tsresol: u8) -> Option<u64> {
    let exponent = u32::from(tsresol & !layout::TSRESOL_BINARY_FLAG);
    if tsresol & layout::TSRESOL_BINARY_FLAG != 0 {
        1u64.checked_shl(exponent)
    } else {
        10u64.checked_pow(exponent)
    }
}

/// Split a pcapng 64-bit timestamp into seconds and a fraction expressed in
/// `target` units.
///
/// # Examples
/// ```text
/// use pcapbridge_core::native::offline::reader::split_pcapng_timestamp;
/// use pcapbridge_core::TimestampPrecision;
///
/// let (secs, frac) = split_pcapng_timestamp(0, 1_500_000, 1_000_000, TimestampPrecision::Micro);
/// assert_eq!((secs, frac), (1, 500_000));
/// ```
pub fn split_pcapng_timestamp(
    ts_high: u32,
    ts_low: u32,
    units_per_second: u64,
    target: TimestampPrecision,
) -> (i64, u32) {
    let ts = (u64::from(ts_high) << 32) | u64::from(ts_low);
    let units = units_per_second.max(1);
    let seconds = i64::try_from(ts / units).unwrap_or(i64::MAX);
    let remainder = u128::from(ts % units);
    let fraction = remainder * u128::from(target.units_per_second()) / u128::from(units);
    (seconds, fraction as u32)
}
