//! Trace file constants.

/// Read buffer handed to `pcap-parser` readers.
pub const PCAP_READER_BUFFER_SIZE: usize = 64 * 1024;

/// Section header block type, identical in both byte orders.
pub const PCAPNG_MAGIC: [u8; 4] = [0x0a, 0x0d, 0x0d, 0x0a];

/// Classic savefile magic, microsecond timestamps.
pub const PCAP_MAGIC_MICRO: u32 = 0xa1b2_c3d4;
/// Classic savefile magic, nanosecond timestamps.
pub const PCAP_MAGIC_NANO: u32 = 0xa1b2_3c4d;

/// `if_tsresol` when the option is absent: 10^-6.
pub const DEFAULT_TSRESOL: u8 = 6;
/// `if_tsresol` high bit: the exponent is a power of two.
pub const TSRESOL_BINARY_FLAG: u8 = 0x80;
