//! Static field tables for every supported `struct pcap_pkthdr` layout.
//!
//! Offsets are relative to the start of the header. Tables are looked up once
//! per field through the variant bound to a handle; nothing here inspects the
//! running platform.

use super::TimestampPrecision;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldWidth {
    U32,
    U64,
}

impl FieldWidth {
    pub const fn bytes(self) -> usize {
        match self {
            FieldWidth::U32 => 4,
            FieldWidth::U64 => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub offset: usize,
    pub width: FieldWidth,
}

impl Field {
    pub const fn new(offset: usize, width: FieldWidth) -> Self {
        Self { offset, width }
    }

    pub const fn end(self) -> usize {
        self.offset + self.width.bytes()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct FieldTable {
    pub seconds: Field,
    pub fraction: Field,
    pub caplen: Field,
    pub len: Field,
    pub header_len: usize,
    pub precision: TimestampPrecision,
}

/// 32-bit `time_t`/`suseconds_t` (ILP32 targets, Windows, savefile records).
pub const LEGACY32: FieldTable = FieldTable {
    seconds: Field::new(0, FieldWidth::U32),
    fraction: Field::new(4, FieldWidth::U32),
    caplen: Field::new(8, FieldWidth::U32),
    len: Field::new(12, FieldWidth::U32),
    header_len: 16,
    precision: TimestampPrecision::Micro,
};

pub const LEGACY32_NANO: FieldTable = FieldTable {
    precision: TimestampPrecision::Nano,
    ..LEGACY32
};

/// LP64 Unix `struct timeval` with a 64-bit `suseconds_t`.
pub const TIMEVAL64: FieldTable = FieldTable {
    seconds: Field::new(0, FieldWidth::U64),
    fraction: Field::new(8, FieldWidth::U64),
    caplen: Field::new(16, FieldWidth::U32),
    len: Field::new(20, FieldWidth::U32),
    header_len: 24,
    precision: TimestampPrecision::Micro,
};

pub const TIMESPEC64: FieldTable = FieldTable {
    precision: TimestampPrecision::Nano,
    ..TIMEVAL64
};

/// Darwin keeps `suseconds_t` at 32 bits and pads it to 8.
pub const DARWIN64: FieldTable = FieldTable {
    seconds: Field::new(0, FieldWidth::U64),
    fraction: Field::new(8, FieldWidth::U32),
    caplen: Field::new(16, FieldWidth::U32),
    len: Field::new(20, FieldWidth::U32),
    header_len: 24,
    precision: TimestampPrecision::Micro,
};

pub const DARWIN64_NANO: FieldTable = FieldTable {
    precision: TimestampPrecision::Nano,
    ..DARWIN64
};

/// Largest header length across all tables; sizes pull scratch buffers.
pub const MAX_HEADER_LEN: usize = 24;
