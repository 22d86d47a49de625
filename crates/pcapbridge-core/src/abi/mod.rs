//! Capture header ABI resolution.
//!
//! libpcap hands every packet to its callback together with a `struct
//! pcap_pkthdr` whose binary layout depends on the platform the library was
//! built for (width of `time_t`/`suseconds_t`, padding, byte order) and on the
//! timestamp precision the handle was opened with. A [`HeaderAbi`] is resolved
//! once, when a handle is opened, and every header of that handle is decoded
//! through the same static field table afterwards.
//!
//! Resolution fails with [`AbiError::Unresolved`] for platforms without a known
//! layout; capture sessions surface that error from their constructors rather
//! than on the first packet.

pub mod error;
pub mod layout;
pub mod reader;

use serde::{Deserialize, Serialize};

use crate::packet::PacketHeader;

pub use error::AbiError;
use layout::FieldTable;
use reader::{HeaderReader, HeaderWriter};

/// Byte order of multi-byte header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }
}

/// Unit of the sub-second timestamp fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampPrecision {
    #[default]
    Micro,
    Nano,
}

impl TimestampPrecision {
    pub const fn units_per_second(self) -> u32 {
        match self {
            TimestampPrecision::Micro => 1_000_000,
            TimestampPrecision::Nano => 1_000_000_000,
        }
    }

    /// Convert a fraction expressed in `self` units into `target` units.
    ///
    /// # Examples
    /// ```
    /// use pcapbridge_core::TimestampPrecision;
    ///
    /// assert_eq!(TimestampPrecision::Micro.convert(250, TimestampPrecision::Nano), 250_000);
    /// assert_eq!(TimestampPrecision::Nano.convert(250_999, TimestampPrecision::Micro), 250);
    /// ```
    pub const fn convert(self, fraction: u32, target: TimestampPrecision) -> u32 {
        match (self, target) {
            (TimestampPrecision::Micro, TimestampPrecision::Nano) => fraction.saturating_mul(1_000),
            (TimestampPrecision::Nano, TimestampPrecision::Micro) => fraction / 1_000,
            _ => fraction,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            TimestampPrecision::Micro => "micro",
            TimestampPrecision::Nano => "nano",
        }
    }
}

/// Operating-system family, as far as header layouts are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetOs {
    Unix,
    Darwin,
    Windows,
}

impl TargetOs {
    pub const fn native() -> Self {
        if cfg!(windows) {
            TargetOs::Windows
        } else if cfg!(target_vendor = "apple") {
            TargetOs::Darwin
        } else {
            TargetOs::Unix
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            TargetOs::Unix => "unix",
            TargetOs::Darwin => "darwin",
            TargetOs::Windows => "windows",
        }
    }
}

/// Identification of the native library build a handle talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub pointer_width: u32,
    pub os: TargetOs,
    pub order: ByteOrder,
    pub precision: TimestampPrecision,
}

impl PlatformInfo {
    /// The platform this crate was compiled for.
    pub const fn native(precision: TimestampPrecision) -> Self {
        Self {
            pointer_width: usize::BITS,
            os: TargetOs::native(),
            order: ByteOrder::native(),
            precision,
        }
    }
}

/// Closed set of known `struct pcap_pkthdr` layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AbiVariant {
    Legacy32,
    Legacy32Nano,
    Timeval64,
    Timespec64,
    Darwin64,
    Darwin64Nano,
}

impl AbiVariant {
    pub const ALL: [AbiVariant; 6] = [
        AbiVariant::Legacy32,
        AbiVariant::Legacy32Nano,
        AbiVariant::Timeval64,
        AbiVariant::Timespec64,
        AbiVariant::Darwin64,
        AbiVariant::Darwin64Nano,
    ];

    pub const fn table(self) -> &'static FieldTable {
        match self {
            AbiVariant::Legacy32 => &layout::LEGACY32,
            AbiVariant::Legacy32Nano => &layout::LEGACY32_NANO,
            AbiVariant::Timeval64 => &layout::TIMEVAL64,
            AbiVariant::Timespec64 => &layout::TIMESPEC64,
            AbiVariant::Darwin64 => &layout::DARWIN64,
            AbiVariant::Darwin64Nano => &layout::DARWIN64_NANO,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            AbiVariant::Legacy32 => "legacy-32",
            AbiVariant::Legacy32Nano => "legacy-32-nano",
            AbiVariant::Timeval64 => "timeval-64",
            AbiVariant::Timespec64 => "timespec-64",
            AbiVariant::Darwin64 => "darwin-64",
            AbiVariant::Darwin64Nano => "darwin-64-nano",
        }
    }
}

/// Header layout descriptor bound to a capture handle for its lifetime.
///
/// # Examples
/// ```
/// use pcapbridge_core::{AbiVariant, ByteOrder, HeaderAbi, PacketHeader, TimestampPrecision};
///
/// let abi = HeaderAbi::new(AbiVariant::Timeval64, ByteOrder::Little);
/// let header = PacketHeader::new(1_700_000_000, 42, TimestampPrecision::Micro, 60, 1514);
/// let mut raw = [0u8; 24];
/// abi.encode(&header, &mut raw)?;
/// assert_eq!(abi.captured_length(&raw), 60);
/// assert_eq!(abi.original_length(&raw), 1514);
/// assert_eq!(abi.timestamp_fraction(&raw, TimestampPrecision::Nano), 42_000);
/// # Ok::<(), pcapbridge_core::AbiError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HeaderAbi {
    pub variant: AbiVariant,
    pub order: ByteOrder,
}

impl HeaderAbi {
    pub const fn new(variant: AbiVariant, order: ByteOrder) -> Self {
        Self { variant, order }
    }

    /// Select the layout used by a native library built for `platform`.
    pub fn resolve(platform: &PlatformInfo) -> Result<Self, AbiError> {
        let nano = platform.precision == TimestampPrecision::Nano;
        let variant = match (platform.pointer_width, platform.os) {
            (32, _) | (64, TargetOs::Windows) => {
                if nano {
                    AbiVariant::Legacy32Nano
                } else {
                    AbiVariant::Legacy32
                }
            }
            (64, TargetOs::Darwin) => {
                if nano {
                    AbiVariant::Darwin64Nano
                } else {
                    AbiVariant::Darwin64
                }
            }
            (64, TargetOs::Unix) => {
                if nano {
                    AbiVariant::Timespec64
                } else {
                    AbiVariant::Timeval64
                }
            }
            (width, os) => {
                return Err(AbiError::Unresolved {
                    pointer_width: width,
                    os: os.name(),
                    precision: platform.precision.name(),
                });
            }
        };
        Ok(Self::new(variant, platform.order))
    }

    pub fn native(precision: TimestampPrecision) -> Result<Self, AbiError> {
        Self::resolve(&PlatformInfo::native(precision))
    }

    pub const fn table(&self) -> &'static FieldTable {
        self.variant.table()
    }

    pub const fn header_len(&self) -> usize {
        self.table().header_len
    }

    pub const fn precision(&self) -> TimestampPrecision {
        self.table().precision
    }

    pub fn name(&self) -> String {
        let order = match self.order {
            ByteOrder::Little => "le",
            ByteOrder::Big => "be",
        };
        format!("{}-{}", self.variant.name(), order)
    }

    /// Seconds since the epoch.
    ///
    /// # Panics
    /// Panics when `raw` is shorter than `header_len`; use [`HeaderAbi::decode`]
    /// or `HeaderView::from_bytes` for unchecked input.
    pub fn timestamp_seconds(&self, raw: &[u8]) -> i64 {
        HeaderReader::new(raw, self.order).read_signed(self.table().seconds)
    }

    /// Sub-second fraction converted into `unit`.
    ///
    /// # Panics
    /// Panics when `raw` is shorter than `header_len`.
    pub fn timestamp_fraction(&self, raw: &[u8], unit: TimestampPrecision) -> u32 {
        let table = self.table();
        let fraction = HeaderReader::new(raw, self.order).read_unsigned(table.fraction) as u32;
        table.precision.convert(fraction, unit)
    }

    /// # Panics
    /// Panics when `raw` is shorter than `header_len`.
    pub fn captured_length(&self, raw: &[u8]) -> u32 {
        HeaderReader::new(raw, self.order).read_unsigned(self.table().caplen) as u32
    }

    /// # Panics
    /// Panics when `raw` is shorter than `header_len`.
    pub fn original_length(&self, raw: &[u8]) -> u32 {
        HeaderReader::new(raw, self.order).read_unsigned(self.table().len) as u32
    }

    /// Length-checked decode into the normalized header representation.
    pub fn decode(&self, raw: &[u8]) -> Result<PacketHeader, AbiError> {
        HeaderReader::new(raw, self.order).require_len(self.header_len())?;
        Ok(PacketHeader::new(
            self.timestamp_seconds(raw),
            self.timestamp_fraction(raw, self.precision()),
            self.precision(),
            self.captured_length(raw),
            self.original_length(raw),
        ))
    }

    /// Write `header` in this layout into the first `header_len` bytes of
    /// `out`. Padding bytes are zeroed.
    pub fn encode(&self, header: &PacketHeader, out: &mut [u8]) -> Result<(), AbiError> {
        let table = self.table();
        HeaderWriter::new(out, self.order).require_len(table.header_len)?;

        let seconds = match table.seconds.width {
            layout::FieldWidth::U32 => {
                let narrow = i32::try_from(header.ts_sec).map_err(|_| AbiError::OutOfRange {
                    field: "seconds",
                    value: header.ts_sec,
                    variant: self.variant.name(),
                })?;
                narrow as u32 as u64
            }
            layout::FieldWidth::U64 => header.ts_sec as u64,
        };

        out[..table.header_len].fill(0);
        let mut writer = HeaderWriter::new(out, self.order);
        writer.write(table.seconds, seconds);
        writer.write(table.fraction, header.fraction_in(table.precision) as u64);
        writer.write(table.caplen, header.caplen as u64);
        writer.write(table.len, header.len as u64);
        Ok(())
    }
}
