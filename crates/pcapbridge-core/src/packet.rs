//! Packet references handed to user handlers.
//!
//! A [`PacketRef`] is a pair of borrowed windows into memory owned by the
//! capture engine: the raw capture header and the captured bytes. The engine
//! reuses that memory for the next packet as soon as control returns to it, so
//! a reference is bound to a [`Scope`] that ends no later than the callback or
//! pull call that produced it. `PacketRef` is neither `Send` nor `'static`;
//! use [`PacketRef::detach`] to keep a copy.

use std::fmt;
use std::marker::PhantomData;
use std::slice;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::abi::{HeaderAbi, TimestampPrecision};

/// Capture header normalized across all ABI variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PacketHeader {
    /// Seconds since the Unix epoch.
    pub ts_sec: i64,
    /// Sub-second part, in `precision` units.
    pub ts_frac: u32,
    pub precision: TimestampPrecision,
    /// Bytes actually captured.
    pub caplen: u32,
    /// Length of the packet on the wire.
    pub len: u32,
}

impl PacketHeader {
    pub const fn new(
        ts_sec: i64,
        ts_frac: u32,
        precision: TimestampPrecision,
        caplen: u32,
        len: u32,
    ) -> Self {
        Self {
            ts_sec,
            ts_frac,
            precision,
            caplen,
            len,
        }
    }

    pub const fn fraction_in(&self, unit: TimestampPrecision) -> u32 {
        self.precision.convert(self.ts_frac, unit)
    }

    pub fn timestamp_nanos(&self) -> i128 {
        i128::from(self.ts_sec) * 1_000_000_000
            + i128::from(self.fraction_in(TimestampPrecision::Nano))
    }

    pub fn timestamp(&self) -> Option<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp_nanos(self.timestamp_nanos()).ok()
    }
}

/// Bounded lifetime for views over engine-owned memory.
///
/// The lifetime is invariant so a view cannot be widened into a longer scope,
/// and the marker is `!Send` so views stay on the thread that produced them.
pub struct Scope<'s> {
    _invariant: PhantomData<fn(&'s ()) -> &'s ()>,
    _local: PhantomData<*const ()>,
}

impl<'s> Scope<'s> {
    /// # Safety
    /// The caller ties `'s` to a borrow that outlives every access to the
    /// underlying engine memory.
    pub(crate) unsafe fn assume() -> Self {
        Self {
            _invariant: PhantomData,
            _local: PhantomData,
        }
    }
}

/// Run `f` inside a fresh scope. Nothing bound to the scope can be returned.
pub fn with_scope<R>(f: impl for<'s> FnOnce(&Scope<'s>) -> R) -> R {
    // SAFETY: the scope is only reachable inside `f`, and `R` cannot name `'s`.
    let scope = unsafe { Scope::assume() };
    f(&scope)
}

/// Borrowed raw capture header, decoded through the handle's ABI.
#[derive(Clone, Copy)]
pub struct HeaderView<'s> {
    abi: HeaderAbi,
    raw: &'s [u8],
    _local: PhantomData<*const ()>,
}

impl<'s> HeaderView<'s> {
    /// Wrap an in-memory header. Fails when `raw` is shorter than the layout.
    pub fn from_bytes(abi: HeaderAbi, raw: &'s [u8]) -> Result<Self, crate::AbiError> {
        let needed = abi.header_len();
        if raw.len() < needed {
            return Err(crate::AbiError::TooShort {
                needed,
                actual: raw.len(),
            });
        }
        Ok(Self {
            abi,
            raw: &raw[..needed],
            _local: PhantomData,
        })
    }

    pub fn abi(&self) -> HeaderAbi {
        self.abi
    }

    pub fn as_bytes(&self) -> &'s [u8] {
        self.raw
    }

    pub fn timestamp_seconds(&self) -> i64 {
        self.abi.timestamp_seconds(self.raw)
    }

    pub fn timestamp_fraction(&self, unit: TimestampPrecision) -> u32 {
        self.abi.timestamp_fraction(self.raw, unit)
    }

    pub fn captured_length(&self) -> u32 {
        self.abi.captured_length(self.raw)
    }

    pub fn original_length(&self) -> u32 {
        self.abi.original_length(self.raw)
    }

    pub fn decode(&self) -> PacketHeader {
        let precision = self.abi.precision();
        PacketHeader::new(
            self.timestamp_seconds(),
            self.timestamp_fraction(precision),
            precision,
            self.captured_length(),
            self.original_length(),
        )
    }
}

impl fmt::Debug for HeaderView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderView")
            .field("abi", &self.abi.name())
            .field("header", &self.decode())
            .finish()
    }
}

/// Reinterpret a native header pointer as a view of the bound layout.
///
/// Returns `None` for a null pointer.
///
/// # Safety
/// A non-null `raw` must point to at least `abi.header_len()` readable bytes
/// that stay valid and unmodified for `'s`.
pub unsafe fn reinterpret_header<'s>(
    abi: HeaderAbi,
    raw: *const u8,
    _scope: &Scope<'s>,
) -> Option<HeaderView<'s>> {
    if raw.is_null() {
        return None;
    }
    // SAFETY: upheld by the caller.
    let bytes = unsafe { slice::from_raw_parts(raw, abi.header_len()) };
    Some(HeaderView {
        abi,
        raw: bytes,
        _local: PhantomData,
    })
}

/// Reinterpret a native packet pointer using the captured length of `header`.
///
/// # Safety
/// A non-null `raw` must point to at least `header.captured_length()` readable
/// bytes that stay valid and unmodified for `'s`.
pub unsafe fn reinterpret_packet<'s>(
    header: &HeaderView<'s>,
    raw: *const u8,
    _scope: &Scope<'s>,
) -> &'s [u8] {
    let caplen = header.captured_length() as usize;
    if raw.is_null() || caplen == 0 {
        return &[];
    }
    // SAFETY: upheld by the caller.
    unsafe { slice::from_raw_parts(raw, caplen) }
}

/// Header and data of one captured packet, valid for scope `'s` only.
#[derive(Clone, Copy)]
pub struct PacketRef<'s> {
    header: HeaderView<'s>,
    data: &'s [u8],
}

impl<'s> PacketRef<'s> {
    pub fn new(header: HeaderView<'s>, data: &'s [u8]) -> Self {
        Self { header, data }
    }

    pub fn header(&self) -> &HeaderView<'s> {
        &self.header
    }

    pub fn data(&self) -> &'s [u8] {
        self.data
    }

    pub fn captured_length(&self) -> u32 {
        self.header.captured_length()
    }

    pub fn original_length(&self) -> u32 {
        self.header.original_length()
    }

    pub fn detach(&self) -> OwnedPacket {
        OwnedPacket {
            header: self.header.decode(),
            data: self.data.to_vec(),
        }
    }
}

impl fmt::Debug for PacketRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketRef")
            .field("header", &self.header)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Detached copy of a packet that may be kept or sent anywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedPacket {
    pub header: PacketHeader,
    pub data: Vec<u8>,
}
