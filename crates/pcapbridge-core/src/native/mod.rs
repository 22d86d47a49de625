//! Native capture primitives.
//!
//! The dispatch bridge talks to a capture engine only through the C-shaped
//! primitives of [`NativeCapture`], mirroring `pcap_dispatch`, `pcap_loop`,
//! `pcap_next`, `pcap_next_ex` and `pcap_breakloop`, including libpcap's
//! return-code conventions. Engines:
//!
//! - [`MemoryCapture`]: in-process live-like engine fed through a channel.
//! - [`OfflineCapture`]: pcap/pcapng trace files read with `pcap-parser`.
//! - `LibpcapCapture` (feature `libpcap`): the system libpcap over FFI.

mod driver;
pub mod memory;
pub mod offline;

#[cfg(feature = "libpcap")]
pub mod libpcap;

use std::sync::Arc;

pub use memory::{MemoryCapture, PacketFeeder};
pub use offline::OfflineCapture;
pub use pcap_parser::Linktype;

#[cfg(feature = "libpcap")]
pub use libpcap::LibpcapCapture;

use crate::abi::PlatformInfo;
use crate::error::BridgeError;
use crate::stats::CaptureStat;

/// `typedef void (*pcap_handler)(u_char *user, const struct pcap_pkthdr *h,
/// const u_char *bytes)`.
pub type RawCallback = unsafe extern "C" fn(user: *mut u8, header: *const u8, packet: *const u8);

/// Generic native failure; the message is available from `last_error`.
pub const PCAP_ERROR: i32 = -1;
/// The loop was broken by a break request before it completed.
pub const PCAP_ERROR_BREAK: i32 = -2;
/// `pcap_next_ex`: a packet was read.
pub const NEXT_EX_PACKET: i32 = 1;
/// `pcap_next_ex`: the read timeout expired without a packet.
pub const NEXT_EX_TIMEOUT: i32 = 0;

/// Thread-safe break request for a capture handle (`pcap_breakloop`).
pub trait BreakLoop: Send + Sync {
    fn request_break(&self);
}

/// Raw primitives of an opened native capture handle.
///
/// Opening and closing the handle is the engine's business; the dispatch
/// bridge only borrows it for the duration of one call. Calls on one handle
/// must not overlap; only [`BreakLoop::request_break`] may be used
/// concurrently.
pub trait NativeCapture {
    /// Identification used to resolve the capture header ABI at open time.
    fn platform(&self) -> PlatformInfo;

    fn datalink(&self) -> Linktype;

    fn snapshot(&self) -> u32;

    /// `pcap_dispatch`: process at most one buffer of packets, or up to
    /// `count` when `count > 0`. Returns the number processed, `0` on read
    /// timeout or end of file, [`PCAP_ERROR`] or [`PCAP_ERROR_BREAK`].
    ///
    /// # Safety
    /// `callback` is invoked with `user` unchanged; `user` must be valid for
    /// whatever `callback` does with it for the whole call.
    unsafe fn dispatch_raw(&mut self, count: i32, callback: RawCallback, user: *mut u8) -> i32;

    /// `pcap_loop`: like `dispatch_raw` but keeps reading across read
    /// timeouts until `count` packets were processed (forever when
    /// `count <= 0`), end of file, an error or a break. Returns `0` on
    /// completion.
    ///
    /// # Safety
    /// Same contract as [`NativeCapture::dispatch_raw`].
    unsafe fn loop_raw(&mut self, count: i32, callback: RawCallback, user: *mut u8) -> i32;

    /// `pcap_next`: read one packet, filling the capture header into
    /// `header`. Returns the packet data or null when no packet was read.
    ///
    /// # Safety
    /// `header` must be writable for the header length of the platform's
    /// ABI. The returned pointer is valid until the next call on this handle.
    unsafe fn next_raw(&mut self, header: *mut u8) -> *const u8;

    /// `pcap_next_ex`: read one packet, storing pointers to engine-owned
    /// header and data. Returns [`NEXT_EX_PACKET`], [`NEXT_EX_TIMEOUT`],
    /// [`PCAP_ERROR`] or [`PCAP_ERROR_BREAK`] (also used for end of file).
    ///
    /// # Safety
    /// Both out-pointers must be writable. The stored pointers are valid
    /// until the next call on this handle.
    unsafe fn next_ex_raw(&mut self, header: *mut *const u8, packet: *mut *const u8) -> i32;

    fn break_handle(&self) -> Arc<dyn BreakLoop>;

    /// Drop a break request that no read has consumed yet, so it cannot cut
    /// short the next call. Engines that cannot reach their break flag leave
    /// it in place and report one spurious [`PCAP_ERROR_BREAK`].
    fn discard_break(&mut self);

    /// `pcap_geterr`.
    fn last_error(&self) -> String;

    fn stats(&mut self) -> Result<CaptureStat, BridgeError>;
}
