//! Shared read loop for the in-process engines.
//!
//! An engine implements [`PacketPump`] to stage one packet at a time; the
//! functions here turn that into the dispatch/loop/next/next_ex primitives
//! with libpcap's return codes.

use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::abi::{AbiError, HeaderAbi, PlatformInfo};
use crate::packet::PacketHeader;

use super::{
    BreakLoop, NEXT_EX_PACKET, NEXT_EX_TIMEOUT, PCAP_ERROR, PCAP_ERROR_BREAK, RawCallback,
};

/// Result of asking an engine for the next packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pull {
    /// A packet is staged.
    Packet,
    Timeout,
    Break,
    Eof,
    /// The engine recorded an error message.
    Failed,
}

pub(crate) trait PacketPump {
    /// Stage the next packet. With `wait` the engine may block up to its
    /// read timeout; without it only an immediately available packet counts.
    fn pull(&mut self, wait: bool) -> Pull;

    fn staged(&self) -> &PacketSlot;
}

/// Engine-owned header/data buffers, reused for every packet.
pub(crate) struct PacketSlot {
    abi: Result<HeaderAbi, AbiError>,
    header: Vec<u8>,
    data: Vec<u8>,
}

impl PacketSlot {
    pub(crate) fn new(platform: &PlatformInfo) -> Self {
        let abi = HeaderAbi::resolve(platform);
        let header_len = abi.as_ref().map(HeaderAbi::header_len).unwrap_or(0);
        Self {
            abi,
            header: vec![0u8; header_len],
            data: Vec::new(),
        }
    }

    /// Encode `header` in the engine's layout and copy `data`.
    pub(crate) fn stage(&mut self, header: &PacketHeader, data: &[u8]) -> Result<(), String> {
        let abi = self.abi.as_ref().map_err(|err| err.to_string())?;
        abi.encode(header, &mut self.header)
            .map_err(|err| err.to_string())?;
        self.data.clear();
        self.data.extend_from_slice(data);
        Ok(())
    }

    pub(crate) fn header_ptr(&self) -> *const u8 {
        self.header.as_ptr()
    }

    pub(crate) fn data_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    /// # Safety
    /// Same contract as `NativeCapture::dispatch_raw`.
    unsafe fn deliver(&self, callback: RawCallback, user: *mut u8) {
        // SAFETY: both buffers outlive the callback; `user` is the caller's.
        unsafe { callback(user, self.header_ptr(), self.data_ptr()) }
    }
}

pub(crate) unsafe fn run_dispatch<P: PacketPump>(
    pump: &mut P,
    count: i32,
    callback: RawCallback,
    user: *mut u8,
) -> i32 {
    let mut delivered = 0;
    loop {
        if count > 0 && delivered >= count {
            return delivered;
        }
        match pump.pull(delivered == 0) {
            Pull::Packet => {
                // SAFETY: forwarded caller contract.
                unsafe { pump.staged().deliver(callback, user) };
                delivered += 1;
            }
            Pull::Timeout | Pull::Eof => return delivered,
            Pull::Break => return PCAP_ERROR_BREAK,
            Pull::Failed => return PCAP_ERROR,
        }
    }
}

pub(crate) unsafe fn run_loop<P: PacketPump>(
    pump: &mut P,
    count: i32,
    callback: RawCallback,
    user: *mut u8,
) -> i32 {
    let mut delivered = 0;
    loop {
        if count > 0 && delivered >= count {
            return 0;
        }
        match pump.pull(true) {
            Pull::Packet => {
                // SAFETY: forwarded caller contract.
                unsafe { pump.staged().deliver(callback, user) };
                delivered += 1;
            }
            Pull::Timeout => continue,
            Pull::Eof => return 0,
            Pull::Break => return PCAP_ERROR_BREAK,
            Pull::Failed => return PCAP_ERROR,
        }
    }
}

pub(crate) unsafe fn run_next<P: PacketPump>(pump: &mut P, header: *mut u8) -> *const u8 {
    if pump.pull(true) != Pull::Packet {
        return ptr::null();
    }
    let slot = pump.staged();
    // SAFETY: the caller provides room for one header of the engine's layout.
    unsafe { ptr::copy_nonoverlapping(slot.header_ptr(), header, slot.header.len()) };
    slot.data_ptr()
}

pub(crate) unsafe fn run_next_ex<P: PacketPump>(
    pump: &mut P,
    header: *mut *const u8,
    packet: *mut *const u8,
) -> i32 {
    match pump.pull(true) {
        Pull::Packet => {
            let slot = pump.staged();
            // SAFETY: the caller provides writable out-pointers.
            unsafe {
                *header = slot.header_ptr();
                *packet = slot.data_ptr();
            }
            NEXT_EX_PACKET
        }
        Pull::Timeout => NEXT_EX_TIMEOUT,
        Pull::Break | Pull::Eof => PCAP_ERROR_BREAK,
        Pull::Failed => PCAP_ERROR,
    }
}

/// Break request backed by a single flag, honored at the next packet
/// boundary.
#[derive(Debug, Default)]
pub(crate) struct FlagBreak {
    requested: AtomicBool,
}

impl FlagBreak {
    /// Consume a pending break request.
    pub(crate) fn take(&self) -> bool {
        self.requested.swap(false, Ordering::AcqRel)
    }
}

impl BreakLoop for FlagBreak {
    fn request_break(&self) {
        self.requested.store(true, Ordering::Release);
    }
}
