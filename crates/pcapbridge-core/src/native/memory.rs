//! In-process live capture engine.
//!
//! A [`MemoryCapture`] behaves like a live libpcap handle whose "wire" is a
//! channel: a [`PacketFeeder`] (usually on another thread) injects packets,
//! reads wait up to the configured read timeout, and a break request wakes
//! a blocked read immediately. Dropping every feeder ends the capture the
//! way end of file ends a savefile.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded, select, unbounded};
use pcap_parser::Linktype;

use crate::abi::{PlatformInfo, TimestampPrecision};
use crate::config::CaptureConfig;
use crate::error::BridgeError;
use crate::native::driver::{self, PacketPump, PacketSlot, Pull};
use crate::native::{BreakLoop, NativeCapture, RawCallback};
use crate::packet::{OwnedPacket, PacketHeader};
use crate::stats::CaptureStat;

const DEAD_HANDLE_MESSAGE: &str = "packets cannot be read from a dead capture handle";

/// Producer side of a [`MemoryCapture`].
#[derive(Clone)]
pub struct PacketFeeder {
    packets: Sender<OwnedPacket>,
    precision: TimestampPrecision,
    dropped: Arc<AtomicU32>,
    capacity: Option<usize>,
}

impl PacketFeeder {
    /// Inject one packet. `ts_frac` is expressed in the capture's timestamp
    /// precision. When the capture was configured with a buffer size and the
    /// buffer is full, the packet is dropped and counted in the statistics.
    ///
    /// # Errors
    /// Returns `BridgeError::Native` once the capture has been dropped or
    /// when the packet is longer than a capture header can describe.
    pub fn feed(&self, ts_sec: i64, ts_frac: u32, data: impl Into<Vec<u8>>) -> Result<(), BridgeError> {
        let data = data.into();
        let len = wire_len(data.len())?;
        let packet = OwnedPacket {
            header: PacketHeader::new(ts_sec, ts_frac, self.precision, len, len),
            data,
        };
        if self.capacity.is_some() {
            return match self.packets.try_send(packet) {
                Ok(()) => Ok(()),
                Err(crossbeam_channel::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Err(crossbeam_channel::TrySendError::Disconnected(_)) => Err(closed()),
            };
        }
        self.packets.send(packet).map_err(|_| closed())
    }

    pub fn precision(&self) -> TimestampPrecision {
        self.precision
    }
}

fn wire_len(len: usize) -> Result<u32, BridgeError> {
    u32::try_from(len).map_err(|_| BridgeError::Native {
        context: "memory capture feed",
        message: format!("packet of {len} bytes exceeds the 32-bit capture length"),
    })
}

fn closed() -> BridgeError {
    BridgeError::Native {
        context: "memory capture feed",
        message: "capture handle was closed".to_string(),
    }
}

struct MemoryBreak {
    requested: AtomicBool,
    wake: Sender<()>,
}

impl MemoryBreak {
    fn take(&self) -> bool {
        self.requested.swap(false, Ordering::AcqRel)
    }
}

impl BreakLoop for MemoryBreak {
    fn request_break(&self) {
        self.requested.store(true, Ordering::Release);
        let _ = self.wake.try_send(());
    }
}

/// Channel-fed capture handle implementing the native primitives.
pub struct MemoryCapture {
    platform: PlatformInfo,
    linktype: Linktype,
    snaplen: u32,
    timeout: Duration,
    packets: Option<Receiver<OwnedPacket>>,
    wake: Receiver<()>,
    breaker: Arc<MemoryBreak>,
    slot: PacketSlot,
    received: u32,
    dropped: Arc<AtomicU32>,
    last_error: String,
}

impl MemoryCapture {
    /// Open a live-like handle on the host platform.
    pub fn open(config: &CaptureConfig, linktype: Linktype) -> (Self, PacketFeeder) {
        Self::open_on(config, linktype, PlatformInfo::native(config.precision))
    }

    /// Open a handle that reports `platform` instead of the host, so headers
    /// are laid out as that platform's libpcap would lay them out.
    pub fn open_on(
        config: &CaptureConfig,
        linktype: Linktype,
        platform: PlatformInfo,
    ) -> (Self, PacketFeeder) {
        let capacity = (config.buffer_size > 0).then_some(config.buffer_size as usize);
        let (tx, rx) = match capacity {
            Some(capacity) => bounded(capacity),
            None => unbounded(),
        };
        let dropped = Arc::new(AtomicU32::new(0));
        let feeder = PacketFeeder {
            packets: tx,
            precision: platform.precision,
            dropped: dropped.clone(),
            capacity,
        };
        let capture = Self::build(config, linktype, platform, Some(rx), dropped);
        (capture, feeder)
    }

    /// Handle without a packet source, like `pcap_open_dead`: every read
    /// fails, but the handle still describes a link type and header layout.
    pub fn dead(linktype: Linktype, snaplen: u32, precision: TimestampPrecision) -> Self {
        let config = CaptureConfig {
            snaplen,
            precision,
            ..CaptureConfig::default()
        };
        Self::build(
            &config,
            linktype,
            PlatformInfo::native(precision),
            None,
            Arc::new(AtomicU32::new(0)),
        )
    }

    fn build(
        config: &CaptureConfig,
        linktype: Linktype,
        platform: PlatformInfo,
        packets: Option<Receiver<OwnedPacket>>,
        dropped: Arc<AtomicU32>,
    ) -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            slot: PacketSlot::new(&platform),
            platform,
            linktype,
            snaplen: config.snaplen,
            timeout: Duration::from_millis(config.timeout_ms),
            packets,
            wake: wake_rx,
            breaker: Arc::new(MemoryBreak {
                requested: AtomicBool::new(false),
                wake: wake_tx,
            }),
            received: 0,
            dropped,
            last_error: String::new(),
        }
    }

    fn take_break(&self) -> bool {
        if self.breaker.take() {
            while self.wake.try_recv().is_ok() {}
            return true;
        }
        false
    }

    fn receive(&self, packets: &Receiver<OwnedPacket>, wait: bool) -> Result<OwnedPacket, Pull> {
        if !wait {
            return match packets.try_recv() {
                Ok(packet) => Ok(packet),
                Err(TryRecvError::Empty) => Err(Pull::Timeout),
                Err(TryRecvError::Disconnected) => Err(Pull::Eof),
            };
        }
        if self.timeout.is_zero() {
            select! {
                recv(packets) -> msg => msg.map_err(|_| Pull::Eof),
                recv(self.wake) -> _ => Err(self.woken()),
            }
        } else {
            select! {
                recv(packets) -> msg => msg.map_err(|_| Pull::Eof),
                recv(self.wake) -> _ => Err(self.woken()),
                default(self.timeout) => Err(Pull::Timeout),
            }
        }
    }

    fn woken(&self) -> Pull {
        if self.breaker.take() {
            Pull::Break
        } else {
            Pull::Timeout
        }
    }
}

impl PacketPump for MemoryCapture {
    fn pull(&mut self, wait: bool) -> Pull {
        if self.take_break() {
            return Pull::Break;
        }
        let Some(packets) = self.packets.as_ref() else {
            self.last_error = DEAD_HANDLE_MESSAGE.to_string();
            return Pull::Failed;
        };
        let mut packet = match self.receive(packets, wait) {
            Ok(packet) => packet,
            Err(pull) => return pull,
        };
        if self.snaplen > 0 && packet.data.len() > self.snaplen as usize {
            packet.data.truncate(self.snaplen as usize);
            packet.header.caplen = self.snaplen;
        }
        match self.slot.stage(&packet.header, &packet.data) {
            Ok(()) => {
                self.received = self.received.wrapping_add(1);
                Pull::Packet
            }
            Err(message) => {
                self.last_error = message;
                Pull::Failed
            }
        }
    }

    fn staged(&self) -> &PacketSlot {
        &self.slot
    }
}

impl NativeCapture for MemoryCapture {
    fn platform(&self) -> PlatformInfo {
        self.platform
    }

    fn datalink(&self) -> Linktype {
        self.linktype
    }

    fn snapshot(&self) -> u32 {
        self.snaplen
    }

    unsafe fn dispatch_raw(&mut self, count: i32, callback: RawCallback, user: *mut u8) -> i32 {
        // SAFETY: forwarded caller contract.
        unsafe { driver::run_dispatch(self, count, callback, user) }
    }

    unsafe fn loop_raw(&mut self, count: i32, callback: RawCallback, user: *mut u8) -> i32 {
        // SAFETY: forwarded caller contract.
        unsafe { driver::run_loop(self, count, callback, user) }
    }

    unsafe fn next_raw(&mut self, header: *mut u8) -> *const u8 {
        // SAFETY: forwarded caller contract.
        unsafe { driver::run_next(self, header) }
    }

    unsafe fn next_ex_raw(&mut self, header: *mut *const u8, packet: *mut *const u8) -> i32 {
        // SAFETY: forwarded caller contract.
        unsafe { driver::run_next_ex(self, header, packet) }
    }

    fn break_handle(&self) -> Arc<dyn BreakLoop> {
        self.breaker.clone()
    }

    fn discard_break(&mut self) {
        if self.take_break() {
            tracing::trace!("discarded unconsumed break request");
        }
        while self.wake.try_recv().is_ok() {}
    }

    fn last_error(&self) -> String {
        self.last_error.clone()
    }

    fn stats(&mut self) -> Result<CaptureStat, BridgeError> {
        if self.packets.is_none() {
            return Err(BridgeError::Native {
                context: "capture statistics",
                message: DEAD_HANDLE_MESSAGE.to_string(),
            });
        }
        Ok(CaptureStat {
            received: self.received,
            dropped: self.dropped.load(Ordering::Relaxed),
            if_dropped: 0,
            captured: None,
        })
    }
}
