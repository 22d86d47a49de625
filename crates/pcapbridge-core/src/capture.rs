//! Capture sessions: an engine plus the dispatch controller bound to it.

use std::path::Path;

use pcap_parser::Linktype;

use crate::abi::{HeaderAbi, PlatformInfo, TimestampPrecision};
use crate::config::CaptureConfig;
use crate::dispatch::{DispatchOutcome, Dispatcher, Interrupter};
use crate::error::BridgeError;
use crate::handler::{FailurePolicy, HandlerError, PacketHandler};
use crate::native::{MemoryCapture, NativeCapture, OfflineCapture, PacketFeeder};
use crate::packet::PacketRef;
use crate::stats::CaptureStat;

/// An open capture handle.
///
/// The header ABI is resolved once, when the session is created, and stays
/// bound for the lifetime of the session.
///
/// # Examples
/// ```no_run
/// use std::path::Path;
///
/// use pcapbridge_core::Capture;
///
/// let mut capture = Capture::open_offline(Path::new("capture.pcap"))?;
/// let mut total = 0usize;
/// capture.loop_packets(-1, &mut total, |total: &mut usize, packet| {
///     *total += packet.data().len();
///     Ok(())
/// })?;
/// println!("{total} bytes");
/// # Ok::<(), pcapbridge_core::BridgeError>(())
/// ```
pub struct Capture<N: NativeCapture> {
    native: N,
    dispatcher: Dispatcher,
}

impl<N: NativeCapture> Capture<N> {
    /// Bind a session to an opened engine.
    ///
    /// # Errors
    /// Returns `BridgeError::Abi` when no header layout is known for the
    /// engine's platform.
    pub fn new(native: N) -> Result<Self, BridgeError> {
        let platform = native.platform();
        let abi = HeaderAbi::resolve(&platform)?;
        tracing::info!(
            abi = %abi.name(),
            linktype = native.datalink().0,
            snaplen = native.snapshot(),
            "capture handle bound"
        );
        let dispatcher = Dispatcher::new(abi, native.break_handle());
        Ok(Self { native, dispatcher })
    }

    pub fn abi(&self) -> HeaderAbi {
        self.dispatcher.abi()
    }

    pub fn datalink(&self) -> Linktype {
        self.native.datalink()
    }

    pub fn snapshot(&self) -> u32 {
        self.native.snapshot()
    }

    pub fn native(&self) -> &N {
        &self.native
    }

    pub fn native_mut(&mut self) -> &mut N {
        &mut self.native
    }

    /// # Errors
    /// See [`Dispatcher::dispatch`].
    pub fn dispatch<U, F>(
        &mut self,
        count: i32,
        user: &mut U,
        handler: F,
    ) -> Result<DispatchOutcome, BridgeError>
    where
        U: ?Sized,
        F: FnMut(&mut U, PacketRef<'_>) -> Result<(), HandlerError>,
    {
        self.dispatcher
            .dispatch(&mut self.native, count, user, handler)
    }

    /// # Errors
    /// See [`Dispatcher::dispatch`].
    pub fn dispatch_with<U, H>(
        &mut self,
        count: i32,
        user: &mut U,
        handler: &mut H,
    ) -> Result<DispatchOutcome, BridgeError>
    where
        U: ?Sized,
        H: PacketHandler<U>,
    {
        self.dispatcher
            .dispatch_with(&mut self.native, count, user, handler)
    }

    /// # Errors
    /// See [`Dispatcher::dispatch`].
    pub fn loop_packets<U, F>(
        &mut self,
        count: i32,
        user: &mut U,
        handler: F,
    ) -> Result<DispatchOutcome, BridgeError>
    where
        U: ?Sized,
        F: FnMut(&mut U, PacketRef<'_>) -> Result<(), HandlerError>,
    {
        self.dispatcher
            .loop_packets(&mut self.native, count, user, handler)
    }

    /// # Errors
    /// See [`Dispatcher::dispatch`].
    pub fn loop_with<U, H>(
        &mut self,
        count: i32,
        user: &mut U,
        handler: &mut H,
    ) -> Result<DispatchOutcome, BridgeError>
    where
        U: ?Sized,
        H: PacketHandler<U>,
    {
        self.dispatcher
            .loop_with(&mut self.native, count, user, handler)
    }

    /// # Errors
    /// See [`Dispatcher::next`].
    pub fn next(&mut self) -> Result<Option<PacketRef<'_>>, BridgeError> {
        self.dispatcher.next(&mut self.native)
    }

    /// # Errors
    /// See [`Dispatcher::next_ex`].
    pub fn next_ex(&mut self) -> Result<Option<PacketRef<'_>>, BridgeError> {
        self.dispatcher.next_ex(&mut self.native)
    }

    pub fn interrupt(&self) {
        self.dispatcher.interrupt();
    }

    pub fn interrupter(&self) -> Interrupter {
        self.dispatcher.interrupter()
    }

    pub fn set_failure_policy(&mut self, policy: FailurePolicy) {
        self.dispatcher.set_failure_policy(policy);
    }

    pub fn clear_failure_policy(&mut self) -> Option<FailurePolicy> {
        self.dispatcher.clear_failure_policy()
    }

    /// # Errors
    /// Returns the engine's error when statistics are unavailable.
    pub fn stats(&mut self) -> Result<CaptureStat, BridgeError> {
        self.native.stats()
    }

    pub fn into_native(self) -> N {
        self.native
    }
}

impl Capture<OfflineCapture> {
    /// Open a pcap or pcapng file.
    ///
    /// # Errors
    /// Returns `BridgeError::Io` or `BridgeError::Capture` when the file
    /// cannot be opened or parsed.
    pub fn open_offline(path: &Path) -> Result<Self, BridgeError> {
        let native = OfflineCapture::open(path)?;
        Self::new(native)
    }
}

impl Capture<MemoryCapture> {
    /// Open an in-memory live-like handle on the host platform.
    ///
    /// # Errors
    /// Returns `BridgeError::Abi` when the host has no known header layout.
    pub fn open_memory(
        config: &CaptureConfig,
        linktype: Linktype,
    ) -> Result<(Self, PacketFeeder), BridgeError> {
        let (native, feeder) = MemoryCapture::open(config, linktype);
        Ok((Self::new(native)?, feeder))
    }

    /// Open an in-memory handle laid out as `platform`'s libpcap would.
    ///
    /// # Errors
    /// Returns `BridgeError::Abi` when `platform` has no known header layout.
    pub fn open_memory_on(
        config: &CaptureConfig,
        linktype: Linktype,
        platform: PlatformInfo,
    ) -> Result<(Self, PacketFeeder), BridgeError> {
        let (native, feeder) = MemoryCapture::open_on(config, linktype, platform);
        Ok((Self::new(native)?, feeder))
    }

    /// Open a dead handle (`pcap_open_dead`).
    ///
    /// # Errors
    /// Returns `BridgeError::Abi` when the host has no known header layout.
    pub fn open_dead(
        linktype: Linktype,
        snaplen: u32,
        precision: TimestampPrecision,
    ) -> Result<Self, BridgeError> {
        Self::new(MemoryCapture::dead(linktype, snaplen, precision))
    }
}

#[cfg(feature = "libpcap")]
impl Capture<crate::native::LibpcapCapture> {
    /// Open a live interface through the system libpcap.
    ///
    /// # Errors
    /// Returns `BridgeError::Native` with libpcap's error buffer.
    pub fn open_live(device: &str, config: &CaptureConfig) -> Result<Self, BridgeError> {
        Self::new(crate::native::LibpcapCapture::open_live(device, config)?)
    }

    /// Open a trace file through the system libpcap.
    ///
    /// # Errors
    /// Returns `BridgeError::Native` with libpcap's error buffer.
    pub fn open_offline_native(path: &Path, precision: TimestampPrecision) -> Result<Self, BridgeError> {
        Self::new(crate::native::LibpcapCapture::open_offline(path, precision)?)
    }
}
