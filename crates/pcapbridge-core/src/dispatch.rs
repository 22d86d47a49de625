//! Dispatch controller: blocking dispatch/loop/next/next_ex over a native
//! handle, the interrupt protocol, and re-raising of handler failures.
//!
//! Every blocking call follows the same sequence: check that the handle
//! still produces the bound header layout, clear the failure slot and any
//! unconsumed native break, mark the call active, run the native primitive
//! with [`bridge_callback`], mark the call idle, then resolve the result. A
//! recorded handler failure always wins over the native return code, an
//! interrupt comes next, and only then is the return code itself
//! interpreted.

use std::panic;
use std::ptr;
use std::sync::Arc;

use crate::abi::{AbiError, HeaderAbi, layout};
use crate::bridge::{Bound, FailureSlot, Frame, InterruptState, bridge_callback};
use crate::error::BridgeError;
use crate::handler::{FailurePolicy, FnHandler, HandlerError, HandlerFailure, PacketHandler};
use crate::native::{
    BreakLoop, NEXT_EX_PACKET, NEXT_EX_TIMEOUT, NativeCapture, PCAP_ERROR_BREAK, RawCallback,
};
use crate::packet::{HeaderView, PacketRef, Scope, reinterpret_header, reinterpret_packet};

/// Result of a blocking dispatch or loop call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The call completed; handler invocations made.
    Processed(u32),
    /// The call was cut short by [`Dispatcher::interrupt`] or a native break.
    Broken,
}

impl DispatchOutcome {
    pub fn count(&self) -> u32 {
        match self {
            DispatchOutcome::Processed(count) => *count,
            DispatchOutcome::Broken => 0,
        }
    }

    pub fn is_broken(&self) -> bool {
        matches!(self, DispatchOutcome::Broken)
    }
}

#[derive(Debug, Clone, Copy)]
enum Primitive {
    Dispatch,
    Loop,
}

impl Primitive {
    fn name(self) -> &'static str {
        match self {
            Primitive::Dispatch => "pcap_dispatch",
            Primitive::Loop => "pcap_loop",
        }
    }
}

/// Buffers reused by pull calls: room for the largest header layout for
/// `next`, two pointer slots for `next_ex`.
struct PullScratch {
    header: Vec<u8>,
    slots: [*const u8; 2],
}

// SAFETY: the pointer slots are only written by the engine during a pull and
// read right after it on the same call; they are never dereferenced later.
unsafe impl Send for PullScratch {}

/// Cloneable, thread-safe handle that interrupts a dispatcher's blocking
/// calls.
#[derive(Clone)]
pub struct Interrupter {
    state: Arc<InterruptState>,
}

impl Interrupter {
    /// Same as [`Dispatcher::interrupt`].
    pub fn interrupt(&self) {
        self.state.interrupt();
    }
}

impl std::fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interrupter")
            .field("interrupted", &self.state.is_interrupted())
            .finish()
    }
}

/// Controller for one capture handle.
///
/// Calls on one dispatcher must not overlap; use an [`Interrupter`] to stop a
/// call from another thread.
pub struct Dispatcher {
    abi: HeaderAbi,
    callback: RawCallback,
    state: Arc<InterruptState>,
    slot: FailureSlot,
    policy: Option<FailurePolicy>,
    scratch: PullScratch,
}

impl Dispatcher {
    pub fn new(abi: HeaderAbi, breaker: Arc<dyn BreakLoop>) -> Self {
        Self {
            abi,
            callback: bridge_callback,
            state: Arc::new(InterruptState::new(breaker)),
            slot: FailureSlot::default(),
            policy: None,
            scratch: PullScratch {
                header: vec![0u8; layout::MAX_HEADER_LEN],
                slots: [ptr::null(); 2],
            },
        }
    }

    pub fn abi(&self) -> HeaderAbi {
        self.abi
    }

    /// Install the veto policy consulted for every handler failure.
    pub fn set_failure_policy(&mut self, policy: FailurePolicy) {
        self.policy = Some(policy);
    }

    /// Remove the veto policy; every handler failure aborts again.
    pub fn clear_failure_policy(&mut self) -> Option<FailurePolicy> {
        self.policy.take()
    }

    /// Request that the blocking call in progress return as soon as
    /// possible. Without a call in progress this only sets a flag that the
    /// next call discards.
    pub fn interrupt(&self) {
        self.state.interrupt();
    }

    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            state: self.state.clone(),
        }
    }

    /// Prepare `native` and the shared state for one blocking call. Returns
    /// whether a break sent during an earlier call may still be pending in
    /// the engine.
    fn begin<N>(&self, native: &mut N) -> Result<bool, BridgeError>
    where
        N: NativeCapture + ?Sized,
    {
        let engine = HeaderAbi::resolve(&native.platform())?;
        if engine != self.abi {
            return Err(AbiError::Mismatch {
                bound: self.abi.name(),
                engine: engine.name(),
            }
            .into());
        }
        self.slot.clear();
        native.discard_break();
        Ok(self.state.enter())
    }

    /// `pcap_dispatch` with a closure handler.
    ///
    /// # Errors
    /// Returns `BridgeError::Handler` when a handler error aborted the call,
    /// `BridgeError::Native` when the engine failed and `BridgeError::Abi`
    /// when the handle's header layout differs from the bound one. A handler
    /// panic that aborted the call is resumed on this thread.
    pub fn dispatch<N, U, F>(
        &mut self,
        native: &mut N,
        count: i32,
        user: &mut U,
        handler: F,
    ) -> Result<DispatchOutcome, BridgeError>
    where
        N: NativeCapture + ?Sized,
        U: ?Sized,
        F: FnMut(&mut U, PacketRef<'_>) -> Result<(), HandlerError>,
    {
        self.dispatch_with(native, count, user, &mut FnHandler(handler))
    }

    /// `pcap_dispatch` with any [`PacketHandler`].
    ///
    /// # Errors
    /// Same as [`Dispatcher::dispatch`].
    pub fn dispatch_with<N, U, H>(
        &mut self,
        native: &mut N,
        count: i32,
        user: &mut U,
        handler: &mut H,
    ) -> Result<DispatchOutcome, BridgeError>
    where
        N: NativeCapture + ?Sized,
        U: ?Sized,
        H: PacketHandler<U>,
    {
        self.run(native, Primitive::Dispatch, count, user, handler)
    }

    /// `pcap_loop` with a closure handler: unlike `dispatch`, read timeouts
    /// do not end the call.
    ///
    /// # Errors
    /// Same as [`Dispatcher::dispatch`].
    pub fn loop_packets<N, U, F>(
        &mut self,
        native: &mut N,
        count: i32,
        user: &mut U,
        handler: F,
    ) -> Result<DispatchOutcome, BridgeError>
    where
        N: NativeCapture + ?Sized,
        U: ?Sized,
        F: FnMut(&mut U, PacketRef<'_>) -> Result<(), HandlerError>,
    {
        self.loop_with(native, count, user, &mut FnHandler(handler))
    }

    /// `pcap_loop` with any [`PacketHandler`].
    ///
    /// # Errors
    /// Same as [`Dispatcher::dispatch`].
    pub fn loop_with<N, U, H>(
        &mut self,
        native: &mut N,
        count: i32,
        user: &mut U,
        handler: &mut H,
    ) -> Result<DispatchOutcome, BridgeError>
    where
        N: NativeCapture + ?Sized,
        U: ?Sized,
        H: PacketHandler<U>,
    {
        self.run(native, Primitive::Loop, count, user, handler)
    }

    fn run<N, U, H>(
        &mut self,
        native: &mut N,
        primitive: Primitive,
        count: i32,
        user: &mut U,
        handler: &mut H,
    ) -> Result<DispatchOutcome, BridgeError>
    where
        N: NativeCapture + ?Sized,
        U: ?Sized,
        H: PacketHandler<U>,
    {
        let stale = self.begin(native)?;
        let callback = self.callback;

        let mut bound = Bound { handler, user };
        let mut frame = Frame::new(
            self.abi,
            &mut bound,
            self.policy.as_mut(),
            &self.slot,
            &self.state,
        );
        let user_ptr = frame.user_ptr();
        let invoke = |native: &mut N| {
            // SAFETY: `frame` lives on this stack frame for the whole native
            // call and `callback` is `bridge_callback`, which expects a frame.
            unsafe {
                match primitive {
                    Primitive::Dispatch => native.dispatch_raw(count, callback, user_ptr),
                    Primitive::Loop => native.loop_raw(count, callback, user_ptr),
                }
            }
        };
        let mut rc = invoke(&mut *native);
        if stale && rc == PCAP_ERROR_BREAK && frame.delivered() == 0 && !self.state.is_interrupted() {
            tracing::debug!(primitive = primitive.name(), "retrying after a leftover native break");
            rc = invoke(&mut *native);
        }
        let delivered = frame.delivered();
        let interrupted = self.state.leave();
        tracing::debug!(
            primitive = primitive.name(),
            rc,
            delivered,
            interrupted,
            "blocking call returned"
        );

        if let Some(failure) = self.slot.take() {
            return match failure {
                HandlerFailure::Error(err) => Err(BridgeError::Handler(err)),
                HandlerFailure::Panic(payload) => panic::resume_unwind(payload),
            };
        }
        if interrupted || rc == PCAP_ERROR_BREAK {
            return Ok(DispatchOutcome::Broken);
        }
        if rc < 0 {
            return Err(BridgeError::Native {
                context: primitive.name(),
                message: native.last_error(),
            });
        }
        Ok(DispatchOutcome::Processed(delivered))
    }

    /// `pcap_next`: one packet, or `None` when the read produced none
    /// (timeout, end of file, break or error alike).
    ///
    /// # Errors
    /// Returns `BridgeError::Abi` when the handle's header layout differs
    /// from the bound one.
    pub fn next<'a, N>(&'a mut self, native: &'a mut N) -> Result<Option<PacketRef<'a>>, BridgeError>
    where
        N: NativeCapture + ?Sized,
    {
        let stale = self.begin(native)?;
        let header_ptr = self.scratch.header.as_mut_ptr();
        // SAFETY: the scratch header holds the largest header layout.
        let mut data = unsafe { native.next_raw(header_ptr) };
        if data.is_null() && stale && !self.state.is_interrupted() {
            tracing::debug!("retrying pcap_next after a leftover native break");
            // SAFETY: as above.
            data = unsafe { native.next_raw(header_ptr) };
        }
        let interrupted = self.state.leave();
        if data.is_null() {
            tracing::trace!(interrupted, "pcap_next returned no packet");
            return Ok(None);
        }

        let header: &'a [u8] = &self.scratch.header;
        let view = HeaderView::from_bytes(self.abi, header)?;
        // SAFETY: the engine keeps the data valid until its next call, which
        // needs another mutable borrow of `native`; `'a` forbids that.
        let scope = unsafe { Scope::<'a>::assume() };
        // SAFETY: as above; the data holds `caplen` bytes.
        let data = unsafe { reinterpret_packet(&view, data, &scope) };
        Ok(Some(PacketRef::new(view, data)))
    }

    /// `pcap_next_ex`: one packet, `None` when the call was broken or the
    /// capture ended.
    ///
    /// # Errors
    /// Returns `BridgeError::Timeout` when the read timeout expired,
    /// `BridgeError::Native` on engine errors and `BridgeError::Abi` when the
    /// handle's header layout differs from the bound one.
    pub fn next_ex<'a, N>(
        &'a mut self,
        native: &'a mut N,
    ) -> Result<Option<PacketRef<'a>>, BridgeError>
    where
        N: NativeCapture + ?Sized,
    {
        let stale = self.begin(native)?;
        let [header_slot, data_slot] = &mut self.scratch.slots;
        *header_slot = ptr::null();
        *data_slot = ptr::null();
        // SAFETY: both slots are writable pointer-sized locations.
        let mut rc = unsafe { native.next_ex_raw(header_slot, data_slot) };
        if rc == PCAP_ERROR_BREAK && stale && !self.state.is_interrupted() {
            tracing::debug!("retrying pcap_next_ex after a leftover native break");
            // SAFETY: as above.
            rc = unsafe { native.next_ex_raw(header_slot, data_slot) };
        }
        let interrupted = self.state.leave();

        match rc {
            NEXT_EX_PACKET => {
                let [header, data] = self.scratch.slots;
                // SAFETY: on success the engine's buffers stay valid until its
                // next call, which `'a` forbids.
                let scope = unsafe { Scope::<'a>::assume() };
                // SAFETY: as above; the header has the bound layout.
                let Some(view) = (unsafe { reinterpret_header(self.abi, header, &scope) }) else {
                    return Err(BridgeError::Native {
                        context: "pcap_next_ex",
                        message: "engine returned a null header".to_string(),
                    });
                };
                // SAFETY: as above; the data holds `caplen` bytes.
                let data = unsafe { reinterpret_packet(&view, data, &scope) };
                Ok(Some(PacketRef::new(view, data)))
            }
            NEXT_EX_TIMEOUT => Err(BridgeError::Timeout),
            PCAP_ERROR_BREAK => {
                tracing::trace!(interrupted, "pcap_next_ex broken or exhausted");
                Ok(None)
            }
            _ => Err(BridgeError::Native {
                context: "pcap_next_ex",
                message: native.last_error(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    use crate::abi::{AbiVariant, ByteOrder, PlatformInfo, TargetOs, TimestampPrecision};
    use crate::config::CaptureConfig;
    use crate::native::{Linktype, MemoryCapture};
    use crate::stats::CaptureStat;

    /// Engine that, like libpcap, keeps a break flag until a read consumes it.
    struct StickyBreak(MemoryCapture);

    impl NativeCapture for StickyBreak {
        fn platform(&self) -> PlatformInfo {
            self.0.platform()
        }

        fn datalink(&self) -> Linktype {
            self.0.datalink()
        }

        fn snapshot(&self) -> u32 {
            self.0.snapshot()
        }

        unsafe fn dispatch_raw(&mut self, count: i32, callback: RawCallback, user: *mut u8) -> i32 {
            unsafe { self.0.dispatch_raw(count, callback, user) }
        }

        unsafe fn loop_raw(&mut self, count: i32, callback: RawCallback, user: *mut u8) -> i32 {
            unsafe { self.0.loop_raw(count, callback, user) }
        }

        unsafe fn next_raw(&mut self, header: *mut u8) -> *const u8 {
            unsafe { self.0.next_raw(header) }
        }

        unsafe fn next_ex_raw(&mut self, header: *mut *const u8, packet: *mut *const u8) -> i32 {
            unsafe { self.0.next_ex_raw(header, packet) }
        }

        fn break_handle(&self) -> Arc<dyn BreakLoop> {
            self.0.break_handle()
        }

        fn discard_break(&mut self) {}

        fn last_error(&self) -> String {
            self.0.last_error()
        }

        fn stats(&mut self) -> Result<CaptureStat, BridgeError> {
            self.0.stats()
        }
    }

    fn memory(timeout_ms: u64) -> (MemoryCapture, crate::native::PacketFeeder, Dispatcher) {
        let config = CaptureConfig {
            timeout_ms,
            ..CaptureConfig::default()
        };
        let (capture, feeder) = MemoryCapture::open(&config, Linktype::ETHERNET);
        let abi = HeaderAbi::resolve(&capture.platform()).unwrap();
        let dispatcher = Dispatcher::new(abi, capture.break_handle());
        (capture, feeder, dispatcher)
    }

    #[test]
    fn dispatch_counts_handler_invocations() {
        let (mut capture, feeder, mut dispatcher) = memory(20);
        for i in 0..4u8 {
            feeder.feed(i64::from(i), 0, vec![i; 8]).unwrap();
        }
        let mut lengths = Vec::new();
        let outcome = dispatcher
            .dispatch(&mut capture, -1, &mut lengths, |lengths: &mut Vec<u32>, packet| {
                lengths.push(packet.captured_length());
                Ok(())
            })
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Processed(4));
        assert_eq!(lengths, vec![8; 4]);
    }

    #[test]
    fn native_errors_carry_last_error() {
        let mut capture = MemoryCapture::dead(Linktype::ETHERNET, 64, Default::default());
        let abi = HeaderAbi::resolve(&capture.platform()).unwrap();
        let mut dispatcher = Dispatcher::new(abi, capture.break_handle());
        let err = dispatcher
            .dispatch(&mut capture, 1, &mut (), |_: &mut (), _packet| Ok(()))
            .unwrap_err();
        match err {
            BridgeError::Native { context, message } => {
                assert_eq!(context, "pcap_dispatch");
                assert!(message.contains("dead capture handle"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn next_copies_header_into_scratch() {
        let (mut capture, feeder, mut dispatcher) = memory(20);
        feeder.feed(42, 7, vec![1, 2, 3, 4]).unwrap();
        let packet = dispatcher.next(&mut capture).unwrap().unwrap();
        assert_eq!(packet.header().timestamp_seconds(), 42);
        assert_eq!(packet.data(), &[1, 2, 3, 4]);
        drop(packet);
        assert!(dispatcher.next(&mut capture).unwrap().is_none());
    }

    #[test]
    fn next_ex_distinguishes_timeout_from_end() {
        let (mut capture, feeder, mut dispatcher) = memory(20);
        let err = dispatcher.next_ex(&mut capture).unwrap_err();
        assert!(err.is_timeout());
        drop(feeder);
        assert!(dispatcher.next_ex(&mut capture).unwrap().is_none());
    }

    #[test]
    fn interrupter_breaks_blocked_loop() {
        let (mut capture, _feeder, mut dispatcher) = memory(0);
        let interrupter = dispatcher.interrupter();
        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            interrupter.interrupt();
        });
        let outcome = dispatcher
            .loop_packets(&mut capture, -1, &mut (), |_: &mut (), _packet| Ok(()))
            .unwrap();
        waker.join().unwrap();
        assert!(outcome.is_broken());
    }

    #[test]
    fn leftover_break_is_retried_past_on_sticky_engines() {
        let (capture, feeder, mut dispatcher) = memory(20);
        let mut capture = StickyBreak(capture);
        for i in 0..5 {
            feeder.feed(i, 0, vec![0u8; 4]).unwrap();
        }
        let mut calls = 0u32;
        let err = dispatcher
            .dispatch(&mut capture, 2, &mut calls, |calls: &mut u32, _packet| {
                *calls += 1;
                if *calls == 2 { Err("stop".into()) } else { Ok(()) }
            })
            .unwrap_err();
        assert!(matches!(err, BridgeError::Handler(_)));

        let mut calls = 0u32;
        let outcome = dispatcher
            .dispatch(&mut capture, -1, &mut calls, |calls: &mut u32, _packet| {
                *calls += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Processed(3));
        assert_eq!(calls, 3);
    }

    #[test]
    fn leftover_break_does_not_end_next_ex() {
        let (capture, feeder, mut dispatcher) = memory(20);
        let mut capture = StickyBreak(capture);
        for i in 0..2 {
            feeder.feed(i, 0, vec![0u8; 4]).unwrap();
        }
        dispatcher
            .dispatch(&mut capture, 1, &mut (), |_: &mut (), _packet| Err("stop".into()))
            .unwrap_err();
        let packet = dispatcher.next_ex(&mut capture).unwrap().unwrap();
        assert_eq!(packet.header().timestamp_seconds(), 1);
    }

    #[test]
    fn mismatched_layout_is_rejected_before_reading() {
        let config = CaptureConfig {
            timeout_ms: 20,
            ..CaptureConfig::default()
        };
        let platform = PlatformInfo {
            pointer_width: 64,
            os: TargetOs::Unix,
            order: ByteOrder::Little,
            precision: TimestampPrecision::Micro,
        };
        let (mut capture, feeder) = MemoryCapture::open_on(&config, Linktype::ETHERNET, platform);
        feeder.feed(5, 0, vec![7u8; 4]).unwrap();
        let legacy = HeaderAbi::new(AbiVariant::Legacy32, ByteOrder::Little);
        let mut dispatcher = Dispatcher::new(legacy, capture.break_handle());

        let is_mismatch = |err: &BridgeError| {
            matches!(err, BridgeError::Abi(AbiError::Mismatch { bound, engine })
                if bound == "legacy-32-le" && engine == "timeval-64-le")
        };
        assert!(is_mismatch(&dispatcher.next(&mut capture).unwrap_err()));
        assert!(is_mismatch(&dispatcher.next_ex(&mut capture).unwrap_err()));
        let err = dispatcher
            .dispatch(&mut capture, -1, &mut (), |_: &mut (), _packet| Ok(()))
            .unwrap_err();
        assert!(is_mismatch(&err));

        let abi = HeaderAbi::resolve(&platform).unwrap();
        let mut dispatcher = Dispatcher::new(abi, capture.break_handle());
        let packet = dispatcher.next(&mut capture).unwrap().unwrap();
        assert_eq!(packet.header().timestamp_seconds(), 5);
        assert_eq!(packet.data(), &[7u8; 4]);
    }
}
