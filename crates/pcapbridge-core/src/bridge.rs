//! Native callback bridge.
//!
//! Native engines call back through one non-generic `extern "C"` function,
//! [`bridge_callback`], with the `user` pointer set to a [`Frame`] that lives
//! on the stack of the dispatching call. The frame carries the bound handler,
//! the handle's header ABI and the controller's shared state. No unwind ever
//! crosses the native boundary: handler errors and panics are captured into
//! the failure slot, and an aborting failure requests a native break so the
//! dispatching call returns as soon as the engine notices.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::abi::HeaderAbi;
use crate::handler::{FailurePolicy, FailureVerdict, HandlerError, HandlerFailure, PacketHandler};
use crate::native::BreakLoop;
use crate::packet::{PacketRef, reinterpret_header, reinterpret_packet, with_scope};

/// Interrupt bookkeeping shared between a controller and its interrupters.
pub(crate) struct InterruptState {
    interrupted: AtomicBool,
    active: AtomicBool,
    /// A native break was requested and may not have been consumed.
    break_sent: AtomicBool,
    breaker: Arc<dyn BreakLoop>,
}

impl InterruptState {
    pub(crate) fn new(breaker: Arc<dyn BreakLoop>) -> Self {
        Self {
            interrupted: AtomicBool::new(false),
            active: AtomicBool::new(false),
            break_sent: AtomicBool::new(false),
            breaker,
        }
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Mark the start of a blocking call: stale interrupts are discarded.
    /// Returns whether an earlier call sent a native break that the engine
    /// may still be holding.
    pub(crate) fn enter(&self) -> bool {
        let stale = self.break_sent.swap(false, Ordering::AcqRel);
        self.active.store(true, Ordering::Release);
        self.interrupted.store(false, Ordering::Release);
        stale
    }

    /// Mark the end of a blocking call. Returns whether it was interrupted
    /// and clears the flag.
    pub(crate) fn leave(&self) -> bool {
        self.active.store(false, Ordering::Release);
        self.interrupted.swap(false, Ordering::AcqRel)
    }

    /// Interrupt the blocking call in progress, if any. Outside a blocking
    /// call only the flag is set; it is discarded by the next `enter`.
    pub(crate) fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        if self.active.load(Ordering::Acquire) {
            self.send_break();
        } else {
            tracing::debug!("interrupt requested while no dispatch is in progress");
        }
    }

    /// Stop the current call from inside a callback.
    fn abort(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.send_break();
    }

    fn send_break(&self) {
        self.break_sent.store(true, Ordering::Release);
        self.breaker.request_break();
    }
}

/// First aborting handler failure of the current blocking call.
#[derive(Default)]
pub(crate) struct FailureSlot {
    failure: Mutex<Option<HandlerFailure>>,
}

impl FailureSlot {
    /// Keep `failure` unless an earlier one is already recorded.
    pub(crate) fn record(&self, failure: HandlerFailure) -> bool {
        let mut slot = self.failure.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(failure);
        true
    }

    pub(crate) fn take(&self) -> Option<HandlerFailure> {
        self.failure.lock().take()
    }

    pub(crate) fn clear(&self) {
        self.failure.lock().take();
    }
}

/// Handler and user token with their types erased for the frame.
pub(crate) trait ErasedHandler {
    fn deliver(&mut self, packet: PacketRef<'_>) -> Result<(), HandlerError>;
}

pub(crate) struct Bound<'a, H, U: ?Sized> {
    pub(crate) handler: &'a mut H,
    pub(crate) user: &'a mut U,
}

impl<H, U> ErasedHandler for Bound<'_, H, U>
where
    H: PacketHandler<U>,
    U: ?Sized,
{
    fn deliver(&mut self, packet: PacketRef<'_>) -> Result<(), HandlerError> {
        self.handler.handle_packet(self.user, packet)
    }
}

/// Per-call state reached through the native `user` pointer.
pub(crate) struct Frame<'a> {
    abi: HeaderAbi,
    handler: &'a mut dyn ErasedHandler,
    policy: Option<&'a mut FailurePolicy>,
    slot: &'a FailureSlot,
    state: &'a InterruptState,
    aborted: bool,
    delivered: u32,
}

impl<'a> Frame<'a> {
    pub(crate) fn new(
        abi: HeaderAbi,
        handler: &'a mut dyn ErasedHandler,
        policy: Option<&'a mut FailurePolicy>,
        slot: &'a FailureSlot,
        state: &'a InterruptState,
    ) -> Self {
        Self {
            abi,
            handler,
            policy,
            slot,
            state,
            aborted: false,
            delivered: 0,
        }
    }

    /// Handler invocations made through this frame.
    pub(crate) fn delivered(&self) -> u32 {
        self.delivered
    }

    pub(crate) fn user_ptr(&mut self) -> *mut u8 {
        self as *mut Frame<'a> as *mut u8
    }

    fn on_packet(&mut self, header: *const u8, packet: *const u8) {
        // The engine may deliver a few more packets from its buffer after a
        // break request; they are dropped.
        if self.aborted || self.state.is_interrupted() {
            return;
        }
        let abi = self.abi;
        let handler = &mut *self.handler;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            with_scope(|scope| {
                // SAFETY: the engine keeps both buffers valid until this
                // callback returns, which bounds the scope.
                let Some(view) = (unsafe { reinterpret_header(abi, header, scope) }) else {
                    return Ok(false);
                };
                // SAFETY: as above; the data holds `caplen` bytes.
                let data = unsafe { reinterpret_packet(&view, packet, scope) };
                handler.deliver(PacketRef::new(view, data)).map(|()| true)
            })
        }));

        let failure = match outcome {
            Ok(Ok(true)) => {
                self.delivered += 1;
                return;
            }
            Ok(Ok(false)) => {
                tracing::warn!("native engine delivered a packet without a header");
                return;
            }
            Ok(Err(err)) => HandlerFailure::Error(err),
            Err(payload) => HandlerFailure::Panic(payload),
        };
        self.delivered += 1;
        self.on_failure(failure);
    }

    fn on_failure(&mut self, failure: HandlerFailure) {
        let verdict = match self.policy.as_deref_mut() {
            Some(policy) => {
                match panic::catch_unwind(AssertUnwindSafe(|| policy(&failure))) {
                    Ok(verdict) => verdict,
                    Err(_) => {
                        tracing::error!("failure policy panicked; aborting dispatch");
                        FailureVerdict::Abort
                    }
                }
            }
            None => FailureVerdict::Abort,
        };

        match verdict {
            FailureVerdict::Suppress => {
                tracing::warn!(
                    panic = failure.is_panic(),
                    error = %failure.message(),
                    "packet handler failure suppressed"
                );
            }
            FailureVerdict::Abort => {
                tracing::debug!(
                    panic = failure.is_panic(),
                    error = %failure.message(),
                    "packet handler failure; breaking dispatch"
                );
                self.slot.record(failure);
                self.aborted = true;
                self.state.abort();
            }
        }
    }
}

/// The single native entry point handed to every engine.
///
/// # Safety
/// `user` must be the pointer returned by [`Frame::user_ptr`] for a frame
/// that outlives the native call; `header` and `packet` follow the
/// `pcap_handler` contract of the engine that calls this function.
pub(crate) unsafe extern "C" fn bridge_callback(user: *mut u8, header: *const u8, packet: *const u8) {
    if user.is_null() {
        return;
    }
    // SAFETY: upheld by the caller; the frame is not otherwise borrowed while
    // the native call runs.
    let frame = unsafe { &mut *(user as *mut Frame<'_>) };
    frame.on_packet(header, packet);
}
