//! User packet handlers and handler failure policy.
//!
//! Handlers run synchronously inside the native dispatch callback. A handler
//! fails either by returning `Err` or by panicking; both are captured by the
//! bridge as a [`HandlerFailure`] and never unwind into native code.

use std::any::Any;
use std::fmt;

use crate::packet::{PacketHeader, PacketRef};
use crate::sink::PacketSink;

/// Error type returned by fallible handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Failure raised by a handler during a blocking dispatch call.
pub enum HandlerFailure {
    Error(HandlerError),
    Panic(Box<dyn Any + Send>),
}

impl HandlerFailure {
    pub fn is_panic(&self) -> bool {
        matches!(self, HandlerFailure::Panic(_))
    }

    /// Human-readable description; panic payloads other than strings are
    /// reported generically.
    pub fn message(&self) -> String {
        match self {
            HandlerFailure::Error(err) => err.to_string(),
            HandlerFailure::Panic(payload) => panic_message(payload.as_ref()),
        }
    }
}

impl fmt::Debug for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerFailure::Error(err) => f.debug_tuple("Error").field(err).finish(),
            HandlerFailure::Panic(payload) => f
                .debug_tuple("Panic")
                .field(&panic_message(payload.as_ref()))
                .finish(),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Decision of a failure policy about one handler failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureVerdict {
    /// Drop the failure and keep delivering packets.
    Suppress,
    /// Stop the current blocking call and re-raise the failure.
    Abort,
}

/// Policy consulted for every handler failure. Without one, every failure
/// aborts the current blocking call.
pub type FailurePolicy = Box<dyn FnMut(&HandlerFailure) -> FailureVerdict + Send>;

/// A consumer of captured packets.
///
/// `U` is the caller's user token, passed through unchanged on every call.
pub trait PacketHandler<U: ?Sized> {
    fn handle_packet(&mut self, user: &mut U, packet: PacketRef<'_>) -> Result<(), HandlerError>;
}

/// Structured-view consumer over a closure.
pub struct FnHandler<F>(pub F);

impl<U: ?Sized, F> PacketHandler<U> for FnHandler<F>
where
    F: FnMut(&mut U, PacketRef<'_>) -> Result<(), HandlerError>,
{
    fn handle_packet(&mut self, user: &mut U, packet: PacketRef<'_>) -> Result<(), HandlerError> {
        (self.0)(user, packet)
    }
}

/// Byte-array consumer: receives the decoded header and an owned copy of the
/// captured bytes.
pub struct ArrayHandler<F>(pub F);

impl<U: ?Sized, F> PacketHandler<U> for ArrayHandler<F>
where
    F: FnMut(&mut U, PacketHeader, Vec<u8>) -> Result<(), HandlerError>,
{
    fn handle_packet(&mut self, user: &mut U, packet: PacketRef<'_>) -> Result<(), HandlerError> {
        (self.0)(user, packet.header().decode(), packet.data().to_vec())
    }
}

/// Sink-writer: forwards every packet to a [`PacketSink`].
pub struct SinkHandler<S>(pub S);

impl<S> SinkHandler<S> {
    pub fn into_inner(self) -> S {
        self.0
    }
}

impl<U: ?Sized, S: PacketSink> PacketHandler<U> for SinkHandler<S> {
    fn handle_packet(&mut self, _user: &mut U, packet: PacketRef<'_>) -> Result<(), HandlerError> {
        let header = packet.header().decode();
        self.0.write_packet(&header, packet.data())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_messages_are_extracted() {
        let failure = HandlerFailure::Panic(Box::new("boom"));
        assert!(failure.is_panic());
        assert_eq!(failure.message(), "boom");

        let failure = HandlerFailure::Panic(Box::new(String::from("bang")));
        assert_eq!(failure.message(), "bang");

        let failure = HandlerFailure::Panic(Box::new(7u32));
        assert_eq!(failure.message(), "handler panicked");
    }

    #[test]
    fn error_failures_keep_source_message() {
        let failure = HandlerFailure::Error("bad frame".into());
        assert!(!failure.is_panic());
        assert_eq!(failure.message(), "bad frame");
        assert!(format!("{failure:?}").contains("bad frame"));
    }
}
