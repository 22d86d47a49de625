//! Transport-layer endpoint decoding for flow summaries.

pub mod error;
pub mod layout;
pub mod parser;
pub mod reader;

pub use error::TransportError;
pub use parser::{TransportPacket, TransportProto, parse_transport_packet};
