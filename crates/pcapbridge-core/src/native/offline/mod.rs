//! Offline engine over pcap and pcapng trace files.
//!
//! File I/O and block parsing are delegated to `pcap-parser`; packets are
//! re-encoded into the host's capture header layout so the dispatch bridge
//! sees exactly what it would see from libpcap's savefile reader.

pub mod error;
pub mod layout;
pub mod parser;
pub mod reader;

pub use error::OfflineError;
pub use parser::OfflineCapture;
