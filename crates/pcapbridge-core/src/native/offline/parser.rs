use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use pcap_parser::{
    Block, LegacyPcapReader, Linktype, PcapBlockOwned, PcapError, PcapNGReader,
    traits::PcapReaderIterator,
};

use crate::abi::{PlatformInfo, TimestampPrecision};
use crate::error::BridgeError;
use crate::native::driver::{self, FlagBreak, PacketPump, PacketSlot, Pull};
use crate::native::{BreakLoop, NativeCapture, RawCallback};
use crate::packet::{OwnedPacket, PacketHeader};
use crate::stats::CaptureStat;

use super::error::OfflineError;
use super::layout;
use super::reader::{
    Interface, interface_for_id, is_pcapng_magic, legacy_precision, read_magic_and_rewind,
    split_pcapng_timestamp, tsresol_units,
};

/// Trace file opened for replay through the native primitives.
///
/// Reads never block: the read timeout does not apply, end of file makes
/// `dispatch`/`loop` return `0` and `next_ex` return the break code, as
/// libpcap does for savefiles.
pub struct OfflineCapture {
    reader: TraceReader,
    state: TraceState,
    pending: Option<OwnedPacket>,
    slot: PacketSlot,
    breaker: Arc<FlagBreak>,
    last_error: String,
}

enum TraceReader {
    Legacy(LegacyPcapReader<File>),
    Ng(PcapNGReader<File>),
}

struct TraceState {
    linktype: Option<Linktype>,
    snaplen: u32,
    precision: Option<TimestampPrecision>,
    interfaces: Vec<Interface>,
}

impl TraceState {
    fn precision(&self) -> TimestampPrecision {
        self.precision.unwrap_or_default()
    }

    fn is_configured(&self) -> bool {
        self.linktype.is_some()
    }
}

impl OfflineCapture {
    /// Open a pcap or pcapng file and read up to its first interface
    /// description, so the link type and timestamp precision are known
    /// before any packet is dispatched.
    ///
    /// # Errors
    /// Returns `OfflineError` when the file cannot be opened or does not
    /// start with a supported trace header.
    pub fn open(path: &Path) -> Result<Self, OfflineError> {
        let mut file = File::open(path)?;
        let magic = read_magic_and_rewind(&mut file)?;

        let (reader, precision) = if is_pcapng_magic(&magic) {
            let reader = PcapNGReader::new(layout::PCAP_READER_BUFFER_SIZE, file).map_err(|e| {
                OfflineError::Pcap {
                    context: "pcapng reader init",
                    message: e.to_string(),
                }
            })?;
            (TraceReader::Ng(reader), None)
        } else {
            let precision = legacy_precision(&magic)?;
            let reader = LegacyPcapReader::new(layout::PCAP_READER_BUFFER_SIZE, file).map_err(
                |e| OfflineError::Pcap {
                    context: "pcap reader init",
                    message: e.to_string(),
                },
            )?;
            (TraceReader::Legacy(reader), Some(precision))
        };

        let mut state = TraceState {
            linktype: None,
            snaplen: 0,
            precision,
            interfaces: Vec::new(),
        };

        let mut pending = None;
        let mut reader = reader;
        while !state.is_configured() {
            match next_record(&mut reader, &mut state)? {
                Record::Packet(packet) => {
                    pending = Some(packet);
                    break;
                }
                Record::Meta => {}
                Record::Eof => break,
            }
        }

        let platform = PlatformInfo::native(state.precision());
        tracing::debug!(
            path = %path.display(),
            linktype = state.linktype.unwrap_or(Linktype::ETHERNET).0,
            precision = state.precision().name(),
            "opened trace file"
        );
        Ok(Self {
            reader,
            state,
            pending,
            slot: PacketSlot::new(&platform),
            breaker: Arc::new(FlagBreak::default()),
            last_error: String::new(),
        })
    }

    /// Timestamp precision of the records in the file.
    pub fn precision(&self) -> TimestampPrecision {
        self.state.precision()
    }
}

impl PacketPump for OfflineCapture {
    fn pull(&mut self, _wait: bool) -> Pull {
        if self.breaker.take() {
            return Pull::Break;
        }
        let record = match self.pending.take() {
            Some(packet) => Ok(Some(packet)),
            None => read_packet(&mut self.reader, &mut self.state),
        };
        match record {
            Ok(Some(packet)) => match self.slot.stage(&packet.header, &packet.data) {
                Ok(()) => Pull::Packet,
                Err(message) => {
                    self.last_error = message;
                    Pull::Failed
                }
            },
            Ok(None) => Pull::Eof,
            Err(err) => {
                self.last_error = err.to_string();
                Pull::Failed
            }
        }
    }

    fn staged(&self) -> &PacketSlot {
        &self.slot
    }
}

impl NativeCapture for OfflineCapture {
    fn platform(&self) -> PlatformInfo {
        PlatformInfo::native(self.state.precision())
    }

    fn datalink(&self) -> Linktype {
        self.state.linktype.unwrap_or(Linktype::ETHERNET)
    }

    fn snapshot(&self) -> u32 {
        self.state.snaplen
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
        self.breaker.take();
    }

    fn last_error(&self) -> String {
        self.last_error.clone()
    }

    fn stats(&mut self) -> Result<CaptureStat, BridgeError> {
        Err(BridgeError::Native {
            context: "capture statistics",
            message: "statistics aren't available from savefiles".to_string(),
        })
    }
}

/// Read blocks until a packet, end of file or an error.
fn read_packet(
    reader: &mut TraceReader,
    state: &mut TraceState,
) -> Result<Option<OwnedPacket>, OfflineError> {
    loop {
        match next_record(reader, state)? {
            Record::Packet(packet) => return Ok(Some(packet)),
            Record::Meta => {}
            Record::Eof => return Ok(None),
        }
    }
}

enum Record {
    Packet(OwnedPacket),
    /// A header, interface or unsupported block.
    Meta,
    Eof,
}

/// Consume one block. Header and interface blocks update `state`.
fn next_record(reader: &mut TraceReader, state: &mut TraceState) -> Result<Record, OfflineError> {
    loop {
        match reader {
            TraceReader::Legacy(reader) => match reader.next() {
                Ok((offset, block)) => {
                    let record = match block {
                        PcapBlockOwned::LegacyHeader(header) => {
                            state.linktype = Some(header.network);
                            state.snaplen = header.snaplen;
                            None
                        }
                        PcapBlockOwned::Legacy(packet) => {
                            let data = truncate(packet.data, packet.caplen);
                            Some(OwnedPacket {
                                header: PacketHeader::new(
                                    i64::from(packet.ts_sec),
                                    packet.ts_usec,
                                    state.precision(),
                                    data.len() as u32,
                                    packet.origlen,
                                ),
                                data: data.to_vec(),
                            })
                        }
                        _ => None,
                    };
                    reader.consume(offset);
                    return Ok(record.map_or(Record::Meta, Record::Packet));
                }
                Err(PcapError::Eof) => return Ok(Record::Eof),
                Err(PcapError::Incomplete(_)) => {
                    reader.refill().map_err(|e| OfflineError::Pcap {
                        context: "pcap reader refill",
                        message: e.to_string(),
                    })?;
                }
                Err(e) => {
                    return Err(OfflineError::Pcap {
                        context: "pcap reader next",
                        message: e.to_string(),
                    });
                }
            },
            TraceReader::Ng(reader) => match reader.next() {
                Ok((offset, block)) => {
                    let record = match block {
                        PcapBlockOwned::NG(Block::InterfaceDescription(intf)) => {
                            let units = tsresol_units(intf.if_tsresol)
                                .or_else(|| tsresol_units(layout::DEFAULT_TSRESOL))
                                .unwrap_or(1_000_000);
                            if state.interfaces.is_empty() {
                                state.linktype = Some(intf.linktype);
                                state.snaplen = intf.snaplen;
                                state.precision = Some(if units >= 1_000_000_000 {
                                    TimestampPrecision::Nano
                                } else {
                                    TimestampPrecision::Micro
                                });
                            }
                            state.interfaces.push(Interface {
                                linktype: intf.linktype,
                                snaplen: intf.snaplen,
                                units_per_second: units,
                            });
                            None
                        }
                        PcapBlockOwned::NG(Block::EnhancedPacket(packet)) => {
                            let interface = interface_for_id(&state.interfaces, packet.if_id);
                            let (seconds, fraction) = split_pcapng_timestamp(
                                packet.ts_high,
                                packet.ts_low,
                                interface.units_per_second,
                                state.precision(),
                            );
                            let data = truncate(packet.data, packet.caplen);
                            Some(OwnedPacket {
                                header: PacketHeader::new(
                                    seconds,
                                    fraction,
                                    state.precision(),
                                    data.len() as u32,
                                    packet.origlen,
                                ),
                                data: data.to_vec(),
                            })
                        }
                        PcapBlockOwned::NG(Block::SimplePacket(packet)) => {
                            let data = truncate(packet.data, packet.origlen);
                            Some(OwnedPacket {
                                header: PacketHeader::new(
                                    0,
                                    0,
                                    state.precision(),
                                    data.len() as u32,
                                    packet.origlen,
                                ),
                                data: data.to_vec(),
                            })
                        }
                        _ => None,
                    };
                    reader.consume(offset);
                    return Ok(record.map_or(Record::Meta, Record::Packet));
                }
                Err(PcapError::Eof) => return Ok(Record::Eof),
                Err(PcapError::Incomplete(_)) => {
                    reader.refill().map_err(|e| OfflineError::Pcap {
                        context: "pcapng reader refill",
                        message: e.to_string(),
                    })?;
                }
                Err(e) => {
                    return Err(OfflineError::Pcap {
                        context: "pcapng reader next",
                        message: e.to_string(),
                    });
                }
            },
        }
    }
}

fn truncate(data: &[u8], caplen: u32) -> &[u8] {
    &data[..data.len().min(caplen as usize)]
}
