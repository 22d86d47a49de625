//! Packet sinks, including a classic savefile writer (`pcap_dump`).

use std::io::{self, Write};

use pcap_parser::Linktype;

use crate::abi::{AbiVariant, ByteOrder, HeaderAbi, TimestampPrecision};
use crate::native::offline::layout::{PCAP_MAGIC_MICRO, PCAP_MAGIC_NANO};
use crate::packet::PacketHeader;

const VERSION_MAJOR: u16 = 2;
const VERSION_MINOR: u16 = 4;

/// Destination for packets copied out of a capture.
pub trait PacketSink {
    fn write_packet(&mut self, header: &PacketHeader, data: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<S: PacketSink + ?Sized> PacketSink for &mut S {
    fn write_packet(&mut self, header: &PacketHeader, data: &[u8]) -> io::Result<()> {
        (**self).write_packet(header, data)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }
}

/// Writes little-endian classic pcap files.
///
/// Record headers use the 16-byte on-disk layout, which is the 32-bit
/// `struct pcap_pkthdr` layout, so they are encoded through [`HeaderAbi`].
///
/// # Examples
/// ```
/// use pcapbridge_core::{Linktype, PacketHeader, PacketSink, SavefileWriter, TimestampPrecision};
///
/// let mut writer = SavefileWriter::new(Vec::new(), Linktype::ETHERNET, 65535, TimestampPrecision::Micro)?;
/// let header = PacketHeader::new(1, 2, TimestampPrecision::Micro, 3, 3);
/// writer.write_packet(&header, &[1, 2, 3])?;
/// let bytes = writer.into_inner();
/// assert_eq!(bytes.len(), 24 + 16 + 3);
/// # Ok::<(), std::io::Error>(())
/// ```
pub struct SavefileWriter<W: Write> {
    writer: W,
    abi: HeaderAbi,
    record: Vec<u8>,
    written: u64,
}

impl<W: Write> SavefileWriter<W> {
    /// Write the global header and return a writer for records.
    ///
    /// # Errors
    /// Returns the I/O error from writing the global header.
    pub fn new(
        mut writer: W,
        linktype: Linktype,
        snaplen: u32,
        precision: TimestampPrecision,
    ) -> io::Result<Self> {
        let (magic, variant) = match precision {
            TimestampPrecision::Micro => (PCAP_MAGIC_MICRO, AbiVariant::Legacy32),
            TimestampPrecision::Nano => (PCAP_MAGIC_NANO, AbiVariant::Legacy32Nano),
        };
        let mut global = Vec::with_capacity(24);
        global.extend_from_slice(&magic.to_le_bytes());
        global.extend_from_slice(&VERSION_MAJOR.to_le_bytes());
        global.extend_from_slice(&VERSION_MINOR.to_le_bytes());
        global.extend_from_slice(&0i32.to_le_bytes());
        global.extend_from_slice(&0u32.to_le_bytes());
        global.extend_from_slice(&snaplen.to_le_bytes());
        global.extend_from_slice(&(linktype.0 as u32).to_le_bytes());
        writer.write_all(&global)?;

        let abi = HeaderAbi::new(variant, ByteOrder::Little);
        Ok(Self {
            writer,
            abi,
            record: vec![0u8; abi.header_len()],
            written: 0,
        })
    }

    /// Records written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> PacketSink for SavefileWriter<W> {
    fn write_packet(&mut self, header: &PacketHeader, data: &[u8]) -> io::Result<()> {
        let precision = self.abi.precision();
        let caplen = record_len(data.len())?;
        let record = PacketHeader::new(
            header.ts_sec,
            header.fraction_in(precision),
            precision,
            caplen,
            header.len.max(caplen),
        );
        self.abi
            .encode(&record, &mut self.record)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        self.writer.write_all(&self.record)?;
        self.writer.write_all(data)?;
        self.written += 1;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Record lengths are 32-bit on disk.
fn record_len(len: usize) -> io::Result<u32> {
    u32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("packet of {len} bytes does not fit a savefile record"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_header_is_little_endian() {
        let writer =
            SavefileWriter::new(Vec::new(), Linktype::RAW, 256, TimestampPrecision::Nano).unwrap();
        let bytes = writer.into_inner();
        assert_eq!(&bytes[0..4], &[0x4d, 0x3c, 0xb2, 0xa1]);
        assert_eq!(&bytes[4..8], &[2, 0, 4, 0]);
        assert_eq!(&bytes[16..20], &256u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &101u32.to_le_bytes());
    }

    #[test]
    fn records_convert_timestamp_precision() {
        let mut writer =
            SavefileWriter::new(Vec::new(), Linktype::ETHERNET, 65535, TimestampPrecision::Micro)
                .unwrap();
        let header = PacketHeader::new(5, 123_456_789, TimestampPrecision::Nano, 2, 60);
        writer.write_packet(&header, &[0xaa, 0xbb]).unwrap();
        assert_eq!(writer.written(), 1);
        let bytes = writer.into_inner();
        let record = &bytes[24..];
        assert_eq!(&record[0..4], &5u32.to_le_bytes());
        assert_eq!(&record[4..8], &123_456u32.to_le_bytes());
        assert_eq!(&record[8..12], &2u32.to_le_bytes());
        assert_eq!(&record[12..16], &60u32.to_le_bytes());
        assert_eq!(&record[16..], &[0xaa, 0xbb]);
    }

    #[test]
    fn timestamps_beyond_32_bits_are_rejected() {
        let mut writer =
            SavefileWriter::new(Vec::new(), Linktype::ETHERNET, 65535, TimestampPrecision::Micro)
                .unwrap();
        let header = PacketHeader::new(i64::from(u32::MAX) + 1, 0, TimestampPrecision::Micro, 0, 0);
        let err = writer.write_packet(&header, &[]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn record_length_must_fit_32_bits() {
        assert_eq!(record_len(1514).unwrap(), 1514);
        assert_eq!(record_len(u32::MAX as usize).unwrap(), u32::MAX);
        #[cfg(target_pointer_width = "64")]
        {
            let err = record_len(u32::MAX as usize + 1).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        }
    }
}
