#![allow(dead_code)]

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

use etherparse::PacketBuilder;
use pcapbridge_core::{Linktype, PacketHeader, PacketSink, SavefileWriter, TimestampPrecision};

/// Ethernet/IPv4/UDP frame with `payload`.
pub fn udp_frame(src: [u8; 4], dst: [u8; 4], src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2([0x01, 0x02, 0x03, 0x04, 0x05, 0x06], [0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f])
        .ipv4(src, dst, 64)
        .udp(src_port, dst_port);
    let mut packet = Vec::with_capacity(builder.size(payload.len()));
    builder
        .write(&mut packet, payload)
        .expect("write udp frame");
    packet
}

/// Classic pcap written through the crate's own savefile writer.
pub fn write_pcap(path: &Path, precision: TimestampPrecision, packets: &[(i64, u32, Vec<u8>)]) {
    let file = BufWriter::new(File::create(path).expect("create pcap"));
    let mut writer =
        SavefileWriter::new(file, Linktype::ETHERNET, 65535, precision).expect("global header");
    for (sec, frac, data) in packets {
        let len = data.len() as u32;
        let header = PacketHeader::new(*sec, *frac, precision, len, len);
        writer.write_packet(&header, data).expect("write record");
    }
    writer.flush().expect("flush pcap");
}

/// Big-endian pcapng section with one Ethernet interface. `tsresol` adds an
/// `if_tsresol` option; timestamps are in that interface's units.
pub fn write_pcapng(path: &Path, tsresol: Option<u8>, packets: &[(u64, Vec<u8>)]) {
    let mut output = Vec::new();
    output.extend_from_slice(&pcapng_block(0x0A0D0D0A, &section_header_body()));
    output.extend_from_slice(&pcapng_block(1, &interface_desc_body(tsresol)));
    for (ts, data) in packets {
        output.extend_from_slice(&pcapng_block(6, &enhanced_packet_body(*ts, data)));
    }
    fs::write(path, output).expect("write pcapng");
}

fn pcapng_block(block_type: u32, body: &[u8]) -> Vec<u8> {
    let total_len = (8 + body.len() + 4) as u32;
    let mut block = Vec::with_capacity(total_len as usize);
    block.extend_from_slice(&block_type.to_be_bytes());
    block.extend_from_slice(&total_len.to_be_bytes());
    block.extend_from_slice(body);
    block.extend_from_slice(&total_len.to_be_bytes());
    block
}

fn section_header_body() -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0x1A2B3C4Du32.to_be_bytes());
    body.extend_from_slice(&1u16.to_be_bytes());
    body.extend_from_slice(&0u16.to_be_bytes());
    body.extend_from_slice(&(-1i64).to_be_bytes());
    body
}

fn interface_desc_body(tsresol: Option<u8>) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&1u16.to_be_bytes());
    body.extend_from_slice(&0u16.to_be_bytes());
    body.extend_from_slice(&65535u32.to_be_bytes());
    if let Some(tsresol) = tsresol {
        body.extend_from_slice(&9u16.to_be_bytes());
        body.extend_from_slice(&1u16.to_be_bytes());
        body.extend_from_slice(&[tsresol, 0, 0, 0]);
        body.extend_from_slice(&0u16.to_be_bytes());
        body.extend_from_slice(&0u16.to_be_bytes());
    }
    body
}

fn enhanced_packet_body(ts: u64, data: &[u8]) -> Vec<u8> {
    let ts_high = ((ts >> 32) & 0xFFFF_FFFF) as u32;
    let ts_low = (ts & 0xFFFF_FFFF) as u32;
    let cap_len = data.len() as u32;
    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_be_bytes());
    body.extend_from_slice(&ts_high.to_be_bytes());
    body.extend_from_slice(&ts_low.to_be_bytes());
    body.extend_from_slice(&cap_len.to_be_bytes());
    body.extend_from_slice(&cap_len.to_be_bytes());
    body.extend_from_slice(data);
    let pad_len = (4 - (data.len() % 4)) % 4;
    body.extend(std::iter::repeat_n(0u8, pad_len));
    body
}
