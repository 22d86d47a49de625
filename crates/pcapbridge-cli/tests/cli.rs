use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use pcapbridge_core::{Linktype, PacketHeader, PacketSink, SavefileWriter, TimestampPrecision};
use predicates::prelude::PredicateBooleanExt;
use predicates::str::contains;
use serde_json::Value;
use tempfile::TempDir;

fn cmd() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("pcapbridge"))
}

/// Ethernet/IPv4/UDP frame with zeroed checksums.
fn udp_frame(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let udp_len = (8 + payload.len()) as u16;
    let ip_len = 20 + udp_len;
    let mut frame = Vec::new();
    frame.extend_from_slice(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
    frame.extend_from_slice(&[0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f]);
    frame.extend_from_slice(&0x0800u16.to_be_bytes());
    frame.extend_from_slice(&[0x45, 0x00]);
    frame.extend_from_slice(&ip_len.to_be_bytes());
    frame.extend_from_slice(&[0, 0, 0, 0, 64, 17, 0, 0]);
    frame.extend_from_slice(&[192, 168, 1, 10]);
    frame.extend_from_slice(&[192, 168, 1, 20]);
    frame.extend_from_slice(&src_port.to_be_bytes());
    frame.extend_from_slice(&dst_port.to_be_bytes());
    frame.extend_from_slice(&udp_len.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn write_capture(path: &Path, packets: u32) {
    let file = BufWriter::new(File::create(path).expect("create capture"));
    let mut writer = SavefileWriter::new(file, Linktype::ETHERNET, 65535, TimestampPrecision::Micro)
        .expect("savefile header");
    for i in 0..packets {
        let frame = udp_frame(5000, 6000, &[i as u8; 12]);
        let len = frame.len() as u32;
        let header =
            PacketHeader::new(1_700_000_000 + i64::from(i), 0, TimestampPrecision::Micro, len, len);
        writer.write_packet(&header, &frame).expect("write packet");
    }
    writer.flush().expect("flush capture");
}

fn sample_capture(temp: &TempDir) -> PathBuf {
    let path = temp.path().join("input.pcap");
    write_capture(&path, 4);
    path
}

#[test]
fn help_supports_read_and_summarize() {
    cmd().arg("read").arg("--help").assert().success();
    cmd().arg("summarize").arg("--help").assert().success();
}

#[test]
fn missing_input_shows_error_and_hint() {
    let temp = TempDir::new().expect("tempdir");
    let missing = temp.path().join("missing.pcapng");
    let report = temp.path().join("report.json");

    cmd()
        .arg("read")
        .arg(missing)
        .arg("-o")
        .arg(report)
        .assert()
        .failure()
        .code(2)
        .stderr(contains("error:").and(contains("hint:")));
}

#[test]
fn stdout_outputs_json_report() {
    let temp = TempDir::new().expect("tempdir");
    let input = sample_capture(&temp);
    let assert = cmd().arg("read").arg(input).arg("--stdout").assert().success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).expect("utf8 stdout");
    let report: Value = serde_json::from_str(&stdout).expect("valid json");

    assert_eq!(report["capture_summary"]["packets_total"], 4);
    assert_eq!(report["tool"]["name"], "pcapbridge");
    assert_eq!(report["flows"][0]["src"], "192.168.1.10:5000");
    assert_eq!(report["flows"][0]["packets"], 4);
}

#[test]
fn count_limits_the_report() {
    let temp = TempDir::new().expect("tempdir");
    let input = sample_capture(&temp);
    let assert = cmd()
        .arg("read")
        .arg(input)
        .arg("--stdout")
        .arg("--count")
        .arg("2")
        .assert()
        .success();
    let report: Value = serde_json::from_slice(&assert.get_output().stdout).expect("valid json");
    assert_eq!(report["capture_summary"]["packets_total"], 2);
}

#[test]
fn stdout_and_report_conflict() {
    let temp = TempDir::new().expect("tempdir");
    let input = sample_capture(&temp);
    let report = temp.path().join("report.json");

    cmd()
        .arg("read")
        .arg(input)
        .arg("--stdout")
        .arg("-o")
        .arg(report)
        .assert()
        .failure()
        .stderr(contains("error:"));
}

#[test]
fn report_written_and_quiet_suppresses_ok_message() {
    let temp = TempDir::new().expect("tempdir");
    let input = sample_capture(&temp);
    let report = temp.path().join("out").join("report.json");

    cmd()
        .arg("read")
        .arg(&input)
        .arg("-o")
        .arg(&report)
        .assert()
        .success()
        .stderr(contains("OK: report written"));
    assert!(report.is_file());

    cmd()
        .arg("read")
        .arg(&input)
        .arg("-o")
        .arg(&report)
        .arg("--quiet")
        .assert()
        .success()
        .stderr(contains("OK:").not());
}

#[test]
fn report_must_not_overwrite_input() {
    let temp = TempDir::new().expect("tempdir");
    let input = sample_capture(&temp);

    cmd()
        .arg("read")
        .arg(&input)
        .arg("-o")
        .arg(&input)
        .assert()
        .failure()
        .stderr(contains("must differ from input"));
}

#[test]
fn glob_resolves_single_match() {
    let temp = TempDir::new().expect("tempdir");
    sample_capture(&temp);
    let pattern = temp.path().join("*.pcap");

    cmd()
        .arg("read")
        .arg(pattern)
        .arg("--stdout")
        .assert()
        .success();
}

#[test]
fn glob_with_multiple_matches_fails() {
    let temp = TempDir::new().expect("tempdir");
    write_capture(&temp.path().join("a.pcap"), 1);
    write_capture(&temp.path().join("b.pcap"), 1);
    let pattern = temp.path().join("*.pcap");

    cmd()
        .arg("read")
        .arg(pattern)
        .arg("--stdout")
        .assert()
        .failure()
        .stderr(contains("multiple files match").and(contains("hint:")));
}

#[test]
fn unsupported_extension_is_rejected() {
    let temp = TempDir::new().expect("tempdir");
    let input = temp.path().join("capture.txt");
    std::fs::write(&input, b"not a capture").expect("write input");

    cmd()
        .arg("dump")
        .arg(input)
        .assert()
        .failure()
        .stderr(contains("unsupported input format"));
}

#[test]
fn corrupt_capture_reports_hint() {
    let temp = TempDir::new().expect("tempdir");
    let input = temp.path().join("broken.pcap");
    std::fs::write(&input, [0xd4, 0xc3]).expect("write input");

    cmd()
        .arg("dump")
        .arg(input)
        .assert()
        .failure()
        .code(2)
        .stderr(contains("hint: the file may be truncated"));
}

#[test]
fn copy_writes_a_readable_savefile() {
    let temp = TempDir::new().expect("tempdir");
    let input = sample_capture(&temp);
    let output = temp.path().join("copy.pcap");

    cmd()
        .arg("copy")
        .arg(&input)
        .arg(&output)
        .arg("--count")
        .arg("3")
        .assert()
        .success()
        .stderr(contains("OK: 3 packets copied"));

    let assert = cmd().arg("dump").arg(&output).assert().success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).expect("utf8 stdout");
    let lines: Vec<_> = stdout.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[2], "3 2023-11-14T22:13:22Z caplen=54 len=54");
}

#[test]
fn dump_prints_one_line_per_packet() {
    let temp = TempDir::new().expect("tempdir");
    let input = sample_capture(&temp);
    let assert = cmd().arg("dump").arg(input).assert().success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).expect("utf8 stdout");
    let lines: Vec<_> = stdout.lines().collect();

    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], "1 2023-11-14T22:13:20Z caplen=54 len=54");
}

#[test]
fn abi_prints_layout_json() {
    let assert = cmd()
        .arg("abi")
        .arg("--precision")
        .arg("nano")
        .assert()
        .success();
    let value: Value = serde_json::from_slice(&assert.get_output().stdout).expect("valid json");
    assert_eq!(value["abi"]["precision"], "nano");
    assert!(value["abi"]["header_len"].as_u64().expect("header_len") >= 16);
    assert!(value["platform"]["pointer_width"].is_number());
}
