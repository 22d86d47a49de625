use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use glob::glob;
use pcapbridge_core::{
    AbiSummary, BridgeError, Capture, HeaderAbi, PacketSink, PlatformInfo, Report,
    SavefileWriter, SinkHandler, SummaryCollector, TimestampPrecision,
};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::EnvFilter;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("PCAPBRIDGE_BUILD_COMMIT"),
    " ",
    env!("PCAPBRIDGE_BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "pcapbridge")]
#[command(version, long_version = LONG_VERSION)]
#[command(
    about = "Drive packet captures through the pcap dispatch bridge.",
    long_about = None,
    after_help = "Examples:\n  pcapbridge read capture.pcapng -o report.json\n  pcapbridge copy capture.pcapng copy.pcap --count 100\n  pcapbridge dump capture.pcap\n  pcapbridge abi --precision nano"
)]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug, -vvv trace); RUST_LOG wins
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Summarize a capture file into a versioned JSON report.
    #[command(alias = "summarize")]
    Read {
        /// Path to a .pcap or .pcapng file (glob patterns must match one file)
        input: PathBuf,

        /// Output report path (JSON)
        #[arg(short = 'o', long, required_unless_present = "stdout")]
        report: Option<PathBuf>,

        /// Write JSON report to stdout
        #[arg(long, conflicts_with = "report")]
        stdout: bool,

        /// Pretty-print JSON output
        #[arg(long)]
        pretty: bool,

        /// Stop after this many packets (0: all)
        #[arg(short = 'c', long)]
        count: Option<u32>,

        /// Suppress non-error output
        #[arg(long)]
        quiet: bool,
    },
    /// Copy packets into a classic pcap savefile.
    Copy {
        /// Path to a .pcap or .pcapng file
        input: PathBuf,

        /// Output .pcap path
        output: PathBuf,

        /// Stop after this many packets (0: all)
        #[arg(short = 'c', long)]
        count: Option<u32>,

        /// Suppress non-error output
        #[arg(long)]
        quiet: bool,
    },
    /// Print one line per packet, pulled one at a time.
    Dump {
        /// Path to a .pcap or .pcapng file
        input: PathBuf,

        /// Stop after this many packets (0: all)
        #[arg(short = 'c', long)]
        count: Option<u32>,
    },
    /// Print the capture header layout for this platform as JSON.
    Abi {
        /// Timestamp precision to resolve the layout for
        #[arg(long, value_enum, default_value_t = PrecisionArg::Micro)]
        precision: PrecisionArg,

        /// Pretty-print JSON output
        #[arg(long)]
        pretty: bool,
    },
    /// Capture from a network interface and print a JSON summary.
    #[cfg(feature = "libpcap")]
    Live {
        /// Interface name
        device: String,

        /// Stop after this many packets (0: until interrupted)
        #[arg(short = 'c', long)]
        count: Option<u32>,

        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,

        /// BPF filter expression
        #[arg(short = 'f', long)]
        filter: Option<String>,

        /// Snapshot length in bytes
        #[arg(long, default_value_t = 65535)]
        snaplen: u32,

        /// Do not put the interface into promiscuous mode
        #[arg(long)]
        no_promisc: bool,

        /// Timestamp precision
        #[arg(long, value_enum, default_value_t = PrecisionArg::Micro)]
        precision: PrecisionArg,

        /// Pretty-print JSON output
        #[arg(long)]
        pretty: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PrecisionArg {
    Micro,
    Nano,
}

impl From<PrecisionArg> for TimestampPrecision {
    fn from(value: PrecisionArg) -> Self {
        match value {
            PrecisionArg::Micro => TimestampPrecision::Micro,
            PrecisionArg::Nano => TimestampPrecision::Nano,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Read {
            input,
            report,
            stdout,
            pretty,
            count,
            quiet,
        } => cmd_read(input, report, stdout, pretty, count, quiet),
        Commands::Copy {
            input,
            output,
            count,
            quiet,
        } => cmd_copy(input, output, count, quiet),
        Commands::Dump { input, count } => cmd_dump(input, count),
        Commands::Abi { precision, pretty } => cmd_abi(precision.into(), pretty),
        #[cfg(feature = "libpcap")]
        Commands::Live {
            device,
            count,
            seconds,
            filter,
            snaplen,
            no_promisc,
            precision,
            pretty,
        } => cmd_live(LiveArgs {
            device,
            count,
            seconds,
            filter,
            snaplen,
            promiscuous: !no_promisc,
            precision: precision.into(),
            pretty,
        }),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}", err.message);
            if let Some(hint) = err.hint {
                eprintln!("hint: {}", hint);
            }
            ExitCode::from(2)
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

#[derive(Debug)]
struct CliError {
    message: String,
    hint: Option<String>,
}

impl CliError {
    fn new(message: impl Into<String>, hint: Option<String>) -> Self {
        Self {
            message: message.into(),
            hint,
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

impl From<anyhow::Error> for CliError {
    fn from(err: anyhow::Error) -> Self {
        CliError::new(format!("{err:#}"), None)
    }
}

impl From<BridgeError> for CliError {
    fn from(err: BridgeError) -> Self {
        let hint = match &err {
            BridgeError::Io(_) | BridgeError::Capture(_) => {
                Some("the file may be truncated or not a pcap/pcapng capture".to_string())
            }
            BridgeError::Abi(_) => {
                Some("this platform has no known capture header layout".to_string())
            }
            _ => None,
        };
        CliError::new(err.to_string(), hint)
    }
}

/// `--count` as a libpcap packet count: non-positive means "no limit".
fn packet_count(count: Option<u32>) -> i32 {
    count
        .and_then(|n| i32::try_from(n).ok())
        .filter(|n| *n > 0)
        .unwrap_or(-1)
}

fn cmd_read(
    input: PathBuf,
    report: Option<PathBuf>,
    stdout: bool,
    pretty: bool,
    count: Option<u32>,
    quiet: bool,
) -> Result<(), CliError> {
    let resolved_input = resolve_input_path(&input)?;
    validate_input_file(&resolved_input)?;
    let report = if stdout {
        None
    } else {
        let report = report.ok_or_else(|| {
            CliError::new(
                "missing output path",
                Some("use -o/--report or --stdout".to_string()),
            )
        })?;
        ensure_distinct_output(&resolved_input, &report)?;
        Some(report)
    };

    let meta = fs::metadata(&resolved_input)
        .with_context(|| format!("Failed to read input file: {}", resolved_input.display()))?;

    let mut capture = Capture::open_offline(&resolved_input)?;
    let mut collector = SummaryCollector::new(capture.datalink());
    capture.loop_with(packet_count(count), &mut (), &mut collector)?;
    tracing::info!(
        input = %resolved_input.display(),
        packets = collector.packets_total(),
        "capture summarized"
    );
    let rep = collector.finish(
        &resolved_input.display().to_string(),
        meta.len(),
        capture.abi(),
    );
    let json = serialize_report(&rep, pretty)?;

    let Some(report) = report else {
        print!("{}", json);
        return Ok(());
    };
    if let Some(parent) = report.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create output directory: {}", parent.display())
            })?;
        }
    }
    fs::write(&report, json)
        .with_context(|| format!("Failed to write report: {}", report.display()))?;

    if !quiet {
        eprintln!("OK: report written -> {}", report.display());
    }
    Ok(())
}

fn cmd_copy(
    input: PathBuf,
    output: PathBuf,
    count: Option<u32>,
    quiet: bool,
) -> Result<(), CliError> {
    let resolved_input = resolve_input_path(&input)?;
    validate_input_file(&resolved_input)?;
    ensure_distinct_output(&resolved_input, &output)?;

    let mut capture = Capture::open_offline(&resolved_input)?;
    let file = File::create(&output)
        .with_context(|| format!("Failed to create output file: {}", output.display()))?;
    let writer = SavefileWriter::new(
        BufWriter::new(file),
        capture.datalink(),
        capture.snapshot(),
        capture.abi().precision(),
    )
    .with_context(|| format!("Failed to write savefile header: {}", output.display()))?;

    let mut sink = SinkHandler(writer);
    capture.loop_with(packet_count(count), &mut (), &mut sink)?;
    let mut writer = sink.into_inner();
    writer
        .flush()
        .with_context(|| format!("Failed to write output file: {}", output.display()))?;

    if !quiet {
        eprintln!(
            "OK: {} packets copied -> {}",
            writer.written(),
            output.display()
        );
    }
    Ok(())
}

fn cmd_dump(input: PathBuf, count: Option<u32>) -> Result<(), CliError> {
    let resolved_input = resolve_input_path(&input)?;
    validate_input_file(&resolved_input)?;

    let limit = match packet_count(count) {
        n if n > 0 => Some(n as u64),
        _ => None,
    };
    let mut capture = Capture::open_offline(&resolved_input)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut index = 0u64;
    while limit.is_none_or(|limit| index < limit) {
        let packet = match capture.next_ex() {
            Ok(Some(packet)) => packet,
            Ok(None) => break,
            Err(err) if err.is_timeout() => continue,
            Err(err) => return Err(err.into()),
        };
        index += 1;
        let header = packet.header().decode();
        let ts = header
            .timestamp()
            .and_then(|ts| ts.format(&Rfc3339).ok())
            .unwrap_or_else(|| format!("{}.{}", header.ts_sec, header.ts_frac));
        writeln!(
            out,
            "{} {} caplen={} len={}",
            index, ts, header.caplen, header.len
        )
        .context("Failed to write to stdout")?;
    }
    Ok(())
}

#[derive(Serialize)]
struct AbiInfo {
    platform: PlatformInfo,
    abi: AbiSummary,
}

fn cmd_abi(precision: TimestampPrecision, pretty: bool) -> Result<(), CliError> {
    let platform = PlatformInfo::native(precision);
    let abi = HeaderAbi::resolve(&platform).map_err(BridgeError::from)?;
    let info = AbiInfo {
        platform,
        abi: abi.into(),
    };
    let json = if pretty {
        serde_json::to_string_pretty(&info)
    } else {
        serde_json::to_string(&info)
    }
    .context("JSON serialization failed")?;
    println!("{}", json);
    Ok(())
}

#[cfg(feature = "libpcap")]
struct LiveArgs {
    device: String,
    count: Option<u32>,
    seconds: Option<u64>,
    filter: Option<String>,
    snaplen: u32,
    promiscuous: bool,
    precision: TimestampPrecision,
    pretty: bool,
}

#[cfg(feature = "libpcap")]
fn cmd_live(args: LiveArgs) -> Result<(), CliError> {
    use std::thread;
    use std::time::Duration;

    let config = pcapbridge_core::CaptureConfig {
        snaplen: args.snaplen,
        promiscuous: args.promiscuous,
        precision: args.precision,
        ..pcapbridge_core::CaptureConfig::default()
    };
    let mut capture = Capture::open_live(&args.device, &config).map_err(|err| {
        CliError::new(
            err.to_string(),
            Some("live capture usually needs root or CAP_NET_RAW".to_string()),
        )
    })?;
    if let Some(filter) = args.filter.as_deref() {
        capture.native_mut().set_filter(filter, true)?;
    }
    if let Some(seconds) = args.seconds {
        let interrupter = capture.interrupter();
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(seconds));
            interrupter.interrupt();
        });
    }

    let mut collector = SummaryCollector::new(capture.datalink());
    let outcome = capture.loop_with(packet_count(args.count), &mut (), &mut collector)?;
    tracing::info!(broken = outcome.is_broken(), "live capture finished");

    let mut rep = collector.finish(&args.device, 0, capture.abi());
    rep.stats = capture.stats().ok();
    println!("{}", serialize_report(&rep, args.pretty)?);
    Ok(())
}

fn serialize_report(rep: &Report, pretty: bool) -> Result<String, CliError> {
    rep.to_json(pretty)
        .context("JSON serialization failed")
        .map_err(Into::into)
}

fn ensure_distinct_output(input: &Path, output: &Path) -> Result<(), CliError> {
    let input_abs = fs::canonicalize(input)
        .with_context(|| format!("Failed to resolve input path: {}", input.display()))?;
    let parent = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    // A missing output directory is created later and cannot hold the input.
    let Ok(output_dir) = fs::canonicalize(parent) else {
        return Ok(());
    };
    let file_name = output
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("Invalid output path: {}", output.display()))?;
    if output_dir.join(file_name) == input_abs {
        return Err(CliError::new(
            format!("output path must differ from input: {}", output.display()),
            Some("choose a different output path".to_string()),
        ));
    }
    Ok(())
}

fn validate_input_file(input: &Path) -> Result<(), CliError> {
    if !input.exists() {
        return Err(CliError::new(
            format!("input file not found: {}", input.display()),
            Some("use a .pcap or .pcapng file".to_string()),
        ));
    }
    if !input.is_file() {
        return Err(CliError::new(
            format!("input is not a file: {}", input.display()),
            Some("use a .pcap or .pcapng file".to_string()),
        ));
    }
    let ext = input
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    if ext != "pcap" && ext != "pcapng" {
        return Err(CliError::new(
            format!("unsupported input format '{}'", input.display()),
            Some("expected a .pcap or .pcapng file".to_string()),
        ));
    }
    Ok(())
}

fn resolve_input_path(input: &Path) -> Result<PathBuf, CliError> {
    let pattern = input.to_string_lossy();
    if !is_glob_pattern(&pattern) {
        return Ok(input.to_path_buf());
    }

    let mut matches = Vec::new();
    let paths = glob(&pattern).map_err(|err| {
        CliError::new(
            format!("invalid input pattern '{}'", pattern),
            Some(format!("pattern error: {}", err.msg)),
        )
    })?;
    for entry in paths {
        let path = entry.map_err(|err| {
            CliError::new(
                format!("invalid input pattern '{}'", pattern),
                Some(format!("pattern error: {}", err)),
            )
        })?;
        if path.is_file() {
            matches.push(path);
        }
    }

    if matches.is_empty() {
        return Err(CliError::new(
            format!("no files match pattern '{}'", pattern),
            Some("check the path or quote the pattern; expected .pcap or .pcapng".to_string()),
        ));
    }
    if matches.len() > 1 {
        let listed = matches
            .iter()
            .take(3)
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let more = if matches.len() > 3 { ", ..." } else { "" };
        return Err(CliError::new(
            format!(
                "multiple files match pattern '{}' ({} matches); matches: {}{}",
                pattern,
                matches.len(),
                listed,
                more
            ),
            Some("pass a single capture file, or run once per file".to_string()),
        ));
    }

    Ok(matches.remove(0))
}

fn is_glob_pattern(input: &str) -> bool {
    input.contains('*') || input.contains('?') || input.contains('[')
}
