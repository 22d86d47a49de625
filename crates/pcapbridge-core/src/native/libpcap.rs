//! System libpcap engine.
//!
//! All `unsafe extern` declarations for libpcap live in [`ffi`]; the rest of
//! the module wraps them behind [`NativeCapture`]. The `pcap_t` is shared
//! between the capture and its break handles through an `Arc`, so a break
//! request racing with close never touches a freed handle.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::{Arc, Weak};

use pcap_parser::Linktype;

use crate::abi::{PlatformInfo, TimestampPrecision};
use crate::config::CaptureConfig;
use crate::error::BridgeError;
use crate::stats::{CaptureStat, decode_pcap_stat, pcap_stat_len};

use super::{BreakLoop, NativeCapture, RawCallback};

const PCAP_ERRBUF_SIZE: usize = 256;
const PCAP_TSTAMP_PRECISION_MICRO: c_int = 0;
const PCAP_TSTAMP_PRECISION_NANO: c_int = 1;
const PCAP_NETMASK_UNKNOWN: u32 = 0xffff_ffff;

pub(crate) mod ffi {
    use std::os::raw::{c_char, c_int, c_uint, c_void};

    use crate::native::RawCallback;

    /// Opaque `pcap_t`.
    #[repr(C)]
    pub struct PcapRaw {
        _private: [u8; 0],
    }

    #[repr(C)]
    pub struct BpfProgram {
        pub bf_len: c_uint,
        pub bf_insns: *mut c_void,
    }

    #[cfg_attr(windows, link(name = "wpcap"))]
    #[cfg_attr(not(windows), link(name = "pcap"))]
    unsafe extern "C" {
        pub fn pcap_create(source: *const c_char, errbuf: *mut c_char) -> *mut PcapRaw;
        pub fn pcap_set_snaplen(p: *mut PcapRaw, snaplen: c_int) -> c_int;
        pub fn pcap_set_promisc(p: *mut PcapRaw, promisc: c_int) -> c_int;
        pub fn pcap_set_timeout(p: *mut PcapRaw, to_ms: c_int) -> c_int;
        pub fn pcap_set_buffer_size(p: *mut PcapRaw, size: c_int) -> c_int;
        pub fn pcap_set_immediate_mode(p: *mut PcapRaw, mode: c_int) -> c_int;
        pub fn pcap_set_tstamp_precision(p: *mut PcapRaw, precision: c_int) -> c_int;
        pub fn pcap_activate(p: *mut PcapRaw) -> c_int;
        pub fn pcap_open_offline_with_tstamp_precision(
            fname: *const c_char,
            precision: c_uint,
            errbuf: *mut c_char,
        ) -> *mut PcapRaw;
        pub fn pcap_open_dead_with_tstamp_precision(
            linktype: c_int,
            snaplen: c_int,
            precision: c_uint,
        ) -> *mut PcapRaw;
        pub fn pcap_close(p: *mut PcapRaw);

        pub fn pcap_dispatch(p: *mut PcapRaw, cnt: c_int, callback: RawCallback, user: *mut u8) -> c_int;
        pub fn pcap_loop(p: *mut PcapRaw, cnt: c_int, callback: RawCallback, user: *mut u8) -> c_int;
        pub fn pcap_next(p: *mut PcapRaw, header: *mut u8) -> *const u8;
        pub fn pcap_next_ex(p: *mut PcapRaw, header: *mut *const u8, data: *mut *const u8) -> c_int;
        pub fn pcap_breakloop(p: *mut PcapRaw);

        pub fn pcap_geterr(p: *mut PcapRaw) -> *mut c_char;
        pub fn pcap_datalink(p: *mut PcapRaw) -> c_int;
        pub fn pcap_snapshot(p: *mut PcapRaw) -> c_int;
        pub fn pcap_get_tstamp_precision(p: *mut PcapRaw) -> c_int;
        pub fn pcap_stats(p: *mut PcapRaw, stats: *mut c_void) -> c_int;

        pub fn pcap_compile(
            p: *mut PcapRaw,
            program: *mut BpfProgram,
            expression: *const c_char,
            optimize: c_int,
            netmask: c_uint,
        ) -> c_int;
        pub fn pcap_setfilter(p: *mut PcapRaw, program: *mut BpfProgram) -> c_int;
        pub fn pcap_freecode(program: *mut BpfProgram);
        pub fn pcap_lib_version() -> *const c_char;
    }
}

struct PcapHandle(NonNull<ffi::PcapRaw>);

// SAFETY: libpcap handles may move between threads; `pcap_breakloop` is the
// only call made concurrently and is documented as safe for that use.
unsafe impl Send for PcapHandle {}
unsafe impl Sync for PcapHandle {}

impl PcapHandle {
    fn as_ptr(&self) -> *mut ffi::PcapRaw {
        self.0.as_ptr()
    }
}

impl Drop for PcapHandle {
    fn drop(&mut self) {
        // SAFETY: the handle was returned by a pcap open call and is closed once.
        unsafe { ffi::pcap_close(self.as_ptr()) };
    }
}

struct PcapBreak(Weak<PcapHandle>);

impl BreakLoop for PcapBreak {
    fn request_break(&self) {
        if let Some(handle) = self.0.upgrade() {
            // SAFETY: the upgraded Arc keeps the handle open for this call.
            unsafe { ffi::pcap_breakloop(handle.as_ptr()) };
        }
    }
}

/// Capture handle opened through the system libpcap.
pub struct LibpcapCapture {
    handle: Arc<PcapHandle>,
}

impl LibpcapCapture {
    /// Create, configure and activate a live capture on `device`.
    ///
    /// # Errors
    /// Returns `BridgeError::Native` with libpcap's message.
    pub fn open_live(device: &str, config: &CaptureConfig) -> Result<Self, BridgeError> {
        let device = c_string(device, "pcap_create")?;
        let mut errbuf = [0 as c_char; PCAP_ERRBUF_SIZE];
        // SAFETY: valid C string and an errbuf of PCAP_ERRBUF_SIZE bytes.
        let raw = unsafe { ffi::pcap_create(device.as_ptr(), errbuf.as_mut_ptr()) };
        let capture = Self::from_raw(raw, &errbuf, "pcap_create")?;
        let p = capture.handle.as_ptr();

        // SAFETY: `p` is a created, not yet activated handle.
        unsafe {
            ffi::pcap_set_snaplen(p, clamp(config.snaplen));
            ffi::pcap_set_promisc(p, c_int::from(config.promiscuous));
            ffi::pcap_set_timeout(p, clamp(config.timeout_ms));
            if config.buffer_size > 0 {
                ffi::pcap_set_buffer_size(p, clamp(config.buffer_size));
            }
            ffi::pcap_set_immediate_mode(p, c_int::from(config.immediate_mode));
            ffi::pcap_set_tstamp_precision(p, precision_code(config.precision));
        }
        // SAFETY: as above.
        let rc = unsafe { ffi::pcap_activate(p) };
        if rc < 0 {
            return Err(BridgeError::Native {
                context: "pcap_activate",
                message: capture.last_error(),
            });
        }
        if rc > 0 {
            tracing::warn!(rc, warning = %capture.last_error(), "pcap_activate warning");
        }
        tracing::info!(device = %device.to_string_lossy(), "opened live capture");
        Ok(capture)
    }

    /// Open a trace file through libpcap's own savefile reader.
    ///
    /// # Errors
    /// Returns `BridgeError::Native` with libpcap's message.
    pub fn open_offline(path: &Path, precision: TimestampPrecision) -> Result<Self, BridgeError> {
        let fname = c_string(&path.to_string_lossy(), "pcap_open_offline")?;
        let mut errbuf = [0 as c_char; PCAP_ERRBUF_SIZE];
        // SAFETY: valid C string and an errbuf of PCAP_ERRBUF_SIZE bytes.
        let raw = unsafe {
            ffi::pcap_open_offline_with_tstamp_precision(
                fname.as_ptr(),
                precision_code(precision) as u32,
                errbuf.as_mut_ptr(),
            )
        };
        Self::from_raw(raw, &errbuf, "pcap_open_offline")
    }

    /// `pcap_open_dead`.
    ///
    /// # Errors
    /// Returns `BridgeError::Native` when libpcap cannot allocate the handle.
    pub fn open_dead(
        linktype: Linktype,
        snaplen: u32,
        precision: TimestampPrecision,
    ) -> Result<Self, BridgeError> {
        // SAFETY: plain values only.
        let raw = unsafe {
            ffi::pcap_open_dead_with_tstamp_precision(
                linktype.0,
                clamp(snaplen),
                precision_code(precision) as u32,
            )
        };
        Self::from_raw(raw, &[0; PCAP_ERRBUF_SIZE], "pcap_open_dead")
    }

    fn from_raw(
        raw: *mut ffi::PcapRaw,
        errbuf: &[c_char; PCAP_ERRBUF_SIZE],
        context: &'static str,
    ) -> Result<Self, BridgeError> {
        match NonNull::new(raw) {
            Some(ptr) => Ok(Self {
                handle: Arc::new(PcapHandle(ptr)),
            }),
            None => Err(BridgeError::Native {
                context,
                // SAFETY: libpcap NUL-terminates the error buffer.
                message: unsafe { CStr::from_ptr(errbuf.as_ptr()) }
                    .to_string_lossy()
                    .into_owned(),
            }),
        }
    }

    /// Compile `expression` and install it as the capture filter.
    ///
    /// # Errors
    /// Returns `BridgeError::Native` when compiling or installing fails.
    pub fn set_filter(&mut self, expression: &str, optimize: bool) -> Result<(), BridgeError> {
        let expression = c_string(expression, "pcap_compile")?;
        let mut program = ffi::BpfProgram {
            bf_len: 0,
            bf_insns: std::ptr::null_mut(),
        };
        let p = self.handle.as_ptr();
        // SAFETY: valid handle, program and C string.
        let rc = unsafe {
            ffi::pcap_compile(
                p,
                &mut program,
                expression.as_ptr(),
                c_int::from(optimize),
                PCAP_NETMASK_UNKNOWN,
            )
        };
        if rc < 0 {
            return Err(BridgeError::Native {
                context: "pcap_compile",
                message: self.last_error(),
            });
        }
        // SAFETY: `program` was filled in by pcap_compile and is freed once.
        let rc = unsafe { ffi::pcap_setfilter(p, &mut program) };
        unsafe { ffi::pcap_freecode(&mut program) };
        if rc < 0 {
            return Err(BridgeError::Native {
                context: "pcap_setfilter",
                message: self.last_error(),
            });
        }
        Ok(())
    }

    pub fn lib_version() -> String {
        // SAFETY: libpcap returns a static NUL-terminated string.
        unsafe { CStr::from_ptr(ffi::pcap_lib_version()) }
            .to_string_lossy()
            .into_owned()
    }

    fn precision(&self) -> TimestampPrecision {
        // SAFETY: valid handle.
        match unsafe { ffi::pcap_get_tstamp_precision(self.handle.as_ptr()) } {
            PCAP_TSTAMP_PRECISION_NANO => TimestampPrecision::Nano,
            _ => TimestampPrecision::Micro,
        }
    }
}

impl NativeCapture for LibpcapCapture {
    fn platform(&self) -> PlatformInfo {
        PlatformInfo::native(self.precision())
    }

    fn datalink(&self) -> Linktype {
        // SAFETY: valid handle.
        Linktype(unsafe { ffi::pcap_datalink(self.handle.as_ptr()) })
    }

    fn snapshot(&self) -> u32 {
        // SAFETY: valid handle.
        let snaplen = unsafe { ffi::pcap_snapshot(self.handle.as_ptr()) };
        u32::try_from(snaplen).unwrap_or(0)
    }

    unsafe fn dispatch_raw(&mut self, count: i32, callback: RawCallback, user: *mut u8) -> i32 {
        // SAFETY: forwarded caller contract.
        unsafe { ffi::pcap_dispatch(self.handle.as_ptr(), count, callback, user) }
    }

    unsafe fn loop_raw(&mut self, count: i32, callback: RawCallback, user: *mut u8) -> i32 {
        // SAFETY: forwarded caller contract.
        unsafe { ffi::pcap_loop(self.handle.as_ptr(), count, callback, user) }
    }

    unsafe fn next_raw(&mut self, header: *mut u8) -> *const u8 {
        // SAFETY: forwarded caller contract.
        unsafe { ffi::pcap_next(self.handle.as_ptr(), header) }
    }

    unsafe fn next_ex_raw(&mut self, header: *mut *const u8, packet: *mut *const u8) -> i32 {
        // SAFETY: forwarded caller contract.
        unsafe { ffi::pcap_next_ex(self.handle.as_ptr(), header, packet) }
    }

    fn break_handle(&self) -> Arc<dyn BreakLoop> {
        Arc::new(PcapBreak(Arc::downgrade(&self.handle)))
    }

    // libpcap exposes no way to clear `break_loop`; the next read consumes it.
    fn discard_break(&mut self) {}

    fn last_error(&self) -> String {
        // SAFETY: valid handle; libpcap returns its NUL-terminated buffer.
        unsafe { CStr::from_ptr(ffi::pcap_geterr(self.handle.as_ptr())) }
            .to_string_lossy()
            .into_owned()
    }

    fn stats(&mut self) -> Result<CaptureStat, BridgeError> {
        let platform = self.platform();
        let mut raw = [0u8; 16];
        // SAFETY: `raw` is at least as large as `struct pcap_stat`.
        let rc = unsafe { ffi::pcap_stats(self.handle.as_ptr(), raw.as_mut_ptr().cast()) };
        if rc < 0 {
            return Err(BridgeError::Native {
                context: "pcap_stats",
                message: self.last_error(),
            });
        }
        let raw = &raw[..pcap_stat_len(platform.os)];
        Ok(decode_pcap_stat(raw, platform.order, platform.os)?)
    }
}

fn c_string(value: &str, context: &'static str) -> Result<CString, BridgeError> {
    CString::new(value).map_err(|_| BridgeError::Native {
        context,
        message: format!("{value:?} contains a NUL byte"),
    })
}

fn clamp<T: TryInto<c_int>>(value: T) -> c_int {
    value.try_into().unwrap_or(c_int::MAX)
}

fn precision_code(precision: TimestampPrecision) -> c_int {
    match precision {
        TimestampPrecision::Micro => PCAP_TSTAMP_PRECISION_MICRO,
        TimestampPrecision::Nano => PCAP_TSTAMP_PRECISION_NANO,
    }
}
