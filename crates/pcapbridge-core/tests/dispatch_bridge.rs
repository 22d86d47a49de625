use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use pcapbridge_core::{
    AbiError, ArrayHandler, ByteOrder, Capture, CaptureConfig, DispatchOutcome, FailureVerdict,
    HandlerError, HandlerFailure, Linktype, MemoryCapture, PacketFeeder, PacketHeader, PacketRef,
    PlatformInfo, TargetOs, TimestampPrecision, BridgeError,
};

fn open(timeout_ms: u64) -> (Capture<MemoryCapture>, PacketFeeder) {
    let config = CaptureConfig {
        timeout_ms,
        ..CaptureConfig::default()
    };
    Capture::open_memory(&config, Linktype::ETHERNET).unwrap()
}

fn feed(feeder: &PacketFeeder, count: u32) {
    for i in 0..count {
        feeder
            .feed(1_700_000_000 + i64::from(i), i, vec![i as u8; 64])
            .unwrap();
    }
}

/// Fails on the third packet it sees.
fn fail_on_third(calls: &mut u32, _packet: PacketRef<'_>) -> Result<(), HandlerError> {
    *calls += 1;
    if *calls == 3 {
        return Err(format!("bad packet {calls}").into());
    }
    Ok(())
}

#[test]
fn handler_failure_aborts_and_is_reraised() {
    let (mut capture, feeder) = open(20);
    feed(&feeder, 10);

    let mut calls = 0u32;
    let err = capture.dispatch(-1, &mut calls, fail_on_third).unwrap_err();

    assert_eq!(calls, 3);
    match err {
        BridgeError::Handler(err) => assert_eq!(err.to_string(), "bad packet 3"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn suppressing_policy_delivers_every_packet() {
    let (mut capture, feeder) = open(20);
    feed(&feeder, 10);
    let vetoed = Arc::new(AtomicU32::new(0));
    let seen = vetoed.clone();
    capture.set_failure_policy(Box::new(move |failure: &HandlerFailure| {
        assert!(!failure.is_panic());
        seen.fetch_add(1, Ordering::SeqCst);
        FailureVerdict::Suppress
    }));

    let mut calls = 0u32;
    let outcome = capture.dispatch(-1, &mut calls, fail_on_third).unwrap();

    assert_eq!(calls, 10);
    assert_eq!(outcome, DispatchOutcome::Processed(10));
    assert_eq!(vetoed.load(Ordering::SeqCst), 1);
}

#[test]
fn failure_slot_is_cleared_for_the_next_call() {
    let (mut capture, feeder) = open(20);
    feed(&feeder, 10);

    let mut calls = 0u32;
    assert!(capture.dispatch(-1, &mut calls, fail_on_third).is_err());

    let mut rest = 0u32;
    let outcome = capture
        .dispatch(-1, &mut rest, |rest: &mut u32, _packet| {
            *rest += 1;
            Ok(())
        })
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Processed(7));
    assert_eq!(rest, 7);
}

#[test]
fn failure_on_the_last_counted_packet_leaves_the_next_call_intact() {
    let (mut capture, feeder) = open(20);
    feed(&feeder, 10);

    let mut calls = 0u32;
    let err = capture.dispatch(3, &mut calls, fail_on_third).unwrap_err();
    assert!(matches!(err, BridgeError::Handler(_)));
    assert_eq!(calls, 3);

    let mut rest = 0u32;
    let outcome = capture
        .dispatch(-1, &mut rest, |rest: &mut u32, _packet| {
            *rest += 1;
            Ok(())
        })
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Processed(7));
    assert_eq!(rest, 7);
}

#[test]
fn interrupt_as_a_call_completes_does_not_break_the_next_call() {
    let (mut capture, feeder) = open(20);
    feed(&feeder, 6);
    let interrupter = capture.interrupter();

    let mut calls = 0u32;
    let outcome = capture
        .dispatch(2, &mut calls, |calls: &mut u32, _packet| {
            *calls += 1;
            if *calls == 2 {
                interrupter.interrupt();
            }
            Ok(())
        })
        .unwrap();
    assert!(outcome.is_broken());

    let mut rest = 0u32;
    let outcome = capture
        .loop_packets(4, &mut rest, |rest: &mut u32, _packet| {
            *rest += 1;
            Ok(())
        })
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Processed(4));
    assert_eq!(rest, 4);
    let packet = capture.next_ex();
    assert!(matches!(packet, Err(BridgeError::Timeout)));
}

#[test]
fn first_aborting_failure_wins() {
    let (mut capture, feeder) = open(20);
    feed(&feeder, 5);
    let mut verdicts = vec![FailureVerdict::Suppress, FailureVerdict::Abort, FailureVerdict::Abort];
    verdicts.reverse();
    capture.set_failure_policy(Box::new(move |_failure: &HandlerFailure| {
        verdicts.pop().unwrap_or(FailureVerdict::Abort)
    }));

    let mut calls = 0u32;
    let err = capture
        .dispatch(-1, &mut calls, |calls: &mut u32, _packet| {
            *calls += 1;
            Err(format!("failure {calls}").into())
        })
        .unwrap_err();

    assert_eq!(calls, 2);
    assert_eq!(err.to_string(), "packet handler failed: failure 2");
}

#[test]
fn handler_panic_is_resumed_on_the_calling_thread() {
    let (mut capture, feeder) = open(20);
    feed(&feeder, 4);

    let mut calls = 0u32;
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        capture.dispatch(-1, &mut calls, |calls: &mut u32, _packet| {
            *calls += 1;
            if *calls == 2 {
                panic!("handler exploded");
            }
            Ok(())
        })
    }));

    let payload = result.unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"handler exploded"));
    assert_eq!(calls, 2);
}

#[test]
fn interrupt_from_another_thread_breaks_the_loop() {
    let (mut capture, feeder) = open(0);
    let interrupter = capture.interrupter();
    let delivered = Arc::new(AtomicU32::new(0));
    let observed = delivered.clone();

    let producer = thread::spawn(move || {
        feed(&feeder, 5);
        let deadline = Instant::now() + Duration::from_secs(5);
        while observed.load(Ordering::SeqCst) < 5 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        interrupter.interrupt();
        feed(&feeder, 5);
        feeder
    });

    let counter = delivered.clone();
    let outcome = capture
        .loop_packets(-1, &mut (), move |_: &mut (), _packet| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    let _feeder = producer.join().unwrap();

    assert_eq!(outcome, DispatchOutcome::Broken);
    let delivered = delivered.load(Ordering::SeqCst);
    assert!((5..=6).contains(&delivered), "delivered {delivered}");
}

#[test]
fn idle_interrupt_is_a_no_op() {
    let (mut capture, feeder) = open(20);
    capture.interrupt();
    capture.interrupt();
    feed(&feeder, 3);

    let mut calls = 0u32;
    let outcome = capture
        .dispatch(-1, &mut calls, |calls: &mut u32, _packet| {
            *calls += 1;
            Ok(())
        })
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Processed(3));
}

#[test]
fn next_ex_times_out_after_the_read_timeout() {
    let (mut capture, _feeder) = open(100);
    let start = Instant::now();
    let err = capture.next_ex().unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, BridgeError::Timeout));
    assert!(elapsed >= Duration::from_millis(100), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "elapsed {elapsed:?}");
}

#[test]
fn next_ex_returns_none_when_broken() {
    let (mut capture, _feeder) = open(0);
    let interrupter = capture.interrupter();
    let waker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        interrupter.interrupt();
    });
    assert!(capture.next_ex().unwrap().is_none());
    waker.join().unwrap();
}

#[test]
fn next_ex_yields_packets_in_order() {
    let (mut capture, feeder) = open(20);
    feed(&feeder, 3);
    for i in 0..3u32 {
        let packet = capture.next_ex().unwrap().unwrap();
        let header = packet.header().decode();
        assert_eq!(header.ts_sec, 1_700_000_000 + i64::from(i));
        assert_eq!(header.ts_frac, i);
        assert_eq!(packet.data()[0], i as u8);
    }
}

#[test]
fn unknown_platform_fails_at_open() {
    let platform = PlatformInfo {
        pointer_width: 16,
        os: TargetOs::Unix,
        order: ByteOrder::Little,
        precision: TimestampPrecision::Micro,
    };
    let err = match Capture::open_memory_on(&CaptureConfig::default(), Linktype::ETHERNET, platform) {
        Ok(_) => panic!("expected ABI resolution to fail"),
        Err(err) => err,
    };
    assert!(matches!(
        err,
        BridgeError::Abi(AbiError::Unresolved {
            pointer_width: 16,
            ..
        })
    ));
}

#[test]
fn every_platform_layout_decodes_through_the_bridge() {
    let config = CaptureConfig {
        timeout_ms: 20,
        ..CaptureConfig::default()
    };
    for pointer_width in [32, 64] {
        for os in [TargetOs::Unix, TargetOs::Darwin, TargetOs::Windows] {
            for order in [ByteOrder::Little, ByteOrder::Big] {
                for precision in [TimestampPrecision::Micro, TimestampPrecision::Nano] {
                    let platform = PlatformInfo {
                        pointer_width,
                        os,
                        order,
                        precision,
                    };
                    let (mut capture, feeder) =
                        Capture::open_memory_on(&config, Linktype::ETHERNET, platform).unwrap();
                    feeder.feed(1_234_567, 999, vec![0xab; 90]).unwrap();

                    let mut headers: Vec<PacketHeader> = Vec::new();
                    let mut handler = ArrayHandler(
                        |headers: &mut Vec<PacketHeader>, header: PacketHeader, data: Vec<u8>| -> Result<(), HandlerError> {
                            assert_eq!(data.len(), 90);
                            headers.push(header);
                            Ok(())
                        },
                    );
                    capture.dispatch_with(-1, &mut headers, &mut handler).unwrap();

                    let abi = capture.abi();
                    assert_eq!(headers.len(), 1, "{}", abi.name());
                    assert_eq!(
                        headers[0],
                        PacketHeader::new(1_234_567, 999, precision, 90, 90),
                        "{}",
                        abi.name()
                    );
                }
            }
        }
    }
}

#[test]
fn dead_handle_reports_native_error() {
    let mut capture =
        Capture::open_dead(Linktype::RAW, 128, TimestampPrecision::Micro).unwrap();
    let err = capture
        .loop_packets(1, &mut (), |_: &mut (), _packet| Ok(()))
        .unwrap_err();
    assert!(matches!(err, BridgeError::Native { context: "pcap_loop", .. }));
    assert_eq!(capture.datalink(), Linktype::RAW);
    assert_eq!(capture.snapshot(), 128);
}
