// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! End-to-end transport tests against the loopback co-processor.
//!
//! Every test builds a device over an anonymous shared region and drives
//! the peer side purely from the wire descriptors, the way firmware would.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use mxlink_core::loopback::{LoopbackInterrupts, PeerStream};
use mxlink_core::shm::{StreamDescriptor, TransportDescriptor};
use mxlink_core::transport::{header_packet, SyncHeaderParser, PHASE_4};
use mxlink_core::{
    ChannelId, ChannelTransport, Config, Device, LogTransport, MonitorTransport, RingConfig,
    Target, TransportError, TransportState,
};

fn loopback() -> (Config, Device, Arc<LoopbackInterrupts>) {
    let config = Config::default();
    let (device, interrupts) = Device::loopback(&config).expect("Failed to build loopback device");
    (config, device, interrupts)
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

/// Bring up every transport on one device and check line bookkeeping.
#[test]
fn test_all_transports_share_one_device() {
    let (config, device, _interrupts) = loopback();
    let free_before = device.block_allocator().free_bytes();

    let mut mgmt = ChannelTransport::new(&device, Target::R4, &config.management, &config.worker)
        .expect("Failed to create management transport");
    let mut gdb_r4 = MonitorTransport::new(&device, Target::R4, &config.monitor, &config.worker)
        .expect("Failed to create R4 monitor");
    let mut gdb_m4 = MonitorTransport::new(&device, Target::M4, &config.monitor, &config.worker)
        .expect("Failed to create M4 monitor");
    let mut log = LogTransport::new(&device, Target::R4, &config.log, &config.worker)
        .expect("Failed to create log transport");

    // Two to-host lines per bidirectional transport, one for the log.
    assert_eq!(device.registry().tohost_bitmap().count_ones(), 7);
    for transport in [&mgmt.descriptor(), &gdb_r4.descriptor(), &gdb_m4.descriptor()] {
        assert_ne!(transport.to_host.write_bit, transport.from_host.read_bit);
    }

    for state in [mgmt.state(), gdb_r4.state(), gdb_m4.state(), log.state()] {
        assert_eq!(state, TransportState::Running);
    }

    mgmt.release();
    gdb_r4.release();
    gdb_m4.release();
    log.release();

    assert_eq!(device.registry().tohost_bitmap(), 0);
    assert_eq!(device.registry().fromhost_bitmap(Target::R4), 0b1);
    assert_eq!(device.registry().fromhost_bitmap(Target::M4), 0b1);
    assert_eq!(device.block_allocator().free_bytes(), free_before);
}

/// A handler replying through a sender reaches a peer attached from the
/// published descriptor bytes.
#[test]
fn test_management_request_reply() {
    let (config, device, interrupts) = loopback();
    let transport = ChannelTransport::new(&device, Target::R4, &config.management, &config.worker)
        .expect("Failed to create management transport");
    let published = transport.descriptor().to_bytes();
    assert_eq!(
        TransportDescriptor::from_bytes(&published).expect("Descriptor should decode"),
        transport.descriptor()
    );
    let (to_host, from_host) = published.split_at(StreamDescriptor::WIRE_SIZE);

    let sender = transport.sender();
    transport.register_handler(ChannelId::ServiceManager, move |payload| {
        let mut reply = payload[..4].to_vec();
        reply.reverse();
        sender
            .send(ChannelId::ServiceManager, &reply)
            .expect("Reply should fit");
    });

    let mut peer_in = PeerStream::attach_raw(device.allocator(), to_host, interrupts.clone())
        .expect("Failed to attach inbound peer");
    let mut peer_out = PeerStream::attach_raw(device.allocator(), from_host, interrupts)
        .expect("Failed to attach outbound peer");

    assert!(peer_in.write(&[ChannelId::ServiceManager.as_u8(), b'p', b'i', b'n', b'g']));

    let mut packet = [0u8; 8];
    assert!(wait_for(|| !peer_out.ring().is_empty()));
    assert_eq!(peer_out.read(&mut packet), 8);
    assert_eq!(packet[0], ChannelId::ServiceManager.as_u8());
    assert_eq!(&packet[1..5], b"gnip");
}

/// Once the latch is set, sends fail and inbound traffic is dropped unseen.
#[test]
fn test_error_latch_discards_inbound() {
    let (config, device, interrupts) = loopback();
    let transport = ChannelTransport::new(&device, Target::R4, &config.management, &config.worker)
        .expect("Failed to create management transport");

    let seen = Arc::new(Mutex::new(0usize));
    let counter = seen.clone();
    transport.register_handler(ChannelId::MaxwellManager, move |_| *counter.lock() += 1);

    transport.set_error();
    assert_eq!(transport.state(), TransportState::Blocked);
    assert!(matches!(
        transport.send(ChannelId::MaxwellManager, b"x"),
        Err(TransportError::AlreadyInError)
    ));

    let mut peer_in = PeerStream::attach(
        device.allocator(),
        &transport.descriptor().to_host,
        interrupts,
    )
    .expect("Failed to attach inbound peer");
    assert!(peer_in.write(&[0, 1, 2, 3]));

    assert!(wait_for(|| peer_in.ring().is_empty()));
    assert_eq!(*seen.lock(), 0);
}

/// Enough log traffic to wrap the ring several times arrives intact and in order.
#[test]
fn test_log_stream_wraps_ring() {
    let (config, device, interrupts) = loopback();
    run_log_stream(&config, &device, interrupts, 2_000);
}

/// Headers stay aligned when the log ring uses packets wider than a header.
#[test]
fn test_log_stream_wide_packets() {
    let mut config = Config::default();
    config.log.ring = RingConfig {
        mem_length: 8 * 1024,
        packet_size: 16,
    };
    let (device, interrupts) = Device::loopback(&config).expect("Failed to build loopback device");
    run_log_stream(&config, &device, interrupts, 500);
}

fn run_log_stream(
    config: &Config,
    device: &Device,
    interrupts: Arc<LoopbackInterrupts>,
    records: usize,
) {
    let log = LogTransport::new(device, Target::R4, &config.log, &config.worker)
        .expect("Failed to create log transport");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    log.register(SyncHeaderParser, move |record: &mxlink_core::transport::LogRecord<'_>| {
        sink.lock().push(record.payload.to_vec());
    });

    let published = log.descriptor().to_bytes();
    let mut peer = PeerStream::attach_raw(device.allocator(), &published, interrupts)
        .expect("Failed to attach log peer");
    let packet_size = peer.ring().packet_size() as usize;

    for i in 0..records {
        let line = format!("boot stage {i}");
        let header = SyncHeaderParser::encode(PHASE_4, 3, line.len()).expect("Header fits");
        let header = header_packet(header, packet_size);
        assert!(wait_for(|| peer.write_gather(&[&header, line.as_bytes()])));
    }

    assert!(wait_for(|| seen.lock().len() == records));
    let seen = seen.lock();
    assert_eq!(seen[0], b"boot stage 0".to_vec());
    assert_eq!(seen[records - 1], format!("boot stage {}", records - 1).into_bytes());
    assert_eq!(log.state(), TransportState::Running);
}

/// Interrupt lines run out before shared memory does, and come back on release.
#[test]
fn test_line_exhaustion_is_recoverable() {
    let (config, device, _interrupts) = loopback();

    let mut transports = Vec::new();
    let err = loop {
        match ChannelTransport::new(&device, Target::R4, &config.management, &config.worker) {
            Ok(transport) => transports.push(transport),
            Err(err) => break err,
        }
        assert!(transports.len() <= 8, "Line allocation never failed");
    };

    assert!(err.is_resource_exhausted());
    assert!(!transports.is_empty());

    drop(transports);
    assert_eq!(device.registry().tohost_bitmap(), 0);
    assert_eq!(device.registry().fromhost_bitmap(Target::R4), 0b1);

    ChannelTransport::new(&device, Target::R4, &config.management, &config.worker)
        .expect("Lines should be available again");
}

/// The monitor's panic line reaches the peer even with nothing written.
#[test]
fn test_monitor_force_panic() {
    let (config, device, interrupts) = loopback();
    let monitor = MonitorTransport::new(&device, Target::M4, &config.monitor, &config.worker)
        .expect("Failed to create monitor");

    let seq = interrupts.raise_seq();
    monitor.force_panic();
    assert!(interrupts.wait_raised(seq, Duration::from_secs(1)) > seq);

    let panic_bit = Target::M4.reserved_panic_bit();
    assert_eq!(interrupts.raised_count(panic_bit, Target::M4), 1);
    assert_eq!(interrupts.raised_count(panic_bit, Target::R4), 0);
}
