// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `mxlink loopback` command - Exercise every transport against a simulated peer.
//!
//! The host side runs the real transports; each co-processor role runs on a
//! blocking task driving a [`PeerStream`] attached from the descriptor bytes
//! the host publishes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mxlink_core::loopback::{LoopbackInterrupts, PeerStream};
use mxlink_core::shm::{SharedAllocator, StreamDescriptor};
use mxlink_core::transport::{header_packet, LogRecord, SyncHeaderParser, NUM_CHANNELS, PHASE_4};
use mxlink_core::{
    ChannelId, ChannelTransport, Device, LogTransport, MonitorTransport, Target, TransportError,
};

const MONITOR_QUERY: &[u8] = b"$qSupported#37";

/// Traffic counters shared by host handlers and peers.
#[derive(Default)]
struct Counters {
    channel_rx: [AtomicU64; NUM_CHANNELS],
    channel_echoed: AtomicU64,
    echo_dropped: AtomicU64,
    monitor_rx: AtomicU64,
    monitor_tx: AtomicU64,
    log_records: AtomicU64,
    peer_retries: AtomicU64,
}

impl Counters {
    fn channel_total(&self) -> u64 {
        self.channel_rx
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    fn complete(&self, messages: u64) -> bool {
        self.channel_total() >= messages
            && self.channel_echoed.load(Ordering::Relaxed) + self.echo_dropped.load(Ordering::Relaxed)
                >= messages
            && self.monitor_rx.load(Ordering::Relaxed) >= messages
            && self.monitor_tx.load(Ordering::Relaxed) >= messages
            && self.log_records.load(Ordering::Relaxed) >= messages
    }
}

struct Peer {
    allocator: Arc<dyn SharedAllocator>,
    interrupts: Arc<LoopbackInterrupts>,
    stop: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl Peer {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn backoff(&self) {
        self.counters.peer_retries.fetch_add(1, Ordering::Relaxed);
        std::thread::sleep(Duration::from_micros(200));
    }
}

/// Management peer: round-robin requests over every channel, collect echoes.
fn run_management_peer(
    peer: Peer,
    mut to_host: PeerStream,
    mut from_host: PeerStream,
    messages: u64,
) {
    let packet_size = to_host.ring().packet_size() as usize;
    let mut packet = vec![0u8; packet_size];
    let mut reply = vec![0u8; packet_size];
    let mut sent = 0u64;

    while !peer.stopped() {
        while from_host.read(&mut reply) > 0 {
            peer.counters.channel_echoed.fetch_add(1, Ordering::Relaxed);
        }

        if sent == messages {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }

        packet[0] = ChannelId::ALL[(sent % NUM_CHANNELS as u64) as usize].as_u8();
        packet[1..].fill(sent as u8);
        if to_host.write(&packet) {
            sent += 1;
        } else {
            peer.backoff();
        }
    }
}

/// Monitor peer: send queries, read whatever the host sends back.
fn run_monitor_peer(
    peer: Peer,
    mut to_host: PeerStream,
    mut from_host: PeerStream,
    messages: u64,
) {
    let packet_size = to_host.ring().packet_size() as usize;
    let mut header = vec![0u8; packet_size];
    header[..4].copy_from_slice(&(MONITOR_QUERY.len() as u32).to_le_bytes());

    let mut len = vec![0u8; packet_size];
    let mut payload = vec![0u8; from_host.ring().num_packets() as usize * packet_size];
    let mut sent = 0u64;

    while !peer.stopped() {
        if from_host.read(&mut len) == packet_size {
            let n = u32::from_le_bytes([len[0], len[1], len[2], len[3]]) as usize;
            let n = n.min(payload.len());
            from_host.read(&mut payload[..n]);
            peer.counters.monitor_tx.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        if sent == messages {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }

        if to_host.write_gather(&[&header, MONITOR_QUERY]) {
            sent += 1;
        } else {
            peer.backoff();
        }
    }
}

/// Log peer: emit phase 4 records at every firmware level.
fn run_log_peer(peer: Peer, mut to_host: PeerStream, messages: u64) {
    let packet_size = to_host.ring().packet_size() as usize;
    let mut sent = 0u64;
    while sent < messages && !peer.stopped() {
        let line = format!("loopback record {sent}");
        let Some(header) = SyncHeaderParser::encode(PHASE_4, (sent % 5) as u8, line.len()) else {
            tracing::error!(len = line.len(), "Log line does not fit a header");
            return;
        };
        if to_host.write_gather(&[&header_packet(header, packet_size), line.as_bytes()]) {
            sent += 1;
        } else {
            peer.backoff();
        }
    }
}

pub async fn execute(
    config_path: &str,
    messages: u64,
    timeout_secs: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(config_path)?;
    let (device, interrupts) = Device::loopback(&config)?;
    let counters = Arc::new(Counters::default());
    let stop = Arc::new(AtomicBool::new(false));

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                  MXLINK LOOPBACK SESSION                     ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // Host side
    let mut management =
        ChannelTransport::new(&device, Target::R4, &config.management, &config.worker)?;
    for channel in ChannelId::ALL {
        let counters = counters.clone();
        let sender = management.sender();
        management.register_handler(channel, move |payload| {
            counters.channel_rx[channel.as_u8() as usize].fetch_add(1, Ordering::Relaxed);
            if let Err(e) = sender.send(channel, payload) {
                tracing::debug!(channel = %channel, error = %e, "Echo dropped");
                counters.echo_dropped.fetch_add(1, Ordering::Relaxed);
            }
        });
    }

    let monitor = Arc::new(MonitorTransport::new(
        &device,
        Target::R4,
        &config.monitor,
        &config.worker,
    )?);
    {
        let counters = counters.clone();
        monitor.register_handler(move |_| {
            counters.monitor_rx.fetch_add(1, Ordering::Relaxed);
        });
    }

    let mut log = LogTransport::new(&device, Target::R4, &config.log, &config.worker)?;
    {
        let counters = counters.clone();
        log.register(SyncHeaderParser, move |record: &LogRecord<'_>| {
            tracing::trace!(
                level = record.level,
                line = %String::from_utf8_lossy(record.payload),
                "Firmware log"
            );
            counters.log_records.fetch_add(1, Ordering::Relaxed);
        });
    }

    println!("▶ Transports up: management, monitor, log");

    // Co-processor side
    let peer = || Peer {
        allocator: device.allocator(),
        interrupts: interrupts.clone(),
        stop: stop.clone(),
        counters: counters.clone(),
    };
    let attach = |p: &Peer, bytes: &[u8]| {
        PeerStream::attach_raw(p.allocator.clone(), bytes, p.interrupts.clone())
    };
    // Each transport descriptor splits into its to-host and from-host halves.
    let split = StreamDescriptor::WIRE_SIZE;

    let mut peers = Vec::new();

    let mgmt_desc = management.descriptor().to_bytes();
    let p = peer();
    let to_host = attach(&p, &mgmt_desc[..split])?;
    let from_host = attach(&p, &mgmt_desc[split..])?;
    peers.push(tokio::task::spawn_blocking(move || {
        run_management_peer(p, to_host, from_host, messages)
    }));

    let gdb_desc = monitor.descriptor().to_bytes();
    let p = peer();
    let to_host = attach(&p, &gdb_desc[..split])?;
    let from_host = attach(&p, &gdb_desc[split..])?;
    peers.push(tokio::task::spawn_blocking(move || {
        run_monitor_peer(p, to_host, from_host, messages)
    }));

    let log_desc = log.descriptor().to_bytes();
    let p = peer();
    let to_host = attach(&p, &log_desc[..])?;
    peers.push(tokio::task::spawn_blocking(move || run_log_peer(p, to_host, messages)));

    // Host to monitor traffic
    {
        let monitor = monitor.clone();
        let stop = stop.clone();
        peers.push(tokio::task::spawn_blocking(move || {
            let mut sent = 0u64;
            while sent < messages && !stop.load(Ordering::Relaxed) {
                match monitor.send(MONITOR_QUERY) {
                    Ok(()) => sent += 1,
                    Err(TransportError::InsufficientSpace { .. }) => {
                        std::thread::sleep(Duration::from_micros(200))
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Monitor send failed");
                        return;
                    }
                }
            }
        }));
    }

    println!("▶ Peers running, {} messages per transport", messages);
    println!();
    println!("Press Ctrl+C to stop...");

    let started = Instant::now();
    let done = async {
        while !counters.complete(messages) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };

    let outcome = tokio::select! {
        _ = done => "completed",
        _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => "timed out",
        _ = tokio::signal::ctrl_c() => "interrupted",
    };
    let elapsed = started.elapsed();

    stop.store(true, Ordering::Relaxed);
    for handle in peers {
        handle.await?;
    }

    let management_state = management.state();
    let monitor_state = monitor.state();
    let log_state = log.state();

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!(
        "║ Session {:<10} in {:>8.1}ms                              ║",
        outcome,
        elapsed.as_secs_f64() * 1000.0
    );
    println!("╠══════════════════════════════════════════════════════════════╣");
    for channel in ChannelId::ALL {
        println!(
            "║ {:<20} rx {:>10}                              ║",
            channel.name(),
            counters.channel_rx[channel.as_u8() as usize].load(Ordering::Relaxed)
        );
    }
    println!(
        "║ {:<20} echoed {:>6}  dropped {:>6}  [{:<8}]     ║",
        "management",
        counters.channel_echoed.load(Ordering::Relaxed),
        counters.echo_dropped.load(Ordering::Relaxed),
        management_state
    );
    println!(
        "║ {:<20} rx {:>10}  tx {:>10}  [{:<8}]     ║",
        "monitor",
        counters.monitor_rx.load(Ordering::Relaxed),
        counters.monitor_tx.load(Ordering::Relaxed),
        monitor_state
    );
    println!(
        "║ {:<20} rx {:>10}                 [{:<8}]     ║",
        "log",
        counters.log_records.load(Ordering::Relaxed),
        log_state
    );
    println!(
        "║ {:<20} {:>13}                              ║",
        "peer retries",
        counters.peer_retries.load(Ordering::Relaxed)
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    management.release();
    log.release();
    drop(monitor);

    Ok(())
}
