// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Configuration files on disk feeding a live device.

use std::time::Duration;

use tempfile::TempDir;

use mxlink_core::{ChannelTransport, ConfigLoader, Device, MxError, Target};

#[test]
fn test_load_file_and_bring_up_transport() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let path = temp_dir.path().join("mxlink.yaml");
    std::fs::write(
        &path,
        r#"
region:
  size: 131072
management:
  mem_length: 1024
  packet_size: 16
worker:
  start_timeout_ms: 500
  stop_timeout_ms: 500
"#,
    )
    .expect("Failed to write config");

    let config = ConfigLoader::load_file(&path).expect("Config should load");
    assert_eq!(config.region.size, 131072);
    assert_eq!(config.management.geometry().num_packets, 64);
    assert_eq!(config.worker.stop_timeout, Duration::from_millis(500));
    // Untouched sections keep their defaults.
    assert_eq!(config.log.max_bad_headers, 250);

    let (device, _interrupts) = Device::loopback(&config).expect("Failed to build device");
    let transport =
        ChannelTransport::new(&device, Target::M4, &config.management, &config.worker)
            .expect("Failed to create transport");
    assert_eq!(transport.max_payload(), 15);
    assert_eq!(transport.descriptor().to_host.ring.packet_size, 16);
}

#[test]
fn test_invalid_file_reports_field() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let path = temp_dir.path().join("bad.yaml");
    std::fs::write(&path, "log:\n  mem_length: 1000\n  packet_size: 3\n")
        .expect("Failed to write config");

    match ConfigLoader::load_file(&path) {
        Err(MxError::Config(err)) => assert!(err.to_string().contains("log")),
        other => panic!("Expected a validation error, got {:?}", other),
    }
}

#[test]
fn test_missing_file() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let result = ConfigLoader::load_file(temp_dir.path().join("absent.yaml"));
    assert!(matches!(result, Err(MxError::ConfigNotFound { .. })));
}
