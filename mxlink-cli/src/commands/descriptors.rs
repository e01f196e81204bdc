// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `mxlink descriptors` command - Dump the wire descriptors of a device.
//!
//! Brings every transport up on a loopback device and prints what would be
//! written to the co-processor's boot area.

use serde::Serialize;

use mxlink_core::shm::{StreamDescriptor, TransportDescriptor};
use mxlink_core::{ChannelTransport, Device, LogTransport, MonitorTransport, Target};

#[derive(Serialize)]
struct DeviceDescriptors {
    region_size: usize,
    management: TransportDescriptor,
    monitor_r4: TransportDescriptor,
    monitor_m4: TransportDescriptor,
    log: StreamDescriptor,
}

pub async fn execute(config_path: &str, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(config_path)?;
    let (device, _interrupts) = Device::loopback(&config)?;

    let management = ChannelTransport::new(&device, Target::R4, &config.management, &config.worker)?;
    let monitor_r4 = MonitorTransport::new(&device, Target::R4, &config.monitor, &config.worker)?;
    let monitor_m4 = MonitorTransport::new(&device, Target::M4, &config.monitor, &config.worker)?;
    let log = LogTransport::new(&device, Target::R4, &config.log, &config.worker)?;

    let descriptors = DeviceDescriptors {
        region_size: config.region.size,
        management: management.descriptor(),
        monitor_r4: monitor_r4.descriptor(),
        monitor_m4: monitor_m4.descriptor(),
        log: log.descriptor(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&descriptors)?);
    } else {
        print!("{}", serde_yaml::to_string(&descriptors)?);
    }

    Ok(())
}
