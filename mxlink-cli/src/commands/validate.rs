// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `mxlink validate` command - Validate configuration file.

use mxlink_core::{ConfigLoader, RingConfig};

fn ring_line(name: &str, ring: &RingConfig) -> String {
    let geometry = ring.geometry();
    format!(
        "  {:<12} {:>6} bytes = {:>5} x {:>3} byte packets",
        name, ring.mem_length, geometry.num_packets, geometry.packet_size
    )
}

pub async fn execute(file: &str) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(file = %file, "Validating configuration");

    match ConfigLoader::load_file(file) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!();
            println!("Shared Region:");
            println!("  Size:       {} bytes", config.region.size);
            println!(
                "  Required:   {} bytes",
                config.required_region_size()
            );
            match &config.region.name {
                Some(name) => println!("  Name:       /{}", name),
                None => println!("  Name:       (anonymous)"),
            }
            println!();
            println!("Rings (per direction):");
            println!("{}", ring_line("management", &config.management));
            println!("{}", ring_line("monitor", &config.monitor));
            println!("{}", ring_line("log", &config.log.ring));
            println!();
            println!("Workers:");
            println!(
                "  Start Timeout:   {}ms",
                config.worker.start_timeout.as_millis()
            );
            println!(
                "  Stop Timeout:    {}ms",
                config.worker.stop_timeout.as_millis()
            );
            println!("  Max Bad Headers: {}", config.log.max_bad_headers);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}
