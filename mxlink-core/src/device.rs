// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! One attached co-processor: its shared region allocator and its interrupt
//! registry. Every stream and transport is built against a device.

use std::sync::Arc;

use crate::config::Config;
use crate::error::MxResult;
use crate::intrbit::{InterruptBitRegistry, InterruptController};
use crate::loopback::LoopbackInterrupts;
use crate::shm::{BlockAllocator, SharedAllocator, SharedMemoryRegion};

#[derive(Debug, Clone)]
pub struct Device {
    allocator: Arc<BlockAllocator>,
    registry: Arc<InterruptBitRegistry>,
}

impl Device {
    pub fn new(region: SharedMemoryRegion, controller: Arc<dyn InterruptController>) -> Self {
        tracing::info!(
            region = %region.name(),
            size = region.size(),
            "Attaching device"
        );
        Self {
            allocator: Arc::new(BlockAllocator::new(region)),
            registry: InterruptBitRegistry::new(controller),
        }
    }

    /// Device backed by the configured region and an in-process peer.
    pub fn loopback(config: &Config) -> MxResult<(Self, Arc<LoopbackInterrupts>)> {
        let region = config.region.map()?;
        let interrupts = Arc::new(LoopbackInterrupts::new());
        let device = Self::new(region, interrupts.clone());
        Ok((device, interrupts))
    }

    pub fn allocator(&self) -> Arc<dyn SharedAllocator> {
        self.allocator.clone()
    }

    /// Allocator with its bookkeeping accessors.
    pub fn block_allocator(&self) -> &Arc<BlockAllocator> {
        &self.allocator
    }

    pub fn registry(&self) -> &Arc<InterruptBitRegistry> {
        &self.registry
    }
}
