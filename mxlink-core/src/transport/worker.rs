// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Dedicated drain thread shared by every transport.
//!
//! The inbound interrupt handler only sets a wake flag and notifies; all
//! ring access and handler dispatch happens on the worker thread. A stop
//! request is observed before every wait, and the thread hands the inbound
//! stream back through its join handle so the owner releases it.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::TransportError;
use crate::intrbit::IrqHandler;
use crate::stream::ByteStream;

/// Per-transport message pump run on the worker thread.
pub(crate) trait Drain: Send + 'static {
    /// Consume whatever is buffered. `Break` ends the worker for good.
    fn drain(&mut self, stream: &mut ByteStream) -> ControlFlow<()>;
}

#[derive(Debug, Default)]
struct WakeState {
    wakeup: bool,
    stop: bool,
    started: bool,
    exited: bool,
}

/// Flags shared between the interrupt path, the owner and the worker.
#[derive(Debug, Default)]
pub(crate) struct WorkerControl {
    state: Mutex<WakeState>,
    changed: Condvar,
    blocked: AtomicBool,
}

impl WorkerControl {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Interrupt handler that wakes the worker.
    pub(crate) fn irq_handler(self: &Arc<Self>) -> IrqHandler {
        let control = Arc::clone(self);
        Arc::new(move |_| control.wake())
    }

    pub(crate) fn wake(&self) {
        let mut state = self.state.lock();
        state.wakeup = true;
        self.changed.notify_all();
    }

    /// Latch the error state; from now on wakeups discard instead of dispatch.
    pub(crate) fn block(&self) {
        self.blocked.store(true, Ordering::Release);
    }

    pub(crate) fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    pub(crate) fn is_running(&self) -> bool {
        let state = self.state.lock();
        state.started && !state.exited
    }

    fn request_stop(&self) {
        let mut state = self.state.lock();
        state.stop = true;
        self.changed.notify_all();
    }

    /// Wait for a wakeup. Returns `false` once a stop has been requested.
    fn wait_for_work(&self) -> bool {
        let mut state = self.state.lock();
        while !state.wakeup && !state.stop {
            self.changed.wait(&mut state);
        }
        state.wakeup = false;
        !state.stop
    }

    fn mark_started(&self) {
        let mut state = self.state.lock();
        state.started = true;
        self.changed.notify_all();
    }

    fn mark_exited(&self) {
        let mut state = self.state.lock();
        state.exited = true;
        self.changed.notify_all();
    }

    fn wait_started(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if !state.started {
            let _ = self
                .changed
                .wait_while_for(&mut state, |s| !s.started, timeout);
        }
        state.started
    }

    fn wait_exited(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if !state.exited {
            let _ = self
                .changed
                .wait_while_for(&mut state, |s| !s.exited, timeout);
        }
        state.exited
    }
}

/// Handle to a running drain thread.
#[derive(Debug)]
pub(crate) struct Worker {
    name: &'static str,
    handle: Option<JoinHandle<ByteStream>>,
    control: Arc<WorkerControl>,
    stop_timeout: Duration,
}

impl Worker {
    /// Spawn the drain thread and wait, bounded, for it to come up.
    pub(crate) fn spawn<D: Drain>(
        name: &'static str,
        control: Arc<WorkerControl>,
        mut stream: ByteStream,
        mut drain: D,
        start_timeout: Duration,
        stop_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let thread_control = Arc::clone(&control);

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let span = tracing::info_span!("worker", transport = name);
                let _guard = span.enter();
                let control = thread_control;

                control.mark_started();
                tracing::debug!("Worker running");

                while control.wait_for_work() {
                    if control.is_blocked() {
                        let dropped = stream.discard_pending();
                        if dropped > 0 {
                            tracing::debug!(packets = dropped, "Transport blocked, discarding");
                        }
                        continue;
                    }
                    if drain.drain(&mut stream).is_break() {
                        tracing::warn!("Worker terminating");
                        break;
                    }
                }

                control.mark_exited();
                tracing::debug!("Worker exited");
                stream
            })
            .map_err(|source| TransportError::WorkerSpawn { name, source })?;

        let worker = Self {
            name,
            handle: Some(handle),
            control,
            stop_timeout,
        };

        if !worker.control.wait_started(start_timeout) {
            tracing::error!(transport = name, "Worker did not start in time");
            // Dropping the worker requests a stop and detaches the thread.
            return Err(TransportError::WorkerStartTimeout {
                name,
                timeout_ms: start_timeout.as_millis() as u64,
            });
        }

        tracing::info!(transport = name, "Started worker");
        Ok(worker)
    }

    pub(crate) fn control(&self) -> &Arc<WorkerControl> {
        &self.control
    }

    /// Ask the worker to stop and wait, bounded, for it to exit.
    ///
    /// The inbound stream is released here once the thread has been joined.
    /// If the thread does not exit in time it is detached together with
    /// the stream it owns, and the control keeps reporting it as running.
    pub(crate) fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        tracing::info!(transport = self.name, "Stopping worker");
        self.control.request_stop();

        if !self.control.wait_exited(self.stop_timeout) {
            tracing::error!(
                transport = self.name,
                timeout_ms = self.stop_timeout.as_millis() as u64,
                "Worker did not stop in time, detaching"
            );
            return;
        }

        match handle.join() {
            Ok(stream) => {
                stream.log_state(tracing::Level::DEBUG);
                drop(stream);
            }
            Err(_) => tracing::error!(transport = self.name, "Worker panicked"),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}
