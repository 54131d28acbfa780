use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{Mailbox, TickError, TickFlow, TickTask};
use crate::clock::ClockReader;

enum Envelope {
    Post { key: String, value: String },
    Wake,
}

#[derive(Default)]
struct WorkerFlags {
    stop_requested: AtomicBool,
    has_exited: AtomicBool,
}

/// Marks the worker exited when the loop returns or unwinds.
struct ExitGuard(Arc<WorkerFlags>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.has_exited.store(true, Ordering::Release);
    }
}

/// Owns one worker thread running a [`TickTask`].
///
/// `start` is idempotent; `stop` never blocks; `join` blocks only for
/// non-background workers.
pub struct PeriodicWorker {
    name: String,
    background: bool,
    flags: Arc<WorkerFlags>,
    sender: Sender<Envelope>,
    pending: Mutex<Option<(Box<dyn TickTask>, Receiver<Envelope>)>>,
    clock: Arc<dyn ClockReader>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicWorker {
    pub fn new<T: TickTask>(task: T, clock: Arc<dyn ClockReader>) -> Self {
        let (sender, receiver) = channel::unbounded();
        Self {
            name: task.name().to_string(),
            background: task.is_background(),
            flags: Arc::new(WorkerFlags::default()),
            sender,
            pending: Mutex::new(Some((Box::new(task), receiver))),
            clock,
            thread: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_background(&self) -> bool {
        self.background
    }

    /// Spawn the loop. Returns `Ok(false)` if the worker was already started.
    pub fn start(&self) -> anyhow::Result<bool> {
        let Some((task, receiver)) = self.pending.lock().take() else {
            debug!(worker = %self.name, "start ignored, worker already started");
            return Ok(false);
        };

        let flags = self.flags.clone();
        let clock = self.clock.clone();
        let spawned = thread::Builder::new()
            .name(format!("worker-{}", self.name))
            .spawn(move || run_loop(task, receiver, clock, flags));

        match spawned {
            Ok(handle) => {
                *self.thread.lock() = Some(handle);
                Ok(true)
            }
            Err(e) => {
                self.flags.has_exited.store(true, Ordering::Release);
                Err(e).with_context(|| format!("failed to spawn worker {}", self.name))
            }
        }
    }

    /// Request a cooperative stop and wake the loop.
    pub fn stop(&self) {
        self.flags.stop_requested.store(true, Ordering::Release);
        let _ = self.sender.send(Envelope::Wake);
    }

    /// Wait for the loop to exit. Returns immediately for background workers
    /// and for workers that were never started.
    pub fn join(&self) {
        if self.background {
            return;
        }
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(worker = %self.name, "worker thread panicked");
            }
        }
    }

    /// Drop a keyed message into the mailbox and wake the worker.
    /// Returns false once the worker has gone away.
    pub fn post(&self, key: impl Into<String>, value: impl Into<String>) -> bool {
        self.sender
            .send(Envelope::Post {
                key: key.into(),
                value: value.into(),
            })
            .is_ok()
    }

    /// Wake the worker for an early tick without sending data.
    pub fn wake(&self) {
        let _ = self.sender.send(Envelope::Wake);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.flags.stop_requested.load(Ordering::Acquire)
    }

    pub fn has_exited(&self) -> bool {
        self.flags.has_exited.load(Ordering::Acquire)
    }

    pub fn is_started(&self) -> bool {
        self.pending.lock().is_none()
    }
}

fn run_loop(
    mut task: Box<dyn TickTask>,
    receiver: Receiver<Envelope>,
    clock: Arc<dyn ClockReader>,
    flags: Arc<WorkerFlags>,
) {
    let _guard = ExitGuard(flags.clone());
    let name = task.name().to_string();
    let interval = task.tick_interval();

    info!(
        worker = %name,
        interval_ms = interval.as_millis() as u64,
        background = task.is_background(),
        "worker started"
    );

    match task.on_start(clock.now()) {
        Ok(()) => {}
        Err(TickError::Recoverable(e)) => {
            warn!(worker = %name, error = %format!("{:#}", e), "startup step failed, continuing");
        }
        Err(TickError::Fatal(e)) => {
            error!(worker = %name, error = %format!("{:#}", e), "startup step failed fatally");
            task.on_exit(clock.now());
            return;
        }
    }

    loop {
        let Some(messages) = wait_for_mail(&receiver, interval) else {
            debug!(worker = %name, "owner dropped, leaving loop");
            break;
        };

        let now = clock.now();
        match task.on_tick(now, messages) {
            Ok(TickFlow::Continue) => {}
            Ok(TickFlow::Finish) => {
                info!(worker = %name, now, "worker finished its work");
                break;
            }
            Err(TickError::Recoverable(e)) => {
                warn!(worker = %name, now, error = %format!("{:#}", e), "tick failed, continuing");
            }
            Err(TickError::Fatal(e)) => {
                error!(worker = %name, now, error = %format!("{:#}", e), "tick failed fatally, stopping worker");
                break;
            }
        }

        if flags.stop_requested.load(Ordering::Acquire) {
            break;
        }
    }

    task.on_exit(clock.now());
    info!(worker = %name, "worker exited");
}

/// Block until mail arrives or `timeout` elapses, then drain everything
/// pending. `None` means every sender is gone.
fn wait_for_mail(receiver: &Receiver<Envelope>, timeout: Duration) -> Option<Mailbox> {
    let mut mailbox = Mailbox::new();
    match receiver.recv_timeout(timeout) {
        Ok(envelope) => absorb(&mut mailbox, envelope),
        Err(RecvTimeoutError::Timeout) => return Some(mailbox),
        Err(RecvTimeoutError::Disconnected) => return None,
    }
    for envelope in receiver.try_iter() {
        absorb(&mut mailbox, envelope);
    }
    Some(mailbox)
}

fn absorb(mailbox: &mut Mailbox, envelope: Envelope) {
    if let Envelope::Post { key, value } = envelope {
        mailbox.insert(key, value);
    }
}
