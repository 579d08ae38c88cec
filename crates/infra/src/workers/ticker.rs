use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

/// Handle to control and join a ticker thread.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    shutdown: mpsc::Sender<()>,
    trigger: mpsc::SyncSender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run the tick as soon as possible. Triggers coalesce: if one is already
    /// pending this is a no-op.
    pub fn trigger(&self) {
        let _ = self.trigger.try_send(());
    }

    /// Request graceful shutdown and wait for the thread to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Fixed-interval loop on a dedicated named thread.
///
/// - Runs once on startup, then every `interval`
/// - Keeps a stable cadence when a tick overruns
/// - Failures and panics are logged; the next tick tries again
pub fn spawn_ticker<F, E>(name: &'static str, interval: Duration, mut tick: F) -> io::Result<WorkerHandle>
where
    F: FnMut() -> Result<(), E> + Send + 'static,
    E: core::fmt::Display,
{
    let interval = interval.max(Duration::from_millis(1));
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    let (trigger_tx, trigger_rx) = mpsc::sync_channel::<()>(1);

    let join = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || ticker_loop(name, interval, shutdown_rx, trigger_rx, &mut tick))?;

    Ok(WorkerHandle {
        name,
        shutdown: shutdown_tx,
        trigger: trigger_tx,
        join: Some(join),
    })
}

fn ticker_loop<F, E>(
    name: &'static str,
    interval: Duration,
    shutdown_rx: mpsc::Receiver<()>,
    trigger_rx: mpsc::Receiver<()>,
    tick: &mut F,
) where
    F: FnMut() -> Result<(), E>,
    E: core::fmt::Display,
{
    info!(worker = name, interval_secs = interval.as_secs(), "ticker started");

    let mut next_tick = Instant::now() + interval;
    let mut pending = true;

    loop {
        // Shutdown has priority.
        match shutdown_rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
            Err(mpsc::TryRecvError::Empty) => {}
        }

        let now = Instant::now();
        if now >= next_tick {
            pending = true;
            while next_tick <= now {
                next_tick += interval;
            }
        }

        while trigger_rx.try_recv().is_ok() {
            pending = true;
        }

        if !pending {
            let sleep_for = next_tick
                .saturating_duration_since(Instant::now())
                .min(Duration::from_millis(250));
            thread::sleep(sleep_for);
            continue;
        }
        pending = false;

        match panic::catch_unwind(AssertUnwindSafe(&mut *tick)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(worker = name, error = %e, "tick failed"),
            Err(payload) => error!(worker = name, panic = panic_message(payload.as_ref()), "tick panicked"),
        }
    }

    info!(worker = name, "ticker stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
