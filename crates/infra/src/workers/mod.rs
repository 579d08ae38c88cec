//! Periodic background tasks.
//!
//! Each [`TickTask`] runs on its own named thread via [`spawn_ticker`].

pub mod ticker;

use std::io;
use std::time::Duration;

use tracing::debug;

use crate::config::PipelineConfig;
use crate::context::PipelineContext;
use crate::error::QueueError;
use crate::jobs::RetryScheduler;
use crate::queue::{AutoProcessor, IndexRebuilder, QueueReporter};
use crate::sweeper::ExpirySweeper;

pub use ticker::{spawn_ticker, WorkerHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TickTask {
    RebuildIndex,
    DispatchJobs,
    ReplayDeadLetters,
    Cleanup,
    ExpirySweep,
    AutoProcess,
    QueueReport,
}

impl TickTask {
    pub const ALL: [TickTask; 7] = [
        TickTask::RebuildIndex,
        TickTask::DispatchJobs,
        TickTask::ReplayDeadLetters,
        TickTask::Cleanup,
        TickTask::ExpirySweep,
        TickTask::AutoProcess,
        TickTask::QueueReport,
    ];

    /// Thread name.
    pub fn name(self) -> &'static str {
        match self {
            TickTask::RebuildIndex => "augur-rebuild-index",
            TickTask::DispatchJobs => "augur-dispatch-jobs",
            TickTask::ReplayDeadLetters => "augur-replay-dead-letters",
            TickTask::Cleanup => "augur-cleanup",
            TickTask::ExpirySweep => "augur-expiry-sweep",
            TickTask::AutoProcess => "augur-auto-process",
            TickTask::QueueReport => "augur-queue-report",
        }
    }

    pub fn interval(self, config: &PipelineConfig) -> Duration {
        let secs = match self {
            TickTask::RebuildIndex => config.queue.rebuild_interval_secs,
            TickTask::DispatchJobs => config.dispatch.interval_secs,
            TickTask::ReplayDeadLetters => config.dead_letter.replay_interval_secs,
            TickTask::Cleanup => config.dead_letter.cleanup_interval_secs,
            TickTask::ExpirySweep => config.expiry.sweep_interval_secs,
            TickTask::AutoProcess => config.report.auto_process_interval_secs,
            TickTask::QueueReport => config.report.interval_secs,
        };
        Duration::from_secs(secs)
    }

    /// Build the task's body against `ctx`.
    pub fn body(self, ctx: &PipelineContext) -> Box<dyn FnMut() -> Result<(), QueueError> + Send> {
        match self {
            TickTask::RebuildIndex => {
                let rebuilder = IndexRebuilder::new(ctx);
                Box::new(move || rebuilder.rebuild().map(|_| ()))
            }
            TickTask::DispatchJobs => {
                let scheduler = RetryScheduler::new(ctx);
                Box::new(move || {
                    let report = scheduler.dispatch_tick();
                    debug!(?report, "dispatch tick");
                    Ok(())
                })
            }
            TickTask::ReplayDeadLetters => {
                let scheduler = RetryScheduler::new(ctx);
                Box::new(move || {
                    scheduler.replay_dead_letters();
                    Ok(())
                })
            }
            TickTask::Cleanup => {
                let scheduler = RetryScheduler::new(ctx);
                Box::new(move || {
                    scheduler.cleanup();
                    Ok(())
                })
            }
            TickTask::ExpirySweep => {
                let sweeper = ExpirySweeper::new(ctx);
                Box::new(move || sweeper.sweep().map(|_| ()))
            }
            TickTask::AutoProcess => {
                let auto = AutoProcessor::new(ctx);
                Box::new(move || {
                    let outcome = auto.run()?;
                    debug!(?outcome, "auto process tick");
                    Ok(())
                })
            }
            TickTask::QueueReport => {
                let reporter = QueueReporter::new(ctx);
                Box::new(move || reporter.generate().map(|_| ()))
            }
        }
    }
}

/// All tick workers of one process.
#[derive(Debug)]
pub struct Workers {
    handles: Vec<(TickTask, WorkerHandle)>,
}

impl Workers {
    /// Spawn one ticker per task. Already-started tickers are stopped if a
    /// later spawn fails.
    pub fn spawn(ctx: &PipelineContext, tasks: &[TickTask]) -> io::Result<Self> {
        let mut workers = Workers { handles: Vec::new() };
        for &task in tasks {
            let body = task.body(ctx);
            match spawn_ticker(task.name(), task.interval(&ctx.config), body) {
                Ok(handle) => workers.handles.push((task, handle)),
                Err(e) => {
                    workers.shutdown();
                    return Err(e);
                }
            }
        }
        Ok(workers)
    }

    pub fn spawn_all(ctx: &PipelineContext) -> io::Result<Self> {
        Self::spawn(ctx, &TickTask::ALL)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn trigger(&self, task: TickTask) {
        for (t, handle) in &self.handles {
            if *t == task {
                handle.trigger();
            }
        }
    }

    /// Stop every ticker, waiting for in-progress ticks to finish.
    pub fn shutdown(self) {
        for (_, handle) in self.handles {
            handle.shutdown();
        }
    }
}
