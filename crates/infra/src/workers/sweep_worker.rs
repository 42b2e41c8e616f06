use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::dlq::{Cancellation, DeadLetterQueue, DeadLetterStore, ProcessOptions};

/// Sweep worker runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepWorkerStats {
    pub sweeps: u64,
    pub resolved: u64,
    pub failed: u64,
    pub quarantined: u64,
    pub sweep_errors: u64,
    pub uptime_secs: u64,
}

/// Handle to control and join a running sweep worker.
#[derive(Debug)]
pub struct SweepWorkerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    cancellation: Cancellation,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<SweepWorkerStats>>,
}

impl SweepWorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// A sweep in progress finishes the records it already started.
    pub async fn shutdown(mut self) {
        self.cancellation.cancel();
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    pub fn stats(&self) -> SweepWorkerStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// Periodic scheduler for [`DeadLetterQueue::process`].
///
/// The queue itself never spawns anything; this is the optional piece that
/// runs sweeps on an interval until shut down.
#[derive(Debug)]
pub struct SweepWorker;

impl SweepWorker {
    /// Spawn a task that sweeps `queue` every `interval`, starting immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<S>(
        name: &'static str,
        queue: Arc<DeadLetterQueue<S>>,
        interval: Duration,
    ) -> SweepWorkerHandle
    where
        S: DeadLetterStore + 'static,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let cancellation = Cancellation::new();
        let stats = Arc::new(Mutex::new(SweepWorkerStats::default()));

        let join = tokio::spawn(worker_loop(
            name,
            queue,
            interval,
            shutdown_rx,
            cancellation.clone(),
            stats.clone(),
        ));

        SweepWorkerHandle {
            shutdown: Some(shutdown_tx),
            cancellation,
            join: Some(join),
            stats,
        }
    }
}

async fn worker_loop<S>(
    name: &'static str,
    queue: Arc<DeadLetterQueue<S>>,
    interval: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
    cancellation: Cancellation,
    stats: Arc<Mutex<SweepWorkerStats>>,
) where
    S: DeadLetterStore + 'static,
{
    info!(worker = name, interval_ms = interval.as_millis() as u64, "sweep worker started");
    let started = Instant::now();

    // tokio panics on a zero period
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown_rx => break,

            _ = ticker.tick() => {
                let options = ProcessOptions::new().with_cancellation(cancellation.clone());
                let result = queue.process_with(options).await;

                let mut s = stats.lock().unwrap_or_else(|p| p.into_inner());
                s.sweeps += 1;
                s.uptime_secs = started.elapsed().as_secs();
                match result {
                    Ok(report) => {
                        s.resolved += report.resolved as u64;
                        s.failed += report.failed() as u64;
                        s.quarantined += report.quarantined as u64;
                        if report.attempted() > 0 {
                            debug!(
                                worker = name,
                                resolved = report.resolved,
                                failed = report.failed(),
                                "sweep completed"
                            );
                        }
                    }
                    Err(e) => {
                        s.sweep_errors += 1;
                        error!(worker = name, error = %e, "dead letter sweep failed");
                    }
                }
            }
        }
    }

    info!(worker = name, "sweep worker stopped");
}
