//! Background notification queue
//!
//! Decouples request handling from notification delivery. Handlers enqueue
//! a trace id and return immediately; a single worker task processes jobs
//! in order, waiting the configured delay before each one so the trace row
//! is committed before any platform is called. Jobs that fail with a
//! storage error are re-run a bounded number of times. When every sender
//! is dropped the worker drains what is left and exits, so pending
//! notifications survive a graceful shutdown.

use crate::config::NotifyConfig;
use crate::notify::dispatcher::Dispatcher;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Cloneable handle for enqueueing notification jobs
#[derive(Clone)]
pub struct NotifyQueue {
    sender: mpsc::UnboundedSender<String>,
}

impl NotifyQueue {
    /// Spawn the worker task and return the handle pair.
    ///
    /// The `JoinHandle` completes once every `NotifyQueue` clone has been
    /// dropped and the remaining jobs are processed; await it on shutdown.
    pub fn spawn(dispatcher: Arc<Dispatcher>, config: &NotifyConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let delay = Duration::from_secs(config.queue_delay_secs);
        let retries = config.task_retries;

        let handle = tokio::spawn(async move {
            queue_task(dispatcher, rx, delay, retries).await;
        });

        (Self { sender: tx }, handle)
    }

    /// Queue a trace for notification (non-blocking)
    pub fn enqueue(&self, trace_id: &str) {
        if self.sender.send(trace_id.to_string()).is_err() {
            tracing::error!(
                trace_id,
                "Notification queue is closed, trace will not be notified"
            );
        }
    }
}

async fn queue_task(
    dispatcher: Arc<Dispatcher>,
    mut rx: mpsc::UnboundedReceiver<String>,
    delay: Duration,
    retries: u32,
) {
    // recv() keeps returning buffered jobs after the senders are gone,
    // so a shutdown drains the queue instead of dropping it.
    while let Some(trace_id) = rx.recv().await {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        run_job(&dispatcher, &trace_id, retries).await;
    }

    tracing::info!("Notification queue shutting down");
}

async fn run_job(dispatcher: &Dispatcher, trace_id: &str, retries: u32) {
    let mut attempt: u32 = 0;
    loop {
        match dispatcher.dispatch(trace_id).await {
            Ok(()) => return,
            Err(err) if attempt < retries => {
                attempt += 1;
                let delay = retry_delay(attempt);
                tracing::warn!(
                    trace_id,
                    attempt,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "Notification dispatch failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                tracing::error!(
                    level = "CRITICAL",
                    trace_id,
                    error = %err,
                    "Notification dispatch failed permanently"
                );
                crate::metrics::record_dispatch_abandoned("storage_error");
                return;
            }
        }
    }
}

/// Exponential backoff with jitter so queued retries do not line up behind
/// the same contended database
fn retry_delay(attempt: u32) -> Duration {
    let base = 500u64 << attempt.saturating_sub(1).min(3);
    let jitter = rand::thread_rng().gen_range(0..250);
    Duration::from_millis(base + jitter)
}
