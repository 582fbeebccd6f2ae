//! Bounded execution pipeline — backpressured queue drained by a fixed worker pool.
//!
//! ```text
//! submit ──► [ mpsc, depth = queue_capacity ] ──► worker 1..=max_parallelism ──► job
//!   │                                                  │
//!   └─ waits for a slot or cancellation                └─ fatal error / panic ⇒ fault
//! ```
//!
//! A job that returns a non-fatal error only fails its own submission. A fatal error or
//! a panic faults the whole pipeline: workers stop and every later submission fails.

use faultlens_core::{FaultLensError, Result};
use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Work item run by a pipeline worker.
pub type PipelineJob = BoxFuture<'static, Result<()>>;

struct Submission {
    workflow_id: Uuid,
    job: PipelineJob,
}

#[derive(Default)]
struct Counters {
    active: AtomicUsize,
    processed: AtomicU64,
    failed: AtomicU64,
    faulted: AtomicBool,
}

/// Snapshot of pipeline load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub queued: usize,
    pub active: usize,
    pub queue_capacity: usize,
    pub max_parallelism: usize,
    pub total_processed: u64,
    pub total_failed: u64,
    pub faulted: bool,
}

pub struct ExecutionPipeline {
    sender: mpsc::Sender<Submission>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    max_parallelism: usize,
}

impl ExecutionPipeline {
    /// Start the worker pool. Must be called inside a tokio runtime.
    pub fn new(queue_capacity: usize, max_parallelism: usize, cancel: CancellationToken) -> Result<Self> {
        if queue_capacity == 0 || max_parallelism == 0 {
            return Err(FaultLensError::invalid_argument(
                "pipeline capacity and parallelism must be non-zero",
            ));
        }
        let (sender, receiver) = mpsc::channel(queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let counters = Arc::new(Counters::default());

        let workers = (0..max_parallelism)
            .map(|n| {
                tokio::spawn(worker(
                    n,
                    receiver.clone(),
                    counters.clone(),
                    cancel.clone(),
                ))
            })
            .collect();

        tracing::info!(
            "🚦 Pipeline started: capacity={}, workers={}",
            queue_capacity,
            max_parallelism
        );
        Ok(Self {
            sender,
            cancel,
            counters,
            workers: std::sync::Mutex::new(workers),
            max_parallelism,
        })
    }

    /// Fails once the pipeline has faulted or been cancelled.
    pub fn ensure_healthy(&self) -> Result<()> {
        if self.counters.faulted.load(Ordering::SeqCst) || self.cancel.is_cancelled() {
            return Err(FaultLensError::PipelineFaulted);
        }
        Ok(())
    }

    /// Queue a job, waiting for a free slot.
    pub async fn submit(&self, workflow_id: Uuid, job: PipelineJob) -> Result<()> {
        self.ensure_healthy()?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FaultLensError::Cancelled),
            sent = self.sender.send(Submission { workflow_id, job }) => {
                sent.map_err(|_| FaultLensError::PipelineFaulted)?;
                tracing::debug!(
                    "📥 Pipeline enqueue: {} (queued: {}, active: {})",
                    workflow_id,
                    self.queued(),
                    self.counters.active.load(Ordering::SeqCst)
                );
                Ok(())
            }
        }
    }

    fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            queued: self.queued(),
            active: self.counters.active.load(Ordering::SeqCst),
            queue_capacity: self.sender.max_capacity(),
            max_parallelism: self.max_parallelism,
            total_processed: self.counters.processed.load(Ordering::SeqCst),
            total_failed: self.counters.failed.load(Ordering::SeqCst),
            faulted: self.counters.faulted.load(Ordering::SeqCst),
        }
    }

    pub fn is_faulted(&self) -> bool {
        self.counters.faulted.load(Ordering::SeqCst)
    }

    /// Cancel and wait for every worker to exit. Queued jobs are dropped.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("🛑 Pipeline stopped");
    }
}

async fn worker(
    n: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Submission>>>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) {
    loop {
        let next = {
            let mut rx = receiver.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let Some(Submission { workflow_id, job }) = next else {
            break;
        };

        counters.active.fetch_add(1, Ordering::SeqCst);
        // Spawned so a panicking job surfaces as a JoinError instead of killing the worker.
        let outcome = tokio::spawn(job).await;
        counters.active.fetch_sub(1, Ordering::SeqCst);
        counters.processed.fetch_add(1, Ordering::SeqCst);

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_fatal() => {
                tracing::error!("💥 Pipeline faulted by {}: {}", workflow_id, e);
                fault(&counters, &cancel);
            }
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::SeqCst);
                tracing::warn!("⚠️ Job {} failed: {}", workflow_id, e);
            }
            Err(e) => {
                tracing::error!("💥 Pipeline faulted, job {} aborted: {}", workflow_id, e);
                fault(&counters, &cancel);
            }
        }
    }
    tracing::debug!("Pipeline worker {} exiting", n);
}

fn fault(counters: &Counters, cancel: &CancellationToken) {
    counters.faulted.store(true, Ordering::SeqCst);
    cancel.cancel();
}
