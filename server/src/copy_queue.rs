//! Asynchronous copy queue.
//!
//! Some paths learn that an upstream has an artifact without streaming
//! its body, most prominently a HEAD answered `REMOTE`. Those paths
//! enqueue a copy job here; a single consumer downloads the artifact
//! from the winning upstream URL and ingests it into the configured
//! tiers, so the next GET is a local hit.
//!
//! Jobs are fire-and-forget: a failed download or ingest bumps a
//! counter and is dropped. There are no retries; the next client
//! request for the same artifact re-triggers warming.

use std::sync::atomic::Ordering;

use reqwest::Url;
use tokio::sync::mpsc;
use tracing::instrument;

use granary::namespace::Namespace;

use crate::error::{ServerError, ServerResult};
use crate::upstream::{decompressed_body, FanOutWin};
use crate::State;

/// Queue depth. Producers drop jobs when the queue is full.
const QUEUE_CAPACITY: usize = 256;

/// A pending copy of one upstream artifact.
#[derive(Debug)]
pub struct CopyJob {
    pub namespace: Namespace,

    /// The upstream URL that won the fan-out.
    pub url: Url,

    /// Logical name to ingest under, e.g. `nar/{hash}.nar`.
    pub name: String,
}

/// The producer half of the copy queue.
#[derive(Debug, Clone)]
pub struct CopyQueue {
    tx: mpsc::Sender<CopyJob>,
}

impl CopyQueue {
    pub fn new() -> (Self, mpsc::Receiver<CopyJob>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        (Self { tx }, rx)
    }

    /// Enqueues a job, dropping it if the queue is full.
    pub fn enqueue(&self, job: CopyJob) {
        if let Err(e) = self.tx.try_send(job) {
            tracing::warn!("Copy queue full, dropping job: {}", e);
        }
    }
}

/// Runs the single consumer until the queue closes.
pub async fn run_copier(state: State, mut rx: mpsc::Receiver<CopyJob>) {
    while let Some(job) = rx.recv().await {
        let deadline = state.config.timeouts.nar_get;

        let result = tokio::time::timeout(deadline, copy_artifact(&state, &job)).await;

        match result {
            Ok(Ok(())) => {
                state.metrics.copy_successes.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                state.metrics.copy_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Copy of {} from {} failed: {}", job.name, job.url, e);
            }
            Err(_) => {
                state.metrics.copy_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Copy of {} from {} timed out", job.name, job.url);
            }
        }
    }
}

#[instrument(skip_all, fields(name = %job.name, url = %job.url))]
async fn copy_artifact(state: &State, job: &CopyJob) -> ServerResult<()> {
    let response = state
        .http
        .get(job.url.clone())
        .send()
        .await
        .map_err(ServerError::request_error)?;

    if !response.status().is_success() {
        return Err(ServerError::UpstreamUnavailable);
    }

    if job.name.ends_with(".narinfo") {
        let manifest = response.text().await.map_err(ServerError::request_error)?;
        let canonical = state.canonicalize_narinfo(&job.namespace, &manifest)?;

        state
            .ingest_bytes_all_tiers(&job.namespace, &job.name, canonical.into_bytes())
            .await?;
    } else {
        let win = FanOutWin {
            url: job.url.clone(),
            response,
        };
        let reader = decompressed_body(win)?;

        state
            .ingest_reader_all_tiers(&job.namespace, &job.name, reader)
            .await?;
    }

    tracing::debug!("Warmed {} from upstream", job.name);

    Ok(())
}
