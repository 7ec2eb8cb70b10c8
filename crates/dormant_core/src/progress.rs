/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - Dormant Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::error::RunError;
use crate::scheduler::CancelSignal;
use dormant_protocol::{
    BatchProgress, CacheStats, DataSource, InactiveFollow, ProgressEvent, Stage, StreamFrame,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
pub struct EmitExtra {
    pub batch_progress: Option<BatchProgress>,
    pub data_source: Option<DataSource>,
}

impl EmitExtra {
    pub fn batch(current: u64, total: u64) -> Self {
        Self {
            batch_progress: Some(BatchProgress { current, total }),
            data_source: None,
        }
    }

    pub fn source(data_source: DataSource) -> Self {
        Self {
            batch_progress: None,
            data_source: Some(data_source),
        }
    }
}

/// Status stream of one run. Events go to a single subscriber over an
/// unbounded channel; stages only move forward and the first terminal frame
/// closes the stream.
pub struct ProgressEmitter {
    tx: Option<mpsc::UnboundedSender<StreamFrame>>,
    stage: Mutex<Stage>,
    finished: AtomicBool,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel: CancelSignal,
}

impl ProgressEmitter {
    /// Emitter wired to a subscriber. Dropping the receiver cancels the run.
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<StreamFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let emitter = Arc::new(Self::build(Some(tx.clone())));

        let cancel_tx = emitter.cancel_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tx.closed() => {
                    if !*cancel_tx.borrow() {
                        debug!("progress subscriber went away, cancelling run");
                    }
                    cancel_tx.send_replace(true);
                }
                _ = cancel_tx.closed() => {}
            }
        });
        (emitter, rx)
    }

    /// Emitter without a subscriber, for callers that only want the result.
    pub fn detached() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    fn build(tx: Option<mpsc::UnboundedSender<StreamFrame>>) -> Self {
        let (cancel_tx, cancel) = CancelSignal::channel();
        Self {
            tx,
            stage: Mutex::new(Stage::Cache),
            finished: AtomicBool::new(false),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            cancel_tx: Arc::new(cancel_tx),
            cancel,
        }
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn record_hits(&self, n: u64) {
        self.cache_hits.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_misses(&self, n: u64) {
        self.cache_misses.fetch_add(n, Ordering::Relaxed);
    }

    pub fn cache_counts(&self) -> (u64, u64) {
        (
            self.cache_hits.load(Ordering::Relaxed),
            self.cache_misses.load(Ordering::Relaxed),
        )
    }

    /// Returns false when the event was dropped (earlier stage, or the run
    /// already finished).
    pub fn emit(
        &self,
        stage: Stage,
        processed: u64,
        total: u64,
        current: impl Into<String>,
        extra: EmitExtra,
    ) -> bool {
        if self.finished.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut cur = self.stage.lock().unwrap_or_else(|e| e.into_inner());
            if stage < *cur {
                return false;
            }
            *cur = stage;
        }
        let (cache_hits, cache_misses) = self.cache_counts();
        self.send(StreamFrame::Progress(ProgressEvent {
            stage,
            processed,
            total,
            current: current.into(),
            cache_hits,
            cache_misses,
            batch_progress: extra.batch_progress,
            data_source: extra.data_source,
        }));
        true
    }

    pub fn complete(&self, inactive_follows: Vec<InactiveFollow>, cache_stats: CacheStats, warnings: Vec<String>) {
        if !self.finish() {
            return;
        }
        *self.stage.lock().unwrap_or_else(|e| e.into_inner()) = Stage::Complete;
        self.send(StreamFrame::Complete {
            inactive_follows,
            cache_stats,
            warnings,
        });
    }

    pub fn fail(&self, err: &RunError) {
        if !self.finish() {
            return;
        }
        self.send(StreamFrame::Error {
            error: err.to_string(),
            retry_after_secs: err.retry_after().map(|d| d.as_secs().max(1)),
        });
    }

    fn finish(&self) -> bool {
        !self.finished.swap(true, Ordering::AcqRel)
    }

    fn send(&self, frame: StreamFrame) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(frame);
        }
    }
}
