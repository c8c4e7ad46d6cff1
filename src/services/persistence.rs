//! Persistence service — background grid flush and batched history writes.
//!
//! DESIGN
//! ======
//! Placements only mutate memory. A background task flushes dirty grids on
//! a fixed interval, and history records flow through a bounded queue into
//! a batched writer, so the broadcast path never waits on the repository.
//!
//! ERROR HANDLING
//! ==============
//! Dirty flags are cleared only after a successful write of the revision
//! that was snapshotted. A failed save leaves the canvas dirty for the next
//! tick; the in-memory grid is never rolled back. History batches are
//! retried with linear back-off and then dropped with a warning.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::HistoryPersistConfig;
use crate::ledger::PixelEdit;
use crate::repo::{CanvasRepo, RepoError};
use crate::state::AppState;

// =============================================================================
// GRID FLUSH
// =============================================================================

/// Spawn the background grid flush task. Returns a handle for shutdown.
pub fn spawn_persistence_task(state: AppState, interval: Duration) -> JoinHandle<()> {
    info!(flush_interval = ?interval, "canvas persistence flush configured");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            flush_all_dirty(&state).await;
        }
    })
}

/// Flush every dirty canvas. Returns how many snapshots were written.
pub async fn flush_all_dirty(state: &AppState) -> usize {
    let canvas_ids: Vec<String> = state.canvases.read().await.keys().cloned().collect();

    let mut flushed = 0;
    for canvas_id in canvas_ids {
        match flush_canvas(state, &canvas_id).await {
            Ok(true) => flushed += 1,
            Ok(false) => {}
            Err(e) => error!(error = %e, %canvas_id, "canvas snapshot flush failed"),
        }
    }
    flushed
}

/// Write one canvas's snapshot if it is dirty. Returns whether a write
/// happened.
///
/// # Errors
///
/// Returns the repository error; the canvas stays dirty.
pub async fn flush_canvas(state: &AppState, canvas_id: &str) -> Result<bool, RepoError> {
    let Some(handle) = state.live_canvas(canvas_id).await else {
        return Ok(false);
    };

    // One writer per canvas: a slower flush must not land an older snapshot
    // after a newer one cleared the dirty flag.
    let flush_guard = handle.lock().await.flush_guard.clone();
    let _flushing = flush_guard.lock().await;

    // Snapshot under the canvas lock, write without it.
    let (snapshot, revision) = {
        let canvas = handle.lock().await;
        if !canvas.dirty {
            return Ok(false);
        }
        (canvas.grid.export_snapshot(), canvas.revision)
    };

    state.repo.save_snapshot(canvas_id, &snapshot).await?;

    let mut canvas = handle.lock().await;
    // EDGE: a placement landed after the snapshot; keep dirty for next tick.
    if canvas.revision == revision {
        canvas.dirty = false;
    }
    debug!(%canvas_id, revision, "canvas snapshot flushed");
    Ok(true)
}

// =============================================================================
// HISTORY WORKER
// =============================================================================

/// Handle to the running history writer.
pub struct HistoryWorker {
    handle: JoinHandle<()>,
    stop: oneshot::Sender<()>,
}

impl HistoryWorker {
    /// Close the queue, write what is already in it, and wait for the worker
    /// to exit. Returns `false` if that takes longer than `limit`.
    pub async fn shutdown(self, limit: Duration) -> bool {
        // Err only if the worker already exited.
        self.stop.send(()).ok();
        matches!(tokio::time::timeout(limit, self.handle).await, Ok(Ok(())))
    }
}

/// Spawn the batched history writer. Returns its queue and a handle for
/// shutdown. The worker also drains and exits once every sender is dropped.
#[must_use]
pub fn spawn_history_worker(
    repo: Arc<dyn CanvasRepo>,
    config: HistoryPersistConfig,
) -> (mpsc::Sender<PixelEdit>, HistoryWorker) {
    let (tx, mut rx) = mpsc::channel::<PixelEdit>(config.queue_capacity);
    let (stop, mut stop_rx) = oneshot::channel::<()>();

    info!(
        queue_capacity = config.queue_capacity,
        batch_size = config.batch_size,
        flush_ms = config.flush_ms,
        retries = config.retries,
        retry_base_ms = config.retry_base_ms,
        "history persistence worker configured"
    );

    let handle = tokio::spawn(async move {
        let mut batch: Vec<PixelEdit> = Vec::with_capacity(config.batch_size);
        let mut ticker = tokio::time::interval(Duration::from_millis(config.flush_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe_edit = rx.recv() => {
                    if let Some(edit) = maybe_edit {
                        batch.push(edit);
                        if batch.len() >= config.batch_size {
                            flush_history_with_retry(repo.as_ref(), &mut batch, config).await;
                        }
                    } else {
                        flush_history_with_retry(repo.as_ref(), &mut batch, config).await;
                        break;
                    }
                }
                _ = &mut stop_rx => {
                    // Late enqueues now see a closed queue; keep what is buffered.
                    rx.close();
                    while let Some(edit) = rx.recv().await {
                        batch.push(edit);
                        if batch.len() >= config.batch_size {
                            flush_history_with_retry(repo.as_ref(), &mut batch, config).await;
                        }
                    }
                    flush_history_with_retry(repo.as_ref(), &mut batch, config).await;
                    break;
                }
                _ = ticker.tick() => {
                    flush_history_with_retry(repo.as_ref(), &mut batch, config).await;
                }
            }
        }
        debug!("history persistence worker stopped");
    });

    (tx, HistoryWorker { handle, stop })
}

/// Best-effort, non-blocking enqueue of a history record.
pub fn enqueue_history(state: &AppState, edit: PixelEdit) {
    let Some(tx) = &state.history_tx else {
        return;
    };

    match tx.try_send(edit) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(edit)) => {
            warn!(canvas_id = %edit.canvas_id, x = edit.x, y = edit.y, "history queue full; dropping record");
        }
        Err(mpsc::error::TrySendError::Closed(edit)) => {
            warn!(canvas_id = %edit.canvas_id, x = edit.x, y = edit.y, "history queue closed; dropping record");
        }
    }
}

async fn flush_history_with_retry(repo: &dyn CanvasRepo, batch: &mut Vec<PixelEdit>, config: HistoryPersistConfig) {
    if batch.is_empty() {
        return;
    }

    let drained = std::mem::take(batch);
    for attempt in 1..=config.retries {
        match repo.append_history(&drained).await {
            Ok(()) => return,
            Err(e) if attempt < config.retries => {
                warn!(
                    error = %e,
                    attempt,
                    total = config.retries,
                    count = drained.len(),
                    "history batch persist failed; retrying"
                );
                tokio::time::sleep(Duration::from_millis(attempt as u64 * config.retry_base_ms)).await;
            }
            Err(e) => {
                warn!(error = %e, count = drained.len(), "history batch persist failed after retries; dropping records");
                return;
            }
        }
    }
}

#[cfg(test)]
#[path = "persistence_test.rs"]
mod tests;
