//! In-memory repository. Durable only for the life of the process.
//!
//! History keeps only the latest edit per cell, which is all hydration
//! reads, so memory stays bounded by canvas area rather than edit count.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{CanvasMeta, CanvasRepo, RepoError, StoredCanvas};
use crate::grid::GridSnapshot;
use crate::ledger::PixelEdit;

#[derive(Default)]
pub struct MemoryRepo {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    canvases: HashMap<String, StoredCanvas>,
    history: HashMap<(String, u32, u32), PixelEdit>,
}

impl MemoryRepo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of cells with a stored history edit.
    #[cfg(test)]
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.lock().history.len()
    }
}

#[async_trait::async_trait]
impl CanvasRepo for MemoryRepo {
    async fn load_canvas(&self, canvas_id: &str) -> Result<Option<StoredCanvas>, RepoError> {
        Ok(self.lock().canvases.get(canvas_id).cloned())
    }

    async fn load_history(&self, canvas_id: &str) -> Result<Vec<PixelEdit>, RepoError> {
        Ok(self
            .lock()
            .history
            .values()
            .filter(|edit| edit.canvas_id == canvas_id)
            .cloned()
            .collect())
    }

    async fn insert_canvas(&self, canvas: &StoredCanvas) -> Result<(), RepoError> {
        self.lock()
            .canvases
            .insert(canvas.meta.id.clone(), canvas.clone());
        Ok(())
    }

    async fn save_snapshot(&self, canvas_id: &str, snapshot: &GridSnapshot) -> Result<(), RepoError> {
        let mut inner = self.lock();
        let Some(stored) = inner.canvases.get_mut(canvas_id) else {
            return Err(RepoError::Corrupt { canvas_id: canvas_id.to_owned(), reason: "canvas row missing".into() });
        };
        stored.snapshot.clone_from(snapshot);
        Ok(())
    }

    async fn append_history(&self, edits: &[PixelEdit]) -> Result<(), RepoError> {
        let mut inner = self.lock();
        for edit in edits {
            let key = (edit.canvas_id.clone(), edit.x, edit.y);
            let newer = inner
                .history
                .get(&key)
                .is_none_or(|current| current.attribution.timestamp <= edit.attribution.timestamp);
            if newer {
                inner.history.insert(key, edit.clone());
            }
        }
        Ok(())
    }

    async fn list_community(&self) -> Result<Vec<CanvasMeta>, RepoError> {
        let mut pubs = self
            .lock()
            .canvases
            .values()
            .filter(|c| !c.meta.is_private)
            .map(|c| c.meta.clone())
            .collect::<Vec<_>>();
        pubs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(pubs)
    }
}
