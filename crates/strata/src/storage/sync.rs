//! Background owner of the fast index
//!
//! All mutations of the fast index go through one task fed by a bounded
//! channel. Writers mirror entries with `try_send`; when the queue is full the
//! entry is dropped and the index is marked stale, so the next tick rebuilds
//! it from the semantic store instead of blocking the write path.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::FastIndexConfig;
use crate::error::{Result, StrataError};
use crate::storage::fast::{FastEntry, FastIndex};
use crate::storage::semantic::SemanticStore;

/// Rows carrying this column have been replaced and are left out of the index
const SUPERSEDED_FIELD: &str = "superseded_by";

pub enum SyncCommand {
    Mirror(FastEntry),
    Remove(String),
    Rebuild(oneshot::Sender<Result<u64>>),
    Flush(oneshot::Sender<Result<u64>>),
    Shutdown(oneshot::Sender<()>),
}

/// Sending side of the sync worker
pub struct SyncHandle {
    tx: mpsc::Sender<SyncCommand>,
    index: Arc<FastIndex>,
    /// Entries received by the worker but not yet folded into a generation
    buffered: Arc<AtomicUsize>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl SyncHandle {
    /// Start the worker on the current runtime
    pub fn spawn(
        index: Arc<FastIndex>,
        semantic: Arc<SemanticStore>,
        config: &FastIndexConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let buffered = Arc::new(AtomicUsize::new(0));
        let worker = SyncWorker {
            index: Arc::clone(&index),
            semantic,
            rx,
            buffered: Arc::clone(&buffered),
            upserts: Vec::new(),
            removals: Vec::new(),
        };
        let join = tokio::spawn(worker.run(config.sync_interval()));
        Self {
            tx,
            index,
            buffered,
            join: Mutex::new(Some(join)),
        }
    }

    pub fn index(&self) -> &Arc<FastIndex> {
        &self.index
    }

    fn try_send(&self, command: SyncCommand) {
        match self.tx.try_send(command) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Fast index sync queue full; scheduling rebuild");
                self.index.mark_stale();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Fast index sync worker stopped; index marked stale");
                self.index.mark_stale();
            }
        }
    }

    /// Queue an entry for the next mirror batch. Never blocks.
    pub fn mirror(&self, entry: FastEntry) {
        self.try_send(SyncCommand::Mirror(entry));
    }

    pub fn remove(&self, record_id: &str) {
        self.try_send(SyncCommand::Remove(record_id.to_string()));
    }

    async fn request<F>(&self, make: F) -> Result<u64>
    where
        F: FnOnce(oneshot::Sender<Result<u64>>) -> SyncCommand,
    {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| StrataError::tier_unavailable("fast", "sync worker stopped"))?;
        rx.await
            .map_err(|_| StrataError::tier_unavailable("fast", "sync worker dropped request"))?
    }

    /// Rebuild from the semantic store and wait for the swap
    pub async fn rebuild(&self) -> Result<u64> {
        self.request(SyncCommand::Rebuild).await
    }

    /// Fold everything queued so far and persist; returns the live generation
    pub async fn flush(&self) -> Result<u64> {
        self.request(SyncCommand::Flush).await
    }

    /// Commands waiting in the channel plus entries not yet folded
    pub fn queue_depth(&self) -> usize {
        let queued = self.tx.max_capacity() - self.tx.capacity();
        queued + self.buffered.load(Ordering::Relaxed)
    }

    /// Fold pending entries, persist the index and stop the worker
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(SyncCommand::Shutdown(reply)).await.is_ok() {
            let _ = rx.await;
        }
        let join = self.join.lock().take();
        if let Some(join) = join {
            if let Err(e) = join.await {
                warn!(error = %e, "Fast index sync worker panicked");
            }
        }
    }
}

struct SyncWorker {
    index: Arc<FastIndex>,
    semantic: Arc<SemanticStore>,
    rx: mpsc::Receiver<SyncCommand>,
    buffered: Arc<AtomicUsize>,
    upserts: Vec<FastEntry>,
    removals: Vec<String>,
}

impl SyncWorker {
    async fn run(mut self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_ms = interval.as_millis() as u64, "Fast index sync worker started");

        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(SyncCommand::Mirror(entry)) => self.buffer_upsert(entry),
                    Some(SyncCommand::Remove(id)) => self.buffer_removal(id),
                    Some(SyncCommand::Rebuild(reply)) => {
                        let _ = reply.send(self.rebuild().await);
                    }
                    Some(SyncCommand::Flush(reply)) => {
                        let _ = reply.send(self.flush().await);
                    }
                    Some(SyncCommand::Shutdown(reply)) => {
                        if let Err(e) = self.flush().await {
                            warn!(error = %e, "Failed to flush fast index on shutdown");
                        }
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        if let Err(e) = self.flush().await {
                            warn!(error = %e, "Failed to flush fast index on close");
                        }
                        break;
                    }
                },
                _ = ticker.tick() => self.tick().await,
            }
        }
        info!("Fast index sync worker stopped");
    }

    fn buffer_upsert(&mut self, entry: FastEntry) {
        self.removals.retain(|id| *id != entry.record_id);
        self.upserts.retain(|e| e.record_id != entry.record_id);
        self.upserts.push(entry);
        self.update_buffered();
    }

    fn buffer_removal(&mut self, id: String) {
        self.upserts.retain(|e| e.record_id != id);
        if !self.removals.contains(&id) {
            self.removals.push(id);
        }
        self.update_buffered();
    }

    fn update_buffered(&self) {
        self.buffered
            .store(self.upserts.len() + self.removals.len(), Ordering::Relaxed);
    }

    fn clear_buffer(&mut self) {
        self.upserts.clear();
        self.removals.clear();
        self.update_buffered();
    }

    async fn tick(&mut self) {
        if self.index.is_stale() {
            if let Err(e) = self.rebuild().await {
                warn!(error = %e, "Fast index rebuild failed");
            }
        } else if !self.upserts.is_empty() || !self.removals.is_empty() {
            if let Err(e) = self.fold().await {
                warn!(error = %e, "Fast index mirror batch failed; scheduling rebuild");
                self.index.mark_stale();
            }
        }
    }

    async fn fold(&mut self) -> Result<u64> {
        let upserts = std::mem::take(&mut self.upserts);
        let removals = std::mem::take(&mut self.removals);
        self.update_buffered();
        let index = Arc::clone(&self.index);
        tokio::task::spawn_blocking(move || index.apply(upserts, &removals))
            .await
            .map_err(|e| StrataError::Storage(format!("Fast index task failed: {e}")))?
    }

    async fn flush(&mut self) -> Result<u64> {
        if self.index.is_stale() {
            return self.rebuild().await;
        }
        if !self.upserts.is_empty() || !self.removals.is_empty() {
            if let Err(e) = self.fold().await {
                self.index.mark_stale();
                return Err(e);
            }
        }
        self.persist().await?;
        Ok(self.index.generation())
    }

    /// Scan every compatible collection and swap in a complete generation.
    /// Buffered updates are already reflected in the semantic store.
    async fn rebuild(&mut self) -> Result<u64> {
        self.clear_buffer();
        // Before the scan: a mirror dropped mid-scan must leave the index stale
        self.index.clear_stale();
        let entries = match self.collect_entries().await {
            Ok(entries) => entries,
            Err(e) => {
                self.index.mark_stale();
                return Err(e);
            }
        };
        debug!(vectors = entries.len(), "Rebuilding fast index");

        let index = Arc::clone(&self.index);
        let generation = tokio::task::spawn_blocking(move || index.build_from(entries))
            .await
            .map_err(|e| StrataError::Storage(format!("Fast index task failed: {e}")))??;
        self.persist().await?;
        Ok(generation)
    }

    async fn collect_entries(&self) -> Result<Vec<FastEntry>> {
        let mut entries = Vec::new();
        for name in self.semantic.collection_names() {
            if let Some(reason) = self.semantic.needs_migration(&name).await? {
                warn!(collection = %name, %reason, "Skipping unmigrated collection in fast index");
                continue;
            }
            let rows = self.semantic.scan(&name, None).await?;
            entries.extend(
                rows.into_iter()
                    .filter(|row| !row.metadata.contains_key(SUPERSEDED_FIELD))
                    .map(|row| FastEntry {
                        record_id: row.id,
                        collection: name.clone(),
                        embedding: row.embedding,
                    }),
            );
        }
        Ok(entries)
    }

    async fn persist(&self) -> Result<()> {
        let index = Arc::clone(&self.index);
        tokio::task::spawn_blocking(move || index.persist())
            .await
            .map_err(|e| StrataError::Storage(format!("Fast index task failed: {e}")))?
    }
}
