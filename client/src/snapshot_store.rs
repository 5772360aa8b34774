use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use common::Snapshot;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::storage::{SNAPSHOT_KEY, Storage};

/// Where the engine hands snapshots after each mutation
pub trait SnapshotSink: Send + Sync {
    fn save(&self, snapshot: Snapshot);
    fn clear(&self);
}

/// Reads and writes the single persisted game snapshot
#[derive(Clone)]
pub struct SnapshotStore {
    storage: Arc<dyn Storage>,
    ttl: TimeDelta,
}

impl SnapshotStore {
    pub fn new(storage: Arc<dyn Storage>, ttl: TimeDelta) -> Self {
        Self { storage, ttl }
    }

    /// Returns the stored snapshot if it is still fresh at `now`.
    ///
    /// Stale and malformed snapshots are removed so the next start sees nothing.
    pub fn load(&self, now: DateTime<Utc>) -> Option<Snapshot> {
        let raw = match self.storage.load(SNAPSHOT_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to read game snapshot: {:#}", e);
                return None;
            }
        };

        let snapshot = match serde_json::from_str::<Snapshot>(&raw) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Discarding malformed game snapshot: {}", e);
                self.discard();
                return None;
            }
        };

        if !snapshot.is_fresh_at(now, self.ttl) {
            warn!(
                "Discarding stale game snapshot from {} ({} entries)",
                snapshot.last_event_at,
                snapshot.history.len()
            );
            self.discard();
            return None;
        }

        info!(
            "Restoring game snapshot: {} entries, total {}",
            snapshot.history.len(),
            snapshot.total()
        );
        Some(snapshot)
    }

    pub fn save_now(&self, snapshot: &Snapshot) -> Result<()> {
        let raw = serde_json::to_string(snapshot).context("Failed to serialize game snapshot")?;
        self.storage.store(SNAPSHOT_KEY, &raw)
    }

    pub fn clear_now(&self) -> Result<()> {
        self.storage.remove(SNAPSHOT_KEY)
    }

    fn discard(&self) {
        if let Err(e) = self.clear_now() {
            warn!("Failed to remove game snapshot: {:#}", e);
        }
    }
}

enum WriterCommand {
    Save(Snapshot),
    Clear,
    Flush(oneshot::Sender<()>),
}

/// Debounced background writer: bursts of saves collapse into one write once
/// the stream of mutations has been quiet for the debounce window.
#[derive(Clone)]
pub struct SnapshotWriter {
    tx: mpsc::UnboundedSender<WriterCommand>,
}

impl SnapshotWriter {
    pub fn spawn(store: SnapshotStore, debounce: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(store, debounce, rx));
        Self { tx }
    }

    /// Writes any pending snapshot immediately and waits for it
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriterCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    fn submit(&self, command: WriterCommand) {
        if self.tx.send(command).is_err() {
            warn!("Snapshot writer has stopped; dropping snapshot update");
        }
    }
}

impl SnapshotSink for SnapshotWriter {
    fn save(&self, snapshot: Snapshot) {
        self.submit(WriterCommand::Save(snapshot));
    }

    fn clear(&self) {
        self.submit(WriterCommand::Clear);
    }
}

async fn run_writer(
    store: SnapshotStore,
    debounce: Duration,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
) {
    let mut pending: Option<Snapshot> = None;

    loop {
        let command = if pending.is_some() {
            match timeout(debounce, rx.recv()).await {
                Ok(command) => command,
                Err(_) => {
                    write_pending(&store, &mut pending);
                    continue;
                }
            }
        } else {
            rx.recv().await
        };

        match command {
            Some(WriterCommand::Save(snapshot)) => pending = Some(snapshot),
            Some(WriterCommand::Clear) => {
                // A clear supersedes anything still waiting to be written
                pending = None;
                if let Err(e) = store.clear_now() {
                    warn!("Failed to clear game snapshot: {:#}", e);
                } else {
                    debug!("Game snapshot cleared");
                }
            }
            Some(WriterCommand::Flush(done)) => {
                write_pending(&store, &mut pending);
                let _ = done.send(());
            }
            None => {
                write_pending(&store, &mut pending);
                break;
            }
        }
    }
}

fn write_pending(store: &SnapshotStore, pending: &mut Option<Snapshot>) {
    if let Some(snapshot) = pending.take() {
        match store.save_now(&snapshot) {
            Ok(()) => debug!("Game snapshot saved ({} entries)", snapshot.history.len()),
            Err(e) => warn!("Failed to save game snapshot: {:#}", e),
        }
    }
}
