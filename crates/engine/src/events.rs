//! Notifications from the background workers to whoever is listening.

use crate::sync::{SyncReport, SyncState};
use crate::update::UpdateStatus;
use ahdb_store::Scope;
use std::path::PathBuf;
use tokio::sync::broadcast;

const CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    SyncState(SyncState),
    SyncFinished(SyncReport),
    SyncFailed(String),
    ExportWritten { scope: Scope, path: PathBuf },
    ExportSkipped { scope: Scope, reason: SkipReason },
    ExportFailed { scope: Scope, error: String },
    UpdateChecked(UpdateStatus),
    UpdateCheckFailed(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// A newer job for the same scope took over.
    Superseded,
    /// The scope has no snapshot yet.
    SourceMissing,
}

/// Broadcast channel shared by every worker. Emitting never blocks and never
/// fails; slow receivers observe `Lagged` instead of stalling the engine.
#[derive(Clone, Debug)]
pub struct Events {
    sender: broadcast::Sender<EngineEvent>,
}

impl Events {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        // No receivers is fine.
        let _ = self.sender.send(event);
    }
}

impl Default for Events {
    fn default() -> Self {
        Self::new()
    }
}
