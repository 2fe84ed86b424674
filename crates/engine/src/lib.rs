//! Background workers of ahdb.
//!
//! - [`SyncEngine`] pulls missing snapshots from the remote into the store.
//! - [`Watcher`] notices new snapshots for selected realms and, after a quiet
//!   period, schedules export jobs.
//! - [`export_worker`] runs those jobs through the export pipeline.
//! - [`UpdateChecker`] classifies the newest published release.
//!
//! Workers share nothing but the store and report through [`Events`].

mod dispatch;
pub mod error;
mod events;
mod sync;
mod update;
mod watch;

pub use crate::dispatch::{export_worker, run_job};
pub use crate::events::{EngineEvent, Events, SkipReason};
pub use crate::sync::{KeyFailure, SyncEngine, SyncOutcome, SyncReport, SyncState};
pub use crate::update::{Elapsed, UpdateChecker, UpdateStatus, classify};
pub use crate::watch::{ChangeEvent, Watcher};
