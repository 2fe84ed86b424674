//! Export of auction snapshots into TradeSkillMaster price files.
//!
//! [`ExportPipeline`] turns [`ExportJob`]s into one `AppData.lua`-style file
//! per selected realm. Per-snapshot [`SnapshotSummary`] values go through the
//! cache, keyed by snapshot fingerprint.

pub mod error;
mod pipeline;
pub mod summary;
pub mod tsm;

pub use crate::pipeline::{
    ExportJob, ExportOutcome, ExportPipeline, ExportTarget, HISTORICAL_WINDOW, SCAN_STAT_WINDOW, SUMMARY_NAMESPACE,
};
pub use crate::summary::{ItemStats, SnapshotSummary};
