//! Orphan bridge resumption — the plug-in seam for adopting subprocess
//! output left behind by a crashed process.
//!
//! The classification policy (what gets adopted, harvested, marked
//! failed, or retried) lives entirely behind the trait; the execution
//! service only tallies and logs the resulting action counts.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CoreResult;

/// What the resumer did with one orphaned execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanAction {
    /// The orphan was re-attached to a live task.
    Adopted,
    /// Completed output was harvested into the task record.
    Harvested,
    /// The orphan was unrecoverable and its task marked failed.
    MarkedFailed,
    /// The orphan was re-queued with recovered context.
    RetriedWithContext,
}

/// Outcome for a single orphan.
#[derive(Debug, Clone)]
pub struct OrphanResumeResult {
    /// The task the orphan belonged to, when identifiable.
    pub task_id: Option<String>,

    /// What was done with it.
    pub action: OrphanAction,

    /// Free-form detail for logging.
    pub detail: Option<String>,
}

/// Injected policy that inspects a working directory for orphaned
/// subprocess output and disposes of each orphan.
#[async_trait]
pub trait BridgeOrphanResumer: Send + Sync {
    /// Process every orphan under `work_dir` and report what was done.
    async fn resume_orphans(&self, work_dir: &Path) -> CoreResult<Vec<OrphanResumeResult>>;
}

/// Tally results by action for the resumption summary log.
pub(crate) fn count_actions(results: &[OrphanResumeResult]) -> HashMap<OrphanAction, usize> {
    let mut counts = HashMap::new();
    for result in results {
        *counts.entry(result.action).or_insert(0) += 1;
    }
    counts
}
