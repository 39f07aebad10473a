//! Core data model.
//!
//! A pending work item moves through `Waiting -> Processing -> Finished`.
//! Pools report their occupancy through [`PoolSnapshot`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Work identity
// ---------------------------------------------------------------------------

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a pending work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkState {
    /// Queued, no worker has picked it up yet.
    Waiting,
    /// A worker is running the action.
    Processing,
    /// The action returned, failed, or panicked. Terminal.
    Finished,
}

impl WorkState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: WorkState) -> bool {
        use WorkState::*;
        matches!(
            (self, to),
            (Waiting, Processing)
                | (Processing, Finished)
                | (Waiting, Finished) // worker died before the action started
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkState::Finished)
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            WorkState::Waiting => 0,
            WorkState::Processing => 1,
            WorkState::Finished => 2,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkState::Waiting,
            1 => WorkState::Processing,
            _ => WorkState::Finished,
        }
    }
}

impl std::fmt::Display for WorkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkState::Waiting => "waiting",
            WorkState::Processing => "processing",
            WorkState::Finished => "finished",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Pool snapshot
// ---------------------------------------------------------------------------

/// Point-in-time view of one worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub kind: String,
    pub max_workers: usize,
    pub active_workers: usize,
    /// Items enqueued but not yet claimed by a worker.
    pub queued: usize,
    pub dedicated_thread: bool,
}
