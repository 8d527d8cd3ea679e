//! Reconciliation states and the structured outcomes of ticks and drains.

use serde::{Deserialize, Serialize};

use crate::types::BlockNumber;

/// The stage a reconciliation tick is in.
///
/// A tick walks `Idle → Fetching → Validating → (Persisting | Rewinding) →
/// Notifying → Advancing → Idle`; any stage may drop to `Aborted`, and only a
/// blown rewind bound or unexplainable data reaches `Fatal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileState {
    Idle,
    Fetching,
    Validating,
    Persisting,
    Rewinding,
    Notifying,
    Advancing,
    Aborted,
    Fatal,
}

impl std::fmt::Display for ReconcileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Fetching => write!(f, "fetching"),
            Self::Validating => write!(f, "validating"),
            Self::Persisting => write!(f, "persisting"),
            Self::Rewinding => write!(f, "rewinding"),
            Self::Notifying => write!(f, "notifying"),
            Self::Advancing => write!(f, "advancing"),
            Self::Aborted => write!(f, "aborted"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

// ─── TickOutcome ──────────────────────────────────────────────────────────────

/// What a single reconciliation tick did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    /// A new block was persisted, announced and the pointer moved forward.
    Advanced {
        block_number: BlockNumber,
        block_hash: String,
    },
    /// A reorg was detected and the pointer moved back one block.
    Rewound {
        retracted_number: BlockNumber,
        retracted_hash: String,
        block_number: BlockNumber,
        block_hash: String,
    },
    /// The node has no block past the pointer yet.
    UpToDate {
        current_head: BlockNumber,
        next_fetch: BlockNumber,
    },
    /// A recoverable condition; the pointer was not moved by this stage.
    Aborted {
        stage: ReconcileState,
        reason: String,
    },
    /// The engine refuses to continue until an operator intervenes.
    Fatal { reason: String },
}

impl TickOutcome {
    pub fn aborted(stage: ReconcileState, reason: impl Into<String>) -> Self {
        Self::Aborted {
            stage,
            reason: reason.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }

    /// `true` if the pointer moved (either direction).
    pub fn made_progress(&self) -> bool {
        matches!(self, Self::Advanced { .. } | Self::Rewound { .. })
    }
}

impl std::fmt::Display for TickOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Advanced {
                block_number,
                block_hash,
            } => write!(f, "advanced to #{block_number} ({block_hash})"),
            Self::Rewound {
                retracted_number,
                block_number,
                ..
            } => write!(f, "rewound #{retracted_number} -> #{block_number}"),
            Self::UpToDate {
                current_head,
                next_fetch,
            } => write!(f, "up to date (head #{current_head}, next #{next_fetch})"),
            Self::Aborted { stage, reason } => write!(f, "aborted while {stage}: {reason}"),
            Self::Fatal { reason } => write!(f, "fatal: {reason}"),
        }
    }
}

// ─── DrainReport ──────────────────────────────────────────────────────────────

/// Why a drain run stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DrainStatus {
    /// The source queue had nothing left to deliver.
    Empty,
    /// The remaining time budget fell below the configured minimum.
    BudgetExhausted,
    /// `max_messages` were processed.
    LimitReached,
    /// A message could not be processed, or the queue could not be read
    /// (`message_id = None`). Unacknowledged messages are redelivered.
    Failed {
        message_id: Option<String>,
        reason: String,
    },
}

/// Structured completion status of one drain run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Pointer messages fully published and acknowledged.
    pub processed: usize,
    pub logs_published: usize,
    pub transactions_published: usize,
    pub status: DrainStatus,
}

impl DrainReport {
    pub fn new(status: DrainStatus) -> Self {
        Self {
            processed: 0,
            logs_published: 0,
            transactions_published: 0,
            status,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, DrainStatus::Failed { .. })
    }
}
