use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

pub mod protocol;

/// One step of the document pipeline, backed by a directory under the
/// vault root. The set is closed: a request naming anything else fails
/// with [`VaultError::UnknownStage`] at the parse boundary, and no
/// mutation can add a stage at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    Inbox,
    #[serde(rename = "Needs_Action")]
    NeedsAction,
    #[serde(rename = "Pending_Approval")]
    PendingApproval,
    Approved,
    Done,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Inbox,
        Stage::NeedsAction,
        Stage::PendingApproval,
        Stage::Approved,
        Stage::Done,
    ];

    /// Directory name under the vault root.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Stage::Inbox => "Inbox",
            Stage::NeedsAction => "Needs_Action",
            Stage::PendingApproval => "Pending_Approval",
            Stage::Approved => "Approved",
            Stage::Done => "Done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl FromStr for Stage {
    type Err = VaultError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "inbox" => Ok(Stage::Inbox),
            "needs_action" | "needs-action" => Ok(Stage::NeedsAction),
            "pending_approval" | "pending-approval" => Ok(Stage::PendingApproval),
            "approved" => Ok(Stage::Approved),
            "done" => Ok(Stage::Done),
            _ => Err(VaultError::UnknownStage(input.to_string())),
        }
    }
}

/// Classification tag derived from the filename on every read. Never
/// stored; recomputed so a rename is enough to reclassify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Email,
    Whatsapp,
    Linkedin,
    Twitter,
    Approval,
    Generic,
}

impl FileKind {
    pub fn classify(name: &str) -> Self {
        let lower = name.to_lowercase();
        if lower.contains("email") {
            FileKind::Email
        } else if lower.contains("whatsapp") {
            FileKind::Whatsapp
        } else if lower.contains("linkedin") {
            FileKind::Linkedin
        } else if lower.contains("twitter") {
            FileKind::Twitter
        } else if lower.contains("approval") {
            FileKind::Approval
        } else {
            FileKind::Generic
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Email => "email",
            FileKind::Whatsapp => "whatsapp",
            FileKind::Linkedin => "linkedin",
            FileKind::Twitter => "twitter",
            FileKind::Approval => "approval",
            FileKind::Generic => "generic",
        }
    }
}

/// Metadata for one tracked document. Identity is `(stage, name)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub name: String,
    pub stage: Stage,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub kind: FileKind,
}

/// One normalized state transition. Immutable once emitted; produced by
/// both the filesystem detector and the mutation operations, and the only
/// input the state store accepts.
///
/// A move is a single notice. Emitting it as a deleted/created pair would
/// let a viewer observe a transient state where the file is in neither
/// stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChangeNotice {
    Created {
        stage: Stage,
        name: String,
        timestamp: DateTime<Utc>,
    },
    Modified {
        stage: Stage,
        name: String,
        timestamp: DateTime<Utc>,
    },
    Deleted {
        stage: Stage,
        name: String,
        timestamp: DateTime<Utc>,
    },
    Moved {
        from: Stage,
        to: Stage,
        name: String,
        timestamp: DateTime<Utc>,
    },
}

impl ChangeNotice {
    pub fn created(stage: Stage, name: impl Into<String>) -> Self {
        ChangeNotice::Created {
            stage,
            name: name.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn modified(stage: Stage, name: impl Into<String>) -> Self {
        ChangeNotice::Modified {
            stage,
            name: name.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn deleted(stage: Stage, name: impl Into<String>) -> Self {
        ChangeNotice::Deleted {
            stage,
            name: name.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn moved(from: Stage, to: Stage, name: impl Into<String>) -> Self {
        ChangeNotice::Moved {
            from,
            to,
            name: name.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ChangeNotice::Created { name, .. }
            | ChangeNotice::Modified { name, .. }
            | ChangeNotice::Deleted { name, .. }
            | ChangeNotice::Moved { name, .. } => name,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ChangeNotice::Created { timestamp, .. }
            | ChangeNotice::Modified { timestamp, .. }
            | ChangeNotice::Deleted { timestamp, .. }
            | ChangeNotice::Moved { timestamp, .. } => *timestamp,
        }
    }

    fn activity_kind(&self) -> ActivityKind {
        match self {
            ChangeNotice::Created { .. } => ActivityKind::FileCreated,
            ChangeNotice::Modified { .. } => ActivityKind::FileModified,
            ChangeNotice::Deleted { .. } => ActivityKind::FileDeleted,
            ChangeNotice::Moved { .. } => ActivityKind::FileMoved,
        }
    }

    fn describe(&self) -> String {
        match self {
            ChangeNotice::Created { stage, name, .. } => {
                format!("{name} created in {stage}")
            }
            ChangeNotice::Modified { stage, name, .. } => {
                format!("{name} modified in {stage}")
            }
            ChangeNotice::Deleted { stage, name, .. } => {
                format!("{name} deleted from {stage}")
            }
            ChangeNotice::Moved {
                from, to, name, ..
            } => format!("{name} moved from {from} to {to}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    FileCreated,
    FileModified,
    FileDeleted,
    FileMoved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Completed,
    Pending,
    Failed,
}

/// One line of the bounded recent-activity feed. Lifecycle is bound to
/// process uptime; entries are never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: Uuid,
    pub kind: ActivityKind,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub status: ActivityStatus,
}

impl ActivityEntry {
    pub fn from_notice(notice: &ChangeNotice) -> Self {
        ActivityEntry {
            id: Uuid::new_v4(),
            kind: notice.activity_kind(),
            description: notice.describe(),
            timestamp: notice.timestamp(),
            status: ActivityStatus::Completed,
        }
    }
}

/// Full current view of the pipeline: per-stage counts plus the bounded
/// activity feed, most recent first. Produced only by the state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSnapshot {
    pub stage_counts: BTreeMap<Stage, usize>,
    pub recent_activity: Vec<ActivityEntry>,
}

impl PipelineSnapshot {
    pub fn empty() -> Self {
        PipelineSnapshot {
            stage_counts: Stage::ALL.iter().map(|stage| (*stage, 0)).collect(),
            recent_activity: Vec::new(),
        }
    }

    pub fn count(&self, stage: Stage) -> usize {
        self.stage_counts.get(&stage).copied().unwrap_or(0)
    }
}

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("unknown stage: {0}")]
    UnknownStage(String),
    #[error("invalid file name: {0}")]
    InvalidName(String),
    #[error("file not found: {stage}/{name}")]
    NotFound { stage: Stage, name: String },
    #[error("io failure during {op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("watch lost: {0}")]
    WatchLost(String),
}
