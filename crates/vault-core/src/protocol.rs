//! Push-channel messages sent to viewer sessions.
//!
//! Four categories stay distinguishable on the wire: the initial
//! snapshot, the periodic refresh, detector-observed changes, and
//! API-observed changes.

use crate::{ChangeNotice, PipelineSnapshot, Stage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PushMessage {
    /// First message of every viewer session.
    #[serde(rename = "initial_state")]
    InitialState { data: PipelineSnapshot },
    /// Periodic full refresh, independent of change delivery.
    #[serde(rename = "system_update")]
    SystemUpdate { data: PipelineSnapshot },
    /// A change observed by the filesystem detector.
    #[serde(rename = "file_change")]
    FileChange { data: ChangeNotice },
    /// A change performed through the mutation API.
    #[serde(rename = "file:created")]
    FileCreated {
        payload: FileEventPayload,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "file:deleted")]
    FileDeleted {
        payload: FileEventPayload,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "file:moved")]
    FileMoved {
        payload: MoveEventPayload,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEventPayload {
    pub folder: Stage,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveEventPayload {
    pub from: Stage,
    pub to: Stage,
    pub filename: String,
}

impl PushMessage {
    /// Wire message for a change performed through the mutation API.
    /// `Modified` maps to `file:created`: an overwriting upload is
    /// announced the same way as a fresh one.
    pub fn api_event(notice: &ChangeNotice) -> PushMessage {
        match notice {
            ChangeNotice::Created { stage, name, timestamp }
            | ChangeNotice::Modified { stage, name, timestamp } => PushMessage::FileCreated {
                payload: FileEventPayload {
                    folder: *stage,
                    filename: name.clone(),
                },
                timestamp: *timestamp,
            },
            ChangeNotice::Deleted { stage, name, timestamp } => PushMessage::FileDeleted {
                payload: FileEventPayload {
                    folder: *stage,
                    filename: name.clone(),
                },
                timestamp: *timestamp,
            },
            ChangeNotice::Moved { from, to, name, timestamp } => PushMessage::FileMoved {
                payload: MoveEventPayload {
                    from: *from,
                    to: *to,
                    filename: name.clone(),
                },
                timestamp: *timestamp,
            },
        }
    }

    /// Wire message for a change observed by the detector.
    pub fn detector_event(notice: ChangeNotice) -> PushMessage {
        PushMessage::FileChange { data: notice }
    }
}
