//! Authoritative in-memory pipeline state.
//!
//! The store tracks the file names present in every stage (counts are
//! derived) plus the bounded recent-activity feed. It mutates only
//! through [`PipelineStore::apply`] and [`PipelineStore::reconcile`];
//! both take the single write lock, so applies are serialized in arrival
//! order and a `Moved` notice updates source and destination in one
//! critical section.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tokio::sync::RwLock;
use tracing::warn;
use vault_core::{ActivityEntry, ChangeNotice, PipelineSnapshot, Stage};

pub const DEFAULT_ACTIVITY_CAP: usize = 10;

pub struct PipelineStore {
    activity_cap: usize,
    inner: RwLock<StoreInner>,
}

struct StoreInner {
    files: BTreeMap<Stage, BTreeSet<String>>,
    activity: VecDeque<ActivityEntry>,
}

impl StoreInner {
    fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            stage_counts: self
                .files
                .iter()
                .map(|(stage, names)| (*stage, names.len()))
                .collect(),
            recent_activity: self.activity.iter().cloned().collect(),
        }
    }

    fn record(&mut self, entry: ActivityEntry, cap: usize) {
        self.activity.push_front(entry);
        self.activity.truncate(cap);
    }
}

impl PipelineStore {
    pub fn new(activity_cap: usize) -> Self {
        PipelineStore {
            activity_cap,
            inner: RwLock::new(StoreInner {
                files: Stage::ALL
                    .iter()
                    .map(|stage| (*stage, BTreeSet::new()))
                    .collect(),
                activity: VecDeque::new(),
            }),
        }
    }

    /// Apply one change notice and return the resulting snapshot.
    pub async fn apply(&self, notice: &ChangeNotice) -> PipelineSnapshot {
        let mut inner = self.inner.write().await;
        match notice {
            ChangeNotice::Created { stage, name, .. }
            | ChangeNotice::Modified { stage, name, .. } => {
                if let Some(names) = inner.files.get_mut(stage) {
                    names.insert(name.clone());
                }
            }
            ChangeNotice::Deleted { stage, name, .. } => {
                let removed = inner
                    .files
                    .get_mut(stage)
                    .map(|names| names.remove(name))
                    .unwrap_or(false);
                if !removed {
                    warn!(event = "delete_untracked", stage = %stage, name = %name);
                }
            }
            ChangeNotice::Moved {
                from, to, name, ..
            } => {
                let removed = inner
                    .files
                    .get_mut(from)
                    .map(|names| names.remove(name))
                    .unwrap_or(false);
                if !removed {
                    warn!(event = "move_untracked", from = %from, name = %name);
                }
                if let Some(names) = inner.files.get_mut(to) {
                    names.insert(name.clone());
                }
            }
        }
        let entry = ActivityEntry::from_notice(notice);
        let cap = self.activity_cap;
        inner.record(entry, cap);
        inner.snapshot()
    }

    pub async fn snapshot(&self) -> PipelineSnapshot {
        self.inner.read().await.snapshot()
    }

    /// Whether the store currently tracks `(stage, name)`.
    pub async fn tracks(&self, stage: Stage, name: &str) -> bool {
        self.inner
            .read()
            .await
            .files
            .get(&stage)
            .map(|names| names.contains(name))
            .unwrap_or(false)
    }

    /// Replace one stage's name set from a fresh directory listing.
    /// Used to seed the store at startup and to recover after a failed
    /// move or a re-established watch. Records no activity.
    pub async fn reconcile(&self, stage: Stage, names: BTreeSet<String>) {
        let mut inner = self.inner.write().await;
        inner.files.insert(stage, names);
    }
}
