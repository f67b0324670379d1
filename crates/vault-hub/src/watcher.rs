//! Filesystem change detector.
//!
//! A notify watcher on the vault root feeds raw event paths into a tokio
//! channel; paths are debounced per file and classified against ground
//! truth (filesystem presence vs. store membership) only when the window
//! closes, so a burst of saves collapses to one notice. Watching is
//! best-effort: any watcher failure logs, the store is reconciled from a
//! fresh scan, and the watch is re-established.

use crate::hub::HubState;
use notify::{Event, RecursiveMode, Watcher};
use std::collections::{BTreeSet, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vault_core::protocol::PushMessage;
use vault_core::{ChangeNotice, Stage, VaultError};

const FLUSH_POLL: Duration = Duration::from_millis(100);
const RESTART_DELAY: Duration = Duration::from_secs(5);

enum WatchSignal {
    Path(PathBuf),
    Lost(String),
}

/// Suppresses detector echoes of mutations performed through the API.
/// A mutation marks the paths it touches; raw watcher events for those
/// paths inside the window are dropped, so each API mutation yields
/// exactly one broadcast.
pub struct EchoGuard {
    window: Duration,
    inner: Mutex<HashMap<PathBuf, Instant>>,
}

impl EchoGuard {
    pub fn new(window: Duration) -> Self {
        EchoGuard {
            window,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn mark(&self, path: &Path) {
        let mut marked = self.inner.lock().expect("echo guard lock");
        marked.insert(path.to_path_buf(), Instant::now());
    }

    pub fn suppresses(&self, path: &Path) -> bool {
        let mut marked = self.inner.lock().expect("echo guard lock");
        let window = self.window;
        marked.retain(|_, at| at.elapsed() < window);
        marked.contains_key(path)
    }
}

/// Per-path debounce: a path becomes ready only once the window has
/// elapsed since its last raw event.
struct DebounceQueue {
    window: Duration,
    pending: HashMap<PathBuf, Instant>,
}

impl DebounceQueue {
    fn new(window: Duration) -> Self {
        DebounceQueue {
            window,
            pending: HashMap::new(),
        }
    }

    fn insert(&mut self, path: PathBuf, at: Instant) {
        self.pending.insert(path, at);
    }

    fn drain_ready(&mut self, now: Instant) -> Vec<PathBuf> {
        let window = self.window;
        let ready: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, at)| now.duration_since(**at) >= window)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &ready {
            self.pending.remove(path);
        }
        ready
    }
}

/// Maps a raw event path to `(stage, file name)` if it is an eligible
/// document directly inside a stage directory.
pub(crate) fn stage_for_path(
    vault: &Path,
    extension: &str,
    path: &Path,
) -> Option<(Stage, String)> {
    if path.extension().and_then(|ext| ext.to_str()) != Some(extension) {
        return None;
    }
    let name = path.file_name()?.to_str()?.to_string();
    let parent = path.parent()?;
    if parent.parent()? != vault {
        return None;
    }
    let dir = parent.file_name()?.to_str()?;
    let stage = Stage::ALL.into_iter().find(|stage| stage.dir_name() == dir)?;
    Some((stage, name))
}

/// List the eligible file names of one stage directory. A missing
/// directory is an empty stage, not an error.
pub(crate) async fn scan_stage(
    vault: &Path,
    stage: Stage,
    extension: &str,
) -> std::io::Result<BTreeSet<String>> {
    let dir = vault.join(stage.dir_name());
    let mut names = BTreeSet::new();
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(names),
        Err(err) => return Err(err),
    };
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(extension) {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
            names.insert(name.to_string());
        }
    }
    Ok(names)
}

/// Replace every stage's tracked names from a fresh directory listing.
pub(crate) async fn reconcile_all(hub: &HubState) {
    for stage in Stage::ALL {
        match scan_stage(&hub.config.vault, stage, &hub.config.extension).await {
            Ok(names) => hub.store.reconcile(stage, names).await,
            Err(err) => warn!(event = "scan_error", stage = %stage, error = %err),
        }
    }
}

/// Run the detector until process exit, re-establishing the watch after
/// any failure.
pub async fn run(hub: std::sync::Arc<HubState>) {
    let mut recovering = false;
    loop {
        if recovering {
            reconcile_all(&hub).await;
        }
        recovering = true;
        if let Err(err) = watch_session(&hub).await {
            warn!(event = "watch_lost", error = %err);
        }
        tokio::time::sleep(RESTART_DELAY).await;
    }
}

async fn watch_session(hub: &HubState) -> Result<(), VaultError> {
    let (tx, mut rx) = mpsc::channel::<WatchSignal>(256);
    let vault = hub.config.vault.clone();
    let extension = hub.config.extension.clone();

    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
        match result {
            Ok(event) => {
                for path in event.paths {
                    if stage_for_path(&vault, &extension, &path).is_some() {
                        let _ = tx.blocking_send(WatchSignal::Path(path));
                    }
                }
            }
            Err(err) => {
                let _ = tx.blocking_send(WatchSignal::Lost(err.to_string()));
            }
        }
    })
    .map_err(|err| VaultError::WatchLost(err.to_string()))?;
    watcher
        .watch(&hub.config.vault, RecursiveMode::Recursive)
        .map_err(|err| VaultError::WatchLost(err.to_string()))?;
    info!(event = "watch_started", vault = %hub.config.vault.display());

    let mut pending = DebounceQueue::new(hub.config.debounce);
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(WatchSignal::Path(path)) => pending.insert(path, Instant::now()),
                Some(WatchSignal::Lost(reason)) => return Err(VaultError::WatchLost(reason)),
                None => return Err(VaultError::WatchLost("event channel closed".to_string())),
            },
            _ = tokio::time::sleep(FLUSH_POLL) => {
                for path in pending.drain_ready(Instant::now()) {
                    flush_path(hub, path).await;
                }
            }
        }
    }
}

/// Classify one debounced path against ground truth and propagate the
/// resulting notice.
async fn flush_path(hub: &HubState, path: PathBuf) {
    let Some((stage, name)) = stage_for_path(&hub.config.vault, &hub.config.extension, &path)
    else {
        return;
    };
    if hub.echo.suppresses(&path) {
        debug!(event = "echo_suppressed", path = %path.display());
        return;
    }
    let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
    let tracked = hub.store.tracks(stage, &name).await;
    let notice = match (exists, tracked) {
        (true, false) => ChangeNotice::created(stage, name),
        (true, true) => ChangeNotice::modified(stage, name),
        (false, true) => ChangeNotice::deleted(stage, name),
        (false, false) => return,
    };
    info!(event = "detector_notice", stage = %stage, path = %path.display());
    hub.store.apply(&notice).await;
    hub.broadcast(&PushMessage::detector_event(notice)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Client;
    use crate::Config;
    use axum::extract::ws::Message;
    use std::sync::Arc;
    use tempfile::TempDir;
    use vault_core::ActivityKind;

    async fn hub_with_observer(
        vault: &TempDir,
    ) -> (Arc<HubState>, tokio::sync::mpsc::Receiver<Message>) {
        let hub = Arc::new(HubState::new(Config::for_tests(vault.path())));
        let (tx, rx) = tokio::sync::mpsc::channel(32);
        hub.register_client(Arc::new(Client::new("observer".into(), tx)))
            .await;
        (hub, rx)
    }

    fn message_type(msg: &Message) -> String {
        let Message::Text(text) = msg else {
            panic!("expected text frame");
        };
        let value: serde_json::Value = serde_json::from_str(text).expect("json");
        value["type"].as_str().expect("type tag").to_string()
    }

    #[tokio::test]
    async fn flush_classifies_against_ground_truth() {
        let vault = TempDir::new().expect("tempdir");
        std::fs::create_dir_all(vault.path().join("Inbox")).expect("mkdir");
        let (hub, mut rx) = hub_with_observer(&vault).await;
        let path = vault.path().join("Inbox/report.md");

        // Appears on disk, untracked: created.
        std::fs::write(&path, "x").expect("write");
        flush_path(&hub, path.clone()).await;
        assert!(hub.store.tracks(Stage::Inbox, "report.md").await);
        assert_eq!(message_type(&rx.try_recv().expect("broadcast")), "file_change");

        // Still on disk, tracked: modified.
        flush_path(&hub, path.clone()).await;
        let snapshot = hub.store.snapshot().await;
        assert_eq!(snapshot.count(Stage::Inbox), 1);
        assert_eq!(
            snapshot.recent_activity[0].kind,
            ActivityKind::FileModified
        );

        // Gone from disk, tracked: deleted.
        std::fs::remove_file(&path).expect("remove");
        flush_path(&hub, path.clone()).await;
        assert_eq!(hub.store.snapshot().await.count(Stage::Inbox), 0);

        // Gone and untracked: nothing emitted.
        rx.try_recv().expect("modified broadcast");
        rx.try_recv().expect("deleted broadcast");
        flush_path(&hub, path).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn flush_drops_echoes_of_api_mutations() {
        let vault = TempDir::new().expect("tempdir");
        std::fs::create_dir_all(vault.path().join("Inbox")).expect("mkdir");
        let (hub, mut rx) = hub_with_observer(&vault).await;
        let path = vault.path().join("Inbox/a.md");

        std::fs::write(&path, "x").expect("write");
        hub.echo.mark(&path);
        flush_path(&hub, path).await;
        // The API already announced this change; the detector stays quiet.
        assert!(rx.try_recv().is_err());
        assert!(!hub.store.tracks(Stage::Inbox, "a.md").await);
    }

    #[test]
    fn burst_for_one_path_collapses_to_a_single_flush() {
        let window = Duration::from_millis(500);
        let mut queue = DebounceQueue::new(window);
        let start = Instant::now();
        let path = PathBuf::from("/vault/Inbox/report.md");

        // Three rapid saves inside the window.
        queue.insert(path.clone(), start);
        queue.insert(path.clone(), start + Duration::from_millis(50));
        queue.insert(path.clone(), start + Duration::from_millis(120));

        assert!(queue
            .drain_ready(start + Duration::from_millis(300))
            .is_empty());
        let ready = queue.drain_ready(start + Duration::from_millis(700));
        assert_eq!(ready, vec![path]);
        // Nothing left once flushed.
        assert!(queue
            .drain_ready(start + Duration::from_secs(5))
            .is_empty());
    }

    #[test]
    fn debounce_tracks_paths_independently() {
        let mut queue = DebounceQueue::new(Duration::from_millis(500));
        let start = Instant::now();
        queue.insert(PathBuf::from("/vault/Inbox/a.md"), start);
        queue.insert(
            PathBuf::from("/vault/Inbox/b.md"),
            start + Duration::from_millis(400),
        );

        let ready = queue.drain_ready(start + Duration::from_millis(600));
        assert_eq!(ready, vec![PathBuf::from("/vault/Inbox/a.md")]);
    }

    #[test]
    fn stage_for_path_accepts_only_stage_documents() {
        let vault = Path::new("/vault");
        assert_eq!(
            stage_for_path(vault, "md", Path::new("/vault/Inbox/a.md")),
            Some((Stage::Inbox, "a.md".to_string()))
        );
        assert_eq!(
            stage_for_path(vault, "md", Path::new("/vault/Needs_Action/todo.md")),
            Some((Stage::NeedsAction, "todo.md".to_string()))
        );
        // Wrong extension.
        assert_eq!(
            stage_for_path(vault, "md", Path::new("/vault/Inbox/a.log")),
            None
        );
        // Not a stage directory.
        assert_eq!(
            stage_for_path(vault, "md", Path::new("/vault/Drafts/a.md")),
            None
        );
        // Nested below a stage.
        assert_eq!(
            stage_for_path(vault, "md", Path::new("/vault/Inbox/sub/a.md")),
            None
        );
        // Outside the vault entirely.
        assert_eq!(
            stage_for_path(vault, "md", Path::new("/elsewhere/Inbox/a.md")),
            None
        );
    }

    #[test]
    fn echo_guard_suppresses_only_inside_the_window() {
        let guard = EchoGuard::new(Duration::from_millis(0));
        let path = Path::new("/vault/Inbox/a.md");
        guard.mark(path);
        // Zero window: already expired.
        assert!(!guard.suppresses(path));

        let guard = EchoGuard::new(Duration::from_secs(60));
        guard.mark(path);
        assert!(guard.suppresses(path));
        assert!(!guard.suppresses(Path::new("/vault/Inbox/other.md")));
    }
}
