//! Mutation and query surface.
//!
//! Every mutating operation runs filesystem op → store apply →
//! broadcast → response, in that order, so viewers never see a
//! broadcast for a state the store does not yet reflect. A failed
//! mutation produces no broadcast and leaves the store reconciled with
//! whatever the filesystem actually holds.

use crate::hub::HubState;
use crate::watcher::scan_stage;
use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use vault_core::protocol::PushMessage;
use vault_core::{ChangeNotice, FileKind, FileRecord, Stage, VaultError};

pub struct ApiError(VaultError);

impl From<VaultError> for ApiError {
    fn from(err: VaultError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            VaultError::UnknownStage(_) | VaultError::InvalidName(_) => StatusCode::BAD_REQUEST,
            VaultError::NotFound { .. } => StatusCode::NOT_FOUND,
            VaultError::Io { .. } | VaultError::WatchLost(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({ "success": false, "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveRequest {
    pub source_folder: String,
    pub filename: String,
    pub target_folder: String,
}

/// Retry a filesystem op once for transient failures. A missing target
/// is a client error, never retried.
async fn with_retry<T, F, Fut>(op: &'static str, mut attempt: F) -> std::io::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::io::Result<T>>,
{
    match attempt().await {
        Ok(value) => Ok(value),
        Err(err) if err.kind() == ErrorKind::NotFound => Err(err),
        Err(err) => {
            warn!(event = "io_retry", op = op, error = %err);
            attempt().await
        }
    }
}

fn checked_name(name: &str) -> Result<&str, VaultError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
    {
        return Err(VaultError::InvalidName(name.to_string()));
    }
    Ok(name)
}

async fn file_record(stage: Stage, name: &str, path: &Path) -> std::io::Result<FileRecord> {
    let meta = tokio::fs::metadata(path).await?;
    let modified = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    // Birth time is not reported on every platform.
    let created = meta.created().map(DateTime::<Utc>::from).unwrap_or(modified);
    Ok(FileRecord {
        name: name.to_string(),
        stage,
        size_bytes: meta.len(),
        created_at: created,
        modified_at: modified,
        kind: FileKind::classify(name),
    })
}

impl HubState {
    fn stage_dir(&self, stage: Stage) -> PathBuf {
        self.config.vault.join(stage.dir_name())
    }

    fn file_path(&self, stage: Stage, name: &str) -> PathBuf {
        self.stage_dir(stage).join(name)
    }

    pub async fn list_stage(&self, stage: Stage) -> Result<Vec<FileRecord>, VaultError> {
        let names = scan_stage(&self.config.vault, stage, &self.config.extension)
            .await
            .map_err(|source| VaultError::Io { op: "list", source })?;
        let mut records = Vec::with_capacity(names.len());
        for name in names {
            let path = self.file_path(stage, &name);
            match file_record(stage, &name, &path).await {
                Ok(record) => records.push(record),
                // Deleted between listing and stat.
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(source) => return Err(VaultError::Io { op: "list", source }),
            }
        }
        Ok(records)
    }

    pub async fn read_file(&self, stage: Stage, name: &str) -> Result<String, VaultError> {
        let name = checked_name(name)?;
        let path = self.file_path(stage, name);
        with_retry("read", || tokio::fs::read_to_string(&path))
            .await
            .map_err(|source| match source.kind() {
                ErrorKind::NotFound => VaultError::NotFound {
                    stage,
                    name: name.to_string(),
                },
                _ => VaultError::Io { op: "read", source },
            })
    }

    /// Write (or overwrite) a document and announce it. Overwrites are
    /// allowed and announced the same way as fresh uploads.
    pub async fn create_file(
        &self,
        stage: Stage,
        name: &str,
        content: &str,
    ) -> Result<FileRecord, VaultError> {
        let name = checked_name(name)?;
        let _guard = self.mutations.lock().await;
        let dir = self.stage_dir(stage);
        if let Err(source) = with_retry("mkdir", || tokio::fs::create_dir_all(&dir)).await {
            self.reconcile_stage(stage).await;
            return Err(VaultError::Io { op: "mkdir", source });
        }
        let path = self.file_path(stage, name);
        if let Err(source) = with_retry("write", || tokio::fs::write(&path, content.as_bytes())).await
        {
            // A failed write can still leave a partial file behind;
            // trust the directory listing, not the intent.
            self.reconcile_stage(stage).await;
            return Err(VaultError::Io { op: "write", source });
        }
        // Marked only once the write landed, so a failed attempt never
        // suppresses the detector's corrective event.
        self.echo.mark(&path);

        let notice = ChangeNotice::created(stage, name);
        self.store.apply(&notice).await;
        self.broadcast(&PushMessage::api_event(&notice)).await;
        info!(event = "file_created", stage = %stage, name = name);

        file_record(stage, name, &path)
            .await
            .map_err(|source| VaultError::Io { op: "stat", source })
    }

    pub async fn delete_file(&self, stage: Stage, name: &str) -> Result<(), VaultError> {
        let name = checked_name(name)?;
        let _guard = self.mutations.lock().await;
        let path = self.file_path(stage, name);
        if let Err(source) = with_retry("delete", || tokio::fs::remove_file(&path)).await {
            if source.kind() == ErrorKind::NotFound {
                return Err(VaultError::NotFound {
                    stage,
                    name: name.to_string(),
                });
            }
            self.reconcile_stage(stage).await;
            return Err(VaultError::Io {
                op: "delete",
                source,
            });
        }
        self.echo.mark(&path);

        let notice = ChangeNotice::deleted(stage, name);
        self.store.apply(&notice).await;
        self.broadcast(&PushMessage::api_event(&notice)).await;
        info!(event = "file_deleted", stage = %stage, name = name);
        Ok(())
    }

    /// Move a document between stages as one transition. On success
    /// exactly one `moved` notice is emitted; on failure nothing is
    /// broadcast and both stages are re-listed from disk so the store
    /// never holds a guessed state.
    pub async fn move_file(
        &self,
        from: Stage,
        to: Stage,
        name: &str,
    ) -> Result<(), VaultError> {
        let name = checked_name(name)?;
        let _guard = self.mutations.lock().await;
        let source = self.file_path(from, name);
        let target_dir = self.stage_dir(to);
        let target = target_dir.join(name);
        if let Err(source) = with_retry("mkdir", || tokio::fs::create_dir_all(&target_dir)).await {
            self.reconcile_pair(from, to).await;
            return Err(VaultError::Io { op: "mkdir", source });
        }

        if let Err(err) = with_retry("move", || tokio::fs::rename(&source, &target)).await {
            if err.kind() == ErrorKind::NotFound {
                return Err(VaultError::NotFound {
                    stage: from,
                    name: name.to_string(),
                });
            }
            warn!(event = "move_failed", from = %from, to = %to, name = name, error = %err);
            self.reconcile_pair(from, to).await;
            return Err(VaultError::Io {
                op: "move",
                source: err,
            });
        }

        self.echo.mark(&source);
        self.echo.mark(&target);

        let notice = ChangeNotice::moved(from, to, name);
        self.store.apply(&notice).await;
        self.broadcast(&PushMessage::api_event(&notice)).await;
        info!(event = "file_moved", from = %from, to = %to, name = name);
        Ok(())
    }

    /// Re-list one stage from disk after a failed mutation, so the
    /// store reflects whatever the filesystem actually ended up with.
    async fn reconcile_stage(&self, stage: Stage) {
        match scan_stage(&self.config.vault, stage, &self.config.extension).await {
            Ok(names) => self.store.reconcile(stage, names).await,
            Err(err) => warn!(event = "scan_error", stage = %stage, error = %err),
        }
    }

    async fn reconcile_pair(&self, first: Stage, second: Stage) {
        self.reconcile_stage(first).await;
        self.reconcile_stage(second).await;
    }
}

pub async fn health() -> Json<Value> {
    Json(json!({ "success": true, "status": "healthy" }))
}

pub async fn status(State(hub): State<Arc<HubState>>) -> Json<Value> {
    let snapshot = hub.store.snapshot().await;
    Json(json!({ "success": true, "data": snapshot }))
}

pub async fn folders(State(hub): State<Arc<HubState>>) -> Json<Value> {
    let snapshot = hub.store.snapshot().await;
    let data: Vec<Value> = Stage::ALL
        .into_iter()
        .map(|stage| json!({ "name": stage.dir_name(), "count": snapshot.count(stage) }))
        .collect();
    Json(json!({ "success": true, "data": data }))
}

pub async fn list_files(
    State(hub): State<Arc<HubState>>,
    AxumPath(folder): AxumPath<String>,
) -> Result<Json<Value>, ApiError> {
    let stage: Stage = folder.parse()?;
    let records = hub.list_stage(stage).await?;
    Ok(Json(json!({ "success": true, "data": records })))
}

pub async fn read_file(
    State(hub): State<Arc<HubState>>,
    AxumPath((folder, filename)): AxumPath<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let stage: Stage = folder.parse()?;
    let content = hub.read_file(stage, &filename).await?;
    Ok(Json(json!({ "success": true, "data": { "content": content } })))
}

pub async fn upload_file(
    State(hub): State<Arc<HubState>>,
    AxumPath(folder): AxumPath<String>,
    Json(request): Json<UploadRequest>,
) -> Result<Json<Value>, ApiError> {
    let stage: Stage = folder.parse()?;
    let record = hub.create_file(stage, &request.name, &request.content).await?;
    Ok(Json(json!({ "success": true, "data": record })))
}

pub async fn delete_file(
    State(hub): State<Arc<HubState>>,
    AxumPath((folder, filename)): AxumPath<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let stage: Stage = folder.parse()?;
    hub.delete_file(stage, &filename).await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn move_file(
    State(hub): State<Arc<HubState>>,
    Json(request): Json<MoveRequest>,
) -> Result<Json<Value>, ApiError> {
    let from: Stage = request.source_folder.parse()?;
    let to: Stage = request.target_folder.parse()?;
    hub.move_file(from, to, &request.filename).await?;
    Ok(Json(json!({ "success": true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Client;
    use crate::Config;
    use axum::extract::ws::Message;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn test_hub(vault: &TempDir) -> Arc<HubState> {
        Arc::new(HubState::new(Config::for_tests(vault.path())))
    }

    async fn observer(hub: &Arc<HubState>) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(32);
        hub.register_client(Arc::new(Client::new("observer".into(), tx)))
            .await;
        rx
    }

    fn message_type(msg: &Message) -> String {
        let Message::Text(text) = msg else {
            panic!("expected text frame");
        };
        let value: Value = serde_json::from_str(text).expect("json");
        value["type"].as_str().expect("type tag").to_string()
    }

    #[tokio::test]
    async fn create_then_move_between_stages() {
        let vault = TempDir::new().expect("tempdir");
        let hub = test_hub(&vault);
        let mut rx = observer(&hub).await;

        let record = hub
            .create_file(Stage::Inbox, "a.md", "x")
            .await
            .expect("create");
        assert_eq!(record.size_bytes, 1);
        let snapshot = hub.store.snapshot().await;
        assert_eq!(snapshot.count(Stage::Inbox), 1);
        assert_eq!(snapshot.count(Stage::Approved), 0);

        hub.move_file(Stage::Inbox, Stage::Approved, "a.md")
            .await
            .expect("move");
        let snapshot = hub.store.snapshot().await;
        assert_eq!(snapshot.count(Stage::Inbox), 0);
        assert_eq!(snapshot.count(Stage::Approved), 1);

        // The file physically moved.
        assert!(vault.path().join("Approved/a.md").exists());
        assert!(!vault.path().join("Inbox/a.md").exists());

        // One created, then exactly one moved. No deleted/created pair
        // leaks from the move.
        let first = rx.try_recv().expect("created broadcast");
        assert_eq!(message_type(&first), "file:created");
        let second = rx.try_recv().expect("moved broadcast");
        assert_eq!(message_type(&second), "file:moved");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn delete_of_missing_file_changes_nothing() {
        let vault = TempDir::new().expect("tempdir");
        let hub = test_hub(&vault);
        let mut rx = observer(&hub).await;
        let before = hub.store.snapshot().await;

        let err = hub
            .delete_file(Stage::Inbox, "missing.md")
            .await
            .expect_err("must fail");
        assert!(matches!(err, VaultError::NotFound { .. }));

        let after = hub.store.snapshot().await;
        assert_eq!(after, before);
        assert!(after.recent_activity.is_empty());
        // A failed mutation never broadcasts.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn move_of_missing_file_changes_nothing() {
        let vault = TempDir::new().expect("tempdir");
        let hub = test_hub(&vault);
        let mut rx = observer(&hub).await;

        let err = hub
            .move_file(Stage::Inbox, Stage::Done, "ghost.md")
            .await
            .expect_err("must fail");
        assert!(matches!(err, VaultError::NotFound { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn listing_an_absent_stage_directory_is_empty() {
        let vault = TempDir::new().expect("tempdir");
        let hub = test_hub(&vault);
        let records = hub.list_stage(Stage::PendingApproval).await.expect("list");
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn listing_skips_ineligible_files() {
        let vault = TempDir::new().expect("tempdir");
        let hub = test_hub(&vault);
        hub.create_file(Stage::Inbox, "a.md", "x").await.expect("create");
        std::fs::write(vault.path().join("Inbox/notes.txt"), "ignored").expect("write");

        let records = hub.list_stage(Stage::Inbox).await.expect("list");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "a.md");
        assert_eq!(records[0].kind, FileKind::Generic);
    }

    #[tokio::test]
    async fn read_returns_content_and_missing_is_not_found() {
        let vault = TempDir::new().expect("tempdir");
        let hub = test_hub(&vault);
        hub.create_file(Stage::Done, "email_recap.md", "body")
            .await
            .expect("create");

        let content = hub.read_file(Stage::Done, "email_recap.md").await.expect("read");
        assert_eq!(content, "body");

        let err = hub
            .read_file(Stage::Done, "absent.md")
            .await
            .expect_err("must fail");
        assert!(matches!(err, VaultError::NotFound { .. }));
    }

    #[tokio::test]
    async fn overwriting_upload_is_allowed_and_keeps_one_record() {
        let vault = TempDir::new().expect("tempdir");
        let hub = test_hub(&vault);
        hub.create_file(Stage::Inbox, "a.md", "first").await.expect("create");
        hub.create_file(Stage::Inbox, "a.md", "second").await.expect("overwrite");

        let snapshot = hub.store.snapshot().await;
        assert_eq!(snapshot.count(Stage::Inbox), 1);
        let content = hub.read_file(Stage::Inbox, "a.md").await.expect("read");
        assert_eq!(content, "second");
    }

    #[tokio::test]
    async fn traversal_names_are_rejected() {
        let vault = TempDir::new().expect("tempdir");
        let hub = test_hub(&vault);
        for name in ["../escape.md", "a/b.md", "", ".."] {
            let err = hub
                .create_file(Stage::Inbox, name, "x")
                .await
                .expect_err("must reject");
            assert!(matches!(err, VaultError::InvalidName(_)));
        }
    }

    #[tokio::test]
    async fn failed_delete_reconciles_the_stage_from_disk() {
        let vault = TempDir::new().expect("tempdir");
        let hub = test_hub(&vault);
        // Drift the store away from disk, then force the delete to fail
        // with a directory squatting on the target path.
        hub.store
            .apply(&ChangeNotice::created(Stage::Inbox, "ghost.md"))
            .await;
        std::fs::create_dir_all(vault.path().join("Inbox/held.md")).expect("mkdir");
        let mut rx = observer(&hub).await;

        let err = hub
            .delete_file(Stage::Inbox, "held.md")
            .await
            .expect_err("must fail");
        assert!(matches!(err, VaultError::Io { .. }));

        // The stage was re-listed from disk, so the drifted entry is gone.
        let snapshot = hub.store.snapshot().await;
        assert_eq!(snapshot.count(Stage::Inbox), 0);
        assert!(!hub.store.tracks(Stage::Inbox, "ghost.md").await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_write_reconciles_and_leaves_no_echo_mark() {
        let vault = TempDir::new().expect("tempdir");
        let hub = test_hub(&vault);
        hub.store
            .apply(&ChangeNotice::created(Stage::Inbox, "ghost.md"))
            .await;
        let blocked = vault.path().join("Inbox/blocked.md");
        std::fs::create_dir_all(&blocked).expect("mkdir");
        let mut rx = observer(&hub).await;

        let err = hub
            .create_file(Stage::Inbox, "blocked.md", "x")
            .await
            .expect_err("must fail");
        assert!(matches!(err, VaultError::Io { .. }));

        let snapshot = hub.store.snapshot().await;
        assert_eq!(snapshot.count(Stage::Inbox), 0);
        // The path was never marked, so the detector can still announce
        // whatever really happened on disk.
        assert!(!hub.echo.suppresses(&blocked));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn counts_always_match_the_directory_contents() {
        let vault = TempDir::new().expect("tempdir");
        let hub = test_hub(&vault);

        hub.create_file(Stage::Inbox, "a.md", "1").await.expect("create");
        hub.create_file(Stage::Inbox, "b.md", "2").await.expect("create");
        hub.move_file(Stage::Inbox, Stage::NeedsAction, "a.md")
            .await
            .expect("move");
        hub.delete_file(Stage::Inbox, "b.md").await.expect("delete");

        let snapshot = hub.store.snapshot().await;
        for stage in Stage::ALL {
            let on_disk = scan_stage(vault.path(), stage, "md").await.expect("scan");
            assert_eq!(snapshot.count(stage), on_disk.len(), "stage {stage}");
        }
    }
}
