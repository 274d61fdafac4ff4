use anyhow::{Context, Result};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::models::{Upload, UploadOutcome};
use crate::services::processor::is_supported_content_type;
use crate::services::state::AppState;
use crate::utils::{guess_content_type, sha256_file};

pub const DEBOUNCE_MS: u64 = 700;

/// Result of feeding one inbox file to the pipeline.
#[derive(Debug)]
pub enum InboxOutcome {
    Processed(UploadOutcome),
    Duplicate { existing_id: String },
    Skipped,
}

/// Keeps the OS watcher alive; new candidate files arrive on the channel
/// handed to [`InboxWatcher::start`].
pub struct InboxWatcher {
    _watcher: RecommendedWatcher,
}

impl InboxWatcher {
    pub fn start(folder: &Path, tx: mpsc::UnboundedSender<PathBuf>) -> Result<Self> {
        let mut watcher = recommended_watcher(move |res: notify::Result<Event>| {
            let Ok(event) = res else {
                return;
            };
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                return;
            }
            for path in event.paths {
                if is_inbox_candidate(&path) {
                    let _ = tx.send(path);
                }
            }
        })?;

        watcher
            .watch(folder, RecursiveMode::NonRecursive)
            .with_context(|| format!("Watch {}", folder.display()))?;
        Ok(InboxWatcher { _watcher: watcher })
    }
}

pub fn is_inbox_candidate(path: &Path) -> bool {
    path.is_file() && is_supported_content_type(&guess_content_type(path))
}

/// Supported files directly inside `folder`, in name order.
pub fn scan_folder(folder: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(folder)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.path().to_path_buf())
        .filter(|path| is_inbox_candidate(path))
        .collect()
}

/// Waits until the file size stops changing. `false` when the file vanished
/// or stayed empty.
pub async fn wait_until_stable(path: &Path, debounce_ms: u64) -> bool {
    let mut last_size = None;
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(debounce_ms)).await;
        match tokio::fs::metadata(path).await {
            Ok(metadata) => {
                let size = metadata.len();
                if Some(size) == last_size {
                    return size > 0;
                }
                last_size = Some(size);
            }
            Err(_) => return false,
        }
    }
    last_size.unwrap_or(0) > 0
}

pub async fn ingest_path(state: &AppState, path: &Path) -> Result<InboxOutcome> {
    let file_hash = sha256_file(path).with_context(|| format!("Hash {}", path.display()))?;
    if let Some(existing) = state.with_db(|db| db.find_by_hash(&file_hash))? {
        debug!(path = %path.display(), existing = %existing.id, "Already ingested");
        return Ok(InboxOutcome::Duplicate {
            existing_id: existing.id,
        });
    }

    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload".to_string());
    let content_type = guess_content_type(path);
    if !is_supported_content_type(&content_type) {
        return Ok(InboxOutcome::Skipped);
    }
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Read {}", path.display()))?;

    let outcome = state
        .pipeline
        .process_upload(Upload {
            filename,
            content_type,
            bytes,
        })
        .await?;
    Ok(InboxOutcome::Processed(outcome))
}

/// Ingests what is already in `folder`, then every file dropped into it
/// until Ctrl-C.
pub async fn run_inbox(state: &AppState, folder: &Path) -> Result<()> {
    for path in scan_folder(folder) {
        report(&path, ingest_path(state, &path).await);
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _watcher = InboxWatcher::start(folder, tx)?;
    info!(folder = %folder.display(), "Watching inbox");

    loop {
        tokio::select! {
            received = rx.recv() => {
                let Some(path) = received else {
                    break;
                };
                if !wait_until_stable(&path, DEBOUNCE_MS).await {
                    continue;
                }
                report(&path, ingest_path(state, &path).await);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping inbox watcher");
                break;
            }
        }
    }
    Ok(())
}

fn report(path: &Path, result: Result<InboxOutcome>) {
    match result {
        Ok(InboxOutcome::Processed(outcome)) => info!(
            path = %path.display(),
            id = %outcome.id,
            status = %outcome.status.as_str(),
            "Ingested"
        ),
        Ok(InboxOutcome::Duplicate { existing_id }) => {
            info!(path = %path.display(), existing = %existing_id, "Skipped duplicate")
        }
        Ok(InboxOutcome::Skipped) => {}
        Err(err) => warn!(path = %path.display(), error = %err, "Ingest failed"),
    }
}
