use std::{
    path::{Path, PathBuf},
    pin::Pin,
    time::Duration,
};

use anyhow::{Context, Result};
use notify::{
    event::{EventKind, ModifyKind},
    RecommendedWatcher,
    RecursiveMode,
    Watcher,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info};

const RAW_EVENT_BUFFER: usize = 100;
const FILE_EVENT_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// A file was created, changed or renamed into place.
    Write,
    /// Metadata, access or removal.
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileEventKind,
}

pub fn classify(kind: &EventKind) -> FileEventKind {
    match kind {
        EventKind::Create(_) |
        EventKind::Modify(ModifyKind::Data(_)) |
        EventKind::Modify(ModifyKind::Name(_)) |
        EventKind::Modify(ModifyKind::Any) => FileEventKind::Write,
        _ => FileEventKind::Other,
    }
}

/// Watches a directory tree. Events stop when this is dropped.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl FileWatcher {
    /// Watch `root` recursively. Bursts of writes closer together than
    /// `debounce` arrive as a single [`FileEventKind::Write`].
    pub fn start(root: &Path, debounce: Duration) -> Result<(FileWatcher, mpsc::Receiver<FileEvent>)> {
        let (raw_tx, raw_rx) = mpsc::channel(RAW_EVENT_BUFFER);
        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                let _ = raw_tx.blocking_send(res);
            })
            .context("creating file watcher")?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("watching {}", root.display()))?;
        info!(root = %root.display(), "watching for changes");

        let (events_tx, events_rx) = mpsc::channel(FILE_EVENT_BUFFER);
        let task = tokio::spawn(debounce_events(raw_rx, events_tx, debounce));
        Ok((
            FileWatcher {
                _watcher: watcher,
                task,
            },
            events_rx,
        ))
    }
}

/// Collapses write bursts into one event carrying the last written path.
/// Other events pass straight through and are dropped if nobody keeps up.
pub(crate) async fn debounce_events(
    mut raw: mpsc::Receiver<Result<notify::Event, notify::Error>>,
    events: mpsc::Sender<FileEvent>,
    debounce: Duration,
) {
    let mut debounce_timer: Option<Pin<Box<tokio::time::Sleep>>> = None;
    let mut last_written: Option<PathBuf> = None;

    loop {
        tokio::select! {
            res = raw.recv() => {
                let Some(res) = res else {
                    break;
                };
                match res {
                    Ok(event) => {
                        let Some(path) = event.paths.first().cloned() else {
                            continue;
                        };
                        match classify(&event.kind) {
                            FileEventKind::Write => {
                                debug!(path = %path.display(), "file written");
                                last_written = Some(path);
                                debounce_timer = Some(Box::pin(tokio::time::sleep(debounce)));
                            }
                            FileEventKind::Other => {
                                let _ = events.try_send(FileEvent { path, kind: FileEventKind::Other });
                            }
                        }
                    }
                    Err(e) => {
                        error!("Watch error: {}", e);
                    }
                }
            }
            _ = async {
                if let Some(timer) = debounce_timer.as_mut() {
                    timer.await;
                } else {
                    std::future::pending::<()>().await
                }
            } => {
                debounce_timer = None;
                if let Some(path) = last_written.take() {
                    if events.send(FileEvent { path, kind: FileEventKind::Write }).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    // The watcher is gone; deliver a pending write before closing.
    if let Some(path) = last_written {
        let _ = events
            .send(FileEvent {
                path,
                kind: FileEventKind::Write,
            })
            .await;
    }
}
