//! Filesystem watcher (C1): one `notify` watcher per repository root,
//! `.gitignore`-aware, surfacing raw events for the buffer to coalesce.
//!
//! Events are forwarded untouched, with no debouncing in this module —
//! `buffer.rs` owns coalescing as its own stage, since it needs to see the
//! raw create/modify/rename sequence to recognize atomic rewrites.

use crate::buffer::{RawEvent, RawEventKind};
use crate::error::WatcherError;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// A terminal signal that the watched path is gone and the repo must be
/// dropped from active processing.
#[derive(Debug, Clone)]
pub struct WatcherLost {
    pub repo_id: String,
}

/// Owns the OS-level watch for one repository root. This is the only
/// component that touches `notify` directly.
pub struct RepoWatcher {
    repo_id: String,
    _watcher: RecommendedWatcher,
}

impl RepoWatcher {
    /// Start watching `root`, forwarding filtered `RawEvent`s to `raw_tx`
    /// and a `WatcherLost` to `lost_tx` if the OS watch itself dies.
    pub fn start(
        repo_id: String,
        root: PathBuf,
        raw_tx: mpsc::UnboundedSender<RawEvent>,
        lost_tx: mpsc::UnboundedSender<WatcherLost>,
    ) -> Result<Self, WatcherError> {
        let gitignore = build_gitignore(&root);
        let root_for_filter = root.clone();
        let repo_id_for_cb = repo_id.clone();

        let (tx, rx) = std_mpsc::channel::<notify::Result<Event>>();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            notify::Config::default(),
        )
        .map_err(|source| WatcherError::Start {
                path: root.clone(),
                source,
        })?;

        watcher
        .watch(&root, RecursiveMode::Recursive)
        .map_err(|source| WatcherError::Start {
                path: root.clone(),
                source,
        })?;

        // Pump the synchronous notify callback into the async raw-event
        // channel on a dedicated blocking thread (notify's callback runs on
        // its own OS thread regardless).
        std::thread::spawn(move || {
                for res in rx {
                    match res {
                        Ok(event) => {
                            for raw in to_raw_events(&repo_id_for_cb, &event, &root_for_filter, &gitignore) {
                                if raw_tx.send(raw).is_err() {
                                    return;
                                }
                            }
                        }
                        Err(err) => {
                            warn!(repo_id = %repo_id_for_cb, %err, "watcher error, continuing");
                            if is_fatal(&err) {
                                let _ = lost_tx.send(WatcherLost {
                                        repo_id: repo_id_for_cb.clone(),
                                });
                                return;
                            }
                        }
                    }
                }
        });

        debug!(repo_id = %repo_id, root = %root_for_filter_debug(&root), "watcher started");

        Ok(Self {
                repo_id,
                _watcher: watcher,
        })
    }

    pub fn repo_id(&self) -> &str {
        &self.repo_id
    }
}

fn root_for_filter_debug(root: &Path) -> String {
    root.display().to_string()
}

fn is_fatal(err: &notify::Error) -> bool {
    matches!(err.kind, notify::ErrorKind::PathNotFound | notify::ErrorKind::WatchNotFound)
}

/// Build a `.gitignore` matcher honoring nested ignore files.
/// `.git` itself is always excluded from the watch output below, so the
/// matcher only needs to cover working-tree paths.
fn build_gitignore(root: &Path) -> Gitignore {
    let mut builder = GitignoreBuilder::new(root);
    for path in discover_gitignores(root) {
        let _ = builder.add(path);
    }
    builder.build().unwrap_or_else(|_| Gitignore::empty())
}

fn discover_gitignores(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.file_name().and_then(|n| n.to_str()) == Some(".git") {
                continue;
            }
            if path.is_dir() {
                stack.push(path);
            } else if path.file_name().and_then(|n| n.to_str()) == Some(".gitignore") {
                found.push(path);
            }
        }
    }
    found
}

fn is_git_internal(path: &Path, root: &Path) -> bool {
    path.strip_prefix(root)
    .map(|rel| rel.starts_with(".git"))
    .unwrap_or(false)
}

fn to_raw_events(repo_id: &str, event: &Event, root: &Path, gitignore: &Gitignore) -> Vec<RawEvent> {
    let now = SystemTime::now();
    let is_directory = event.paths.iter().any(|p| p.is_dir());

    let passes = |p: &Path| -> bool {
        if is_git_internal(p, root) {
            return false;
        }
        !gitignore.matched(p, p.is_dir()).is_ignore()
    };

    match &event.kind {
        EventKind::Create(_) => event
        .paths
        .iter()
        .filter(|p| passes(p))
        .map(|p| mk(repo_id, RawEventKind::Created, p, is_directory, now))
        .collect(),
        EventKind::Modify(notify::event::ModifyKind::Name(_)) if event.paths.len() == 2 => {
            let src = &event.paths[0];
            let dest = &event.paths[1];
            if !passes(dest) {
                return Vec::new();
            }
            vec![RawEvent {
                    repo_id: repo_id.to_string(),
                    kind: RawEventKind::Moved {
                        src: src.display().to_string(),
                    },
                    path: dest.display().to_string(),
                    is_directory,
                    at: to_instant(now),
            }]
        }
        EventKind::Modify(_) => event
        .paths
        .iter()
        .filter(|p| passes(p))
        .map(|p| mk(repo_id, RawEventKind::Modified, p, is_directory, now))
        .collect(),
        EventKind::Remove(_) => event
        .paths
        .iter()
        .filter(|p| passes(p))
        .map(|p| mk(repo_id, RawEventKind::Deleted, p, is_directory, now))
        .collect(),
        _ => Vec::new(),
    }
}

fn mk(repo_id: &str, kind: RawEventKind, path: &Path, is_directory: bool, _now: SystemTime) -> RawEvent {
    RawEvent {
        repo_id: repo_id.to_string(),
        kind,
        path: path.display().to_string(),
        is_directory,
        at: std::time::Instant::now(),
    }
}

fn to_instant(_now: SystemTime) -> std::time::Instant {
    std::time::Instant::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn git_internal_paths_are_excluded() {
        let dir = TempDir::new().unwrap();
        let git_dir = dir.path().join(".git");
        std::fs::create_dir_all(&git_dir).unwrap();
        assert!(is_git_internal(&git_dir.join("index"), dir.path()));
        assert!(!is_git_internal(&dir.path().join("src/main.rs"), dir.path()));
    }

    #[test]
    fn gitignore_matcher_honors_nested_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "*.log\n").unwrap();
        let nested = dir.path().join("sub");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join(".gitignore"), "build/\n").unwrap();

        let gi = build_gitignore(dir.path());
        assert!(gi.matched(dir.path().join("out.log"), false).is_ignore());
        assert!(gi.matched(nested.join("build"), true).is_ignore());
        assert!(!gi.matched(dir.path().join("src.rs"), false).is_ignore());
    }
}
