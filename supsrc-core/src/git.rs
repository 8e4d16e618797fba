//! Git engine (C6): status, staging, commit, push and the read-only
//! inspection helpers used by `cb status` / history views.
//!
//! Every operation opens its own handle inside `spawn_blocking` on the
//! caller side (`git2::Repository` is not `Send`); this module stays
//! synchronous and free of async so it can be called from a blocking
//! thread pool without surprises.

use crate::error::GitError;
use crate::state::ChangeCounters;
use chrono::{DateTime, TimeZone, Utc};
use git2::{DiffOptions, Repository, StatusOptions};
use std::path::Path;

const MAX_SUMMARY_FILES: usize = 10;
const LARGE_DIFF_LINE_CAP: usize = 500;
const BINARY_SNIFF_BYTES: usize = 8192;

/// Git operations for one repository's working tree. All methods are
/// synchronous; callers run them inside `tokio::task::spawn_blocking`.
pub struct GitEngine;

impl GitEngine {
    pub fn open(path: &Path) -> Result<Repository, GitError> {
        Repository::open(path).map_err(|source| GitError::Open {
                path: path.to_path_buf(),
                source,
        })
    }

    pub fn current_branch(repo: &Repository) -> Result<String, GitError> {
        if repo.head_detached().unwrap_or(false) || repo.is_empty().unwrap_or(false) {
            return Err(GitError::UnbornHead);
        }
        let head = repo.head().map_err(GitError::classify)?;
        Ok(head.shorthand().unwrap_or("HEAD").to_string())
    }

    /// Working-tree status summarized into the counters persisted on
    /// `RepositoryState`.
    pub fn get_status(repo: &Repository) -> Result<(ChangeCounters, bool), GitError> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = repo.statuses(Some(&mut opts)).map_err(GitError::classify)?;

        let mut counters = ChangeCounters::default();
        for entry in statuses.iter() {
            let s = entry.status();
            if s.is_wt_new() || s.is_index_new() {
                counters.added_files += 1;
            } else if s.is_wt_deleted() || s.is_index_deleted() {
                counters.deleted_files += 1;
            } else if s.is_wt_modified() || s.is_index_modified() || s.is_wt_renamed() || s.is_index_renamed()
            {
                counters.modified_files += 1;
            }
            counters.changed_files += 1;
            counters.total_files += 1;
        }

        let has_changes = !statuses.is_empty();
        Ok((counters, has_changes))
    }

    /// Stage every pending change via `git add -A` semantics.
    pub fn stage_all(repo: &Repository) -> Result<(), GitError> {
        let mut index = repo.index().map_err(GitError::classify)?;
        index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .map_err(GitError::classify)?;
        index.write().map_err(GitError::classify)?;
        Ok(())
    }

    /// Diff of the index against HEAD, used for `generate_change_summary`.
    fn diff_index_to_head(repo: &Repository) -> Result<git2::Diff<'_>, GitError> {
        let head_tree = match repo.head() {
            Ok(head) => Some(head.peel_to_tree().map_err(GitError::classify)?),
            Err(_) => None,
        };
        let mut opts = DiffOptions::new();
        repo.diff_tree_to_index(head_tree.as_ref(), None, Some(&mut opts))
        .map_err(GitError::classify)
    }

    /// Human-readable change summary grouped by Added/Modified/Deleted/
    /// Renamed/Type Changed, capped at 10 entries per group.
    pub fn generate_change_summary(repo: &Repository) -> Result<String, GitError> {
        let diff = Self::diff_index_to_head(repo)?;

        let mut added = Vec::new();
        let mut modified = Vec::new();
        let mut deleted = Vec::new();
        let mut renamed = Vec::new();
        let mut typechanged = Vec::new();

        diff.foreach(
            &mut |delta, _| {
                let path_of = |file: git2::DiffFile| {
                    file.path().map(|p| p.display().to_string()).unwrap_or_default()
                };
                match delta.status() {
                    git2::Delta::Added => added.push(path_of(delta.new_file())),
                    git2::Delta::Modified => modified.push(path_of(delta.new_file())),
                    git2::Delta::Deleted => deleted.push(path_of(delta.old_file())),
                    git2::Delta::Renamed => renamed.push(format!(
                            "{} -> {}",
                            path_of(delta.old_file()),
                            path_of(delta.new_file())
                    )),
                    git2::Delta::Typechange => typechanged.push(path_of(delta.new_file())),
                    _ => {}
                }
                true
            },
            None,
            None,
            None,
        )
        .map_err(GitError::classify)?;

        let mut lines = Vec::new();
        push_group(&mut lines, "Added", "A ", &added);
        push_group(&mut lines, "Modified", "M ", &modified);
        push_group(&mut lines, "Deleted", "D ", &deleted);
        push_group(&mut lines, "Renamed", "R ", &renamed);
        push_group(&mut lines, "Type Changed", "T ", &typechanged);

        Ok(lines.join("\n"))
    }

    /// Commit the current index, substituting `{{timestamp}}` and
    /// `{{change_summary}}` into `template`.
    ///
    /// Refuses to commit if the index has no diff against HEAD, returning
    /// `Ok(None)` rather than writing an empty commit.
    pub fn perform_commit(
        repo: &Repository,
        template: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, GitError> {
        let diff = Self::diff_index_to_head(repo)?;
        if diff.deltas().len() == 0 {
            return Ok(None);
        }

        let summary = Self::generate_change_summary(repo)?;
        let message = template
        .replace("{{timestamp}}", &now.to_rfc3339())
        .replace("{{change_summary}}", &summary);

        let mut index = repo.index().map_err(GitError::classify)?;
        let tree_oid = index.write_tree().map_err(GitError::classify)?;
        let tree = repo.find_tree(tree_oid).map_err(GitError::classify)?;
        let sig = repo.signature().map_err(GitError::classify)?;

        let parents = match repo.head() {
            Ok(head) => vec![head.peel_to_commit().map_err(GitError::classify)?],
            Err(_) => vec![],
        };
        let parent_refs: Vec<&git2::Commit> = parents.iter().collect();

        let oid = repo
        .commit(Some("HEAD"), &sig, &sig, &message, &tree, &parent_refs)
        .map_err(GitError::classify)?;
        Ok(Some(oid.to_string()))
    }

    /// Push `branch` to `remote`. No-op precondition: callers must not
    /// invoke this unless the branch has a configured upstream (P5).
    pub fn perform_push(repo: &Repository, remote_name: &str, branch: &str) -> Result<(), GitError> {
        let mut remote = repo.find_remote(remote_name).map_err(GitError::classify)?;
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");

        let mut callbacks = git2::RemoteCallbacks::new();
        callbacks.credentials(|_url, username_from_url, allowed_types| {
                if allowed_types.contains(git2::CredentialType::SSH_KEY) {
                    git2::Cred::ssh_key_from_agent(username_from_url.unwrap_or("git"))
                } else {
                    git2::Cred::default()
                }
        });

        let mut opts = git2::PushOptions::new();
        opts.remote_callbacks(callbacks);
        remote
        .push(&[refspec.as_str()], Some(&mut opts))
        .map_err(GitError::classify)?;
        Ok(())
    }

    pub fn has_upstream(repo: &Repository, branch: &str) -> bool {
        repo.find_branch(branch, git2::BranchType::Local)
        .and_then(|b| b.upstream())
        .is_ok()
    }

    /// Cheap conflict probe for the action workflow's status step (spec
    /// §4.6 `get_status`'s `is_conflicted` field), independent of the
    /// fuller `check_upstream_conflicts` preflight used before push.
    pub fn is_index_conflicted(repo: &Repository) -> Result<bool, GitError> {
        let index = repo.index().map_err(GitError::classify)?;
        Ok(index.has_conflicts())
    }

    /// Detects an in-progress merge/rebase/cherry-pick/revert by the
    /// presence of the well-known files under the Git directory (spec
    /// §4.6 `get_status`'s `is_{merge,rebase,cherry_pick,revert}_in_progress`).
    pub fn in_progress_operation(repo: &Repository) -> Option<&'static str> {
        let git_dir = repo.path();
        if git_dir.join("MERGE_HEAD").exists() {
            Some("merge")
        } else if git_dir.join("rebase-merge").exists() || git_dir.join("rebase-apply").exists() {
            Some("rebase")
        } else if git_dir.join("CHERRY_PICK_HEAD").exists() {
            Some("cherry_pick")
        } else if git_dir.join("REVERT_HEAD").exists() {
            Some("revert")
        } else {
            None
        }
    }

    /// Last N commit one-liners, for `cb status`/history views.
    pub fn get_commit_history(repo: &Repository, limit: usize) -> Result<Vec<String>, GitError> {
        if repo.is_empty().unwrap_or(true) || repo.head().is_err() {
            return Ok(vec!["Repository is empty or unborn.".to_string()]);
        }

        let mut revwalk = repo.revwalk().map_err(GitError::classify)?;
        revwalk.push_head().map_err(GitError::classify)?;
        revwalk
        .set_sorting(git2::Sort::TIME)
        .map_err(GitError::classify)?;

        let mut out = Vec::new();
        for oid in revwalk.take(limit) {
            let oid = oid.map_err(GitError::classify)?;
            let commit = repo.find_commit(oid).map_err(GitError::classify)?;
            let when = Utc
            .timestamp_opt(commit.time().seconds(), 0)
            .single()
            .unwrap_or_else(Utc::now)
            .format("%Y-%m-%d %H:%M:%S");
            let summary = commit.summary().unwrap_or("").chars().take(60).collect::<String>();
            let author = commit.author().name().unwrap_or("Unknown").to_string();
            out.push(format!(
                    "{} - {} - {} - {}",
                    &commit.id().to_string()[..7],
                    author,
                    when,
                    summary
            ));
        }
        Ok(out)
    }

    /// Detailed per-commit history with add/delete/modify counts, for the
    /// richer history surface (spec SUPPLEMENT).
    pub fn get_detailed_commit_history(
        repo: &Repository,
        limit: usize,
    ) -> Result<Vec<DetailedCommit>, GitError> {
        if repo.is_empty().unwrap_or(true) || repo.head().is_err() {
            return Ok(Vec::new());
        }

        let mut revwalk = repo.revwalk().map_err(GitError::classify)?;
        revwalk.push_head().map_err(GitError::classify)?;
        revwalk
        .set_sorting(git2::Sort::TIME)
        .map_err(GitError::classify)?;

        let mut out = Vec::new();
        for oid in revwalk.take(limit) {
            let oid = oid.map_err(GitError::classify)?;
            let commit = repo.find_commit(oid).map_err(GitError::classify)?;

            let (mut added, mut deleted, mut modified) = (0u32, 0u32, 0u32);
            if commit.parent_count() > 0 {
                let parent_tree = commit.parent(0).and_then(|p| p.tree()).ok();
                let tree = commit.tree().map_err(GitError::classify)?;
                let diff = repo
                .diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None)
                .map_err(GitError::classify)?;
                for delta in diff.deltas() {
                    match delta.status() {
                        git2::Delta::Added => added += 1,
                        git2::Delta::Deleted => deleted += 1,
                        git2::Delta::Modified => modified += 1,
                        _ => {}
                    }
                }
            }

            let when = Utc
            .timestamp_opt(commit.time().seconds(), 0)
            .single()
            .unwrap_or_else(Utc::now);

            out.push(DetailedCommit {
                    hash: commit.id().to_string()[..7].to_string(),
                    full_hash: commit.id().to_string(),
                    author: commit.author().name().unwrap_or("Unknown").to_string(),
                    email: commit.author().email().unwrap_or("").to_string(),
                    timestamp: when,
                    message: commit.summary().unwrap_or("").chars().take(80).collect(),
                    full_message: commit.message().unwrap_or("").to_string(),
                    added,
                    deleted,
                    modified,
            });
        }
        Ok(out)
    }

    /// Unstaged working diff, capped at `max_lines` with a truncation
    /// marker (spec SUPPLEMENT, from `get_working_diff`).
    pub fn get_working_diff(repo: &Repository, max_lines: usize) -> Result<String, GitError> {
        if repo.is_empty().unwrap_or(true) || repo.head().is_err() {
            return Ok("Repository is empty or has no commits yet.".to_string());
        }

        let head_tree = repo.head().map_err(GitError::classify)?.peel_to_tree().map_err(GitError::classify)?;
        let mut opts = DiffOptions::new();
        opts.include_untracked(true);
        let diff = repo
        .diff_tree_to_workdir_with_index(Some(&head_tree), Some(&mut opts))
        .map_err(GitError::classify)?;

        if diff.deltas().len() == 0 {
            return Ok("No changes detected.".to_string());
        }

        let mut lines = Vec::new();
        let mut count = 0usize;
        let mut truncated = false;

        diff.print(git2::DiffFormat::Patch, |delta, hunk, line| {
                if count >= max_lines {
                    truncated = true;
                    return false;
                }
                if let Some(hunk) = hunk {
                    let header = std::str::from_utf8(hunk.header()).unwrap_or("").trim_end();
                    if lines.last().map(String::as_str) != Some(header) {
                        lines.push(header.to_string());
                        count += 1;
                    }
                }
                let origin = line.origin();
                let content = std::str::from_utf8(line.content()).unwrap_or("").trim_end_matches('\n');
                let rendered = match origin {
                    '+' => format!("+{content}"),
                    '-' => format!("-{content}"),
                    _ => format!(" {content}"),
                };
                lines.push(rendered.replace('[', "\\["));
                count += 1;
                let _ = delta;
                true
        })
        .map_err(GitError::classify)?;

        if truncated {
            lines.push(format!("... (truncated at {max_lines} lines)"));
        }
        Ok(lines.join("\n"))
    }

    /// Per-file tree for display, sorted by path (spec SUPPLEMENT, from
    /// `get_changed_files_tree`).
    pub fn get_changed_files_tree(repo: &Repository, workdir: &Path) -> Result<Vec<ChangedFile>, GitError> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = repo.statuses(Some(&mut opts)).map_err(GitError::classify)?;

        let mut files = Vec::new();
        for entry in statuses.iter() {
            let s = entry.status();
            let Some(path) = entry.path() else { continue };

            let (status, icon) = if s.is_wt_new() {
                ("untracked", "?")
            } else if s.is_index_new() {
                ("added", "A")
            } else if s.is_wt_deleted() || s.is_index_deleted() {
                ("deleted", "D")
            } else if s.is_wt_modified() || s.is_index_modified() {
                ("modified", "M")
            } else if s.is_wt_renamed() || s.is_index_renamed() {
                ("renamed", "R")
            } else {
                ("changed", "~")
            };

            let is_staged = s.is_index_new() || s.is_index_modified() || s.is_index_deleted() || s.is_index_renamed();

            let full_path = workdir.join(path);
            let (size, is_binary) = probe_file(&full_path);

            files.push(ChangedFile {
                    path: path.to_string(),
                    status: status.to_string(),
                    icon: icon.to_string(),
                    is_staged,
                    size,
                    is_binary,
                    is_large: size > 1_000_000,
            });
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    /// Upstream divergence check, conflicts take priority over ahead/behind
    ///.
    pub fn check_upstream_conflicts(repo: &Repository, branch: &str) -> Result<UpstreamStatus, GitError> {
        let mut result = UpstreamStatus::default();

        if repo.is_empty().unwrap_or(true) || repo.head().is_err() {
            result.message = "Repository is empty".to_string();
            return Ok(result);
        }

        let index = repo.index().map_err(GitError::classify)?;
        if index.has_conflicts() {
            let conflicts: Vec<String> = index
            .conflicts()
            .map_err(GitError::classify)?
            .filter_map(|c| c.ok())
            .filter_map(|c| c.our.map(|e| String::from_utf8_lossy(&e.path).into_owned()))
            .take(10)
            .collect();
            result.has_conflicts = true;
            let count = conflicts.len();
            result.conflict_files = conflicts;
            result.message = format!("{count} file(s) have merge conflicts");
            return Ok(result);
        }

        let Ok(local_branch) = repo.find_branch(branch, git2::BranchType::Local) else {
            result.message = "No upstream branch configured".to_string();
            return Ok(result);
        };
        let Ok(upstream) = local_branch.upstream() else {
            result.message = "No upstream branch configured".to_string();
            return Ok(result);
        };

        result.has_upstream = true;
        result.upstream_branch = upstream.name().ok().flatten().map(str::to_string);

        let local_oid = repo.head().map_err(GitError::classify)?.target();
        let upstream_oid = upstream.get().target();
        if let (Some(local), Some(up)) = (local_oid, upstream_oid) {
            let (ahead, behind) = repo.graph_ahead_behind(local, up).map_err(GitError::classify)?;
            result.ahead = ahead;
            result.behind = behind;
            result.diverged = ahead > 0 && behind > 0;
            result.message = if result.diverged {
                format!("Branch has diverged: {ahead} ahead, {behind} behind")
            } else if behind > 0 {
                format!("Branch is {behind} commit(s) behind upstream")
            } else if ahead > 0 {
                format!("Branch is {ahead} commit(s) ahead of upstream")
            } else {
                "Up to date with upstream".to_string()
            };
        }

        Ok(result)
    }

    /// Large-file / binary-content warnings ahead of staging.
    pub fn analyze_files_for_warnings(
        repo: &Repository,
        workdir: &Path,
        large_threshold: u64,
    ) -> Result<Vec<String>, GitError> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = repo.statuses(Some(&mut opts)).map_err(GitError::classify)?;

        let mut warnings = Vec::new();
        for entry in statuses.iter() {
            let s = entry.status();
            if s.is_wt_deleted() {
                continue;
            }
            let Some(path) = entry.path() else { continue };
            let full_path = workdir.join(path);
            if !full_path.exists() {
                continue;
            }

            let (size, is_binary) = probe_file(&full_path);
            if size > large_threshold {
                warnings.push(format!(
                        "Large file ({:.1}MB): {path}",
                        size as f64 / 1_000_000.0
                ));
            }
            if is_binary {
                warnings.push(format!("Binary file detected: {path}"));
            }
        }
        Ok(warnings)
    }
}

fn push_group(lines: &mut Vec<String>, label: &str, prefix: &str, entries: &[String]) {
    if entries.is_empty() {
        return;
    }
    lines.push(format!("{label} ({}):", entries.len()));
    for entry in entries.iter().take(MAX_SUMMARY_FILES) {
        lines.push(format!(" {prefix}{entry}"));
    }
    if entries.len() > MAX_SUMMARY_FILES {
        lines.push(format!("... ({} more)", entries.len() - MAX_SUMMARY_FILES));
    }
}

fn probe_file(path: &Path) -> (u64, bool) {
    let Ok(meta) = std::fs::metadata(path) else {
        return (0, false);
    };
    let size = meta.len();
    let is_binary = std::fs::read(path)
    .map(|bytes| bytes.iter().take(BINARY_SNIFF_BYTES).any(|b| *b == 0))
    .unwrap_or(false);
    (size, is_binary)
}

#[derive(Debug, Clone)]
pub struct DetailedCommit {
    pub hash: String,
    pub full_hash: String,
    pub author: String,
    pub email: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub full_message: String,
    pub added: u32,
    pub deleted: u32,
    pub modified: u32,
}

#[derive(Debug, Clone)]
pub struct ChangedFile {
    pub path: String,
    pub status: String,
    pub icon: String,
    pub is_staged: bool,
    pub size: u64,
    pub is_binary: bool,
    pub is_large: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UpstreamStatus {
    pub has_conflicts: bool,
    pub has_upstream: bool,
    pub ahead: u32,
    pub behind: u32,
    pub diverged: bool,
    pub upstream_branch: Option<String>,
    pub conflict_files: Vec<String>,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn init_repo() -> (TempDir, Repository) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        {
            let mut cfg = repo.config().unwrap();
            cfg.set_str("user.name", "Test User").unwrap();
            cfg.set_str("user.email", "test@example.com").unwrap();
        }
        (dir, repo)
    }

    #[test]
    fn first_commit_has_no_parent_and_no_error() {
        let (dir, repo) = init_repo();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        GitEngine::stage_all(&repo).unwrap();
        let oid = GitEngine::perform_commit(&repo, "Autosave: {{timestamp}}\n\n{{change_summary}}", Utc::now())
        .unwrap();
        assert_eq!(oid.unwrap().len(), 40);
    }

    #[test]
    fn commit_with_clean_index_is_a_no_op() {
        let (_dir, repo) = init_repo();
        let oid = GitEngine::perform_commit(&repo, "{{timestamp}}", Utc::now()).unwrap();
        assert!(oid.is_none());
    }

    #[test]
    fn fresh_repo_has_no_conflicts_or_in_progress_operation() {
        let (_dir, repo) = init_repo();
        assert!(!GitEngine::is_index_conflicted(&repo).unwrap());
        assert_eq!(GitEngine::in_progress_operation(&repo), None);
    }

    #[test]
    fn change_summary_groups_and_caps_entries() {
        let (dir, repo) = init_repo();
        for i in 0..12 {
            fs::write(dir.path().join(format!("f{i}.txt")), "x").unwrap();
        }
        GitEngine::stage_all(&repo).unwrap();
        let summary = GitEngine::generate_change_summary(&repo).unwrap();
        assert!(summary.contains("Added (12):"));
        assert!(summary.contains("... (2 more)"));
    }

    #[test]
    fn status_counts_added_files() {
        let (dir, repo) = init_repo();
        fs::write(dir.path().join("a.txt"), "1").unwrap();
        fs::write(dir.path().join("b.txt"), "2").unwrap();
        let (counters, has_changes) = GitEngine::get_status(&repo).unwrap();
        assert!(has_changes);
        assert_eq!(counters.added_files, 2);
    }

    #[test]
    fn upstream_status_reports_no_upstream_on_fresh_repo() {
        let (_dir, repo) = init_repo();
        fs::write(_dir.path().join("a.txt"), "x").unwrap();
        GitEngine::stage_all(&repo).unwrap();
        GitEngine::perform_commit(&repo, "{{timestamp}}", Utc::now()).unwrap();
        let status = GitEngine::check_upstream_conflicts(&repo, "master").unwrap();
        assert!(!status.has_upstream);
    }

    #[test]
    fn binary_probe_detects_nul_byte() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bin.dat");
        fs::write(&path, [0u8, 1, 2, 3]).unwrap();
        let (_, is_binary) = probe_file(&path);
        assert!(is_binary);
    }
}
