//! Reference counting of index files.
//!
//! Every readable commit and the in-memory state of the writer or reader
//! holding the write lock reference files. A file is deleted once nothing
//! references it. Deletions that fail (a file still open elsewhere) are
//! retried on the next checkpoint.

use std::sync::Arc;

use ahash::AHashMap;
use log::{debug, warn};

use crate::error::Result;
use crate::index::deletion_policy::{IndexCommit, IndexDeletionPolicy};
use crate::index::segment_info::{SegmentInfos, generation_from_file_name, is_index_file};
use crate::storage::Storage;

/// Tracks which index files are still referenced and deletes the rest.
#[derive(Debug)]
pub struct IndexFileDeleter {
    storage: Arc<dyn Storage>,
    policy: Arc<dyn IndexDeletionPolicy>,
    ref_counts: AHashMap<String, usize>,
    commits: Vec<IndexCommit>,
    last_files: Vec<String>,
    pending: Vec<String>,
}

impl IndexFileDeleter {
    /// Reference every readable commit, let `policy` prune them, delete
    /// unreferenced index files and checkpoint `current`.
    pub fn new(
        storage: Arc<dyn Storage>,
        policy: Arc<dyn IndexDeletionPolicy>,
        current: &SegmentInfos,
    ) -> Result<Self> {
        let mut deleter = IndexFileDeleter {
            storage,
            policy,
            ref_counts: AHashMap::new(),
            commits: Vec::new(),
            last_files: Vec::new(),
            pending: Vec::new(),
        };

        let files = deleter.storage.list_files()?;
        let mut commit_files: Vec<(u64, &String)> = files
            .iter()
            .filter_map(|name| generation_from_file_name(name).map(|g| (g, name)))
            .collect();
        commit_files.sort();

        for (_, name) in commit_files {
            match SegmentInfos::read(deleter.storage.as_ref(), name) {
                Ok(infos) => {
                    deleter.inc_ref_all(&infos.files(true));
                    deleter.commits.push(IndexCommit::from_infos(&infos));
                }
                Err(e) => warn!("ignoring unreadable commit {name}: {e}"),
            }
        }
        deleter.inc_ref_all(&current.files(false));

        for name in &files {
            if is_index_file(name) && !deleter.ref_counts.contains_key(name) {
                deleter.delete_file(name);
            }
        }
        for name in current.files(false) {
            deleter.dec_ref(&name);
        }

        let policy = Arc::clone(&deleter.policy);
        policy.on_init(&mut deleter.commits)?;
        deleter.delete_commits();
        deleter.checkpoint(current, false)?;
        Ok(deleter)
    }

    /// Commits still alive, oldest first.
    pub fn commits(&self) -> &[IndexCommit] {
        &self.commits
    }

    /// How many references `file` has.
    pub fn ref_count(&self, file: &str) -> usize {
        self.ref_counts.get(file).copied().unwrap_or(0)
    }

    /// Record a new state. A commit is kept until the policy removes it; a
    /// plain checkpoint replaces the previous one.
    pub fn checkpoint(&mut self, infos: &SegmentInfos, is_commit: bool) -> Result<()> {
        self.delete_pending();

        let files = infos.files(is_commit);
        self.inc_ref_all(&files);
        if is_commit {
            self.commits.push(IndexCommit::from_infos(infos));
            let policy = Arc::clone(&self.policy);
            policy.on_commit(&mut self.commits)?;
            self.delete_commits();
        }

        let last = std::mem::take(&mut self.last_files);
        self.dec_ref_all(&last);
        if !is_commit {
            self.last_files = files;
        }
        Ok(())
    }

    /// Delete every index file nothing references, such as files left by a
    /// failed commit.
    pub fn refresh(&mut self) -> Result<()> {
        for name in self.storage.list_files()? {
            if is_index_file(&name) && !self.ref_counts.contains_key(&name) {
                self.delete_file(&name);
            }
        }
        Ok(())
    }

    /// Drop the last checkpoint's references.
    pub fn close(&mut self) {
        let last = std::mem::take(&mut self.last_files);
        self.dec_ref_all(&last);
        self.delete_pending();
    }

    fn inc_ref_all(&mut self, files: &[String]) {
        for file in files {
            *self.ref_counts.entry(file.clone()).or_insert(0) += 1;
        }
    }

    fn dec_ref_all(&mut self, files: &[String]) {
        for file in files {
            self.dec_ref(file);
        }
    }

    fn dec_ref(&mut self, file: &str) {
        let Some(count) = self.ref_counts.get_mut(file) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.ref_counts.remove(file);
            self.delete_file(file);
        }
    }

    fn delete_commits(&mut self) {
        let (deleted, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.commits)
            .into_iter()
            .partition(|commit| commit.is_deleted());
        self.commits = kept;
        for commit in deleted {
            debug!("deleting commit {}", commit.segments_file_name());
            self.dec_ref_all(commit.files());
        }
    }

    fn delete_pending(&mut self) {
        for name in std::mem::take(&mut self.pending) {
            self.delete_file(&name);
        }
    }

    fn delete_file(&mut self, name: &str) {
        match self.storage.delete_file(name) {
            Ok(()) => debug!("deleted index file {name}"),
            Err(e) => {
                if self.storage.file_exists(name) {
                    warn!("could not delete {name}, will retry: {e}");
                    self.pending.push(name.to_string());
                }
            }
        }
    }
}
