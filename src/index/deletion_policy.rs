//! Commit points and the policies deciding which of them to keep.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::index::segment_info::SegmentInfos;

/// One commit of the index: a `segments_N` file and everything it
/// references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexCommit {
    segments_file_name: String,
    files: Vec<String>,
    generation: u64,
    version: u64,
    user_data: BTreeMap<String, String>,
    optimized: bool,
    deleted: bool,
}

impl IndexCommit {
    /// Describe the commit `infos` was read from or written to.
    pub fn from_infos(infos: &SegmentInfos) -> Self {
        IndexCommit {
            segments_file_name: infos.segments_file_name(),
            files: infos.files(true),
            generation: infos.generation,
            version: infos.version,
            user_data: infos.user_data.clone(),
            optimized: infos.is_optimized(),
            deleted: false,
        }
    }

    /// Name of the commit file.
    pub fn segments_file_name(&self) -> &str {
        &self.segments_file_name
    }

    /// Every file the commit references, the commit file included.
    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Data the committer attached.
    pub fn user_data(&self) -> &BTreeMap<String, String> {
        &self.user_data
    }

    /// Whether the commit has one segment without deletions.
    pub fn is_optimized(&self) -> bool {
        self.optimized
    }

    /// Ask the file deleter to remove this commit.
    pub fn delete(&mut self) {
        self.deleted = true;
    }

    /// Whether a policy asked for this commit to be removed.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }
}

/// Decides which commits survive. Commits are passed oldest first; calling
/// [`IndexCommit::delete`] on one releases its files.
pub trait IndexDeletionPolicy: Send + Sync + std::fmt::Debug {
    /// Called once with the commits found when a deleter starts.
    fn on_init(&self, commits: &mut [IndexCommit]) -> Result<()>;

    /// Called after every new commit.
    fn on_commit(&self, commits: &mut [IndexCommit]) -> Result<()>;
}

/// Keeps only the newest commit.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepOnlyLastCommitDeletionPolicy;

impl IndexDeletionPolicy for KeepOnlyLastCommitDeletionPolicy {
    fn on_init(&self, commits: &mut [IndexCommit]) -> Result<()> {
        self.on_commit(commits)
    }

    fn on_commit(&self, commits: &mut [IndexCommit]) -> Result<()> {
        if let Some((_, older)) = commits.split_last_mut() {
            for commit in older {
                commit.delete();
            }
        }
        Ok(())
    }
}

/// Keeps every commit.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepAllCommitsDeletionPolicy;

impl IndexDeletionPolicy for KeepAllCommitsDeletionPolicy {
    fn on_init(&self, _commits: &mut [IndexCommit]) -> Result<()> {
        Ok(())
    }

    fn on_commit(&self, _commits: &mut [IndexCommit]) -> Result<()> {
        Ok(())
    }
}
