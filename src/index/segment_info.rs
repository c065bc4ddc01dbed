//! Segment metadata and the `segments_N` commit files.
//!
//! A commit is a `segments_<gen>` file (generation in base 36) holding the
//! JSON encoding of [`SegmentInfos`] followed by a little-endian CRC32 of
//! those JSON bytes. The latest commit is the one with the highest
//! generation.

use std::collections::BTreeMap;
use std::io::Write;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{BraidError, Result};
use crate::storage::{Storage, StorageOutput};

/// Prefix of every commit file.
pub const SEGMENTS_PREFIX: &str = "segments_";

/// Extension of a segment data file written in compound mode.
pub const COMPOUND_EXTENSION: &str = "cfs";

/// Extension of a segment data file written in plain mode.
pub const SEGMENT_EXTENSION: &str = "seg";

/// Extension of a deletions file.
pub const DELETES_EXTENSION: &str = "del";

/// Extension of a separate norms file.
pub const NORMS_EXTENSION: &str = "nrm";

const MAX_READ_ATTEMPTS: usize = 3;

/// Encode a number in base 36, as used in file names.
pub fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Name of the commit file for `generation`.
pub fn segments_file_name(generation: u64) -> String {
    format!("{SEGMENTS_PREFIX}{}", to_base36(generation))
}

/// Parse the generation out of a commit file name.
pub fn generation_from_file_name(name: &str) -> Option<u64> {
    let suffix = name.strip_prefix(SEGMENTS_PREFIX)?;
    u64::from_str_radix(suffix, 36).ok()
}

/// Whether `name` is a file this index writes.
pub fn is_index_file(name: &str) -> bool {
    if generation_from_file_name(name).is_some() {
        return true;
    }
    if !name.starts_with('_') {
        return false;
    }
    matches!(
        name.rsplit_once('.').map(|(_, ext)| ext),
        Some(COMPOUND_EXTENSION | SEGMENT_EXTENSION | DELETES_EXTENSION | NORMS_EXTENSION)
    )
}

/// Metadata of one segment.
///
/// Two infos describe the same unchanged segment exactly when they are equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    /// Segment name, e.g. `_3`.
    pub name: String,

    /// Number of documents, deleted ones included.
    pub doc_count: u64,

    /// Generation of the deletions file, if any documents were deleted.
    pub del_gen: Option<u64>,

    /// Generation of the separate norms file, if norms were changed.
    pub norm_gen: Option<u64>,

    /// Whether the segment data lives in a compound file.
    pub use_compound_file: bool,
}

impl SegmentInfo {
    /// Create metadata for a freshly written segment.
    pub fn new<S: Into<String>>(name: S, doc_count: u64, use_compound_file: bool) -> Self {
        SegmentInfo {
            name: name.into(),
            doc_count,
            del_gen: None,
            norm_gen: None,
            use_compound_file,
        }
    }

    /// Name of the segment data file.
    pub fn data_file_name(&self) -> String {
        let ext = if self.use_compound_file {
            COMPOUND_EXTENSION
        } else {
            SEGMENT_EXTENSION
        };
        format!("{}.{ext}", self.name)
    }

    /// Name of the current deletions file.
    pub fn del_file_name(&self) -> Option<String> {
        self.del_gen
            .map(|g| format!("{}_{}.{DELETES_EXTENSION}", self.name, to_base36(g)))
    }

    /// Name of the current separate norms file.
    pub fn norms_file_name(&self) -> Option<String> {
        self.norm_gen
            .map(|g| format!("{}_{}.{NORMS_EXTENSION}", self.name, to_base36(g)))
    }

    /// Whether a deletions file exists for this segment.
    pub fn has_deletions(&self) -> bool {
        self.del_gen.is_some()
    }

    /// Move to the next deletions generation.
    pub fn advance_del_gen(&mut self) {
        self.del_gen = Some(self.del_gen.map_or(1, |g| g + 1));
    }

    /// Move to the next norms generation.
    pub fn advance_norm_gen(&mut self) {
        self.norm_gen = Some(self.norm_gen.map_or(1, |g| g + 1));
    }

    /// Every file this segment references.
    pub fn files(&self) -> Vec<String> {
        let mut files = vec![self.data_file_name()];
        files.extend(self.del_file_name());
        files.extend(self.norms_file_name());
        files
    }
}

/// The list of segments making up one commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfos {
    /// Incremented on every commit.
    pub version: u64,

    /// Generation of the commit file this was read from or last written to.
    pub generation: u64,

    /// Source of new segment names.
    pub counter: u64,

    /// The segments, in doc id order.
    pub segments: Vec<SegmentInfo>,

    /// Opaque data attached by the committer.
    pub user_data: BTreeMap<String, String>,
}

impl Default for SegmentInfos {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentInfos {
    /// An empty, never committed segment list.
    pub fn new() -> Self {
        SegmentInfos {
            version: 0,
            generation: 0,
            counter: 0,
            segments: Vec::new(),
            user_data: BTreeMap::new(),
        }
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether there are no segments.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Total documents across segments, deleted ones included.
    pub fn total_doc_count(&self) -> u64 {
        self.segments.iter().map(|s| s.doc_count).sum()
    }

    /// Name of the commit file this was read from.
    pub fn segments_file_name(&self) -> String {
        segments_file_name(self.generation)
    }

    /// Reserve a new segment name.
    pub fn new_segment_name(&mut self) -> String {
        let name = format!("_{}", to_base36(self.counter));
        self.counter += 1;
        name
    }

    /// Every file of this commit, optionally including the commit file.
    pub fn files(&self, include_segments_file: bool) -> Vec<String> {
        let mut files = Vec::new();
        if include_segments_file && self.generation > 0 {
            files.push(self.segments_file_name());
        }
        for info in &self.segments {
            files.extend(info.files());
        }
        files
    }

    /// Whether the commit has a single segment without deletions.
    pub fn is_optimized(&self) -> bool {
        self.segments.len() == 1 && !self.segments[0].has_deletions()
    }

    /// Highest commit generation present in `storage`.
    pub fn latest_generation(storage: &dyn Storage) -> Result<Option<u64>> {
        Ok(storage
            .list_files()?
            .iter()
            .filter_map(|name| generation_from_file_name(name))
            .max())
    }

    /// Read the commit file with the given name.
    pub fn read(storage: &dyn Storage, file_name: &str) -> Result<Self> {
        let generation = generation_from_file_name(file_name).ok_or_else(|| {
            BraidError::invalid_argument(format!("{file_name} is not a segments file"))
        })?;
        let bytes = storage.read_all(file_name)?;
        if bytes.len() < 4 {
            return Err(BraidError::corrupt(format!("{file_name} is truncated")));
        }

        let (json, checksum) = bytes.split_at(bytes.len() - 4);
        let expected = u32::from_le_bytes([checksum[0], checksum[1], checksum[2], checksum[3]]);
        if crc32fast::hash(json) != expected {
            return Err(BraidError::corrupt(format!("{file_name} checksum mismatch")));
        }

        let infos: SegmentInfos = serde_json::from_slice(json)
            .map_err(|e| BraidError::corrupt(format!("{file_name}: {e}")))?;
        if infos.generation != generation {
            return Err(BraidError::corrupt(format!(
                "{file_name} records generation {}",
                infos.generation
            )));
        }
        Ok(infos)
    }

    /// Read the latest commit.
    ///
    /// A concurrent committer may delete the commit file between listing and
    /// reading it; the read is retried while a newer generation shows up.
    pub fn read_latest(storage: &dyn Storage) -> Result<Self> {
        let mut last_error = None;
        let mut last_generation = None;
        for _ in 0..MAX_READ_ATTEMPTS {
            let generation = Self::latest_generation(storage)?
                .ok_or_else(|| BraidError::index("no segments file found"))?;
            if last_generation == Some(generation) {
                break;
            }
            last_generation = Some(generation);

            match Self::read(storage, &segments_file_name(generation)) {
                Ok(infos) => return Ok(infos),
                Err(e) => {
                    warn!("failed to read segments generation {generation}: {e}");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| BraidError::index("no segments file found")))
    }

    /// Version of the latest commit, or 0 if there is none.
    pub fn read_current_version(storage: &dyn Storage) -> Result<u64> {
        match Self::latest_generation(storage)? {
            Some(_) => Ok(Self::read_latest(storage)?.version),
            None => Ok(0),
        }
    }

    /// Write the next commit file.
    ///
    /// On success the generation and version are advanced and the new file
    /// name returned. On failure they are left untouched and any partial
    /// file is removed.
    pub fn commit(&mut self, storage: &dyn Storage) -> Result<String> {
        let latest = Self::latest_generation(storage)?.unwrap_or(0);
        let mut next = self.clone();
        next.generation = latest.max(self.generation) + 1;
        next.version = self.version + 1;

        let file_name = next.segments_file_name();
        if let Err(e) = next.write_file(storage, &file_name) {
            warn!("failed to write {file_name}: {e}");
            if let Err(cleanup) = storage.delete_file(&file_name) {
                debug!("could not remove partial {file_name}: {cleanup}");
            }
            return Err(e);
        }

        self.generation = next.generation;
        self.version = next.version;
        debug!("committed {file_name} (version {})", self.version);
        Ok(file_name)
    }

    fn write_file(&self, storage: &dyn Storage, file_name: &str) -> Result<()> {
        let mut bytes = serde_json::to_vec(self)?;
        let checksum = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&checksum.to_le_bytes());

        let mut output: Box<dyn StorageOutput> = storage.create_output(file_name)?;
        output.write_all(&bytes)?;
        output.flush_and_sync()?;
        output.close()?;
        storage.sync(&[file_name.to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_base36_names() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(segments_file_name(37), "segments_11");
        assert_eq!(generation_from_file_name("segments_11"), Some(37));
        assert_eq!(generation_from_file_name("segments_"), None);
        assert_eq!(generation_from_file_name("_1.cfs"), None);
    }

    #[test]
    fn test_segment_files() {
        let mut info = SegmentInfo::new("_a", 10, true);
        assert_eq!(info.files(), vec!["_a.cfs"]);

        info.advance_del_gen();
        info.advance_norm_gen();
        info.advance_norm_gen();
        assert_eq!(info.files(), vec!["_a.cfs", "_a_1.del", "_a_2.nrm"]);
        assert!(info.has_deletions());
    }

    #[test]
    fn test_is_index_file() {
        assert!(is_index_file("segments_3"));
        assert!(is_index_file("_0.seg"));
        assert!(is_index_file("_0_1.del"));
        assert!(!is_index_file("write.lock"));
        assert!(!is_index_file("_notes.txt"));
    }

    #[test]
    fn test_commit_and_read_latest() {
        let storage = MemoryStorage::new_default();
        let mut infos = SegmentInfos::new();
        let name = infos.new_segment_name();
        infos.segments.push(SegmentInfo::new(name, 3, false));

        assert_eq!(infos.commit(&storage).unwrap(), "segments_1");
        assert_eq!(infos.commit(&storage).unwrap(), "segments_2");
        assert_eq!(infos.version, 2);

        let read = SegmentInfos::read_latest(&storage).unwrap();
        assert_eq!(read, infos);
        assert_eq!(SegmentInfos::read_current_version(&storage).unwrap(), 2);
    }

    #[test]
    fn test_checksum_mismatch_is_corrupt() {
        let storage = MemoryStorage::new_default();
        let mut infos = SegmentInfos::new();
        infos.commit(&storage).unwrap();

        let mut bytes = storage.read_all("segments_1").unwrap();
        bytes[2] ^= 0x01;
        storage.write_all("segments_1", &bytes).unwrap();

        let err = SegmentInfos::read_latest(&storage).unwrap_err();
        assert!(matches!(err, BraidError::CorruptIndex(_)));
    }

    #[test]
    fn test_failed_commit_leaves_state_untouched() {
        let storage = MemoryStorage::new_default();
        let mut infos = SegmentInfos::new();
        storage.inject_failure("segments_1");

        assert!(infos.commit(&storage).is_err());
        assert_eq!(infos.generation, 0);
        assert_eq!(infos.version, 0);
        assert!(!storage.file_exists("segments_1"));
    }

    #[test]
    fn test_missing_index() {
        let storage = MemoryStorage::new_default();
        assert!(SegmentInfos::read_latest(&storage).is_err());
        assert_eq!(SegmentInfos::read_current_version(&storage).unwrap(), 0);
    }
}
