//! Reader over a single segment.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bit_vec::BitVec;
use log::debug;
use parking_lot::Mutex;

use crate::DocId;
use crate::document::Document;
use crate::error::{BraidError, Result};
use crate::index::norms::fake_norms;
use crate::index::postings::{
    SegmentData, SegmentPostings, SegmentTermEnum, TermDocs, TermEnum, TermFreqVector,
    TermPositions,
};
use crate::index::reader::{IndexReader, RefCount, next_reader_id};
use crate::index::segment_info::{SegmentInfo, SegmentInfos};
use crate::index::term::Term;
use crate::storage::Storage;

/// The immutable part of a segment: terms, postings, stored documents and
/// the norms written with the segment. Shared by every reader opened on the
/// segment through reopen or clone.
#[derive(Debug)]
pub struct SegmentCore {
    id: u64,
    name: String,
    data: SegmentData,
    base_norms: BTreeMap<String, Arc<[u8]>>,
    ref_count: RefCount,
}

impl SegmentCore {
    /// Load the data file of `info`.
    pub fn open(storage: &dyn Storage, info: &SegmentInfo) -> Result<Arc<Self>> {
        let file_name = info.data_file_name();
        let bytes = storage.read_all(&file_name)?;
        let mut data: SegmentData = bincode::deserialize(&bytes)
            .map_err(|e| BraidError::corrupt(format!("{file_name}: {e}")))?;
        data.validate()?;
        if data.max_doc != info.doc_count {
            return Err(BraidError::corrupt(format!(
                "{file_name} holds {} documents but the commit records {}",
                data.max_doc, info.doc_count
            )));
        }

        let base_norms = std::mem::take(&mut data.norms)
            .into_iter()
            .map(|(field, bytes)| (field, Arc::from(bytes)))
            .collect();
        debug!("opened segment {} ({} docs)", info.name, data.max_doc);

        Ok(Arc::new(SegmentCore {
            id: next_reader_id(),
            name: info.name.clone(),
            data,
            base_norms,
            ref_count: RefCount::new(),
        }))
    }

    /// Build a core from data already in memory.
    pub fn from_data<S: Into<String>>(name: S, mut data: SegmentData) -> Result<Arc<Self>> {
        data.validate()?;
        let base_norms = std::mem::take(&mut data.norms)
            .into_iter()
            .map(|(field, bytes)| (field, Arc::from(bytes)))
            .collect();
        Ok(Arc::new(SegmentCore {
            id: next_reader_id(),
            name: name.into(),
            data,
            base_norms,
            ref_count: RefCount::new(),
        }))
    }

    /// Unique id of this core.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The decoded segment.
    pub fn data(&self) -> &SegmentData {
        &self.data
    }

    /// Number of readers holding this core.
    pub fn ref_count(&self) -> usize {
        self.ref_count.get()
    }

    /// Whether every reader holding this core has been released.
    pub fn is_released(&self) -> bool {
        self.ref_count.get() == 0
    }

    fn inc_ref(&self) -> Result<()> {
        self.ref_count.inc()
    }

    fn dec_ref(&self) -> Result<()> {
        if self.ref_count.dec()? {
            debug!("released segment core {}", self.name);
        }
        Ok(())
    }

    fn has_norms(&self, field: &str) -> bool {
        self.base_norms.contains_key(field)
            || self
                .data
                .fields
                .iter()
                .any(|f| f.name == field && f.has_norms)
    }
}

#[derive(Debug, Clone)]
struct CommitSnapshot {
    info: SegmentInfo,
    deleted_dirty: bool,
    norms_dirty: bool,
}

#[derive(Debug)]
struct SegmentState {
    info: SegmentInfo,
    deleted: Option<Arc<BitVec>>,
    del_count: u64,
    deleted_dirty: bool,
    norms: BTreeMap<String, Arc<[u8]>>,
    norms_dirty: bool,
    rollback: Option<CommitSnapshot>,
}

impl SegmentState {
    fn has_changes(&self) -> bool {
        self.deleted_dirty || self.norms_dirty
    }
}

/// A reference counted reader over one segment.
///
/// Deletions and changed norms are copy-on-write: clones and reopened
/// readers share them until one side modifies its copy.
#[derive(Debug)]
pub struct SegmentReader {
    core: Arc<SegmentCore>,
    storage: Arc<dyn Storage>,
    read_only: bool,
    disable_fake_norms: AtomicBool,
    state: Mutex<SegmentState>,
    ref_count: RefCount,
    closed: AtomicBool,
}

impl SegmentReader {
    /// Open the segment described by `info`.
    pub fn open(storage: Arc<dyn Storage>, info: &SegmentInfo, read_only: bool) -> Result<Arc<Self>> {
        let core = SegmentCore::open(storage.as_ref(), info)?;
        let (deleted, del_count) = load_deletions(storage.as_ref(), info, core.data.max_doc)?;
        let norms = load_norms(storage.as_ref(), info, &core)?;

        Ok(Arc::new(SegmentReader {
            core,
            storage,
            read_only,
            disable_fake_norms: AtomicBool::new(false),
            state: Mutex::new(SegmentState {
                info: info.clone(),
                deleted,
                del_count,
                deleted_dirty: false,
                norms,
                norms_dirty: false,
                rollback: None,
            }),
            ref_count: RefCount::new(),
            closed: AtomicBool::new(false),
        }))
    }

    /// The shared immutable core.
    pub fn core(&self) -> &Arc<SegmentCore> {
        &self.core
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Current metadata, including generations written by `commit_changes`.
    pub fn segment_info(&self) -> SegmentInfo {
        self.state.lock().info.clone()
    }

    /// Whether this reader rejects mutations.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Return `None` from [`norms`](IndexReader::norms) for fields without
    /// norms instead of all-default norms.
    pub fn set_disable_fake_norms(&self, disable: bool) {
        self.disable_fake_norms.store(disable, Ordering::Relaxed);
    }

    /// The norms array currently backing `field`. Two readers return the
    /// same `Arc` exactly when they share unchanged norms.
    pub fn norms_handle(&self, field: &str) -> Option<Arc<[u8]>> {
        self.state.lock().norms.get(field).cloned()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.ref_count.get() == 0 {
            return Err(BraidError::already_closed(format!(
                "segment reader {} is closed",
                self.name()
            )));
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.read_only {
            return Err(BraidError::read_only(format!(
                "segment reader {} does not support modifications",
                self.name()
            )));
        }
        Ok(())
    }

    fn check_doc(&self, doc: DocId) -> Result<usize> {
        let max_doc = self.core.data.max_doc;
        if doc >= max_doc {
            return Err(BraidError::invalid_argument(format!(
                "doc {doc} out of range for segment {} with {max_doc} documents",
                self.name()
            )));
        }
        Ok(doc as usize)
    }

    /// A reader on `info`, which must describe this segment.
    ///
    /// Returns this very instance when deletions and norms are unchanged, no
    /// clone was asked for and both readers are read-only. Otherwise the new
    /// reader shares the core and every unchanged deletions and norms array.
    /// When the new reader is writable it takes over this reader's pending
    /// changes.
    pub fn reopen_segment(
        self: &Arc<Self>,
        info: &SegmentInfo,
        do_clone: bool,
        read_only: bool,
    ) -> Result<Arc<SegmentReader>> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if info.name != state.info.name || info.use_compound_file != state.info.use_compound_file {
            return Err(BraidError::invalid_argument(format!(
                "cannot reopen segment {} as {}",
                state.info.name, info.name
            )));
        }

        let deletions_up_to_date = state.info.del_gen == info.del_gen;
        let norms_up_to_date = state.info.norm_gen == info.norm_gen;
        if deletions_up_to_date && norms_up_to_date && !do_clone && read_only && self.read_only {
            return Ok(Arc::clone(self));
        }

        let (deleted, del_count) = if do_clone || deletions_up_to_date {
            (state.deleted.clone(), state.del_count)
        } else {
            load_deletions(self.storage.as_ref(), info, self.core.data.max_doc)?
        };
        let norms = if do_clone || norms_up_to_date {
            state.norms.clone()
        } else {
            load_norms(self.storage.as_ref(), info, &self.core)?
        };

        self.core.inc_ref()?;
        let mut new_state = SegmentState {
            info: info.clone(),
            deleted,
            del_count,
            deleted_dirty: false,
            norms,
            norms_dirty: false,
            rollback: None,
        };
        if !read_only && state.has_changes() {
            new_state.deleted_dirty = std::mem::take(&mut state.deleted_dirty);
            new_state.norms_dirty = std::mem::take(&mut state.norms_dirty);
        }
        debug!(
            "reopened segment {} (clone: {do_clone}, read-only: {read_only})",
            info.name
        );

        Ok(Arc::new(SegmentReader {
            core: Arc::clone(&self.core),
            storage: Arc::clone(&self.storage),
            read_only,
            disable_fake_norms: AtomicBool::new(self.disable_fake_norms.load(Ordering::Relaxed)),
            state: Mutex::new(new_state),
            ref_count: RefCount::new(),
            closed: AtomicBool::new(false),
        }))
    }

    /// Remember the current metadata so a failed commit can restore it.
    pub fn start_commit(&self) {
        let mut state = self.state.lock();
        state.rollback = Some(CommitSnapshot {
            info: state.info.clone(),
            deleted_dirty: state.deleted_dirty,
            norms_dirty: state.norms_dirty,
        });
    }

    /// Restore the metadata saved by [`start_commit`](Self::start_commit).
    pub fn rollback_commit(&self) {
        let mut state = self.state.lock();
        if let Some(snapshot) = state.rollback.take() {
            state.info = snapshot.info;
            state.deleted_dirty = snapshot.deleted_dirty;
            state.norms_dirty = snapshot.norms_dirty;
        }
    }

    /// Write pending deletions and norms as new generation files and return
    /// their names. The updated [`segment_info`](Self::segment_info) only
    /// takes effect once a commit file references it.
    pub fn commit_changes(&self) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        let mut written = Vec::new();

        if state.deleted_dirty {
            match state.deleted.clone() {
                Some(bits) if state.del_count > 0 => {
                    state.info.advance_del_gen();
                    let file_name = state.info.del_file_name().ok_or_else(|| {
                        BraidError::index("deletions generation missing after advance")
                    })?;
                    let bytes = bincode::serialize(&(bits.len() as u64, bits.to_bytes()))?;
                    self.storage.write_all(&file_name, &bytes)?;
                    written.push(file_name);
                }
                _ => state.info.del_gen = None,
            }
            state.deleted_dirty = false;
        }

        if state.norms_dirty {
            let overrides: BTreeMap<&str, &[u8]> = state
                .norms
                .iter()
                .filter(|(field, bytes)| {
                    self.core
                        .base_norms
                        .get(field.as_str())
                        .is_none_or(|base| !Arc::ptr_eq(base, bytes))
                })
                .map(|(field, bytes)| (field.as_str(), &bytes[..]))
                .collect();
            if overrides.is_empty() {
                state.info.norm_gen = None;
            } else {
                let bytes = bincode::serialize(&overrides)?;
                state.info.advance_norm_gen();
                let file_name = state
                    .info
                    .norms_file_name()
                    .ok_or_else(|| BraidError::index("norms generation missing after advance"))?;
                self.storage.write_all(&file_name, &bytes)?;
                written.push(file_name);
            }
            state.norms_dirty = false;
        }

        if !written.is_empty() {
            debug!("segment {} wrote {:?}", state.info.name, written);
        }
        Ok(written)
    }

    fn release(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.deleted = None;
            state.norms.clear();
        }
        debug!("closed segment reader {}", self.name());
        self.core.dec_ref()
    }
}

fn load_deletions(
    storage: &dyn Storage,
    info: &SegmentInfo,
    max_doc: u64,
) -> Result<(Option<Arc<BitVec>>, u64)> {
    let Some(file_name) = info.del_file_name() else {
        return Ok((None, 0));
    };
    let bytes = storage.read_all(&file_name)?;
    let (len, image): (u64, Vec<u8>) = bincode::deserialize(&bytes)
        .map_err(|e| BraidError::corrupt(format!("{file_name}: {e}")))?;
    if len != max_doc || (image.len() as u64) * 8 < len {
        return Err(BraidError::corrupt(format!(
            "{file_name} covers {len} documents, expected {max_doc}"
        )));
    }
    let mut bits = BitVec::from_bytes(&image);
    bits.truncate(len as usize);
    let del_count = bits.iter().filter(|deleted| *deleted).count() as u64;
    Ok((Some(Arc::new(bits)), del_count))
}

fn load_norms(
    storage: &dyn Storage,
    info: &SegmentInfo,
    core: &SegmentCore,
) -> Result<BTreeMap<String, Arc<[u8]>>> {
    let mut norms = core.base_norms.clone();
    let Some(file_name) = info.norms_file_name() else {
        return Ok(norms);
    };
    let bytes = storage.read_all(&file_name)?;
    let overrides: BTreeMap<String, Vec<u8>> = bincode::deserialize(&bytes)
        .map_err(|e| BraidError::corrupt(format!("{file_name}: {e}")))?;
    for (field, bytes) in overrides {
        if bytes.len() as u64 != core.data.max_doc {
            return Err(BraidError::corrupt(format!(
                "{file_name}: norms of {field} cover {} documents",
                bytes.len()
            )));
        }
        norms.insert(field, Arc::from(bytes));
    }
    Ok(norms)
}

impl IndexReader for SegmentReader {
    fn max_doc(&self) -> u64 {
        self.core.data.max_doc
    }

    fn num_docs(&self) -> u64 {
        self.core.data.max_doc - self.state.lock().del_count
    }

    fn has_deletions(&self) -> bool {
        self.state.lock().deleted.is_some()
    }

    fn is_deleted(&self, doc: DocId) -> Result<bool> {
        let doc = self.check_doc(doc)?;
        let state = self.state.lock();
        Ok(state
            .deleted
            .as_ref()
            .is_some_and(|bits| bits.get(doc).unwrap_or(false)))
    }

    fn document(&self, doc: DocId) -> Result<Document> {
        self.ensure_open()?;
        if self.is_deleted(doc)? {
            return Err(BraidError::invalid_argument(format!(
                "doc {doc} of segment {} is deleted",
                self.name()
            )));
        }
        Ok(self.core.data.documents[doc as usize].clone())
    }

    fn term_freq_vectors(&self, doc: DocId) -> Result<Vec<TermFreqVector>> {
        self.ensure_open()?;
        let doc = self.check_doc(doc)?;
        Ok(self.core.data.term_vectors[doc].clone())
    }

    fn term_freq_vector(&self, doc: DocId, field: &str) -> Result<Option<TermFreqVector>> {
        self.ensure_open()?;
        let doc = self.check_doc(doc)?;
        Ok(self.core.data.term_vectors[doc]
            .iter()
            .find(|vector| vector.field == field)
            .cloned())
    }

    fn terms(&self) -> Result<Box<dyn TermEnum>> {
        self.ensure_open()?;
        Ok(Box::new(SegmentTermEnum::new(Arc::clone(&self.core))))
    }

    fn terms_from(&self, term: &Term) -> Result<Box<dyn TermEnum>> {
        self.ensure_open()?;
        Ok(Box::new(SegmentTermEnum::starting_at(
            Arc::clone(&self.core),
            term,
        )))
    }

    fn doc_freq(&self, term: &Term) -> Result<u32> {
        self.ensure_open()?;
        let data = &self.core.data;
        Ok(data.find(term).map_or(0, |i| data.terms[i].doc_freq))
    }

    fn term_docs(&self) -> Result<Box<dyn TermDocs>> {
        self.ensure_open()?;
        let deleted = self.state.lock().deleted.clone();
        Ok(Box::new(SegmentPostings::new(Arc::clone(&self.core), deleted)))
    }

    fn term_positions(&self) -> Result<Box<dyn TermPositions>> {
        self.ensure_open()?;
        let deleted = self.state.lock().deleted.clone();
        Ok(Box::new(SegmentPostings::new(Arc::clone(&self.core), deleted)))
    }

    fn field_names(&self) -> Result<BTreeSet<String>> {
        self.ensure_open()?;
        Ok(self.core.data.fields.iter().map(|f| f.name.clone()).collect())
    }

    fn has_norms(&self, field: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.state.lock().norms.contains_key(field) || self.core.has_norms(field))
    }

    fn norms(&self, field: &str) -> Result<Option<Arc<[u8]>>> {
        self.ensure_open()?;
        if let Some(bytes) = self.state.lock().norms.get(field) {
            return Ok(Some(Arc::clone(bytes)));
        }
        if self.disable_fake_norms.load(Ordering::Relaxed) {
            Ok(None)
        } else {
            Ok(Some(fake_norms(self.core.data.max_doc as usize)))
        }
    }

    fn norms_into(&self, field: &str, buf: &mut [u8], offset: usize) -> Result<()> {
        self.ensure_open()?;
        let max_doc = self.core.data.max_doc as usize;
        let target = buf.get_mut(offset..offset + max_doc).ok_or_else(|| {
            BraidError::invalid_argument(format!(
                "norms buffer too small for segment {} at offset {offset}",
                self.name()
            ))
        })?;
        match self.state.lock().norms.get(field) {
            Some(bytes) => target.copy_from_slice(bytes),
            None => target.fill(crate::index::norms::default_norm()),
        }
        Ok(())
    }

    fn delete_document(&self, doc: DocId) -> Result<()> {
        self.ensure_writable()?;
        let doc = self.check_doc(doc)?;
        let max_doc = self.core.data.max_doc as usize;
        let mut state = self.state.lock();
        let bits = state
            .deleted
            .get_or_insert_with(|| Arc::new(BitVec::from_elem(max_doc, false)));
        let bits = Arc::make_mut(bits);
        let newly_deleted = !bits.get(doc).unwrap_or(false);
        if newly_deleted {
            bits.set(doc, true);
            state.del_count += 1;
        }
        state.deleted_dirty = true;
        Ok(())
    }

    fn undelete_all(&self) -> Result<()> {
        self.ensure_writable()?;
        let mut state = self.state.lock();
        state.deleted = None;
        state.del_count = 0;
        state.deleted_dirty = true;
        Ok(())
    }

    fn set_norm(&self, doc: DocId, field: &str, value: u8) -> Result<()> {
        self.ensure_writable()?;
        let doc = self.check_doc(doc)?;
        let mut state = self.state.lock();
        let Some(norms) = state.norms.get_mut(field) else {
            return Ok(());
        };
        match Arc::get_mut(norms) {
            Some(bytes) => bytes[doc] = value,
            None => {
                let mut bytes = norms.to_vec();
                bytes[doc] = value;
                *norms = Arc::from(bytes);
            }
        }
        state.norms_dirty = true;
        Ok(())
    }

    fn has_changes(&self) -> bool {
        self.state.lock().has_changes()
    }

    /// Writes the pending deletions and norms files. User data belongs to
    /// commit files and is ignored here.
    fn commit(&self, _user_data: Option<BTreeMap<String, String>>) -> Result<()> {
        self.ensure_open()?;
        if self.has_changes() {
            self.commit_changes()?;
        }
        Ok(())
    }

    fn version(&self) -> Result<u64> {
        Err(BraidError::other(
            "a segment reader does not track commit versions",
        ))
    }

    fn is_current(&self) -> Result<bool> {
        self.ensure_open()?;
        if SegmentInfos::latest_generation(self.storage.as_ref())?.is_none() {
            return Ok(false);
        }
        let latest = SegmentInfos::read_latest(self.storage.as_ref())?;
        let state = self.state.lock();
        Ok(latest.segments.iter().any(|info| *info == state.info))
    }

    fn is_optimized(&self) -> bool {
        !self.has_deletions()
    }

    fn sequential_sub_readers(&self) -> Vec<Arc<dyn IndexReader>> {
        Vec::new()
    }

    fn reopen(self: Arc<Self>) -> Result<Arc<dyn IndexReader>> {
        self.ensure_open()?;
        let latest = SegmentInfos::read_latest(self.storage.as_ref())?;
        match latest.segments.iter().find(|info| info.name == self.name()) {
            Some(info) => {
                let read_only = self.read_only;
                Ok(self.reopen_segment(info, false, read_only)?)
            }
            None => Ok(self),
        }
    }

    fn clone_reader(self: Arc<Self>, read_only: bool) -> Result<Arc<dyn IndexReader>> {
        let info = self.segment_info();
        Ok(self.reopen_segment(&info, true, read_only)?)
    }

    fn ref_count(&self) -> usize {
        self.ref_count.get()
    }

    fn inc_ref(&self) -> Result<()> {
        self.ref_count.inc()
    }

    fn dec_ref(&self) -> Result<()> {
        if self.ref_count.dec()? {
            self.release()?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.dec_ref()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
