//! Buffers added documents into an in-memory segment.
//!
//! Every term gets two byte streams in the shared [`ByteBlockPool`]: one for
//! documents and frequencies, one for positions and payloads. The current
//! write address of each stream lives in the [`IntBlockPool`], two ints per
//! term. A term's entry for a document is written once the next document
//! containing the term arrives, or at flush.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;
use log::debug;

use crate::DocId;
use crate::config::PoolConfig;
use crate::document::Document;
use crate::error::{BraidError, Result};
use crate::index::norms::{default_norm, length_norm};
use crate::index::postings::{FieldInfo, SegmentData, TermEntry, TermFreqVector};
use crate::index::term::Term;
use crate::pool::{
    ByteBlockPool, ByteSliceReader, ByteSliceWriter, IntBlockPool, RecyclingBlockAllocator,
};
use crate::util::push_u32;

const FREQ_STREAM: usize = 0;
const PROX_STREAM: usize = 1;

#[derive(Debug)]
struct PostingList {
    /// Address of this term's two stream write addresses in the int pool.
    int_start: usize,
    freq_start: usize,
    prox_start: usize,
    doc_freq: u32,
    last_doc: DocId,
    /// Document and frequency not yet written to the freq stream.
    pending: Option<(DocId, u32)>,
    last_position: u32,
}

/// In-memory builder of one segment.
#[derive(Debug)]
pub struct SegmentWriter {
    byte_pool: ByteBlockPool,
    int_pool: IntBlockPool,
    postings: AHashMap<Term, PostingList>,
    fields: BTreeMap<String, FieldInfo>,
    documents: Vec<Document>,
    norms: BTreeMap<String, Vec<u8>>,
    term_vectors: Vec<Vec<TermFreqVector>>,
}

impl SegmentWriter {
    /// An empty buffer with pools sized by `config`. Fails when the byte
    /// block size cannot hold the largest slice.
    pub fn new(config: &PoolConfig) -> Result<Self> {
        let bytes = Arc::new(RecyclingBlockAllocator::<u8>::new(
            config.byte_block_size,
            config.max_buffered_blocks,
        ));
        let ints = Arc::new(RecyclingBlockAllocator::<u32>::new(
            config.int_block_size,
            config.max_buffered_blocks,
        ));
        Ok(SegmentWriter {
            byte_pool: ByteBlockPool::new(bytes)?,
            int_pool: IntBlockPool::new(ints),
            postings: AHashMap::new(),
            fields: BTreeMap::new(),
            documents: Vec::new(),
            norms: BTreeMap::new(),
            term_vectors: Vec::new(),
        })
    }

    /// Number of buffered documents.
    pub fn num_docs(&self) -> usize {
        self.documents.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Number of distinct buffered terms.
    pub fn num_terms(&self) -> usize {
        self.postings.len()
    }

    /// Invert and buffer `doc`.
    pub fn add_document(&mut self, doc: Document) -> Result<DocId> {
        let doc_id = self.documents.len() as DocId;
        let mut names: Vec<&String> = doc.fields().keys().collect();
        names.sort();

        let mut vectors = Vec::new();
        for name in names {
            let Some(value) = doc.get_field(name) else {
                continue;
            };
            let info = self
                .fields
                .entry(name.clone())
                .or_insert_with(|| FieldInfo {
                    name: name.clone(),
                    indexed: false,
                    has_norms: false,
                    stores_payloads: false,
                });
            if !value.is_indexed() {
                continue;
            }
            info.indexed = true;
            info.has_norms = true;

            let mut position: i64 = -1;
            let mut count = 0;
            let mut occurrences: BTreeMap<String, Vec<u32>> = BTreeMap::new();
            for token in value.tokens() {
                position += i64::from(token.position_increment);
                let payload = token.payload.as_deref().filter(|p| !p.is_empty());
                if payload.is_some()
                    && let Some(info) = self.fields.get_mut(name.as_str())
                {
                    info.stores_payloads = true;
                }
                let at = position.max(0) as u32;
                occurrences
                    .entry(token.text.clone())
                    .or_default()
                    .push(at);
                self.add_occurrence(Term::new(name.as_str(), token.text), doc_id, at, payload)?;
                count += 1;
            }
            if !occurrences.is_empty() {
                vectors.push(term_vector(name, occurrences));
            }

            let norms = self.norms.entry(name.clone()).or_default();
            norms.resize(doc_id as usize, default_norm());
            norms.push(length_norm(count));
        }

        for norms in self.norms.values_mut() {
            norms.resize(doc_id as usize + 1, default_norm());
        }
        self.term_vectors.push(vectors);
        self.documents.push(doc);
        Ok(doc_id)
    }

    fn new_posting(&mut self) -> Result<PostingList> {
        let int_start = self.int_pool.alloc(2)?;
        let freq = ByteSliceWriter::start(&mut self.byte_pool)?;
        let prox = ByteSliceWriter::start(&mut self.byte_pool)?;
        self.int_pool
            .set(int_start + FREQ_STREAM, pool_address(freq.address())?);
        self.int_pool
            .set(int_start + PROX_STREAM, pool_address(prox.address())?);
        Ok(PostingList {
            int_start,
            freq_start: freq.address(),
            prox_start: prox.address(),
            doc_freq: 0,
            last_doc: 0,
            pending: None,
            last_position: 0,
        })
    }

    fn add_occurrence(
        &mut self,
        term: Term,
        doc: DocId,
        position: u32,
        payload: Option<&[u8]>,
    ) -> Result<()> {
        if !self.postings.contains_key(&term) {
            let posting = self.new_posting()?;
            self.postings.insert(term.clone(), posting);
        }
        let posting = self
            .postings
            .get_mut(&term)
            .ok_or_else(|| BraidError::index(format!("posting list for {term} vanished")))?;

        match posting.pending {
            Some((pending_doc, freq)) if pending_doc == doc => {
                posting.pending = Some((doc, freq + 1));
            }
            previous => {
                if let Some((pending_doc, freq)) = previous {
                    let delta = doc_delta(pending_doc, posting.last_doc)?;
                    let address = posting.int_start + FREQ_STREAM;
                    let mut writer = ByteSliceWriter::at(self.int_pool.get(address) as usize);
                    writer.write_vint(&mut self.byte_pool, delta)?;
                    writer.write_vint(&mut self.byte_pool, freq)?;
                    self.int_pool.set(address, pool_address(writer.address())?);
                    posting.last_doc = pending_doc;
                }
                posting.pending = Some((doc, 1));
                posting.doc_freq += 1;
                posting.last_position = 0;
            }
        }

        let address = posting.int_start + PROX_STREAM;
        let mut writer = ByteSliceWriter::at(self.int_pool.get(address) as usize);
        let delta = position.saturating_sub(posting.last_position);
        match payload {
            Some(bytes) => {
                writer.write_vint(&mut self.byte_pool, (delta << 1) | 1)?;
                writer.write_vint(&mut self.byte_pool, bytes.len() as u32)?;
                writer.write_bytes(&mut self.byte_pool, bytes)?;
            }
            None => writer.write_vint(&mut self.byte_pool, delta << 1)?,
        }
        self.int_pool.set(address, pool_address(writer.address())?);
        posting.last_position = position;
        Ok(())
    }

    /// Read every stream back into a sorted segment and reset the buffer.
    pub fn flush(&mut self) -> Result<SegmentData> {
        let mut postings: Vec<(Term, PostingList)> = self.postings.drain().collect();
        postings.sort_by(|a, b| a.0.cmp(&b.0));

        let mut terms = Vec::with_capacity(postings.len());
        for (term, posting) in postings {
            let freq_end = self.int_pool.get(posting.int_start + FREQ_STREAM) as usize;
            let prox_end = self.int_pool.get(posting.int_start + PROX_STREAM) as usize;

            let mut freq = Vec::new();
            ByteSliceReader::new(&self.byte_pool, posting.freq_start, freq_end)?
                .write_to(&mut freq)?;
            if let Some((doc, doc_freq)) = posting.pending {
                push_u32(&mut freq, doc_delta(doc, posting.last_doc)?);
                push_u32(&mut freq, doc_freq);
            }

            let mut prox = Vec::new();
            ByteSliceReader::new(&self.byte_pool, posting.prox_start, prox_end)?
                .write_to(&mut prox)?;

            terms.push(TermEntry {
                term,
                doc_freq: posting.doc_freq,
                freq,
                prox,
            });
        }

        let data = SegmentData {
            max_doc: self.documents.len() as u64,
            fields: std::mem::take(&mut self.fields).into_values().collect(),
            terms,
            documents: std::mem::take(&mut self.documents),
            norms: std::mem::take(&mut self.norms),
            term_vectors: std::mem::take(&mut self.term_vectors),
        };
        debug!(
            "flushed {} docs, {} terms, {} pool blocks",
            data.max_doc,
            data.terms.len(),
            self.byte_pool.num_blocks()
        );
        self.byte_pool.reset();
        self.int_pool.reset();
        Ok(data)
    }
}

fn term_vector(field: &str, occurrences: BTreeMap<String, Vec<u32>>) -> TermFreqVector {
    let mut vector = TermFreqVector {
        field: field.to_string(),
        ..Default::default()
    };
    for (text, mut positions) in occurrences {
        positions.sort_unstable();
        vector.terms.push(text);
        vector.freqs.push(positions.len() as u32);
        vector.positions.push(positions);
    }
    vector
}

fn doc_delta(doc: DocId, last: DocId) -> Result<u32> {
    u32::try_from(doc - last)
        .map_err(|_| BraidError::invalid_argument(format!("doc gap {} too large", doc - last)))
}

fn pool_address(address: usize) -> Result<u32> {
    u32::try_from(address)
        .map_err(|_| BraidError::index(format!("pool address {address} exceeds 4GB")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Token;
    use crate::index::norms::encode_norm;
    use crate::util::ByteCursor;

    fn small_pools() -> PoolConfig {
        PoolConfig::default()
            .with_byte_block_size(256)
            .with_int_block_size(16)
    }

    #[test]
    fn test_byte_block_must_hold_largest_slice() {
        let config = small_pools().with_byte_block_size(64);
        assert!(matches!(
            SegmentWriter::new(&config),
            Err(BraidError::InvalidArgument(_))
        ));

        let mut writer = SegmentWriter::new(&small_pools().with_byte_block_size(200)).unwrap();
        let text = vec!["w"; 200].join(" ");
        writer
            .add_document(Document::builder().add_text("body", text).build())
            .unwrap();
        let data = writer.flush().unwrap();
        assert_eq!(data.terms[0].doc_freq, 1);
    }

    fn decode_docs(entry: &TermEntry) -> Vec<(DocId, u32)> {
        let mut cursor = ByteCursor::new(&entry.freq, 0);
        let mut doc = 0;
        let mut out = Vec::new();
        while !cursor.is_at_end() {
            doc += u64::from(cursor.read_vint().unwrap());
            out.push((doc, cursor.read_vint().unwrap()));
        }
        out
    }

    #[test]
    fn test_flush_sorts_terms_and_encodes_docs() {
        let mut writer = SegmentWriter::new(&small_pools()).unwrap();
        writer
            .add_document(Document::builder().add_text("body", "b a b").build())
            .unwrap();
        writer
            .add_document(Document::builder().add_integer("n", 1).build())
            .unwrap();
        writer
            .add_document(Document::builder().add_text("body", "b").build())
            .unwrap();

        let data = writer.flush().unwrap();
        assert_eq!(data.max_doc, 3);
        let texts: Vec<&str> = data.terms.iter().map(|t| t.term.text()).collect();
        assert_eq!(texts, vec!["a", "b"]);

        let b = &data.terms[1];
        assert_eq!(b.doc_freq, 2);
        assert_eq!(decode_docs(b), vec![(0, 2), (2, 1)]);

        let mut prox = ByteCursor::new(&b.prox, 0);
        assert_eq!(prox.read_vint().unwrap(), 0);
        assert_eq!(prox.read_vint().unwrap(), 2 << 1);
        assert_eq!(prox.read_vint().unwrap(), 0);
        assert!(prox.is_at_end());

        assert_eq!(
            data.norms["body"],
            vec![length_norm(3), default_norm(), encode_norm(1.0)]
        );
        assert!(writer.is_empty());
        assert_eq!(writer.num_terms(), 0);
    }

    #[test]
    fn test_term_vectors_per_document() {
        let mut writer = SegmentWriter::new(&small_pools()).unwrap();
        writer
            .add_document(
                Document::builder()
                    .add_text("title", "b a b")
                    .add_keyword("id", "x1")
                    .add_integer("n", 7)
                    .build(),
            )
            .unwrap();
        writer
            .add_document(Document::builder().add_integer("n", 8).build())
            .unwrap();

        let data = writer.flush().unwrap();
        data.validate().unwrap();
        assert_eq!(data.term_vectors.len(), 2);
        assert!(data.term_vectors[1].is_empty());

        let vectors = &data.term_vectors[0];
        let fields: Vec<&str> = vectors.iter().map(|v| v.field.as_str()).collect();
        assert_eq!(fields, vec!["id", "title"]);
        let title = &vectors[1];
        assert_eq!(title.terms, vec!["a", "b"]);
        assert_eq!(title.freqs, vec![1, 2]);
        assert_eq!(title.positions, vec![vec![1], vec![0, 2]]);
        assert_eq!(title.freq("b"), 2);
        assert_eq!(title.freq("c"), 0);
    }

    #[test]
    fn test_payloads_are_flagged() {
        let mut writer = SegmentWriter::new(&small_pools()).unwrap();
        let tokens = vec![
            Token::new("x"),
            Token::new("x").with_payload(vec![9]),
        ];
        writer
            .add_document(Document::builder().add_tokens("f", tokens).build())
            .unwrap();

        let data = writer.flush().unwrap();
        assert!(data.fields[0].stores_payloads);
        let mut prox = ByteCursor::new(&data.terms[0].prox, 0);
        assert_eq!(prox.read_vint().unwrap(), 0);
        assert_eq!(prox.read_vint().unwrap(), (1 << 1) | 1);
        assert_eq!(prox.read_vint().unwrap(), 1);
        assert_eq!(prox.read_bytes(1).unwrap(), &[9]);
    }

    #[test]
    fn test_many_docs_cross_blocks() {
        let mut writer = SegmentWriter::new(&small_pools()).unwrap();
        for i in 0..300 {
            let text = if i % 3 == 0 { "common rare" } else { "common" };
            writer
                .add_document(Document::builder().add_text("body", text).build())
                .unwrap();
        }
        let data = writer.flush().unwrap();
        data.validate().unwrap();

        let common = &data.terms[0];
        assert_eq!(common.term.text(), "common");
        let docs = decode_docs(common);
        assert_eq!(docs.len(), 300);
        assert!(docs.iter().enumerate().all(|(i, &(d, f))| d == i as u64 && f == 1));

        let rare = decode_docs(&data.terms[1]);
        assert_eq!(rare.len(), 100);
        assert_eq!(rare[99], (297, 1));
    }
}
