//! Criterion benchmarks for Braid.
//!
//! Covers the hot paths of the composite reader:
//! - Buffering postings in the slab pool
//! - Merged term enumeration across segments
//! - Merged postings iteration with doc id rebasing

use std::hint::black_box;
use std::sync::Arc;

use braid::config::{PoolConfig, ReaderConfig, WriterConfig};
use braid::document::Document;
use braid::index::{DirectoryReader, IndexReader, IndexWriter, SegmentWriter, Term};
use braid::storage::{MemoryStorage, Storage};
use criterion::{Criterion, Throughput, criterion_group, criterion_main};

const WORDS: [&str; 16] = [
    "segment", "reader", "merge", "term", "posting", "slice", "block", "norm", "commit",
    "reopen", "delete", "field", "payload", "position", "version", "lock",
];

/// Generate test documents for benchmarking.
fn generate_test_documents(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            let doc_length = 8 + i % 24;
            (0..doc_length)
                .map(|j| {
                    let word = WORDS[(i * 7 + j * 13) % WORDS.len()];
                    format!("{word}{}", (i + j) % 50)
                })
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect()
}

/// An index with `segments` segments of `docs_per_segment` documents.
fn build_index(segments: usize, docs_per_segment: usize) -> Arc<dyn Storage> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    let mut writer = IndexWriter::open(Arc::clone(&storage), WriterConfig::default()).unwrap();
    let texts = generate_test_documents(segments * docs_per_segment);
    for batch in texts.chunks(docs_per_segment) {
        for text in batch {
            writer
                .add_document(Document::builder().add_text("body", text.as_str()).build())
                .unwrap();
        }
        writer.flush().unwrap();
    }
    writer.close().unwrap();
    storage
}

/// Benchmark inverting documents into the slab pool.
fn bench_segment_writer(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment_writer");
    let texts = generate_test_documents(1000);

    group.throughput(Throughput::Elements(texts.len() as u64));
    group.bench_function("buffer_and_flush_1000_docs", |b| {
        b.iter(|| {
            let mut writer = SegmentWriter::new(&PoolConfig::default()).unwrap();
            for text in &texts {
                writer
                    .add_document(Document::builder().add_text("body", text.as_str()).build())
                    .unwrap();
            }
            black_box(writer.flush().unwrap())
        })
    });

    group.finish();
}

/// Benchmark merged term enumeration.
fn bench_merged_terms(c: &mut Criterion) {
    let mut group = c.benchmark_group("merged_terms");

    for segments in [1, 8, 32] {
        let storage = build_index(segments, 200);
        let reader = DirectoryReader::open(storage, ReaderConfig::default()).unwrap();

        group.bench_function(format!("enumerate_{segments}_segments"), |b| {
            b.iter(|| {
                let mut terms = reader.terms().unwrap();
                let mut total = 0u64;
                while terms.next().unwrap() {
                    total += u64::from(terms.doc_freq());
                }
                black_box(total)
            })
        });
    }

    group.finish();
}

/// Benchmark merged postings iteration.
fn bench_merged_postings(c: &mut Criterion) {
    let mut group = c.benchmark_group("merged_postings");
    let storage = build_index(16, 500);
    let reader = DirectoryReader::open(storage, ReaderConfig::default()).unwrap();
    let term = Term::new("body", "segment0");

    group.bench_function("iterate_term_docs", |b| {
        b.iter(|| {
            let mut docs = reader.term_docs_for(black_box(&term)).unwrap();
            let mut count = 0;
            while docs.next().unwrap() {
                count += docs.freq();
            }
            black_box(count)
        })
    });

    group.bench_function("bulk_read", |b| {
        let mut ids = vec![0; 64];
        let mut freqs = vec![0; 64];
        b.iter(|| {
            let mut docs = reader.term_docs_for(black_box(&term)).unwrap();
            let mut count = 0;
            loop {
                let n = docs.read(&mut ids, &mut freqs).unwrap();
                if n == 0 {
                    break;
                }
                count += n;
            }
            black_box(count)
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_segment_writer,
    bench_merged_terms,
    bench_merged_postings
);

criterion_main!(benches);
