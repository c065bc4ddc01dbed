#[cfg(test)]
mod tests {
    use braid::config::{ReaderConfig, WriterConfig};
    use braid::document::Document;
    use braid::error::BraidError;
    use braid::index::reader::same_reader;
    use braid::index::{
        DirectoryReader, IndexReader, IndexWriter, MultiReader, SegmentInfos, SegmentReader, Term,
        reader_index,
    };
    use braid::storage::{MemoryStorage, Storage};
    use std::sync::Arc;

    fn doc(text: &str) -> Document {
        Document::builder()
            .add_text("body", text)
            .add_keyword("id", text)
            .build()
    }

    fn build(segments: &[Vec<String>]) -> Arc<dyn Storage> {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let mut writer = IndexWriter::open(Arc::clone(&storage), WriterConfig::default()).unwrap();
        for batch in segments {
            for text in batch {
                writer.add_document(doc(text)).unwrap();
            }
            writer.flush().unwrap();
        }
        writer.close().unwrap();
        storage
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn segment_reader(storage: &Arc<dyn Storage>, i: usize) -> Arc<dyn IndexReader> {
        let infos = SegmentInfos::read_latest(storage.as_ref()).unwrap();
        SegmentReader::open(Arc::clone(storage), &infos.segments[i], true).unwrap()
    }

    #[test]
    fn test_reader_index_brackets_every_doc() {
        let layouts: [&[u64]; 5] = [
            &[1],
            &[3, 0, 2],
            &[0, 0, 4],
            &[2, 0, 0, 1, 0],
            &[5, 5, 5, 5],
        ];
        for sizes in layouts {
            let mut starts = vec![0];
            for size in sizes {
                starts.push(starts.last().unwrap() + size);
            }
            let max_doc = *starts.last().unwrap();
            for doc in 0..max_doc {
                let i = reader_index(doc, &starts, sizes.len());
                assert!(
                    starts[i] <= doc && doc < starts[i + 1],
                    "doc {doc} routed to reader {i} with starts {starts:?}"
                );
            }
        }
    }

    #[test]
    fn test_doc_freq_sums_segments() {
        let storage = build(&[
            texts(&["cat", "cat dog", "bird", "cat"]),
            texts(&["cat", "cat", "dog cat", "cat", "cat fish"]),
        ]);
        let reader = DirectoryReader::open(storage, ReaderConfig::default()).unwrap();
        let cat = Term::new("body", "cat");

        assert_eq!(reader.doc_freq(&cat).unwrap(), 8);

        let mut terms = reader.terms_from(&cat).unwrap();
        assert_eq!(terms.term(), Some(&cat));
        assert_eq!(terms.doc_freq(), 8);
        assert!(terms.next().unwrap());
        assert_eq!(terms.term().unwrap().text(), "dog");
        assert_eq!(terms.doc_freq(), 2);
    }

    #[test]
    fn test_terms_are_strictly_increasing_and_unique() {
        let storage = build(&[
            texts(&["b d", "a"]),
            texts(&["c", "a d"]),
            texts(&["e b"]),
        ]);
        let reader = DirectoryReader::open(storage, ReaderConfig::default()).unwrap();

        let mut terms = reader.terms().unwrap();
        let mut seen = Vec::new();
        while terms.next().unwrap() {
            let term = terms.term().unwrap().clone();
            if term.field() == "body" {
                seen.push((term.text().to_string(), terms.doc_freq()));
            }
        }
        let expected: Vec<(String, u32)> = [("a", 2), ("b", 2), ("c", 1), ("d", 2), ("e", 1)]
            .iter()
            .map(|(t, f)| (t.to_string(), *f))
            .collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_doc_ids_are_rebased() {
        let first: Vec<String> = (0..100).map(|i| format!("filler{i}")).collect();
        let second = texts(&["s0", "s1", "s2", "s3", "needle", "s5"]);
        let storage = build(&[first, second]);
        let reader = DirectoryReader::open(storage, ReaderConfig::default()).unwrap();

        let mut docs = reader.term_docs_for(&Term::new("body", "needle")).unwrap();
        assert!(docs.next().unwrap());
        assert_eq!(docs.doc(), 104);
        assert!(!docs.next().unwrap());

        let stored = reader.document(104).unwrap();
        assert_eq!(stored.get_field("id").unwrap().as_text(), Some("needle"));
        assert!(matches!(
            reader.document(106),
            Err(BraidError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_term_vectors_follow_rebased_ids() {
        let storage = build(&[texts(&["a b", "c"]), texts(&["d d"])]);
        let directory = DirectoryReader::open(storage, ReaderConfig::default()).unwrap();

        let vectors = directory.term_freq_vectors(2).unwrap();
        let fields: Vec<&str> = vectors.iter().map(|v| v.field.as_str()).collect();
        assert_eq!(fields, vec!["body", "id"]);
        assert_eq!(vectors[0].terms, vec!["d".to_string()]);
        assert_eq!(vectors[0].freqs, vec![2]);
        assert_eq!(vectors[1].terms, vec!["d d".to_string()]);

        let body = directory.term_freq_vector(0, "body").unwrap().unwrap();
        assert_eq!(body.terms, vec!["a".to_string(), "b".to_string()]);
        assert!(directory.term_freq_vector(1, "missing").unwrap().is_none());

        let other = DirectoryReader::open(build(&[texts(&["e"])]), ReaderConfig::default())
            .unwrap();
        let subs: Vec<Arc<dyn IndexReader>> = vec![directory.clone(), other.clone()];
        let nested = MultiReader::new(subs, false).unwrap();
        let last = nested.term_freq_vector(3, "body").unwrap().unwrap();
        assert_eq!(last.terms, vec!["e".to_string()]);
        assert_eq!(last.freq("e"), 1);
        assert!(matches!(
            nested.term_freq_vectors(4),
            Err(BraidError::InvalidArgument(_))
        ));

        nested.close().unwrap();
        other.close().unwrap();
        directory.close().unwrap();
        assert!(matches!(
            directory.term_freq_vectors(0),
            Err(BraidError::AlreadyClosed(_))
        ));
    }

    #[test]
    fn test_empty_sub_reader_is_skipped() {
        let storage = build(&[texts(&["a", "b"]), texts(&["c"])]);
        let empty = MultiReader::new(Vec::new(), true).unwrap();
        let reader = MultiReader::new(
            vec![
                segment_reader(&storage, 0),
                empty as Arc<dyn IndexReader>,
                segment_reader(&storage, 1),
            ],
            true,
        )
        .unwrap();

        assert_eq!(reader.doc_starts().as_slice(), &[0, 2, 2, 3]);
        let stored = reader.document(2).unwrap();
        assert_eq!(stored.get_field("id").unwrap().as_text(), Some("c"));

        let mut docs = reader.term_docs_for(&Term::new("body", "c")).unwrap();
        assert!(docs.next().unwrap());
        assert_eq!(docs.doc(), 2);
    }

    #[test]
    fn test_reopen_unchanged_returns_same_instance() {
        let storage = build(&[texts(&["a"]), texts(&["b"])]);
        let reader = DirectoryReader::open(storage, ReaderConfig::default()).unwrap();
        let handle: Arc<dyn IndexReader> = reader.clone();

        let reopened = Arc::clone(&reader).reopen().unwrap();
        assert!(same_reader(&handle, &reopened));
        assert_eq!(reader.ref_count(), 1);
    }

    #[test]
    fn test_reopen_shares_unchanged_segments() {
        let storage = build(&[texts(&["a"]), texts(&["b"])]);
        let reader = DirectoryReader::open(Arc::clone(&storage), ReaderConfig::default()).unwrap();

        let mut writer = IndexWriter::open(Arc::clone(&storage), WriterConfig::default()).unwrap();
        writer.add_document(doc("c")).unwrap();
        writer.close().unwrap();

        let reopened = Arc::clone(&reader).reopen().unwrap();
        let reopened_dir = reopened
            .as_any()
            .downcast_ref::<DirectoryReader>()
            .unwrap();
        assert_eq!(reopened.max_doc(), 3);
        assert_eq!(reader.max_doc(), 2);

        for (old, new) in reader
            .segment_readers()
            .iter()
            .zip(reopened_dir.segment_readers())
        {
            assert!(Arc::ptr_eq(old, new));
            assert_eq!(old.ref_count(), 2);
        }
        assert_eq!(reopened_dir.segment_readers()[2].ref_count(), 1);
    }

    #[test]
    fn test_segment_released_exactly_once() {
        let storage = build(&[texts(&["a"])]);
        let reader = DirectoryReader::open(Arc::clone(&storage), ReaderConfig::default()).unwrap();
        let segment = Arc::clone(&reader.segment_readers()[0]);
        let core = Arc::clone(segment.core());

        let mut writer = IndexWriter::open(Arc::clone(&storage), WriterConfig::default()).unwrap();
        writer.add_document(doc("b")).unwrap();
        writer.close().unwrap();
        let reopened = Arc::clone(&reader).reopen().unwrap();
        assert_eq!(segment.ref_count(), 2);

        reader.close().unwrap();
        assert_eq!(segment.ref_count(), 1);
        assert!(!core.is_released());

        reopened.close().unwrap();
        assert_eq!(segment.ref_count(), 0);
        assert!(core.is_released());
        assert!(matches!(
            segment.dec_ref(),
            Err(BraidError::AlreadyClosed(_))
        ));
        assert!(matches!(
            reopened.dec_ref(),
            Err(BraidError::AlreadyClosed(_))
        ));
        assert!(reopened.document(0).is_err());
    }

    #[test]
    fn test_multi_reader_holds_shared_references() {
        let storage = build(&[texts(&["a"]), texts(&["b"])]);
        let first = segment_reader(&storage, 0);
        let second = segment_reader(&storage, 1);

        let reader =
            MultiReader::new(vec![Arc::clone(&first), Arc::clone(&second)], false).unwrap();
        assert_eq!(first.ref_count(), 2);

        reader.close().unwrap();
        reader.close().unwrap();
        assert_eq!(first.ref_count(), 1);
        assert_eq!(second.ref_count(), 1);
        assert_eq!(first.document(0).unwrap().len(), 2);
    }

    #[test]
    fn test_norms_concatenate_segments() {
        let storage = build(&[texts(&["a b c d", "a"]), texts(&["a b c d"])]);
        let reader = DirectoryReader::open(storage, ReaderConfig::default()).unwrap();

        let norms = reader.norms("body").unwrap().unwrap();
        assert_eq!(norms.len(), 3);
        assert_eq!(norms[0], norms[2]);
        assert!(norms[1] > norms[0]);

        let mut buf = vec![0u8; 5];
        reader.norms_into("body", &mut buf, 2).unwrap();
        assert_eq!(&buf[2..], &norms[..]);
        let mut short = vec![0u8; 4];
        assert!(matches!(
            reader.norms_into("body", &mut short, 2),
            Err(BraidError::InvalidArgument(_))
        ));
        assert!(reader.has_norms("body").unwrap());
        assert_eq!(
            reader.field_names().unwrap().into_iter().collect::<Vec<_>>(),
            vec!["body".to_string(), "id".to_string()]
        );
    }
}
