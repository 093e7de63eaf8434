//! Integration tests: BM25 checkpoints under arbitrary add/remove histories

use proptest::prelude::*;
use quarry::index::CHECKPOINT_VERSION;
use quarry::{Bm25Index, Bm25Params, Chunk, QuarryError, Tokenizer};
use std::collections::BTreeMap;
use tempfile::TempDir;

const VOCAB: &[&str] = &["cats", "dogs", "birds", "fish", "mice", "otters"];

#[derive(Debug, Clone)]
enum Op {
    Add(usize, Vec<&'static str>),
    Remove(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..8usize, prop::collection::vec(prop::sample::select(VOCAB), 1..8))
            .prop_map(|(id, words)| Op::Add(id, words)),
        1 => (0..8usize).prop_map(Op::Remove),
    ]
}

fn chunk(id: usize, text: &str) -> Chunk {
    Chunk::new(
        format!("chunk-{}", id),
        format!("doc-{}", id % 3),
        text,
        &Tokenizer::default(),
    )
}

fn new_index() -> Bm25Index {
    Bm25Index::new(Bm25Params::default(), Tokenizer::default())
}

/// Apply `ops` to an index and return the texts that should still be live
fn replay(index: &Bm25Index, ops: &[Op]) -> BTreeMap<usize, String> {
    let mut live = BTreeMap::new();
    for op in ops {
        match op {
            Op::Add(id, words) => {
                let text = words.join(" ");
                index.add(&chunk(*id, &text));
                live.insert(*id, text);
            }
            Op::Remove(id) => {
                let removed = index.remove(&format!("chunk-{}", id));
                assert_eq!(removed, live.remove(id).is_some());
            }
        }
    }
    live
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_checkpoint_round_trip_preserves_search(ops in prop::collection::vec(op(), 0..40)) {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bm25.json");

        let index = new_index();
        replay(&index, &ops);
        index.save(&path).unwrap();
        let loaded = Bm25Index::load(&path).unwrap();

        prop_assert_eq!(loaded.len(), index.len());
        prop_assert_eq!(loaded.term_count(), index.term_count());
        prop_assert_eq!(loaded.stats(), index.stats());
        for word in VOCAB {
            prop_assert_eq!(loaded.search(word, 10), index.search(word, 10));
        }
        prop_assert_eq!(loaded.search("cats dogs fish", 10), index.search("cats dogs fish", 10));
    }

    #[test]
    fn prop_removal_leaves_no_postings(ops in prop::collection::vec(op(), 0..40)) {
        let index = new_index();
        let live = replay(&index, &ops);

        for id in 0..8usize {
            let chunk_id = format!("chunk-{}", id);
            prop_assert_eq!(index.references(&chunk_id), live.contains_key(&id));
            prop_assert_eq!(index.contains(&chunk_id), live.contains_key(&id));
        }
        for word in VOCAB {
            // Emptied posting lists are dropped
            if index.document_frequency(word) == 0 {
                prop_assert!(index.postings(word).is_empty());
            }
        }
    }

    #[test]
    fn prop_incremental_matches_rebuild(ops in prop::collection::vec(op(), 0..40)) {
        let incremental = new_index();
        let live = replay(&incremental, &ops);

        let rebuilt = new_index();
        for (id, text) in &live {
            rebuilt.add(&chunk(*id, text));
        }

        prop_assert_eq!(incremental.len(), rebuilt.len());
        prop_assert_eq!(incremental.term_count(), rebuilt.term_count());
        for word in VOCAB {
            prop_assert_eq!(incremental.postings(word), rebuilt.postings(word));
        }
    }

    #[test]
    fn prop_equal_scores_list_in_id_order(ops in prop::collection::vec(op(), 0..40)) {
        let index = new_index();
        replay(&index, &ops);

        for query in VOCAB.iter().copied().chain(["cats dogs fish"]) {
            let hits = index.search(query, 10);
            for pair in hits.windows(2) {
                prop_assert!(pair[0].score >= pair[1].score);
                if pair[0].score == pair[1].score {
                    prop_assert!(pair[0].chunk_id < pair[1].chunk_id);
                }
            }
        }
    }
}

#[test]
fn test_missing_checkpoint_is_reported() {
    let temp = TempDir::new().unwrap();
    let result = Bm25Index::load(&temp.path().join("absent.json"));
    assert!(matches!(result, Err(QuarryError::CheckpointNotFound { .. })));
}

#[test]
fn test_unsupported_version_is_rejected() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("bm25.json");

    let index = new_index();
    index.add(&chunk(1, "cats and dogs"));
    index.save(&path).unwrap();

    let mut value: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    value["version"] = serde_json::json!(CHECKPOINT_VERSION + 1);
    std::fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();

    let result = Bm25Index::load(&path);
    assert!(matches!(
        result,
        Err(QuarryError::UnsupportedCheckpointVersion { .. })
    ));
}

#[test]
fn test_unknown_fields_are_ignored() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("bm25.json");

    let index = new_index();
    index.add(&chunk(1, "cats and dogs"));
    index.save(&path).unwrap();

    let mut value: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    value["written_by"] = serde_json::json!("a newer build");
    std::fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();

    let loaded = Bm25Index::load(&path).unwrap();
    assert_eq!(loaded.search("cats", 5), index.search("cats", 5));
}

#[test]
fn test_rebuild_from_corrupt_checkpoint() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("bm25.json");
    std::fs::write(&path, b"\x00\x01 definitely not json").unwrap();

    let chunks = vec![chunk(1, "cats and dogs"), chunk(2, "cats only")];
    let index =
        Bm25Index::load_or_rebuild(&path, Bm25Params::default(), Tokenizer::default(), &chunks)
            .unwrap();
    assert_eq!(index.len(), 2);

    // The rebuilt index was written back
    let reloaded = Bm25Index::load(&path).unwrap();
    assert_eq!(reloaded.search("cats", 5), index.search("cats", 5));
}

#[test]
fn test_tampered_checkpoint_is_corruption() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("bm25.json");

    let index = new_index();
    index.add(&chunk(1, "cats and dogs"));
    index.add(&chunk(2, "dogs only"));
    index.save(&path).unwrap();

    let mut value: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    value["corpus_stats"]["total_chunks"] = serde_json::json!(7);
    std::fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();

    let result = Bm25Index::load(&path);
    assert!(matches!(result, Err(QuarryError::IndexCorruption { .. })));
}
