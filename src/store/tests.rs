use rusqlite::Connection;
use tempfile::TempDir;

use super::*;
use crate::model::Chunk;
use crate::semantic::{
    LocalHashEmbedder, QueryEmbedder, encode_embedding_blob, resolve_model_config,
};
use crate::util::sha256_text;

fn chunk(doc_id: &str, seq: usize, page: u32, text: &str) -> ChunkInsert {
    let embedder = LocalHashEmbedder::new(resolve_model_config("", Some(64)));
    let embedding = embedder.embed_document(text);
    ChunkInsert {
        chunk: Chunk {
            chunk_id: format!("{doc_id}:p{page}:c{seq}"),
            doc_id: doc_id.to_string(),
            doc_type: "contract".to_string(),
            page_number: page,
            text: text.to_string(),
            char_start: Some(0),
            char_end: Some(text.chars().count()),
        },
        chunk_seq: seq,
        embedding_dim: embedding.len(),
        embedding: encode_embedding_blob(&embedding),
        text_hash: sha256_text(text),
    }
}

fn seeded_store() -> (TempDir, SqliteEvidenceStore) {
    let dir = TempDir::new().expect("tempdir");
    let db_path = dir.path().join("index.sqlite");
    let model = resolve_model_config("", Some(64));

    let connection = Connection::open(&db_path).expect("open db");
    configure_connection(&connection).expect("configure");
    ensure_schema(&connection).expect("schema");
    register_embedding_model(&connection, &model).expect("model");

    for (doc_id, chunks) in [
        (
            "contract.pdf",
            vec![
                chunk("contract.pdf", 0, 1, "This agreement is made between the parties."),
                chunk(
                    "contract.pdf",
                    1,
                    2,
                    "The brokerage registered tax ID is 12.345.678/0001-90.",
                ),
                chunk("contract.pdf", 2, 3, "Penalties and fines apply on late settlement."),
            ],
        ),
        (
            "other.pdf",
            vec![chunk("other.pdf", 0, 1, "Another registered tax ID appears here.")],
        ),
    ] {
        upsert_document(
            &connection,
            &DocumentInsert {
                doc_id,
                filename: doc_id,
                doc_type: "contract",
                sha256: "abc",
                page_count: 3,
                indexed_at: "2026-01-01T00:00:00Z",
            },
        )
        .expect("doc");
        insert_chunks(&connection, &model.model_id, &chunks).expect("chunks");
    }
    sync_fts_index(&connection).expect("fts");
    drop(connection);

    let store = SqliteEvidenceStore::open(&db_path, &model, 2).expect("store");
    (dir, store)
}

#[test]
fn search_returns_both_channels_filtered_by_document() {
    let (_dir, store) = seeded_store();
    let embedder = LocalHashEmbedder::new(resolve_model_config("", Some(64)));
    let vectors = embedder.embed("registered tax ID").expect("embed");
    let filters = SearchFilters::for_document("contract.pdf", Some("contract"));

    let hits = store
        .search(&SearchRequest {
            sparse: &vectors.sparse,
            dense: &vectors.dense,
            filters: &filters,
            top_k: 10,
        })
        .expect("search");

    assert!(!hits.sparse.is_empty());
    assert_eq!(hits.sparse[0].chunk.page_number, 2);
    assert_eq!(hits.dense.len(), 3);
    assert!(
        hits.sparse
            .iter()
            .chain(hits.dense.iter())
            .all(|hit| hit.chunk.doc_id == "contract.pdf")
    );
}

#[test]
fn dense_channel_respects_top_k_and_orders_by_similarity() {
    let (_dir, store) = seeded_store();
    let embedder = LocalHashEmbedder::new(resolve_model_config("", Some(64)));
    let vectors = embedder.embed("penalties and fines").expect("embed");
    let filters = SearchFilters::for_document("contract.pdf", None);

    let hits = store
        .search(&SearchRequest {
            sparse: &vectors.sparse,
            dense: &vectors.dense,
            filters: &filters,
            top_k: 2,
        })
        .expect("search");

    assert_eq!(hits.dense.len(), 2);
    assert!(hits.dense[0].score >= hits.dense[1].score);
    assert_eq!(hits.dense[0].chunk.page_number, 3);
}

#[test]
fn stop_word_only_query_has_no_sparse_hits() {
    let (_dir, store) = seeded_store();
    let embedder = LocalHashEmbedder::new(resolve_model_config("", Some(64)));
    let vectors = embedder.embed("is there a").expect("embed");
    let filters = SearchFilters::default();

    let hits = store
        .search(&SearchRequest {
            sparse: &vectors.sparse,
            dense: &vectors.dense,
            filters: &filters,
            top_k: 5,
        })
        .expect("search");

    assert!(hits.sparse.is_empty());
}

#[test]
fn mismatched_query_dimensions_are_a_store_error() {
    let (_dir, store) = seeded_store();
    let sparse = crate::semantic::sparse_vector("tax");
    let filters = SearchFilters::default();

    let result = store.search(&SearchRequest {
        sparse: &sparse,
        dense: &[0.5, 0.5],
        filters: &filters,
        top_k: 5,
    });

    assert!(matches!(result, Err(crate::error::AuditError::Store { .. })));
}

#[test]
fn document_lookups_report_type_and_size() {
    let (_dir, store) = seeded_store();
    assert_eq!(
        store.document_type("contract.pdf").expect("type"),
        Some("contract".to_string())
    );
    assert_eq!(store.document_type("missing.pdf").expect("type"), None);
    assert_eq!(store.document_chunk_count("contract.pdf").expect("count"), 3);
}

#[test]
fn deleting_a_document_removes_its_chunks() {
    let (dir, _store) = seeded_store();
    let connection = Connection::open(dir.path().join("index.sqlite")).expect("open");
    configure_connection(&connection).expect("configure");

    let removed = delete_document(&connection, "other.pdf").expect("delete");
    assert_eq!(removed, 1);
    assert_eq!(find_document_hash(&connection, "other.pdf").expect("lookup"), None);

    let counts = index_counts(&connection).expect("counts");
    assert_eq!(counts.docs, 1);
    assert_eq!(counts.chunks, 3);
    assert_eq!(counts.embeddings, 3);
}
