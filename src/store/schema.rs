use anyhow::{Context, Result};
use rusqlite::{Connection, params};

pub const DB_SCHEMA_VERSION: &str = "0.2.0";

pub fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign keys")?;
    Ok(())
}

pub fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
            CREATE TABLE IF NOT EXISTS metadata (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS docs (
              doc_id TEXT PRIMARY KEY,
              filename TEXT NOT NULL,
              doc_type TEXT NOT NULL,
              sha256 TEXT NOT NULL,
              page_count INTEGER NOT NULL,
              indexed_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chunks (
              chunk_id TEXT PRIMARY KEY,
              doc_id TEXT NOT NULL,
              doc_type TEXT NOT NULL,
              page_number INTEGER NOT NULL,
              chunk_seq INTEGER NOT NULL DEFAULT 0,
              text TEXT NOT NULL,
              char_start INTEGER,
              char_end INTEGER,
              FOREIGN KEY(doc_id) REFERENCES docs(doc_id)
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_doc ON chunks(doc_id, doc_type, page_number);

            CREATE TABLE IF NOT EXISTS embedding_models (
              model_id TEXT PRIMARY KEY,
              dimensions INTEGER NOT NULL,
              normalization TEXT NOT NULL,
              backend TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chunk_embeddings (
              chunk_id TEXT NOT NULL,
              model_id TEXT NOT NULL,
              embedding_dim INTEGER NOT NULL,
              embedding BLOB NOT NULL,
              text_hash TEXT NOT NULL,
              PRIMARY KEY(chunk_id, model_id),
              FOREIGN KEY(chunk_id) REFERENCES chunks(chunk_id),
              FOREIGN KEY(model_id) REFERENCES embedding_models(model_id)
            );

            CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts
            USING fts5(chunk_id UNINDEXED, text, content='chunks', content_rowid='rowid');
            ",
        )
        .context("failed to create index schema")?;

    connection
        .execute(
            "INSERT INTO metadata(key, value) VALUES('db_schema_version', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![DB_SCHEMA_VERSION],
        )
        .context("failed to record schema version")?;

    Ok(())
}
