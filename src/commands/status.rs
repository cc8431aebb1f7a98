use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::commands::{effective_db_path, load_config_or_default};
use crate::config::DocumentConfig;
use crate::store::index_counts;

pub fn run(args: StatusArgs) -> Result<()> {
    let config = load_config_or_default(args.config.as_deref())?;
    let db_path = effective_db_path(&config, args.db_path.as_deref());

    info!(db_path = %db_path.display(), "status requested");

    if !db_path.exists() {
        warn!(path = %db_path.display(), "database file missing");
        return Ok(());
    }

    let conn = Connection::open_with_flags(&db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    let counts = index_counts(&conn)?;
    let version = schema_version(&conn)?;

    info!(
        path = %db_path.display(),
        schema_version = version.as_deref().unwrap_or("unknown"),
        docs = counts.docs,
        chunks = counts.chunks,
        embeddings = counts.embeddings,
        "database status"
    );

    let mut statement = conn
        .prepare(
            "SELECT d.doc_id, d.doc_type, d.page_count, d.indexed_at, COUNT(c.chunk_id)
             FROM docs d LEFT JOIN chunks c ON c.doc_id = d.doc_id
             GROUP BY d.doc_id ORDER BY d.doc_id",
        )
        .context("failed to prepare document listing")?;
    let rows = statement.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, i64>(4)?,
        ))
    })?;

    for row in rows {
        let (doc_id, doc_type, page_count, indexed_at, chunks) = row?;
        info!(
            doc_id = %doc_id,
            doc_type = %doc_type,
            pages = page_count,
            chunks,
            indexed_at = %indexed_at,
            "indexed document"
        );
    }

    for document in unindexed_documents(&conn, &config.documents)? {
        warn!(
            doc_id = %document.doc_id(),
            path = %document.path.display(),
            "configured document not indexed"
        );
    }

    Ok(())
}

fn schema_version(conn: &Connection) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM metadata WHERE key = 'db_schema_version'",
        [],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .context("failed to read schema version")
}

fn unindexed_documents<'a>(
    conn: &Connection,
    documents: &'a [DocumentConfig],
) -> Result<Vec<&'a DocumentConfig>> {
    let mut missing = Vec::new();
    for document in documents {
        let doc_id = document.doc_id();
        let indexed: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM docs WHERE doc_id = ?1",
                [&doc_id],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to look up {doc_id}"))?;
        if indexed == 0 {
            missing.push(document);
        }
    }
    Ok(missing)
}
