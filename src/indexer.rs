//! Inverted index builder: crawled documents → term/position postings.
//!
//! `index_all` is idempotent. Each document is indexed inside its own
//! transaction keyed on the shared document id, so a rerun — after a crash
//! or over a grown crawl database — skips what is already indexed and an
//! indexed document is always either absent or complete.

use anyhow::{Context, Result};
use rusqlite::{Connection, ErrorCode};
use tracing::{debug, info};

use crate::nlp::pipeline;

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct IndexStats {
    pub indexed: usize,
    pub skipped: usize,
    pub postings: usize,
}

/// Index every stored document from the crawl database into the index
/// database.
pub fn index_all(crawl: &Connection, index: &mut Connection) -> Result<IndexStats> {
    let mut stats = IndexStats::default();

    let mut stmt = crawl.prepare(
        "SELECT document.id, document.title, document.content, url.url \
         FROM document \
         JOIN request ON document.request_id = request.id \
         JOIN url ON request.url_id = url.id \
         ORDER BY document.id",
    )?;
    let docs = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, Option<String>>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    for doc in docs {
        let (doc_id, title, content, url) = doc?;
        let tx = index.transaction()?;
        let inserted = tx.execute(
            "INSERT INTO document (id, url, title, content) VALUES (?1, ?2, ?3, ?4)",
            (doc_id, &url, &title, &content),
        );
        match inserted {
            Ok(_) => {}
            // Primary key already present: the document was fully indexed
            // by an earlier run.
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                debug!("document {} already indexed, skipping", doc_id);
                stats.skipped += 1;
                continue;
            }
            Err(e) => return Err(e).context("failed to insert index document"),
        }

        let terms = pipeline().preprocess(&content);
        {
            let mut insert_word = tx.prepare_cached(
                "INSERT INTO word (word) VALUES (?1) ON CONFLICT (word) DO NOTHING",
            )?;
            let mut select_word = tx.prepare_cached("SELECT id FROM word WHERE word = ?1")?;
            let mut insert_posting = tx.prepare_cached(
                "INSERT INTO posting (word_id, document_id, position) VALUES (?1, ?2, ?3)",
            )?;
            for (position, term) in terms.iter().enumerate() {
                insert_word.execute([term])?;
                let word_id: i64 = select_word.query_row([term], |row| row.get(0))?;
                insert_posting.execute((word_id, doc_id, position as i64))?;
                stats.postings += 1;
            }
        }
        tx.commit()?;
        stats.indexed += 1;
    }

    info!(
        "indexing done: {} indexed, {} already present, {} postings written",
        stats.indexed, stats.skipped, stats.postings
    );
    Ok(stats)
}
