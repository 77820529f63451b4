//! BM25 scoring over the positional posting lists.
//!
//! Document length is the posting count (the index stores every occurrence,
//! undeduplicated), so lengths and term frequencies come straight from
//! GROUP BY queries.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension};

pub const K1: f64 = 1.5;
pub const B: f64 = 0.75;
/// Original (pre-enrichment) query terms weigh double.
pub const ORIGINAL_TERM_WEIGHT: f64 = 2.0;

/// Score every document matching at least one query term.
///
/// Terms absent from the vocabulary contribute nothing; when none match,
/// the result is empty. Scores are sums of non-negative per-term
/// contributions.
pub fn score(
    index: &Connection,
    terms: &[String],
    original: &HashSet<String>,
) -> Result<HashMap<i64, f64>> {
    let mut scores: HashMap<i64, f64> = HashMap::new();

    let doc_count: i64 = index.query_row("SELECT count(*) FROM document", [], |row| row.get(0))?;
    if doc_count == 0 {
        return Ok(scores);
    }

    let mut doc_lengths: HashMap<i64, i64> = HashMap::new();
    let mut total_postings: i64 = 0;
    {
        let mut stmt =
            index.prepare("SELECT document_id, count(*) FROM posting GROUP BY document_id")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let (doc_id, len): (i64, i64) = (row.get(0)?, row.get(1)?);
            doc_lengths.insert(doc_id, len);
            total_postings += len;
        }
    }
    if total_postings == 0 {
        return Ok(scores);
    }
    let avg_doc_length = total_postings as f64 / doc_count as f64;

    // Each distinct term contributes once, whatever its multiplicity in
    // the expanded query.
    let mut seen = HashSet::new();
    for term in terms {
        if !seen.insert(term.as_str()) {
            continue;
        }
        let word_id: Option<i64> = index
            .query_row("SELECT id FROM word WHERE word = ?1", [term], |row| {
                row.get(0)
            })
            .optional()?;
        let Some(word_id) = word_id else {
            continue;
        };

        let df: i64 = index.query_row(
            "SELECT count(DISTINCT document_id) FROM posting WHERE word_id = ?1",
            [word_id],
            |row| row.get(0),
        )?;
        if df == 0 {
            continue;
        }
        let idf = (((doc_count - df) as f64 + 0.5) / (df as f64 + 0.5) + 1.0).ln();
        let weight = if original.contains(term) {
            ORIGINAL_TERM_WEIGHT
        } else {
            1.0
        };

        let mut stmt = index.prepare(
            "SELECT document_id, count(*) FROM posting WHERE word_id = ?1 GROUP BY document_id",
        )?;
        let mut rows = stmt.query([word_id])?;
        while let Some(row) = rows.next()? {
            let (doc_id, tf): (i64, i64) = (row.get(0)?, row.get(1)?);
            let tf = tf as f64;
            let doc_len = doc_lengths.get(&doc_id).copied().unwrap_or(0) as f64;
            let contribution = weight * idf * (tf * (K1 + 1.0))
                / (tf + K1 * (1.0 - B + B * (doc_len / avg_doc_length)));
            *scores.entry(doc_id).or_insert(0.0) += contribution;
        }
    }
    Ok(scores)
}
