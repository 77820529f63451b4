//! Query pipeline: preprocess → truncate → enrich → BM25 → boost → top-k.

pub mod bm25;
pub mod enrich;

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::Result;
use rusqlite::Connection;
use tracing::debug;

use crate::nlp::{pipeline, Thesaurus};

/// Number of results returned to the caller.
pub const TOP_K: usize = 12;
/// Preprocessed queries longer than this are hard-truncated…
const HARD_TRUNCATION_THRESHOLD: usize = 50;
/// …to this many terms.
const HARD_TRUNCATION_TERMS: usize = 20;
/// At most this many query tokens are considered for synonym lookup.
const ENRICHMENT_INPUT_TERMS: usize = 30;
/// Total term budget after enrichment.
const MAX_TOTAL_TERMS: usize = 15;
/// Synonyms considered per original token.
const SYNONYMS_PER_TOKEN: usize = 3;
/// Score multiplier for documents whose title intersects the original query.
const TITLE_BOOST: f64 = 1.5;

/// One ranked result.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SearchResult {
    pub url: String,
    pub title: Option<String>,
    /// Normalized to [0, 100] across the returned list.
    pub score: f64,
}

/// Query-side state that outlives individual queries: the thesaurus and the
/// entity gazetteer, both read from the data directory.
pub struct Searcher {
    thesaurus: Thesaurus,
    entities: HashSet<String>,
}

impl Searcher {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            thesaurus: Thesaurus::open_or_empty(&data_dir),
            entities: enrich::load_gazetteer(&data_dir),
        }
    }

    /// Searcher without external resources; enrichment and entity ranking
    /// degrade gracefully.
    pub fn bare() -> Self {
        Self {
            thesaurus: Thesaurus::empty(),
            entities: HashSet::new(),
        }
    }

    /// Run the full pipeline and return the ranked top-k for a free-text
    /// query. Empty when no query term is in the vocabulary.
    pub fn top_results(&self, index: &Connection, query: &str) -> Result<Vec<SearchResult>> {
        let mut original = pipeline().preprocess(query);
        if original.len() > HARD_TRUNCATION_THRESHOLD {
            original = enrich::truncate_query(&original, HARD_TRUNCATION_TERMS, &self.entities);
        }

        let expanded = enrich::enrich_query(
            &original,
            &self.thesaurus,
            &self.entities,
            enrich::EnrichLimits {
                max_total_terms: MAX_TOTAL_TERMS,
                synonyms_per_token: SYNONYMS_PER_TOKEN,
                enrichment_input_terms: ENRICHMENT_INPUT_TERMS,
            },
        );
        debug!("query terms after enrichment: {:?}", expanded);

        let original_set: HashSet<String> = original.iter().cloned().collect();
        let mut scores = bm25::score(index, &expanded, &original_set)?;
        if scores.is_empty() {
            return Ok(Vec::new());
        }

        // Title boost on the pre-enrichment query.
        let meta = load_meta(index, scores.keys().copied())?;
        for (doc_id, score) in scores.iter_mut() {
            if let Some((_, Some(title))) = meta.get(doc_id) {
                let title_terms: HashSet<String> =
                    pipeline().preprocess(title).into_iter().collect();
                if !title_terms.is_disjoint(&original_set) {
                    *score *= TITLE_BOOST;
                }
            }
        }

        let mut ranked: Vec<(i64, f64)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(TOP_K);

        let mut results: Vec<SearchResult> = ranked
            .into_iter()
            .filter_map(|(doc_id, score)| {
                meta.get(&doc_id).map(|(url, title)| SearchResult {
                    url: url.clone(),
                    title: title.clone(),
                    score,
                })
            })
            .collect();
        normalize_scores(&mut results);
        Ok(results)
    }
}

fn load_meta(
    index: &Connection,
    doc_ids: impl Iterator<Item = i64>,
) -> Result<HashMap<i64, (String, Option<String>)>> {
    let mut stmt = index.prepare("SELECT url, title FROM document WHERE id = ?1")?;
    let mut meta = HashMap::new();
    for doc_id in doc_ids {
        let row = stmt.query_row([doc_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        });
        if let Ok(row) = row {
            meta.insert(doc_id, row);
        }
    }
    Ok(meta)
}

/// Linear rescale of the returned scores to [0, 100]; a constant list
/// becomes all 100.
fn normalize_scores(results: &mut [SearchResult]) {
    let Some(max) = results.iter().map(|r| r.score).reduce(f64::max) else {
        return;
    };
    let min = results.iter().map(|r| r.score).fold(max, f64::min);
    let span = max - min;
    for result in results.iter_mut() {
        result.score = if span > 0.0 {
            (result.score - min) / span * 100.0
        } else {
            100.0
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{open_with_schema, INDEX_SCHEMA};

    /// Index DB with postings produced by the shared text pipeline, the
    /// same term space the indexer writes.
    fn index_db(docs: &[(i64, &str, Option<&str>, &str)]) -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let con = open_with_schema(dir.path().join("index.db"), INDEX_SCHEMA).unwrap();
        for (id, url, title, content) in docs {
            con.execute(
                "INSERT INTO document (id, url, title, content) VALUES (?1, ?2, ?3, ?4)",
                (*id, *url, *title, *content),
            )
            .unwrap();
            for (pos, term) in pipeline().preprocess(content).iter().enumerate() {
                con.execute(
                    "INSERT INTO word (word) VALUES (?1) ON CONFLICT (word) DO NOTHING",
                    [term],
                )
                .unwrap();
                con.execute(
                    "INSERT INTO posting (word_id, document_id, position) \
                     VALUES ((SELECT id FROM word WHERE word = ?1), ?2, ?3)",
                    (term, *id, pos as i64),
                )
                .unwrap();
            }
        }
        (dir, con)
    }

    fn hundred_terms(keyword: &str, times: usize) -> String {
        let mut words: Vec<String> = Vec::new();
        for i in 0..(100 - times) {
            words.push(format!("filler{}", i));
        }
        for _ in 0..times {
            words.push(keyword.to_string());
        }
        words.join(" ")
    }

    #[test]
    fn ranks_by_term_frequency_and_drops_nonmatching() {
        let (_dir, con) = index_db(&[
            (1, "https://d1.example/", None, &hundred_terms("tübingen", 1)),
            (2, "https://d2.example/", None, &hundred_terms("tübingen", 3)),
            (3, "https://d3.example/", None, &hundred_terms("heidelberg", 2)),
        ]);
        let results = Searcher::bare().top_results(&con, "tübingen").unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].url, "https://d2.example/");
        assert_eq!(results[1].url, "https://d1.example/");
        assert!(!results.iter().any(|r| r.url.contains("d3")));
        // Normalized: best is 100, worst is 0.
        assert_eq!(results[0].score, 100.0);
        assert_eq!(results[1].score, 0.0);
    }

    #[test]
    fn title_boost_can_overtake() {
        let (_dir, con) = index_db(&[
            (
                1,
                "https://d1.example/",
                Some("Tübingen travel notes"),
                &hundred_terms("tübingen", 2),
            ),
            (2, "https://d2.example/", None, &hundred_terms("tübingen", 3)),
        ]);
        let results = Searcher::bare().top_results(&con, "tübingen").unwrap();
        // The boosted tf=2 document beats the unboosted tf=3 one: BM25
        // saturates tf quickly, 1.5× does not.
        assert_eq!(results[0].url, "https://d1.example/");
        assert_eq!(results[0].title.as_deref(), Some("Tübingen travel notes"));
    }

    #[test]
    fn vocabulary_miss_means_empty_results() {
        let (_dir, con) = index_db(&[(
            1,
            "https://d1.example/",
            None,
            "punting on the neckar river",
        )]);
        let results = Searcher::bare()
            .top_results(&con, "zeppelin museum friedrichshafen")
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn single_result_normalizes_to_100() {
        let (_dir, con) = index_db(&[(
            1,
            "https://only.example/",
            None,
            "neckar island plane trees",
        )]);
        let results = Searcher::bare().top_results(&con, "neckar").unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].score, 100.0);
    }

    #[test]
    fn caps_at_top_k() {
        let docs: Vec<(i64, String, Option<&str>, String)> = (1..=20)
            .map(|i| {
                (
                    i,
                    format!("https://d{}.example/", i),
                    None,
                    hundred_terms("neckar", (i % 4) as usize + 1),
                )
            })
            .collect();
        let borrowed: Vec<(i64, &str, Option<&str>, &str)> = docs
            .iter()
            .map(|(id, url, title, content)| (*id, url.as_str(), *title, content.as_str()))
            .collect();
        let (_dir, con) = index_db(&borrowed);
        let results = Searcher::bare().top_results(&con, "neckar").unwrap();
        assert_eq!(results.len(), TOP_K);
        // Scores are sorted descending after normalization.
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }
}
