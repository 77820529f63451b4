//! Query truncation and synonym enrichment.
//!
//! Long queries are cut down to their most informative terms before
//! enrichment; short queries are expanded with WordNet synonyms up to a
//! fixed term budget. Term priority mirrors a POS/NER-driven ranking:
//! frequency first, then named entities, nouns, adjectives/verbs, and
//! finally sheer length. Tagging is heuristic — suffix rules plus an
//! optional gazetteer file — standing in for a full tagger.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use tracing::info;

use crate::nlp::{pipeline, Thesaurus};

#[derive(Debug, Clone, Copy)]
pub struct EnrichLimits {
    pub max_total_terms: usize,
    pub synonyms_per_token: usize,
    pub enrichment_input_terms: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum PosClass {
    Noun,
    AdjectiveOrVerb,
    Other,
}

/// Suffix-rule part-of-speech guess over a preprocessed (stemmed) token.
/// Unknown shapes default to noun, as taggers do.
fn guess_pos(token: &str) -> PosClass {
    const VERBISH: &[&str] = &["ing", "ed", "ify", "ize", "ise", "ate"];
    const ADJECTIVISH: &[&str] = &[
        "ous", "ful", "ive", "ic", "al", "able", "ible", "ish", "less", "ant", "ent",
    ];
    if token.len() > 4 {
        if VERBISH.iter().any(|s| token.ends_with(s)) {
            return PosClass::AdjectiveOrVerb;
        }
        if ADJECTIVISH.iter().any(|s| token.ends_with(s)) {
            return PosClass::AdjectiveOrVerb;
        }
    }
    if token.chars().all(|c| c.is_numeric()) {
        return PosClass::Other;
    }
    PosClass::Noun
}

type Priority = (usize, bool, bool, bool, usize);

fn priority(token: &str, freq: &HashMap<&str, usize>, entities: &HashSet<String>) -> Priority {
    let pos = guess_pos(token);
    (
        freq.get(token).copied().unwrap_or(0),
        entities.contains(token),
        pos == PosClass::Noun,
        pos == PosClass::AdjectiveOrVerb,
        token.len(),
    )
}

/// Keep the `max_terms` highest-priority terms, deduplicated, in priority
/// order.
pub fn truncate_query(
    tokens: &[String],
    max_terms: usize,
    entities: &HashSet<String>,
) -> Vec<String> {
    let mut freq: HashMap<&str, usize> = HashMap::new();
    for token in tokens {
        *freq.entry(token.as_str()).or_insert(0) += 1;
    }

    let mut ranked: Vec<&String> = tokens.iter().collect();
    // Stable sort: equal-priority terms keep their query order.
    ranked.sort_by(|a, b| priority(b, &freq, entities).cmp(&priority(a, &freq, entities)));

    let mut seen = HashSet::new();
    let mut kept = Vec::new();
    for token in ranked {
        if seen.insert(token.as_str()) {
            kept.push(token.clone());
        }
        if kept.len() >= max_terms {
            break;
        }
    }
    kept
}

/// Union the original terms with up to `synonyms_per_token` WordNet
/// synonyms each, stopping once the total term budget is reached. Only the
/// leading `enrichment_input_terms` (by priority, when the query is longer)
/// are looked up.
pub fn enrich_query(
    original: &[String],
    thesaurus: &Thesaurus,
    entities: &HashSet<String>,
    limits: EnrichLimits,
) -> Vec<String> {
    let lookup_base: Vec<String> = if original.len() > limits.enrichment_input_terms {
        truncate_query(original, limits.enrichment_input_terms, entities)
    } else {
        original.to_vec()
    };

    let mut expanded: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for term in original {
        if seen.insert(term.clone()) {
            expanded.push(term.clone());
        }
    }

    'lookup: for token in &lookup_base {
        if expanded.len() >= limits.max_total_terms {
            break;
        }
        for synonym in thesaurus.synonyms(token, limits.synonyms_per_token) {
            if expanded.len() >= limits.max_total_terms {
                break 'lookup;
            }
            if seen.insert(synonym.clone()) {
                expanded.push(synonym);
            }
        }
    }
    expanded
}

/// Optional one-entity-per-line gazetteer (`entities.txt` in the data
/// directory), preprocessed into the same term space as queries.
pub fn load_gazetteer(data_dir: impl AsRef<Path>) -> HashSet<String> {
    let path = data_dir.as_ref().join("entities.txt");
    let Ok(contents) = std::fs::read_to_string(&path) else {
        return HashSet::new();
    };
    let mut entities = HashSet::new();
    for line in contents.lines() {
        for term in pipeline().preprocess(line) {
            entities.insert(term);
        }
    }
    info!(
        "gazetteer: {} entity terms from {}",
        entities.len(),
        path.display()
    );
    entities
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn truncation_prefers_frequency() {
        let tokens = toks(&["market", "castle", "castle", "river", "castle", "market"]);
        let kept = truncate_query(&tokens, 2, &HashSet::new());
        assert_eq!(kept[0], "castle");
        assert_eq!(kept[1], "market");
    }

    #[test]
    fn truncation_prefers_entities_at_equal_frequency() {
        let tokens = toks(&["visiting", "tübingen", "yesterday"]);
        let entities: HashSet<String> = ["tübingen".to_string()].into();
        let kept = truncate_query(&tokens, 1, &entities);
        assert_eq!(kept, vec!["tübingen".to_string()]);
    }

    #[test]
    fn truncation_deduplicates_and_caps() {
        let tokens = toks(&["a1", "b2", "a1", "c3", "d4", "b2"]);
        let kept = truncate_query(&tokens, 3, &HashSet::new());
        assert_eq!(kept.len(), 3);
        let unique: HashSet<&String> = kept.iter().collect();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn enrichment_unions_within_budget() {
        // A thesaurus built from a tiny two-synset WordNet excerpt.
        let limits = EnrichLimits {
            max_total_terms: 4,
            synonyms_per_token: 3,
            enrichment_input_terms: 30,
        };
        let original = toks(&["castle", "river"]);
        let expanded = enrich_query(&original, &Thesaurus::empty(), &HashSet::new(), limits);
        // Empty thesaurus: the query passes through untouched.
        assert_eq!(expanded, original);
    }

    #[test]
    fn enrichment_respects_total_budget() {
        let limits = EnrichLimits {
            max_total_terms: 2,
            synonyms_per_token: 3,
            enrichment_input_terms: 30,
        };
        let original = toks(&["castle", "river", "market"]);
        let expanded = enrich_query(&original, &Thesaurus::empty(), &HashSet::new(), limits);
        // Originals are never dropped by the budget; only additions stop.
        assert_eq!(expanded, original);
    }

    #[test]
    fn pos_guess_defaults_to_noun() {
        assert_eq!(guess_pos("fountain"), PosClass::Noun);
        assert_eq!(guess_pos("punting"), PosClass::AdjectiveOrVerb);
        assert_eq!(guess_pos("beautiful"), PosClass::AdjectiveOrVerb);
        assert_eq!(guess_pos("1847"), PosClass::Other);
    }

    #[test]
    fn missing_gazetteer_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_gazetteer(dir.path()).is_empty());
    }

    #[test]
    fn gazetteer_terms_are_preprocessed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("entities.txt"),
            "Tübingen\nHölderlin Tower\n",
        )
        .unwrap();
        let entities = load_gazetteer(dir.path());
        assert!(entities.contains(&pipeline().stem("tübingen")));
        assert!(entities.contains(&pipeline().stem("tower")));
    }
}
