//! WordNet-backed synonym lookup for query enrichment.
//!
//! The thesaurus is read from the standard WordNet `index.noun` /
//! `data.noun` files in the configured data directory (fetched by
//! `download-corpora`). The resource is optional at runtime: when the files
//! are missing the thesaurus is empty and enrichment degrades to a no-op.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::nlp::pipeline;

/// Synonym provider over WordNet noun synsets.
#[derive(Default)]
pub struct Thesaurus {
    /// lemma → synset offsets into `data.noun`.
    senses: HashMap<String, Vec<u64>>,
    /// synset offset → member words.
    synsets: HashMap<u64, Vec<String>>,
}

impl Thesaurus {
    /// Thesaurus with no entries; `synonyms` always returns nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load `index.noun` and `data.noun` from the data directory.
    pub fn load(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref();
        let index = std::fs::read_to_string(dir.join("index.noun"))
            .with_context(|| format!("failed to read {}", dir.join("index.noun").display()))?;
        let data = std::fs::read_to_string(dir.join("data.noun"))
            .with_context(|| format!("failed to read {}", dir.join("data.noun").display()))?;
        Ok(Self::parse(&index, &data))
    }

    /// Load if the files are present, otherwise warn once and run without
    /// enrichment.
    pub fn open_or_empty(data_dir: impl AsRef<Path>) -> Self {
        match Self::load(&data_dir) {
            Ok(t) => {
                info!(
                    "wordnet: loaded {} lemmas / {} synsets from {}",
                    t.senses.len(),
                    t.synsets.len(),
                    data_dir.as_ref().display()
                );
                t
            }
            Err(e) => {
                warn!("wordnet: {:#} — query enrichment disabled", e);
                Self::empty()
            }
        }
    }

    fn parse(index: &str, data: &str) -> Self {
        let mut senses: HashMap<String, Vec<u64>> = HashMap::new();
        // index.noun: lemma pos synset_cnt p_cnt [ptr…] sense_cnt tagsense_cnt offset…
        // The copyright header lines start with whitespace.
        for line in index.lines().filter(|l| !l.starts_with(' ')) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 {
                continue;
            }
            let Ok(synset_cnt) = fields[2].parse::<usize>() else {
                continue;
            };
            if synset_cnt == 0 || fields.len() < synset_cnt {
                continue;
            }
            let offsets: Vec<u64> = fields[fields.len() - synset_cnt..]
                .iter()
                .filter_map(|f| f.parse().ok())
                .collect();
            if offsets.len() == synset_cnt {
                senses.insert(fields[0].to_string(), offsets);
            }
        }

        let mut synsets: HashMap<u64, Vec<String>> = HashMap::new();
        // data.noun: offset lex_filenum ss_type w_cnt word lex_id [word lex_id…] …
        // w_cnt is two hex digits; words alternate with lex ids.
        for line in data.lines().filter(|l| !l.starts_with(' ')) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 6 {
                continue;
            }
            let Ok(offset) = fields[0].parse::<u64>() else {
                continue;
            };
            let Ok(word_cnt) = usize::from_str_radix(fields[3], 16) else {
                continue;
            };
            let mut words = Vec::with_capacity(word_cnt);
            for i in 0..word_cnt {
                let pos = 4 + i * 2;
                if pos >= fields.len() {
                    break;
                }
                words.push(fields[pos].to_string());
            }
            if !words.is_empty() {
                synsets.insert(offset, words);
            }
        }

        Self { senses, synsets }
    }

    pub fn is_empty(&self) -> bool {
        self.senses.is_empty()
    }

    /// Up to `limit` synonyms of `word`, preprocessed through the shared
    /// text pipeline so they live in the same stemmed space as the index.
    ///
    /// Multi-word lemmas (underscore-joined in WordNet) contribute their
    /// individual terms, mirroring how the query itself is tokenized.
    pub fn synonyms(&self, word: &str, limit: usize) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let Some(offsets) = self.senses.get(&word.to_lowercase()) else {
            return out;
        };
        let own_stem = pipeline().stem(word);
        'outer: for offset in offsets {
            let Some(members) = self.synsets.get(offset) else {
                continue;
            };
            for member in members {
                let surface = member.replace('_', " ");
                for term in pipeline().preprocess(&surface) {
                    if term != own_stem && !out.contains(&term) {
                        out.push(term);
                    }
                    if out.len() >= limit {
                        break 'outer;
                    }
                }
            }
        }
        out
    }
}
