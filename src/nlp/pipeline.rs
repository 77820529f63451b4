//! Shared text preprocessing: case-fold → tokenize → stem → drop stopwords.
//!
//! Relevance scoring, indexing and query preprocessing MUST all go through
//! the same pipeline — any asymmetry between the index-time and query-time
//! term streams silently breaks recall. The stemmer and stopword set are
//! built once per process.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use rust_stemmers::{Algorithm, Stemmer};

/// NLTK's English stopword list.
const STOPWORDS: &[&str] = &[
    "i", "me", "my", "myself", "we", "our", "ours", "ourselves", "you", "you're", "you've",
    "you'll", "you'd", "your", "yours", "yourself", "yourselves", "he", "him", "his", "himself",
    "she", "she's", "her", "hers", "herself", "it", "it's", "its", "itself", "they", "them",
    "their", "theirs", "themselves", "what", "which", "who", "whom", "this", "that", "that'll",
    "these", "those", "am", "is", "are", "was", "were", "be", "been", "being", "have", "has",
    "had", "having", "do", "does", "did", "doing", "a", "an", "the", "and", "but", "if", "or",
    "because", "as", "until", "while", "of", "at", "by", "for", "with", "about", "against",
    "between", "into", "through", "during", "before", "after", "above", "below", "to", "from",
    "up", "down", "in", "out", "on", "off", "over", "under", "again", "further", "then", "once",
    "here", "there", "when", "where", "why", "how", "all", "any", "both", "each", "few", "more",
    "most", "other", "some", "such", "no", "nor", "not", "only", "own", "same", "so", "than",
    "too", "very", "s", "t", "can", "will", "just", "don", "don't", "should", "should've", "now",
    "d", "ll", "m", "o", "re", "ve", "y", "ain", "aren", "aren't", "couldn", "couldn't", "didn",
    "didn't", "doesn", "doesn't", "hadn", "hadn't", "hasn", "hasn't", "haven", "haven't", "isn",
    "isn't", "ma", "mightn", "mightn't", "mustn", "mustn't", "needn", "needn't", "shan",
    "shan't", "shouldn", "shouldn't", "wasn", "wasn't", "weren", "weren't", "won", "won't",
    "wouldn", "wouldn't",
];

/// The preprocessing pipeline. Obtain the process-wide instance via
/// [`pipeline()`].
pub struct TextPipeline {
    token_re: Regex,
    stemmer: Stemmer,
    stopwords: HashSet<&'static str>,
}

static PIPELINE: OnceLock<TextPipeline> = OnceLock::new();

/// Process-wide pipeline instance, constructed on first use.
pub fn pipeline() -> &'static TextPipeline {
    PIPELINE.get_or_init(TextPipeline::new)
}

impl TextPipeline {
    fn new() -> Self {
        Self {
            // Unicode \w+ word runs: "tübingen" must stay one token, the
            // same boundaries at index and query time.
            token_re: Regex::new(r"\w+").expect("token regex is valid"),
            stemmer: Stemmer::create(Algorithm::English),
            stopwords: STOPWORDS.iter().copied().collect(),
        }
    }

    /// Full pipeline: lowercase, tokenize, drop stopwords, stem.
    ///
    /// Stopword membership is checked on the raw lowercased token, before
    /// stemming mangles it out of the list.
    pub fn preprocess(&self, text: &str) -> Vec<String> {
        let low = text.to_lowercase();
        self.token_re
            .find_iter(&low)
            .map(|m| m.as_str())
            .filter(|tok| !self.stopwords.contains(tok))
            .map(|tok| self.stemmer.stem(tok).into_owned())
            .collect()
    }

    /// Stem a single lowercased term, bypassing tokenization. Used for the
    /// topical keyword list so keywords and document tokens meet in the
    /// same stemmed space.
    pub fn stem(&self, word: &str) -> String {
        self.stemmer.stem(&word.to_lowercase()).into_owned()
    }
}
