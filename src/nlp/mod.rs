pub mod pipeline;
pub mod simhash;
pub mod wordnet;

pub use pipeline::{pipeline, TextPipeline};
pub use simhash::{hamming_distance, is_near_duplicate, simhash, NEAR_DUPLICATE_DISTANCE};
pub use wordnet::Thesaurus;
