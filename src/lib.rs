pub mod core;
pub mod crawl;
pub mod indexer;
pub mod nlp;
pub mod search;
pub mod storage;
pub mod ui;

// --- Primary exports ---
pub use core::config;
pub use core::config::NeckarConfig;
pub use crawl::{Controller, Document, Frontier, Host, HostStore, Request, Status};
pub use search::{SearchResult, Searcher};
