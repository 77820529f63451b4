pub mod config;

pub use config::{load_config, NeckarConfig};
