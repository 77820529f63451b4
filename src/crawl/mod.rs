pub mod controller;
pub mod document;
pub mod frontier;
pub mod hosts;
pub mod request;
pub mod urls;

pub use controller::Controller;
pub use document::Document;
pub use frontier::Frontier;
pub use hosts::{Host, HostStore, TokenOutcome};
pub use request::{Request, Status};
