pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod interfaces;
pub mod ledger;
pub mod logging;
pub mod processor;
pub mod responders;
pub mod runtime_paths;
pub mod scheduler;

pub type Result<T> = std::result::Result<T, error::VesperError>;
