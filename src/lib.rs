pub mod aggregator;
pub mod cli;
pub mod config;
pub mod correlator;
pub mod error;
pub mod k8s;
pub mod lifecycle;
pub mod metrics;
pub mod model;
pub mod source;

pub use error::{MossError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
