pub mod cli;
pub mod engine;
pub mod error;
pub mod stats;
pub mod utils;

pub use engine::{Engine, RunOutcome};
pub use error::{ConfigError, RequestError};
pub use utils::parse_duration_str;
