pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use config::NoorConfig;
pub use error::{NoorError, Result};
pub use events::EngineNotice;
pub use types::*;
