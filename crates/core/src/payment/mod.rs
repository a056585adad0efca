//! Payment intents and collection options.

mod types;

pub use types::*;
