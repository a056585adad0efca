//! Card reader hardware abstraction.

mod simulated;
mod types;

pub use simulated::SimulatedReaderSdk;
pub use types::*;
