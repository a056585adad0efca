//! Terminal session: the per-checkout state machine.

mod machine;
mod types;

pub use machine::TerminalSession;
pub use types::*;
