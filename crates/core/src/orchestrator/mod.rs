//! Payment orchestrator façade.
//!
//! The entry point for callers (booking UI, admin dashboard): one
//! [`PaymentOrchestrator`] per checkout, every operation returning an
//! [`Outcome`] that names the state the session settled into.

mod facade;
mod types;

pub use facade::PaymentOrchestrator;
pub use types::{Failure, Outcome, Settled};
