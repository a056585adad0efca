//! Payment backend abstraction.
//!
//! The backend is the system of record for payment intents and mints the
//! connection tokens that authorize reader sessions. Responses are normalized
//! into the canonical types at this boundary.

mod http;
mod normalize;
mod token;
mod types;

pub use http::HttpPaymentBackend;
pub use normalize::parse_intent_status;
pub use token::BackendTokenSource;
pub use types::*;
