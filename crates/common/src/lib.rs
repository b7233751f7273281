//! Shared types for the blockgate decision engine: configuration, the
//! request/decision model, the error type and tracing setup.

pub mod config;
pub mod error;
pub mod model;
pub mod telemetry;

pub use config::*;
pub use error::{BlockgateError, BlockgateResult};
pub use model::{Action, CheckKind, Decision, ListKind, RequestRecord};
pub use telemetry::{init_tracing, LogFormat};
