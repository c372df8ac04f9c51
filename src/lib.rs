#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use
)]

pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod gateway;
pub mod hooks;
pub mod registry;
pub mod sessions;
pub mod span;
pub mod stream;
pub mod subscribers;
pub mod writer;

pub use config::Config;
pub use error::{LensError, Result};
pub use span::SpanRecord;

/// Crate version reported by `GET /health`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Service name reported by `GET /health`.
pub const SERVICE_NAME: &str = "tracelens";
