#![forbid(unsafe_code)]

//! `appgen-relay`: coordinates AI generation sessions across a stateless,
//! horizontally scaled tier. At most one generation is active per
//! application, and its output is a resumable, replayable stream.

pub mod api;
pub mod config;
pub mod driver;
pub mod errors;
pub mod models;
pub mod notify;
pub mod orchestrator;
pub mod persistence;
pub mod stream;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
