//! Domain model module declarations.

pub mod event;
pub mod hook;
pub mod session;
pub mod transcript;
