//! Stream transport: sequenced, replayable output buffers.

pub mod transport;

pub use transport::{EventStream, StreamTransport};
