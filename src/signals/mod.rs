pub mod ingest;

pub use ingest::{SignalIngester, SignalInput};
