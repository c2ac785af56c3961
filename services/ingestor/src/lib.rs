// ingestor: Library entry point.
// Exposes modules for integration testing.

pub mod backoff;
pub mod config;
pub mod gate;
pub mod http;
pub mod pipeline;
pub mod poller;
pub mod runtime;
pub mod storage;
pub mod subscription;
