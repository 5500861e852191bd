//! Offline caching and background-sync engine.
//!
//! Every outgoing request of the application goes through
//! [`CacheEngine::handle`], which routes it to a fetch strategy over a set of
//! bounded cache buckets. Mutating requests that fail while offline are
//! persisted and replayed when connectivity returns.

pub mod adapter;
pub mod cache;
pub mod clock;
pub mod config;
pub mod control;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod http;
pub mod network;
pub mod notification;
pub mod offline;
pub mod routing;
pub mod strategy;
pub mod sync;

#[cfg(test)]
mod testing;

pub use cache::{Bucket, CacheKey};
pub use config::Config;
pub use control::{ControlChannel, ControlCommand, ControlResponse};
pub use engine::{CacheEngine, EngineState};
pub use error::EngineError;
pub use event::EngineEvent;
pub use http::{Method, Request, Response};
pub use network::{Fetcher, HttpFetcher};
