//! Offline-tolerant write and sync pipeline for journal entries.
//!
//! Writes are persisted locally first, batched per resource kind and sent when
//! the server is reachable. Reads go through a cache layer that keeps the app
//! usable while offline.

pub mod app;
pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod http;
pub mod logging;
pub mod queue;
pub mod rpc;
pub mod sync;

#[cfg(test)]
mod test_support;
