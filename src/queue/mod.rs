//! Durable local queue of writes the server has not acknowledged yet.
//!
//! Every mutation is a single committed SQLite statement, so a write that
//! `enqueue` returned survives a crash on the very next instruction.

mod store;
mod types;

pub use store::WriteQueue;
pub use types::{KindCounts, PendingWrite, WriteStatus};
