//! Shared infrastructure for the session subsystem
//!
//! - `pool`: bounded worker pool gating concurrent streams per session
//! - `buffer`: batching prepared-insert accumulator
//! - `opts`: option-string parsing for module arguments

mod buffer;
mod opts;
mod pool;

pub use buffer::{InsertBuffer, SqlParam};
pub use opts::{check_for_keys, parse_opt_string, OptMap};
pub use pool::WorkerPool;
