//! Worker-count configuration.
//!
//! Every dispatch in this crate (refit-and-mark, refine, cache-optimize) needs
//! to know how many worker threads it may use: it shapes the wavefront
//! threshold (§4.2), the cache-optimize task count (§4.6), and the default
//! tuning formulas (`tuning`). Wrapping the raw integer keeps it from being
//! confused with a leaf count or a node index at a call site.

use log::warn;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Used when the number of threads cannot be determined from the underlying
/// hardware.
pub const DEFAULT_WORKER_COUNT: u8 = 4;

/// Abstraction for the number of worker threads a dispatch may use.
#[derive(Copy, Clone, Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct WorkerCount(u8);

impl WorkerCount {
    pub fn as_u8(self) -> u8 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    pub fn as_u32(self) -> u32 {
        self.0 as u32
    }
}

impl From<u8> for WorkerCount {
    fn from(worker_count: u8) -> Self {
        Self(worker_count)
    }
}

impl Default for WorkerCount {
    fn default() -> Self {
        match std::thread::available_parallelism() {
            Ok(par) => WorkerCount(par.get().min(u8::MAX as usize) as u8),
            Err(err) => {
                warn!(
                    "Problem accessing machine parallelism ({}), defaulting worker count to {}",
                    err, DEFAULT_WORKER_COUNT
                );
                WorkerCount(DEFAULT_WORKER_COUNT)
            }
        }
    }
}

impl FromStr for WorkerCount {
    type Err = WorkerCountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = u8::from_str(s)?;
        if value == 0 {
            return Err(WorkerCountError::Zero);
        }
        Ok(WorkerCount(value))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum WorkerCountError {
    #[error("Malformed string input for u8 type")]
    MalformedString(#[from] std::num::ParseIntError),
    #[error("Worker count must be at least 1")]
    Zero,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_nonzero() {
        assert!(WorkerCount::default().as_u8() > 0);
    }

    #[test]
    fn from_str_rejects_zero() {
        assert!(matches!(
            WorkerCount::from_str("0"),
            Err(WorkerCountError::Zero)
        ));
    }

    #[test]
    fn from_str_accepts_positive() {
        assert_eq!(WorkerCount::from_str("8").unwrap().as_u8(), 8);
    }
}
