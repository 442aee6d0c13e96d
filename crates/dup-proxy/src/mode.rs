//! Runtime duplication toggle.
//!
//! Controls whether matched requests are duplicated or only forwarded.
//! Lock-free atomic — the mode is read on every request hot path.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Operating mode for the duplication path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum DuplicationMode {
    /// Forward to the primary upstream only; no duplicates are dispatched.
    ForwardOnly = 0,
    /// Forward and duplicate per the configured rules.
    Duplicate = 1,
}

impl DuplicationMode {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => DuplicationMode::ForwardOnly,
            _ => DuplicationMode::Duplicate,
        }
    }
}

/// Thread-safe runtime mode. Cheap to clone (Arc).
#[derive(Clone)]
pub struct RuntimeMode {
    inner: Arc<AtomicU8>,
}

impl RuntimeMode {
    pub fn new(mode: DuplicationMode) -> Self {
        Self {
            inner: Arc::new(AtomicU8::new(mode as u8)),
        }
    }

    pub fn get(&self) -> DuplicationMode {
        DuplicationMode::from_u8(self.inner.load(Ordering::Relaxed))
    }

    pub fn set(&self, mode: DuplicationMode) {
        self.inner.store(mode as u8, Ordering::Relaxed);
    }
}
