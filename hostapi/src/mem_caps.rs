//! In-memory capability adapters for testing.
//!
//! Deterministic stand-ins for the OS adapters, plus failure injection.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::error::HostError;
use crate::traits::{ByteSink, ModuleLoader, RandomSource};
use crate::value::HostValue;

/// Reproducible random bytes from a fixed seed.
#[derive(Debug)]
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn fill(&self, dest: &mut [u8]) -> Result<(), HostError> {
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fill_bytes(dest);
        Ok(())
    }
}

/// A random source that always fails with the given message.
#[derive(Debug, Clone)]
pub struct FailingRandom {
    message: String,
}

impl FailingRandom {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl RandomSource for FailingRandom {
    fn fill(&self, _dest: &mut [u8]) -> Result<(), HostError> {
        Err(HostError::Random(self.message.clone()))
    }
}

/// A module loader backed by a fixed map.
#[derive(Debug, Default)]
pub struct StaticLoader {
    modules: BTreeMap<String, HostValue>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `value` under `name`.
    pub fn with_module(mut self, name: impl Into<String>, value: HostValue) -> Self {
        self.modules.insert(name.into(), value);
        self
    }
}

impl ModuleLoader for StaticLoader {
    fn require(&self, name: &str) -> Result<HostValue, HostError> {
        self.modules
            .get(name)
            .cloned()
            .ok_or_else(|| HostError::ModuleNotFound(name.to_owned()))
    }
}

/// Collects guest diagnostics in memory.
#[derive(Debug, Default)]
pub struct MemSink {
    lines: Mutex<Vec<String>>,
}

impl MemSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl ByteSink for MemSink {
    fn write_line(&self, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.to_owned());
    }
}
