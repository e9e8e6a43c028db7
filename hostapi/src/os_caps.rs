//! Production capability adapters.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::HostError;
use crate::traits::{ByteSink, ModuleLoader, RandomSource};
use crate::value::HostValue;

/// Random bytes from the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn fill(&self, dest: &mut [u8]) -> Result<(), HostError> {
        OsRng
            .try_fill_bytes(dest)
            .map_err(|e| HostError::Random(e.to_string()))
    }
}

/// A loader with no modules; every `require` fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLoader;

impl ModuleLoader for NoLoader {
    fn require(&self, name: &str) -> Result<HostValue, HostError> {
        Err(HostError::ModuleNotFound(name.to_owned()))
    }
}

/// Forwards guest diagnostics to `tracing` at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ByteSink for TracingSink {
    fn write_line(&self, line: &str) {
        tracing::error!(target: "keystone::guest", "{}", line);
    }
}
