//! Host capability traits.
//!
//! The guest never discovers host facilities by poking at ambient globals.
//! Each facility it may use is one of these traits, and the concrete
//! adapters are chosen once, when the bridge is built, through
//! [`Capabilities`].

use std::fmt;
use std::sync::Arc;

use crate::error::HostError;
use crate::os_caps::{OsRandom, TracingSink};
use crate::value::HostValue;

/// Secure random bytes.
pub trait RandomSource: Send + Sync + fmt::Debug {
    /// Fill `dest` entirely with random bytes.
    fn fill(&self, dest: &mut [u8]) -> Result<(), HostError>;
}

/// Resolves named host modules for the guest's `require` import.
pub trait ModuleLoader: Send + Sync + fmt::Debug {
    fn require(&self, name: &str) -> Result<HostValue, HostError>;
}

/// Destination for diagnostic text emitted by the guest.
pub trait ByteSink: Send + Sync + fmt::Debug {
    fn write_line(&self, line: &str);
}

/// The capability set a bridge instance is built with.
#[derive(Debug, Clone)]
pub struct Capabilities {
    /// Random source handed out by the `random_source` import. `None` makes
    /// that import raise [`HostError::Unavailable`].
    pub random: Option<Arc<dyn RandomSource>>,
    /// Loader handed out by the `module_loader` import. `None` makes that
    /// import return `undefined`.
    pub loader: Option<Arc<dyn ModuleLoader>>,
    /// Sink for `console_error` output.
    pub sink: Arc<dyn ByteSink>,
}

impl Capabilities {
    /// OS randomness, no module loader, guest errors logged through tracing.
    pub fn os() -> Self {
        Self {
            random: Some(Arc::new(OsRandom)),
            loader: None,
            sink: Arc::new(TracingSink),
        }
    }

    pub fn with_random(mut self, random: impl RandomSource + 'static) -> Self {
        self.random = Some(Arc::new(random));
        self
    }

    pub fn without_random(mut self) -> Self {
        self.random = None;
        self
    }

    pub fn with_loader(mut self, loader: impl ModuleLoader + 'static) -> Self {
        self.loader = Some(Arc::new(loader));
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ByteSink>) -> Self {
        self.sink = sink;
        self
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::os()
    }
}
