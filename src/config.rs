use std::env;
use std::str::FromStr;

use nix::sys::signal::Signal;

use crate::error::{Error, Result};

/// Name of the signal that triggers a dump.
pub const ENV_SIGDUMP_SIGNAL: &str = "SIGDUMP_SIGNAL";
/// Where dumps go: `-` for stdout, `+` for stderr, anything else is a path.
pub const ENV_SIGDUMP_PATH: &str = "SIGDUMP_PATH";

pub const DEFAULT_SIGNAL: &str = "SIGCONT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalConfig {
    pub name: String,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_SIGNAL.to_string(),
        }
    }
}

impl SignalConfig {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        if name.trim().is_empty() {
            return Self::default();
        }
        Self { name }
    }

    pub fn from_env() -> Self {
        env::var(ENV_SIGDUMP_SIGNAL)
            .map(Self::new)
            .unwrap_or_default()
    }

    /// Map the symbolic name (`SIGUSR1`, `SIGCONT`, ...) to a platform signal.
    pub fn resolve(&self) -> Result<Signal> {
        Signal::from_str(self.name.trim()).map_err(|_| Error::UnknownSignal(self.name.clone()))
    }
}

/// Destination selector. Unlike the signal it is looked up on every dump.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SinkConfig {
    /// Read `SIGDUMP_PATH` each time a dump is written.
    #[default]
    Env,
    Fixed(String),
}

impl SinkConfig {
    pub fn destination(&self) -> String {
        match self {
            SinkConfig::Env => env::var(ENV_SIGDUMP_PATH).unwrap_or_default(),
            SinkConfig::Fixed(dest) => dest.clone(),
        }
    }
}
