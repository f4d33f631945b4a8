//! Dump the stacks of every thread and the memory counters of a running
//! process when it receives a signal.
//!
//! ```no_run
//! // SIGDUMP_SIGNAL picks the signal (default SIGCONT), SIGDUMP_PATH the
//! // destination (default /tmp/sigdump-<pid>.log, `-` stdout, `+` stderr).
//! let watcher = sigdump::start();
//! // ... run the service; `kill -CONT <pid>` writes a report.
//! watcher.stop();
//! ```
//!
//! Nothing in here ever fails the host: a bad configuration leaves the
//! watcher inert and a failed dump is dropped. Every such error is handed to
//! the [`DiagnosticHook`], which logs through the `log` crate by default.

#[cfg(feature = "auto-start")]
#[macro_use]
extern crate ctor;

pub mod alloc;
pub mod collector;
pub mod config;
pub mod error;
pub mod report;
pub mod sink;
pub mod watcher;

pub use crate::alloc::CountingAllocator;
pub use crate::collector::{DumpCollector, DumpSnapshot};
pub use crate::error::{DiagnosticHook, Error, ErrorKind, Result};
pub use crate::watcher::{SignalWatcher, WatcherBuilder};

/// Start a watcher configured from `SIGDUMP_SIGNAL` and `SIGDUMP_PATH`.
pub fn start() -> SignalWatcher {
    SignalWatcher::from_env()
}

/// Write one report right away, without waiting for a signal.
pub fn dump_now(destination: &str) -> Result<()> {
    let snapshot = DumpCollector::new().capture(None);
    for issue in &snapshot.degraded {
        log::debug!("sigdump: {issue}");
    }
    sink::write(destination, &report::format(&snapshot))
}

#[cfg(feature = "auto-start")]
#[ctor]
fn init() {
    // dropping detaches, the listener keeps running until exit
    let watcher = start();
    log::debug!("sigdump: started at load time: {watcher:?}");
}
