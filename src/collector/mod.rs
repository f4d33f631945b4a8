pub mod memstats;
pub mod stacks;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Local};
use nix::sys::signal::Signal;

use crate::error::Error;
use memstats::{MemStats, MemStatsSource, ProcessMemStats};
use stacks::ThreadStack;

/// Everything one dump reports, taken at a single point in time.
#[derive(Debug)]
pub struct DumpSnapshot {
    pub captured_at: DateTime<Local>,
    pub hostname: String,
    pub pid: u32,
    pub ppid: i32,
    /// `None` when the dump was requested directly rather than by a signal.
    pub signal: Option<Signal>,
    pub threads: Vec<ThreadStack>,
    pub mem_stats: MemStats,
    /// What could not be collected for this snapshot.
    pub degraded: Vec<Error>,
}

impl DumpSnapshot {
    pub fn signal_name(&self) -> &'static str {
        self.signal.map(|sig| sig.as_str()).unwrap_or("none")
    }

    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }
}

#[derive(Clone)]
pub struct DumpCollector {
    mem_source: Arc<dyn MemStatsSource>,
    signal_threads: bool,
}

impl Default for DumpCollector {
    fn default() -> Self {
        Self {
            mem_source: Arc::new(ProcessMemStats),
            signal_threads: true,
        }
    }
}

impl fmt::Debug for DumpCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DumpCollector")
            .field("signal_threads", &self.signal_threads)
            .finish_non_exhaustive()
    }
}

impl DumpCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mem_source(mut self, source: impl MemStatsSource + 'static) -> Self {
        self.mem_source = Arc::new(source);
        self
    }

    /// Only report the thread that runs the dump.
    pub fn calling_thread_only(mut self) -> Self {
        self.signal_threads = false;
        self
    }

    pub fn signals_threads(&self) -> bool {
        self.signal_threads
    }

    /// Take a snapshot. Never fails: whatever cannot be read is left empty
    /// and listed in [`DumpSnapshot::degraded`].
    pub fn capture(&self, signal: Option<Signal>) -> DumpSnapshot {
        let captured_at = Local::now();
        let mut degraded = vec![];

        let threads = stacks::capture_threads(self.signal_threads, &mut degraded);
        let mem_stats = self.mem_source.read(&mut degraded);

        DumpSnapshot {
            captured_at,
            hostname: hostname(),
            pid: std::process::id(),
            ppid: nix::unistd::getppid().as_raw(),
            signal,
            threads,
            mem_stats,
            degraded,
        }
    }
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|e| {
            log::debug!("gethostname failed: {e}");
            String::new()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedStats;

    impl MemStatsSource for FixedStats {
        fn read(&self, _issues: &mut Vec<Error>) -> MemStats {
            MemStats {
                alloc: 4096,
                mallocs: 3,
                ..Default::default()
            }
        }
    }

    #[test]
    fn test_capture_fills_metadata() {
        let collector = DumpCollector::new()
            .calling_thread_only()
            .with_mem_source(FixedStats);
        let snapshot = collector.capture(Some(Signal::SIGCONT));

        assert_eq!(snapshot.pid, std::process::id());
        assert_eq!(snapshot.ppid, nix::unistd::getppid().as_raw());
        assert_eq!(snapshot.signal_name(), "SIGCONT");
        assert_eq!(snapshot.mem_stats.alloc, 4096);
        assert_eq!(snapshot.threads.len(), 1);
        // calling thread only is a degraded capture
        assert!(snapshot.is_degraded());
    }

    #[test]
    fn test_direct_dump_has_no_signal() {
        let snapshot = DumpCollector::new()
            .calling_thread_only()
            .with_mem_source(FixedStats)
            .capture(None);
        assert_eq!(snapshot.signal_name(), "none");
    }
}
