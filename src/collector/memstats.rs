use std::fmt;

use crate::alloc::AllocStats;
use crate::error::Error;

/// Memory counters in the order they are printed.
///
/// The names follow the widely known runtime `MemStats` layout so that dumps
/// from different services line up. Counters that only make sense for a
/// garbage collected heap are always zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemStats {
    pub alloc: u64,
    pub total_alloc: u64,
    pub sys: u64,
    pub lookups: u64,
    pub mallocs: u64,
    pub frees: u64,
    pub heap_alloc: u64,
    pub heap_sys: u64,
    pub heap_idle: u64,
    pub heap_inuse: u64,
    pub heap_released: u64,
    pub heap_objects: u64,
    pub stack_inuse: u64,
    pub stack_sys: u64,
    pub mspan_inuse: u64,
    pub mspan_sys: u64,
    pub mcache_inuse: u64,
    pub mcache_sys: u64,
    pub buck_hash_sys: u64,
    pub gc_sys: u64,
    pub other_sys: u64,
    pub next_gc: u64,
    pub last_gc: u64,
    pub pause_total_ns: u64,
    pub num_gc: u32,
    pub gc_cpu_fraction: f64,
    pub debug_gc: bool,
}

pub const COUNTER_NAMES: [&str; 27] = [
    "Alloc",
    "TotalAlloc",
    "Sys",
    "Lookups",
    "Mallocs",
    "Frees",
    "HeapAlloc",
    "HeapSys",
    "HeapIdle",
    "HeapInuse",
    "HeapReleased",
    "HeapObjects",
    "StackInuse",
    "StackSys",
    "MSpanInuse",
    "MSpanSys",
    "MCacheInuse",
    "MCacheSys",
    "BuckHashSys",
    "GCSys",
    "OtherSys",
    "NextGC",
    "LastGC",
    "PauseTotalNs",
    "NumGC",
    "GCCPUFraction",
    "DebugGC",
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CounterValue {
    Uint(u64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for CounterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CounterValue::Uint(v) => write!(f, "{v}"),
            CounterValue::Float(v) => write!(f, "{v}"),
            CounterValue::Bool(v) => write!(f, "{v}"),
        }
    }
}

impl MemStats {
    /// `(name, value)` pairs in [`COUNTER_NAMES`] order.
    pub fn counters(&self) -> [(&'static str, CounterValue); 27] {
        use CounterValue::*;
        let values = [
            Uint(self.alloc),
            Uint(self.total_alloc),
            Uint(self.sys),
            Uint(self.lookups),
            Uint(self.mallocs),
            Uint(self.frees),
            Uint(self.heap_alloc),
            Uint(self.heap_sys),
            Uint(self.heap_idle),
            Uint(self.heap_inuse),
            Uint(self.heap_released),
            Uint(self.heap_objects),
            Uint(self.stack_inuse),
            Uint(self.stack_sys),
            Uint(self.mspan_inuse),
            Uint(self.mspan_sys),
            Uint(self.mcache_inuse),
            Uint(self.mcache_sys),
            Uint(self.buck_hash_sys),
            Uint(self.gc_sys),
            Uint(self.other_sys),
            Uint(self.next_gc),
            Uint(self.last_gc),
            Uint(self.pause_total_ns),
            Uint(self.num_gc as u64),
            Float(self.gc_cpu_fraction),
            Bool(self.debug_gc),
        ];
        let mut idx = 0;
        values.map(|value| {
            let name = COUNTER_NAMES[idx];
            idx += 1;
            (name, value)
        })
    }
}

/// Where a dump reads its memory counters from.
///
/// Implementations fill what they can and push an error for every counter
/// group they could not read; they never fail the dump.
pub trait MemStatsSource: Send + Sync {
    fn read(&self, issues: &mut Vec<Error>) -> MemStats;
}

/// Counters of the current process: allocation counts from
/// [`CountingAllocator`](crate::CountingAllocator), address space from procfs.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessMemStats;

impl MemStatsSource for ProcessMemStats {
    fn read(&self, issues: &mut Vec<Error>) -> MemStats {
        let mut stats = MemStats::default();

        match AllocStats::read() {
            Some(alloc) => {
                stats.alloc = alloc.live_bytes;
                stats.total_alloc = alloc.total_bytes;
                stats.mallocs = alloc.mallocs;
                stats.frees = alloc.frees;
                stats.heap_alloc = alloc.live_bytes;
                stats.heap_inuse = alloc.live_bytes;
                stats.heap_objects = alloc.live_objects();
            }
            None => issues.push(Error::MemStats(
                "CountingAllocator is not the global allocator, allocation counters are zero"
                    .to_string(),
            )),
        }

        read_address_space(&mut stats, issues);
        stats
    }
}

#[cfg(target_os = "linux")]
fn read_address_space(stats: &mut MemStats, issues: &mut Vec<Error>) {
    let status = match procfs::process::Process::myself().and_then(|p| p.status()) {
        Ok(status) => status,
        Err(err) => {
            issues.push(Error::MemStats(format!("unable to read /proc/self/status: {err}")));
            return;
        }
    };
    let bytes = |kb: Option<u64>| kb.unwrap_or(0).saturating_mul(1024);

    stats.sys = bytes(status.vmsize);
    stats.heap_sys = bytes(status.vmdata);
    stats.heap_idle = stats.heap_sys.saturating_sub(stats.heap_inuse);
    stats.stack_inuse = bytes(status.vmstk);
    stats.stack_sys = stats.stack_inuse;
    stats.other_sys = bytes(status.vmpte);
}

#[cfg(not(target_os = "linux"))]
fn read_address_space(_stats: &mut MemStats, issues: &mut Vec<Error>) {
    issues.push(Error::MemStats(
        "address space counters are only available on linux".to_string(),
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_follow_names() {
        let stats = MemStats {
            alloc: 1,
            total_alloc: 2,
            num_gc: 7,
            gc_cpu_fraction: 0.5,
            debug_gc: true,
            ..Default::default()
        };
        let counters = stats.counters();

        let names: Vec<_> = counters.iter().map(|(name, _)| *name).collect();
        assert_eq!(names, COUNTER_NAMES);
        assert_eq!(counters[0].1, CounterValue::Uint(1));
        assert_eq!(counters[1].1, CounterValue::Uint(2));
        assert_eq!(counters[24], ("NumGC", CounterValue::Uint(7)));
        assert_eq!(counters[25].1.to_string(), "0.5");
        assert_eq!(counters[26].1.to_string(), "true");
    }

    #[test]
    fn test_zero_values_render() {
        let counters = MemStats::default().counters();
        assert_eq!(counters[25].1.to_string(), "0");
        assert_eq!(counters[26].1.to_string(), "false");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_process_address_space() {
        let mut issues = vec![];
        let stats = ProcessMemStats.read(&mut issues);
        assert!(stats.sys > 0);
        assert!(stats.heap_idle <= stats.heap_sys);
        // the test harness does not install the counting allocator
        assert!(issues
            .iter()
            .all(|e| e.kind() == crate::ErrorKind::CaptureDegradation));
    }

    #[test]
    fn test_allocation_counters_need_global_allocator() {
        assert_eq!(crate::alloc::AllocStats::read(), None);

        let mut issues = vec![];
        let stats = ProcessMemStats.read(&mut issues);
        assert_eq!(stats.mallocs, 0);
        assert_eq!(stats.heap_objects, 0);
        assert!(issues
            .iter()
            .any(|e| e.to_string().contains("CountingAllocator is not the global allocator")));
    }
}
