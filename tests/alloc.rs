use sigdump::alloc::AllocStats;
use sigdump::collector::memstats::{MemStatsSource, ProcessMemStats};
use sigdump::CountingAllocator;

#[global_allocator]
static GLOBAL: CountingAllocator = CountingAllocator::system();

#[test]
fn test_global_allocator_counts() {
    let before = AllocStats::read().unwrap();

    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    buf.push(1);
    let during = AllocStats::read().unwrap();
    drop(buf);
    let after = AllocStats::read().unwrap();

    assert!(during.total_bytes >= before.total_bytes + 4096);
    assert!(during.mallocs > before.mallocs);
    assert!(after.frees > during.frees);
    assert!(after.total_bytes >= during.total_bytes);
}

#[test]
fn test_process_counters_use_allocator() {
    let mut issues = vec![];
    let stats = ProcessMemStats.read(&mut issues);

    assert!(stats.mallocs > 0);
    assert_eq!(stats.heap_alloc, stats.alloc);
    assert!(!issues
        .iter()
        .any(|e| e.to_string().contains("CountingAllocator")));
}
