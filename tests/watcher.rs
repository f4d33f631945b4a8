use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::{Duration, Instant};

use chrono::{DateTime, FixedOffset};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{getppid, Pid};
use sigdump::collector::memstats::COUNTER_NAMES;
use sigdump::{Error, ErrorKind, SignalWatcher};

// Every test arms its own signal so they can run side by side.

fn send(sig: Signal) {
    kill(Pid::this(), sig).unwrap();
}

fn wait_for_dumps(watcher: &SignalWatcher, count: u64) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while watcher.dump_count() < count {
        assert!(Instant::now() < deadline, "timed out waiting for dump #{count}");
        sleep(Duration::from_millis(10));
    }
}

fn check_report(report: &str, signal: &str) -> DateTime<FixedOffset> {
    let header = report.lines().next().unwrap();
    let rest = header.strip_prefix("Sigdump time=").unwrap();
    let (time, fields) = rest.split_once(' ').unwrap();
    assert!(fields.starts_with("host="));
    assert!(fields.ends_with(&format!(
        " pid={} ppid={} signal={signal}",
        std::process::id(),
        getppid()
    )));

    assert!(report.contains("\n  thread "));
    let (_, mem) = report.split_once("\n  Mem Stat:\n").unwrap();
    let labels: Vec<&str> = mem
        .lines()
        .map(|line| line.trim_start().split(" = ").next().unwrap())
        .collect();
    assert_eq!(labels, COUNTER_NAMES);

    DateTime::parse_from_rfc3339(time).unwrap()
}

fn read_report(path: &Path) -> String {
    fs::read_to_string(path).unwrap()
}

#[test]
fn test_signal_writes_report_to_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dump.log");
    let watcher = SignalWatcher::builder()
        .signal("SIGUSR1")
        .destination(path.to_string_lossy())
        .start();
    assert!(watcher.is_active());
    assert_eq!(watcher.signal(), Some(Signal::SIGUSR1));

    send(Signal::SIGUSR1);
    wait_for_dumps(&watcher, 1);

    let report = read_report(&path);
    check_report(&report, "SIGUSR1");
    // the only thing in the file is the report
    assert!(report.starts_with("Sigdump time="));
    assert!(report.ends_with('\n'));
    watcher.stop();
}

#[test]
fn test_sequential_dumps() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dump.log");
    let watcher = SignalWatcher::builder()
        .signal("SIGUSR2")
        .destination(path.to_string_lossy())
        .start();

    let mut times = vec![];
    for n in 1..=3 {
        send(Signal::SIGUSR2);
        wait_for_dumps(&watcher, n);
        times.push(check_report(&read_report(&path), "SIGUSR2"));
    }

    assert_eq!(watcher.dump_count(), 3);
    assert!(times.windows(2).all(|w| w[0] <= w[1]));
    watcher.stop();
}

#[test]
fn test_signal_burst_is_bounded() {
    const BURST: u64 = 200;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dump.log");
    let dropped = Arc::new(Mutex::new(vec![]));
    let seen = dropped.clone();
    let watcher = SignalWatcher::builder()
        .signal("SIGWINCH")
        .destination(path.to_string_lossy())
        .diagnostic_hook(move |err| {
            if err.kind() == ErrorKind::Sink || matches!(err, Error::Panicked(_)) {
                seen.lock().unwrap().push(err.to_string());
            }
        })
        .start();

    for _ in 0..BURST {
        send(Signal::SIGWINCH);
    }
    wait_for_dumps(&watcher, 1);
    // let the merged pending delivery drain
    sleep(Duration::from_millis(500));

    // one dump in flight plus at most one pending
    let dumps = watcher.dump_count();
    assert!((1..=3).contains(&dumps), "{dumps} dumps for {BURST} signals");
    watcher.stop();

    assert_eq!(*dropped.lock().unwrap(), Vec::<String>::new());
    let report = read_report(&path);
    check_report(&report, "SIGWINCH");
    assert_eq!(report.matches("Sigdump time=").count(), 1);
}

#[test]
fn test_default_destination() {
    if std::env::var_os("SIGDUMP_PATH").is_some() {
        return;
    }
    let path = sigdump::sink::default_path(std::process::id());
    let _ = fs::remove_file(&path);

    let watcher = SignalWatcher::builder().signal("SIGALRM").start();
    send(Signal::SIGALRM);
    wait_for_dumps(&watcher, 1);
    watcher.stop();

    let report = read_report(&path);
    check_report(&report, "SIGALRM");
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_unknown_signal_installs_nothing() {
    let watcher = SignalWatcher::builder()
        .signal("SIGDOESNOTEXIST")
        .diagnostic_hook(|_| {})
        .start();
    assert!(!watcher.is_active());
    assert_eq!(watcher.dump_count(), 0);
    watcher.stop();
}

#[test]
fn test_stopped_watcher_ignores_signal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dump.log");
    let watcher = SignalWatcher::builder()
        .signal("SIGCHLD")
        .destination(path.to_string_lossy())
        .start();
    assert!(watcher.is_active());
    watcher.stop();

    send(Signal::SIGCHLD);
    sleep(Duration::from_millis(200));
    assert!(!path.exists());
}

#[test]
fn test_dump_now() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("now.log");

    sigdump::dump_now(&path.to_string_lossy()).unwrap();

    let report = read_report(&path);
    check_report(&report, "none");
    assert!(report.contains("[current]"));
}
