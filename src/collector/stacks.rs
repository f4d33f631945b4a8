//! Call stacks of the live threads of this process.
//!
//! On linux every thread other than the caller is interrupted with a directed
//! capture signal. The handler only records raw instruction pointers into a
//! static slot; symbols are resolved afterwards on the dumping thread.

use std::ffi::c_void;

use crate::error::Error;

pub const MAX_FRAMES: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSymbol {
    pub name: Option<String>,
    pub file: Option<String>,
    pub lineno: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub ip: usize,
    /// More than one when the frame contains inlined calls.
    pub symbols: Vec<FrameSymbol>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadState {
    /// The thread that produced the dump.
    Current,
    /// Frames taken while the thread was paused in the capture handler.
    Captured,
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadStack {
    pub tid: i32,
    pub name: String,
    pub state: ThreadState,
    pub frames: Vec<Frame>,
}

/// Capture every live thread, or only the calling one when `signal_threads`
/// is false or the platform cannot interrupt other threads.
pub fn capture_threads(signal_threads: bool, issues: &mut Vec<Error>) -> Vec<ThreadStack> {
    if signal_threads {
        #[cfg(target_os = "linux")]
        {
            match remote::capture_all(issues) {
                Ok(threads) => return threads,
                Err(err) => issues.push(err),
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            issues.push(Error::Stacks(
                "other threads can only be captured on linux, showing the dumping thread only"
                    .to_string(),
            ));
        }
    } else {
        issues.push(Error::Stacks(
            "thread capture disabled, showing the dumping thread only".to_string(),
        ));
    }
    vec![current_thread()]
}

pub fn current_thread() -> ThreadStack {
    let mut ips = Vec::with_capacity(MAX_FRAMES);
    backtrace::trace(|frame| {
        ips.push(frame.ip() as usize);
        ips.len() < MAX_FRAMES
    });
    let name = std::thread::current()
        .name()
        .unwrap_or("<unnamed>")
        .to_string();
    ThreadStack {
        tid: current_tid(),
        name,
        state: ThreadState::Current,
        frames: resolve_ips(&ips),
    }
}

#[cfg(target_os = "linux")]
fn current_tid() -> i32 {
    nix::unistd::gettid().as_raw()
}

#[cfg(not(target_os = "linux"))]
fn current_tid() -> i32 {
    std::process::id() as i32
}

pub fn resolve_ips(ips: &[usize]) -> Vec<Frame> {
    ips.iter()
        .map(|&ip| {
            let mut symbols = vec![];
            backtrace::resolve(ip as *mut c_void, |symbol| {
                symbols.push(FrameSymbol {
                    name: symbol.name().map(|n| n.to_string()),
                    file: symbol.filename().map(|f| f.to_string_lossy().to_string()),
                    lineno: symbol.lineno(),
                });
            });
            Frame { ip, symbols }
        })
        .collect()
}

/// Drop the frames of the capture handler itself, up to and including the
/// signal dispatcher. Unresolved stacks are kept whole.
fn skip_handler_frames(frames: Vec<Frame>) -> Vec<Frame> {
    let dispatcher = frames.iter().position(|frame| {
        frame.symbols.iter().any(|s| {
            s.name
                .as_deref()
                .is_some_and(|name| name.starts_with("signal_hook_registry::handler"))
        })
    });
    match dispatcher {
        Some(idx) => frames.into_iter().skip(idx + 1).collect(),
        None => frames,
    }
}

#[cfg(target_os = "linux")]
mod remote {
    use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
    use std::sync::{Mutex, PoisonError};
    use std::thread;
    use std::time::{Duration, Instant};

    use nix::errno::Errno;
    use nix::libc;
    use nix::sys::signal::Signal;
    use nix::unistd::{getpid, gettid};
    use once_cell::sync::Lazy;

    use super::*;

    /// Ignored by default, so a late delivery is harmless.
    pub const CAPTURE_SIGNAL: Signal = Signal::SIGURG;

    const REPLY_TIMEOUT: Duration = Duration::from_millis(100);
    const HANDLER_TIMEOUT: Duration = Duration::from_secs(1);

    const IDLE: i32 = 0;
    const CLAIMED: i32 = -1;

    struct CaptureSlot {
        /// tid asked to reply, `CLAIMED` while its handler writes.
        target: AtomicI32,
        done: AtomicBool,
        depth: AtomicUsize,
        ips: [AtomicUsize; MAX_FRAMES],
    }

    static SLOT: CaptureSlot = CaptureSlot {
        target: AtomicI32::new(IDLE),
        done: AtomicBool::new(false),
        depth: AtomicUsize::new(0),
        ips: [const { AtomicUsize::new(0) }; MAX_FRAMES],
    };

    // Set when a handler never finished; the slot can no longer be trusted.
    static WEDGED: AtomicBool = AtomicBool::new(false);

    static CAPTURE_LOCK: Mutex<()> = Mutex::new(());

    static HANDLER: Lazy<Result<(), String>> = Lazy::new(|| {
        let sig = CAPTURE_SIGNAL as libc::c_int;
        match unsafe { signal_hook_registry::register_unchecked(sig, on_capture_signal) } {
            Ok(_) => {
                log::debug!("Registered stack capture handler for {CAPTURE_SIGNAL}");
                Ok(())
            }
            Err(e) => Err(format!("unable to register {CAPTURE_SIGNAL} handler: {e}")),
        }
    });

    fn on_capture_signal(_: &libc::siginfo_t) {
        let tid = gettid().as_raw();
        if SLOT
            .target
            .compare_exchange(tid, CLAIMED, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let mut depth = 0;
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                SLOT.ips[depth].store(frame.ip() as usize, Ordering::Relaxed);
                depth += 1;
                depth < MAX_FRAMES
            });
        }
        SLOT.depth.store(depth, Ordering::Relaxed);
        SLOT.done.store(true, Ordering::Release);
    }

    pub fn capture_signal() -> Signal {
        CAPTURE_SIGNAL
    }

    fn live_threads() -> procfs::ProcResult<Vec<(i32, String)>> {
        let mut threads: Vec<(i32, String)> = procfs::process::Process::myself()?
            .tasks()?
            .flatten()
            .map(|task| {
                let name = task.stat().map(|stat| stat.comm).unwrap_or_default();
                (task.tid, name)
            })
            .collect();
        threads.sort_by_key(|(tid, _)| *tid);
        Ok(threads)
    }

    enum Reply {
        Frames(Vec<usize>),
        Exited,
        Failed(String),
    }

    pub fn capture_all(issues: &mut Vec<Error>) -> crate::Result<Vec<ThreadStack>> {
        HANDLER.as_ref().map_err(|e| Error::Stacks(e.clone()))?;
        if WEDGED.load(Ordering::Acquire) {
            return Err(Error::Stacks(
                "an earlier capture never completed, other threads are skipped".to_string(),
            ));
        }
        let _guard = CAPTURE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

        let threads = live_threads()
            .map_err(|e| Error::Stacks(format!("unable to list /proc/self/task: {e}")))?;
        // warm up the unwinder outside of signal context
        let current = current_thread();
        let pid = getpid().as_raw();

        let mut stacks = Vec::with_capacity(threads.len());
        for (tid, name) in threads {
            if tid == current.tid {
                stacks.push(ThreadStack {
                    name,
                    ..current.clone()
                });
                continue;
            }
            match request_frames(pid, tid) {
                Reply::Frames(ips) => stacks.push(ThreadStack {
                    tid,
                    name,
                    state: ThreadState::Captured,
                    frames: skip_handler_frames(resolve_ips(&ips)),
                }),
                Reply::Exited => log::debug!("thread {tid} exited before its stack was taken"),
                Reply::Failed(reason) => {
                    issues.push(Error::Stacks(format!("thread {tid} ({name}): {reason}")));
                    stacks.push(ThreadStack {
                        tid,
                        name,
                        state: ThreadState::Unavailable(reason),
                        frames: vec![],
                    });
                }
            }
        }
        Ok(stacks)
    }

    fn request_frames(pid: i32, tid: i32) -> Reply {
        if WEDGED.load(Ordering::Acquire) {
            return Reply::Failed("capture handler wedged".to_string());
        }
        SLOT.done.store(false, Ordering::Relaxed);
        SLOT.depth.store(0, Ordering::Relaxed);
        SLOT.target.store(tid, Ordering::Release);

        let ret = unsafe {
            libc::syscall(
                libc::SYS_tgkill,
                pid,
                tid,
                CAPTURE_SIGNAL as libc::c_int,
            )
        };
        if let Err(errno) = Errno::result(ret) {
            SLOT.target.store(IDLE, Ordering::Release);
            return match errno {
                Errno::ESRCH => Reply::Exited,
                errno => Reply::Failed(format!("tgkill failed: {errno}")),
            };
        }

        let start = Instant::now();
        while !SLOT.done.load(Ordering::Acquire) {
            let waited = start.elapsed();
            if waited >= REPLY_TIMEOUT {
                // withdraw the request unless the handler is already running
                if SLOT
                    .target
                    .compare_exchange(tid, IDLE, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Reply::Failed("no reply to capture signal".to_string());
                }
                if waited >= REPLY_TIMEOUT + HANDLER_TIMEOUT {
                    WEDGED.store(true, Ordering::Release);
                    return Reply::Failed("capture handler did not finish".to_string());
                }
            }
            thread::sleep(Duration::from_micros(50));
        }

        let depth = SLOT.depth.load(Ordering::Relaxed).min(MAX_FRAMES);
        let ips = SLOT.ips[..depth]
            .iter()
            .map(|ip| ip.load(Ordering::Relaxed))
            .collect();
        SLOT.target.store(IDLE, Ordering::Release);
        Reply::Frames(ips)
    }
}

/// Signal used to interrupt threads for their stacks, if any.
#[cfg(target_os = "linux")]
pub fn capture_signal() -> Option<nix::sys::signal::Signal> {
    Some(remote::capture_signal())
}

#[cfg(not(target_os = "linux"))]
pub fn capture_signal() -> Option<nix::sys::signal::Signal> {
    None
}
