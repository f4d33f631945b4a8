use std::any::Any;
use std::ffi::c_int;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use nix::sys::signal::Signal;
use signal_hook::consts::FORBIDDEN;
use signal_hook::iterator::{Handle, Signals};

use crate::collector::{stacks, DumpCollector};
use crate::config::{SignalConfig, SinkConfig};
use crate::error::{log_hook, DiagnosticHook, Error};
use crate::{report, sink};

/// One capture, format and write cycle.
struct Pipeline {
    collector: DumpCollector,
    sink: SinkConfig,
    hook: DiagnosticHook,
}

impl Pipeline {
    /// Returns whether the report reached its destination. Errors and panics
    /// end here, at the hook.
    fn run(&self, signal: Option<Signal>) -> bool {
        let ret = panic::catch_unwind(AssertUnwindSafe(|| {
            let snapshot = self.collector.capture(signal);
            for issue in &snapshot.degraded {
                (self.hook)(issue);
            }
            let report = report::format(&snapshot);
            sink::write(&self.sink.destination(), &report)
        }));
        match ret {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                (self.hook)(&err);
                false
            }
            Err(payload) => {
                (self.hook)(&Error::Panicked(panic_message(payload)));
                false
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub struct WatcherBuilder {
    signal: SignalConfig,
    sink: SinkConfig,
    collector: DumpCollector,
    hook: DiagnosticHook,
}

impl Default for WatcherBuilder {
    fn default() -> Self {
        Self {
            signal: SignalConfig::default(),
            sink: SinkConfig::Env,
            collector: DumpCollector::default(),
            hook: log_hook(),
        }
    }
}

impl WatcherBuilder {
    /// Read the signal from `SIGDUMP_SIGNAL`; the destination follows
    /// `SIGDUMP_PATH` on every dump.
    pub fn from_env() -> Self {
        Self {
            signal: SignalConfig::from_env(),
            ..Default::default()
        }
    }

    pub fn signal(mut self, name: impl Into<String>) -> Self {
        self.signal = SignalConfig::new(name);
        self
    }

    /// Pin the destination instead of reading `SIGDUMP_PATH` per dump.
    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.sink = SinkConfig::Fixed(destination.into());
        self
    }

    pub fn collector(mut self, collector: DumpCollector) -> Self {
        self.collector = collector;
        self
    }

    pub fn diagnostic_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.hook = Arc::new(hook);
        self
    }

    /// Arm the watcher. Configuration problems are reported to the hook and
    /// leave an inert watcher behind; they never fail the caller.
    pub fn start(self) -> SignalWatcher {
        let hook = self.hook;
        let signal = match self.signal.resolve() {
            Ok(signal) => signal,
            Err(err) => {
                hook(&err);
                return SignalWatcher::inert();
            }
        };

        let mut collector = self.collector;
        if collector.signals_threads() && stacks::capture_signal() == Some(signal) {
            hook(&Error::Stacks(format!(
                "{signal} is also used to capture thread stacks, dumps will show the dumping thread only"
            )));
            collector = collector.calling_thread_only();
        }

        if FORBIDDEN.contains(&(signal as c_int)) {
            hook(&Error::Register {
                signal: signal.to_string(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "signal cannot be caught"),
            });
            return SignalWatcher::inert();
        }
        let mut signals = match Signals::new([signal as c_int]) {
            Ok(signals) => signals,
            Err(source) => {
                hook(&Error::Register {
                    signal: signal.to_string(),
                    source,
                });
                return SignalWatcher::inert();
            }
        };
        let handle = signals.handle();

        let dumps = Arc::new(AtomicU64::new(0));
        let pipeline = Pipeline {
            collector,
            sink: self.sink,
            hook: hook.clone(),
        };
        let counter = dumps.clone();
        let spawned = thread::Builder::new()
            .name("sigdump".to_string())
            .spawn(move || {
                // pending deliveries are merged, so a storm queues at most one dump
                for raw in signals.forever() {
                    let received = Signal::try_from(raw).ok();
                    log::debug!("sigdump: received signal {raw}");
                    if pipeline.run(received) {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                }
                log::debug!("sigdump: watcher stopped");
            });

        match spawned {
            Ok(thread) => {
                log::debug!("sigdump: watching {signal}");
                SignalWatcher {
                    signal: Some(signal),
                    dumps,
                    handle: Some(handle),
                    thread: Some(thread),
                }
            }
            Err(source) => {
                handle.close();
                hook(&Error::Register {
                    signal: signal.to_string(),
                    source,
                });
                SignalWatcher::inert()
            }
        }
    }
}

/// Background listener that dumps the process state whenever its signal
/// arrives.
///
/// Dropping the watcher detaches it: the listener keeps serving signals
/// until the process exits. Call [`SignalWatcher::stop`] to shut it down.
pub struct SignalWatcher {
    signal: Option<Signal>,
    dumps: Arc<AtomicU64>,
    handle: Option<Handle>,
    thread: Option<JoinHandle<()>>,
}

impl SignalWatcher {
    pub fn builder() -> WatcherBuilder {
        WatcherBuilder::default()
    }

    pub fn from_env() -> SignalWatcher {
        WatcherBuilder::from_env().start()
    }

    fn inert() -> SignalWatcher {
        SignalWatcher {
            signal: None,
            dumps: Arc::new(AtomicU64::new(0)),
            handle: None,
            thread: None,
        }
    }

    /// False when the configuration left the watcher without a handler.
    pub fn is_active(&self) -> bool {
        self.thread.is_some()
    }

    pub fn signal(&self) -> Option<Signal> {
        self.signal
    }

    /// Reports written so far. Dropped dumps only reach the diagnostic hook.
    pub fn dump_count(&self) -> u64 {
        self.dumps.load(Ordering::SeqCst)
    }

    /// Stop listening. A dump in flight is finished first.
    pub fn stop(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.close();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("sigdump: watcher thread panicked");
            }
        }
    }
}

impl fmt::Debug for SignalWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalWatcher")
            .field("signal", &self.signal)
            .field("active", &self.is_active())
            .field("dumps", &self.dump_count())
            .finish()
    }
}
