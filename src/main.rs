use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use env_logger::Env;
use sigdump::{CountingAllocator, SignalWatcher};

#[global_allocator]
static GLOBAL: CountingAllocator = CountingAllocator::system();

const ENV_SIGDUMP_LOGLEVEL: &str = "SIGDUMP_LOGLEVEL";

/// Idle process with a sigdump watcher, to try dumps with `kill`
#[derive(Parser, Debug)]
#[command(version)]
struct Cli {
    /// signal that triggers a dump
    #[arg(short, long, env = "SIGDUMP_SIGNAL", default_value = "SIGCONT")]
    signal: String,

    /// `-` for stdout, `+` for stderr or a file path; follows SIGDUMP_PATH per dump when omitted
    #[arg(short, long)]
    path: Option<String>,

    /// number of worker threads to run
    #[arg(short, long, default_value_t = 2)]
    workers: usize,

    /// write one report immediately and exit
    #[arg(long)]
    once: bool,
}

fn main() -> Result<()> {
    env_logger::init_from_env(Env::new().filter(ENV_SIGDUMP_LOGLEVEL));
    let cli = Cli::parse();

    if cli.once {
        sigdump::dump_now(cli.path.as_deref().unwrap_or("-"))?;
        return Ok(());
    }

    let mut builder = SignalWatcher::builder().signal(cli.signal.as_str());
    if let Some(path) = cli.path {
        builder = builder.destination(path);
    }
    let watcher = builder.start();
    if !watcher.is_active() {
        anyhow::bail!("unable to watch signal {}", cli.signal);
    }

    for idx in 0..cli.workers {
        thread::Builder::new()
            .name(format!("worker-{idx}"))
            .spawn(move || worker(idx))?;
    }

    println!(
        "pid {} dumps on {}, try `kill -{} {}`",
        std::process::id(),
        cli.signal,
        cli.signal.trim_start_matches("SIG"),
        std::process::id()
    );
    loop {
        thread::park();
    }
}

fn worker(idx: usize) {
    let mut buf: Vec<u64> = vec![];
    loop {
        buf.push(idx as u64);
        if buf.len() > 1024 {
            buf.clear();
        }
        thread::sleep(Duration::from_millis(500));
    }
}
