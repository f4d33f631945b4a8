use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const DEFAULT_DUMP_DIR: &str = "/tmp";

/// File a dump goes to when no destination is configured.
pub fn default_path(pid: u32) -> PathBuf {
    Path::new(DEFAULT_DUMP_DIR).join(format!("sigdump-{pid}.log"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sink {
    Stdout,
    Stderr,
    File(PathBuf),
}

impl Sink {
    pub fn resolve(destination: &str) -> Sink {
        match destination {
            "-" => Sink::Stdout,
            "+" => Sink::Stderr,
            "" => Sink::File(default_path(std::process::id())),
            path => Sink::File(PathBuf::from(path)),
        }
    }

    pub fn write(&self, report: &str) -> Result<()> {
        let ret = match self {
            Sink::Stdout => write_stream(io::stdout().lock(), report),
            Sink::Stderr => write_stream(io::stderr().lock(), report),
            Sink::File(path) => write_file(path, report),
        };
        ret.map_err(|source| Error::Sink {
            target: self.to_string(),
            source,
        })
    }
}

impl fmt::Display for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sink::Stdout => f.write_str("<stdout>"),
            Sink::Stderr => f.write_str("<stderr>"),
            Sink::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Resolve `destination` and write `report` to it.
pub fn write(destination: &str, report: &str) -> Result<()> {
    Sink::resolve(destination).write(report)
}

// The process owns its standard streams; they are flushed but never closed.
fn write_stream(mut stream: impl Write, report: &str) -> io::Result<()> {
    stream.write_all(report.as_bytes())?;
    stream.flush()
}

fn write_file(path: &Path, report: &str) -> io::Result<()> {
    let mut file = File::create(path)?;
    if let Err(err) = file.write_all(report.as_bytes()).and_then(|_| file.flush()) {
        // a half-written report is worse than none
        let _ = file.set_len(0);
        return Err(err);
    }
    Ok(())
}
