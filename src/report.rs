use std::fmt::{self, Write};

use chrono::SecondsFormat;

use crate::collector::stacks::{Frame, ThreadStack, ThreadState};
use crate::collector::DumpSnapshot;

const IP_WIDTH: usize = 2 + 2 * std::mem::size_of::<usize>();

/// Render a snapshot as the plain text report.
pub fn format(snapshot: &DumpSnapshot) -> String {
    let mut buf = String::new();
    // writing into a String cannot fail
    let _ = write_report(&mut buf, snapshot);
    buf
}

pub fn write_report(w: &mut impl Write, snapshot: &DumpSnapshot) -> fmt::Result {
    writeln!(
        w,
        "Sigdump time={} host={} pid={} ppid={} signal={}",
        snapshot
            .captured_at
            .to_rfc3339_opts(SecondsFormat::Secs, true),
        snapshot.hostname,
        snapshot.pid,
        snapshot.ppid,
        snapshot.signal_name(),
    )?;

    for thread in &snapshot.threads {
        write_thread(w, thread)?;
    }
    for issue in &snapshot.degraded {
        writeln!(w, "  degraded: {issue}")?;
    }

    writeln!(w)?;
    writeln!(w, "  Mem Stat:")?;
    for (name, value) in snapshot.mem_stats.counters() {
        writeln!(w, "\t{name} = {value}")?;
    }
    Ok(())
}

fn write_thread(w: &mut impl Write, thread: &ThreadStack) -> fmt::Result {
    let state = match &thread.state {
        ThreadState::Current => "current".to_string(),
        ThreadState::Captured => "captured".to_string(),
        ThreadState::Unavailable(reason) => format!("unavailable: {reason}"),
    };
    writeln!(w, "  thread {} {:?} [{}]:", thread.tid, thread.name, state)?;
    if thread.frames.is_empty() {
        writeln!(w, "\t<no frames>")?;
    }
    for (idx, frame) in thread.frames.iter().enumerate() {
        write_frame(w, idx, frame)?;
    }
    writeln!(w)
}

fn write_frame(w: &mut impl Write, idx: usize, frame: &Frame) -> fmt::Result {
    writeln!(w, "\tframe #{:<2} - {:#0width$x}:", idx, frame.ip, width = IP_WIDTH)?;
    if frame.symbols.is_empty() {
        return writeln!(w, "\t\t<unknown>");
    }
    for symbol in &frame.symbols {
        writeln!(w, "\t\t{}", symbol.name.as_deref().unwrap_or("<unknown>"))?;
        if let (Some(file), Some(lineno)) = (&symbol.file, symbol.lineno) {
            writeln!(w, "\t\t  at {file} : {lineno}")?;
        }
    }
    Ok(())
}
