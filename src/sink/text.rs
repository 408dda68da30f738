use std::io::Write;

use super::literal::ByteLiteral;
use super::{EventSink, SinkError};
use crate::tracer::event::EventRecord;

/// Two-line human-readable rendering per event:
///
/// ```text
/// <INPUT pid=2579 tid=2579 time=... rawtime=... cgid=... inode=... pidtgid=... nsid=... comm=b'bash' len=1>
/// b'e'
/// ```
pub struct TextSink<W: Write> {
    writer: W,
    flush_each_event: bool,
}

impl<W: Write> TextSink<W> {
    pub fn new(writer: W, flush_each_event: bool) -> Self {
        Self {
            writer,
            flush_each_event,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Write the header and payload lines for one event.
pub fn write_event<W: Write>(w: &mut W, event: &EventRecord) -> std::io::Result<()> {
    let raw = &event.raw;
    writeln!(
        w,
        "<{} pid={} tid={} time={} rawtime={} cgid={} inode={} pidtgid={} nsid={} comm={} len={}>",
        event.direction(),
        event.pid(),
        event.tgid(),
        event.wall_time_ns,
        raw.rawtime,
        raw.cgid,
        raw.inode,
        raw.pidtgid,
        raw.nsid,
        ByteLiteral(raw.comm.as_bytes()),
        raw.len(),
    )?;
    writeln!(w, "{}", ByteLiteral(&raw.buf))
}

impl<W: Write + Send> EventSink for TextSink<W> {
    fn name(&self) -> &str {
        "text"
    }

    fn handle_event(&mut self, event: &EventRecord) -> Result<(), SinkError> {
        write_event(&mut self.writer, event)?;
        if self.flush_each_event {
            self.writer.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}
