use std::io::Write;

use serde::Serialize;

use super::{EventSink, SinkError};
use crate::tracer::event::EventRecord;

/// One JSON object per line. `comm` and `buf` are hex-encoded since neither is
/// guaranteed to be text.
pub struct JsonSink<W: Write> {
    writer: W,
    flush_each_event: bool,
}

#[derive(Serialize)]
struct JsonEvent {
    direction: &'static str,
    pid: u32,
    tid: u32,
    time: u64,
    rawtime: u64,
    cgid: u64,
    inode: u64,
    pidtgid: u64,
    nsid: u64,
    comm: String,
    len: u32,
    buf: String,
}

impl From<&EventRecord> for JsonEvent {
    fn from(event: &EventRecord) -> Self {
        let raw = &event.raw;
        Self {
            direction: event.direction().as_str(),
            pid: event.pid(),
            tid: event.tgid(),
            time: event.wall_time_ns,
            rawtime: raw.rawtime,
            cgid: raw.cgid,
            inode: raw.inode,
            pidtgid: raw.pidtgid,
            nsid: raw.nsid,
            comm: hex::encode(raw.comm.as_bytes()),
            len: raw.len(),
            buf: hex::encode(&raw.buf),
        }
    }
}

impl<W: Write> JsonSink<W> {
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

impl<W: Write + Send> EventSink for JsonSink<W> {
    fn name(&self) -> &str {
        "json"
    }

    fn handle_event(&mut self, event: &EventRecord) -> Result<(), SinkError> {
        serde_json::to_writer(&mut self.writer, &JsonEvent::from(event))?;
        self.writer.write_all(b"\n")?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DecodedIdentity;
    use crate::tracer::event::{Comm, Direction, RawEventRecord};

    fn event(rawtime: u64, buf: &[u8], direction: Direction) -> EventRecord {
        let raw = RawEventRecord {
            rawtime,
            cgid: 7,
            inode: 0,
            pidtgid: 11_076_720_658_963,
            nsid: 4_026_531_836,
            comm: Comm::from_bytes(b"sshd"),
            buf: buf.to_vec(),
            direction,
        };
        EventRecord {
            identity: DecodedIdentity::decode(raw.pidtgid),
            raw,
            wall_time_ns: 1_700_000_000_000_000_000 + rawtime,
        }
    }

    #[test]
    fn test_one_object_per_line() {
        let mut sink = JsonSink::new(Vec::new(), false);
        sink.handle_event(&event(1, b"e", Direction::Input)).unwrap();
        sink.handle_event(&event(2, b"e", Direction::Output)).unwrap();
        sink.flush().unwrap();

        let out = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);

        let first = &lines[0];
        assert_eq!(first["direction"], "INPUT");
        assert_eq!(first["pid"], 2579);
        assert_eq!(first["tid"], 2579);
        assert_eq!(first["rawtime"], 1);
        assert_eq!(first["time"], 1_700_000_000_000_000_001u64);
        assert_eq!(first["inode"], 0);
        assert_eq!(first["comm"], "73736864");
        assert_eq!(first["len"], 1);
        assert_eq!(first["buf"], "65");

        assert_eq!(lines[1]["direction"], "OUTPUT");
    }

    #[test]
    fn test_binary_payload_is_hex() {
        let mut sink = JsonSink::new(Vec::new(), true);
        sink.handle_event(&event(1, &[0x00, 0xff, 0x1b], Direction::Output))
            .unwrap();
        let out = String::from_utf8(sink.into_inner()).unwrap();
        let v: serde_json::Value = serde_json::from_str(out.trim_end()).unwrap();
        assert_eq!(v["buf"], "00ff1b");
        assert_eq!(v["len"], 3);
    }
}
