use std::{fmt, io::Write};

use parking_lot::Mutex;
use serde::Serialize;

use crate::{
    cache::LineState,
    common::{Addr, CoreId, Effect},
    instr::Op,
};

/// Emitted after every executed instruction. Nothing in the simulator reads it back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TraceRecord {
    pub core: CoreId,
    pub op: Op,
    pub addr: Addr,
    /// value read, or value written
    pub value: u8,
    pub state: LineState,
    pub effects: Effect,
}

impl fmt::Display for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {:<5} addr {} = {} [{}] ({})",
            self.core, self.op, self.addr, self.value, self.state, self.effects
        )
    }
}

pub trait TraceSink: Send + Sync {
    fn record(&self, rec: &TraceRecord);
}

pub struct NullSink {}

impl NullSink {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for NullSink {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceSink for NullSink {
    fn record(&self, _: &TraceRecord) {}
}

/// One `info!` line per record.
#[derive(Default)]
pub struct LogSink;

impl TraceSink for LogSink {
    fn record(&self, rec: &TraceRecord) {
        log::info!("{rec}");
    }
}

/// Newline-delimited JSON.
pub struct JsonLinesSink<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }
    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

impl<W: Write + Send> TraceSink for JsonLinesSink<W> {
    fn record(&self, rec: &TraceRecord) {
        let mut out = self.out.lock();
        let r = serde_json::to_writer(&mut *out, rec).and_then(|_| {
            writeln!(out).map_err(serde_json::Error::io)
        });
        if let Err(e) = r {
            log::warn!("dropping trace record for {}: {e}", rec.core);
        }
    }
}

/// Keeps every record in arrival order.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<TraceRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn records(&self) -> Vec<TraceRecord> {
        self.records.lock().clone()
    }
    pub fn of_core(&self, core: CoreId) -> Vec<TraceRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.core == core)
            .copied()
            .collect()
    }
}

impl TraceSink for MemorySink {
    fn record(&self, rec: &TraceRecord) {
        self.records.lock().push(*rec);
    }
}

impl<T: TraceSink + ?Sized> TraceSink for &T {
    fn record(&self, rec: &TraceRecord) {
        (**self).record(rec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec() -> TraceRecord {
        TraceRecord {
            core: CoreId::new(0),
            op: Op::Read,
            addr: Addr::new(5),
            value: 5,
            state: LineState::Exclusive,
            effects: Effect::Publish,
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(
            rec().to_string(),
            "core 1: read  addr 5 = 5 [EXCLUSIVE] (miss+bus)"
        );
    }

    #[test]
    fn test_json_lines() {
        let sink = JsonLinesSink::new(Vec::new());
        sink.record(&rec());
        sink.record(&TraceRecord {
            op: Op::Write,
            state: LineState::Modified,
            effects: Effect::Hit,
            ..rec()
        });
        let out = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        let v: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(v["core"], 0);
        assert_eq!(v["op"], "read");
        assert_eq!(v["addr"], 5);
        assert_eq!(v["state"], "EXCLUSIVE");
        assert_eq!(v["effects"], "miss+bus");
        let v: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(v["state"], "MODIFIED");
        assert_eq!(v["effects"], "hit");
    }

    #[test]
    fn test_memory_sink() {
        let sink = MemorySink::new();
        sink.record(&rec());
        sink.record(&TraceRecord {
            core: CoreId::new(1),
            ..rec()
        });
        assert_eq!(sink.records().len(), 2);
        assert_eq!(sink.of_core(CoreId::new(1)).len(), 1);
    }
}
