use std::fmt;

use serde::Serialize;

use crate::{
    bus::{BusTx, BusTxKind},
    common::{CoreId, Effect},
    instr::Op,
};

pub trait Width {
    fn width_by_chunk_size(chunk_size: usize) -> usize;
    /// how many columns fit into `max_width` (at least one)
    fn chunk_size(max_width: usize) -> usize {
        let mut chunk_size = 2;
        loop {
            if Self::width_by_chunk_size(chunk_size) > max_width {
                break chunk_size - 1;
            }
            chunk_size += 1;
        }
    }
}

pub trait StatView: fmt::Display {
    /// header of stat
    fn header(&self) -> &'static str;
    /// body width
    fn width(&self) -> usize;
}

pub trait AddStats {
    /// add stat to `buf`.
    fn add_stats(&self, buf: &mut Stats);
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CoreStat {
    pub read_hits: usize,
    pub read_misses: usize,
    pub write_hits: usize,
    pub write_misses: usize,
    pub write_backs: usize,
    pub published: usize,
    pub snooped: usize,
    pub invalidated: usize,
    pub skipped: usize,
    pub faults: usize,
}

impl CoreStat {
    pub fn on_instr(&mut self, op: Op, effects: Effect) {
        let hit = effects.contains(Effect::Hit);
        match (op, hit) {
            (Op::Read, true) => self.read_hits += 1,
            (Op::Read, false) => self.read_misses += 1,
            (Op::Write, true) => self.write_hits += 1,
            (Op::Write, false) => self.write_misses += 1,
        }
    }
    fn rows(&self) -> [(&'static str, usize); 10] {
        [
            ("read hit", self.read_hits),
            ("read miss", self.read_misses),
            ("write hit", self.write_hits),
            ("write miss", self.write_misses),
            ("write-back", self.write_backs),
            ("published", self.published),
            ("snooped", self.snooped),
            ("invalidated", self.invalidated),
            ("skipped", self.skipped),
            ("faults", self.faults),
        ]
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BusStat {
    pub read_miss: usize,
    pub write_miss: usize,
    pub shared_response: usize,
    pub flush_response: usize,
}

impl BusStat {
    pub fn from_log(txs: &[BusTx]) -> Self {
        let mut s = Self::default();
        for tx in txs {
            match tx.kind {
                BusTxKind::ReadMiss => s.read_miss += 1,
                BusTxKind::WriteMiss => s.write_miss += 1,
                BusTxKind::SharedResponse => s.shared_response += 1,
                BusTxKind::FlushResponse => s.flush_response += 1,
            }
        }
        s
    }
    pub fn total(&self) -> usize {
        self.read_miss + self.write_miss + self.shared_response + self.flush_response
    }
}

/// Statistics of one run, per core and for the bus.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Stats {
    pub cores: Vec<(CoreId, CoreStat)>,
    pub bus: BusStat,
}

impl Stats {
    pub fn push_core(&mut self, core: CoreId, stat: CoreStat) {
        self.cores.push((core, stat));
        self.cores.sort_by_key(|(c, _)| *c);
    }
    pub fn view(&self, max_width: usize) -> StatAllView<'_> {
        let cores = CoreStatView {
            cores: &self.cores,
            chunk_size: CoreStatView::chunk_size(max_width),
        };
        let bus = BusStatView { stat: &self.bus };
        let views: Vec<Box<dyn StatView + '_>> = vec![Box::new(cores), Box::new(bus)];
        StatAllView { views }
    }
}

const LABEL_WIDTH: usize = 14;
const COLUMN_WIDTH: usize = 10;

pub struct CoreStatView<'a> {
    cores: &'a [(CoreId, CoreStat)],
    chunk_size: usize,
}

impl Width for CoreStatView<'_> {
    fn width_by_chunk_size(chunk_size: usize) -> usize {
        LABEL_WIDTH + COLUMN_WIDTH * chunk_size
    }
}

impl StatView for CoreStatView<'_> {
    fn header(&self) -> &'static str {
        "per-core cache activity"
    }
    fn width(&self) -> usize {
        Self::width_by_chunk_size(self.chunk_size.min(self.cores.len()))
    }
}

impl fmt::Display for CoreStatView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, chunk) in self.cores.chunks(self.chunk_size.max(1)).enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{:w$}", "", w = LABEL_WIDTH)?;
            for (core, _) in chunk {
                write!(f, "{:>w$}", core.to_string(), w = COLUMN_WIDTH)?;
            }
            writeln!(f)?;
            for row in 0..10 {
                let label = chunk[0].1.rows()[row].0;
                write!(f, "  {label:<w$}", w = LABEL_WIDTH - 2)?;
                for (_, stat) in chunk {
                    write!(f, "{:>w$}", stat.rows()[row].1, w = COLUMN_WIDTH)?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

pub struct BusStatView<'a> {
    stat: &'a BusStat,
}

impl StatView for BusStatView<'_> {
    fn header(&self) -> &'static str {
        "bus transactions"
    }
    fn width(&self) -> usize {
        33
    }
}

impl fmt::Display for BusStatView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.stat.total();
        macro_rules! output {
            ($kind:ident => $name:expr) => {{
                let n = self.stat.$kind;
                let pct = if total == 0 {
                    0.
                } else {
                    100. * n as f64 / total as f64
                };
                writeln!(f, "  {:>15}: {n:>6} ({pct:>6.2}%)", $name)
            }};
        }
        output!(read_miss => "read miss")?;
        output!(write_miss => "write miss")?;
        output!(shared_response => "shared")?;
        output!(flush_response => "flush")?;
        writeln!(f, "  {:>15}: {total:>6}", "total")
    }
}

pub struct StatAllView<'s> {
    views: Vec<Box<dyn StatView + 's>>,
}

impl fmt::Display for StatAllView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .views
            .iter()
            .map(|s| s.header().len().max(s.width()))
            .max()
            .unwrap_or(0);
        writeln!(f, "{:-^width$}", " statistics ")?;
        for sv in &self.views {
            writeln!(f, "{}:", sv.header())?;
            writeln!(f, "{}", sv)?;
        }
        write!(f, "{:-<width$}", "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Addr;

    #[test]
    fn test_on_instr() {
        let mut s = CoreStat::default();
        s.on_instr(Op::Read, Effect::Hit);
        s.on_instr(Op::Read, Effect::Publish);
        s.on_instr(Op::Write, Effect::Publish | Effect::WriteBack);
        assert_eq!((s.read_hits, s.read_misses, s.write_misses), (1, 1, 1));
    }

    #[test]
    fn test_bus_stat() {
        let tx = |kind| BusTx {
            seq: 0,
            kind,
            addr: Addr::new(0),
            issuer: CoreId::new(0),
        };
        let s = BusStat::from_log(&[
            tx(BusTxKind::ReadMiss),
            tx(BusTxKind::ReadMiss),
            tx(BusTxKind::FlushResponse),
        ]);
        assert_eq!((s.read_miss, s.flush_response, s.total()), (2, 1, 3));
    }

    #[test]
    fn test_view_wraps_columns() {
        let mut stats = Stats::default();
        for i in (0..4).rev() {
            stats.push_core(CoreId::new(i), CoreStat::default());
        }
        assert_eq!(stats.cores[0].0, CoreId::new(0));
        // room for two core columns only
        let text = stats.view(LABEL_WIDTH + 2 * COLUMN_WIDTH + 5).to_string();
        assert!(text.starts_with("-"));
        let header_lines: Vec<_> = text.lines().filter(|l| l.contains("core 1")).collect();
        assert_eq!(header_lines.len(), 1);
        assert!(!header_lines[0].contains("core 3"));
        assert!(text.contains("core 3"));
    }
}
