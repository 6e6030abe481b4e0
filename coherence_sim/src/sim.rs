use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread,
};

use anyhow::{anyhow, ensure, Context as _, Result};

use crate::{
    bus::{BusLog, BusTx},
    check::{self, Violation},
    common::CoreId,
    config::{ShutdownPolicy, SimConfig},
    io::TraceSink,
    memory::Memory,
    trace::InstrStream,
    unit::{CacheSnapshot, CacheUnit, RuntimeError, UnitReport},
};

#[cfg(feature = "stat")]
use crate::stat::{AddStats, BusStat, Stats};

/// State shared by all units for the lifetime of one run.
pub struct Context {
    config: SimConfig,
    pub memory: Memory,
    pub bus: BusLog,
    aborted: AtomicBool,
}

impl Context {
    pub fn new(config: SimConfig) -> Self {
        Self {
            memory: Memory::new(config.memory_size, config.memory_init),
            bus: BusLog::new(config.bus, config.cores),
            aborted: AtomicBool::new(false),
            config,
        }
    }
    pub fn config(&self) -> &SimConfig {
        &self.config
    }
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

pub struct Simulator<'s> {
    ctx: Context,
    streams: Vec<Box<dyn InstrStream + 's>>,
    sink: &'s dyn TraceSink,
}

#[derive(Debug)]
pub struct SimOutput {
    /// memory store contents after shutdown
    pub memory: Vec<u8>,
    pub reports: Vec<UnitReport>,
    /// retained bus entries in sequence order
    pub bus: Vec<BusTx>,
    /// snoop-only rounds run at shutdown (0 for `Halt`)
    pub settle_rounds: usize,
}

impl SimOutput {
    pub fn caches(&self) -> Vec<CacheSnapshot> {
        self.reports.iter().map(|r| r.cache.clone()).collect()
    }
    pub fn report(&self, core: CoreId) -> Option<&UnitReport> {
        self.reports.iter().find(|r| r.core == core)
    }
    pub fn verify(&self) -> Result<(), Violation> {
        check::verify(&self.caches())
    }
    #[cfg(feature = "stat")]
    pub fn collect_stat(&self) -> Stats {
        let mut ss = Stats::default();
        self.add_stats(&mut ss);
        ss
    }
}

#[cfg(feature = "stat")]
impl AddStats for SimOutput {
    fn add_stats(&self, buf: &mut Stats) {
        for r in &self.reports {
            r.add_stats(buf);
        }
        buf.bus = BusStat::from_log(&self.bus);
    }
}

#[cfg(feature = "stat")]
impl AddStats for UnitReport {
    fn add_stats(&self, buf: &mut Stats) {
        buf.push_core(self.core, self.stat);
    }
}

type Drive<'a> = (CacheUnit<'a>, std::result::Result<(), RuntimeError>);

/// Step one unit until its stream ends or some unit aborts the run.
fn drive<'a>(mut unit: CacheUnit<'a>, ctx: &Context) -> Drive<'a> {
    let r = loop {
        if ctx.is_aborted() {
            log::info!("{} stopped: run aborted", unit.id());
            break Ok(());
        }
        match unit.step() {
            Ok(true) => {}
            Ok(false) => break Ok(()),
            Err(e) => {
                ctx.abort();
                break Err(e);
            }
        }
    };
    ctx.bus.retire(unit.id());
    log::info!("{} finished", unit.id());
    log::debug!("{} lines at finish:\n{}", unit.id(), unit.snapshot());
    (unit, r)
}

impl<'s> Simulator<'s> {
    pub fn new(
        config: SimConfig,
        streams: Vec<Box<dyn InstrStream + 's>>,
        sink: &'s dyn TraceSink,
    ) -> Result<Self> {
        config.validate()?;
        ensure!(
            streams.len() == config.cores,
            "{} instruction streams given for {} cores",
            streams.len(),
            config.cores
        );
        log::info!(
            "{} cores, {} lines each, {} bytes of memory, bus {:?}",
            config.cores,
            config.cache_lines,
            config.memory_size,
            config.bus
        );
        Ok(Self {
            ctx: Context::new(config),
            streams,
            sink,
        })
    }

    fn units<'a>(
        ctx: &'a Context,
        streams: Vec<Box<dyn InstrStream + 's>>,
        sink: &'a dyn TraceSink,
    ) -> Vec<CacheUnit<'a>>
    where
        's: 'a,
    {
        streams
            .into_iter()
            .enumerate()
            .map(|(i, stream)| CacheUnit::new(CoreId::new(i), ctx, stream, sink))
            .collect()
    }

    /// Run every core on its own thread until all streams are exhausted.
    pub fn run(self) -> Result<SimOutput> {
        let Self { ctx, streams, sink } = self;
        let units = Self::units(&ctx, streams, sink);
        let ctx = &ctx;
        let driven: Vec<Drive> = thread::scope(|s| {
            let mut handles = Vec::with_capacity(units.len());
            for unit in units {
                let name = format!("core-{}", unit.id().index() + 1);
                let spawned = thread::Builder::new()
                    .name(name.clone())
                    .spawn_scoped(s, move || drive(unit, ctx));
                match spawned {
                    Ok(h) => handles.push((name, h)),
                    Err(e) => {
                        ctx.abort();
                        return Err(e).context("failed to spawn core thread");
                    }
                }
            }
            handles
                .into_iter()
                .map(|(name, h)| h.join().map_err(|_| anyhow!("{name} panicked")))
                .collect::<Result<Vec<_>>>()
        })?;
        let mut units = Vec::with_capacity(driven.len());
        let mut first_err = None;
        for (unit, r) in driven {
            if let Err(e) = r {
                log::error!("{} failed: {e}", unit.id());
                first_err.get_or_insert(e);
            }
            units.push(unit);
        }
        if let Some(e) = first_err {
            return Err(e).context("simulation aborted");
        }
        finish(ctx, units)
    }

    /// Run on the calling thread, one step of core `schedule[i]` at a time.
    ///
    /// Unknown or finished cores in the schedule are skipped; whatever is
    /// left afterwards runs round-robin.
    pub fn run_interleaved(self, schedule: impl IntoIterator<Item = usize>) -> Result<SimOutput> {
        let Self { ctx, streams, sink } = self;
        let mut units = Self::units(&ctx, streams, sink);
        let mut done = vec![false; units.len()];
        for i in schedule {
            if i < units.len() {
                step_one(&ctx, &mut units[i], &mut done[i])?;
            }
        }
        while done.iter().any(|d| !d) {
            for (unit, done) in units.iter_mut().zip(done.iter_mut()) {
                step_one(&ctx, unit, done)?;
            }
        }
        finish(&ctx, units)
    }
}

fn step_one(ctx: &Context, unit: &mut CacheUnit, done: &mut bool) -> Result<()> {
    if *done {
        return Ok(());
    }
    if !unit.step().with_context(|| format!("{} failed", unit.id()))? {
        *done = true;
        ctx.bus.retire(unit.id());
        log::info!("{} finished", unit.id());
        log::debug!("{} lines at finish:\n{}", unit.id(), unit.snapshot());
    }
    Ok(())
}

/// Drain the bus until a whole round over all units publishes nothing.
pub fn settle(units: &mut [CacheUnit]) -> Result<usize, RuntimeError> {
    let mut rounds = 0;
    loop {
        rounds += 1;
        let mut published = 0;
        for unit in units.iter_mut() {
            published += unit.snoop()?;
        }
        if published == 0 {
            return Ok(rounds);
        }
    }
}

fn finish(ctx: &Context, mut units: Vec<CacheUnit>) -> Result<SimOutput> {
    let policy = ctx.config().shutdown;
    let settle_rounds = if policy.settles() {
        let rounds = settle(&mut units).context("failed to settle")?;
        log::info!("settled after {rounds} rounds");
        rounds
    } else {
        0
    };
    if policy == ShutdownPolicy::SettleAndFlush {
        for unit in units.iter_mut() {
            let n = unit.flush().context("failed to flush")?;
            log::debug!("{}: flushed {n} lines", unit.id());
        }
    }
    let output = SimOutput {
        memory: ctx.memory.snapshot(),
        bus: ctx.bus.snapshot(),
        reports: units.into_iter().map(CacheUnit::into_report).collect(),
        settle_rounds,
    };
    log::info!(
        "finished: {} bus transactions, {} faults",
        ctx.bus.len(),
        output.reports.iter().map(|r| r.faults.len()).sum::<usize>()
    );
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bus::{BusPolicy, BusTxKind},
        config::DelayPolicy,
        cache::LineState,
        common::Addr,
        io::{MemorySink, NullSink},
        trace::{MalformedPolicy, Program, TraceReader},
    };

    fn programs<'s>(srcs: &[&str]) -> Vec<Box<dyn InstrStream + 's>> {
        srcs.iter()
            .map(|s| Box::new(Program::parse(s).unwrap()) as Box<dyn InstrStream>)
            .collect()
    }

    fn config(cores: usize, shutdown: ShutdownPolicy) -> SimConfig {
        SimConfig {
            cores,
            shutdown,
            ..Default::default()
        }
    }

    fn line_of(out: &SimOutput, core: usize, a: usize) -> (LineState, u8) {
        let r = out.report(CoreId::new(core)).unwrap();
        let l = r.cache.lines[a % r.cache.lines.len()];
        if l.tag == Some(Addr::new(a)) {
            (l.state, l.value)
        } else {
            (LineState::Invalid, 0)
        }
    }

    #[test]
    fn test_stream_count_must_match() {
        let sink = NullSink::new();
        assert!(Simulator::new(config(2, ShutdownPolicy::Halt), programs(&["RD 0"]), &sink).is_err());
    }

    #[test]
    fn test_cross_core_visibility_via_flush() {
        let sink = MemorySink::new();
        let sim = Simulator::new(
            config(2, ShutdownPolicy::Halt),
            programs(&["WR 5 99\n", "RD 5\nRD 5\n"]),
            &sink,
        )
        .unwrap();
        // core 1 never snoops again, so the stale fill is never corrected
        let out = sim.run_interleaved([0, 1, 1]).unwrap();
        let reads = sink.of_core(CoreId::new(1));
        assert_eq!(reads[0].value, 5);
        assert_eq!(reads[0].state, LineState::Exclusive);
        assert_eq!(reads[1].value, 5);
        assert_eq!(out.memory[5], 5);
        assert_eq!(line_of(&out, 0, 5), (LineState::Modified, 99));
    }

    #[test]
    fn test_cross_core_visibility_after_settle() {
        let sink = MemorySink::new();
        let sim = Simulator::new(
            config(2, ShutdownPolicy::Settle),
            programs(&["WR 5 99\n", "RD 5\n"]),
            &sink,
        )
        .unwrap();
        let out = sim.run_interleaved([0, 1]).unwrap();
        assert_eq!(out.memory[5], 99);
        assert_eq!(line_of(&out, 0, 5), (LineState::Shared, 99));
        assert_eq!(line_of(&out, 1, 5), (LineState::Shared, 99));
        assert!(out.settle_rounds >= 2);
        out.verify().unwrap();
    }

    #[test]
    fn test_cross_core_visibility_after_eviction() {
        let sink = MemorySink::new();
        let sim = Simulator::new(
            config(2, ShutdownPolicy::Halt),
            programs(&["WR 5 99\nRD 7\n", "RD 5\n"]),
            &sink,
        )
        .unwrap();
        let out = sim.run_interleaved([0, 0, 1]).unwrap();
        assert_eq!(sink.of_core(CoreId::new(1))[0].value, 99);
        assert_eq!(out.memory[5], 99);
    }

    #[test]
    fn test_settle_and_flush() {
        let sink = NullSink::new();
        let sim = Simulator::new(
            config(2, ShutdownPolicy::SettleAndFlush),
            programs(&["WR 0 10\nWR 1 11\n", "WR 2 12\n"]),
            &sink,
        )
        .unwrap();
        let out = sim.run_interleaved([]).unwrap();
        assert_eq!(&out.memory[..3], &[10, 11, 12]);
        out.verify().unwrap();
    }

    #[test]
    fn test_threaded_run() {
        let sink = MemorySink::new();
        let srcs: Vec<String> = (0..4)
            .map(|c| {
                (0..50)
                    .map(|i| {
                        if (i + c) % 3 == 0 {
                            format!("WR {} {}\n", (i * 7 + c) % 24, i)
                        } else {
                            format!("RD {}\n", (i * 5 + c) % 24)
                        }
                    })
                    .collect()
            })
            .collect();
        let refs: Vec<&str> = srcs.iter().map(String::as_str).collect();
        let sim = Simulator::new(
            SimConfig {
                cores: 4,
                cache_lines: 4,
                shutdown: ShutdownPolicy::Settle,
                ..Default::default()
            },
            programs(&refs),
            &sink,
        )
        .unwrap();
        let out = sim.run().unwrap();
        assert_eq!(sink.records().len(), 200);
        out.verify().unwrap();
        for r in &out.reports {
            assert!(r.drained.windows(2).all(|w| w[0] + 1 == w[1]));
            assert_eq!(r.drained.len(), out.bus.len());
        }
    }

    #[test]
    fn test_abort_on_malformed() {
        let sink = NullSink::new();
        let streams: Vec<Box<dyn InstrStream>> = vec![
            Box::new(TraceReader::new("RD 1\nHALT\nRD 2\n".as_bytes())),
            Box::new(Program::parse("RD 3\n").unwrap()),
        ];
        let sim = Simulator::new(config(2, ShutdownPolicy::Halt), streams, &sink).unwrap();
        let err = sim.run_interleaved([0, 0]).unwrap_err();
        assert!(format!("{err:#}").contains("HALT"));
    }

    #[test]
    fn test_threaded_abort_stops_other_cores() {
        let sink = MemorySink::new();
        let long: String = (0..200).map(|i| format!("RD {}\n", i % 24)).collect();
        let streams: Vec<Box<dyn InstrStream>> = vec![
            Box::new(TraceReader::new("RD 1\nHALT\n".as_bytes())),
            Box::new(Program::parse(&long).unwrap()),
        ];
        let sim = Simulator::new(
            SimConfig {
                cores: 2,
                delay: DelayPolicy::Fixed(1),
                ..Default::default()
            },
            streams,
            &sink,
        )
        .unwrap();
        let err = sim.run().unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("simulation aborted"));
        assert!(msg.contains("HALT"));
        assert_eq!(msg.matches("cannot parse").count(), 1);
        assert_eq!(sink.of_core(CoreId::new(0)).len(), 1);
        assert!(sink.of_core(CoreId::new(1)).len() < 100);
    }

    #[test]
    fn test_settle_leaves_stale_shared_copy() {
        let sink = NullSink::new();
        let sim = Simulator::new(
            config(3, ShutdownPolicy::Settle),
            programs(&["WR 5 99\n", "RD 5\n", "RD 5\n"]),
            &sink,
        )
        .unwrap();
        let out = sim.run_interleaved([0, 1, 2]).unwrap();
        assert_eq!(out.memory[5], 99);
        assert_eq!(line_of(&out, 0, 5), (LineState::Shared, 99));
        // already SHARED when the FlushResponse arrived, so never reloaded
        assert_eq!(line_of(&out, 1, 5), (LineState::Shared, 5));
        assert_eq!(line_of(&out, 2, 5), (LineState::Shared, 99));
        assert_eq!(out.verify(), Ok(()));
    }

    #[test]
    fn test_skip_malformed() {
        let sink = MemorySink::new();
        let streams: Vec<Box<dyn InstrStream>> =
            vec![Box::new(TraceReader::new("RD 1\nHALT\nRD 2\n".as_bytes()))];
        let sim = Simulator::new(
            SimConfig {
                cores: 1,
                malformed: MalformedPolicy::Skip,
                ..Default::default()
            },
            streams,
            &sink,
        )
        .unwrap();
        sim.run().unwrap();
        assert_eq!(sink.records().len(), 2);
    }

    #[test]
    fn test_bounded_bus_without_loss() {
        let sink = NullSink::new();
        let sim = Simulator::new(
            SimConfig {
                cores: 2,
                bus: BusPolicy::Bounded { capacity: 4 },
                ..Default::default()
            },
            programs(&["RD 0\nRD 1\nRD 2\nRD 3\n", "RD 4\nRD 5\nRD 6\nRD 7\n"]),
            &sink,
        )
        .unwrap();
        // alternating keeps both cursors close to the head
        let out = sim.run_interleaved([0, 1, 0, 1, 0, 1, 0, 1]).unwrap();
        assert!(out.bus.len() <= 4);
        assert!(out.bus.iter().all(|t| t.kind == BusTxKind::ReadMiss));
    }

    #[test]
    fn test_bounded_bus_refuses_overrun() {
        let sink = NullSink::new();
        let sim = Simulator::new(
            SimConfig {
                cores: 2,
                bus: BusPolicy::Bounded { capacity: 2 },
                ..Default::default()
            },
            programs(&["RD 0\nRD 1\nRD 2\nRD 3\n", "RD 4\n"]),
            &sink,
        )
        .unwrap();
        let err = sim.run_interleaved([0, 0, 0, 0]).unwrap_err();
        assert!(format!("{err:#}").contains("has not drained"));
    }

    #[cfg(feature = "stat")]
    #[test]
    fn test_collect_stat() {
        let sink = NullSink::new();
        let sim = Simulator::new(
            config(2, ShutdownPolicy::Settle),
            programs(&["RD 4\nRD 4\n", "RD 4\n"]),
            &sink,
        )
        .unwrap();
        let out = sim.run_interleaved([0, 0, 1]).unwrap();
        let stats = out.collect_stat();
        let c1 = stats.cores[0].1;
        assert_eq!((c1.read_misses, c1.read_hits), (1, 1));
        assert_eq!(stats.bus.read_miss, 2);
        assert_eq!(stats.bus.shared_response, 1);
    }
}
