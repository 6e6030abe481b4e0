//! One core's private cache and the MESI protocol driving it.
//!
//! A unit only ever touches its own lines. Everything it learns about the
//! other cores comes from draining the bus log, in sequence order, before
//! each instruction.

use std::{fmt, thread, time::Duration};

use serde::Serialize;
use thiserror::Error;

use crate::{
    bus::{BusError, BusTx, BusTxKind},
    cache::{Cache, CacheLine, LineState},
    common::{Addr, CoreId, Effect},
    instr::Instr,
    io::{TraceRecord, TraceSink},
    memory::MemoryAccessError,
    sim::Context,
    trace::{InstrStream, MalformedPolicy, StreamError},
};

#[cfg(feature = "stat")]
use crate::stat::CoreStat;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    MemoryAccess(#[from] MemoryAccessError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("{core}: cannot fetch the next instruction")]
    Stream {
        core: CoreId,
        #[source]
        source: StreamError,
    },
}

impl RuntimeError {
    pub fn level(&self) -> RuntimeErrorLevel {
        match self {
            RuntimeError::MemoryAccess(_) => RuntimeErrorLevel::Instruction,
            RuntimeError::Bus(_) | RuntimeError::Stream { .. } => RuntimeErrorLevel::Run,
        }
    }
}

pub enum RuntimeErrorLevel {
    /// the offending instruction is dropped, the unit carries on
    Instruction,
    /// every unit stops
    Run,
}

impl RuntimeErrorLevel {
    /// Returns `true` if the runtime error level is [`Run`].
    ///
    /// [`Run`]: RuntimeErrorLevel::Run
    #[must_use]
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, Self::Run)
    }
}

type Result<T, E = RuntimeError> = std::result::Result<T, E>;

/// An instruction that could not be serviced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fault {
    pub instr: Instr,
    pub error: MemoryAccessError,
}

/// Lines of one cache at some instant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CacheSnapshot {
    pub core: CoreId,
    pub lines: Vec<CacheLine>,
}

impl fmt::Display for CacheSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, l) in self.lines.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{} line {i}: ", self.core)?;
            match l.tag {
                Some(a) => write!(f, "addr {a} = {} [{}]", l.value, l.state)?,
                None => write!(f, "empty")?,
            }
        }
        Ok(())
    }
}

/// What is left of a unit after the run.
#[derive(Clone, Debug)]
pub struct UnitReport {
    pub core: CoreId,
    pub cache: CacheSnapshot,
    /// sequence numbers in the order this unit drained them
    pub drained: Vec<usize>,
    pub faults: Vec<Fault>,
    #[cfg(feature = "stat")]
    pub stat: CoreStat,
}

pub struct CacheUnit<'a> {
    id: CoreId,
    ctx: &'a Context,
    cache: Cache,
    /// next bus entry to drain; only moves forward
    cursor: usize,
    stream: Box<dyn InstrStream + 'a>,
    sink: &'a dyn TraceSink,
    delay: Option<Duration>,
    malformed: MalformedPolicy,
    drained: Vec<usize>,
    faults: Vec<Fault>,
    #[cfg(feature = "stat")]
    stat: CoreStat,
}

impl<'a> CacheUnit<'a> {
    pub fn new(
        id: CoreId,
        ctx: &'a Context,
        stream: Box<dyn InstrStream + 'a>,
        sink: &'a dyn TraceSink,
    ) -> Self {
        let config = ctx.config();
        Self {
            id,
            ctx,
            cache: Cache::new(config.cache_lines),
            cursor: 0,
            stream,
            sink,
            delay: config.delay.for_core(id),
            malformed: config.malformed,
            drained: Vec::new(),
            faults: Vec::new(),
            #[cfg(feature = "stat")]
            stat: CoreStat::default(),
        }
    }

    pub fn id(&self) -> CoreId {
        self.id
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            core: self.id,
            lines: self.cache.lines().to_vec(),
        }
    }

    fn publish(&mut self, kind: BusTxKind, addr: Addr) -> Result<usize> {
        let seq = self.ctx.bus.publish(kind, addr, self.id)?;
        #[cfg(feature = "stat")]
        {
            self.stat.published += 1;
        }
        Ok(seq)
    }

    fn write_back(&mut self, addr: Addr, value: u8) -> Result<()> {
        log::debug!("{}: write back addr {addr} = {value}", self.id);
        self.ctx.memory.write(addr, value)?;
        #[cfg(feature = "stat")]
        {
            self.stat.write_backs += 1;
        }
        Ok(())
    }

    /// Drain every bus entry published since the last call.
    ///
    /// Returns how many responses this unit published while doing so.
    pub fn snoop(&mut self) -> Result<usize> {
        let mut published = 0;
        while let Some(tx) = self.ctx.bus.read(self.cursor)? {
            debug_assert_eq!(tx.seq, self.cursor);
            self.cursor += 1;
            self.ctx.bus.advance(self.id, self.cursor);
            self.drained.push(tx.seq);
            if tx.issuer == self.id {
                continue;
            }
            log::trace!("{} snoops {tx}", self.id);
            #[cfg(feature = "stat")]
            {
                self.stat.snooped += 1;
            }
            if self.react(tx)? {
                published += 1;
            }
        }
        Ok(published)
    }

    /// Apply one foreign transaction to the matching line, if any.
    ///
    /// Returns whether a response was published.
    fn react(&mut self, tx: BusTx) -> Result<bool> {
        let Some(line) = self.cache.lookup(tx.addr).copied() else {
            return Ok(false);
        };
        let mut responded = false;
        let next = match (tx.kind, line.state) {
            (_, LineState::Invalid) => return Ok(false),
            (BusTxKind::ReadMiss, LineState::Modified) => {
                self.write_back(tx.addr, line.value)?;
                self.publish(BusTxKind::FlushResponse, tx.addr)?;
                responded = true;
                LineState::Shared
            }
            (BusTxKind::ReadMiss, LineState::Exclusive | LineState::Shared) => {
                self.publish(BusTxKind::SharedResponse, tx.addr)?;
                responded = true;
                LineState::Shared
            }
            (BusTxKind::WriteMiss, _) => {
                #[cfg(feature = "stat")]
                {
                    self.stat.invalidated += 1;
                }
                LineState::Invalid
            }
            // dirty data must reach memory before the line stops being the owner
            (BusTxKind::SharedResponse, LineState::Modified) => {
                self.write_back(tx.addr, line.value)?;
                LineState::Shared
            }
            (BusTxKind::SharedResponse, _) => LineState::Shared,
            (BusTxKind::FlushResponse, LineState::Exclusive) => {
                let value = self.ctx.memory.read(tx.addr)?;
                self.cache.line_mut(tx.addr).value = value;
                LineState::Shared
            }
            (BusTxKind::FlushResponse, state) => state,
        };
        if next != line.state {
            log::debug!(
                "{}: addr {} {} -> {next} on {tx}",
                self.id,
                tx.addr,
                line.state
            );
            self.cache.line_mut(tx.addr).state = next;
        }
        Ok(responded)
    }

    /// Run one instruction against the local cache.
    pub fn execute(&mut self, instr: Instr) -> Result<TraceRecord> {
        let addr = instr.addr();
        self.ctx.memory.check(addr)?;
        let mut effects = Effect::none();
        let line = *self.cache.line(addr);
        let value = match instr {
            Instr::Read(_) if line.holds(addr) => {
                effects |= Effect::Hit;
                line.value
            }
            Instr::Read(_) => {
                if let Some((victim, dirty)) = line.victim_for(addr) {
                    self.write_back(victim, dirty)?;
                    effects |= Effect::WriteBack;
                }
                let value = self.ctx.memory.read(addr)?;
                // provisional; a later Shared/Flush response downgrades it
                *self.cache.line_mut(addr) = CacheLine {
                    tag: Some(addr),
                    value,
                    state: LineState::Exclusive,
                };
                self.publish(BusTxKind::ReadMiss, addr)?;
                effects |= Effect::Publish;
                value
            }
            Instr::Write(_, value) if line.tag == Some(addr) => {
                if line.state != LineState::Invalid {
                    effects |= Effect::Hit;
                }
                let l = self.cache.line_mut(addr);
                l.value = value;
                l.state = LineState::Modified;
                // the sole dirty owner has nobody left to invalidate
                if line.state != LineState::Modified {
                    self.publish(BusTxKind::WriteMiss, addr)?;
                    effects |= Effect::Publish;
                }
                value
            }
            Instr::Write(_, value) => {
                if let Some((victim, dirty)) = line.victim_for(addr) {
                    self.write_back(victim, dirty)?;
                    effects |= Effect::WriteBack;
                }
                *self.cache.line_mut(addr) = CacheLine {
                    tag: Some(addr),
                    value,
                    state: LineState::Modified,
                };
                self.publish(BusTxKind::WriteMiss, addr)?;
                effects |= Effect::Publish;
                value
            }
        };
        Ok(TraceRecord {
            core: self.id,
            op: instr.op(),
            addr,
            value,
            state: self.cache.line(addr).state,
            effects,
        })
    }

    fn fetch(&mut self) -> Result<Option<Instr>> {
        loop {
            match self.stream.next_instr() {
                None => return Ok(None),
                Some(Ok(instr)) => return Ok(Some(instr)),
                Some(Err(StreamError::Parse(e))) if self.malformed == MalformedPolicy::Skip => {
                    log::warn!("{}: skipping {e}", self.id);
                    #[cfg(feature = "stat")]
                    {
                        self.stat.skipped += 1;
                    }
                }
                Some(Err(source)) => {
                    return Err(RuntimeError::Stream {
                        core: self.id,
                        source,
                    })
                }
            }
        }
    }

    /// Fetch, snoop, execute. `Ok(false)` once the stream is exhausted.
    pub fn step(&mut self) -> Result<bool> {
        let Some(instr) = self.fetch()? else {
            return Ok(false);
        };
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        self.snoop()?;
        match self.execute(instr) {
            Ok(rec) => {
                #[cfg(feature = "stat")]
                self.stat.on_instr(rec.op, rec.effects);
                self.sink.record(&rec);
            }
            Err(RuntimeError::MemoryAccess(error)) => {
                log::error!("{}: `{instr}` not serviced: {error}", self.id);
                #[cfg(feature = "stat")]
                {
                    self.stat.faults += 1;
                }
                self.faults.push(Fault { instr, error });
            }
            Err(e) => return Err(e),
        }
        Ok(true)
    }

    /// Write every MODIFIED line back; the lines stay cached as EXCLUSIVE.
    pub fn flush(&mut self) -> Result<usize> {
        let dirty: Vec<(Addr, u8)> = self
            .cache
            .lines()
            .iter()
            .filter(|l| l.state == LineState::Modified)
            .filter_map(|l| l.tag.map(|t| (t, l.value)))
            .collect();
        for &(addr, value) in &dirty {
            self.write_back(addr, value)?;
            self.cache.line_mut(addr).state = LineState::Exclusive;
        }
        Ok(dirty.len())
    }

    pub fn into_report(self) -> UnitReport {
        UnitReport {
            core: self.id,
            cache: self.snapshot(),
            drained: self.drained,
            faults: self.faults,
            #[cfg(feature = "stat")]
            stat: self.stat,
        }
    }
}
