//! Append-only transaction log standing in for the snooping bus.
//!
//! The sequence number handed out by [`BusLog::publish`] is the single
//! global order every unit drains in.

use std::{
    collections::VecDeque,
    fmt,
    io::Write,
    sync::atomic::{AtomicUsize, Ordering},
};

use crossbeam_utils::CachePadded;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::{Addr, CoreId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum BusTxKind {
    ReadMiss = 0,
    WriteMiss = 1,
    SharedResponse = 2,
    FlushResponse = 3,
}

impl fmt::Display for BusTxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusTxKind::ReadMiss => write!(f, "BusRd"),
            BusTxKind::WriteMiss => write!(f, "BusRdX"),
            BusTxKind::SharedResponse => write!(f, "Shared"),
            BusTxKind::FlushResponse => write!(f, "Flush"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BusTx {
    pub seq: usize,
    pub kind: BusTxKind,
    pub addr: Addr,
    pub issuer: CoreId,
}

impl fmt::Display for BusTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} addr {} from {}",
            self.seq, self.kind, self.addr, self.issuer
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusPolicy {
    /// the log grows without bound; nothing is ever dropped
    #[default]
    Unbounded,
    /// keep at most `capacity` entries; refuse to drop one a live unit has not drained
    ///
    /// A full ring fails the publishing unit with `DataLossHazard`; there is
    /// no backpressure. A unit whose stream is exhausted still pins the ring
    /// until it is stepped once more and retires, so even a valid trace can
    /// hit the hazard when one core finishes far ahead of the others.
    Bounded { capacity: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("bus entry #{seq} was evicted (oldest retained is #{oldest})")]
    Evicted { seq: usize, oldest: usize },
    #[error("bus full ({capacity} entries): {laggard} has not drained #{unread}")]
    DataLossHazard {
        capacity: usize,
        laggard: CoreId,
        unread: usize,
    },
}

pub type Result<T> = std::result::Result<T, BusError>;

const RETIRED: usize = usize::MAX;

struct Ring {
    entries: VecDeque<BusTx>,
    /// sequence number of `entries[0]`
    base: usize,
}

impl Ring {
    fn top(&self) -> usize {
        self.base + self.entries.len()
    }
}

pub struct BusLog {
    ring: RwLock<Ring>,
    capacity: Option<usize>,
    /// next sequence number each unit will drain
    cursors: Vec<CachePadded<AtomicUsize>>,
}

impl BusLog {
    pub fn new(policy: BusPolicy, num_units: usize) -> Self {
        let capacity = match policy {
            BusPolicy::Unbounded => None,
            BusPolicy::Bounded { capacity } => Some(capacity),
        };
        Self {
            ring: RwLock::new(Ring {
                entries: VecDeque::with_capacity(capacity.unwrap_or(64)),
                base: 0,
            }),
            capacity,
            cursors: (0..num_units)
                .map(|_| CachePadded::new(AtomicUsize::new(0)))
                .collect(),
        }
    }

    /// Append a transaction and return its sequence number.
    ///
    /// The number is assigned under the write lock, so it matches commit order.
    pub fn publish(&self, kind: BusTxKind, addr: Addr, issuer: CoreId) -> Result<usize> {
        let mut ring = self.ring.write();
        if let Some(capacity) = self.capacity {
            if ring.entries.len() >= capacity {
                let oldest = ring.base;
                if let Some(laggard) = self.laggard_behind(oldest) {
                    return Err(BusError::DataLossHazard {
                        capacity,
                        laggard,
                        unread: oldest,
                    });
                }
                ring.entries.pop_front();
                ring.base += 1;
            }
        }
        let seq = ring.top();
        let tx = BusTx {
            seq,
            kind,
            addr,
            issuer,
        };
        ring.entries.push_back(tx);
        log::trace!("publish {tx}");
        Ok(seq)
    }

    /// `Ok(None)` once `seq` reaches the current end of the log.
    pub fn read(&self, seq: usize) -> Result<Option<BusTx>> {
        let ring = self.ring.read();
        if seq < ring.base {
            return Err(BusError::Evicted {
                seq,
                oldest: ring.base,
            });
        }
        Ok(ring.entries.get(seq - ring.base).copied())
    }

    /// number of transactions ever published
    pub fn len(&self) -> usize {
        self.ring.read().top()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn advance(&self, core: CoreId, next: usize) {
        self.cursors[core.index()].store(next, Ordering::Release);
    }

    /// a terminated unit no longer pins entries in a bounded log
    pub(crate) fn retire(&self, core: CoreId) {
        self.cursors[core.index()].store(RETIRED, Ordering::Release);
    }

    fn laggard_behind(&self, seq: usize) -> Option<CoreId> {
        self.cursors
            .iter()
            .position(|c| c.load(Ordering::Acquire) <= seq)
            .map(CoreId::new)
    }

    /// retained entries in sequence order
    pub fn snapshot(&self) -> Vec<BusTx> {
        self.ring.read().entries.iter().copied().collect()
    }

    pub fn dump(&self, w: impl Write) -> std::io::Result<()> {
        dump(&self.snapshot(), w)
    }
}

/// `seq kind address issuer` per line, kind as its numeric code
pub fn dump(txs: &[BusTx], mut w: impl Write) -> std::io::Result<()> {
    for tx in txs {
        writeln!(
            w,
            "{} {} {} {}",
            tx.seq,
            u8::from(tx.kind),
            tx.addr,
            tx.issuer.index()
        )?;
    }
    Ok(())
}
