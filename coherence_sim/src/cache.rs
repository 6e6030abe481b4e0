use std::fmt;

use serde::Serialize;

use crate::common::Addr;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LineState {
    Modified,
    Exclusive,
    Shared,
    #[default]
    Invalid,
}

impl LineState {
    /// MODIFIED or EXCLUSIVE: no other cache may hold the address
    pub fn is_owned(self) -> bool {
        matches!(self, LineState::Modified | LineState::Exclusive)
    }
}

impl fmt::Display for LineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LineState::Modified => "MODIFIED",
            LineState::Exclusive => "EXCLUSIVE",
            LineState::Shared => "SHARED",
            LineState::Invalid => "INVALID",
        };
        f.pad(s)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheLine {
    /// `None` until the slot is first filled
    pub tag: Option<Addr>,
    pub value: u8,
    pub state: LineState,
}

impl CacheLine {
    /// tag matches and the line is usable
    pub fn holds(&self, addr: Addr) -> bool {
        self.tag == Some(addr) && self.state != LineState::Invalid
    }
    /// dirty copy of an address other than `addr`, which must be written back before reuse
    pub fn victim_for(&self, addr: Addr) -> Option<(Addr, u8)> {
        match self.tag {
            Some(tag) if tag != addr && self.state == LineState::Modified => Some((tag, self.value)),
            _ => None,
        }
    }
}

/// Direct-mapped array of single-byte lines.
#[derive(Clone, Debug)]
pub struct Cache {
    inner: Vec<CacheLine>,
}

impl Cache {
    pub fn new(nlines: usize) -> Self {
        Self {
            inner: vec![CacheLine::default(); nlines],
        }
    }
    pub fn nlines(&self) -> usize {
        self.inner.len()
    }
    pub fn line(&self, addr: Addr) -> &CacheLine {
        &self.inner[addr.line_index(self.inner.len())]
    }
    pub fn line_mut(&mut self, addr: Addr) -> &mut CacheLine {
        let n = self.inner.len();
        &mut self.inner[addr.line_index(n)]
    }
    /// the line tagged with `addr` in any state but INVALID
    pub fn lookup(&self, addr: Addr) -> Option<&CacheLine> {
        Some(self.line(addr)).filter(|l| l.holds(addr))
    }
    pub fn lines(&self) -> &[CacheLine] {
        &self.inner
    }
}
