use std::fmt;

use serde::Serialize;

use crate::common::Addr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Instr {
    Read(Addr),
    Write(Addr, u8),
}

impl Instr {
    pub fn addr(&self) -> Addr {
        match *self {
            Instr::Read(a) | Instr::Write(a, _) => a,
        }
    }
    pub fn op(&self) -> Op {
        match self {
            Instr::Read(_) => Op::Read,
            Instr::Write(..) => Op::Write,
        }
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::Read(a) => write!(f, "RD {a}"),
            Instr::Write(a, v) => write!(f, "WR {a} {v}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Read,
    Write,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Read => f.pad("read"),
            Op::Write => f.pad("write"),
        }
    }
}
