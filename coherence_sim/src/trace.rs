//! Per-core instruction streams.
//!
//! One instruction per line:
//! ```text
//! RD <address>
//! WR <address> <value>
//! ```
//! Blank lines and lines starting with `#` are ignored.

use std::{
    collections::VecDeque,
    io::{self, BufRead},
};

use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{space0, space1, u64 as number, u8 as byte},
    combinator::{all_consuming, map, map_res},
    sequence::{delimited, preceded, tuple},
    IResult,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{common::Addr, instr::Instr};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: cannot parse `{text}`: {reason}")]
pub struct ParseError {
    pub line: usize,
    pub text: String,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum StreamError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("failed to read instruction stream: {0}")]
    Io(#[from] io::Error),
}

/// What a unit does with a line that is neither `RD` nor `WR`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedPolicy {
    /// stop every core and fail the run
    #[default]
    Abort,
    /// log a warning and continue with the next line
    Skip,
}

pub trait InstrStream: Send {
    /// `None` at end of stream
    fn next_instr(&mut self) -> Option<Result<Instr, StreamError>>;
}

impl<S: InstrStream + ?Sized> InstrStream for Box<S> {
    fn next_instr(&mut self) -> Option<Result<Instr, StreamError>> {
        (**self).next_instr()
    }
}

fn addr(input: &str) -> IResult<&str, Addr> {
    map(map_res(number, |n: u64| usize::try_from(n)), Addr::new)(input)
}

fn read_instr(input: &str) -> IResult<&str, Instr> {
    map(preceded(tuple((tag("RD"), space1)), addr), Instr::Read)(input)
}

fn write_instr(input: &str) -> IResult<&str, Instr> {
    map(
        preceded(
            tuple((tag("WR"), space1)),
            tuple((addr, preceded(space1, byte))),
        ),
        |(a, v)| Instr::Write(a, v),
    )(input)
}

fn instr(input: &str) -> IResult<&str, Instr> {
    all_consuming(delimited(space0, alt((read_instr, write_instr)), space0))(input)
}

/// `Ok(None)` for lines carrying no instruction.
pub fn parse_line(line: usize, text: &str) -> Result<Option<Instr>, ParseError> {
    let trimmed = text.trim_end_matches(['\r', '\n']);
    if trimmed.trim().is_empty() || trimmed.trim_start().starts_with('#') {
        return Ok(None);
    }
    instr(trimmed)
        .map(|(_, i)| Some(i))
        .map_err(|e| ParseError {
            line,
            text: trimmed.to_string(),
            reason: match e {
                nom::Err::Error(e) | nom::Err::Failure(e) if e.input.trim().is_empty() => {
                    "unexpected end of line".to_string()
                }
                nom::Err::Error(e) | nom::Err::Failure(e) => {
                    format!("unexpected `{}`", e.input.trim())
                }
                nom::Err::Incomplete(_) => "incomplete instruction".to_string(),
            },
        })
}

/// Lazily parses a trace, one line per call.
pub struct TraceReader<R> {
    lines: io::Lines<R>,
    line: usize,
}

impl<R: BufRead> TraceReader<R> {
    pub fn new(r: R) -> Self {
        Self {
            lines: r.lines(),
            line: 0,
        }
    }
}

impl<R: BufRead + Send> InstrStream for TraceReader<R> {
    fn next_instr(&mut self) -> Option<Result<Instr, StreamError>> {
        loop {
            let text = match self.lines.next()? {
                Ok(text) => text,
                Err(e) => return Some(Err(e.into())),
            };
            self.line += 1;
            match parse_line(self.line, &text) {
                Ok(Some(i)) => return Some(Ok(i)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

/// An already decoded instruction sequence.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Program {
    instrs: VecDeque<Instr>,
}

impl Program {
    /// strict parse: the first malformed line fails the whole program
    pub fn parse(src: &str) -> Result<Self, ParseError> {
        let mut instrs = VecDeque::new();
        for (i, text) in src.lines().enumerate() {
            if let Some(instr) = parse_line(i + 1, text)? {
                instrs.push_back(instr);
            }
        }
        Ok(Self { instrs })
    }
    pub fn len(&self) -> usize {
        self.instrs.len()
    }
    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }
}

impl From<Vec<Instr>> for Program {
    fn from(v: Vec<Instr>) -> Self {
        Self { instrs: v.into() }
    }
}

impl InstrStream for Program {
    fn next_instr(&mut self) -> Option<Result<Instr, StreamError>> {
        self.instrs.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        assert_eq!(
            parse_line(1, "RD 5").unwrap(),
            Some(Instr::Read(Addr::new(5)))
        );
        assert_eq!(
            parse_line(1, "  WR 5 99  \r\n").unwrap(),
            Some(Instr::Write(Addr::new(5), 99))
        );
        assert_eq!(parse_line(1, "").unwrap(), None);
        assert_eq!(parse_line(1, "# comment").unwrap(), None);
    }

    #[test]
    fn test_malformed() {
        for bad in ["MV 1 2", "RD", "WR 5", "WR 5 256", "RD -1", "RD 5 6", "rd 5"] {
            let e = parse_line(3, bad).unwrap_err();
            assert_eq!(e.line, 3);
            assert_eq!(e.text, bad);
        }
        let e = parse_line(2, "HALT").unwrap_err();
        assert_eq!(e.to_string(), "line 2: cannot parse `HALT`: unexpected `HALT`");
        assert_eq!(
            parse_line(1, "WR 5 300").unwrap_err().reason,
            "unexpected `300`"
        );
        assert_eq!(
            parse_line(1, "WR 5").unwrap_err().reason,
            "unexpected end of line"
        );
    }

    #[test]
    fn test_trace_reader() {
        let src = "RD 1\n\nWR 2 3\nbogus\nRD 4\n";
        let mut r = TraceReader::new(src.as_bytes());
        assert_eq!(r.next_instr().unwrap().unwrap(), Instr::Read(Addr::new(1)));
        assert_eq!(
            r.next_instr().unwrap().unwrap(),
            Instr::Write(Addr::new(2), 3)
        );
        match r.next_instr().unwrap() {
            Err(StreamError::Parse(e)) => assert_eq!(e.line, 4),
            other => panic!("unexpected {other:?}"),
        }
        // reading continues past a malformed line
        assert_eq!(r.next_instr().unwrap().unwrap(), Instr::Read(Addr::new(4)));
        assert!(r.next_instr().is_none());
    }

    #[test]
    fn test_program() {
        let mut p = Program::parse("RD 0\nWR 1 2\n").unwrap();
        assert_eq!(p.len(), 2);
        assert_eq!(p.next_instr().unwrap().unwrap(), Instr::Read(Addr::new(0)));
        assert!(Program::parse("RD 0\nXX\n").is_err());
    }
}
