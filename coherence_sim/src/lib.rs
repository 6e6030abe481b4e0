//! A multi-core MESI cache-coherence simulator.
//!
//! Each core owns a direct-mapped cache and talks to the others only through
//! an append-only bus log. See [`sim::Simulator`] for the entry point.

pub mod bus;
pub mod cache;
pub mod check;
pub mod common;
pub mod config;
pub mod instr;
pub mod io;
pub mod memory;
pub mod sim;
pub mod trace;
pub mod unit;

#[cfg(feature = "stat")]
pub mod stat;
