//! Coherence invariants over a set of quiescent caches.
//!
//! Units fill lines provisionally, so these only hold once every unit has
//! drained the whole bus (see [`ShutdownPolicy::Settle`]).
//!
//! Only line states are checked, not values. A SHARED copy filled before a
//! FlushResponse stays SHARED with the value it read, since the response
//! reloads EXCLUSIVE lines only, so `Ok` does not mean every valid copy
//! matches memory.
//!
//! [`ShutdownPolicy::Settle`]: crate::config::ShutdownPolicy::Settle

use std::collections::BTreeMap;

use thiserror::Error;

use crate::{
    cache::LineState,
    common::{Addr, CoreId},
    unit::CacheSnapshot,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    #[error("addr {addr} is MODIFIED in {} caches ({cores:?})", cores.len())]
    MultipleOwners { addr: Addr, cores: Vec<CoreId> },
    #[error("addr {addr} is {state} in {owner} but also valid in {other}")]
    NotExclusive {
        addr: Addr,
        owner: CoreId,
        state: LineState,
        other: CoreId,
    },
}

/// At most one MODIFIED copy per address, and an EXCLUSIVE or MODIFIED
/// copy is the only valid one.
pub fn verify(caches: &[CacheSnapshot]) -> Result<(), Violation> {
    let mut holders: BTreeMap<Addr, Vec<(CoreId, LineState)>> = BTreeMap::new();
    for snap in caches {
        for line in &snap.lines {
            if let (Some(addr), true) = (line.tag, line.state != LineState::Invalid) {
                holders.entry(addr).or_default().push((snap.core, line.state));
            }
        }
    }
    for (addr, hs) in holders {
        let owners: Vec<CoreId> = hs
            .iter()
            .filter(|(_, s)| *s == LineState::Modified)
            .map(|(c, _)| *c)
            .collect();
        if owners.len() > 1 {
            return Err(Violation::MultipleOwners {
                addr,
                cores: owners,
            });
        }
        if let Some(&(owner, state)) = hs.iter().find(|(_, s)| s.is_owned()) {
            if let Some(&(other, _)) = hs.iter().find(|(c, _)| *c != owner) {
                return Err(Violation::NotExclusive {
                    addr,
                    owner,
                    state,
                    other,
                });
            }
        }
    }
    Ok(())
}
