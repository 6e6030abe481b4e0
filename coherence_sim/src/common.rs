use std::fmt;

use bitmask_enum::bitmask;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
/// byte address into the memory store
pub struct Addr(usize);

impl Addr {
    pub fn new(v: usize) -> Self {
        Self(v)
    }
    pub fn inner(self) -> usize {
        self.0
    }
    /// direct-mapped slot of this address in a cache of `nlines` lines
    pub fn line_index(self, nlines: usize) -> usize {
        self.0 % nlines
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
/// zero-based core id. displayed one-based, as the traces name them.
pub struct CoreId(usize);

impl CoreId {
    pub fn new(v: usize) -> Self {
        Self(v)
    }
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "core {}", self.0 + 1)
    }
}

/// What a single executed instruction caused, besides its result.
#[bitmask(u8)]
pub enum Effect {
    Hit,
    WriteBack,
    Publish,
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.contains(Self::Hit) {
            write!(f, "hit")?;
        } else {
            write!(f, "miss")?;
        }
        if self.contains(Self::WriteBack) {
            write!(f, "+wb")?;
        }
        if self.contains(Self::Publish) {
            write!(f, "+bus")?;
        }
        Ok(())
    }
}

impl Serialize for Effect {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_index() {
        assert_eq!(Addr::new(5).line_index(2), 1);
        assert_eq!(Addr::new(7).line_index(4), 3);
        assert_eq!(Addr::new(8).line_index(4), 0);
    }

    #[test]
    fn test_effect_display() {
        assert_eq!(format!("{}", Effect::Hit), "hit");
        assert_eq!(format!("{}", Effect::WriteBack | Effect::Publish), "miss+wb+bus");
        assert_eq!(format!("{}", CoreId::new(0)), "core 1");
    }
}
