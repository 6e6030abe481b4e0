use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::Addr;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryAccessError {
    #[error("address {accessed_address} out of range for memory of {size} bytes")]
    OutOfBounds { accessed_address: usize, size: usize },
}

pub type Result<T> = std::result::Result<T, MemoryAccessError>;

/// Initial contents of the memory store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryInit {
    Zero,
    /// `value[i] = i`, truncated to a byte
    #[default]
    Identity,
    Fill(u8),
}

macro_rules! bounds_check {
    ($addr:ident < $self:ident) => {
        if $addr.inner() >= $self.size {
            return Err(MemoryAccessError::OutOfBounds {
                accessed_address: $addr.inner(),
                size: $self.size,
            });
        }
    };
}

/// Backing store shared by every cache unit.
///
/// A single lock serialises all accesses; critical sections cover one byte.
pub struct Memory {
    inner: Mutex<Vec<u8>>,
    size: usize,
}

impl Memory {
    pub fn new(size: usize, init: MemoryInit) -> Self {
        let inner = match init {
            MemoryInit::Zero => vec![0; size],
            MemoryInit::Identity => (0..size).map(|i| i as u8).collect(),
            MemoryInit::Fill(v) => vec![v; size],
        };
        Self {
            inner: Mutex::new(inner),
            size,
        }
    }
    pub fn size(&self) -> usize {
        self.size
    }
    pub fn check(&self, addr: Addr) -> Result<()> {
        bounds_check!(addr < self);
        Ok(())
    }
    pub fn read(&self, addr: Addr) -> Result<u8> {
        bounds_check!(addr < self);
        Ok(self.inner.lock()[addr.inner()])
    }
    pub fn write(&self, addr: Addr, val: u8) -> Result<()> {
        bounds_check!(addr < self);
        self.inner.lock()[addr.inner()] = val;
        Ok(())
    }
    /// copy of the whole store, taken under the lock
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory() {
        let m = Memory::new(24, MemoryInit::Identity);
        assert_eq!(m.read(Addr::new(5)).unwrap(), 5);
        m.write(Addr::new(5), 99).unwrap();
        assert_eq!(m.read(Addr::new(5)).unwrap(), 99);
        assert_eq!(m.snapshot()[23], 23);
    }

    #[test]
    fn test_out_of_range() {
        let m = Memory::new(4, MemoryInit::Zero);
        assert_eq!(
            m.read(Addr::new(4)),
            Err(MemoryAccessError::OutOfBounds {
                accessed_address: 4,
                size: 4
            })
        );
        assert!(m.write(Addr::new(100), 1).is_err());
        assert!(m.check(Addr::new(3)).is_ok());
    }

    #[test]
    fn test_init() {
        assert_eq!(Memory::new(3, MemoryInit::Fill(7)).snapshot(), vec![7, 7, 7]);
        assert_eq!(Memory::new(2, MemoryInit::Zero).snapshot(), vec![0, 0]);
    }
}
