use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::{BusTarget, error::BusError};

/// Initial content of every word of a [`MemoryTarget`].
pub const FILL_PATTERN: u32 = 0xefef_efef;

/// A word-addressed memory emulating the registers and block RAMs of a device.
///
/// The memory covers `size` words starting at the byte address `base`. Misaligned and
/// out-of-range accesses fail with a bus error. Read-modify-write accesses are atomic.
#[derive(Debug)]
pub struct MemoryTarget {
    base: u32,
    words: Mutex<Vec<u32>>,
}

impl MemoryTarget {
    pub fn new(base: u32, size: usize) -> MemoryTarget {
        MemoryTarget {
            base,
            words: Mutex::new(vec![FILL_PATTERN; size]),
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    /// Number of words in the memory.
    pub fn size(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u32>> {
        // the memory stays consistent word by word even if a holder panicked
        self.words.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn index(&self, words: &[u32], address: u32) -> Result<usize, BusError> {
        let offset = address
            .checked_sub(self.base)
            .filter(|offset| offset % 4 == 0)
            .ok_or(BusError::Error(address))?;
        let index = (offset / 4) as usize;
        if index < words.len() {
            Ok(index)
        } else {
            Err(BusError::Error(address))
        }
    }

    fn modify(&self, address: u32, f: impl FnOnce(u32) -> u32) -> Result<u32, BusError> {
        let mut words = self.lock();
        let index = self.index(&words, address)?;
        let previous = words[index];
        words[index] = f(previous);
        Ok(previous)
    }
}

impl BusTarget for MemoryTarget {
    fn read(&self, address: u32) -> Result<u32, BusError> {
        let words = self.lock();
        let index = self.index(&words, address)?;
        Ok(words[index])
    }

    fn write(&self, address: u32, value: u32) -> Result<(), BusError> {
        self.modify(address, |_| value).map(|_| ())
    }

    fn read_block(&self, address: u32, words: usize) -> Result<Box<[u32]>, BusError> {
        let memory = self.lock();
        (0..words as u32)
            .map(|i| {
                let address = address.wrapping_add(4 * i);
                self.index(&memory, address).map(|index| memory[index])
            })
            .collect()
    }

    fn write_block(&self, address: u32, data: &[u32]) -> Result<(), BusError> {
        let mut memory = self.lock();
        // check the whole range first so that a failing block leaves the memory untouched
        let first = self.index(&memory, address)?;
        let Some(range) = memory.get_mut(first..first + data.len()) else {
            return Err(BusError::Error(
                self.base.wrapping_add(4 * memory.len() as u32),
            ));
        };
        range.copy_from_slice(data);
        Ok(())
    }

    fn rmw_bits(&self, address: u32, and_term: u32, or_term: u32) -> Result<u32, BusError> {
        self.modify(address, |previous| (previous & and_term) | or_term)
    }

    fn rmw_sum(&self, address: u32, addend: u32) -> Result<u32, BusError> {
        self.modify(address, |previous| previous.wrapping_add(addend))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn memory_starts_with_fill_pattern() {
        let memory = MemoryTarget::new(0x1000, 4);
        assert_eq!(memory.read(0x1000).unwrap(), FILL_PATTERN);
        assert_eq!(&*memory.read_block(0x1000, 4).unwrap(), &[FILL_PATTERN; 4]);
    }

    #[test]
    fn accesses_outside_memory_fail() {
        let memory = MemoryTarget::new(0x1000, 4);
        assert_eq!(memory.read(0x0ffc), Err(BusError::Error(0x0ffc)));
        assert_eq!(memory.read(0x1010), Err(BusError::Error(0x1010)));
        assert_eq!(memory.write(0x1002, 1), Err(BusError::Error(0x1002)));
        assert!(memory.read_block(0x1008, 3).is_err());
    }

    #[test]
    fn failing_block_write_changes_nothing() {
        let memory = MemoryTarget::new(0x0, 4);
        assert!(memory.write_block(0x8, &[1, 2, 3]).is_err());
        assert_eq!(&*memory.read_block(0x0, 4).unwrap(), &[FILL_PATTERN; 4]);
        memory.write_block(0x4, &[1, 2, 3]).unwrap();
        assert_eq!(&*memory.read_block(0x0, 4).unwrap(), &[FILL_PATTERN, 1, 2, 3]);
    }

    #[test]
    fn masked_write_leaves_other_bits() {
        let memory = MemoryTarget::new(0x0, 1);
        let previous = memory.rmw_bits(0x0, !0x0000_ffff, 0xbaba).unwrap();
        assert_eq!(previous, FILL_PATTERN);
        assert_eq!(memory.read(0x0).unwrap(), 0xefef_baba);
    }
}
