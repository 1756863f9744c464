//! # Memory-mapped Backend
//!
//! For registers and block memories that are reachable through a memory-mapped window, either
//! a UIO device (`/dev/uioN`) or a physical address range of `/dev/mem`.
//!
//! ## Example Usage
//!
//! ```ignore
//! use ipbus_server::server::{Server, Config};
//!
//! // 4096 words of the UIO device, seen at bus address 0x0
//! let target = MappedTarget::new("/dev/uio0", 0, 0x0, 4096)?;
//! let server = Server::new(target, Config::default());
//! server.listen("127.0.0.1:60002").await?;
//! ```
use std::{
    fs::OpenOptions,
    io,
    num::NonZero,
    os::unix::fs::OpenOptionsExt,
    path::Path,
    ptr::{NonNull, read_volatile, write_volatile},
    sync::{Mutex, MutexGuard, PoisonError},
};

use ipbus_server::{BusTarget, error::BusError};
use nix::{
    fcntl::OFlag,
    libc::off_t,
    sys::mman::{MapFlags, ProtFlags, mmap, munmap},
};

/// Bus target backed by a memory-mapped device window.
pub struct MappedTarget {
    words: NonNull<u32>,
    /// Bus address of the first mapped word.
    base: u32,
    /// Number of mapped words.
    size: usize,
    /// Serialises read-modify-write accesses.
    lock: Mutex<()>,
}

// SAFETY: The mapping is owned by the target and stays valid until it is dropped. All accesses
// are volatile single-word accesses within the mapping.
unsafe impl Send for MappedTarget {}
// SAFETY: See above. Read-modify-write sequences are serialised through `lock`.
unsafe impl Sync for MappedTarget {}

impl MappedTarget {
    /// Maps `size` words of `path`, starting `offset` bytes into the device, and makes them
    /// accessible at bus address `base`.
    pub fn new(
        path: impl AsRef<Path>,
        offset: u64,
        base: u32,
        size: usize,
    ) -> io::Result<MappedTarget> {
        let device_path = path.as_ref();
        log::debug!("Opening device: {}", device_path.display());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(OFlag::O_SYNC.bits())
            .open(device_path)?;

        let length = size
            .checked_mul(4)
            .and_then(NonZero::<usize>::new)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Invalid mapping size"))?;
        let offset = off_t::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Offset out of range"))?;

        // SAFETY: A fresh shared mapping is requested; no existing memory is aliased.
        let words = unsafe {
            log::debug!("Mapping 0x{:x} bytes at offset 0x{:x}", length.get(), offset);
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file,
                offset,
            )?
        };
        log::info!("Mapped {} words of {}", size, device_path.display());
        Ok(MappedTarget {
            words: words.cast(),
            base,
            size,
            lock: Mutex::new(()),
        })
    }

    fn word(&self, address: u32) -> Result<NonNull<u32>, BusError> {
        let offset = address
            .checked_sub(self.base)
            .filter(|offset| offset % 4 == 0)
            .ok_or(BusError::Error(address))?;
        let index = (offset / 4) as usize;
        if index < self.size {
            // SAFETY: `index` is within the mapping.
            Ok(unsafe { self.words.add(index) })
        } else {
            Err(BusError::Error(address))
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn modify(&self, address: u32, f: impl FnOnce(u32) -> u32) -> Result<u32, BusError> {
        let word = self.word(address)?;
        let _guard = self.lock();
        // SAFETY: `word` points into the mapping.
        unsafe {
            let previous = read_volatile(word.as_ptr());
            write_volatile(word.as_ptr(), f(previous));
            Ok(previous)
        }
    }
}

impl Drop for MappedTarget {
    fn drop(&mut self) {
        // SAFETY: The mapping was created in `new` with this length and is not used afterwards.
        unsafe {
            let _ = munmap(self.words.cast(), self.size * 4);
        }
    }
}

impl BusTarget for MappedTarget {
    fn read(&self, address: u32) -> Result<u32, BusError> {
        let word = self.word(address)?;
        // SAFETY: `word` points into the mapping.
        let value = unsafe { read_volatile(word.as_ptr()) };
        log::trace!("Read {:#010x} from {:#010x}", value, address);
        Ok(value)
    }

    fn write(&self, address: u32, value: u32) -> Result<(), BusError> {
        let word = self.word(address)?;
        log::trace!("Write {:#010x} to {:#010x}", value, address);
        // SAFETY: `word` points into the mapping.
        unsafe { write_volatile(word.as_ptr(), value) };
        Ok(())
    }

    fn rmw_bits(&self, address: u32, and_term: u32, or_term: u32) -> Result<u32, BusError> {
        self.modify(address, |previous| (previous & and_term) | or_term)
    }

    fn rmw_sum(&self, address: u32, addend: u32) -> Result<u32, BusError> {
        self.modify(address, |previous| previous.wrapping_add(addend))
    }
}
