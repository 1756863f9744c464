pub mod mmap;

use std::path::{Path, PathBuf};

use ipbus_server::{BusTarget, error::BusError, memory::MemoryTarget};

use self::mmap::MappedTarget;

/// The bus targets the bridge can serve.
pub enum Backend {
    Memory(MemoryTarget),
    Mapped(MappedTarget),
}

impl BusTarget for Backend {
    fn read(&self, address: u32) -> Result<u32, BusError> {
        match self {
            Backend::Memory(target) => target.read(address),
            Backend::Mapped(target) => target.read(address),
        }
    }

    fn write(&self, address: u32, value: u32) -> Result<(), BusError> {
        match self {
            Backend::Memory(target) => target.write(address, value),
            Backend::Mapped(target) => target.write(address, value),
        }
    }

    fn read_block(&self, address: u32, words: usize) -> Result<Box<[u32]>, BusError> {
        match self {
            Backend::Memory(target) => target.read_block(address, words),
            Backend::Mapped(target) => target.read_block(address, words),
        }
    }

    fn write_block(&self, address: u32, data: &[u32]) -> Result<(), BusError> {
        match self {
            Backend::Memory(target) => target.write_block(address, data),
            Backend::Mapped(target) => target.write_block(address, data),
        }
    }

    fn rmw_bits(&self, address: u32, and_term: u32, or_term: u32) -> Result<u32, BusError> {
        match self {
            Backend::Memory(target) => target.rmw_bits(address, and_term, or_term),
            Backend::Mapped(target) => target.rmw_bits(address, and_term, or_term),
        }
    }

    fn rmw_sum(&self, address: u32, addend: u32) -> Result<u32, BusError> {
        match self {
            Backend::Memory(target) => target.rmw_sum(address, addend),
            Backend::Mapped(target) => target.rmw_sum(address, addend),
        }
    }
}

/// Attempts to find the UIO device registered under `name`
pub fn uio_device_path(name: &str) -> Option<PathBuf> {
    let uio_class_path = Path::new("/sys/class/uio");
    for entry in uio_class_path.read_dir().ok()? {
        use std::fs;

        let mut path = entry.ok()?.path();
        log::debug!("Looking at UIO path {}", path.display());
        path.push("name");
        let uio_name = match fs::read_to_string(&path) {
            Ok(uio_name) => uio_name,
            Err(_) => continue,
        };
        log::debug!("UIO has name {}", uio_name.trim());
        if uio_name.trim() == name {
            // This will be something like 'uio2'
            let uio_indexed_name = path.parent()?.file_name()?;
            return Some(Path::new("/dev").join(uio_indexed_name));
        }
    }
    None
}
