//! Disk-object registry contract.
//!
//! The mass-storage driver registers one [`BlockDevice`] per started USB
//! disk; the filesystem layer consumes them and listens for unregistration
//! to unmount. The actual filesystems live outside this crate.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Lazy;
use thiserror::Error;

use crate::utils::locks::Mutex;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    #[error("no such device")]
    NoDevice,
    #[error("bad parameter")]
    BadParameter,
    #[error("no permission")]
    NoPermission,
    #[error("input/output error")]
    Io,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskInfo {
    pub block_count: u64,
    pub block_size: u32,
    pub removable: bool,
}

pub trait BlockDevice: Send + Sync {
    fn info(&self) -> Result<DiskInfo, StorageError>;
    fn read_blocks(&self, lba: u64, buffer: &mut [u8]) -> Result<(), StorageError>;
    fn write_blocks(&self, lba: u64, buffer: &[u8]) -> Result<(), StorageError>;
    fn reset(&self) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct DiskId(pub usize);

struct Registry {
    next_id: usize,
    disks: Vec<(DiskId, Arc<dyn BlockDevice>)>,
}

static REGISTRY: Lazy<Mutex<Registry>> = Lazy::new(|| {
    Mutex::new(Registry {
        next_id: 0,
        disks: Vec::new(),
    })
});

pub fn register_disk(disk: Arc<dyn BlockDevice>) -> DiskId {
    let mut registry = REGISTRY.lock();
    let id = DiskId(registry.next_id);
    registry.next_id += 1;
    registry.disks.push((id, disk));
    id
}

pub fn unregister_disk(id: DiskId) -> bool {
    let mut registry = REGISTRY.lock();
    let before = registry.disks.len();
    registry.disks.retain(|(disk_id, _)| *disk_id != id);
    registry.disks.len() != before
}

pub fn get_disk(id: DiskId) -> Option<Arc<dyn BlockDevice>> {
    REGISTRY
        .lock()
        .disks
        .iter()
        .find(|(disk_id, _)| *disk_id == id)
        .map(|(_, disk)| disk.clone())
}

pub fn disk_count() -> usize {
    REGISTRY.lock().disks.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeDisk;

    impl BlockDevice for FakeDisk {
        fn info(&self) -> Result<DiskInfo, StorageError> {
            Ok(DiskInfo {
                block_count: 16,
                block_size: 512,
                removable: true,
            })
        }

        fn read_blocks(&self, _lba: u64, buffer: &mut [u8]) -> Result<(), StorageError> {
            buffer.fill(0xAA);
            Ok(())
        }

        fn write_blocks(&self, _lba: u64, _buffer: &[u8]) -> Result<(), StorageError> {
            Err(StorageError::NoPermission)
        }

        fn reset(&self) -> Result<(), StorageError> {
            Ok(())
        }
    }

    #[test]
    fn register_lookup_unregister() {
        crate::platform::test::setup();

        let id = register_disk(Arc::new(FakeDisk));
        let disk = get_disk(id).expect("registered disk must resolve");
        assert_eq!(disk.info().unwrap().block_size, 512);

        assert!(unregister_disk(id));
        assert!(get_disk(id).is_none());
        assert!(!unregister_disk(id));
    }

    #[test]
    fn ids_are_not_reused() {
        crate::platform::test::setup();

        let first = register_disk(Arc::new(FakeDisk));
        unregister_disk(first);
        let second = register_disk(Arc::new(FakeDisk));
        assert_ne!(first, second);
        unregister_disk(second);
    }
}
