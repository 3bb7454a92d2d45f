//! File-backed shared memory store.
//!
//! Each cell is a 4-byte file under a tmpfs root (`/dev/shm` by default)
//! holding the native-endian bits of an `f32`. Every process that maps the
//! same file sees the same slot, so the cells outlive any single process and
//! stay readable by the existing diagnostics tools.

use memmap2::{MmapMut, MmapOptions};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use wash_spine::bus::{BusError, CellSlot, CellStore};

const SLOT_LEN: usize = std::mem::size_of::<u32>();

pub const DEFAULT_ROOT: &str = "/dev/shm";

#[derive(Debug, Clone)]
pub struct ShmStore {
    root: PathBuf,
}

impl ShmStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn system() -> Self {
        Self::new(DEFAULT_ROOT)
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn open_file(&self, key: &str, default: f32) -> io::Result<(File, bool)> {
        let path = self.path_for(key);
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => {
                file.set_len(SLOT_LEN as u64)?;
                tracing::debug!(cell = key, default, "Created shared cell");
                Ok((file, true))
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let file = OpenOptions::new().read(true).write(true).open(&path)?;
                // A writer may have died between create and resize.
                let created = file.metadata()?.len() < SLOT_LEN as u64;
                if created {
                    file.set_len(SLOT_LEN as u64)?;
                }
                Ok((file, created))
            }
            Err(err) => Err(err),
        }
    }
}

impl Default for ShmStore {
    fn default() -> Self {
        Self::system()
    }
}

impl CellStore for ShmStore {
    fn open(&self, key: &str, default: f32) -> Result<Arc<dyn CellSlot>, BusError> {
        let (file, created) = self.open_file(key, default).map_err(|source| BusError::Open {
            name: key.to_string(),
            source,
        })?;

        // SAFETY: the file is at least SLOT_LEN bytes long and every writer
        // goes through an atomic view of the same mapping.
        let map = unsafe { MmapOptions::new().len(SLOT_LEN).map_mut(&file) }.map_err(
            |source| BusError::Map {
                name: key.to_string(),
                source,
            },
        )?;

        let slot = ShmSlot { map };
        if created {
            slot.store(default);
        }
        Ok(Arc::new(slot))
    }

    fn unlink(&self, key: &str) -> Result<(), BusError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(BusError::Unlink {
                name: key.to_string(),
                source,
            }),
        }
    }
}

struct ShmSlot {
    map: MmapMut,
}

impl ShmSlot {
    fn cell(&self) -> &AtomicU32 {
        // SAFETY: mappings are page aligned, hold at least four bytes and live
        // as long as `self`. All access goes through this atomic.
        unsafe { &*self.map.as_ptr().cast::<AtomicU32>() }
    }
}

impl CellSlot for ShmSlot {
    fn load(&self) -> f32 {
        f32::from_bits(self.cell().load(Ordering::Acquire))
    }

    fn store(&self, value: f32) {
        self.cell().store(value.to_bits(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wash_spine::cells::{PRESSURE, RELAY_COMMAND};
    use wash_spine::Bus;

    #[test]
    fn creates_cell_with_default() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Bus::new(Arc::new(ShmStore::new(dir.path())));

        assert_eq!(bus.relay_code().unwrap(), 14.0);
        let bytes = fs::read(dir.path().join("relay_command")).unwrap();
        assert_eq!(bytes, 14.0f32.to_ne_bytes());
    }

    #[test]
    fn independent_stores_share_cells() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Bus::new(Arc::new(ShmStore::new(dir.path())));
        let reader = Bus::new(Arc::new(ShmStore::new(dir.path())));

        writer.write(PRESSURE, 18.25).unwrap();
        assert_eq!(reader.read(PRESSURE).unwrap(), 18.25);

        reader.write(RELAY_COMMAND, 3.0).unwrap();
        assert_eq!(writer.read(RELAY_COMMAND).unwrap(), 3.0);
    }

    #[test]
    fn reopen_keeps_persisted_value() {
        let dir = tempfile::tempdir().unwrap();
        {
            let bus = Bus::new(Arc::new(ShmStore::new(dir.path())));
            bus.set_cursor(39.0).unwrap();
        }
        let bus = Bus::new(Arc::new(ShmStore::new(dir.path())));
        bus.bootstrap().unwrap();
        assert_eq!(bus.cursor().unwrap(), 39.0);
    }

    #[test]
    fn truncated_file_is_reset_to_default() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("triac_delay"), []).unwrap();
        let bus = Bus::new(Arc::new(ShmStore::new(dir.path())));
        assert_eq!(bus.triac_delay().unwrap(), 8000.0);
    }

    #[test]
    fn unlink_removes_file_and_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ShmStore::new(dir.path()));
        let bus = Bus::new(store.clone());
        bus.ensure(PRESSURE).unwrap();
        assert!(store.path_for("Pressure").exists());

        bus.unlink(PRESSURE).unwrap();
        assert!(!store.path_for("Pressure").exists());
        store.unlink("Pressure").unwrap();
    }

    #[test]
    fn missing_root_reports_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShmStore::new(dir.path().join("absent"));
        let err = store.open("relay_command", 14.0).err().unwrap();
        assert!(matches!(err, BusError::Open { .. }));
    }
}
