//! Process-wide daemon state, shared between the bus thread and the
//! control service thread behind a single mutex

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use crate::control::image::ImageStore;
use crate::control::locale::Localizer;
use crate::scsi::registry::DeviceRegistry;

/// Which image path is bound to which (ID, LUN). The table is authoritative
/// for "who is using this path"; opening a file does not by itself reserve
/// it.
#[derive(Debug, Default, Clone)]
pub struct ReservationTable {
    files: HashMap<PathBuf, (u8, u8)>,
}

impl ReservationTable {
    /// Reserves a path for a device. A path can only be held by one owner.
    pub fn reserve(&mut self, path: &Path, id: u8, lun: u8) -> bool {
        if self.files.contains_key(path) {
            return false;
        }
        self.files.insert(path.to_path_buf(), (id, lun));
        true
    }

    pub fn release(&mut self, path: &Path) {
        self.files.remove(path);
    }

    pub fn release_all(&mut self) {
        self.files.clear();
    }

    pub fn owner(&self, path: &Path) -> Option<(u8, u8)> {
        self.files.get(path).copied()
    }

    pub fn is_reserved(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Snapshot for the dry-run/commit protocol of the command executor
    pub fn snapshot(&self) -> Self {
        self.clone()
    }

    pub fn restore(&mut self, snapshot: Self) {
        *self = snapshot;
    }
}

/// All mutable daemon state. The control service and the bus loop both
/// lock this for the duration of each top-level operation.
pub struct Daemon {
    pub registry: DeviceRegistry,
    pub reservations: ReservationTable,
    pub reserved_ids: BTreeSet<u8>,
    pub images: ImageStore,
    pub log_level: String,
    pub access_token: Option<String>,
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}

impl Daemon {
    pub fn new() -> Self {
        Self {
            registry: DeviceRegistry::new(),
            reservations: ReservationTable::default(),
            reserved_ids: BTreeSet::new(),
            images: ImageStore::new(),
            log_level: "info".to_string(),
            access_token: None,
        }
    }

    /// Detaches all devices and releases every image reservation
    pub fn detach_all(&mut self) {
        self.registry.delete_all();
        self.reservations.release_all();

        log::info!("Detached all devices");
    }
}

/// The message catalog is immutable and shared by all connections
pub type SharedLocalizer = std::sync::Arc<Localizer>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_is_exclusive() {
        let mut table = ReservationTable::default();
        let path = Path::new("/images/a.hds");

        assert!(table.reserve(path, 0, 0));
        assert!(!table.reserve(path, 1, 0));
        assert_eq!(table.owner(path), Some((0, 0)));

        table.release(path);
        assert!(table.reserve(path, 1, 0));
    }

    #[test]
    fn snapshot_restores_prior_state() {
        let mut table = ReservationTable::default();
        table.reserve(Path::new("/images/a.hds"), 0, 0);

        let snapshot = table.snapshot();
        table.reserve(Path::new("/images/b.hds"), 1, 0);
        assert_eq!(table.len(), 2);

        table.restore(snapshot);
        assert_eq!(table.len(), 1);
        assert!(table.is_reserved(Path::new("/images/a.hds")));
    }
}
