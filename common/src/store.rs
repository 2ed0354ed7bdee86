use log::info;
use thiserror::Error;

use crate::config::{Settings, SETTINGS_OFFSET, SETTINGS_RECORD_SIZE};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{len} bytes at offset {offset} exceed storage of {capacity} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },
    #[error("storage backend failed: {0}")]
    Backend(String),
}

/// Byte-addressed persistent storage with an explicit commit, EEPROM style.
///
/// Writes may sit in a cache until [`SettingsStorage::commit`] returns.
pub trait SettingsStorage {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), StoreError>;
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StoreError>;
    fn commit(&mut self) -> Result<(), StoreError>;
}

/// Reads and writes the whole settings record at its fixed offset.
pub struct SettingsStore<S> {
    storage: S,
    offset: usize,
}

impl<S: SettingsStorage> SettingsStore<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            offset: SETTINGS_OFFSET,
        }
    }

    /// Returns whatever the storage holds, unvalidated.
    pub fn load(&mut self) -> Result<Settings, StoreError> {
        let mut record = [0_u8; SETTINGS_RECORD_SIZE];
        self.storage.read(self.offset, &mut record)?;
        Ok(Settings::from_record(&record))
    }

    /// Writes the full record and commits it. Durable once this returns `Ok`.
    pub fn save(&mut self, settings: Settings) -> Result<Settings, StoreError> {
        self.storage.write(self.offset, &settings.to_record())?;
        self.storage.commit()?;
        info!(
            "settings saved ({} bytes at offset {})",
            SETTINGS_RECORD_SIZE, self.offset
        );
        Ok(settings)
    }

    /// Overwrites the record with factory defaults.
    pub fn reset(&mut self) -> Result<Settings, StoreError> {
        let defaults = self.save(Settings::default())?;
        info!("settings reset to factory defaults");
        Ok(defaults)
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn into_inner(self) -> S {
        self.storage
    }
}

/// RAM-backed storage with a separate committed image, used by tests and
/// by boards without flash.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    cache: Vec<u8>,
    committed: Vec<u8>,
    writes: usize,
    commits: usize,
}

impl MemoryStorage {
    pub fn new(size: usize) -> Self {
        Self::with_image(vec![0; size])
    }

    /// Storage as it comes out of the factory: every byte `0xff`.
    pub fn erased(size: usize) -> Self {
        Self::with_image(vec![0xff; size])
    }

    pub fn with_image(image: Vec<u8>) -> Self {
        Self {
            cache: image.clone(),
            committed: image,
            writes: 0,
            commits: 0,
        }
    }

    pub fn committed_image(&self) -> &[u8] {
        &self.committed
    }

    /// Same device after a power cycle: uncommitted writes are gone.
    pub fn power_cycle(&self) -> Self {
        Self::with_image(self.committed.clone())
    }

    pub fn write_count(&self) -> usize {
        self.writes
    }

    pub fn commit_count(&self) -> usize {
        self.commits
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<(), StoreError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.cache.len() => Ok(()),
            _ => Err(StoreError::OutOfBounds {
                offset,
                len,
                capacity: self.cache.len(),
            }),
        }
    }
}

impl SettingsStorage for MemoryStorage {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), StoreError> {
        self.check_bounds(offset, buf.len())?;
        buf.copy_from_slice(&self.cache[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StoreError> {
        self.check_bounds(offset, data.len())?;
        self.cache[offset..offset + data.len()].copy_from_slice(data);
        self.writes += 1;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.committed.copy_from_slice(&self.cache);
        self.commits += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::types::FixedStr;

    #[test]
    fn save_commits_and_survives_power_cycle() {
        let mut store = SettingsStore::new(MemoryStorage::new(512));
        let mut settings = Settings::default();
        settings.ssid = FixedStr::new("Home").unwrap();
        settings.target_ip = Ipv4Addr::new(10, 0, 0, 5);

        let saved = store.save(settings.clone()).unwrap();
        assert_eq!(saved, settings);
        assert_eq!(store.storage().commit_count(), 1);

        let mut rebooted = SettingsStore::new(store.storage().power_cycle());
        assert_eq!(rebooted.load().unwrap(), settings);
    }

    #[test]
    fn uncommitted_writes_are_lost_on_power_cycle() {
        let mut storage = MemoryStorage::new(256);
        storage.write(0, &Settings::default().to_record()).unwrap();

        let mut rebooted = SettingsStore::new(storage.power_cycle());
        let loaded = rebooted.load().unwrap();
        assert_eq!(loaded.ssid.as_str(), "");
        assert_eq!(loaded.target_port, 0);
    }

    #[test]
    fn load_of_erased_storage_returns_raw_record() {
        let mut store = SettingsStore::new(MemoryStorage::erased(256));
        let loaded = store.load().unwrap();

        assert_eq!(loaded.target_port, u16::MAX);
        assert_eq!(loaded.report_interval_s, u16::MAX);
        assert_eq!(store.storage().write_count(), 0);
    }

    #[test]
    fn reset_replaces_garbage_with_defaults() {
        let mut store = SettingsStore::new(MemoryStorage::erased(256));
        store.reset().unwrap();

        let mut rebooted = SettingsStore::new(store.storage().power_cycle());
        assert_eq!(rebooted.load().unwrap(), Settings::default());
    }

    #[test]
    fn undersized_storage_reports_out_of_bounds() {
        let mut store = SettingsStore::new(MemoryStorage::new(64));
        assert_eq!(
            store.load(),
            Err(StoreError::OutOfBounds {
                offset: 0,
                len: SETTINGS_RECORD_SIZE,
                capacity: 64,
            })
        );
        assert!(store.save(Settings::default()).is_err());
        assert_eq!(store.storage().commit_count(), 0);
    }
}
