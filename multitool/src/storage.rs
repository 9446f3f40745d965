//! Flash backends: the two settings slots and the firmware staging partition.
//!
//! Settings live in the last two 4 KiB sectors of the first writable data
//! partition (an undefined-subtype data partition if the table has one,
//! otherwise `nvs`). The record codec and slot choice are in
//! `multitool_core::settings`; this module only moves bytes.
//!
//! ## Multi-core Flash Safety
//!
//! On dual-core ESP32, flash writes detach the SPI flash from the cache, so
//! neither core can execute from flash while one is in progress. Every write
//! here is issued from inside `FlashGate::with_parked`, which first parks the
//! control core outside any lock. The watchdog is disabled for the duration of
//! the write because neither core can feed it.

use embedded_storage::{ReadStorage, Storage};
use esp_bootloader_esp_idf::ota::OtaImageState;
use esp_bootloader_esp_idf::ota_updater::OtaUpdater;
use esp_bootloader_esp_idf::partitions::{
    read_partition_table, AppPartitionSubType, DataPartitionSubType, PartitionType,
    PARTITION_TABLE_MAX_LEN,
};
use esp_storage::FlashStorage;
use multitool_core::error::{OtaError, SettingsError};
use multitool_core::ota::{image_len, StagingArea};
use multitool_core::settings::{Slot, SlotStorage};

const SECTOR_SIZE: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    PartitionTable,
    PartitionMissing,
}

/// Run a flash write with the watchdog stopped.
fn unguarded<R>(write: impl FnOnce() -> R) -> R {
    crate::feed_watchdog();
    crate::disable_watchdog();
    let r = write();
    crate::enable_watchdog();
    crate::feed_watchdog();
    r
}

/// The A/B settings slots.
///
/// Without a usable data partition every access fails, so settings fall back
/// to the build-time defaults and saves are reported as errors.
pub struct FlashSlots {
    flash: FlashStorage,
    base: Option<u32>,
}

impl FlashSlots {
    pub fn new() -> Self {
        let mut flash = FlashStorage::new();
        let base = match Self::locate(&mut flash) {
            Ok(base) => {
                log::info!(
                    "storage: settings slots at 0x{:X} and 0x{:X}",
                    base,
                    base + SECTOR_SIZE
                );
                Some(base)
            }
            Err(e) => {
                log::error!("storage: no settings partition ({:?}), settings will not persist", e);
                None
            }
        };
        Self { flash, base }
    }

    fn locate(flash: &mut FlashStorage) -> Result<u32, StorageError> {
        let mut table_buf = [0u8; PARTITION_TABLE_MAX_LEN];
        let table =
            read_partition_table(flash, &mut table_buf).map_err(|_| StorageError::PartitionTable)?;

        let mut undefined = None;
        let mut nvs = None;
        for entry in table.iter() {
            if entry.is_read_only() || entry.len() < 2 * SECTOR_SIZE {
                continue;
            }
            match entry.partition_type() {
                PartitionType::Data(DataPartitionSubType::Undefined) if undefined.is_none() => {
                    undefined = Some((entry.offset(), entry.len()))
                }
                PartitionType::Data(DataPartitionSubType::Nvs) if nvs.is_none() => {
                    nvs = Some((entry.offset(), entry.len()))
                }
                _ => {}
            }
        }
        let (offset, len) = undefined.or(nvs).ok_or(StorageError::PartitionMissing)?;
        Ok(offset + len - 2 * SECTOR_SIZE)
    }

    fn offset(&self, slot: Slot) -> Result<u32, SettingsError> {
        let base = self.base.ok_or(SettingsError::Flash)?;
        Ok(base + slot as u32 * SECTOR_SIZE)
    }
}

impl SlotStorage for FlashSlots {
    fn read_slot(&mut self, slot: Slot, buf: &mut [u8]) -> Result<(), SettingsError> {
        let offset = self.offset(slot)?;
        self.flash.read(offset, buf).map_err(|e| {
            log::warn!("storage: read of slot {:?} failed: {:?}", slot, e);
            SettingsError::Flash
        })
    }

    fn write_slot(&mut self, slot: Slot, record: &[u8]) -> Result<(), SettingsError> {
        let offset = self.offset(slot)?;
        log::info!("storage: writing {} bytes to 0x{:X}", record.len(), offset);
        unguarded(|| self.flash.write(offset, record)).map_err(|e| {
            log::error!("storage: flash write to slot {:?} failed: {:?}", slot, e);
            SettingsError::Flash
        })
    }
}

/// Where the staging partition and the running image live.
struct Layout {
    offset: u32,
    len: u32,
    running: Option<u32>,
}

/// The inactive OTA app partition. Capacity is zero on tables without one, so
/// every update is refused as too large.
pub struct OtaStaging {
    flash: FlashStorage,
    offset: u32,
    len: u32,
    /// Offset of the partition we booted from.
    running: Option<u32>,
}

/// The slot that is not `target`. Single-OTA layouts boot from factory.
fn sibling(target: AppPartitionSubType) -> AppPartitionSubType {
    match target {
        AppPartitionSubType::Ota0 => AppPartitionSubType::Ota1,
        AppPartitionSubType::Ota1 => AppPartitionSubType::Ota0,
        _ => AppPartitionSubType::Factory,
    }
}

impl OtaStaging {
    pub fn new() -> Self {
        let mut flash = FlashStorage::new();
        let layout = Self::locate(&mut flash).unwrap_or_else(|e| {
            log::error!("ota: no staging partition ({:?}), updates disabled", e);
            Layout {
                offset: 0,
                len: 0,
                running: None,
            }
        });
        Self {
            flash,
            offset: layout.offset,
            len: layout.len,
            running: layout.running,
        }
    }

    fn locate(flash: &mut FlashStorage) -> Result<Layout, StorageError> {
        let mut buf = [0u8; PARTITION_TABLE_MAX_LEN];
        let target = {
            let mut updater =
                OtaUpdater::new(flash, &mut buf).map_err(|_| StorageError::PartitionTable)?;
            let (_, target) = updater.next_partition().map_err(|_| StorageError::PartitionMissing)?;
            target
        };

        let mut table_buf = [0u8; PARTITION_TABLE_MAX_LEN];
        let table =
            read_partition_table(flash, &mut table_buf).map_err(|_| StorageError::PartitionTable)?;
        let entry = table
            .find_partition(PartitionType::App(target))
            .map_err(|_| StorageError::PartitionTable)?
            .ok_or(StorageError::PartitionMissing)?;
        let running = [sibling(target), AppPartitionSubType::Factory]
            .into_iter()
            .find_map(|sub| table.find_partition(PartitionType::App(sub)).ok().flatten())
            .map(|entry| entry.offset());
        log::info!(
            "ota: staging into {:?} at 0x{:X} ({} KiB)",
            target,
            entry.offset(),
            entry.len() / 1024
        );
        Ok(Layout {
            offset: entry.offset(),
            len: entry.len(),
            running,
        })
    }

    /// Size of the image we are running, 0 if it cannot be read.
    pub fn running_image_len(&mut self) -> u32 {
        let Some(base) = self.running else {
            return 0;
        };
        let flash = &mut self.flash;
        match image_len(|offset, buf: &mut [u8]| flash.read(base + offset as u32, buf)) {
            Ok(Some(len)) => len as u32,
            Ok(None) => {
                log::warn!("ota: no app image at 0x{:X}", base);
                0
            }
            Err(e) => {
                log::warn!("ota: image header read failed: {:?}", e);
                0
            }
        }
    }
}

impl StagingArea for OtaStaging {
    fn capacity(&self) -> usize {
        self.len as usize
    }

    fn begin(&mut self, len: usize) -> Result<(), OtaError> {
        // Sectors are erased on first write by the read-modify-write path.
        if len > self.capacity() {
            return Err(OtaError::TooLarge);
        }
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), OtaError> {
        let at = self.offset + offset as u32;
        unguarded(|| self.flash.write(at, data)).map_err(|e| {
            log::error!("ota: flash write at 0x{:X} failed: {:?}", at, e);
            OtaError::Flash
        })
    }

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), OtaError> {
        self.flash.read(self.offset + offset as u32, buf).map_err(|_| OtaError::Flash)
    }

    fn activate(&mut self) -> Result<(), OtaError> {
        let mut buf = [0u8; PARTITION_TABLE_MAX_LEN];
        unguarded(|| {
            let mut updater = OtaUpdater::new(&mut self.flash, &mut buf)?;
            updater.activate_next_partition()?;
            updater.set_current_ota_state(OtaImageState::New)
        })
        .map_err(|e| {
            log::error!("ota: activation failed: {:?}", e);
            OtaError::Flash
        })
    }
}
