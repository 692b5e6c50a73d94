//! Station credentials kept in the last sector of a writable data partition,
//! outside the SD card so a reformat of the configuration volume keeps them.

use embedded_storage::{ReadStorage, Storage};
use esp_bootloader_esp_idf::partitions::{
    DataPartitionSubType, PARTITION_TABLE_MAX_LEN, PartitionType, read_partition_table,
};
use esp_rom_sys::rom::spiflash::{
    ESP_ROM_SPIFLASH_RESULT_OK, esp_rom_spiflash_erase_sector, esp_rom_spiflash_read,
    esp_rom_spiflash_unlock, esp_rom_spiflash_write,
};
use log::{debug, warn};
use tracker_core::network::{MAX_PASSWORD_BYTES, MAX_SSID_BYTES, WifiCredentials};

const FLASH_SECTOR_SIZE: u32 = 4096;
const DEFAULT_FLASH_CAPACITY_BYTES: usize = 16 * 1024 * 1024;

const CREDENTIALS_MAGIC: u32 = 0x3143_5754; // "TWC1"
const CREDENTIALS_VERSION: u8 = 1;
const SSID_OFFSET: usize = 8;
const PASSWORD_OFFSET: usize = SSID_OFFSET + MAX_SSID_BYTES;
const CHECKSUM_OFFSET: usize = PASSWORD_OFFSET + MAX_PASSWORD_BYTES;
const CREDENTIALS_RECORD_LEN: usize = CHECKSUM_OFFSET + 4;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FlashCredentialsError {
    PartitionTable,
    PartitionMissing,
    PartitionTooSmall,
    FlashOpFailed(i32),
    Corrupted,
    Unsupported,
}

#[derive(Debug)]
struct RawFlash;

impl RawFlash {
    fn new() -> Result<Self, FlashCredentialsError> {
        let rc = unsafe { esp_rom_spiflash_unlock() };
        if rc != ESP_ROM_SPIFLASH_RESULT_OK {
            return Err(FlashCredentialsError::FlashOpFailed(rc));
        }
        Ok(Self)
    }

    fn erase_sector(&mut self, sector_addr: u32) -> Result<(), FlashCredentialsError> {
        if !sector_addr.is_multiple_of(FLASH_SECTOR_SIZE) {
            return Err(FlashCredentialsError::Unsupported);
        }

        let rc = unsafe { esp_rom_spiflash_erase_sector(sector_addr / FLASH_SECTOR_SIZE) };
        if rc != ESP_ROM_SPIFLASH_RESULT_OK {
            return Err(FlashCredentialsError::FlashOpFailed(rc));
        }
        Ok(())
    }

    fn read_word(&mut self, addr: u32) -> Result<u32, FlashCredentialsError> {
        if !addr.is_multiple_of(4) {
            return Err(FlashCredentialsError::Unsupported);
        }

        let mut word = 0u32;
        let rc = unsafe { esp_rom_spiflash_read(addr, &mut word as *mut u32 as *const u32, 4) };
        if rc != ESP_ROM_SPIFLASH_RESULT_OK {
            return Err(FlashCredentialsError::FlashOpFailed(rc));
        }
        Ok(word)
    }

    fn write_word(&mut self, addr: u32, word: u32) -> Result<(), FlashCredentialsError> {
        if !addr.is_multiple_of(4) {
            return Err(FlashCredentialsError::Unsupported);
        }

        let rc = unsafe { esp_rom_spiflash_write(addr, &word as *const u32, 4) };
        if rc != ESP_ROM_SPIFLASH_RESULT_OK {
            return Err(FlashCredentialsError::FlashOpFailed(rc));
        }
        Ok(())
    }

    /// Word-aligned reads only; `addr` and `out.len()` are both multiples of 4
    /// for every caller in this module.
    fn read_bytes(&mut self, addr: u32, out: &mut [u8]) -> Result<(), FlashCredentialsError> {
        if !addr.is_multiple_of(4) || !out.len().is_multiple_of(4) {
            return Err(FlashCredentialsError::Unsupported);
        }

        for (index, chunk) in out.chunks_exact_mut(4).enumerate() {
            let word = self.read_word(addr + (index * 4) as u32)?;
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        Ok(())
    }

    fn write_erased_bytes(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashCredentialsError> {
        if !addr.is_multiple_of(4) {
            return Err(FlashCredentialsError::Unsupported);
        }

        for (index, chunk) in data.chunks(4).enumerate() {
            let mut bytes = [0xFFu8; 4];
            bytes[..chunk.len()].copy_from_slice(chunk);
            self.write_word(addr + (index * 4) as u32, u32::from_le_bytes(bytes))?;
        }
        Ok(())
    }
}

impl ReadStorage for RawFlash {
    type Error = FlashCredentialsError;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.read_bytes(offset, bytes)
    }

    fn capacity(&self) -> usize {
        DEFAULT_FLASH_CAPACITY_BYTES
    }
}

impl Storage for RawFlash {
    fn write(&mut self, _offset: u32, _bytes: &[u8]) -> Result<(), Self::Error> {
        Err(FlashCredentialsError::Unsupported)
    }
}

#[derive(Debug)]
pub struct FlashCredentialStore {
    flash: RawFlash,
    sector_addr: u32,
}

impl FlashCredentialStore {
    /// Picks the first undefined data partition, falling back to NVS, and
    /// claims its last sector.
    pub fn new() -> Result<Self, FlashCredentialsError> {
        let mut flash = RawFlash::new()?;

        let mut table_buf = [0u8; PARTITION_TABLE_MAX_LEN];
        let table = read_partition_table(&mut flash, &mut table_buf)
            .map_err(|_| FlashCredentialsError::PartitionTable)?;

        let mut data_undefined: Option<(u32, u32)> = None;
        let mut fallback_nvs: Option<(u32, u32)> = None;

        for entry in table.iter() {
            if entry.is_read_only() || entry.len() < FLASH_SECTOR_SIZE {
                continue;
            }

            match entry.partition_type() {
                PartitionType::Data(DataPartitionSubType::Undefined) => {
                    data_undefined = Some((entry.offset(), entry.len()));
                    break;
                }
                PartitionType::Data(DataPartitionSubType::Nvs) => {
                    if fallback_nvs.is_none() {
                        fallback_nvs = Some((entry.offset(), entry.len()));
                    }
                }
                _ => {}
            }
        }

        let (offset, len) = data_undefined
            .or(fallback_nvs)
            .ok_or(FlashCredentialsError::PartitionMissing)?;
        if len < FLASH_SECTOR_SIZE {
            return Err(FlashCredentialsError::PartitionTooSmall);
        }

        let sector_addr = offset + len - FLASH_SECTOR_SIZE;
        debug!("flash: credentials sector at {:#x}", sector_addr);
        Ok(Self { flash, sector_addr })
    }

    /// `Ok(None)` for an erased sector or a record written by something else.
    pub fn load(&mut self) -> Result<Option<WifiCredentials>, FlashCredentialsError> {
        let mut buf = [0u8; CREDENTIALS_RECORD_LEN];
        self.flash.read_bytes(self.sector_addr, &mut buf)?;
        decode_record(&buf)
    }

    pub fn save(&mut self, credentials: &WifiCredentials) -> Result<(), FlashCredentialsError> {
        let buf = encode_record(credentials);
        self.flash.erase_sector(self.sector_addr)?;
        self.flash.write_erased_bytes(self.sector_addr, &buf)
    }
}

fn encode_record(credentials: &WifiCredentials) -> [u8; CREDENTIALS_RECORD_LEN] {
    let ssid = credentials.ssid.as_bytes();
    let password = credentials.password.as_bytes();

    let mut buf = [0u8; CREDENTIALS_RECORD_LEN];
    buf[0..4].copy_from_slice(&CREDENTIALS_MAGIC.to_le_bytes());
    buf[4] = CREDENTIALS_VERSION;
    buf[5] = ssid.len() as u8;
    buf[6] = password.len() as u8;
    buf[SSID_OFFSET..SSID_OFFSET + ssid.len()].copy_from_slice(ssid);
    buf[PASSWORD_OFFSET..PASSWORD_OFFSET + password.len()].copy_from_slice(password);

    let checksum = checksum32(&buf[..CHECKSUM_OFFSET]);
    buf[CHECKSUM_OFFSET..].copy_from_slice(&checksum.to_le_bytes());
    buf
}

fn decode_record(
    buf: &[u8; CREDENTIALS_RECORD_LEN],
) -> Result<Option<WifiCredentials>, FlashCredentialsError> {
    if buf.iter().all(|b| *b == 0xFF) {
        return Ok(None);
    }

    let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != CREDENTIALS_MAGIC || buf[4] != CREDENTIALS_VERSION {
        warn!("flash: ignoring foreign record magic={:#x} version={}", magic, buf[4]);
        return Ok(None);
    }

    let expected = u32::from_le_bytes([
        buf[CHECKSUM_OFFSET],
        buf[CHECKSUM_OFFSET + 1],
        buf[CHECKSUM_OFFSET + 2],
        buf[CHECKSUM_OFFSET + 3],
    ]);
    if checksum32(&buf[..CHECKSUM_OFFSET]) != expected {
        return Err(FlashCredentialsError::Corrupted);
    }

    let ssid_len = buf[5] as usize;
    let password_len = buf[6] as usize;
    if ssid_len > MAX_SSID_BYTES || password_len > MAX_PASSWORD_BYTES {
        return Err(FlashCredentialsError::Corrupted);
    }

    let ssid = core::str::from_utf8(&buf[SSID_OFFSET..SSID_OFFSET + ssid_len])
        .map_err(|_| FlashCredentialsError::Corrupted)?;
    let password = core::str::from_utf8(&buf[PASSWORD_OFFSET..PASSWORD_OFFSET + password_len])
        .map_err(|_| FlashCredentialsError::Corrupted)?;

    WifiCredentials::new(ssid, password)
        .map(Some)
        .ok_or(FlashCredentialsError::Corrupted)
}

fn checksum32(bytes: &[u8]) -> u32 {
    let mut hash = 0x811C9DC5u32;
    for b in bytes {
        hash ^= *b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}
