//! FAT volume on an SPI SD card, exposed through the core `Filesystem` trait.
//!
//! FAT here is 8.3 only: every path component is shortened to fit, so
//! `/calibrations/3` lands in `CALIBRAT/3`. Only the root and one directory
//! level below it are reachable.

use embedded_hal::{
    delay::DelayNs,
    digital::OutputPin,
    spi::{Error as SpiErrorTrait, ErrorKind, ErrorType, Operation, SpiBus, SpiDevice},
};
use embedded_sdmmc::{
    Mode, RawDirectory, RawFile, RawVolume, SdCard, SdCardError, ShortFileName, TimeSource,
    Timestamp, VolumeIdx, VolumeManager,
};
use heapless::String;
use log::{debug, info, warn};
use tracker_core::fs::{DirEntry, DirListing, FileHandle, FileName, Filesystem, OpenMode};

const SHORT_BASE_BYTES: usize = 8;
const SHORT_EXT_BYTES: usize = 3;

type ShortName = String<12>;
type SdVolumeManager<BUS, CS, DELAY> =
    VolumeManager<SdCard<SdSpiDevice<BUS, CS>, DELAY>, FixedTimeSource>;

/// Fixed timestamp source used until RTC time integration is added.
#[derive(Clone, Copy, Debug, Default)]
pub struct FixedTimeSource;

impl TimeSource for FixedTimeSource {
    fn get_timestamp(&self) -> Timestamp {
        // 2026-01-01 00:00:00
        Timestamp {
            year_since_1970: 56,
            zero_indexed_month: 0,
            zero_indexed_day: 0,
            hours: 0,
            minutes: 0,
            seconds: 0,
        }
    }
}

#[derive(Debug)]
pub enum SdFsError {
    NotMounted,
    InvalidPath,
    Spi,
    Filesystem(embedded_sdmmc::Error<SdCardError>),
}

impl From<embedded_sdmmc::Error<SdCardError>> for SdFsError {
    fn from(err: embedded_sdmmc::Error<SdCardError>) -> Self {
        Self::Filesystem(err)
    }
}

#[derive(Debug)]
pub enum SdSpiError<BusErr, CsErr>
where
    BusErr: core::fmt::Debug,
    CsErr: core::fmt::Debug,
{
    Bus(BusErr),
    Cs(CsErr),
    DelayNotSupported,
}

impl<BusErr, CsErr> SpiErrorTrait for SdSpiError<BusErr, CsErr>
where
    BusErr: core::fmt::Debug,
    CsErr: core::fmt::Debug,
{
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

/// Owns the SD bus and its chip select; nothing else shares the bus.
pub struct SdSpiDevice<BUS, CS> {
    bus: BUS,
    cs: CS,
}

impl<BUS, CS> ErrorType for SdSpiDevice<BUS, CS>
where
    BUS: SpiBus<u8>,
    CS: OutputPin,
    BUS::Error: core::fmt::Debug,
    CS::Error: core::fmt::Debug,
{
    type Error = SdSpiError<BUS::Error, CS::Error>;
}

impl<BUS, CS> SpiDevice<u8> for SdSpiDevice<BUS, CS>
where
    BUS: SpiBus<u8>,
    CS: OutputPin,
    BUS::Error: core::fmt::Debug,
    CS::Error: core::fmt::Debug,
{
    fn transaction(&mut self, operations: &mut [Operation<'_, u8>]) -> Result<(), Self::Error> {
        if operations
            .iter()
            .any(|op| matches!(op, Operation::DelayNs(_)))
        {
            return Err(SdSpiError::DelayNotSupported);
        }

        self.cs.set_low().map_err(SdSpiError::Cs)?;

        let bus = &mut self.bus;
        let op_result = (|| {
            for operation in operations {
                match operation {
                    Operation::Read(buf) => bus.read(buf).map_err(SdSpiError::Bus)?,
                    Operation::Write(buf) => bus.write(buf).map_err(SdSpiError::Bus)?,
                    Operation::Transfer(read, write) => {
                        bus.transfer(read, write).map_err(SdSpiError::Bus)?
                    }
                    Operation::TransferInPlace(buf) => {
                        bus.transfer_in_place(buf).map_err(SdSpiError::Bus)?
                    }
                    Operation::DelayNs(_) => return Err(SdSpiError::DelayNotSupported),
                }
            }
            bus.flush().map_err(SdSpiError::Bus)
        })();

        let cs_result = self.cs.set_high().map_err(SdSpiError::Cs);
        op_result.and(cs_result)
    }
}

pub struct SdFilesystem<BUS, CS, DELAY>
where
    BUS: SpiBus<u8>,
    CS: OutputPin,
    DELAY: DelayNs,
    BUS::Error: core::fmt::Debug,
    CS::Error: core::fmt::Debug,
{
    volume_mgr: SdVolumeManager<BUS, CS, DELAY>,
    volume: Option<RawVolume>,
}

impl<BUS, CS, DELAY> SdFilesystem<BUS, CS, DELAY>
where
    BUS: SpiBus<u8>,
    CS: OutputPin,
    DELAY: DelayNs,
    BUS::Error: core::fmt::Debug,
    CS::Error: core::fmt::Debug,
{
    /// Wakes the card and takes ownership of the bus. The card itself is
    /// only initialised on the first mount.
    pub fn new(mut bus: BUS, mut cs: CS, delay: DELAY) -> Result<Self, SdFsError> {
        cs.set_high().map_err(|err| {
            warn!("sd: chip select failed: {:?}", err);
            SdFsError::Spi
        })?;

        // SD SPI init requires >=74 clock cycles with CS deasserted.
        let preclock = [0xFFu8; 10];
        bus.write(&preclock).map_err(|err| {
            warn!("sd: preclock failed: {:?}", err);
            SdFsError::Spi
        })?;

        let sd_card = SdCard::new(SdSpiDevice { bus, cs }, delay);
        Ok(Self {
            volume_mgr: VolumeManager::new(sd_card, FixedTimeSource),
            volume: None,
        })
    }

    fn root(&self) -> Result<RawDirectory, SdFsError> {
        let volume = self.volume.ok_or(SdFsError::NotMounted)?;
        Ok(self.volume_mgr.open_root_dir(volume)?)
    }

    /// Opens the directory holding `path`'s last component. The caller
    /// closes the returned handle.
    fn open_parent(&self, path: &str) -> Result<(RawDirectory, ShortName), SdFsError> {
        let (parent, name) = split_path(path)?;
        let root = self.root()?;
        let Some(parent) = parent else {
            return Ok((root, name));
        };

        let opened = self.volume_mgr.open_dir(root, parent.as_str());
        self.close_dir(root);
        Ok((opened?, name))
    }

    fn close_dir(&self, dir: RawDirectory) {
        if let Err(err) = self.volume_mgr.close_dir(dir) {
            warn!("sd: close dir failed: {:?}", err);
        }
    }

    fn lookup(&self, path: &str) -> Option<embedded_sdmmc::DirEntry> {
        if path == "/" {
            return None;
        }
        let (dir, name) = self.open_parent(path).ok()?;
        let entry = self.volume_mgr.find_directory_entry(dir, name.as_str()).ok();
        self.close_dir(dir);
        entry
    }

    fn delete_files_in(&self, dir: RawDirectory) -> Result<(), SdFsError> {
        let listing = self.list_raw(dir)?;
        for entry in listing.iter().filter(|entry| !entry.is_directory) {
            debug!("sd: format deleting {}", entry.name);
            self.volume_mgr
                .delete_file_in_dir(dir, entry.name.as_str())?;
        }
        Ok(())
    }

    fn list_raw(&self, dir: RawDirectory) -> Result<DirListing, SdFsError> {
        let mut listing = DirListing::new();
        let mut truncated = false;
        self.volume_mgr.iterate_dir(dir, |entry| {
            if entry.attributes.is_volume() || entry.name.base_name().starts_with(b".") {
                return;
            }
            let pushed = listing.push(DirEntry {
                name: short_file_name_to_string(&entry.name),
                is_directory: entry.attributes.is_directory(),
                size: entry.size,
            });
            truncated |= pushed.is_err();
        })?;
        if truncated {
            warn!("sd: directory listing truncated at {} entries", listing.len());
        }
        Ok(listing)
    }
}

impl<BUS, CS, DELAY> Filesystem for SdFilesystem<BUS, CS, DELAY>
where
    BUS: SpiBus<u8>,
    CS: OutputPin,
    DELAY: DelayNs,
    BUS::Error: core::fmt::Debug,
    CS::Error: core::fmt::Debug,
{
    type Error = SdFsError;
    type File<'a>
        = SdFile<'a, BUS, CS, DELAY>
    where
        Self: 'a;

    fn mount(&mut self) -> Result<(), SdFsError> {
        if self.volume.is_some() {
            return Ok(());
        }
        let volume = self.volume_mgr.open_raw_volume(VolumeIdx(0))?;
        self.volume = Some(volume);
        info!("sd: volume 0 mounted");
        Ok(())
    }

    /// Wipes every file in the root and in each first-level directory. The
    /// directories themselves stay; the FAT layer cannot remove them.
    fn format(&mut self) -> Result<(), SdFsError> {
        if self.volume.is_none() {
            self.mount()?;
        }
        let root = self.root()?;
        let result = (|| {
            for entry in self.list_raw(root)?.iter() {
                if !entry.is_directory {
                    continue;
                }
                let dir = self.volume_mgr.open_dir(root, entry.name.as_str())?;
                let wiped = self.delete_files_in(dir);
                self.close_dir(dir);
                wiped?;
            }
            self.delete_files_in(root)
        })();
        self.close_dir(root);
        if result.is_ok() {
            info!("sd: volume wiped");
        }
        result
    }

    fn exists(&mut self, path: &str) -> bool {
        path == "/" || self.lookup(path).is_some()
    }

    fn is_directory(&mut self, path: &str) -> bool {
        path == "/"
            || self
                .lookup(path)
                .is_some_and(|entry| entry.attributes.is_directory())
    }

    fn mkdir(&mut self, path: &str) -> Result<(), SdFsError> {
        let (dir, name) = self.open_parent(path)?;
        let result = self.volume_mgr.make_dir_in_dir(dir, name.as_str());
        self.close_dir(dir);
        Ok(result?)
    }

    fn remove(&mut self, path: &str) -> Result<(), SdFsError> {
        let (dir, name) = self.open_parent(path)?;
        let result = self.volume_mgr.delete_file_in_dir(dir, name.as_str());
        self.close_dir(dir);
        Ok(result?)
    }

    fn open(&mut self, path: &str, mode: OpenMode) -> Result<Self::File<'_>, SdFsError> {
        let (dir, name) = self.open_parent(path)?;
        let sd_mode = match mode {
            OpenMode::Read => Mode::ReadOnly,
            OpenMode::Write => Mode::ReadWriteCreateOrTruncate,
        };
        let file = self.volume_mgr.open_file_in_dir(dir, name.as_str(), sd_mode);
        self.close_dir(dir);
        Ok(SdFile {
            volume_mgr: &self.volume_mgr,
            raw: file?,
        })
    }

    fn list(&mut self, dir: &str) -> Result<DirListing, SdFsError> {
        if dir == "/" {
            let root = self.root()?;
            let listing = self.list_raw(root);
            self.close_dir(root);
            return listing;
        }
        if !self.is_directory(dir) {
            return Ok(DirListing::new());
        }

        let (parent, name) = self.open_parent(dir)?;
        let opened = self.volume_mgr.open_dir(parent, name.as_str());
        self.close_dir(parent);
        let opened = opened?;
        let listing = self.list_raw(opened);
        self.close_dir(opened);
        listing
    }
}

/// Open file on the card; closed when dropped.
pub struct SdFile<'a, BUS, CS, DELAY>
where
    BUS: SpiBus<u8>,
    CS: OutputPin,
    DELAY: DelayNs,
    BUS::Error: core::fmt::Debug,
    CS::Error: core::fmt::Debug,
{
    volume_mgr: &'a SdVolumeManager<BUS, CS, DELAY>,
    raw: RawFile,
}

impl<BUS, CS, DELAY> FileHandle for SdFile<'_, BUS, CS, DELAY>
where
    BUS: SpiBus<u8>,
    CS: OutputPin,
    DELAY: DelayNs,
    BUS::Error: core::fmt::Debug,
    CS::Error: core::fmt::Debug,
{
    type Error = SdFsError;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SdFsError> {
        if self.volume_mgr.file_eof(self.raw)? {
            return Ok(0);
        }
        Ok(self.volume_mgr.read(self.raw, buf)?)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, SdFsError> {
        self.volume_mgr.write(self.raw, data)?;
        Ok(data.len())
    }

    fn seek(&mut self, position: u32) -> Result<(), SdFsError> {
        Ok(self.volume_mgr.file_seek_from_start(self.raw, position)?)
    }

    fn size(&self) -> u32 {
        self.volume_mgr.file_length(self.raw).unwrap_or(0)
    }

    fn is_directory(&self) -> bool {
        false
    }
}

impl<BUS, CS, DELAY> Drop for SdFile<'_, BUS, CS, DELAY>
where
    BUS: SpiBus<u8>,
    CS: OutputPin,
    DELAY: DelayNs,
    BUS::Error: core::fmt::Debug,
    CS::Error: core::fmt::Debug,
{
    fn drop(&mut self) {
        if let Err(err) = self.volume_mgr.close_file(self.raw) {
            warn!("sd: close file failed: {:?}", err);
        }
    }
}

/// Splits `/dir/name` or `/name` into 8.3 components.
fn split_path(path: &str) -> Result<(Option<ShortName>, ShortName), SdFsError> {
    let trimmed = path.strip_prefix('/').ok_or(SdFsError::InvalidPath)?;
    let mut parts = trimmed.split('/');
    let first = parts.next().filter(|part| !part.is_empty());
    let second = parts.next();
    if parts.next().is_some() {
        return Err(SdFsError::InvalidPath);
    }

    match (first, second) {
        (Some(name), None) => Ok((None, short_component(name)?)),
        (Some(dir), Some(name)) if !name.is_empty() => {
            Ok((Some(short_component(dir)?), short_component(name)?))
        }
        _ => Err(SdFsError::InvalidPath),
    }
}

fn short_component(name: &str) -> Result<ShortName, SdFsError> {
    let (base, ext) = match name.rfind('.') {
        Some(0) | None => (name, ""),
        Some(dot) => (&name[..dot], &name[dot + 1..]),
    };
    if base.is_empty() || !name.is_ascii() {
        return Err(SdFsError::InvalidPath);
    }

    let mut out = ShortName::new();
    for byte in base.bytes().take(SHORT_BASE_BYTES) {
        let _ = out.push(byte.to_ascii_uppercase() as char);
    }
    if !ext.is_empty() {
        let _ = out.push('.');
        for byte in ext.bytes().take(SHORT_EXT_BYTES) {
            let _ = out.push(byte.to_ascii_uppercase() as char);
        }
    }
    Ok(out)
}

fn short_file_name_to_string(name: &ShortFileName) -> FileName {
    let mut out = FileName::new();

    for &byte in name.base_name() {
        if out.push(byte as char).is_err() {
            return out;
        }
    }

    let ext = name.extension();
    if !ext.is_empty() {
        let _ = out.push('.');
        for &byte in ext {
            if out.push(byte as char).is_err() {
                break;
            }
        }
    }

    out
}
