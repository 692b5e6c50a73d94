//! Block filesystem abstraction used by the configuration store.
//!
//! Paths are absolute, `/`-separated and never carry a trailing slash. The
//! store only ever needs one directory level below the root.

use core::fmt::Write as _;

use heapless::{String, Vec};

pub mod mem;

pub const MAX_NAME_BYTES: usize = 16;
pub const MAX_PATH_BYTES: usize = 40;
pub const MAX_DIR_ENTRIES: usize = 32;

pub type FileName = String<MAX_NAME_BYTES>;
pub type FilePath = String<MAX_PATH_BYTES>;
pub type DirListing = Vec<DirEntry, MAX_DIR_ENTRIES>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpenMode {
    Read,
    /// Create or truncate.
    Write,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
    pub name: FileName,
    pub is_directory: bool,
    pub size: u32,
}

/// Open file. Dropping the handle closes it.
pub trait FileHandle {
    type Error;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;
    fn write(&mut self, data: &[u8]) -> Result<usize, Self::Error>;
    fn seek(&mut self, position: u32) -> Result<(), Self::Error>;
    fn size(&self) -> u32;
    fn is_directory(&self) -> bool;
}

/// Mountable block filesystem.
pub trait Filesystem {
    type Error: core::fmt::Debug;
    type File<'a>: FileHandle<Error = Self::Error>
    where
        Self: 'a;

    fn mount(&mut self) -> Result<(), Self::Error>;
    fn format(&mut self) -> Result<(), Self::Error>;
    fn exists(&mut self, path: &str) -> bool;
    fn is_directory(&mut self, path: &str) -> bool;
    fn mkdir(&mut self, path: &str) -> Result<(), Self::Error>;
    fn remove(&mut self, path: &str) -> Result<(), Self::Error>;
    fn open(&mut self, path: &str, mode: OpenMode) -> Result<Self::File<'_>, Self::Error>;
    /// Entries directly below `dir`. An absent directory lists as empty and
    /// is never created.
    fn list(&mut self, dir: &str) -> Result<DirListing, Self::Error>;
}

/// Makes sure `path` is a directory, replacing a plain file squatting on it.
pub fn ensure_directory<F: Filesystem>(fs: &mut F, path: &str) -> Result<(), F::Error> {
    if fs.exists(path) {
        if fs.is_directory(path) {
            return Ok(());
        }
        log::warn!("fs: {} is a file, replacing with a directory", path);
        fs.remove(path)?;
    }
    fs.mkdir(path)
}

/// Calls `callback` for every plain file in `dir`; subdirectories are skipped.
///
/// The listing is taken up front, so the callback may mutate the filesystem.
pub fn for_each_file<F, C>(fs: &mut F, dir: &str, mut callback: C) -> Result<(), F::Error>
where
    F: Filesystem,
    C: FnMut(&mut F, &DirEntry),
{
    let listing = fs.list(dir)?;
    for entry in listing.iter().filter(|entry| !entry.is_directory) {
        callback(fs, entry);
    }
    Ok(())
}

pub fn join_path(dir: &str, name: &str) -> FilePath {
    let mut path = FilePath::new();
    let _ = path.push_str(dir.trim_end_matches('/'));
    let _ = path.push('/');
    let _ = path.push_str(name);
    path
}

/// `<dir>/<id>` in decimal.
pub fn slot_path(dir: &str, id: usize) -> FilePath {
    let mut path = FilePath::new();
    let _ = write!(path, "{}/{}", dir.trim_end_matches('/'), id);
    path
}

/// Reads until `buf` is full or the file ends.
pub fn read_fully<H: FileHandle>(file: &mut H, buf: &mut [u8]) -> Result<usize, H::Error> {
    let mut filled = 0usize;
    while filled < buf.len() {
        let read = file.read(&mut buf[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

/// Writes `data` in full, returning how many bytes the file accepted.
pub fn write_fully<H: FileHandle>(file: &mut H, data: &[u8]) -> Result<usize, H::Error> {
    let mut written = 0usize;
    while written < data.len() {
        let accepted = file.write(&data[written..])?;
        if accepted == 0 {
            break;
        }
        written += accepted;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::mem::MemFilesystem;
    use super::*;

    #[test]
    fn slot_paths_are_decimal() {
        assert_eq!(slot_path("/calibrations", 12).as_str(), "/calibrations/12");
        assert_eq!(join_path("/", "config.bin").as_str(), "/config.bin");
    }

    #[test]
    fn ensure_directory_replaces_plain_file() {
        let mut fs = MemFilesystem::new();
        fs.mount().unwrap();
        fs.put_file("/calibrations", &[1, 2, 3]);

        ensure_directory(&mut fs, "/calibrations").unwrap();

        assert!(fs.is_directory("/calibrations"));
        ensure_directory(&mut fs, "/calibrations").unwrap();
        assert!(fs.is_directory("/calibrations"));
    }

    #[test]
    fn for_each_file_skips_directories_and_tolerates_absence() {
        let mut fs = MemFilesystem::new();
        fs.mount().unwrap();

        let mut seen = 0;
        for_each_file(&mut fs, "/missing", |_, _| seen += 1).unwrap();
        assert_eq!(seen, 0);
        assert!(!fs.exists("/missing"));

        fs.mkdir("/data").unwrap();
        fs.mkdir("/data/nested").unwrap();
        fs.put_file("/data/1", &[0]);
        fs.put_file("/data/2", &[0, 0]);

        let mut names: Vec<FileName, 4> = Vec::new();
        for_each_file(&mut fs, "/data", |_, entry| {
            names.push(entry.name.clone()).unwrap();
        })
        .unwrap();
        assert_eq!(names.len(), 2);
        assert_eq!(names[0].as_str(), "1");
        assert_eq!(names[1].as_str(), "2");
    }

    #[test]
    fn for_each_file_callback_may_remove_entries() {
        let mut fs = MemFilesystem::new();
        fs.mount().unwrap();
        fs.mkdir("/data").unwrap();
        fs.put_file("/data/1", &[0]);
        fs.put_file("/data/2", &[0]);

        for_each_file(&mut fs, "/data", |fs, entry| {
            let path = join_path("/data", &entry.name);
            fs.remove(&path).unwrap();
        })
        .unwrap();

        assert!(fs.list("/data").unwrap().is_empty());
    }
}
