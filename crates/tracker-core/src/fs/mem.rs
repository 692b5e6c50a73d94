use heapless::Vec;

use super::{DirEntry, DirListing, FileHandle, FileName, FilePath, Filesystem, OpenMode};

pub const MEM_MAX_ENTRIES: usize = 64;
pub const MEM_MAX_FILE_BYTES: usize = 128;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemFsError {
    NotMounted,
    NotFound,
    AlreadyExists,
    NotEmpty,
    NoSpace,
    FileTooLarge,
    InvalidPath,
    ReadOnly,
    Injected,
}

#[derive(Debug, Clone)]
struct MemEntry {
    path: FilePath,
    is_directory: bool,
    data: Vec<u8, MEM_MAX_FILE_BYTES>,
}

/// RAM-backed filesystem for bring-up and host tests, with fault injection.
#[derive(Debug, Clone, Default)]
pub struct MemFilesystem {
    entries: Vec<MemEntry, MEM_MAX_ENTRIES>,
    mounted: bool,
    mount_failures: u8,
    format_fails: bool,
    write_fault_prefix: Option<FilePath>,
    format_count: u32,
}

impl MemFilesystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` mount attempts fail.
    pub fn with_mount_failures(mut self, count: u8) -> Self {
        self.mount_failures = count;
        self
    }

    pub fn with_failing_format(mut self) -> Self {
        self.format_fails = true;
        self
    }

    /// Opening anything below `prefix` for writing fails.
    pub fn fail_writes_under(&mut self, prefix: &str) {
        let mut path = FilePath::new();
        let _ = path.push_str(prefix);
        self.write_fault_prefix = Some(path);
    }

    pub fn clear_write_faults(&mut self) {
        self.write_fault_prefix = None;
    }

    pub fn format_count(&self) -> u32 {
        self.format_count
    }

    /// Creates or replaces a file, creating its parent directory as needed.
    /// Ignores the mounted state.
    pub fn put_file(&mut self, path: &str, bytes: &[u8]) {
        if let Some((parent, _)) = split_parent(path)
            && parent != "/"
            && self.find(parent).is_none()
        {
            let _ = self.insert(parent, true);
        }

        let index = match self.find(path) {
            Some(index) => index,
            None => match self.insert(path, false) {
                Ok(index) => index,
                Err(_) => return,
            },
        };
        let entry = &mut self.entries[index];
        entry.is_directory = false;
        entry.data.clear();
        let _ = entry.data.extend_from_slice(bytes);
    }

    pub fn file_bytes(&self, path: &str) -> Option<&[u8]> {
        self.find(path)
            .map(|index| &self.entries[index])
            .filter(|entry| !entry.is_directory)
            .map(|entry| entry.data.as_slice())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.find(path).is_some()
    }

    /// `(path, bytes)` for every plain file, in creation order.
    pub fn files(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries
            .iter()
            .filter(|entry| !entry.is_directory)
            .map(|entry| (entry.path.as_str(), entry.data.as_slice()))
    }

    fn find(&self, path: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.path.as_str() == path)
    }

    fn insert(&mut self, path: &str, is_directory: bool) -> Result<usize, MemFsError> {
        let mut stored = FilePath::new();
        stored
            .push_str(path)
            .map_err(|_| MemFsError::InvalidPath)?;
        self.entries
            .push(MemEntry {
                path: stored,
                is_directory,
                data: Vec::new(),
            })
            .map_err(|_| MemFsError::NoSpace)?;
        Ok(self.entries.len() - 1)
    }

    fn ensure_mounted(&self) -> Result<(), MemFsError> {
        if self.mounted {
            Ok(())
        } else {
            Err(MemFsError::NotMounted)
        }
    }

    fn parent_is_directory(&self, path: &str) -> bool {
        match split_parent(path) {
            Some(("/", _)) => true,
            Some((parent, _)) => self
                .find(parent)
                .is_some_and(|index| self.entries[index].is_directory),
            None => false,
        }
    }

    fn has_children(&self, dir: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| split_parent(&entry.path).is_some_and(|(parent, _)| parent == dir))
    }
}

fn split_parent(path: &str) -> Option<(&str, &str)> {
    let (parent, name) = path.rsplit_once('/')?;
    if name.is_empty() {
        return None;
    }
    if parent.is_empty() {
        Some(("/", name))
    } else {
        Some((parent, name))
    }
}

impl Filesystem for MemFilesystem {
    type Error = MemFsError;
    type File<'a> = MemFile<'a>;

    fn mount(&mut self) -> Result<(), Self::Error> {
        if self.mount_failures > 0 {
            self.mount_failures -= 1;
            return Err(MemFsError::Injected);
        }
        self.mounted = true;
        Ok(())
    }

    fn format(&mut self) -> Result<(), Self::Error> {
        if self.format_fails {
            return Err(MemFsError::Injected);
        }
        self.entries.clear();
        self.format_count = self.format_count.saturating_add(1);
        Ok(())
    }

    fn exists(&mut self, path: &str) -> bool {
        self.mounted && (path == "/" || self.find(path).is_some())
    }

    fn is_directory(&mut self, path: &str) -> bool {
        if !self.mounted {
            return false;
        }
        path == "/"
            || self
                .find(path)
                .is_some_and(|index| self.entries[index].is_directory)
    }

    fn mkdir(&mut self, path: &str) -> Result<(), Self::Error> {
        self.ensure_mounted()?;
        if self.find(path).is_some() || path == "/" {
            return Err(MemFsError::AlreadyExists);
        }
        if !self.parent_is_directory(path) {
            return Err(MemFsError::NotFound);
        }
        self.insert(path, true).map(|_| ())
    }

    fn remove(&mut self, path: &str) -> Result<(), Self::Error> {
        self.ensure_mounted()?;
        let index = self.find(path).ok_or(MemFsError::NotFound)?;
        if self.entries[index].is_directory && self.has_children(path) {
            return Err(MemFsError::NotEmpty);
        }
        self.entries.remove(index);
        Ok(())
    }

    fn open(&mut self, path: &str, mode: OpenMode) -> Result<Self::File<'_>, Self::Error> {
        self.ensure_mounted()?;
        let index = match mode {
            OpenMode::Read => self.find(path).ok_or(MemFsError::NotFound)?,
            OpenMode::Write => {
                if let Some(prefix) = &self.write_fault_prefix
                    && path.starts_with(prefix.as_str())
                {
                    return Err(MemFsError::Injected);
                }
                match self.find(path) {
                    Some(index) if self.entries[index].is_directory => {
                        return Err(MemFsError::AlreadyExists);
                    }
                    Some(index) => {
                        self.entries[index].data.clear();
                        index
                    }
                    None => {
                        if !self.parent_is_directory(path) {
                            return Err(MemFsError::NotFound);
                        }
                        self.insert(path, false)?
                    }
                }
            }
        };

        Ok(MemFile {
            entry: &mut self.entries[index],
            cursor: 0,
            writable: mode == OpenMode::Write,
        })
    }

    fn list(&mut self, dir: &str) -> Result<DirListing, Self::Error> {
        self.ensure_mounted()?;
        let mut listing = DirListing::new();
        if !self.is_directory(dir) {
            return Ok(listing);
        }

        for entry in &self.entries {
            let Some((parent, name)) = split_parent(&entry.path) else {
                continue;
            };
            if parent != dir {
                continue;
            }
            let mut file_name = FileName::new();
            if file_name.push_str(name).is_err() {
                continue;
            }
            listing
                .push(DirEntry {
                    name: file_name,
                    is_directory: entry.is_directory,
                    size: entry.data.len() as u32,
                })
                .map_err(|_| MemFsError::NoSpace)?;
        }
        Ok(listing)
    }
}

/// Handle into one [`MemFilesystem`] entry.
#[derive(Debug)]
pub struct MemFile<'a> {
    entry: &'a mut MemEntry,
    cursor: usize,
    writable: bool,
}

impl FileHandle for MemFile<'_> {
    type Error = MemFsError;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let data = &self.entry.data;
        let start = self.cursor.min(data.len());
        let count = buf.len().min(data.len() - start);
        buf[..count].copy_from_slice(&data[start..start + count]);
        self.cursor = start + count;
        Ok(count)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, Self::Error> {
        if !self.writable || self.entry.is_directory {
            return Err(MemFsError::ReadOnly);
        }
        if self.cursor + data.len() > MEM_MAX_FILE_BYTES {
            return Err(MemFsError::FileTooLarge);
        }

        let file = &mut self.entry.data;
        if file.len() < self.cursor {
            file.resize(self.cursor, 0)
                .map_err(|_| MemFsError::FileTooLarge)?;
        }
        for (offset, byte) in data.iter().enumerate() {
            let position = self.cursor + offset;
            if position < file.len() {
                file[position] = *byte;
            } else {
                file.push(*byte).map_err(|_| MemFsError::FileTooLarge)?;
            }
        }
        self.cursor += data.len();
        Ok(data.len())
    }

    fn seek(&mut self, position: u32) -> Result<(), Self::Error> {
        self.cursor = position as usize;
        Ok(())
    }

    fn size(&self) -> u32 {
        self.entry.data.len() as u32
    }

    fn is_directory(&self) -> bool {
        self.entry.is_directory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{read_fully, write_fully};

    #[test]
    fn unmounted_filesystem_rejects_io() {
        let mut fs = MemFilesystem::new();
        assert_eq!(fs.mkdir("/a"), Err(MemFsError::NotMounted));
        assert!(!fs.exists("/"));
    }

    #[test]
    fn write_then_read_back() {
        let mut fs = MemFilesystem::new();
        fs.mount().unwrap();
        {
            let mut file = fs.open("/config.bin", OpenMode::Write).unwrap();
            assert_eq!(write_fully(&mut file, &[1, 2, 3, 4]).unwrap(), 4);
        }

        let mut file = fs.open("/config.bin", OpenMode::Read).unwrap();
        assert_eq!(file.size(), 4);
        let mut buf = [0u8; 8];
        assert_eq!(read_fully(&mut file, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], &[1, 2, 3, 4]);

        file.seek(2).unwrap();
        assert_eq!(read_fully(&mut file, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[3, 4]);
    }

    #[test]
    fn write_requires_parent_directory() {
        let mut fs = MemFilesystem::new();
        fs.mount().unwrap();
        assert_eq!(
            fs.open("/calibrations/1", OpenMode::Write).err(),
            Some(MemFsError::NotFound)
        );
        fs.mkdir("/calibrations").unwrap();
        assert!(fs.open("/calibrations/1", OpenMode::Write).is_ok());
    }

    #[test]
    fn write_faults_are_scoped_to_prefix() {
        let mut fs = MemFilesystem::new();
        fs.mount().unwrap();
        fs.mkdir("/a").unwrap();
        fs.mkdir("/b").unwrap();
        fs.fail_writes_under("/a");

        assert_eq!(
            fs.open("/a/1", OpenMode::Write).err(),
            Some(MemFsError::Injected)
        );
        assert!(fs.open("/b/1", OpenMode::Write).is_ok());
    }

    #[test]
    fn non_empty_directory_cannot_be_removed() {
        let mut fs = MemFilesystem::new();
        fs.mount().unwrap();
        fs.put_file("/a/1", &[1]);
        assert_eq!(fs.remove("/a"), Err(MemFsError::NotEmpty));
        fs.remove("/a/1").unwrap();
        fs.remove("/a").unwrap();
        assert!(!fs.contains("/a"));
    }
}
