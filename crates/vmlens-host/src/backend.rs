//! Memory-mapped access to the file backing guest physical RAM.
//!
//! QEMU (with a `memory-backend-file` object) keeps a byte-for-byte
//! mirror of guest RAM in an ordinary host file.  [`MemoryBackend`] maps
//! that file and exposes byte-addressable reads plus a raw slice for
//! zero-copy access.  Offset 0 of the file corresponds to the guest's
//! configured RAM base, which is architecture/config-dependent — callers
//! supply offsets in file space, not general guest-physical space.
//!
//! The mapping is read-only by default.  A read-write mapping
//! ([`MemoryBackend::map_rw`]) is only needed to drive the host-owned
//! beacon control pages.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use log::info;
use memmap2::{Mmap, MmapMut, MmapOptions};
use thiserror::Error;

/// Errors from mapping or accessing the guest memory file.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Opening or mapping the backing file failed.
    #[error("failed to map {path}: {source}")]
    Map {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Anonymous backing allocation failed.
    #[error("failed to allocate anonymous backing of {size} bytes")]
    Anonymous {
        size: usize,
        #[source]
        source: std::io::Error,
    },

    /// A requested range falls outside the mapped region.
    #[error("range {offset:#x}..{offset:#x}+{len:#x} outside mapped region of {size:#x} bytes")]
    OutOfRange {
        offset: u64,
        len: usize,
        size: usize,
    },

    /// A write was attempted on a read-only mapping.
    #[error("backend is mapped read-only")]
    ReadOnly,
}

enum Mapping {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

/// Byte-addressable view of guest physical memory.
pub struct MemoryBackend {
    mapping: Mapping,
    path: Option<PathBuf>,
}

impl MemoryBackend {
    /// Map a guest memory file read-only.
    pub fn map<P: AsRef<Path>>(path: P) -> Result<Self, BackendError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(|source| BackendError::Map { path: path.into(), source })?;
        // Safety: the mapping is backed by a regular file the caller
        // controls; concurrent guest writes are the whole point and are
        // handled by the tear-detection protocol above this layer.
        let map = unsafe { MmapOptions::new().map(&file) }
            .map_err(|source| BackendError::Map { path: path.into(), source })?;

        info!(
            "mapped {} read-only: {} MB",
            path.display(),
            map.len() / (1024 * 1024),
        );

        Ok(Self {
            mapping: Mapping::ReadOnly(map),
            path: Some(path.into()),
        })
    }

    /// Map a guest memory file read-write.
    ///
    /// Required for the camera control channel; everything else works on
    /// a read-only mapping.
    pub fn map_rw<P: AsRef<Path>>(path: P) -> Result<Self, BackendError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| BackendError::Map { path: path.into(), source })?;
        // Safety: as in `map`; writes are confined to host-owned pages.
        let map = unsafe { MmapOptions::new().map_mut(&file) }
            .map_err(|source| BackendError::Map { path: path.into(), source })?;

        info!(
            "mapped {} read-write: {} MB",
            path.display(),
            map.len() / (1024 * 1024),
        );

        Ok(Self {
            mapping: Mapping::ReadWrite(map),
            path: Some(path.into()),
        })
    }

    /// Allocate an anonymous zero-filled backing of `size` bytes.
    ///
    /// Used by tests and by writer-side code that publishes pages into a
    /// region it owns.
    pub fn anonymous(size: usize) -> Result<Self, BackendError> {
        let map = MmapOptions::new()
            .len(size)
            .map_anon()
            .map_err(|source| BackendError::Anonymous { size, source })?;
        Ok(Self {
            mapping: Mapping::ReadWrite(map),
            path: None,
        })
    }

    /// Total size of the mapped region in bytes.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether the mapped region is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Path of the backing file, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The whole mapped region as a byte slice (zero-copy).
    pub fn as_slice(&self) -> &[u8] {
        match &self.mapping {
            Mapping::ReadOnly(m) => m,
            Mapping::ReadWrite(m) => m,
        }
    }

    /// Borrow `len` bytes at `offset` (zero-copy).
    pub fn read(&self, offset: u64, len: usize) -> Result<&[u8], BackendError> {
        let size = self.len();
        let start = usize::try_from(offset).map_err(|_| BackendError::OutOfRange {
            offset,
            len,
            size,
        })?;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= size)
            .ok_or(BackendError::OutOfRange { offset, len, size })?;
        Ok(&self.as_slice()[start..end])
    }

    /// Copy `buf.len()` bytes at `offset` into `buf`.
    pub fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<(), BackendError> {
        let src = self.read(offset, buf.len())?;
        buf.copy_from_slice(src);
        Ok(())
    }

    /// Read a little-endian `u32` at `offset`.
    pub fn read_u32(&self, offset: u64) -> Result<u32, BackendError> {
        let b = self.read(offset, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a little-endian `u64` at `offset`.
    pub fn read_u64(&self, offset: u64) -> Result<u64, BackendError> {
        let b = self.read(offset, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    /// Write `data` at `offset`.
    ///
    /// Only valid on a read-write or anonymous mapping, and only for
    /// pages this side owns (beacon control pages).
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), BackendError> {
        let size = self.len();
        let map = match &mut self.mapping {
            Mapping::ReadOnly(_) => return Err(BackendError::ReadOnly),
            Mapping::ReadWrite(m) => m,
        };
        let start = usize::try_from(offset).map_err(|_| BackendError::OutOfRange {
            offset,
            len: data.len(),
            size,
        })?;
        let end = start
            .checked_add(data.len())
            .filter(|&end| end <= size)
            .ok_or(BackendError::OutOfRange {
                offset,
                len: data.len(),
                size,
            })?;
        map[start..end].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn temp_file(name: &str, contents: &[u8]) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("vmlens-backend-{}-{}", std::process::id(), name));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[test]
    fn map_file_and_read() {
        let path = temp_file("read", &[0xAA; 8192]);
        let backend = MemoryBackend::map(&path).unwrap();
        assert_eq!(backend.len(), 8192);
        assert_eq!(backend.read(4096, 4).unwrap(), &[0xAA; 4]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn read_past_end_is_out_of_range() {
        let backend = MemoryBackend::anonymous(4096).unwrap();
        let err = backend.read(4095, 2).unwrap_err();
        assert!(matches!(err, BackendError::OutOfRange { offset: 4095, len: 2, .. }));
    }

    #[test]
    fn read_at_exact_end_is_ok() {
        let backend = MemoryBackend::anonymous(4096).unwrap();
        assert_eq!(backend.read(4092, 4).unwrap().len(), 4);
    }

    #[test]
    fn read_with_huge_offset_does_not_overflow() {
        let backend = MemoryBackend::anonymous(4096).unwrap();
        assert!(backend.read(u64::MAX, 1).is_err());
        assert!(backend.read(u64::MAX - 3, usize::MAX).is_err());
    }

    #[test]
    fn read_u32_u64_little_endian() {
        let mut backend = MemoryBackend::anonymous(4096).unwrap();
        backend.write(8, &0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        backend.write(16, &0x0102_0304_0506_0708u64.to_le_bytes()).unwrap();
        assert_eq!(backend.read_u32(8).unwrap(), 0xDEAD_BEEF);
        assert_eq!(backend.read_u64(16).unwrap(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn write_to_read_only_mapping_fails() {
        let path = temp_file("ro", &[0u8; 4096]);
        let mut backend = MemoryBackend::map(&path).unwrap();
        assert!(matches!(backend.write(0, &[1]), Err(BackendError::ReadOnly)));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rw_mapping_roundtrip() {
        let path = temp_file("rw", &[0u8; 4096]);
        let mut backend = MemoryBackend::map_rw(&path).unwrap();
        backend.write(100, b"beacon").unwrap();
        assert_eq!(backend.read(100, 6).unwrap(), b"beacon");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn write_out_of_range() {
        let mut backend = MemoryBackend::anonymous(4096).unwrap();
        assert!(matches!(
            backend.write(4090, &[0u8; 16]),
            Err(BackendError::OutOfRange { .. })
        ));
    }

    #[test]
    fn read_into_copies() {
        let mut backend = MemoryBackend::anonymous(4096).unwrap();
        backend.write(0, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        backend.read_into(0, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }
}
