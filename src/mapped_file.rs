use anyhow::{anyhow, Result};
use libc::c_void;
use more_asserts::*;
use std::fs::{File, OpenOptions};
use std::ops::Index;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Interpret offsets of a memory mapped file as
/// references to arbitrary types.
///
/// The mapping is shared so that the occasional repair write (which goes
/// through the fd, not the mapping) is visible to subsequent reads.

pub struct MappedFile {
    pointer: *mut c_void,
    len: usize,
    mapping_size: usize,
    file: File,
    writable: bool,
}

/* the mapping itself is never written through; concurrent readers are fine */
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    pub fn open(path: &Path) -> Result<MappedFile> {
        let (f, writable) = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => (f, true),
            Err(_) => (File::open(path)?, false),
        };
        let md = f.metadata()?;
        let len = if md.is_file() {
            md.len() as usize
        } else {
            //assume block device
            let mut len64 = 0_u64;
            let len_ref = &mut len64 as *mut u64;
            let ret = unsafe { ioctls::blkgetsize64(f.as_raw_fd(), len_ref) };
            assert_eq!(0, ret);
            len64 as usize
        };
        let ps = sysconf::page::pagesize();
        let mapping_size = ((len + ps - 1) / ps) * ps;
        let p = unsafe {
            libc::mmap(
                std::ptr::null_mut::<c_void>(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                f.as_raw_fd(),
                0,
            )
        };
        if libc::MAP_FAILED == p {
            return Err(anyhow!(
                "Failed to map file: {}",
                std::io::Error::last_os_error()
            ));
        }
        Ok(MappedFile {
            pointer: p,
            len,
            mapping_size,
            file: f,
            writable,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns a reference to T. T should be a primitive type or
    /// (probably) #[repr(C)]
    /// panics if the index is out of bounds.
    pub fn at<T>(&self, offset: usize) -> &T {
        if self.len - std::mem::size_of::<T>() <= offset {
            panic!("access beyond end of file");
        }
        unsafe { &*((self.pointer as usize + offset) as *mut c_void as *const T) }
    }

    /// Returns a slice of u8s representing part of the mapped file
    pub fn slice(&self, offset: usize, length: usize) -> &[u8] {
        assert_le!(offset + length, self.len);
        unsafe {
            std::slice::from_raw_parts(
                &*((self.pointer as usize + offset) as *mut c_void as *const u8),
                length,
            )
        }
    }

    /// Bounds-checked variant of `slice` for addresses that come from
    /// scavenged (i.e. untrusted) records.
    pub fn try_slice(&self, offset: usize, length: usize) -> Option<&[u8]> {
        if offset.checked_add(length)? > self.len {
            return None;
        }
        Some(self.slice(offset, length))
    }

    /// Positioned write through the fd. The shared mapping observes it.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> std::io::Result<()> {
        if !self.writable {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "device opened read-only",
            ));
        }
        if offset + data.len() > self.len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "write beyond end of device",
            ));
        }
        self.file.write_all_at(data, offset as u64)
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        unsafe {
            let ret = libc::munmap(self.pointer, self.mapping_size);
            assert_eq!(ret, 0);
        }
    }
}

impl Index<usize> for MappedFile {
    type Output = u8;

    fn index(&self, idx: usize) -> &Self::Output {
        if self.len - std::mem::size_of::<usize>() <= idx {
            panic!("access beyond end of file");
        }
        unsafe { &*((self.pointer as usize + idx) as *mut c_void as *const u8) }
    }
}
