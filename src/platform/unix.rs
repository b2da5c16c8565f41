//! Unix implementation: mmap via memmap2, fcntl OFD record locks, stat
//! timestamps, kill(0) liveness probes.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use memmap2::MmapRaw;

use crate::error::{Result, ShrError};

/// One mapped cache layer file plus the open descriptor the record locks
/// live on. Dropping unmaps and closes, releasing any held locks.
pub struct CacheFile {
    path: PathBuf,
    file: File,
    map: MmapRaw,
    len: usize,
    readonly: bool,
}

// SAFETY: the mapping is shared mutable memory by design; all mutation is
// fenced by the cross-process lock protocol layered above, and the raw
// pointer accessors are the only way in.
unsafe impl Send for CacheFile {}
unsafe impl Sync for CacheFile {}

impl CacheFile {
    /// Create a new cache file of exactly `len` bytes, zero-filled, and map
    /// it read-write. Fails if the file already exists.
    pub fn create(path: &Path, len: usize, group_access: bool) -> Result<CacheFile> {
        let mode = if group_access { 0o660 } else { 0o600 };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(path)
            .map_err(|e| ShrError::io(path, e))?;
        file.set_len(len as u64).map_err(|e| ShrError::io(path, e))?;
        if group_access {
            // create_new honors umask; force the group bits back on.
            let perm = std::fs::Permissions::from_mode(mode);
            std::fs::set_permissions(path, perm).map_err(|e| ShrError::io(path, e))?;
        }
        let map = MmapRaw::map_raw(&file).map_err(|e| ShrError::io(path, e))?;
        Ok(CacheFile {
            path: path.to_owned(),
            file,
            map,
            len,
            readonly: false,
        })
    }

    /// Open and map an existing cache file.
    pub fn open(path: &Path, readonly: bool) -> Result<CacheFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(!readonly)
            .open(path)
            .map_err(|e| ShrError::io(path, e))?;
        let len = file
            .metadata()
            .map_err(|e| ShrError::io(path, e))?
            .len() as usize;
        let map = if readonly {
            // A read-only description cannot be mapped writable; keep the
            // raw view but back it with a PROT_READ mapping.
            MmapRaw::from(unsafe { memmap2::Mmap::map(&file) }.map_err(|e| ShrError::io(path, e))?)
        } else {
            MmapRaw::map_raw(&file).map_err(|e| ShrError::io(path, e))?
        };
        Ok(CacheFile {
            path: path.to_owned(),
            file,
            map,
            len,
            readonly,
        })
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Take a cross-process record lock on one byte of this file.
    /// Blocks until granted.
    pub fn lock_record(&self, byte: u64, exclusive: bool) -> Result<()> {
        self.fcntl_lock(byte, exclusive, true).map(|granted| {
            debug_assert!(granted);
        })
    }

    /// Non-blocking variant; returns false when a peer holds a conflicting
    /// lock.
    pub fn try_lock_record(&self, byte: u64, exclusive: bool) -> Result<bool> {
        self.fcntl_lock(byte, exclusive, false)
    }

    pub fn unlock_record(&self, byte: u64) -> Result<()> {
        let lk = libc::flock {
            l_type: libc::F_UNLCK as libc::c_short,
            l_whence: libc::SEEK_SET as libc::c_short,
            l_start: byte as libc::off_t,
            l_len: 1,
            l_pid: 0,
        };
        // SAFETY: fd is owned by self.file, lk fully initialized.
        let rc = unsafe { libc::fcntl(self.file.as_raw_fd(), libc::F_OFD_SETLK, &lk) };
        if rc == -1 {
            return Err(ShrError::io(&self.path, std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn fcntl_lock(&self, byte: u64, exclusive: bool, blocking: bool) -> Result<bool> {
        let l_type = if exclusive { libc::F_WRLCK } else { libc::F_RDLCK };
        let lk = libc::flock {
            l_type: l_type as libc::c_short,
            l_whence: libc::SEEK_SET as libc::c_short,
            l_start: byte as libc::off_t,
            l_len: 1,
            l_pid: 0,
        };
        let cmd = if blocking { libc::F_OFD_SETLKW } else { libc::F_OFD_SETLK };
        // SAFETY: fd is owned by self.file, lk fully initialized.
        let rc = unsafe { libc::fcntl(self.file.as_raw_fd(), cmd, &lk) };
        if rc == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EACCES) | Some(libc::EAGAIN) if !blocking => Ok(false),
            _ => Err(ShrError::io(&self.path, err)),
        }
    }

    /// Flush the mapped bytes back to the file.
    pub fn sync(&self) -> Result<()> {
        self.map.flush().map_err(|e| ShrError::io(&self.path, e))
    }

    /// Delete the backing file. The mapping stays valid until drop.
    pub fn delete(&self) -> Result<()> {
        std::fs::remove_file(&self.path).map_err(|e| ShrError::io(&self.path, e))
    }
}

/// Last-modified time of `path` in milliseconds since the epoch, or -1 if
/// the file does not exist.
pub fn last_modified(path: &Path) -> i64 {
    let Ok(meta) = std::fs::metadata(path) else {
        return -1;
    };
    let Ok(mtime) = meta.modified() else {
        return -1;
    };
    match mtime.duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(_) => -1,
    }
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn current_time_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// True if a process with this pid exists (signal 0 probe).
pub fn process_alive(pid: u32) -> bool {
    // SAFETY: kill with signal 0 only checks for existence.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM means it exists but is not ours.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_open_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.shc");
        let f = CacheFile::create(&path, 8192, false).unwrap();
        assert_eq!(f.len(), 8192);
        // Write through the mapping, read back through a fresh open.
        unsafe {
            *f.base().add(100) = 0xAB;
        }
        f.sync().unwrap();
        drop(f);

        let f2 = CacheFile::open(&path, true).unwrap();
        assert_eq!(unsafe { *f2.base().add(100) }, 0xAB);
    }

    #[test]
    fn test_create_refuses_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.shc");
        CacheFile::create(&path, 4096, false).unwrap();
        assert!(CacheFile::create(&path, 4096, false).is_err());
    }

    #[test]
    fn test_record_locks_conflict_across_descriptions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.shc");
        let a = CacheFile::create(&path, 4096, false).unwrap();
        let b = CacheFile::open(&path, false).unwrap();

        a.lock_record(0, true).unwrap();
        // OFD locks conflict between open file descriptions.
        assert!(!b.try_lock_record(0, true).unwrap());
        // A different byte is an independent region.
        assert!(b.try_lock_record(1, true).unwrap());
        b.unlock_record(1).unwrap();
        a.unlock_record(0).unwrap();
        assert!(b.try_lock_record(0, true).unwrap());
    }

    #[test]
    fn test_shared_locks_coexist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.shc");
        let a = CacheFile::create(&path, 4096, false).unwrap();
        let b = CacheFile::open(&path, false).unwrap();

        a.lock_record(1, false).unwrap();
        assert!(b.try_lock_record(1, false).unwrap());
        // Exclusive now blocks.
        let c = CacheFile::open(&path, false).unwrap();
        assert!(!c.try_lock_record(1, true).unwrap());
    }
}
