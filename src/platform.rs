//! OS platform layer: file mapping, cross-process record locks, file
//! timestamps and process liveness probes.
//!
//! Everything the cache map needs from the operating system funnels through
//! here so the rest of the crate stays pointer-and-offset arithmetic only.
//! Only unix is implemented; the lock protocol relies on OFD record locks.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::*;
    } else {
        compile_error!("shrcache requires a unix platform (fcntl OFD record locks)");
    }
}

/// Byte offsets within the lock page used for the cross-process locks.
/// Distinct bytes so the write mutex and the read-write lock are
/// independent fcntl regions.
pub const LOCK_BYTE_WRITE: u64 = 0;
pub const LOCK_BYTE_READWRITE: u64 = 1;
pub const LOCK_BYTE_RW_AREA: u64 = 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_is_sane() {
        // Not before 2020, not absurdly far in the future.
        let now = current_time_millis();
        assert!(now > 1_577_836_800_000);
        assert!(now < 4_102_444_800_000);
    }

    #[test]
    fn test_self_is_alive() {
        assert!(process_alive(std::process::id()));
    }

    #[test]
    fn test_last_modified_missing_file() {
        assert_eq!(last_modified(std::path::Path::new("/nonexistent/xyzzy")), -1);
    }
}
