//! Timestamp manager: compares on-disk modification times of classpath
//! entries against the values recorded in the cache.
//!
//! Stateless. Directory entries are stamped per class (the specific
//! `.class` file under the directory); archive entries are stamped once for
//! the archive itself.

use std::path::{Path, PathBuf};

use log::trace;

use crate::classpath::{ClasspathEntry, Protocol};
use crate::platform::last_modified;

/// Outcome of a timestamp probe against a recorded value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimestampResult {
    /// On-disk mtime equals the recorded value.
    Unchanged,
    /// The path existed when recorded and is now gone.
    Disappeared,
    /// The path did not exist when recorded and still does not.
    DoesNotExist,
    /// The mtime moved; carries the new value.
    Changed(i64),
}

impl TimestampResult {
    pub fn is_stale(&self) -> bool {
        matches!(self, TimestampResult::Disappeared | TimestampResult::Changed(_))
    }
}

/// Compare `recorded` against the current mtime of `path`.
fn check(path: &Path, recorded: i64) -> TimestampResult {
    let current = last_modified(path);
    trace!("timestamp probe {}: recorded {recorded}, current {current}", path.display());
    if current == -1 {
        if recorded == -1 {
            TimestampResult::DoesNotExist
        } else {
            TimestampResult::Disappeared
        }
    } else if current == recorded {
        TimestampResult::Unchanged
    } else {
        TimestampResult::Changed(current)
    }
}

/// Probe a classpath entry: archives are stamped as a whole.
pub fn check_entry(entry: &ClasspathEntry) -> TimestampResult {
    check(Path::new(&entry.path), entry.timestamp)
}

/// Probe the class file behind a directory entry. For archive entries this
/// falls back to the archive stamp; `recorded` is the per-class timestamp a
/// ROM class wrapper carries for directory loads.
pub fn check_class(entry: &ClasspathEntry, class_name: &str, recorded: i64) -> TimestampResult {
    match entry.protocol {
        Protocol::Dir => check(&class_file_path(&entry.path, class_name), recorded),
        Protocol::Jar | Protocol::Token => check_entry(entry),
    }
}

/// `pkg/Foo` under `/dir` is `/dir/pkg/Foo.class`.
pub fn class_file_path(dir: &str, class_name: &str) -> PathBuf {
    let mut p = PathBuf::from(dir);
    for part in class_name.split('/') {
        p.push(part);
    }
    p.set_extension("class");
    p
}
