//! Error vocabulary for the cache map.
//!
//! `ShrError` covers attach/IO/corruption failures that abort an operation.
//! `StoreError` is the narrower set a store operation reports to its caller;
//! all of those leave the cache usable. `BuildResult` is the exit code of the
//! ROM class build pipeline, piped through the enclosing runtime.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ShrError>;

#[derive(Debug, Error)]
pub enum ShrError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache is corrupt (code {code}, context {context:#x})")]
    Corrupt { code: CorruptionCode, context: u64 },

    #[error("cache version/feature mismatch: {0}")]
    Incompatible(String),

    #[error("prerequisite layer mismatch: expected id {expected:?}")]
    PrereqMismatch { expected: String },

    #[error("cache is read-only")]
    ReadOnly,

    #[error("out of memory sizing {0}")]
    OutOfMemory(&'static str),

    #[error("unsupported cache content: {0}")]
    Unsupported(&'static str),

    #[error("lock {name} unavailable: {detail}")]
    Contention { name: &'static str, detail: String },

    #[error("layer limit exceeded")]
    TooManyLayers,
}

impl ShrError {
    pub fn io(path: impl Into<std::path::PathBuf>, source: std::io::Error) -> Self {
        ShrError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Why a layer was declared corrupt. Stored in the header so later
/// attachers can report the first detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum CorruptionCode {
    None = 0,
    BadMagic = 1,
    BadItemType = 2,
    BadWalkStep = 3,
    SrpOutOfRange = 4,
    BoundsViolation = 5,
    AllocPointersCrossed = 6,
}

impl CorruptionCode {
    pub fn from_raw(raw: i32) -> CorruptionCode {
        match raw {
            1 => CorruptionCode::BadMagic,
            2 => CorruptionCode::BadItemType,
            3 => CorruptionCode::BadWalkStep,
            4 => CorruptionCode::SrpOutOfRange,
            5 => CorruptionCode::BoundsViolation,
            6 => CorruptionCode::AllocPointersCrossed,
            _ => CorruptionCode::None,
        }
    }
}

impl std::fmt::Display for CorruptionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Outcome of a store operation that could not place its record.
/// `Full`/`Exists`/`Invalidated` are normal protocol outcomes, not faults.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("cache full")]
    Full,
    #[error("record already exists")]
    Exists,
    #[error("matching record was invalidated")]
    Invalidated,
    #[error("store failed: {0}")]
    Error(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Exit code of the ROM class build pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum BuildResult {
    Ok = 0,
    OutOfMemory = 1,
    OutOfRom = 2,
    GenericError = 3,
}

impl BuildResult {
    /// Collapse a store outcome to the exit code the enclosing runtime
    /// reports. Duplicates are successes: the class is in the cache.
    pub fn of<T>(result: &StoreResult<T>) -> BuildResult {
        match result {
            Ok(_) => BuildResult::Ok,
            Err(StoreError::Exists) | Err(StoreError::Invalidated) => BuildResult::Ok,
            Err(StoreError::Full) => BuildResult::OutOfRom,
            Err(StoreError::Error(_)) => BuildResult::GenericError,
        }
    }
}
