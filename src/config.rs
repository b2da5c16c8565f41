//! Cache geometry constants and runtime options.
//!
//! The on-disk format is fixed by these constants; changing any of them is a
//! format version bump. Runtime options carry the knobs the cache map honors
//! (the command-line parser that produces them lives outside this crate).

/// Alignment of every metadata item and every ROM class image, in bytes.
pub const ITEM_ALIGNMENT: usize = 8;

/// Size reserved for the cache header at the start of every layer file.
/// At least one OS page so the header can be page-protected independently.
pub const HEADER_SIZE: usize = 4096;

/// Default total size of a newly created layer.
pub const DEFAULT_CACHE_SIZE: u32 = 16 * 1024 * 1024;

/// Smallest layer size accepted at create time: header plus one page of
/// segment space and one item of metadata space.
pub const MIN_CACHE_SIZE: u32 = (HEADER_SIZE as u32) + 8192;

/// Maximum number of layers in a chain, including layer 0.
pub const MAX_LAYERS: usize = 8;

/// Number of JVM attach slots in the header.
pub const MAX_JVM_SLOTS: usize = 16;

/// Default size of the read-write area (string intern roots).
pub const DEFAULT_READWRITE_SIZE: u32 = 8192;

/// A lambda class name embeds a generated index; two layouts of the same
/// lambda may differ in total size by at most this many digit bytes and
/// still compare equal.
pub const LAMBDA_SIZE_TOLERANCE: usize = 9;

/// Sentinel for "no stale index" in a classpath wrapper.
pub const NOT_STALE: u32 = u32::MAX;

/// Verbose reporting flags. Gate extra info-level logging only; nothing
/// here changes cache behavior.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VerboseFlags {
    pub enabled: bool,
    pub io: bool,
    pub aot: bool,
    pub jit_data: bool,
}

/// Runtime options honored by the cache map.
///
/// `layer` selects which layer number the top cache is opened as; when
/// `create_layer` is set a fresh writable layer is created on top of the
/// existing chain.
#[derive(Clone, Debug)]
pub struct CacheOptions {
    pub cache_dir: std::path::PathBuf,
    pub cache_name: String,
    pub layer: u8,
    pub cache_size: u32,
    pub softmx: Option<u32>,
    pub min_aot: u32,
    pub max_aot: Option<u32>,
    pub min_jit: u32,
    pub max_jit: Option<u32>,
    pub readonly: bool,
    pub group_access: bool,
    pub create_layer: bool,
    /// Destroy and recreate on version/build-id mismatch.
    pub soft_reset: bool,
    /// Destroy and recreate only when the build id differs.
    pub autokill_diff_buildid: bool,
    pub timestamp_checks: bool,
    /// Retain raw class-file bytes for bytecode instrumentation agents.
    pub enable_bci: bool,
    pub verbose: VerboseFlags,
}

impl CacheOptions {
    pub fn new(cache_dir: impl Into<std::path::PathBuf>, cache_name: impl Into<String>) -> Self {
        CacheOptions {
            cache_dir: cache_dir.into(),
            cache_name: cache_name.into(),
            layer: 0,
            cache_size: DEFAULT_CACHE_SIZE,
            softmx: None,
            min_aot: 0,
            max_aot: None,
            min_jit: 0,
            max_jit: None,
            readonly: false,
            group_access: false,
            create_layer: false,
            soft_reset: false,
            autokill_diff_buildid: false,
            timestamp_checks: true,
            enable_bci: false,
            verbose: VerboseFlags::default(),
        }
    }

    /// File name of one layer of this cache.
    pub fn layer_file_name(&self, layer: u8) -> String {
        format!("{}_L{:02}.shc", self.cache_name, layer)
    }

    /// Full path of one layer of this cache.
    pub fn layer_path(&self, layer: u8) -> std::path::PathBuf {
        self.cache_dir.join(self.layer_file_name(layer))
    }
}
