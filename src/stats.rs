//! Cache statistics: in-process counters and the flat javacore data
//! structure reported to diagnostics.
//!
//! Counters use `Relaxed` ordering; they are observational only. The lock
//! protocol provides the ordering guarantees for correctness.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::composite::CompositeCache;
use crate::item::{ItemType, item_extent};

/// Per-process counters owned by the cache map (no global singleton).
#[derive(Debug, Default)]
pub struct CacheCounters {
    /// Bytes of ROM class data handed to callers by finds.
    pub bytes_read: AtomicU64,
    pub find_hits: AtomicU64,
    pub find_misses: AtomicU64,
    pub stores: AtomicU64,
    /// Bytes refused because the soft max was reached.
    pub softmx_unstored_bytes: AtomicU64,
    /// Bytes refused by the AOT ceiling.
    pub max_aot_unstored_bytes: AtomicU64,
    /// Bytes refused by the JIT ceiling.
    pub max_jit_unstored_bytes: AtomicU64,
}

impl CacheCounters {
    pub fn new() -> CacheCounters {
        CacheCounters::default()
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Flat per-chain statistics, the shape javacore dumps want. Aggregated
/// over every attached layer plus the per-process counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JavacoreData {
    pub layer_count: u32,
    pub total_size: u64,
    pub free_bytes: u64,
    pub softmx: u64,
    pub min_aot: u32,
    pub max_aot: u32,
    pub min_jit: u32,
    pub max_jit: u32,
    pub aot_bytes: u64,
    pub jit_bytes: u64,

    pub rom_class_bytes: u64,
    pub rom_class_count: u64,
    pub orphan_count: u64,
    pub classpath_count: u64,
    pub scope_count: u64,
    pub byte_data_bytes: u64,
    pub byte_data_count: u64,
    pub compiled_method_bytes: u64,
    pub compiled_method_count: u64,
    pub invalidated_method_count: u64,
    pub attached_data_bytes: u64,
    pub attached_data_count: u64,
    pub metadata_bytes: u64,

    pub stale_bytes: u64,
    pub stale_count: u64,
    pub percent_full: u32,
    pub percent_stale: u32,

    pub bytes_read: u64,
    pub softmx_unstored_bytes: u64,
    pub max_aot_unstored_bytes: u64,
    pub max_jit_unstored_bytes: u64,
}

/// Accumulate one layer's on-disk state into `data` by walking its
/// committed metadata.
pub fn collect_layer(cc: &CompositeCache, data: &mut JavacoreData) {
    let header = cc.header();
    data.layer_count += 1;
    data.total_size += header.total_size as u64;
    data.free_bytes += cc.free_block_bytes() as u64;
    data.softmx += cc.softmx() as u64;
    data.min_aot = data.min_aot.max(header.min_aot);
    data.max_aot = data.max_aot.max(header.max_aot);
    data.min_jit = data.min_jit.max(header.min_jit);
    data.max_jit = data.max_jit.max(header.max_jit);
    data.aot_bytes += cc.aot_bytes() as u64;
    data.jit_bytes += cc.jit_bytes() as u64;
    data.metadata_bytes += (cc.metadata_top() - cc.meta_ptr()) as u64;
    data.rom_class_bytes += (cc.seg_ptr() - cc.segment_base()) as u64;

    for item in cc.walk(None) {
        let hdr = cc.item_header(item);
        let extent = item_extent(hdr.data_len) as u64;
        let stale = cc.is_stale(item);
        if stale {
            data.stale_bytes += extent;
            data.stale_count += 1;
        }
        match ItemType::from_raw(hdr.item_type) {
            Some(ItemType::RomClass) | Some(ItemType::ScopedRomClass) => {
                data.rom_class_count += 1;
            }
            Some(ItemType::Orphan) => data.orphan_count += 1,
            Some(ItemType::Classpath) => data.classpath_count += 1,
            Some(ItemType::Scope) | Some(ItemType::PrereqCache) => data.scope_count += 1,
            Some(ItemType::ByteData) | Some(ItemType::UnindexedByteData) => {
                data.byte_data_count += 1;
                data.byte_data_bytes += extent;
            }
            Some(ItemType::CompiledMethod) => {
                data.compiled_method_count += 1;
                data.compiled_method_bytes += extent;
            }
            Some(ItemType::InvalidatedCompiledMethod) => {
                data.invalidated_method_count += 1;
                data.compiled_method_bytes += extent;
            }
            Some(ItemType::AttachedData) => {
                data.attached_data_count += 1;
                data.attached_data_bytes += extent;
            }
            Some(ItemType::Cachelet) | None => {}
        }
    }
}

/// Derive the percentage fields once every layer is accumulated.
pub fn finish(data: &mut JavacoreData, counters: &CacheCounters) {
    if data.total_size > 0 {
        let used = data.total_size - data.free_bytes;
        data.percent_full = ((used * 100) / data.total_size) as u32;
        if used > 0 {
            data.percent_stale = ((data.stale_bytes * 100) / used) as u32;
        }
    }
    data.bytes_read = CacheCounters::get(&counters.bytes_read);
    data.softmx_unstored_bytes = CacheCounters::get(&counters.softmx_unstored_bytes);
    data.max_aot_unstored_bytes = CacheCounters::get(&counters.max_aot_unstored_bytes);
    data.max_jit_unstored_bytes = CacheCounters::get(&counters.max_jit_unstored_bytes);
}
