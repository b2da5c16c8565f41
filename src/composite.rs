//! One cache layer: the mapped region, its header, the append-only write
//! protocol and the reverse metadata walker.
//!
//! Region layout (offsets from the start of the file):
//!
//! ```text
//! [ header | read-write area | segment area -> ... free ... <- metadata ]
//! ```
//!
//! The segment pointer bumps upward, the metadata pointer downward; the two
//! must never cross. Both move only at commit time, so a writer that dies
//! after allocating but before committing leaves nothing reachable: readers
//! walk metadata strictly above the committed pointer.
//!
//! Ordering: the update counter is bumped with a release store at commit;
//! readers load it with acquire before walking. Stale bits are single-byte
//! stores readable without synchronization.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use bytemuck::{Pod, Zeroable};
use log::{debug, error, warn};
use parking_lot::Mutex;
use static_assertions::const_assert_eq;

use crate::config::{HEADER_SIZE, MAX_JVM_SLOTS, MIN_CACHE_SIZE};
use crate::error::{CorruptionCode, Result, ShrError};
use crate::item::{self, ItemHeader, ItemRef, ItemType, item_extent};
use crate::platform::{
    CacheFile, LOCK_BYTE_READWRITE, LOCK_BYTE_WRITE, current_time_millis, process_alive,
};

pub const CACHE_MAGIC: u32 = 0x4A39_5343;
pub const CACHE_VERSION: u32 = 1;

/// Feature bits: pointer width in the low byte, endianness in bit 8.
pub fn feature_bits() -> u32 {
    let width = core::mem::size_of::<usize>() as u32;
    let endian = if cfg!(target_endian = "big") { 0x100 } else { 0 };
    width | endian
}

/// Build id distinguishing incompatible producers of the same version.
pub const BUILD_ID: u64 = 0x0001_0000_0000_0003;

// Cache-full flags. Monotonic within a layer's lifetime until shutdown.
pub const FLAG_BLOCK_FULL: u32 = 0x1;
pub const FLAG_AOT_FULL: u32 = 0x2;
pub const FLAG_JIT_FULL: u32 = 0x4;
pub const FLAG_AVAILABLE_FULL: u32 = 0x8;
pub const FLAG_READONLY: u32 = 0x10;

/// On-disk header at offset 0 of every layer. Field order keeps every u64
/// 8-aligned so the struct has no padding.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct CacheHeader {
    pub magic: u32,
    pub version: u32,
    pub features: u32,
    pub crash_counter: u32,
    pub build_id: u64,
    pub create_time: u64,
    pub update_counter: u64,
    pub total_size: u32,
    pub softmx: u32,
    pub seg_ptr: u32,
    pub meta_ptr: u32,
    pub readwrite_offset: u32,
    pub readwrite_size: u32,
    pub full_flags: u32,
    pub corruption_code: i32,
    pub corruption_context: u64,
    pub min_aot: u32,
    pub max_aot: u32,
    pub min_jit: u32,
    pub max_jit: u32,
    pub aot_bytes: u32,
    pub jit_bytes: u32,
    pub line_num_bytes: u32,
    pub var_info_bytes: u32,
    pub last_writer_slot: u32,
    pub layer: u32,
    pub jvm_slots: [u64; MAX_JVM_SLOTS],
}

const_assert_eq!(core::mem::size_of::<CacheHeader>(), 120 + MAX_JVM_SLOTS * 8);
const_assert_eq!(core::mem::size_of::<CacheHeader>() % 8, 0);

/// What an allocation request is charged against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocKind {
    Block,
    Aot,
    Jit,
}

/// Why an allocation could not be satisfied. Each failure sets the
/// corresponding full flag before it is returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocFailure {
    BlockFull,
    AotFull,
    JitFull,
    SoftMaxFull,
    ReadOnly,
}

/// A reserved (not yet committed) allocation: the item extent plus any
/// segment bytes. Nothing is visible to readers until [`CompositeCache::commit`].
#[derive(Clone, Copy, Debug)]
pub struct PendingAlloc {
    pub item: ItemRef,
    pub data_len: u32,
    pub item_type: ItemType,
    /// Offset of the reserved segment bytes, 0 when none were requested.
    pub segment_offset: u32,
    pub segment_len: u32,
    new_seg_ptr: u32,
    new_meta_ptr: u32,
}

/// Per-layer composite cache.
pub struct CompositeCache {
    file: CacheFile,
    layer: u32,
    /// In-process serialization in front of the OS write mutex; OFD locks
    /// do not exclude two threads of the same process.
    write_mutex: Mutex<()>,
    has_write_mutex: AtomicBool,
    /// This process's attach slot (slot index + 1; 0 before attach).
    jvm_slot: AtomicU32,
    /// Snapshot of the header update counter at the last local refresh.
    local_update_count: AtomicU64,
    /// Snapshot of the metadata pointer at the last local refresh; the
    /// refresh walk covers (meta_ptr, prev_meta_ptr].
    prev_meta_ptr: AtomicU32,
    /// Snapshot of the crash counter to detect interrupted writers.
    local_crash_count: AtomicU32,
    /// Corruption detected by this process. Mirrors the header fields,
    /// which a read-only mapping cannot record.
    local_corrupt_code: AtomicU32,
    local_corrupt_context: AtomicU64,
}

impl CompositeCache {
    /// Create a fresh layer file and initialize its header.
    pub fn create(
        path: &Path,
        layer: u32,
        total_size: u32,
        softmx: Option<u32>,
        readwrite_size: u32,
        min_aot: u32,
        max_aot: Option<u32>,
        min_jit: u32,
        max_jit: Option<u32>,
        group_access: bool,
    ) -> Result<CompositeCache> {
        if total_size < MIN_CACHE_SIZE || (readwrite_size as usize) >= total_size as usize / 2 {
            return Err(ShrError::Incompatible(format!(
                "cache size {total_size} unusable"
            )));
        }
        let file = CacheFile::create(path, total_size as usize, group_access)?;
        let rw_offset = HEADER_SIZE as u32;
        let seg_base = rw_offset + readwrite_size;
        let header = CacheHeader {
            magic: CACHE_MAGIC,
            version: CACHE_VERSION,
            features: feature_bits(),
            crash_counter: 0,
            build_id: BUILD_ID,
            create_time: current_time_millis(),
            update_counter: 0,
            total_size,
            softmx: softmx.unwrap_or(total_size),
            seg_ptr: seg_base,
            meta_ptr: total_size,
            readwrite_offset: rw_offset,
            readwrite_size,
            full_flags: 0,
            corruption_code: CorruptionCode::None as i32,
            corruption_context: 0,
            min_aot,
            max_aot: max_aot.unwrap_or(0),
            min_jit,
            max_jit: max_jit.unwrap_or(0),
            aot_bytes: 0,
            jit_bytes: 0,
            line_num_bytes: 0,
            var_info_bytes: 0,
            last_writer_slot: 0,
            layer,
            jvm_slots: [0; MAX_JVM_SLOTS],
        };
        // SAFETY: the mapping is at least HEADER_SIZE bytes and page aligned.
        unsafe {
            core::ptr::write(file.base() as *mut CacheHeader, header);
        }
        file.sync()?;
        debug!("created cache layer {layer} at {} ({total_size} bytes)", path.display());
        let cc = CompositeCache {
            file,
            layer,
            write_mutex: Mutex::new(()),
            has_write_mutex: AtomicBool::new(false),
            jvm_slot: AtomicU32::new(0),
            local_update_count: AtomicU64::new(0),
            prev_meta_ptr: AtomicU32::new(total_size),
            local_crash_count: AtomicU32::new(0),
            local_corrupt_code: AtomicU32::new(0),
            local_corrupt_context: AtomicU64::new(0),
        };
        Ok(cc)
    }

    /// Open and validate an existing layer file.
    pub fn open(path: &Path, expected_layer: u32, readonly: bool) -> Result<CompositeCache> {
        let file = CacheFile::open(path, readonly)?;
        if file.len() < HEADER_SIZE {
            return Err(ShrError::Incompatible("file smaller than header".into()));
        }
        // SAFETY: length checked above.
        let header: CacheHeader =
            unsafe { core::ptr::read(file.base() as *const CacheHeader) };
        if header.magic != CACHE_MAGIC {
            return Err(ShrError::Corrupt {
                code: CorruptionCode::BadMagic,
                context: header.magic as u64,
            });
        }
        if header.version != CACHE_VERSION {
            return Err(ShrError::Incompatible(format!(
                "version {} (expected {})",
                header.version, CACHE_VERSION
            )));
        }
        if header.features != feature_bits() {
            return Err(ShrError::Incompatible(format!(
                "feature bits {:#x} (expected {:#x})",
                header.features,
                feature_bits()
            )));
        }
        if header.build_id != BUILD_ID {
            return Err(ShrError::Incompatible(format!(
                "build id {:#x} (expected {:#x})",
                header.build_id, BUILD_ID
            )));
        }
        if header.layer != expected_layer {
            return Err(ShrError::Incompatible(format!(
                "layer {} (expected {expected_layer})",
                header.layer
            )));
        }
        if header.total_size as usize != file.len() || header.seg_ptr > header.meta_ptr {
            return Err(ShrError::Corrupt {
                code: CorruptionCode::AllocPointersCrossed,
                context: ((header.seg_ptr as u64) << 32) | header.meta_ptr as u64,
            });
        }
        if header.corruption_code != CorruptionCode::None as i32 {
            return Err(ShrError::Corrupt {
                code: CorruptionCode::from_raw(header.corruption_code),
                context: header.corruption_context,
            });
        }
        let cc = CompositeCache {
            file,
            layer: expected_layer,
            write_mutex: Mutex::new(()),
            has_write_mutex: AtomicBool::new(false),
            jvm_slot: AtomicU32::new(0),
            local_update_count: AtomicU64::new(0),
            prev_meta_ptr: AtomicU32::new(header.total_size),
            local_crash_count: AtomicU32::new(header.crash_counter),
            local_corrupt_code: AtomicU32::new(0),
            local_corrupt_context: AtomicU64::new(0),
        };
        Ok(cc)
    }

    // ---- raw header access ----

    #[inline]
    fn header_field<T>(&self, offset: usize) -> *mut T {
        debug_assert!(offset + core::mem::size_of::<T>() <= HEADER_SIZE);
        // SAFETY: offset is within the always-mapped header page.
        unsafe { self.file.base().add(offset) as *mut T }
    }

    #[inline]
    fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        // SAFETY: header fields are 4-aligned; the mapping outlives self.
        unsafe { &*(self.header_field::<u32>(offset) as *const AtomicU32) }
    }

    #[inline]
    fn atomic_u64(&self, offset: usize) -> &AtomicU64 {
        // SAFETY: header fields are 8-aligned; the mapping outlives self.
        unsafe { &*(self.header_field::<u64>(offset) as *const AtomicU64) }
    }

    /// Copy of the header. Mutable shared fields in the copy are only
    /// advisory; use the atomic accessors for decisions.
    pub fn header(&self) -> CacheHeader {
        // SAFETY: header page is always mapped.
        unsafe { core::ptr::read_volatile(self.file.base() as *const CacheHeader) }
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.file.base()
    }

    pub fn len(&self) -> usize {
        self.file.len()
    }

    pub fn layer(&self) -> u32 {
        self.layer
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn is_readonly(&self) -> bool {
        self.file.is_readonly()
    }

    pub fn segment_base(&self) -> u32 {
        let h = self.header();
        h.readwrite_offset + h.readwrite_size
    }

    pub fn metadata_top(&self) -> u32 {
        self.header().total_size
    }

    #[inline]
    pub fn seg_ptr(&self) -> u32 {
        self.atomic_u32(core::mem::offset_of!(CacheHeader, seg_ptr)).load(Ordering::Acquire)
    }

    #[inline]
    pub fn meta_ptr(&self) -> u32 {
        self.atomic_u32(core::mem::offset_of!(CacheHeader, meta_ptr)).load(Ordering::Acquire)
    }

    /// Acquire-load of the update counter. A reader that observed value `v`
    /// here sees every write committed at counter <= `v`.
    #[inline]
    pub fn read_update_count(&self) -> u64 {
        self.atomic_u64(core::mem::offset_of!(CacheHeader, update_counter)).load(Ordering::Acquire)
    }

    pub fn crash_count(&self) -> u32 {
        self.atomic_u32(core::mem::offset_of!(CacheHeader, crash_counter)).load(Ordering::Acquire)
    }

    pub fn full_flags(&self) -> u32 {
        self.atomic_u32(core::mem::offset_of!(CacheHeader, full_flags)).load(Ordering::Acquire)
    }

    pub fn set_full_flag(&self, flag: u32) {
        let prev = self
            .atomic_u32(core::mem::offset_of!(CacheHeader, full_flags))
            .fetch_or(flag, Ordering::AcqRel);
        if prev & flag == 0 {
            warn!("cache layer {} full flag {:#x} set", self.layer, flag);
        }
    }

    /// Full flags are cleared only at orderly shutdown of the layer.
    pub fn reset_full_flags(&self) {
        self.atomic_u32(core::mem::offset_of!(CacheHeader, full_flags)).store(0, Ordering::Release);
    }

    pub fn softmx(&self) -> u32 {
        self.atomic_u32(core::mem::offset_of!(CacheHeader, softmx)).load(Ordering::Acquire)
    }

    pub fn set_softmx(&self, value: u32) {
        self.atomic_u32(core::mem::offset_of!(CacheHeader, softmx)).store(value, Ordering::Release);
    }

    pub fn is_corrupt(&self) -> bool {
        self.local_corrupt_code.load(Ordering::Acquire) != 0
            || self
                .atomic_u32(core::mem::offset_of!(CacheHeader, corruption_code) as usize)
                .load(Ordering::Acquire)
                != 0
    }

    /// First-detection code and context, from the header when it was
    /// recorded there, otherwise from this process's local record.
    pub fn corruption_info(&self) -> (CorruptionCode, u64) {
        let header_code = self
            .atomic_u32(core::mem::offset_of!(CacheHeader, corruption_code) as usize)
            .load(Ordering::Acquire) as i32;
        if header_code != 0 {
            let context = self
                .atomic_u64(core::mem::offset_of!(CacheHeader, corruption_context))
                .load(Ordering::Acquire);
            return (CorruptionCode::from_raw(header_code), context);
        }
        (
            CorruptionCode::from_raw(self.local_corrupt_code.load(Ordering::Acquire) as i32),
            self.local_corrupt_context.load(Ordering::Acquire),
        )
    }

    /// Record first-detection corruption and refuse further access. A
    /// read-only mapping keeps the record process-local; the header is
    /// only written through writable attachments.
    pub fn set_corrupt(&self, code: CorruptionCode, context: u64) {
        error!(
            "cache layer {} corrupt: {code} (context {context:#x})",
            self.layer
        );
        self.local_corrupt_context.store(context, Ordering::Release);
        self.local_corrupt_code.store(code as i32 as u32, Ordering::Release);
        if !self.is_readonly() {
            self.atomic_u64(core::mem::offset_of!(CacheHeader, corruption_context))
                .store(context, Ordering::Release);
            self.atomic_u32(core::mem::offset_of!(CacheHeader, corruption_code) as usize)
                .store(code as i32 as u32, Ordering::Release);
        }
    }

    pub fn free_block_bytes(&self) -> u32 {
        self.meta_ptr().saturating_sub(self.seg_ptr())
    }

    pub fn used_bytes(&self) -> u32 {
        self.header().total_size - self.free_block_bytes()
    }

    pub fn aot_bytes(&self) -> u32 {
        self.atomic_u32(core::mem::offset_of!(CacheHeader, aot_bytes)).load(Ordering::Acquire)
    }

    pub fn jit_bytes(&self) -> u32 {
        self.atomic_u32(core::mem::offset_of!(CacheHeader, jit_bytes)).load(Ordering::Acquire)
    }

    pub fn add_debug_bytes(&self, line_num: u32, var_info: u32) {
        self.atomic_u32(core::mem::offset_of!(CacheHeader, line_num_bytes))
            .fetch_add(line_num, Ordering::AcqRel);
        self.atomic_u32(core::mem::offset_of!(CacheHeader, var_info_bytes))
            .fetch_add(var_info, Ordering::AcqRel);
    }

    // ---- JVM attach slots ----

    /// Claim an attach slot in the header, reclaiming slots left by dead
    /// processes. The returned id (slot + 1) tags items this JVM writes.
    pub fn attach_jvm(&self) -> Result<u16> {
        let pid = std::process::id() as u64;
        let nonce = current_time_millis() & 0xffff_ffff;
        let token = (pid << 32) | nonce;
        for slot in 0..MAX_JVM_SLOTS {
            let cell = self.atomic_u64(
                core::mem::offset_of!(CacheHeader, jvm_slots) + slot * 8,
            );
            let mut cur = cell.load(Ordering::Acquire);
            if cur != 0 && !process_alive((cur >> 32) as u32) {
                // Dead owner; eligible for reclaim.
                if cell.compare_exchange(cur, 0, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                    cur = 0;
                } else {
                    continue;
                }
            }
            if cur == 0
                && cell.compare_exchange(0, token, Ordering::AcqRel, Ordering::Acquire).is_ok()
            {
                self.jvm_slot.store(slot as u32 + 1, Ordering::Release);
                return Ok(slot as u16 + 1);
            }
        }
        Err(ShrError::Contention {
            name: "jvm slots",
            detail: "all attach slots in use".into(),
        })
    }

    pub fn detach_jvm(&self) {
        let slot = self.jvm_slot.swap(0, Ordering::AcqRel);
        if slot != 0 {
            self.atomic_u64(core::mem::offset_of!(CacheHeader, jvm_slots) + (slot as usize - 1) * 8)
                .store(0, Ordering::Release);
        }
    }

    pub fn jvm_id(&self) -> u16 {
        self.jvm_slot.load(Ordering::Acquire) as u16
    }

    // ---- cross-process write mutex ----

    /// Enter the layer's write mutex: in-process lock, then the OS record
    /// lock. Returns whether an interrupted writer was detected; the caller
    /// owns the index rebuild.
    pub fn enter_write_mutex(&self) -> Result<bool> {
        if self.is_readonly() {
            return Err(ShrError::ReadOnly);
        }
        core::mem::forget(self.write_mutex.lock());
        if let Err(e) = self.file.lock_record(LOCK_BYTE_WRITE, true) {
            // SAFETY: we just forgot the guard; the mutex is locked by us.
            unsafe { self.write_mutex.force_unlock() };
            return Err(e);
        }
        self.has_write_mutex.store(true, Ordering::Release);

        // Interrupted-writer check: the last writer published its slot and
        // never cleared it. A live process mid-write is impossible here
        // because we hold the write mutex.
        let lw = self.atomic_u32(core::mem::offset_of!(CacheHeader, last_writer_slot));
        let crashed = lw.load(Ordering::Acquire) != 0;
        if crashed {
            warn!("cache layer {}: interrupted writer detected", self.layer);
            self.atomic_u32(core::mem::offset_of!(CacheHeader, crash_counter))
                .fetch_add(1, Ordering::AcqRel);
        }
        lw.store(self.jvm_slot.load(Ordering::Acquire), Ordering::Release);
        Ok(crashed)
    }

    pub fn exit_write_mutex(&self) -> Result<()> {
        self.atomic_u32(core::mem::offset_of!(CacheHeader, last_writer_slot))
            .store(0, Ordering::Release);
        self.has_write_mutex.store(false, Ordering::Release);
        let rc = self.file.unlock_record(LOCK_BYTE_WRITE);
        // SAFETY: enter_write_mutex forgot the guard for this lock.
        unsafe { self.write_mutex.force_unlock() };
        rc
    }

    pub fn has_write_mutex(&self) -> bool {
        self.has_write_mutex.load(Ordering::Acquire)
    }

    /// Shared lock held while walking metadata.
    pub fn enter_read_lock(&self) -> Result<()> {
        self.file.lock_record(LOCK_BYTE_READWRITE, false)
    }

    pub fn exit_read_lock(&self) -> Result<()> {
        self.file.unlock_record(LOCK_BYTE_READWRITE)
    }

    /// Drain readers: exclusive lock on the read byte. Used by stale
    /// marking so no reader observes a half-marked batch.
    pub fn lock_cache(&self) -> Result<()> {
        self.file.lock_record(LOCK_BYTE_READWRITE, true)
    }

    pub fn unlock_cache(&self) -> Result<()> {
        self.file.unlock_record(LOCK_BYTE_READWRITE)
    }

    // ---- allocation / commit ----

    /// Reserve one metadata item (plus optional segment bytes) without
    /// making anything visible. Caller must hold the write mutex.
    ///
    /// Reserved AOT/JIT headroom (`min_aot`/`min_jit`) is honored: block
    /// allocations cannot eat into unspent reservations, and AOT/JIT
    /// allocations are capped by `max_aot`/`max_jit` when set.
    pub fn allocate(
        &self,
        item_type: ItemType,
        data_len: u32,
        segment_len: u32,
        kind: AllocKind,
    ) -> std::result::Result<PendingAlloc, AllocFailure> {
        debug_assert!(self.has_write_mutex());
        if self.is_readonly() || self.full_flags() & FLAG_READONLY != 0 {
            return Err(AllocFailure::ReadOnly);
        }
        let h = self.header();
        let extent = item_extent(data_len) as u32;
        let seg_aligned = (segment_len + 7) & !7;
        let needed = extent as u64 + seg_aligned as u64;

        let free = self.free_block_bytes() as u64;
        let reserve = |min: u32, used: u32| min.saturating_sub(used) as u64;
        let headroom = match kind {
            AllocKind::Block => reserve(h.min_aot, self.aot_bytes()) + reserve(h.min_jit, self.jit_bytes()),
            AllocKind::Aot => reserve(h.min_jit, self.jit_bytes()),
            AllocKind::Jit => reserve(h.min_aot, self.aot_bytes()),
        };
        if needed + headroom > free {
            let failure = match kind {
                AllocKind::Block => {
                    self.set_full_flag(FLAG_BLOCK_FULL);
                    AllocFailure::BlockFull
                }
                AllocKind::Aot => {
                    self.set_full_flag(FLAG_AOT_FULL);
                    AllocFailure::AotFull
                }
                AllocKind::Jit => {
                    self.set_full_flag(FLAG_JIT_FULL);
                    AllocFailure::JitFull
                }
            };
            return Err(failure);
        }
        // Soft max: never invalidates the cache, only refuses growth.
        let softmx = self.softmx() as u64;
        if (self.used_bytes() as u64) + needed > softmx {
            self.set_full_flag(FLAG_AVAILABLE_FULL);
            return Err(AllocFailure::SoftMaxFull);
        }
        match kind {
            AllocKind::Aot if h.max_aot != 0 => {
                if self.aot_bytes() as u64 + needed > h.max_aot as u64 {
                    self.set_full_flag(FLAG_AOT_FULL);
                    return Err(AllocFailure::AotFull);
                }
            }
            AllocKind::Jit if h.max_jit != 0 => {
                if self.jit_bytes() as u64 + needed > h.max_jit as u64 {
                    self.set_full_flag(FLAG_JIT_FULL);
                    return Err(AllocFailure::JitFull);
                }
            }
            _ => {}
        }

        let seg_ptr = self.seg_ptr();
        let meta_ptr = self.meta_ptr();
        let new_meta_ptr = meta_ptr - extent;
        let segment_offset = if seg_aligned > 0 { seg_ptr } else { 0 };
        let new_seg_ptr = seg_ptr + seg_aligned;
        Ok(PendingAlloc {
            item: ItemRef { layer: self.layer, start: new_meta_ptr },
            data_len,
            item_type,
            segment_offset,
            segment_len: seg_aligned,
            new_seg_ptr,
            new_meta_ptr,
        })
    }

    /// Writable view of a pending allocation's payload bytes.
    ///
    /// # Safety
    /// `pending` must have come from [`allocate`] on this cache with the
    /// write mutex still held, and must not have been committed.
    pub unsafe fn pending_data(&self, pending: &PendingAlloc) -> &mut [u8] {
        unsafe {
            core::slice::from_raw_parts_mut(
                self.base().add(pending.item.data_offset() as usize),
                pending.data_len as usize,
            )
        }
    }

    /// Writable view of a pending allocation's segment bytes.
    ///
    /// # Safety
    /// As [`pending_data`]; the allocation must carry segment bytes.
    pub unsafe fn pending_segment(&self, pending: &PendingAlloc) -> &mut [u8] {
        debug_assert!(pending.segment_len > 0);
        unsafe {
            core::slice::from_raw_parts_mut(
                self.base().add(pending.segment_offset as usize),
                pending.segment_len as usize,
            )
        }
    }

    /// Publish a pending allocation: write the item frame, move both bump
    /// pointers, then release-bump the update counter. After this returns
    /// the item is visible to any reader that acquires the counter.
    ///
    /// `final_segment_len` lets the caller shrink the segment reservation
    /// to the bytes actually used (or keep it over-reported for
    /// segment-exclusive anonymous classes).
    pub fn commit(&self, pending: PendingAlloc, final_segment_len: Option<u32>) {
        debug_assert!(self.has_write_mutex());
        let extent = item_extent(pending.data_len) as u32;
        let start = pending.item.start as usize;
        let hdr = ItemHeader {
            data_len: pending.data_len,
            item_type: pending.item_type as u16,
            jvm_id: self.jvm_id(),
        };
        // SAFETY: the extent was reserved inside the mapping by allocate().
        unsafe {
            core::ptr::write_unaligned(self.base().add(start) as *mut ItemHeader, hdr);
            // Zero the pad gap then write the trailer length.
            let data_end = start + item::ITEM_HEADER_SIZE + pending.data_len as usize;
            let trailer_at = start + extent as usize - item::ITEM_TRAILER_SIZE;
            core::ptr::write_bytes(self.base().add(data_end), 0, trailer_at - data_end);
            core::ptr::write_unaligned(self.base().add(trailer_at) as *mut u32, extent);
        }

        let new_seg_ptr = match final_segment_len {
            Some(n) => {
                let used = (n + 7) & !7;
                debug_assert!(used <= pending.segment_len);
                pending.segment_offset + used
            }
            None => pending.new_seg_ptr,
        };
        self.atomic_u32(core::mem::offset_of!(CacheHeader, seg_ptr))
            .store(new_seg_ptr, Ordering::Release);
        self.atomic_u32(core::mem::offset_of!(CacheHeader, meta_ptr))
            .store(pending.new_meta_ptr, Ordering::Release);
        self.atomic_u64(core::mem::offset_of!(CacheHeader, update_counter))
            .fetch_add(1, Ordering::Release);
    }

    /// Account committed AOT/JIT bytes (charged against the reservations).
    pub fn add_typed_bytes(&self, kind: AllocKind, bytes: u32) {
        match kind {
            AllocKind::Aot => {
                self.atomic_u32(core::mem::offset_of!(CacheHeader, aot_bytes))
                    .fetch_add(bytes, Ordering::AcqRel);
            }
            AllocKind::Jit => {
                self.atomic_u32(core::mem::offset_of!(CacheHeader, jit_bytes))
                    .fetch_add(bytes, Ordering::AcqRel);
            }
            AllocKind::Block => {}
        }
    }

    /// Bump the update counter without new items (stale-mark batches).
    pub fn bump_update_count(&self) {
        debug_assert!(self.has_write_mutex());
        self.atomic_u64(core::mem::offset_of!(CacheHeader, update_counter))
            .fetch_add(1, Ordering::Release);
    }

    // ---- refresh bookkeeping ----

    /// True when peers have committed items this process has not replayed.
    pub fn updates_pending(&self) -> bool {
        self.read_update_count() != self.local_update_count.load(Ordering::Acquire)
    }

    /// Snapshot the counters after a replay; returns the metadata window
    /// (new_meta_ptr, prev_meta_ptr] that was just consumed.
    pub fn take_refresh_snapshot(&self) -> (u32, u32) {
        let new_meta = self.meta_ptr();
        let prev = self.prev_meta_ptr.swap(new_meta, Ordering::AcqRel);
        self.local_update_count.store(self.read_update_count(), Ordering::Release);
        (new_meta, prev)
    }

    /// Crash counter delta since this process last looked.
    pub fn crash_detected(&self) -> bool {
        self.crash_count() != self.local_crash_count.load(Ordering::Acquire)
    }

    pub fn acknowledge_crash(&self) {
        self.local_crash_count.store(self.crash_count(), Ordering::Release);
        // Force the next refresh to replay the full metadata area.
        self.prev_meta_ptr.store(self.metadata_top(), Ordering::Release);
        self.local_update_count.store(0, Ordering::Release);
    }

    // ---- item access ----

    pub fn item_header(&self, item: ItemRef) -> ItemHeader {
        debug_assert_eq!(item.layer, self.layer);
        // SAFETY: ItemRefs are only minted by the walker or allocate().
        unsafe { item::read_header(self.base().add(item.start as usize)) }
    }

    /// Payload bytes of a committed item.
    pub fn item_data(&self, item: ItemRef) -> &[u8] {
        let hdr = self.item_header(item);
        // SAFETY: committed items lie inside the mapping; the mapping lives
        // as long as self.
        unsafe {
            core::slice::from_raw_parts(
                self.base().add(item.data_offset() as usize),
                hdr.data_len as usize,
            )
        }
    }

    fn item_end(&self, item: ItemRef) -> *mut u8 {
        let hdr = self.item_header(item);
        let extent = item_extent(hdr.data_len);
        // SAFETY: committed extent inside the mapping.
        unsafe { self.base().add(item.start as usize + extent) }
    }

    pub fn is_stale(&self, item: ItemRef) -> bool {
        // SAFETY: trailer of a committed item.
        unsafe { item::read_stale(self.item_end(item)) }
    }

    /// Set the stale bit. Idempotent. Caller holds the write mutex.
    pub fn mark_stale(&self, item: ItemRef) {
        debug_assert!(self.has_write_mutex());
        // SAFETY: trailer of a committed item; write mutex held.
        unsafe { item::set_stale(self.item_end(item)) };
    }

    /// Flip an item's type tag in place (orphan promotion, AOT
    /// invalidation). Caller holds the write mutex.
    pub fn set_item_type(&self, item: ItemRef, new_type: ItemType) {
        debug_assert!(self.has_write_mutex());
        // SAFETY: committed item header; write mutex held; readers
        // tolerate the permitted flips.
        unsafe { item::write_item_type(self.base().add(item.start as usize), new_type) };
    }

    pub fn is_address_in_segment(&self, offset: u32) -> bool {
        offset >= self.segment_base() && offset < self.seg_ptr()
    }

    /// Walk committed metadata oldest to newest. `from` of None walks the
    /// whole area; Some(pos) walks only items committed after the snapshot
    /// position `pos` was taken.
    pub fn walk(&self, from: Option<u32>) -> MetadataWalker<'_> {
        MetadataWalker {
            cc: self,
            pos: from.unwrap_or_else(|| self.metadata_top()),
            floor: self.meta_ptr(),
        }
    }

    /// Walk an explicit window `[floor, from)`. Refresh uses this so items
    /// a peer commits mid-replay wait for the next refresh instead of
    /// being replayed twice.
    pub fn walk_between(&self, from: u32, floor: u32) -> MetadataWalker<'_> {
        debug_assert!(floor <= from);
        MetadataWalker { cc: self, pos: from, floor }
    }

    /// The serialized unique id of this layer: path plus six hex tokens.
    pub fn unique_id(&self) -> String {
        let h = self.header();
        let metadata_bytes = h.total_size - self.meta_ptr();
        let class_bytes = self.seg_ptr() - self.segment_base();
        format!(
            "{}_{:x}_{:x}_{:x}_{:x}_{:x}_{:x}",
            self.file.path().display(),
            h.create_time,
            metadata_bytes,
            class_bytes,
            h.line_num_bytes,
            h.var_info_bytes,
            h.layer,
        )
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }

    pub fn delete(&self) -> Result<()> {
        self.file.delete()
    }
}

/// Reverse metadata walker: trailer-driven, oldest item first, stops at the
/// committed metadata pointer. A zero or overshooting step marks the layer
/// corrupt and ends the walk.
pub struct MetadataWalker<'a> {
    cc: &'a CompositeCache,
    pos: u32,
    floor: u32,
}

impl<'a> Iterator for MetadataWalker<'a> {
    type Item = ItemRef;

    fn next(&mut self) -> Option<ItemRef> {
        if self.pos <= self.floor {
            return None;
        }
        // SAFETY: pos is within committed metadata, which always ends with
        // a trailer.
        let len = unsafe { item::read_extent_len(self.cc.base().add(self.pos as usize)) };
        if len < (item::ITEM_HEADER_SIZE + item::ITEM_TRAILER_SIZE) as u32
            || len > self.pos - self.floor
        {
            self.cc.set_corrupt(CorruptionCode::BadWalkStep, ((self.pos as u64) << 32) | len as u64);
            return None;
        }
        let start = self.pos - len;
        let item = ItemRef { layer: self.cc.layer, start };
        let hdr = self.cc.item_header(item);
        if ItemType::from_raw(hdr.item_type).is_none() {
            self.cc
                .set_corrupt(CorruptionCode::BadItemType, ((start as u64) << 32) | hdr.item_type as u64);
            return None;
        }
        self.pos = start;
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::TRAILER_FLAG_MASK;

    fn new_cache(dir: &tempfile::TempDir) -> CompositeCache {
        CompositeCache::create(
            &dir.path().join("l0.shc"),
            0,
            MIN_CACHE_SIZE * 4,
            None,
            0,
            0,
            None,
            0,
            None,
            false,
        )
        .unwrap()
    }

    fn store_item(cc: &CompositeCache, ty: ItemType, payload: &[u8]) -> ItemRef {
        let pending = cc.allocate(ty, payload.len() as u32, 0, AllocKind::Block).unwrap();
        unsafe { cc.pending_data(&pending) }.copy_from_slice(payload);
        let item = pending.item;
        cc.commit(pending, None);
        item
    }

    #[test]
    fn test_create_open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cc = new_cache(&dir);
        let path = cc.path().to_owned();
        assert_eq!(cc.header().magic, CACHE_MAGIC);
        drop(cc);
        let cc = CompositeCache::open(&path, 0, false).unwrap();
        assert_eq!(cc.header().version, CACHE_VERSION);
        assert!(CompositeCache::open(&path, 1, false).is_err());
    }

    #[test]
    fn test_commit_makes_item_walkable() {
        let dir = tempfile::tempdir().unwrap();
        let cc = new_cache(&dir);
        cc.attach_jvm().unwrap();
        cc.enter_write_mutex().unwrap();

        let before = cc.read_update_count();
        let pending = cc.allocate(ItemType::Scope, 10, 0, AllocKind::Block).unwrap();
        // Not visible until commit.
        assert_eq!(cc.walk(None).count(), 0);
        unsafe { cc.pending_data(&pending) }.copy_from_slice(b"0123456789");
        cc.commit(pending, None);
        cc.exit_write_mutex().unwrap();

        assert_eq!(cc.read_update_count(), before + 1);
        let items: Vec<_> = cc.walk(None).collect();
        assert_eq!(items.len(), 1);
        let hdr = cc.item_header(items[0]);
        assert_eq!(hdr.item_type, ItemType::Scope as u16);
        assert_eq!(cc.item_data(items[0]), b"0123456789");
        assert!(!cc.is_stale(items[0]));
    }

    #[test]
    fn test_walk_order_is_commit_order() {
        let dir = tempfile::tempdir().unwrap();
        let cc = new_cache(&dir);
        cc.attach_jvm().unwrap();
        cc.enter_write_mutex().unwrap();
        store_item(&cc, ItemType::Scope, b"first");
        store_item(&cc, ItemType::Scope, b"second");
        store_item(&cc, ItemType::Scope, b"third");
        cc.exit_write_mutex().unwrap();

        let data: Vec<_> = cc.walk(None).map(|i| cc.item_data(i).to_vec()).collect();
        assert_eq!(data, vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]);
    }

    #[test]
    fn test_trailer_lengths_tile_the_area() {
        let dir = tempfile::tempdir().unwrap();
        let cc = new_cache(&dir);
        cc.attach_jvm().unwrap();
        cc.enter_write_mutex().unwrap();
        for len in [1usize, 8, 13, 64] {
            store_item(&cc, ItemType::Scope, &vec![7u8; len]);
        }
        cc.exit_write_mutex().unwrap();

        let total: u32 = cc
            .walk(None)
            .map(|i| item_extent(cc.item_header(i).data_len) as u32)
            .sum();
        assert_eq!(total, cc.metadata_top() - cc.meta_ptr());
    }

    #[test]
    fn test_segment_allocation_and_final_size() {
        let dir = tempfile::tempdir().unwrap();
        let cc = new_cache(&dir);
        cc.attach_jvm().unwrap();
        cc.enter_write_mutex().unwrap();
        let base = cc.seg_ptr();
        let pending = cc.allocate(ItemType::Orphan, 8, 1000, AllocKind::Block).unwrap();
        assert_eq!(pending.segment_offset, base);
        let pending_segment = unsafe { cc.pending_segment(&pending) };
        pending_segment[..4].copy_from_slice(&[1, 2, 3, 4]);
        unsafe { cc.pending_data(&pending) }.copy_from_slice(&[0; 8]);
        // Shrink the reservation to the bytes actually used.
        cc.commit(pending, Some(100));
        cc.exit_write_mutex().unwrap();
        assert_eq!(cc.seg_ptr(), base + 104); // 100 rounded to 8
        assert!(cc.is_address_in_segment(base));
        assert!(!cc.is_address_in_segment(cc.seg_ptr()));
    }

    #[test]
    fn test_uncommitted_allocation_is_invisible_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let cc = new_cache(&dir);
        let path = cc.path().to_owned();
        cc.attach_jvm().unwrap();
        cc.enter_write_mutex().unwrap();
        let pending = cc.allocate(ItemType::Scope, 100, 200, AllocKind::Block).unwrap();
        unsafe { cc.pending_data(&pending) }.fill(0xEE);
        // Simulate a crash: no commit, no exit_write_mutex teardown.
        drop(cc);

        let cc2 = CompositeCache::open(&path, 0, false).unwrap();
        assert_eq!(cc2.walk(None).count(), 0);
        assert_eq!(cc2.seg_ptr(), cc2.segment_base());
        // The interrupted writer is noticed on the next mutex entry.
        cc2.attach_jvm().unwrap();
        let crashed = cc2.enter_write_mutex().unwrap();
        assert!(crashed);
        assert_eq!(cc2.crash_count(), 1);
        cc2.exit_write_mutex().unwrap();
        let crashed = cc2.enter_write_mutex().unwrap();
        assert!(!crashed);
        cc2.exit_write_mutex().unwrap();
    }

    #[test]
    fn test_block_full_flag_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cc = new_cache(&dir);
        cc.attach_jvm().unwrap();
        cc.enter_write_mutex().unwrap();
        let free = cc.free_block_bytes();
        let r = cc.allocate(ItemType::Scope, free, 0, AllocKind::Block);
        assert_eq!(r.unwrap_err(), AllocFailure::BlockFull);
        assert!(cc.full_flags() & FLAG_BLOCK_FULL != 0);
        // Small allocations still work; BLOCK_FULL is advisory for stats.
        assert!(cc.allocate(ItemType::Scope, 16, 0, AllocKind::Block).is_ok());
        cc.exit_write_mutex().unwrap();
    }

    #[test]
    fn test_softmx_blocks_stores() {
        let dir = tempfile::tempdir().unwrap();
        let cc = new_cache(&dir);
        cc.attach_jvm().unwrap();
        cc.enter_write_mutex().unwrap();
        cc.set_softmx(cc.used_bytes() + 64);
        let r = cc.allocate(ItemType::Scope, 1024, 0, AllocKind::Block);
        assert_eq!(r.unwrap_err(), AllocFailure::SoftMaxFull);
        assert!(cc.full_flags() & FLAG_AVAILABLE_FULL != 0);
        cc.exit_write_mutex().unwrap();
    }

    #[test]
    fn test_min_aot_reservation_blocks_block_allocs() {
        let dir = tempfile::tempdir().unwrap();
        let cc = CompositeCache::create(
            &dir.path().join("l0.shc"),
            0,
            MIN_CACHE_SIZE * 2,
            None,
            0,
            // Reserve nearly everything for AOT.
            MIN_CACHE_SIZE * 2 - HEADER_SIZE as u32 - 1024,
            None,
            0,
            None,
            false,
        )
        .unwrap();
        cc.attach_jvm().unwrap();
        cc.enter_write_mutex().unwrap();
        let r = cc.allocate(ItemType::Scope, 4096, 0, AllocKind::Block);
        assert_eq!(r.unwrap_err(), AllocFailure::BlockFull);
        // The AOT reservation itself is still usable.
        assert!(cc.allocate(ItemType::CompiledMethod, 4096, 0, AllocKind::Aot).is_ok());
        cc.exit_write_mutex().unwrap();
    }

    #[test]
    fn test_stale_mark_is_idempotent_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let cc = new_cache(&dir);
        let path = cc.path().to_owned();
        cc.attach_jvm().unwrap();
        cc.enter_write_mutex().unwrap();
        let item = store_item(&cc, ItemType::Scope, b"payload!");
        cc.mark_stale(item);
        cc.mark_stale(item);
        assert!(cc.is_stale(item));
        // Length is still intact for the walker.
        let trailer_len = item_extent(8) as u32 & !TRAILER_FLAG_MASK;
        assert_eq!(trailer_len, item_extent(8) as u32);
        cc.exit_write_mutex().unwrap();
        drop(cc);

        let cc2 = CompositeCache::open(&path, 0, false).unwrap();
        let items: Vec<_> = cc2.walk(None).collect();
        assert_eq!(items.len(), 1);
        assert!(cc2.is_stale(items[0]));
    }

    #[test]
    fn test_refresh_window() {
        let dir = tempfile::tempdir().unwrap();
        let cc = new_cache(&dir);
        cc.attach_jvm().unwrap();
        cc.enter_write_mutex().unwrap();
        store_item(&cc, ItemType::Scope, b"one");
        cc.exit_write_mutex().unwrap();

        assert!(cc.updates_pending());
        let (new_meta, prev) = cc.take_refresh_snapshot();
        assert_eq!(prev, cc.metadata_top());
        assert_eq!(cc.walk(Some(prev)).count(), 1);
        assert!(!cc.updates_pending());

        cc.enter_write_mutex().unwrap();
        store_item(&cc, ItemType::Scope, b"two");
        store_item(&cc, ItemType::Scope, b"three");
        cc.exit_write_mutex().unwrap();
        let (_, prev2) = cc.take_refresh_snapshot();
        assert_eq!(prev2, new_meta);
        let fresh: Vec<_> = cc.walk(Some(prev2)).map(|i| cc.item_data(i).to_vec()).collect();
        assert_eq!(fresh, vec![b"two".to_vec(), b"three".to_vec()]);
    }

    #[test]
    fn test_corrupt_walk_step_detected() {
        let dir = tempfile::tempdir().unwrap();
        let cc = new_cache(&dir);
        cc.attach_jvm().unwrap();
        cc.enter_write_mutex().unwrap();
        let item = store_item(&cc, ItemType::Scope, b"x");
        // Smash the trailer length.
        let extent = item_extent(1);
        unsafe {
            let trailer = cc.base().add(item.start as usize + extent - 4) as *mut u32;
            core::ptr::write_unaligned(trailer, 0);
        }
        assert_eq!(cc.walk(None).count(), 0);
        assert!(cc.is_corrupt());
        cc.exit_write_mutex().unwrap();
    }

    #[test]
    fn test_corruption_on_readonly_stays_local() {
        let dir = tempfile::tempdir().unwrap();
        let cc = new_cache(&dir);
        let path = cc.path().to_owned();
        drop(cc);

        let ro = CompositeCache::open(&path, 0, true).unwrap();
        ro.set_corrupt(CorruptionCode::SrpOutOfRange, 0xBEEF);
        assert!(ro.is_corrupt());
        let (code, context) = ro.corruption_info();
        assert_eq!(code, CorruptionCode::SrpOutOfRange);
        assert_eq!(context, 0xBEEF);
        drop(ro);

        // The read-only detection never reached the file.
        let rw = CompositeCache::open(&path, 0, false).unwrap();
        assert!(!rw.is_corrupt());
    }

    #[test]
    fn test_unique_id_stable_across_reattach() {
        let dir = tempfile::tempdir().unwrap();
        let cc = new_cache(&dir);
        let path = cc.path().to_owned();
        cc.attach_jvm().unwrap();
        cc.enter_write_mutex().unwrap();
        store_item(&cc, ItemType::Scope, b"anchor");
        cc.exit_write_mutex().unwrap();
        let id1 = cc.unique_id();
        drop(cc);
        let cc2 = CompositeCache::open(&path, 0, false).unwrap();
        assert_eq!(cc2.unique_id(), id1);
        // Six hex tokens after the path.
        assert_eq!(id1.split('_').count() >= 7, true);
    }
}
