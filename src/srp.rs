//! SRP keys and the per-build-session offset table.
//!
//! During a build, logical reference slots (each constant pool item, each
//! method's stack map / debug info / variable info) are named by dense
//! integer keys minted up front. The measuring cursor marks where each key's
//! data will land within its tagged sub-region; once the sub-regions have
//! base addresses, any cursor can emit a self-relative pointer from its
//! current position to a key's resolved address.

use crate::error::{Result, ShrError};

/// The tagged sub-regions a build lays out. Each gets its own base address
/// after allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum RegionTag {
    Main = 0,
    LineNumber = 1,
    VariableInfo = 2,
    Utf8 = 3,
    IntermediateClassData = 4,
}

pub const REGION_TAG_COUNT: usize = 5;

/// Mints SRP keys for one build session. Constant pool indices map directly
/// to the first `cp_count` keys; per-method keys follow in banks.
/// `generate_key` may not be called after `max_key` has been read.
#[derive(Debug)]
pub struct SrpKeyProducer {
    cp_count: u32,
    method_count: u32,
    start_stack_map: u32,
    start_debug_info: u32,
    start_variable_info: u32,
    next_extra: u32,
    max_key_read: bool,
}

impl SrpKeyProducer {
    pub fn new(cp_count: u32, method_count: u32) -> SrpKeyProducer {
        let start_stack_map = cp_count;
        let start_debug_info = start_stack_map + method_count;
        let start_variable_info = start_debug_info + method_count;
        SrpKeyProducer {
            cp_count,
            method_count,
            start_stack_map,
            start_debug_info,
            start_variable_info,
            next_extra: start_variable_info + method_count,
            max_key_read: false,
        }
    }

    /// Mint a fresh key outside the fixed banks.
    pub fn generate_key(&mut self) -> u32 {
        debug_assert!(!self.max_key_read, "generate_key after max_key");
        let key = self.next_extra;
        self.next_extra += 1;
        key
    }

    pub fn max_key(&mut self) -> u32 {
        self.max_key_read = true;
        self.next_extra
    }

    #[inline]
    pub fn constant_pool_key(&self, index: u16) -> u32 {
        debug_assert!((index as u32) < self.cp_count);
        index as u32
    }

    #[inline]
    pub fn stack_map_key(&self, method_index: u16) -> u32 {
        debug_assert!((method_index as u32) < self.method_count);
        self.start_stack_map + method_index as u32
    }

    #[inline]
    pub fn debug_info_key(&self, method_index: u16) -> u32 {
        debug_assert!((method_index as u32) < self.method_count);
        self.start_debug_info + method_index as u32
    }

    #[inline]
    pub fn variable_info_key(&self, method_index: u16) -> u32 {
        debug_assert!((method_index as u32) < self.method_count);
        self.start_variable_info + method_index as u32
    }

    pub fn is_constant_pool_key(&self, key: u32) -> bool {
        key < self.cp_count
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Entry {
    tag: usize,
    offset: u32,
    marked: bool,
    interned: bool,
    interned_at: usize,
}

/// Per-build-session map from SRP keys to offsets within tagged regions.
/// Keys are never revoked mid-build; `clear` resets between the sizing pass
/// and the layout pass.
#[derive(Debug)]
pub struct SrpOffsetTable {
    table: Vec<Entry>,
    base_addresses: [usize; REGION_TAG_COUNT],
}

impl SrpOffsetTable {
    pub fn new(max_key: u32) -> Result<SrpOffsetTable> {
        // A hostile constant pool count could ask for a table we cannot size.
        let entries = usize::try_from(max_key).map_err(|_| ShrError::OutOfMemory("srp table"))?;
        if entries > (u32::MAX as usize) / core::mem::size_of::<Entry>() {
            return Err(ShrError::OutOfMemory("srp table"));
        }
        Ok(SrpOffsetTable {
            table: vec![Entry::default(); entries],
            base_addresses: [0; REGION_TAG_COUNT],
        })
    }

    /// Record that `key`'s data lands at `offset` within region `tag`.
    pub fn insert(&mut self, key: u32, offset: u32, tag: RegionTag) {
        let e = &mut self.table[key as usize];
        e.tag = tag as usize;
        e.offset = offset;
        e.marked = true;
    }

    pub fn get(&self, key: u32) -> u32 {
        self.table[key as usize].offset
    }

    pub fn is_not_null(&self, key: u32) -> bool {
        self.table[key as usize].marked
    }

    pub fn is_interned(&self, key: u32) -> bool {
        self.table[key as usize].interned
    }

    /// Redirect `key` at an existing UTF-8 copy at `address` (which may be
    /// in any attached layer within SRP range).
    pub fn set_interned_at(&mut self, key: u32, address: *const u8) {
        let e = &mut self.table[key as usize];
        e.interned = true;
        e.interned_at = address as usize;
        e.marked = true;
    }

    /// Fix the absolute base address of a tagged region after allocation.
    pub fn set_base_address_for_tag(&mut self, tag: RegionTag, base: *const u8) {
        self.base_addresses[tag as usize] = base as usize;
    }

    pub fn base_address_for_tag(&self, tag: RegionTag) -> *const u8 {
        self.base_addresses[tag as usize] as *const u8
    }

    /// Resolved absolute address of `key`, or None if unmarked.
    pub fn resolve(&self, key: u32) -> Option<usize> {
        let e = &self.table[key as usize];
        if !e.marked {
            return None;
        }
        if e.interned {
            return Some(e.interned_at);
        }
        Some(self.base_addresses[e.tag] + e.offset as usize)
    }

    /// Signed narrow offset from `site` to `key`'s resolved address, or 0
    /// for an unmarked key (a null SRP).
    pub fn compute_srp(&self, key: u32, site: *const u8) -> i32 {
        match self.resolve(key) {
            Some(target) => (target as isize - site as usize as isize) as i32,
            None => 0,
        }
    }

    /// Wide variant of [`compute_srp`].
    pub fn compute_wsrp(&self, key: u32, site: *const u8) -> i64 {
        match self.resolve(key) {
            Some(target) => (target as isize - site as usize as isize) as i64,
            None => 0,
        }
    }

    /// Forget all marks and bases. Used between the size-computation pass
    /// and the final layout pass.
    pub fn clear(&mut self) {
        for e in &mut self.table {
            *e = Entry::default();
        }
        self.base_addresses = [0; REGION_TAG_COUNT];
    }
}
