//! ROM-class resource managers: compiled methods and attached data, both
//! keyed by the method record they belong to.
//!
//! Compiled methods can be invalidated: a type-tag flip that keeps the
//! bytes but hides the record from normal finds, reversible by the AOT
//! management operation. Attached data supports in-place update guarded by
//! a `corrupt_offset` marker so a crashed updater leaves a detectable
//! partial write.

use std::collections::HashMap;

use bytemuck::Zeroable;
use log::warn;
use parking_lot::Mutex;

use crate::chain::Chain;
use crate::item::{
    ATTACHED_DATA_QUIESCENT, AttachedDataWrapper, ItemRef, ItemType, MethodDataWrapper,
};
use crate::offset::ShrOffset;

pub fn read_method_wrapper(chain: &Chain, item: ItemRef) -> Option<MethodDataWrapper> {
    let data = chain.item_data(item)?;
    let size = core::mem::size_of::<MethodDataWrapper>();
    if data.len() < size {
        return None;
    }
    let mut w = MethodDataWrapper::zeroed();
    bytemuck::bytes_of_mut(&mut w).copy_from_slice(&data[..size]);
    Some(w)
}

pub fn read_attached_wrapper(chain: &Chain, item: ItemRef) -> Option<AttachedDataWrapper> {
    let data = chain.item_data(item)?;
    let size = core::mem::size_of::<AttachedDataWrapper>();
    if data.len() < size {
        return None;
    }
    let mut w = AttachedDataWrapper::zeroed();
    bytemuck::bytes_of_mut(&mut w).copy_from_slice(&data[..size]);
    Some(w)
}

/// A located compiled method: metadata bytes then code bytes.
#[derive(Clone, Copy, Debug)]
pub struct FoundCompiledMethod {
    pub item: ItemRef,
    pub data: ShrOffset,
    pub data_len: u32,
    pub code: ShrOffset,
    pub code_len: u32,
}

/// Manager for `CompiledMethod` / `InvalidatedCompiledMethod` items.
#[derive(Default)]
pub struct CompiledMethodManager {
    by_method: Mutex<HashMap<ShrOffset, Vec<ItemRef>>>,
}

impl CompiledMethodManager {
    pub fn new() -> CompiledMethodManager {
        CompiledMethodManager::default()
    }

    pub fn store_new(&self, chain: &Chain, item: ItemRef) -> bool {
        let Some(w) = read_method_wrapper(chain, item) else {
            return false;
        };
        self.by_method.lock().entry(w.rom_method).or_default().push(item);
        true
    }

    pub fn reset(&self) {
        self.by_method.lock().clear();
    }

    pub fn method_count(&self) -> usize {
        self.by_method.lock().values().map(Vec::len).sum()
    }

    /// Fast existence peek used on the compile fast path.
    pub fn exists_for_method(&self, chain: &Chain, rom_method: ShrOffset) -> bool {
        self.find(chain, rom_method).is_some()
    }

    /// The live (non-stale, non-invalidated) record for a method.
    pub fn find(&self, chain: &Chain, rom_method: ShrOffset) -> Option<FoundCompiledMethod> {
        let by_method = self.by_method.lock();
        let bucket = by_method.get(&rom_method)?;
        for item in bucket {
            if chain.is_stale(*item) {
                continue;
            }
            if chain.item_type_raw(*item) != Some(ItemType::CompiledMethod as u16) {
                continue;
            }
            let w = read_method_wrapper(chain, *item)?;
            let data_at = item.data_offset() + core::mem::size_of::<MethodDataWrapper>() as u32;
            return Some(FoundCompiledMethod {
                item: *item,
                data: ShrOffset::new(item.layer, data_at),
                data_len: w.data_len,
                code: ShrOffset::new(item.layer, data_at + w.data_len),
                code_len: w.code_len,
            });
        }
        None
    }

    /// Any record for the method, invalidated ones included. Store uses
    /// this to report `Exists` vs `Invalidated` duplicates.
    pub fn find_any(&self, chain: &Chain, rom_method: ShrOffset) -> Option<(ItemRef, ItemType)> {
        let by_method = self.by_method.lock();
        let bucket = by_method.get(&rom_method)?;
        for item in bucket {
            if chain.is_stale(*item) {
                continue;
            }
            if let Some(t) = chain.item_type_raw(*item).and_then(ItemType::from_raw) {
                if matches!(t, ItemType::CompiledMethod | ItemType::InvalidatedCompiledMethod) {
                    return Some((*item, t));
                }
            }
        }
        None
    }
}

/// A located attached-data record.
#[derive(Clone, Copy, Debug)]
pub struct FoundAttachedData {
    pub item: ItemRef,
    pub sub_type: u16,
    pub update_count: u16,
    pub data: ShrOffset,
    pub data_len: u32,
    /// Mid-update offset left by a crashed writer, or -1.
    pub corrupt_offset: i32,
}

/// Manager for `AttachedData` items, keyed by (method, sub-type).
#[derive(Default)]
pub struct AttachedDataManager {
    by_method: Mutex<HashMap<(ShrOffset, u16), Vec<ItemRef>>>,
}

impl AttachedDataManager {
    pub fn new() -> AttachedDataManager {
        AttachedDataManager::default()
    }

    pub fn store_new(&self, chain: &Chain, item: ItemRef) -> bool {
        let Some(w) = read_attached_wrapper(chain, item) else {
            return false;
        };
        self.by_method
            .lock()
            .entry((w.rom_method, w.sub_type))
            .or_default()
            .push(item);
        true
    }

    pub fn reset(&self) {
        self.by_method.lock().clear();
    }

    pub fn record_count(&self) -> usize {
        self.by_method.lock().values().map(Vec::len).sum()
    }

    pub fn find(&self, chain: &Chain, rom_method: ShrOffset, sub_type: u16) -> Option<FoundAttachedData> {
        let by_method = self.by_method.lock();
        let bucket = by_method.get(&(rom_method, sub_type))?;
        for item in bucket {
            if chain.is_stale(*item) {
                continue;
            }
            let w = read_attached_wrapper(chain, *item)?;
            if w.corrupt_offset != ATTACHED_DATA_QUIESCENT {
                warn!(
                    "attached data at {}:{} carries a partial update (offset {})",
                    item.layer, item.start, w.corrupt_offset
                );
            }
            return Some(FoundAttachedData {
                item: *item,
                sub_type: w.sub_type,
                update_count: w.update_count,
                data: ShrOffset::new(
                    item.layer,
                    item.data_offset() + core::mem::size_of::<AttachedDataWrapper>() as u32,
                ),
                data_len: w.data_len,
                corrupt_offset: w.corrupt_offset,
            });
        }
        None
    }

    /// In-place update of a record's bytes at `at_offset`. The corrupt
    /// marker brackets the copy so an interrupted writer is detectable.
    /// Caller holds the write mutex of the owning (top) layer.
    pub fn update_in_place(
        &self,
        chain: &Chain,
        item: ItemRef,
        at_offset: u32,
        bytes: &[u8],
    ) -> bool {
        let Some(w) = read_attached_wrapper(chain, item) else {
            return false;
        };
        if at_offset as usize + bytes.len() > w.data_len as usize {
            return false;
        }
        let Some(cc) = chain.cache(item.layer) else {
            return false;
        };
        if !cc.has_write_mutex() {
            return false;
        }
        let base = item.data_offset() as usize;
        let corrupt_at = base + core::mem::offset_of!(AttachedDataWrapper, corrupt_offset);
        let count_at = base + core::mem::offset_of!(AttachedDataWrapper, update_count);
        let dest = base + core::mem::size_of::<AttachedDataWrapper>() + at_offset as usize;
        // SAFETY: committed wrapper fields and payload inside the mapping;
        // write mutex held. The marker is published before the copy starts
        // and cleared only after it finished.
        unsafe {
            core::ptr::write_volatile(cc.base().add(corrupt_at) as *mut i32, at_offset as i32);
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), cc.base().add(dest), bytes.len());
            let count = core::ptr::read_volatile(cc.base().add(count_at) as *const u16);
            core::ptr::write_volatile(cc.base().add(count_at) as *mut u16, count.wrapping_add(1));
            core::ptr::write_volatile(
                cc.base().add(corrupt_at) as *mut i32,
                ATTACHED_DATA_QUIESCENT,
            );
        }
        true
    }
}
