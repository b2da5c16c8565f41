//! Byte-data manager: arbitrary key/value records typed by a small
//! sub-kind enumeration (JCL caches, zip caches, JIT hints, AOT metadata,
//! startup hints, ...).
//!
//! Indexed records hang off a UTF-8 key; unindexed records are reachable
//! only through other records. Private records belong to the JVM that
//! stored them until released or reclaimed. Single-store records are
//! idempotent per (key, sub-kind).

use std::collections::HashMap;

use bytemuck::Zeroable;
use parking_lot::Mutex;

use crate::chain::Chain;
use crate::item::{
    BDW_FLAG_PRIVATE, BDW_FLAG_SINGLE_STORE, ByteDataKind, ByteDataWrapper, ItemRef, ItemType,
};
use crate::offset::ShrOffset;

/// One located record.
#[derive(Clone, Debug)]
pub struct FoundByteData {
    pub item: ItemRef,
    pub kind: ByteDataKind,
    pub flags: u16,
    /// Offset of the value bytes within the chain.
    pub data: ShrOffset,
    pub data_len: u32,
    pub private_owner: u32,
}

pub fn read_bd_wrapper(chain: &Chain, item: ItemRef) -> Option<ByteDataWrapper> {
    let data = chain.item_data(item)?;
    let size = core::mem::size_of::<ByteDataWrapper>();
    if data.len() < size {
        return None;
    }
    let mut w = ByteDataWrapper::zeroed();
    bytemuck::bytes_of_mut(&mut w).copy_from_slice(&data[..size]);
    Some(w)
}

/// Value bytes of a byte-data item.
pub fn value_bytes<'a>(chain: &'a Chain, item: ItemRef) -> Option<&'a [u8]> {
    let data = chain.item_data(item)?;
    let size = core::mem::size_of::<ByteDataWrapper>();
    let w = read_bd_wrapper(chain, item)?;
    data.get(size..size + w.data_len as usize)
}

#[derive(Default)]
pub struct ByteDataManager {
    by_key: Mutex<HashMap<(String, u16), Vec<ItemRef>>>,
    unindexed: Mutex<Vec<ItemRef>>,
}

impl ByteDataManager {
    pub fn new() -> ByteDataManager {
        ByteDataManager::default()
    }

    pub fn store_new(&self, chain: &Chain, item: ItemRef) -> bool {
        let Some(w) = read_bd_wrapper(chain, item) else {
            return false;
        };
        let raw_type = chain.item_type_raw(item);
        if raw_type == Some(ItemType::UnindexedByteData as u16) || w.key.is_null() {
            self.unindexed.lock().push(item);
            return true;
        }
        let Some(key) = chain.utf8_at(w.key) else {
            return false;
        };
        self.by_key
            .lock()
            .entry((key.to_owned(), w.sub_kind))
            .or_default()
            .push(item);
        true
    }

    pub fn reset(&self) {
        self.by_key.lock().clear();
        self.unindexed.lock().clear();
    }

    pub fn indexed_count(&self) -> usize {
        self.by_key.lock().values().map(Vec::len).sum()
    }

    /// All live records under `key`, optionally narrowed to one sub-kind.
    /// Private records belonging to other JVMs are filtered out unless
    /// `include_private` asks for them.
    pub fn find(
        &self,
        chain: &Chain,
        key: &str,
        kind: Option<ByteDataKind>,
        include_private: bool,
        our_jvm_id: u32,
    ) -> Vec<FoundByteData> {
        let by_key = self.by_key.lock();
        let mut out = Vec::new();
        let buckets: Vec<&Vec<ItemRef>> = match kind {
            Some(k) => by_key.get(&(key.to_owned(), k as u16)).into_iter().collect(),
            None => by_key
                .iter()
                .filter(|((k, _), _)| k == key)
                .map(|(_, v)| v)
                .collect(),
        };
        for bucket in buckets {
            for item in bucket {
                if chain.is_stale(*item) {
                    continue;
                }
                let Some(w) = read_bd_wrapper(chain, *item) else {
                    continue;
                };
                let private = w.flags & BDW_FLAG_PRIVATE != 0;
                if private && w.private_owner != our_jvm_id && !include_private {
                    continue;
                }
                out.push(FoundByteData {
                    item: *item,
                    kind: ByteDataKind::from_raw(w.sub_kind),
                    flags: w.flags,
                    data: ShrOffset::new(
                        item.layer,
                        item.data_offset() + core::mem::size_of::<ByteDataWrapper>() as u32,
                    ),
                    data_len: w.data_len,
                    private_owner: w.private_owner,
                })
            }
        }
        out
    }

    /// An existing single-store record for (key, kind), if any. Store
    /// operations use this to report `Exists` instead of duplicating.
    pub fn find_single_store(
        &self,
        chain: &Chain,
        key: &str,
        kind: ByteDataKind,
    ) -> Option<ItemRef> {
        self.by_key
            .lock()
            .get(&(key.to_owned(), kind as u16))?
            .iter()
            .find(|item| {
                !chain.is_stale(**item)
                    && read_bd_wrapper(chain, **item)
                        .is_some_and(|w| w.flags & BDW_FLAG_SINGLE_STORE != 0)
            })
            .copied()
    }

    /// Overwrite a record's value in place. Only legal for same-length
    /// values in the writable top layer, under the write mutex.
    pub fn update_in_place(&self, chain: &Chain, item: ItemRef, value: &[u8]) -> bool {
        let Some(w) = read_bd_wrapper(chain, item) else {
            return false;
        };
        if w.data_len as usize != value.len() {
            return false;
        }
        let Some(cc) = chain.cache(item.layer) else {
            return false;
        };
        if cc.layer() != chain.top().layer() || !cc.has_write_mutex() {
            return false;
        }
        let at = item.data_offset() as usize + core::mem::size_of::<ByteDataWrapper>();
        // SAFETY: committed item payload inside the mapping; write mutex held.
        unsafe {
            core::ptr::copy_nonoverlapping(value.as_ptr(), cc.base().add(at), value.len());
        }
        true
    }

    /// Take ownership of a private record whose owner is gone (or unset).
    /// Caller holds the write mutex.
    pub fn acquire_private(&self, chain: &Chain, item: ItemRef, our_jvm_id: u32) -> bool {
        let Some(w) = read_bd_wrapper(chain, item) else {
            return false;
        };
        if w.flags & BDW_FLAG_PRIVATE == 0 {
            return false;
        }
        if w.private_owner == our_jvm_id {
            return true;
        }
        let pid = owner_pid(chain, item, w.private_owner);
        if w.private_owner != 0 && pid != 0 && crate::platform::process_alive(pid) {
            return false;
        }
        write_private_owner(chain, item, our_jvm_id)
    }

    /// Give up ownership of one of our private records.
    pub fn release_private(&self, chain: &Chain, item: ItemRef, our_jvm_id: u32) -> bool {
        let Some(w) = read_bd_wrapper(chain, item) else {
            return false;
        };
        if w.private_owner != our_jvm_id {
            return false;
        }
        write_private_owner(chain, item, 0)
    }
}

/// The pid behind an attach-slot id, for liveness probes of private-record
/// owners.
fn owner_pid(chain: &Chain, item: ItemRef, jvm_id: u32) -> u32 {
    let Some(cc) = chain.cache(item.layer) else {
        return 0;
    };
    if jvm_id == 0 || jvm_id as usize > crate::config::MAX_JVM_SLOTS {
        return 0;
    }
    (cc.header().jvm_slots[jvm_id as usize - 1] >> 32) as u32
}

fn write_private_owner(chain: &Chain, item: ItemRef, owner: u32) -> bool {
    let Some(cc) = chain.cache(item.layer) else {
        return false;
    };
    debug_assert!(cc.has_write_mutex());
    let at = item.data_offset() as usize + core::mem::offset_of!(ByteDataWrapper, private_owner);
    // SAFETY: field of a committed wrapper; write mutex held.
    unsafe { core::ptr::write_volatile(cc.base().add(at) as *mut u32, owner) };
    true
}
