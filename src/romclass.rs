//! ROM class manager: indexes orphan and ROM class items by class name,
//! promotes orphans in place, and drives classpath-validated lookup.
//!
//! A bucket holds every wrapper stored under one name; `locate` walks the
//! bucket honoring scope filters, classpath validation and timestamp
//! checks, and reports exactly what the caller should do next (hit, miss,
//! mark an entry stale, wait for a peer's in-flight store, or notice a
//! shadowing class file).

use std::collections::HashMap;

use bytemuck::Zeroable;
use log::trace;
use parking_lot::Mutex;

use crate::chain::Chain;
use crate::classpath::{ClasspathItem, ClasspathManager, StaleRef};
use crate::error::CorruptionCode;
use crate::item::{ITEM_HEADER_SIZE, ItemRef, ItemType, RomClassWrapper};
use crate::offset::ShrOffset;
use crate::romimage;
use crate::scope::{ScopeManager, ScopeMatch};
use crate::timestamp;

/// What a lookup concluded. `Found` may still carry a stale entry the
/// caller must mark before the next commit.
#[derive(Debug)]
pub enum LocateOutcome {
    Found {
        item: ItemRef,
        wrapper: RomClassWrapper,
        found_at_index: i32,
        stale: Option<StaleRef>,
    },
    NotFound {
        /// Another process is likely mid-store of this class; the caller
        /// may block briefly on the update channel and retry.
        try_wait: bool,
    },
    /// A cached classpath entry's timestamp no longer matches disk. The
    /// caller re-enters under the write mutex to mark it.
    MarkCpeiStale { stale: StaleRef },
    /// The class file behind a directory-loaded class changed; the caller
    /// marks this item stale.
    ClassTimestampChanged { item: ItemRef },
    /// A loose `.class` file earlier in the caller's path shadows the
    /// cached class.
    FoundShadow,
}

/// Turn a wrapper's classpath data offset back into the classpath item.
pub fn classpath_item_of(wrapper: &RomClassWrapper) -> Option<ItemRef> {
    if wrapper.classpath.is_null() {
        return None;
    }
    Some(ItemRef {
        layer: wrapper.classpath.layer,
        start: wrapper.classpath.offset - ITEM_HEADER_SIZE as u32,
    })
}

/// Read the `RomClassWrapper` prefix of an item's payload. Orphans share
/// the shape with a null classpath.
///
/// The wrapper's image offset must resolve inside its layer's segment
/// area, a narrower region than the mapped file; a wrapper escaping it is
/// corruption, recorded here before the offset is ever dereferenced.
pub fn read_wrapper(chain: &Chain, item: ItemRef) -> Option<RomClassWrapper> {
    let data = chain.item_data(item)?;
    let size = core::mem::size_of::<RomClassWrapper>();
    if data.len() < size {
        return None;
    }
    let mut w = RomClassWrapper::zeroed();
    bytemuck::bytes_of_mut(&mut w).copy_from_slice(&data[..size]);
    if !w.rom_class.is_null() {
        let cc = chain.cache(w.rom_class.layer)?;
        let within = cc.is_address_in_segment(w.rom_class.offset)
            && (w.rom_class.offset as u64 + w.rom_size as u64) <= cc.seg_ptr() as u64;
        if !within {
            cc.set_corrupt(CorruptionCode::BoundsViolation, w.rom_class.offset as u64);
            return None;
        }
    }
    Some(w)
}

#[derive(Default)]
pub struct RomClassManager {
    buckets: Mutex<HashMap<String, Vec<ItemRef>>>,
    timestamp_checks: std::sync::atomic::AtomicBool,
}

impl RomClassManager {
    pub fn new(timestamp_checks: bool) -> RomClassManager {
        let m = RomClassManager::default();
        m.timestamp_checks
            .store(timestamp_checks, std::sync::atomic::Ordering::Relaxed);
        m
    }

    fn timestamps_enabled(&self) -> bool {
        self.timestamp_checks.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Index one orphan/ROM-class item encountered by the scanner. A ROM
    /// class arriving for an image an orphan already covers reunites with
    /// the orphan's bucket slot instead of adding a second one.
    pub fn store_new(&self, chain: &Chain, item: ItemRef) -> bool {
        let Some(wrapper) = read_wrapper(chain, item) else {
            return false;
        };
        let Some(image) = chain.resolve(wrapper.rom_class) else {
            return false;
        };
        // SAFETY: the wrapper's segment bounds were validated by
        // read_wrapper(); the name SRP is bounds-checked as followed.
        let name = match unsafe { romimage::class_name(image, chain.offsets()) } {
            Ok(Some(name)) => name,
            Ok(None) => return false,
            Err(_) => {
                if let Some(cc) = chain.cache(wrapper.rom_class.layer) {
                    cc.set_corrupt(
                        CorruptionCode::SrpOutOfRange,
                        wrapper.rom_class.offset as u64,
                    );
                }
                return false;
            }
        };
        let raw_type = chain.item_type_raw(item);
        let is_rom_class = raw_type
            .and_then(ItemType::from_raw)
            .is_some_and(|t| t.is_rom_class_kind());
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(name.to_owned()).or_default();
        if is_rom_class {
            for slot in bucket.iter_mut() {
                let slot_orphan = chain.item_type_raw(*slot) == Some(ItemType::Orphan as u16);
                if slot_orphan {
                    if let Some(w) = read_wrapper(chain, *slot) {
                        if w.rom_class == wrapper.rom_class {
                            trace!("reuniting orphan for {name}");
                            *slot = item;
                            return true;
                        }
                    }
                }
            }
        }
        bucket.push(item);
        true
    }

    pub fn reset(&self) {
        self.buckets.lock().clear();
    }

    pub fn class_count(&self) -> usize {
        self.buckets.lock().values().map(Vec::len).sum()
    }

    pub fn exists_class_for_name(&self, name: &str) -> bool {
        self.buckets.lock().get(name).is_some_and(|b| !b.is_empty())
    }

    /// Every wrapper stored under `name`, bucket order.
    pub fn entries_for(&self, name: &str) -> Vec<ItemRef> {
        self.buckets.lock().get(name).cloned().unwrap_or_default()
    }

    /// Iterate existing images for `name`, orphans included. Used by the
    /// builder's reuse check and the `find_next` surface.
    pub fn find_next_existing(
        &self,
        chain: &Chain,
        name: &str,
        after: Option<ItemRef>,
    ) -> Option<(ItemRef, *const u8)> {
        let bucket = self.entries_for(name);
        let start = match after {
            Some(prev) => bucket.iter().position(|i| *i == prev)? + 1,
            None => 0,
        };
        for item in &bucket[start..] {
            if chain.is_stale(*item) {
                continue;
            }
            if let Some(w) = read_wrapper(chain, *item) {
                if let Some(image) = chain.resolve(w.rom_class) {
                    return Some((*item, image));
                }
            }
        }
        None
    }

    /// The full lookup. See [`LocateOutcome`] for the verdict set.
    #[allow(clippy::too_many_arguments)]
    pub fn locate(
        &self,
        chain: &Chain,
        cpm: &ClasspathManager,
        scm: &ScopeManager,
        name: &str,
        caller: &ClasspathItem,
        cpe_index: i32,
        confirmed_entries: i32,
        cached_image: Option<*const u8>,
        partition: Option<&str>,
        mod_context: Option<&str>,
    ) -> LocateOutcome {
        let bucket = self.entries_for(name);
        if bucket.is_empty() {
            // Nothing under this name at all: worth waiting, a peer may be
            // mid-store.
            return LocateOutcome::NotFound { try_wait: true };
        }

        let mut found_unmodified_orphan = false;

        for item in bucket {
            let Some(raw) = chain.item_type_raw(item) else {
                continue;
            };
            if raw == ItemType::Orphan as u16 {
                if !found_unmodified_orphan {
                    if let Some(w) = read_wrapper(chain, item) {
                        if let Some(image) = chain.resolve(w.rom_class) {
                            // SAFETY: resolved image in a live mapping.
                            if !unsafe { romimage::has_modified_bytecodes(image) } {
                                found_unmodified_orphan = true;
                            }
                        }
                    }
                }
                continue;
            }
            if chain.is_stale(item) {
                continue;
            }
            let Some(wrapper) = read_wrapper(chain, item) else {
                continue;
            };
            let Some(cp_item) = classpath_item_of(&wrapper) else {
                continue;
            };
            let Some(cached_cp) = cpm.get_cached(cp_item) else {
                continue;
            };

            // An exact-image hint eliminates non-matches cheaply, but the
            // classpath still has to validate.
            if let Some(hint) = cached_image {
                match chain.resolve(wrapper.rom_class) {
                    Some(image) if image == hint => {}
                    _ => continue,
                }
            }

            // Store-index fast path: the stored entry must be the caller's
            // entry at that index, with its recorded timestamp intact.
            if cpe_index >= 0 {
                let stored = cached_cp.entries.get(wrapper.cpe_index as usize);
                let test = caller.item_at(cpe_index as usize);
                match (stored, test) {
                    (Some(s), Some(t)) if s.path == t.path && s.protocol == t.protocol => {
                        if self.timestamps_enabled() && s.timestamp != t.timestamp {
                            return LocateOutcome::MarkCpeiStale {
                                stale: StaleRef {
                                    cp: cp_item,
                                    entry_index: wrapper.cpe_index as u32,
                                    path: s.path.clone(),
                                },
                            };
                        }
                    }
                    _ => continue,
                }
            }

            // Scope qualifiers.
            if partition.is_some()
                || mod_context.is_some()
                || raw == ItemType::ScopedRomClass as u16
            {
                match scm.validate(chain, partition, mod_context, item) {
                    ScopeMatch::Match => {}
                    ScopeMatch::NoMatch => continue,
                    ScopeMatch::Error => return LocateOutcome::NotFound { try_wait: false },
                }
            }

            let v = cpm.validate(chain, &cached_cp, wrapper.cpe_index, caller, confirmed_entries);
            if v.found_at >= 0 {
                // Directory-loaded classes carry a per-class stamp.
                if self.timestamps_enabled() && wrapper.timestamp != 0 {
                    if let Some(stored) = cached_cp.entries.get(wrapper.cpe_index as usize) {
                        if timestamp::check_class(stored, name, wrapper.timestamp).is_stale() {
                            return LocateOutcome::ClassTimestampChanged { item };
                        }
                    }
                }
                if cpm.touch_for_class_files(caller, name, v.found_at) {
                    return LocateOutcome::FoundShadow;
                }
                return LocateOutcome::Found {
                    item,
                    wrapper,
                    found_at_index: v.found_at,
                    stale: v.stale,
                };
            }
            if let Some(stale) = v.stale {
                return LocateOutcome::MarkCpeiStale { stale };
            }
        }

        if found_unmodified_orphan {
            // A peer has laid the image down but not yet committed its
            // metadata; suggest waiting for the whole update.
            return LocateOutcome::NotFound { try_wait: true };
        }
        LocateOutcome::NotFound { try_wait: false }
    }
}

/// Build an orphan/ROM-class wrapper payload. Orphans use the same shape
/// with a null classpath so promotion can fill the binding in place.
pub fn make_wrapper(
    rom_class: ShrOffset,
    rom_size: u32,
    classpath: Option<ShrOffset>,
    cpe_index: i32,
    class_timestamp: i64,
) -> RomClassWrapper {
    RomClassWrapper {
        rom_class,
        rom_size,
        cpe_index,
        classpath: classpath.unwrap_or(ShrOffset::NULL),
        timestamp: class_timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composite::{AllocKind, CompositeCache};
    use crate::config::MIN_CACHE_SIZE;
    use std::sync::Arc;

    // The full locate() paths are covered by the integration tests, which
    // can build real images. Here we exercise the bucket mechanics with
    // hand-rolled minimal images.

    fn test_chain(dir: &tempfile::TempDir) -> Chain {
        let cc = CompositeCache::create(
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
        .unwrap();
        cc.attach_jvm().unwrap();
        Chain::new(vec![Arc::new(cc)])
    }

    /// Minimal image: header + name UTF-8, no methods.
    fn image_bytes(name: &str) -> Vec<u8> {
        let name_at = romimage::CLASS_HEADER_SIZE;
        let total = (name_at + 2 + name.len() + 1 + 7) & !7;
        let mut buf = vec![0u8; total];
        buf[0..4].copy_from_slice(&(total as u32).to_ne_bytes());
        let srp = (name_at - romimage::OFF_NAME) as i32;
        buf[romimage::OFF_NAME..romimage::OFF_NAME + 4].copy_from_slice(&srp.to_ne_bytes());
        buf[name_at..name_at + 2].copy_from_slice(&(name.len() as u16).to_ne_bytes());
        buf[name_at + 2..name_at + 2 + name.len()].copy_from_slice(name.as_bytes());
        buf
    }

    fn store_image_item(chain: &Chain, ty: ItemType, name: &str) -> ItemRef {
        let cc = chain.top();
        cc.enter_write_mutex().unwrap();
        let img = image_bytes(name);
        let wrapper_size = core::mem::size_of::<RomClassWrapper>() as u32;
        let pending = cc
            .allocate(ty, wrapper_size, img.len() as u32, AllocKind::Block)
            .unwrap();
        let pending_segment = unsafe { cc.pending_segment(&pending) };
        pending_segment[..img.len()].copy_from_slice(&img);
        let rom_off = ShrOffset::new(0, pending.segment_offset);
        let wrapper = make_wrapper(rom_off, img.len() as u32, None, -1, 0);
        unsafe { cc.pending_data(&pending) }.copy_from_slice(bytemuck::bytes_of(&wrapper));
        let item = pending.item;
        cc.commit(pending, None);
        cc.exit_write_mutex().unwrap();
        item
    }

    #[test]
    fn test_store_new_indexes_by_image_name() {
        let dir = tempfile::tempdir().unwrap();
        let chain = test_chain(&dir);
        let m = RomClassManager::new(false);
        let item = store_image_item(&chain, ItemType::Orphan, "pkg/Foo");
        assert!(m.store_new(&chain, item));
        assert!(m.exists_class_for_name("pkg/Foo"));
        assert!(!m.exists_class_for_name("pkg/Bar"));
        assert_eq!(m.class_count(), 1);
    }

    #[test]
    fn test_reunite_replaces_orphan_slot() {
        let dir = tempfile::tempdir().unwrap();
        let chain = test_chain(&dir);
        let m = RomClassManager::new(false);
        let orphan = store_image_item(&chain, ItemType::Orphan, "pkg/Foo");
        m.store_new(&chain, orphan);

        // A RomClass item pointing at the same image.
        let orphan_wrapper = read_wrapper(&chain, orphan).unwrap();
        let cc = chain.top();
        cc.enter_write_mutex().unwrap();
        let wrapper = make_wrapper(orphan_wrapper.rom_class, orphan_wrapper.rom_size, Some(ShrOffset::new(0, 64)), 0, 0);
        let pending = cc
            .allocate(
                ItemType::RomClass,
                core::mem::size_of::<RomClassWrapper>() as u32,
                0,
                AllocKind::Block,
            )
            .unwrap();
        unsafe { cc.pending_data(&pending) }.copy_from_slice(bytemuck::bytes_of(&wrapper));
        let rc_item = pending.item;
        cc.commit(pending, None);
        cc.exit_write_mutex().unwrap();

        m.store_new(&chain, rc_item);
        // One bucket slot, now pointing at the RomClass item.
        let entries = m.entries_for("pkg/Foo");
        assert_eq!(entries, vec![rc_item]);
    }

    #[test]
    fn test_find_next_existing_walks_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let chain = test_chain(&dir);
        let m = RomClassManager::new(false);
        let a = store_image_item(&chain, ItemType::Orphan, "pkg/Foo");
        let b = store_image_item(&chain, ItemType::Orphan, "pkg/Foo");
        m.store_new(&chain, a);
        m.store_new(&chain, b);

        let (first, img1) = m.find_next_existing(&chain, "pkg/Foo", None).unwrap();
        assert_eq!(first, a);
        assert_eq!(
            unsafe { romimage::class_name(img1, chain.offsets()) },
            Ok(Some("pkg/Foo"))
        );
        let (second, _) = m.find_next_existing(&chain, "pkg/Foo", Some(first)).unwrap();
        assert_eq!(second, b);
        assert!(m.find_next_existing(&chain, "pkg/Foo", Some(second)).is_none());
    }

    #[test]
    fn test_wrapper_offset_outside_segment_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let chain = test_chain(&dir);
        let cc = chain.top();
        cc.enter_write_mutex().unwrap();
        // Wrapper pointing into the header region, not the segment area.
        let wrapper = make_wrapper(ShrOffset::new(0, 16), 8, None, -1, 0);
        let pending = cc
            .allocate(
                ItemType::RomClass,
                core::mem::size_of::<RomClassWrapper>() as u32,
                0,
                AllocKind::Block,
            )
            .unwrap();
        unsafe { cc.pending_data(&pending) }.copy_from_slice(bytemuck::bytes_of(&wrapper));
        let item = pending.item;
        cc.commit(pending, None);
        cc.exit_write_mutex().unwrap();

        assert!(read_wrapper(&chain, item).is_none());
        let m = RomClassManager::new(false);
        assert!(!m.store_new(&chain, item));
        assert!(chain.cache(0).unwrap().is_corrupt());
        assert_eq!(
            chain.cache(0).unwrap().corruption_info().0,
            crate::error::CorruptionCode::BoundsViolation
        );
    }

    #[test]
    fn test_bad_name_srp_marks_layer_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let chain = test_chain(&dir);
        let item = store_image_item(&chain, ItemType::Orphan, "pkg/Foo");

        // Smash the image's name SRP so it escapes every attached range.
        let wrapper = read_wrapper(&chain, item).unwrap();
        let cc = chain.top();
        cc.enter_write_mutex().unwrap();
        unsafe {
            let name_site = cc
                .base()
                .add(wrapper.rom_class.offset as usize + romimage::OFF_NAME);
            core::ptr::write_unaligned(name_site as *mut i32, i32::MAX / 2);
        }
        cc.exit_write_mutex().unwrap();

        let m = RomClassManager::new(false);
        assert!(!m.store_new(&chain, item));
        assert!(chain.cache(0).unwrap().is_corrupt());
        assert_eq!(
            chain.cache(0).unwrap().corruption_info().0,
            crate::error::CorruptionCode::SrpOutOfRange
        );
    }

    #[test]
    fn test_locate_empty_bucket_suggests_wait() {
        let dir = tempfile::tempdir().unwrap();
        let chain = test_chain(&dir);
        let m = RomClassManager::new(false);
        let cpm = ClasspathManager::new(false);
        let scm = ScopeManager::new();
        let caller = ClasspathItem::classpath(1, vec![crate::classpath::ClasspathEntry::jar("/a.jar", 1)]);
        match m.locate(&chain, &cpm, &scm, "pkg/Nope", &caller, -1, -1, None, None, None) {
            LocateOutcome::NotFound { try_wait } => assert!(try_wait),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_locate_orphan_only_suggests_wait() {
        let dir = tempfile::tempdir().unwrap();
        let chain = test_chain(&dir);
        let m = RomClassManager::new(false);
        let cpm = ClasspathManager::new(false);
        let scm = ScopeManager::new();
        let orphan = store_image_item(&chain, ItemType::Orphan, "pkg/Foo");
        m.store_new(&chain, orphan);
        let caller = ClasspathItem::classpath(1, vec![crate::classpath::ClasspathEntry::jar("/a.jar", 1)]);
        match m.locate(&chain, &cpm, &scm, "pkg/Foo", &caller, -1, -1, None, None, None) {
            LocateOutcome::NotFound { try_wait } => assert!(try_wait),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }
}
