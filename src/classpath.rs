//! Classpaths: the caller-side classpath description, its serialized form
//! in the cache, and the classpath manager.
//!
//! The manager indexes classpath items by entry path: each known entry maps
//! to the list of cached classpaths containing it. `validate` decides
//! whether a ROM class found under a cached classpath is a legal hit for a
//! caller's classpath, combining the index-monotonicity rule with timestamp
//! checks. A per-process "identified classpaths" array short-circuits
//! repeat positive matches by classloader id.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI32, Ordering};

use bytemuck::Zeroable;
use log::{debug, trace};
use parking_lot::Mutex;

use crate::chain::Chain;
use crate::config::NOT_STALE;
use crate::item::{ClasspathWrapper, ItemRef};
use crate::timestamp;

/// How an entry's bytes are reached on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Protocol {
    Dir = 1,
    Jar = 2,
    Token = 3,
}

impl Protocol {
    pub fn from_raw(raw: u32) -> Option<Protocol> {
        Some(match raw {
            1 => Protocol::Dir,
            2 => Protocol::Jar,
            3 => Protocol::Token,
            _ => return None,
        })
    }
}

/// One element of a search path with its recorded timestamp.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClasspathEntry {
    pub path: String,
    pub protocol: Protocol,
    pub timestamp: i64,
}

impl ClasspathEntry {
    pub fn jar(path: impl Into<String>, timestamp: i64) -> ClasspathEntry {
        ClasspathEntry { path: path.into(), protocol: Protocol::Jar, timestamp }
    }

    pub fn dir(path: impl Into<String>, timestamp: i64) -> ClasspathEntry {
        ClasspathEntry { path: path.into(), protocol: Protocol::Dir, timestamp }
    }

    fn same_location(&self, other: &ClasspathEntry) -> bool {
        self.protocol == other.protocol && self.path == other.path
    }
}

/// Discriminates classpath-shaped, URL-shaped and token-shaped items.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ClasspathKind {
    Classpath = 1,
    Url = 2,
    Token = 3,
}

impl ClasspathKind {
    pub fn from_raw(raw: u32) -> Option<ClasspathKind> {
        Some(match raw {
            1 => ClasspathKind::Classpath,
            2 => ClasspathKind::Url,
            3 => ClasspathKind::Token,
            _ => return None,
        })
    }
}

/// A caller classloader's search path. Owned by the caller; never aliased
/// into the cache.
#[derive(Debug)]
pub struct ClasspathItem {
    pub kind: ClasspathKind,
    /// Classloader id for the identified-classpath cache.
    pub helper_id: i32,
    pub entries: Vec<ClasspathEntry>,
    /// Highest index whose archive is known locked by the classloader;
    /// timestamp checks may start above it.
    jars_locked_to_index: AtomicI32,
}

impl ClasspathItem {
    pub fn new(kind: ClasspathKind, helper_id: i32, entries: Vec<ClasspathEntry>) -> ClasspathItem {
        ClasspathItem { kind, helper_id, entries, jars_locked_to_index: AtomicI32::new(-1) }
    }

    /// A classpath of jars/dirs for an ordinary classloader.
    pub fn classpath(helper_id: i32, entries: Vec<ClasspathEntry>) -> ClasspathItem {
        ClasspathItem::new(ClasspathKind::Classpath, helper_id, entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn item_at(&self, index: usize) -> Option<&ClasspathEntry> {
        self.entries.get(index)
    }

    /// First index holding `entry`'s location, or -1.
    pub fn find(&self, entry: &ClasspathEntry) -> i32 {
        self.entries
            .iter()
            .position(|e| e.same_location(entry))
            .map_or(-1, |i| i as i32)
    }

    pub fn jars_locked_to_index(&self) -> i32 {
        self.jars_locked_to_index.load(Ordering::Relaxed)
    }

    pub fn set_jars_locked_to_index(&self, index: i32) {
        self.jars_locked_to_index.store(index, Ordering::Relaxed);
    }

    /// Order-insensitive location hash; equal classpaths agree, and a
    /// mismatch proves inequality cheaply.
    pub fn hashcode(&self) -> u32 {
        hash_entries(self.entries.iter())
    }
}

fn hash_entries<'a>(entries: impl Iterator<Item = &'a ClasspathEntry>) -> u32 {
    let mut h: u32 = 0x811c_9dc5;
    for e in entries {
        for b in e.path.as_bytes() {
            h ^= *b as u32;
            h = h.wrapping_mul(0x0100_0193);
        }
        h ^= e.protocol as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

// ---- serialized form ----

/// Serialize a caller classpath into a `Classpath` item payload.
pub fn serialize_classpath(cp: &ClasspathItem) -> Vec<u8> {
    let wrapper = ClasspathWrapper {
        stale_from_index: NOT_STALE,
        entry_count: cp.entries.len() as u32,
        cp_type: cp.kind as u32,
        hashcode: cp.hashcode(),
    };
    let mut out = Vec::new();
    out.extend_from_slice(bytemuck::bytes_of(&wrapper));
    for e in &cp.entries {
        out.extend_from_slice(&e.timestamp.to_ne_bytes());
        out.extend_from_slice(&(e.protocol as u32).to_ne_bytes());
        out.extend_from_slice(&(e.path.len() as u32).to_ne_bytes());
        out.extend_from_slice(e.path.as_bytes());
        while out.len() % 8 != 0 {
            out.push(0);
        }
    }
    out
}

/// Parse a `Classpath` item payload back into entries.
pub fn parse_classpath(data: &[u8]) -> Option<(ClasspathWrapper, Vec<ClasspathEntry>)> {
    let wrapper_size = core::mem::size_of::<ClasspathWrapper>();
    if data.len() < wrapper_size {
        return None;
    }
    let mut wrapper = ClasspathWrapper::zeroed();
    bytemuck::bytes_of_mut(&mut wrapper).copy_from_slice(&data[..wrapper_size]);

    let mut entries = Vec::with_capacity(wrapper.entry_count as usize);
    let mut pos = wrapper_size;
    for _ in 0..wrapper.entry_count {
        let timestamp = i64::from_ne_bytes(data.get(pos..pos + 8)?.try_into().ok()?);
        let protocol = u32::from_ne_bytes(data.get(pos + 8..pos + 12)?.try_into().ok()?);
        let path_len = u32::from_ne_bytes(data.get(pos + 12..pos + 16)?.try_into().ok()?) as usize;
        let path = std::str::from_utf8(data.get(pos + 16..pos + 16 + path_len)?).ok()?;
        entries.push(ClasspathEntry {
            path: path.to_owned(),
            protocol: Protocol::from_raw(protocol)?,
            timestamp,
        });
        pos = (pos + 16 + path_len + 7) & !7;
    }
    Some((wrapper, entries))
}

/// Current `stale_from_index` of a cached classpath, read from the mapping.
pub fn stale_from_index(chain: &Chain, cp_item: ItemRef) -> u32 {
    let Some(cc) = chain.cache(cp_item.layer) else {
        return NOT_STALE;
    };
    // SAFETY: field 0 of the wrapper at the committed item's payload.
    unsafe {
        core::ptr::read_volatile(cc.base().add(cp_item.data_offset() as usize) as *const u32)
    }
}

/// Lower a cached classpath's `stale_from_index` in place. Caller holds the
/// write mutex of the owning layer.
pub fn set_stale_from_index(chain: &Chain, cp_item: ItemRef, index: u32) {
    let Some(cc) = chain.cache(cp_item.layer) else {
        return;
    };
    debug_assert!(cc.has_write_mutex());
    let current = stale_from_index(chain, cp_item);
    if index < current {
        // SAFETY: field 0 of the wrapper; write mutex held.
        unsafe {
            core::ptr::write_volatile(
                cc.base().add(cp_item.data_offset() as usize) as *mut u32,
                index,
            )
        };
    }
}

// ---- manager ----

/// Parsed, in-process view of one cached classpath.
#[derive(Debug)]
pub struct CachedClasspath {
    pub item: ItemRef,
    pub kind: ClasspathKind,
    pub hashcode: u32,
    pub entries: Vec<ClasspathEntry>,
}

impl CachedClasspath {
    /// First index <= `max_index` holding `entry`'s location, or -1.
    fn find_up_to(&self, entry: &ClasspathEntry, max_index: usize) -> i32 {
        self.entries
            .iter()
            .take(max_index + 1)
            .position(|e| e.same_location(entry))
            .map_or(-1, |i| i as i32)
    }
}

/// A classpath entry in the cache that failed its timestamp check, handed
/// back to the caller to be marked stale under the write mutex.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaleRef {
    pub cp: ItemRef,
    pub entry_index: u32,
    pub path: String,
}

/// Outcome of [`ClasspathManager::update`].
#[derive(Debug)]
pub enum UpdateOutcome {
    /// An identical, fresh classpath already in the cache.
    Existing(std::sync::Arc<CachedClasspath>),
    /// An identical classpath exists but one entry's timestamp moved; the
    /// caller must mark it and write a fresh classpath.
    StaleDetected(StaleRef),
    /// Nothing comparable cached.
    NotFound,
}

/// Result of [`ClasspathManager::validate`]: `found_at < 0` fails the find.
#[derive(Debug)]
pub struct Validation {
    pub found_at: i32,
    pub stale: Option<StaleRef>,
}

/// Container-state flags per entry path, driven by zip-open notifications.
pub const ENTRY_STATE_OPEN: u32 = 0x1;
pub const ENTRY_STATE_CLOSED: u32 = 0x2;
pub const ENTRY_STATE_FORCE_CHECK: u32 = 0x4;
pub const ENTRY_STATE_TIMESTAMP_ONCE: u32 = 0x8;

#[derive(Clone, Copy, Debug, Default)]
struct EntryState {
    flags: u32,
    stamped_once: bool,
}

/// Where a path appears inside a cached classpath.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryUse {
    pub cp: ItemRef,
    pub index: u32,
}

#[derive(Default)]
struct Identified {
    matched: Vec<(i32, ItemRef)>,
    failed: HashSet<(i32, ItemRef)>,
}

/// The classpath manager. Lazily started; rebuilt on crash recovery.
#[derive(Default)]
pub struct ClasspathManager {
    by_entry: Mutex<HashMap<String, Vec<EntryUse>>>,
    cached: Mutex<HashMap<ItemRef, std::sync::Arc<CachedClasspath>>>,
    entry_state: Mutex<HashMap<String, EntryState>>,
    /// Same-JVM positive-match cache; own mutex per the lock order.
    identified: Mutex<Identified>,
    timestamp_checks: std::sync::atomic::AtomicBool,
}

impl ClasspathManager {
    pub fn new(timestamp_checks: bool) -> ClasspathManager {
        let m = ClasspathManager::default();
        m.timestamp_checks.store(timestamp_checks, Ordering::Relaxed);
        m
    }

    fn timestamps_enabled(&self) -> bool {
        self.timestamp_checks.load(Ordering::Relaxed)
    }

    /// Index one `Classpath` item encountered by the scanner.
    pub fn store_new(&self, chain: &Chain, item: ItemRef) -> bool {
        let Some(data) = chain.item_data(item) else {
            return false;
        };
        let Some((wrapper, entries)) = parse_classpath(data) else {
            return false;
        };
        let Some(kind) = ClasspathKind::from_raw(wrapper.cp_type) else {
            return false;
        };
        let mut by_entry = self.by_entry.lock();
        for (i, e) in entries.iter().enumerate() {
            by_entry
                .entry(e.path.clone())
                .or_default()
                .push(EntryUse { cp: item, index: i as u32 });
        }
        drop(by_entry);
        self.cached.lock().insert(
            item,
            std::sync::Arc::new(CachedClasspath {
                item,
                kind,
                hashcode: wrapper.hashcode,
                entries,
            }),
        );
        trace!("classpath manager indexed item at {}:{}", item.layer, item.start);
        true
    }

    pub fn reset(&self) {
        self.by_entry.lock().clear();
        self.cached.lock().clear();
        self.identified.lock().matched.clear();
        self.identified.lock().failed.clear();
    }

    pub fn cached_count(&self) -> usize {
        self.cached.lock().len()
    }

    pub fn get_cached(&self, item: ItemRef) -> Option<std::sync::Arc<CachedClasspath>> {
        self.cached.lock().get(&item).cloned()
    }

    /// Everywhere `path` appears in cached classpaths.
    pub fn uses_of(&self, path: &str) -> Vec<EntryUse> {
        self.by_entry.lock().get(path).cloned().unwrap_or_default()
    }

    /// Container state notifications from the zip-open hook.
    pub fn notify_state_change(&self, path: &str, flags: u32) {
        let mut states = self.entry_state.lock();
        let st = states.entry(path.to_owned()).or_default();
        st.flags = flags;
        if flags & ENTRY_STATE_TIMESTAMP_ONCE == 0 {
            st.stamped_once = false;
        }
    }

    /// True when this probe may be skipped (timestamp-once entries after
    /// their first probe, unless force-check is set).
    fn skip_stamp(&self, path: &str) -> bool {
        let mut states = self.entry_state.lock();
        let Some(st) = states.get_mut(path) else {
            return false;
        };
        if st.flags & ENTRY_STATE_FORCE_CHECK != 0 {
            return false;
        }
        if st.flags & ENTRY_STATE_TIMESTAMP_ONCE != 0 {
            if st.stamped_once {
                return true;
            }
            st.stamped_once = true;
        }
        false
    }

    fn is_cp_stale(&self, chain: &Chain, cached: &CachedClasspath) -> bool {
        chain.is_stale(cached.item) || stale_from_index(chain, cached.item) != NOT_STALE
    }

    /// Before storing a ROM class: is an identical, fresh classpath already
    /// cached? A timestamp mismatch on the identical match is reported so
    /// the caller can mark it stale and write a replacement.
    pub fn update(&self, chain: &Chain, cp: &ClasspathItem, cpe_index: i32) -> UpdateOutcome {
        let hash = cp.hashcode();
        let candidates: Vec<_> = self.cached.lock().values().cloned().collect();
        for cached in candidates {
            if cached.kind != cp.kind
                || cached.hashcode != hash
                || cached.entries.is_empty()
                || cached.entries.len() != cp.entries.len()
                || self.is_cp_stale(chain, &cached)
            {
                continue;
            }
            if !cached
                .entries
                .iter()
                .zip(cp.entries.iter())
                .all(|(a, b)| a.same_location(b))
            {
                continue;
            }
            // Identical locations. Timestamps up to and including the store
            // index must still hold.
            if self.timestamps_enabled() && cp.kind != ClasspathKind::Token {
                let check_to = (cpe_index.max(0) as usize).min(cached.entries.len() - 1);
                for i in 0..=check_to {
                    let e = &cached.entries[i];
                    // Directory entries are stamped per class, not here.
                    if e.protocol == Protocol::Dir {
                        continue;
                    }
                    if !self.skip_stamp(&e.path) && timestamp::check_entry(e).is_stale() {
                        debug!("classpath update: entry {} went stale", e.path);
                        return UpdateOutcome::StaleDetected(StaleRef {
                            cp: cached.item,
                            entry_index: i as u32,
                            path: e.path.clone(),
                        });
                    }
                }
            }
            return UpdateOutcome::Existing(cached);
        }
        UpdateOutcome::NotFound
    }

    fn is_identified(&self, helper_id: i32, cp: ItemRef) -> bool {
        self.identified.lock().matched.contains(&(helper_id, cp))
    }

    fn has_match_failed_before(&self, helper_id: i32, cp: ItemRef) -> bool {
        self.identified.lock().failed.contains(&(helper_id, cp))
    }

    fn store_identified(&self, helper_id: i32, cp: ItemRef) {
        let mut id = self.identified.lock();
        if !id.matched.contains(&(helper_id, cp)) {
            id.matched.push((helper_id, cp));
        }
    }

    fn register_failed_match(&self, helper_id: i32, cp: ItemRef) {
        self.identified.lock().failed.insert((helper_id, cp));
    }

    /// Is a ROM class stored at `cpe_index` of `cached_cp` a legal hit for
    /// `caller`? The cached entry must appear in the caller's path at an
    /// index no later than where it was stored, every entry left of the
    /// match must be consistent, and all involved timestamps must hold.
    pub fn validate(
        &self,
        chain: &Chain,
        cached_cp: &CachedClasspath,
        cpe_index: i32,
        caller: &ClasspathItem,
        confirmed_entries: i32,
    ) -> Validation {
        let fail = |stale: Option<StaleRef>| Validation { found_at: -1, stale };

        if self.is_cp_stale(chain, cached_cp) {
            return fail(None);
        }
        let test_index = cpe_index as usize;
        let Some(test_entry) = cached_cp.entries.get(test_index) else {
            return fail(None);
        };

        let index_in_caller = caller.find(test_entry);
        if index_in_caller < 0 || index_in_caller as usize > test_index {
            if caller.kind == ClasspathKind::Classpath {
                self.register_failed_match(caller.helper_id, cached_cp.item);
            }
            return fail(None);
        }

        // Tokens prove success by presence alone; a token path has exactly
        // one entry.
        if caller.kind == ClasspathKind::Token {
            return if index_in_caller == 0 {
                Validation { found_at: 0, stale: None }
            } else {
                fail(None)
            };
        }

        let identified = self.is_identified(caller.helper_id, cached_cp.item);
        if !identified && self.has_match_failed_before(caller.helper_id, cached_cp.item) {
            return fail(None);
        }

        // Worth trying to identify the whole classpath? Same shape, match
        // at the same index, not part-stale. A hashcode match is a hint,
        // not a guarantee.
        let mut try_identify = !identified
            && caller.kind == ClasspathKind::Classpath
            && cached_cp.kind == ClasspathKind::Classpath
            && index_in_caller as usize == test_index
            && caller.entries.len() == cached_cp.entries.len()
            && caller.hashcode() == cached_cp.hashcode;

        let mut stale: Option<StaleRef> = None;
        let walk_to = if try_identify {
            caller.entries.len() - 1
        } else {
            index_in_caller as usize
        };

        for i in (0..=walk_to).rev() {
            let walk_entry = &caller.entries[i];
            let mut idx_in_cached = -1;
            if try_identify {
                idx_in_cached = cached_cp.find_up_to(walk_entry, i);
                if idx_in_cached != i as i32 {
                    // Identification failed; fall back to match mode.
                    try_identify = false;
                }
            }
            if !try_identify {
                if i > index_in_caller as usize {
                    // Entries right of the match don't matter once we gave
                    // up identifying.
                    continue;
                }
                idx_in_cached = cached_cp.find_up_to(walk_entry, test_index);
            }
            if idx_in_cached < 0 {
                if caller.kind == ClasspathKind::Classpath {
                    self.register_failed_match(caller.helper_id, cached_cp.item);
                }
                return fail(stale);
            }
            if self.timestamps_enabled() {
                let cached_entry = &cached_cp.entries[idx_in_cached as usize];
                // Directory entries are stamped per class, not here.
                if cached_entry.protocol != Protocol::Dir
                    && !self.skip_stamp(&cached_entry.path)
                    && timestamp::check_entry(cached_entry).is_stale()
                {
                    if stale.is_none() {
                        stale = Some(StaleRef {
                            cp: cached_cp.item,
                            entry_index: idx_in_cached as u32,
                            path: cached_entry.path.clone(),
                        });
                    }
                    // Never identify a classpath we just found stale.
                    try_identify = false;
                    // Only entries at or left of the match fail the find.
                    if i <= index_in_caller as usize {
                        return fail(stale);
                    }
                }
            }
        }

        if try_identify && caller.kind == ClasspathKind::Classpath {
            self.store_identified(caller.helper_id, cached_cp.item);
        }

        let mut found_at = index_in_caller;
        // An unconfirmed entry can never satisfy the caller.
        if confirmed_entries >= 0 && found_at >= confirmed_entries {
            found_at = -1;
        }
        Validation { found_at, stale }
    }

    /// Shadow probe: does a loose `.class` file exist under any directory
    /// entry strictly left of `to_index` in the caller's path? Such a file
    /// shadows the cached class.
    pub fn touch_for_class_files(&self, caller: &ClasspathItem, class_name: &str, to_index: i32) -> bool {
        if to_index <= 0 {
            return false;
        }
        for e in caller.entries.iter().take(to_index as usize) {
            if e.protocol == Protocol::Dir
                && timestamp::class_file_path(&e.path, class_name).exists()
            {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cp(entries: Vec<ClasspathEntry>) -> ClasspathItem {
        ClasspathItem::classpath(1, entries)
    }

    #[test]
    fn test_serialize_parse_round_trip() {
        let item = cp(vec![
            ClasspathEntry::jar("/a.jar", 1000),
            ClasspathEntry::dir("/d", 0),
        ]);
        let bytes = serialize_classpath(&item);
        assert_eq!(bytes.len() % 8, 0);
        let (wrapper, entries) = parse_classpath(&bytes).unwrap();
        assert_eq!(wrapper.entry_count, 2);
        assert_eq!(wrapper.stale_from_index, NOT_STALE);
        assert_eq!(wrapper.hashcode, item.hashcode());
        assert_eq!(entries, item.entries);
    }

    #[test]
    fn test_find_and_hashcode() {
        let item = cp(vec![
            ClasspathEntry::jar("/a.jar", 1),
            ClasspathEntry::jar("/b.jar", 2),
        ]);
        assert_eq!(item.find(&ClasspathEntry::jar("/b.jar", 999)), 1);
        // Timestamps do not participate in location identity.
        assert_eq!(item.find(&ClasspathEntry::dir("/b.jar", 2)), -1);
        let same = cp(vec![
            ClasspathEntry::jar("/a.jar", 50),
            ClasspathEntry::jar("/b.jar", 60),
        ]);
        assert_eq!(item.hashcode(), same.hashcode());
    }

    // validate() against a hand-built CachedClasspath; timestamp checks
    // disabled so no filesystem is involved.
    fn cached_from(item: &ClasspathItem) -> CachedClasspath {
        CachedClasspath {
            item: ItemRef { layer: 0, start: 0x100 },
            kind: item.kind,
            hashcode: item.hashcode(),
            entries: item.entries.clone(),
        }
    }

    fn manager_no_ts() -> ClasspathManager {
        ClasspathManager::new(false)
    }

    // A chain is only consulted for staleness, which these tests avoid by
    // building a tiny real cache.
    fn test_chain(dir: &tempfile::TempDir) -> Chain {
        let cc = crate::composite::CompositeCache::create(
            &dir.path().join("l0.shc"),
            0,
            crate::config::MIN_CACHE_SIZE * 2,
            None,
            0,
            0,
            None,
            0,
            None,
            false,
        )
        .unwrap();
        Chain::new(vec![std::sync::Arc::new(cc)])
    }

    fn store_cp(chain: &Chain, item: &ClasspathItem) -> ItemRef {
        let cc = chain.top();
        cc.attach_jvm().unwrap();
        cc.enter_write_mutex().unwrap();
        let bytes = serialize_classpath(item);
        let pending = cc
            .allocate(crate::item::ItemType::Classpath, bytes.len() as u32, 0, crate::composite::AllocKind::Block)
            .unwrap();
        unsafe { cc.pending_data(&pending) }.copy_from_slice(&bytes);
        let item_ref = pending.item;
        cc.commit(pending, None);
        cc.exit_write_mutex().unwrap();
        item_ref
    }

    #[test]
    fn test_validate_same_classpath_identifies() {
        let dir = tempfile::tempdir().unwrap();
        let chain = test_chain(&dir);
        let caller = cp(vec![
            ClasspathEntry::jar("/a.jar", 1),
            ClasspathEntry::jar("/b.jar", 2),
        ]);
        let item_ref = store_cp(&chain, &caller);
        let m = manager_no_ts();
        assert!(m.store_new(&chain, item_ref));
        let cached = m.get_cached(item_ref).unwrap();

        let v = m.validate(&chain, &cached, 1, &caller, -1);
        assert_eq!(v.found_at, 1);
        assert!(v.stale.is_none());
        assert!(m.is_identified(caller.helper_id, item_ref));
        // The identified fast path agrees.
        let v2 = m.validate(&chain, &cached, 1, &caller, -1);
        assert_eq!(v2.found_at, 1);
    }

    #[test]
    fn test_validate_rejects_entry_further_right() {
        let dir = tempfile::tempdir().unwrap();
        let chain = test_chain(&dir);
        // Stored with /b.jar at index 0; caller has it at index 1 after an
        // extra leading entry, so something shadows to the left.
        let stored = cp(vec![ClasspathEntry::jar("/b.jar", 2)]);
        let item_ref = store_cp(&chain, &stored);
        let m = manager_no_ts();
        m.store_new(&chain, item_ref);
        let cached = m.get_cached(item_ref).unwrap();

        let caller = cp(vec![
            ClasspathEntry::jar("/a.jar", 1),
            ClasspathEntry::jar("/b.jar", 2),
        ]);
        let v = m.validate(&chain, &cached, 0, &caller, -1);
        assert_eq!(v.found_at, -1);
        // Failed matches are remembered.
        assert!(m.has_match_failed_before(caller.helper_id, item_ref));
    }

    #[test]
    fn test_validate_prefix_match_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let chain = test_chain(&dir);
        let stored = cp(vec![
            ClasspathEntry::jar("/a.jar", 1),
            ClasspathEntry::jar("/b.jar", 2),
            ClasspathEntry::jar("/c.jar", 3),
        ]);
        let item_ref = store_cp(&chain, &stored);
        let m = manager_no_ts();
        m.store_new(&chain, item_ref);
        let cached = m.get_cached(item_ref).unwrap();

        // Caller's shorter path shares the prefix; class stored at index 1.
        let caller = cp(vec![
            ClasspathEntry::jar("/a.jar", 1),
            ClasspathEntry::jar("/b.jar", 2),
        ]);
        let v = m.validate(&chain, &cached, 1, &caller, -1);
        assert_eq!(v.found_at, 1);
    }

    #[test]
    fn test_confirmed_entries_cut_off() {
        let dir = tempfile::tempdir().unwrap();
        let chain = test_chain(&dir);
        let caller = cp(vec![
            ClasspathEntry::jar("/a.jar", 1),
            ClasspathEntry::jar("/b.jar", 2),
        ]);
        let item_ref = store_cp(&chain, &caller);
        let m = manager_no_ts();
        m.store_new(&chain, item_ref);
        let cached = m.get_cached(item_ref).unwrap();

        // Found at index 1 but only 1 entry confirmed: no hit.
        let v = m.validate(&chain, &cached, 1, &caller, 1);
        assert_eq!(v.found_at, -1);
        let v = m.validate(&chain, &cached, 1, &caller, 2);
        assert_eq!(v.found_at, 1);
    }

    #[test]
    fn test_update_detects_timestamp_change() {
        let dir = tempfile::tempdir().unwrap();
        let chain = test_chain(&dir);
        let jar = dir.path().join("a.jar");
        std::fs::write(&jar, b"x").unwrap();
        let mtime = crate::platform::last_modified(&jar);

        let caller = cp(vec![ClasspathEntry::jar(jar.to_str().unwrap(), mtime)]);
        let item_ref = store_cp(&chain, &caller);
        let m = ClasspathManager::new(true);
        m.store_new(&chain, item_ref);

        match m.update(&chain, &caller, 0) {
            UpdateOutcome::Existing(c) => assert_eq!(c.item, item_ref),
            other => panic!("expected Existing, got {other:?}"),
        }

        // Record a different timestamp in a new manager view to simulate
        // the jar moving on disk relative to the cached value.
        let stale_caller = cp(vec![ClasspathEntry::jar(jar.to_str().unwrap(), mtime + 10)]);
        let stale_ref = store_cp(&chain, &stale_caller);
        let m2 = ClasspathManager::new(true);
        m2.store_new(&chain, stale_ref);
        match m2.update(&chain, &stale_caller, 0) {
            UpdateOutcome::StaleDetected(s) => {
                assert_eq!(s.cp, stale_ref);
                assert_eq!(s.entry_index, 0);
            }
            other => panic!("expected StaleDetected, got {other:?}"),
        }
    }

    #[test]
    fn test_stale_from_index_write() {
        let dir = tempfile::tempdir().unwrap();
        let chain = test_chain(&dir);
        let caller = cp(vec![ClasspathEntry::jar("/a.jar", 5)]);
        let item_ref = store_cp(&chain, &caller);
        assert_eq!(stale_from_index(&chain, item_ref), NOT_STALE);

        let cc = chain.top();
        cc.enter_write_mutex().unwrap();
        set_stale_from_index(&chain, item_ref, 3);
        set_stale_from_index(&chain, item_ref, 7); // never raises
        cc.exit_write_mutex().unwrap();
        assert_eq!(stale_from_index(&chain, item_ref), 3);

        // A part-stale classpath fails validation outright.
        let m = manager_no_ts();
        m.store_new(&chain, item_ref);
        let cached = m.get_cached(item_ref).unwrap();
        let v = m.validate(&chain, &cached, 0, &caller, -1);
        assert_eq!(v.found_at, -1);
    }

    #[test]
    fn test_uses_of_indexes_every_containing_classpath() {
        let dir = tempfile::tempdir().unwrap();
        let chain = test_chain(&dir);
        let a = cp(vec![ClasspathEntry::jar("/a.jar", 1)]);
        let b = cp(vec![
            ClasspathEntry::jar("/z.jar", 9),
            ClasspathEntry::jar("/a.jar", 1),
        ]);
        let ra = store_cp(&chain, &a);
        let rb = store_cp(&chain, &b);
        let m = manager_no_ts();
        m.store_new(&chain, ra);
        m.store_new(&chain, rb);

        let uses = m.uses_of("/a.jar");
        assert_eq!(uses.len(), 2);
        assert!(uses.contains(&EntryUse { cp: ra, index: 0 }));
        assert!(uses.contains(&EntryUse { cp: rb, index: 1 }));
    }

    #[test]
    fn test_touch_for_class_files_shadow() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("pkg");
        std::fs::create_dir(&pkg).unwrap();
        std::fs::write(pkg.join("Foo.class"), b"bytes").unwrap();

        let caller = cp(vec![
            ClasspathEntry::dir(dir.path().to_str().unwrap(), 0),
            ClasspathEntry::jar("/a.jar", 1),
        ]);
        let m = manager_no_ts();
        // Class found at index 1; the directory at index 0 shadows it.
        assert!(m.touch_for_class_files(&caller, "pkg/Foo", 1));
        assert!(!m.touch_for_class_files(&caller, "pkg/Other", 1));
        // Found at index 0: nothing to the left.
        assert!(!m.touch_for_class_files(&caller, "pkg/Foo", 0));
    }

    #[test]
    fn test_timestamp_once_state() {
        let m = ClasspathManager::new(true);
        m.notify_state_change("/a.jar", ENTRY_STATE_OPEN | ENTRY_STATE_TIMESTAMP_ONCE);
        assert!(!m.skip_stamp("/a.jar")); // first probe runs
        assert!(m.skip_stamp("/a.jar")); // further probes skipped
        m.notify_state_change("/a.jar", ENTRY_STATE_OPEN | ENTRY_STATE_FORCE_CHECK);
        assert!(!m.skip_stamp("/a.jar"));
    }
}
