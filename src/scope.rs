//! Scope manager: interns UTF-8 scope strings (partitions, modification
//! contexts, prerequisite-cache ids) and validates scoped ROM classes.

use std::collections::HashMap;

use bytemuck::Zeroable;
use parking_lot::Mutex;

use crate::chain::Chain;
use crate::item::{ItemRef, ItemType, ScopedRomClassWrapper};
use crate::offset::ShrOffset;

/// Verdict of matching a caller's partition/mod-context pair against a
/// candidate item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeMatch {
    Match,
    NoMatch,
    Error,
}

/// Maps scope strings to their interned cache offsets. `Scope` and
/// `PrereqCache` items share the payload shape (a bare UTF-8), so both are
/// indexed here; prerequisite ids are additionally remembered per layer.
#[derive(Default)]
pub struct ScopeManager {
    by_value: Mutex<HashMap<String, ShrOffset>>,
    prereq_by_layer: Mutex<HashMap<u32, String>>,
}

impl ScopeManager {
    pub fn new() -> ScopeManager {
        ScopeManager::default()
    }

    /// Index one `Scope` or `PrereqCache` item encountered by the scanner.
    pub fn store_new(&self, chain: &Chain, item: ItemRef, item_type: ItemType) -> bool {
        let Some(data) = chain.item_data(item) else {
            return false;
        };
        let Some(s) = crate::item::read_utf8(data) else {
            return false;
        };
        self.by_value
            .lock()
            .entry(s.to_owned())
            .or_insert_with(|| item.data_shr_offset());
        if item_type == ItemType::PrereqCache {
            self.prereq_by_layer.lock().insert(item.layer, s.to_owned());
        }
        true
    }

    pub fn reset(&self) {
        self.by_value.lock().clear();
        self.prereq_by_layer.lock().clear();
    }

    /// Cache offset of an interned scope string.
    pub fn find(&self, scope: &str) -> Option<ShrOffset> {
        self.by_value.lock().get(scope).copied()
    }

    pub fn scope_count(&self) -> usize {
        self.by_value.lock().len()
    }

    /// The prerequisite-cache id recorded in `layer`, if any.
    pub fn prereq_id_of(&self, layer: u32) -> Option<String> {
        self.prereq_by_layer.lock().get(&layer).cloned()
    }

    /// Does `item` carry exactly the caller's partition and mod-context?
    /// Unscoped callers only accept unscoped items and the reverse.
    pub fn validate(
        &self,
        chain: &Chain,
        partition: Option<&str>,
        mod_context: Option<&str>,
        item: ItemRef,
    ) -> ScopeMatch {
        let raw = match chain.item_type_raw(item) {
            Some(raw) => raw,
            None => return ScopeMatch::Error,
        };
        if raw != ItemType::ScopedRomClass as u16 {
            // A plain ROM class only satisfies an unscoped caller.
            return if partition.is_none() && mod_context.is_none() {
                ScopeMatch::Match
            } else {
                ScopeMatch::NoMatch
            };
        }
        let Some(data) = chain.item_data(item) else {
            return ScopeMatch::Error;
        };
        let size = core::mem::size_of::<ScopedRomClassWrapper>();
        if data.len() < size {
            return ScopeMatch::Error;
        }
        let mut wrapper = ScopedRomClassWrapper::zeroed();
        bytemuck::bytes_of_mut(&mut wrapper).copy_from_slice(&data[..size]);

        let matches_one = |want: Option<&str>, off: ShrOffset| -> Option<bool> {
            match (want, off.is_null()) {
                (None, true) => Some(true),
                (None, false) | (Some(_), true) => Some(false),
                (Some(s), false) => Some(chain.utf8_at(off)? == s),
            }
        };
        match (
            matches_one(partition, wrapper.partition),
            matches_one(mod_context, wrapper.mod_context),
        ) {
            (Some(true), Some(true)) => ScopeMatch::Match,
            (None, _) | (_, None) => ScopeMatch::Error,
            _ => ScopeMatch::NoMatch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composite::{AllocKind, CompositeCache};
    use crate::config::MIN_CACHE_SIZE;
    use std::sync::Arc;

    fn test_chain(dir: &tempfile::TempDir) -> Chain {
        let cc = CompositeCache::create(
            &dir.path().join("l0.shc"),
            0,
            MIN_CACHE_SIZE * 2,
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

    fn store_utf8(chain: &Chain, ty: ItemType, s: &str) -> ItemRef {
        let cc = chain.top();
        cc.enter_write_mutex().unwrap();
        let mut payload = Vec::new();
        payload.extend_from_slice(&(s.len() as u16).to_ne_bytes());
        payload.extend_from_slice(s.as_bytes());
        if payload.len() % 2 != 0 {
            payload.push(0);
        }
        let pending = cc.allocate(ty, payload.len() as u32, 0, AllocKind::Block).unwrap();
        unsafe { cc.pending_data(&pending) }.copy_from_slice(&payload);
        let item = pending.item;
        cc.commit(pending, None);
        cc.exit_write_mutex().unwrap();
        item
    }

    #[test]
    fn test_intern_and_find() {
        let dir = tempfile::tempdir().unwrap();
        let chain = test_chain(&dir);
        let m = ScopeManager::new();
        let item = store_utf8(&chain, ItemType::Scope, "partitionA");
        assert!(m.store_new(&chain, item, ItemType::Scope));
        let off = m.find("partitionA").unwrap();
        assert_eq!(chain.utf8_at(off), Some("partitionA"));
        assert_eq!(m.find("partitionB"), None);
        assert_eq!(m.scope_count(), 1);
    }

    #[test]
    fn test_prereq_id_indexed_by_layer() {
        let dir = tempfile::tempdir().unwrap();
        let chain = test_chain(&dir);
        let m = ScopeManager::new();
        let item = store_utf8(&chain, ItemType::PrereqCache, "/x/l0.shc_1_2_3_4_5_0");
        m.store_new(&chain, item, ItemType::PrereqCache);
        assert_eq!(m.prereq_id_of(0).as_deref(), Some("/x/l0.shc_1_2_3_4_5_0"));
        assert_eq!(m.prereq_id_of(1), None);
    }

    #[test]
    fn test_validate_unscoped_vs_scoped_caller() {
        let dir = tempfile::tempdir().unwrap();
        let chain = test_chain(&dir);
        let m = ScopeManager::new();
        // A plain RomClass item (payload irrelevant for the unscoped path).
        let plain = store_utf8(&chain, ItemType::RomClass, "xx");
        assert_eq!(m.validate(&chain, None, None, plain), ScopeMatch::Match);
        assert_eq!(m.validate(&chain, Some("p"), None, plain), ScopeMatch::NoMatch);
    }

    #[test]
    fn test_validate_scoped_item() {
        let dir = tempfile::tempdir().unwrap();
        let chain = test_chain(&dir);
        let m = ScopeManager::new();
        let scope_item = store_utf8(&chain, ItemType::Scope, "partA");
        m.store_new(&chain, scope_item, ItemType::Scope);
        let scope_off = m.find("partA").unwrap();

        // Scoped wrapper with partition = "partA", no mod context.
        let cc = chain.top();
        cc.enter_write_mutex().unwrap();
        let mut wrapper = ScopedRomClassWrapper::zeroed();
        wrapper.partition = scope_off;
        let bytes = bytemuck::bytes_of(&wrapper).to_vec();
        let pending = cc
            .allocate(ItemType::ScopedRomClass, bytes.len() as u32, 0, AllocKind::Block)
            .unwrap();
        unsafe { cc.pending_data(&pending) }.copy_from_slice(&bytes);
        let scoped = pending.item;
        cc.commit(pending, None);
        cc.exit_write_mutex().unwrap();

        assert_eq!(m.validate(&chain, Some("partA"), None, scoped), ScopeMatch::Match);
        assert_eq!(m.validate(&chain, Some("partB"), None, scoped), ScopeMatch::NoMatch);
        assert_eq!(m.validate(&chain, None, None, scoped), ScopeMatch::NoMatch);
        assert_eq!(
            m.validate(&chain, Some("partA"), Some("ctx"), scoped),
            ScopeMatch::NoMatch
        );
    }
}
