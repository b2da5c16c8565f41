//! The attached layer chain: top (writable) cache plus its read-only
//! prerequisite layers, and the offset table that spans them.
//!
//! Managers and the build driver read cache bytes exclusively through this
//! type, which keeps the raw pointer arithmetic in one place.

use std::sync::Arc;

use crate::composite::CompositeCache;
use crate::item::{self, ItemRef};
use crate::offset::{OffsetTable, ShrOffset};

/// Layer chain ordered layer-0 first; the last element is the top
/// (writable) layer. Built once at startup and immutable afterwards.
pub struct Chain {
    layers: Vec<Arc<CompositeCache>>,
    offsets: OffsetTable,
}

impl Chain {
    pub fn new(layers: Vec<Arc<CompositeCache>>) -> Chain {
        let mut offsets = OffsetTable::new();
        for cc in &layers {
            offsets.publish(cc.layer(), cc.base() as *const u8, cc.len());
        }
        Chain { layers, offsets }
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn cache(&self, layer: u32) -> Option<&CompositeCache> {
        self.layers.iter().find(|cc| cc.layer() == layer).map(|cc| cc.as_ref())
    }

    /// The writable top layer.
    pub fn top(&self) -> &CompositeCache {
        self.layers.last().expect("chain is never empty").as_ref()
    }

    pub fn layers(&self) -> impl Iterator<Item = &CompositeCache> {
        self.layers.iter().map(|cc| cc.as_ref())
    }

    pub fn offsets(&self) -> &OffsetTable {
        &self.offsets
    }

    /// Absolute address of a cross-layer offset.
    pub fn resolve(&self, off: ShrOffset) -> Option<*const u8> {
        self.offsets.offset_to_address(off)
    }

    pub fn to_offset(&self, p: *const u8) -> Option<ShrOffset> {
        self.offsets.address_to_offset(p)
    }

    /// Payload bytes of a committed item.
    pub fn item_data(&self, item: ItemRef) -> Option<&[u8]> {
        Some(self.cache(item.layer)?.item_data(item))
    }

    pub fn item_type_raw(&self, item: ItemRef) -> Option<u16> {
        Some(self.cache(item.layer)?.item_header(item).item_type)
    }

    pub fn is_stale(&self, item: ItemRef) -> bool {
        self.cache(item.layer).is_some_and(|cc| cc.is_stale(item))
    }

    /// Read the UTF-8 string a cross-layer offset points at.
    pub fn utf8_at(&self, off: ShrOffset) -> Option<&str> {
        let p = self.resolve(off)?;
        let range = self.offsets.range(off.layer)?;
        // SAFETY: p lies inside the published range; the remaining extent
        // bounds the slice.
        let avail = range.end as usize - p as usize;
        let bytes = unsafe { core::slice::from_raw_parts(p, avail.min(2 + u16::MAX as usize)) };
        item::read_utf8(bytes)
    }
}
