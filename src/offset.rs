//! Cross-layer addressing: `(layer, offset)` pairs and the per-process
//! offset table.
//!
//! A `ShrOffset` is the stable, process-independent way to reference bytes
//! anywhere in an attached chain. Each process maps the layer files at
//! whatever virtual addresses it gets; the offset table records those ranges
//! so translation is O(1) per layer. Raw pointer arithmetic is confined to
//! the two translation methods here.

use bytemuck::{Pod, Zeroable};

/// A reference into the attached chain: layer number plus byte offset from
/// that layer's header. The null offset is `(0, 0)`; offset 0 always lands
/// inside a header, never on payload bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct ShrOffset {
    pub layer: u32,
    pub offset: u32,
}

impl ShrOffset {
    pub const NULL: ShrOffset = ShrOffset { layer: 0, offset: 0 };

    pub fn new(layer: u32, offset: u32) -> ShrOffset {
        ShrOffset { layer, offset }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.offset == 0
    }
}

/// One attached layer's mapped range.
#[derive(Clone, Copy, Debug)]
pub struct AddressRange {
    pub header: *const u8,
    pub end: *const u8,
}

impl AddressRange {
    /// True when `len` bytes at `p` lie entirely inside this range.
    pub fn contains(&self, p: *const u8, len: usize) -> bool {
        let start = p as usize;
        start >= self.header as usize
            && start.saturating_add(len) <= self.end as usize
    }
}

/// Maps `(layer, offset)` pairs to and from absolute addresses for every
/// layer attached by this process. Layers publish their range at attach and
/// withdraw at detach; the table is then effectively read-only.
#[derive(Debug, Default)]
pub struct OffsetTable {
    ranges: Vec<Option<AddressRange>>,
}

// SAFETY: the raw pointers are only stored, compared and offset; the table
// never dereferences them. Liveness of the ranges is the composite caches'
// responsibility.
unsafe impl Send for OffsetTable {}
unsafe impl Sync for OffsetTable {}

impl OffsetTable {
    pub fn new() -> OffsetTable {
        OffsetTable { ranges: Vec::new() }
    }

    /// Record `layer`'s mapped range. Overwrites any previous publication.
    pub fn publish(&mut self, layer: u32, header: *const u8, len: usize) {
        let idx = layer as usize;
        if self.ranges.len() <= idx {
            self.ranges.resize(idx + 1, None);
        }
        self.ranges[idx] = Some(AddressRange {
            header,
            // SAFETY: one-past-the-end of the mapping, never dereferenced.
            end: unsafe { header.add(len) },
        });
    }

    pub fn withdraw(&mut self, layer: u32) {
        if let Some(slot) = self.ranges.get_mut(layer as usize) {
            *slot = None;
        }
    }

    pub fn layer_count(&self) -> usize {
        self.ranges.len()
    }

    /// Translate an absolute address to its `(layer, offset)` pair.
    /// Linear in the number of layers (a small bounded constant).
    pub fn address_to_offset(&self, p: *const u8) -> Option<ShrOffset> {
        for (layer, range) in self.ranges.iter().enumerate() {
            if let Some(r) = range {
                if p >= r.header && p < r.end {
                    return Some(ShrOffset::new(layer as u32, p as u32 - r.header as u32));
                }
            }
        }
        None
    }

    /// Translate a `(layer, offset)` pair to an absolute address.
    /// Returns None for unattached layers and for offsets past the layer's
    /// extent; callers treat that as corruption.
    pub fn offset_to_address(&self, off: ShrOffset) -> Option<*const u8> {
        if off.is_null() {
            return None;
        }
        let r = self.ranges.get(off.layer as usize).copied().flatten()?;
        // SAFETY: offset checked against the published extent before use.
        let p = unsafe { r.header.add(off.offset as usize) };
        if p < r.end { Some(p) } else { None }
    }

    /// Bounds of an attached layer, if published.
    pub fn range(&self, layer: u32) -> Option<AddressRange> {
        self.ranges.get(layer as usize).copied().flatten()
    }
}
