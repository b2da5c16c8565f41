//! Metadata item layout: the closed type enumeration, the fixed header and
//! trailer framing every item, and the typed wrapper payloads.
//!
//! An item occupies one aligned extent of the metadata area:
//!
//! ```text
//! low                                                   high
//! [ ItemHeader | payload | pad | ItemTrailer ]
//! ```
//!
//! The trailer records the total padded extent length. Because extents are
//! 8-byte aligned the low 3 bits of that length are free and hold flags;
//! bit 0 is the stale bit, set with a single-byte store and readable without
//! synchronization. The reverse walker depends only on trailers, which is
//! what makes the metadata skip-parseable without a side index.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

use crate::config::ITEM_ALIGNMENT;
use crate::offset::ShrOffset;

/// Round `n` up to the item alignment.
#[inline]
pub const fn align_up(n: usize) -> usize {
    (n + (ITEM_ALIGNMENT - 1)) & !(ITEM_ALIGNMENT - 1)
}

/// The closed enumeration of cache item types. Any other tag value on disk
/// marks the layer corrupt at detection time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ItemType {
    Orphan = 1,
    RomClass = 2,
    ScopedRomClass = 3,
    Classpath = 4,
    Scope = 5,
    PrereqCache = 6,
    ByteData = 7,
    UnindexedByteData = 8,
    CompiledMethod = 9,
    InvalidatedCompiledMethod = 10,
    AttachedData = 11,
    Cachelet = 12,
}

impl ItemType {
    pub fn from_raw(raw: u16) -> Option<ItemType> {
        Some(match raw {
            1 => ItemType::Orphan,
            2 => ItemType::RomClass,
            3 => ItemType::ScopedRomClass,
            4 => ItemType::Classpath,
            5 => ItemType::Scope,
            6 => ItemType::PrereqCache,
            7 => ItemType::ByteData,
            8 => ItemType::UnindexedByteData,
            9 => ItemType::CompiledMethod,
            10 => ItemType::InvalidatedCompiledMethod,
            11 => ItemType::AttachedData,
            12 => ItemType::Cachelet,
            _ => return None,
        })
    }

    /// True for the two wrapper kinds that reference a ROM class image.
    pub fn is_rom_class_kind(self) -> bool {
        matches!(self, ItemType::RomClass | ItemType::ScopedRomClass)
    }
}

/// Fixed prefix of every metadata item.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct ItemHeader {
    pub data_len: u32,
    pub item_type: u16,
    pub jvm_id: u16,
}

pub const ITEM_HEADER_SIZE: usize = core::mem::size_of::<ItemHeader>();
const_assert_eq!(ITEM_HEADER_SIZE, 8);

/// Fixed suffix of every metadata item.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct ItemTrailer {
    pub len_flags: u32,
}

pub const ITEM_TRAILER_SIZE: usize = core::mem::size_of::<ItemTrailer>();
const_assert_eq!(ITEM_TRAILER_SIZE, 4);

/// Flag bits stored in the free low bits of the trailer length.
pub const TRAILER_FLAG_STALE: u32 = 0x1;
pub const TRAILER_FLAG_MASK: u32 = (ITEM_ALIGNMENT as u32) - 1;

/// Total padded extent of an item carrying `data_len` payload bytes.
#[inline]
pub const fn item_extent(data_len: u32) -> usize {
    align_up(ITEM_HEADER_SIZE + data_len as usize + ITEM_TRAILER_SIZE)
}

/// A committed metadata item, identified by its layer and the offset of its
/// `ItemHeader` within that layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ItemRef {
    pub layer: u32,
    pub start: u32,
}

impl ItemRef {
    /// Offset of the first payload byte.
    #[inline]
    pub fn data_offset(&self) -> u32 {
        self.start + ITEM_HEADER_SIZE as u32
    }

    pub fn data_shr_offset(&self) -> ShrOffset {
        ShrOffset::new(self.layer, self.data_offset())
    }
}

// ---- In-place raw access ----
//
// Items are written once under the write mutex and immutable afterwards,
// with three exceptions that mutate single fields in place: the stale bit,
// orphan promotion (type flip to RomClass), and compiled-method
// invalidation (type flip). Readers tolerate every one of those flips.

/// Read the header of the item starting at `item`.
///
/// # Safety
/// `item` must point at a committed item header within a live mapping.
#[inline]
pub unsafe fn read_header(item: *const u8) -> ItemHeader {
    unsafe { core::ptr::read_unaligned(item as *const ItemHeader) }
}

/// Read the trailer length (flags masked off) of the extent ending at `end`.
///
/// # Safety
/// `end` must be one past the trailer of a committed item.
#[inline]
pub unsafe fn read_extent_len(end: *const u8) -> u32 {
    let raw = unsafe { core::ptr::read_unaligned(end.sub(ITEM_TRAILER_SIZE) as *const u32) };
    raw & !TRAILER_FLAG_MASK
}

/// Read the stale bit of the extent ending at `end`.
///
/// # Safety
/// As [`read_extent_len`].
#[inline]
pub unsafe fn read_stale(end: *const u8) -> bool {
    // Single byte load: the flag bits live in the least significant byte.
    let b = unsafe { core::ptr::read_volatile(end.sub(ITEM_TRAILER_SIZE)) };
    (b as u32 & TRAILER_FLAG_STALE) != 0
}

/// Set the stale bit of the extent ending at `end`. Idempotent.
///
/// # Safety
/// Caller must hold the write mutex of the containing layer.
#[inline]
pub unsafe fn set_stale(end: *mut u8) {
    let p = unsafe { end.sub(ITEM_TRAILER_SIZE) };
    let b = unsafe { core::ptr::read_volatile(p) };
    unsafe { core::ptr::write_volatile(p, b | TRAILER_FLAG_STALE as u8) };
}

/// Overwrite the item type in place (orphan promotion, AOT invalidation).
///
/// # Safety
/// Caller must hold the write mutex; the flip must be one readers tolerate.
#[inline]
pub unsafe fn write_item_type(item: *mut u8, new_type: ItemType) {
    let p = unsafe { item.add(core::mem::offset_of!(ItemHeader, item_type)) as *mut u16 };
    unsafe { core::ptr::write_volatile(p, new_type as u16) };
}

// ---- Wrapper payloads ----

/// Payload of a `RomClass` item. `Orphan` items share this shape with a
/// null classpath, so promotion can fill the binding and flip the type tag
/// without moving the item.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct RomClassWrapper {
    pub rom_class: ShrOffset,
    pub rom_size: u32,
    /// Index of the classpath entry the class was loaded from.
    pub cpe_index: i32,
    pub classpath: ShrOffset,
    /// Timestamp of the specific `.class` file for directory entries,
    /// 0 for archive entries (the archive itself is stamped).
    pub timestamp: i64,
}
const_assert_eq!(core::mem::size_of::<RomClassWrapper>(), 32);

/// Payload of a `ScopedRomClass` item: a `RomClassWrapper` plus partition
/// and modification-context qualifiers.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct ScopedRomClassWrapper {
    pub base: RomClassWrapper,
    pub partition: ShrOffset,
    pub mod_context: ShrOffset,
}
const_assert_eq!(core::mem::size_of::<ScopedRomClassWrapper>(), 48);

/// Fixed prefix of a `Classpath` item payload; the serialized entries
/// follow it inline.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct ClasspathWrapper {
    /// Lowest entry index marked stale, or `NOT_STALE`.
    pub stale_from_index: u32,
    pub entry_count: u32,
    /// Discriminates classpath / URL / token wrappers.
    pub cp_type: u32,
    pub hashcode: u32,
}
const_assert_eq!(core::mem::size_of::<ClasspathWrapper>(), 16);

/// Payload of a `ByteData` / `UnindexedByteData` item; value bytes follow.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct ByteDataWrapper {
    /// Key scope string in the cache; null for unindexed records.
    pub key: ShrOffset,
    pub data_len: u32,
    /// Attached JVM id of the owner for private records, 0 otherwise.
    pub private_owner: u32,
    pub sub_kind: u16,
    pub flags: u16,
    pub reserved: u32,
}
const_assert_eq!(core::mem::size_of::<ByteDataWrapper>(), 24);

/// Flags in `ByteDataWrapper::flags`.
pub const BDW_FLAG_PRIVATE: u16 = 0x1;
pub const BDW_FLAG_SINGLE_STORE: u16 = 0x2;

/// Payload of a `CompiledMethod` item; metadata bytes then code bytes follow.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct MethodDataWrapper {
    pub rom_method: ShrOffset,
    pub data_len: u32,
    pub code_len: u32,
}
const_assert_eq!(core::mem::size_of::<MethodDataWrapper>(), 16);

/// Payload of an `AttachedData` item; data bytes follow.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct AttachedDataWrapper {
    pub rom_method: ShrOffset,
    pub data_len: u32,
    /// Offset being mutated by an in-place update, -1 when quiescent.
    /// A crashed updater leaves the partial write detectable here.
    pub corrupt_offset: i32,
    pub sub_type: u16,
    pub update_count: u16,
    pub reserved: u32,
}
const_assert_eq!(core::mem::size_of::<AttachedDataWrapper>(), 24);

pub const ATTACHED_DATA_QUIESCENT: i32 = -1;

/// Byte-data sub-kinds. `Unknown` absorbs unrecognized values so stats can
/// still bucket them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ByteDataKind {
    Jcl = 1,
    ZipCache = 2,
    JitHint = 3,
    AotHeader = 4,
    AotClassChain = 5,
    AotThunk = 6,
    StartupHints = 7,
    Helper = 8,
    Unknown = 0xffff,
}

impl ByteDataKind {
    pub fn from_raw(raw: u16) -> ByteDataKind {
        match raw {
            1 => ByteDataKind::Jcl,
            2 => ByteDataKind::ZipCache,
            3 => ByteDataKind::JitHint,
            4 => ByteDataKind::AotHeader,
            5 => ByteDataKind::AotClassChain,
            6 => ByteDataKind::AotThunk,
            7 => ByteDataKind::StartupHints,
            8 => ByteDataKind::Helper,
            _ => ByteDataKind::Unknown,
        }
    }
}

/// Read a 2-byte-length-prefixed UTF-8 string from `bytes`.
/// This is the serialized form every cursor writes for UTF-8 data.
pub fn read_utf8(bytes: &[u8]) -> Option<&str> {
    if bytes.len() < 2 {
        return None;
    }
    let len = u16::from_ne_bytes([bytes[0], bytes[1]]) as usize;
    let data = bytes.get(2..2 + len)?;
    std::str::from_utf8(data).ok()
}

/// Serialized size of a UTF-8 string: 2-byte length, bytes, one pad byte
/// when the total would be odd.
#[inline]
pub const fn utf8_size(len: usize) -> usize {
    let n = 2 + len;
    n + (n & 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_type_round_trip() {
        for raw in 1..=12u16 {
            let t = ItemType::from_raw(raw).unwrap();
            assert_eq!(t as u16, raw);
        }
        assert!(ItemType::from_raw(0).is_none());
        assert!(ItemType::from_raw(13).is_none());
    }

    #[test]
    fn test_item_extent_alignment() {
        for data_len in [0u32, 1, 7, 8, 9, 31, 4096] {
            let e = item_extent(data_len);
            assert_eq!(e % ITEM_ALIGNMENT, 0);
            assert!(e >= ITEM_HEADER_SIZE + data_len as usize + ITEM_TRAILER_SIZE);
        }
    }

    #[test]
    fn test_stale_bit_in_place() {
        // Build one item extent in a buffer and flip the stale bit.
        let data_len = 10u32;
        let extent = item_extent(data_len);
        let mut buf = vec![0u8; extent];
        let trailer = (extent as u32) & !TRAILER_FLAG_MASK;
        buf[extent - 4..].copy_from_slice(&trailer.to_ne_bytes());

        let end = unsafe { buf.as_mut_ptr().add(extent) };
        unsafe {
            assert!(!read_stale(end));
            assert_eq!(read_extent_len(end), extent as u32);
            set_stale(end);
            assert!(read_stale(end));
            // Length is unaffected by the flag bits.
            assert_eq!(read_extent_len(end), extent as u32);
            // Idempotent.
            set_stale(end);
            assert!(read_stale(end));
        }
    }

    #[test]
    fn test_type_flip_in_place() {
        let mut buf = vec![0u8; ITEM_HEADER_SIZE];
        let hdr = ItemHeader {
            data_len: 0,
            item_type: ItemType::Orphan as u16,
            jvm_id: 3,
        };
        buf.copy_from_slice(bytemuck::bytes_of(&hdr));
        unsafe {
            write_item_type(buf.as_mut_ptr(), ItemType::RomClass);
            let after = read_header(buf.as_ptr());
            assert_eq!(after.item_type, ItemType::RomClass as u16);
            assert_eq!(after.jvm_id, 3);
        }
    }

    #[test]
    fn test_utf8_round_trip() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(5u16).to_ne_bytes());
        bytes.extend_from_slice(b"hello");
        bytes.push(0); // pad
        assert_eq!(read_utf8(&bytes), Some("hello"));
        assert_eq!(utf8_size(5), 8);
        assert_eq!(utf8_size(4), 6);
    }
}
