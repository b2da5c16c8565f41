//! The on-cache ROM class image: byte layout and read-side accessors.
//!
//! The build driver lays an image down with cursors; everything else only
//! reads. All multi-byte fields are native endian and every region is
//! 8-byte aligned. References inside the image are narrow self-relative
//! pointers (signed offset from the pointer's own storage site; 0 is null),
//! so an image is position independent as long as its targets move with it.
//!
//! Every SRP is bounds-checked as it is followed: the target must land
//! inside a range published to the caller's [`OffsetTable`] (interning may
//! legally redirect a string into any attached layer). A pointer escaping
//! every range is reported as [`SrpOutOfRange`] so the caller can mark the
//! owning layer corrupt instead of dereferencing a bad address.
//!
//! Layout:
//!
//! ```text
//! +0   rom_size          u32   total image bytes (inline regions included)
//! +4   modifiers         u32   Java access flags
//! +8   optional_flags    u32   internal flags (anonymous, modified, ...)
//! +12  name              srp   -> UTF-8
//! +16  superclass        srp   -> UTF-8 (null for java/lang/Object)
//! +20  intermediate      srp   -> raw class-file bytes
//! +24  intermediate_len  u32
//! +28  interface_count   u32
//! +32  method_count      u32
//! +36  reserved          u32
//! +40  interfaces        interface_count x srp -> UTF-8
//!      (pad to 8)
//!      method records    variable size, see below
//!      (pad to 8) UTF-8 region, (pad to 8) intermediate data,
//!      (pad to 8) inline line-number region, (pad to 8) inline
//!      variable-info region
//! ```
//!
//! A method record is a 32-byte header followed by the bytecodes:
//!
//! ```text
//! +0   name          srp -> UTF-8
//! +4   signature     srp -> UTF-8
//! +8   modifiers     u32
//! +12  bytecode_len  u32
//! +16  line_number   srp -> line-number bytes (may be out of line)
//! +20  line_len      u32
//! +24  variable_info srp -> variable-info bytes (may be out of line)
//! +28  var_len       u32
//! +32  bytecodes     bytecode_len bytes, padded to 4
//! ```

use crate::item::read_utf8;
use crate::offset::OffsetTable;

pub const CLASS_HEADER_SIZE: usize = 40;
pub const METHOD_HEADER_SIZE: usize = 32;

// Offsets within the class header.
pub const OFF_ROM_SIZE: usize = 0;
pub const OFF_MODIFIERS: usize = 4;
pub const OFF_OPTIONAL_FLAGS: usize = 8;
pub const OFF_NAME: usize = 12;
pub const OFF_SUPER: usize = 16;
pub const OFF_INTERMEDIATE: usize = 20;
pub const OFF_INTERMEDIATE_LEN: usize = 24;
pub const OFF_INTERFACE_COUNT: usize = 28;
pub const OFF_METHOD_COUNT: usize = 32;

// Offsets within a method record.
pub const MOFF_NAME: usize = 0;
pub const MOFF_SIG: usize = 4;
pub const MOFF_MODIFIERS: usize = 8;
pub const MOFF_BYTECODE_LEN: usize = 12;
pub const MOFF_LINE: usize = 16;
pub const MOFF_LINE_LEN: usize = 20;
pub const MOFF_VAR: usize = 24;
pub const MOFF_VAR_LEN: usize = 28;

/// Internal flags in `optional_flags`.
pub const ROM_FLAG_MODIFIED_BYTECODES: u32 = 0x1;
pub const ROM_FLAG_ANONYMOUS: u32 = 0x2;

/// An SRP resolved outside every range the caller published. Mandatory
/// corruption trigger; callers mark the owning layer corrupt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SrpOutOfRange;

/// `len` bytes at `p` lie inside one of the table's published ranges.
fn in_table(table: &OffsetTable, p: *const u8, len: usize) -> bool {
    match table.address_to_offset(p) {
        Some(off) => table.range(off.layer).is_some_and(|r| r.contains(p, len)),
        None => false,
    }
}

#[inline]
unsafe fn read_u32(p: *const u8, off: usize) -> u32 {
    unsafe { core::ptr::read_unaligned(p.add(off) as *const u32) }
}

/// Follow the SRP stored at `p + off`. Null SRPs resolve to None; a target
/// escaping every published range is the [`SrpOutOfRange`] error.
///
/// # Safety
/// `p + off` must be a valid SRP site inside a committed image.
pub unsafe fn follow_srp(
    p: *const u8,
    off: usize,
    table: &OffsetTable,
) -> Result<Option<*const u8>, SrpOutOfRange> {
    let srp = unsafe { core::ptr::read_unaligned(p.add(off) as *const i32) };
    if srp == 0 {
        return Ok(None);
    }
    let target = (p as usize)
        .wrapping_add(off)
        .wrapping_add_signed(srp as isize) as *const u8;
    if !in_table(table, target, 1) {
        return Err(SrpOutOfRange);
    }
    Ok(Some(target))
}

/// Read the UTF-8 string an SRP site points at. The length prefix and the
/// string bytes are both bounds-checked against the target's range.
///
/// # Safety
/// As [`follow_srp`].
pub unsafe fn utf8_via_srp<'a>(
    p: *const u8,
    off: usize,
    table: &OffsetTable,
) -> Result<Option<&'a str>, SrpOutOfRange> {
    let Some(target) = (unsafe { follow_srp(p, off, table) })? else {
        return Ok(None);
    };
    if !in_table(table, target, 2) {
        return Err(SrpOutOfRange);
    }
    // SAFETY: the two length bytes were bounds-checked above.
    let len = unsafe { core::ptr::read_unaligned(target as *const u16) } as usize;
    if !in_table(table, target, 2 + len) {
        return Err(SrpOutOfRange);
    }
    // SAFETY: 2 + len bytes bounds-checked above.
    let bytes = unsafe { core::slice::from_raw_parts(target, 2 + len) };
    Ok(read_utf8(bytes))
}

/// Total size of the image in bytes.
///
/// # Safety
/// `image` must point at a committed image.
pub unsafe fn rom_size(image: *const u8) -> u32 {
    unsafe { read_u32(image, OFF_ROM_SIZE) }
}

/// # Safety
/// `image` must point at a committed image.
pub unsafe fn class_name<'a>(
    image: *const u8,
    table: &OffsetTable,
) -> Result<Option<&'a str>, SrpOutOfRange> {
    unsafe { utf8_via_srp(image, OFF_NAME, table) }
}

/// # Safety
/// `image` must point at a committed image.
pub unsafe fn optional_flags(image: *const u8) -> u32 {
    unsafe { read_u32(image, OFF_OPTIONAL_FLAGS) }
}

/// # Safety
/// `image` must point at a committed image.
pub unsafe fn has_modified_bytecodes(image: *const u8) -> bool {
    let flags = unsafe { optional_flags(image) };
    flags & ROM_FLAG_MODIFIED_BYTECODES != 0
}

/// # Safety
/// `image` must point at a committed image.
pub unsafe fn method_count(image: *const u8) -> u32 {
    unsafe { read_u32(image, OFF_METHOD_COUNT) }
}

/// Offset of the first method record.
///
/// # Safety
/// `image` must point at a committed image.
pub unsafe fn methods_offset(image: *const u8) -> usize {
    let ifc = unsafe { read_u32(image, OFF_INTERFACE_COUNT) } as usize;
    (CLASS_HEADER_SIZE + 4 * ifc + 7) & !7
}

/// One method record inside an image.
#[derive(Clone, Copy, Debug)]
pub struct MethodView {
    /// Address of the record header; the key compiled-method and
    /// attached-data records use.
    pub record: *const u8,
}

impl MethodView {
    /// # Safety
    /// `self.record` must be inside a committed image.
    pub unsafe fn name<'a>(&self, table: &OffsetTable) -> Result<Option<&'a str>, SrpOutOfRange> {
        unsafe { utf8_via_srp(self.record, MOFF_NAME, table) }
    }

    /// # Safety
    /// As [`name`].
    pub unsafe fn signature<'a>(
        &self,
        table: &OffsetTable,
    ) -> Result<Option<&'a str>, SrpOutOfRange> {
        unsafe { utf8_via_srp(self.record, MOFF_SIG, table) }
    }

    /// # Safety
    /// As [`name`].
    pub unsafe fn bytecode_len(&self) -> u32 {
        unsafe { read_u32(self.record, MOFF_BYTECODE_LEN) }
    }

    /// # Safety
    /// As [`name`].
    pub unsafe fn bytecodes<'a>(&self) -> &'a [u8] {
        let len = unsafe { self.bytecode_len() } as usize;
        unsafe { core::slice::from_raw_parts(self.record.add(METHOD_HEADER_SIZE), len) }
    }

    /// Extent of this record including bytecodes and padding.
    ///
    /// # Safety
    /// As [`name`].
    pub unsafe fn extent(&self) -> usize {
        METHOD_HEADER_SIZE + ((unsafe { self.bytecode_len() } as usize + 3) & !3)
    }
}

/// Iterate the method records of an image.
///
/// # Safety
/// `image` must point at a committed image; the iterator is valid while
/// the mapping lives.
pub unsafe fn methods(image: *const u8) -> MethodIter {
    MethodIter {
        next: unsafe { image.add(methods_offset(image)) },
        remaining: unsafe { method_count(image) },
    }
}

pub struct MethodIter {
    next: *const u8,
    remaining: u32,
}

impl Iterator for MethodIter {
    type Item = MethodView;

    fn next(&mut self) -> Option<MethodView> {
        if self.remaining == 0 {
            return None;
        }
        let view = MethodView { record: self.next };
        // SAFETY: records tile the method area of a committed image.
        self.next = unsafe { self.next.add(view.extent()) };
        self.remaining -= 1;
        Some(view)
    }
}

/// Find the method record at exactly `address` within `image`.
///
/// # Safety
/// `image` must point at a committed image.
pub unsafe fn method_at(image: *const u8, address: *const u8) -> Option<MethodView> {
    unsafe { methods(image) }.find(|m| m.record == address)
}
