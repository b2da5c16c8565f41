//! Allocation strategies for ROM class images.
//!
//! Where the image bytes land is a policy decision made once per build:
//! append to the shared layer's segment (the normal path), fill buffers the
//! caller supplied (with optional out-of-line debug areas), or fill one
//! caller-owned buffer (no out-of-line debug). The segment path's actual
//! reservation is made by the composite cache; this module carries the
//! policy and the fit checks for the buffer-backed paths.

use crate::item::align_up;

/// Byte requirements of a measured ROM class, per region.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RomClassRequirements {
    /// Image bytes when debug data stays inline.
    pub rom_class_size: u32,
    /// Image bytes when debug data goes out of line.
    pub rom_class_size_out_of_line: u32,
    pub utf8s_size: u32,
    pub line_number_size: u32,
    pub variable_info_size: u32,
    pub raw_class_data_size: u32,
}

/// Buffers a build lays its regions into.
#[derive(Clone, Copy, Debug)]
pub struct AllocatedBuffers {
    pub rom_class: *mut u8,
    pub rom_class_len: usize,
    /// Out-of-line debug areas; None means the region goes inline.
    pub line_number: Option<*mut u8>,
    pub variable_info: Option<*mut u8>,
}

/// A caller-provided buffer.
#[derive(Clone, Copy, Debug)]
pub struct BufferRef {
    pub ptr: *mut u8,
    pub len: usize,
}

impl BufferRef {
    pub fn new(ptr: *mut u8, len: usize) -> BufferRef {
        BufferRef { ptr, len }
    }
}

/// The closed strategy set.
#[derive(Debug)]
pub enum AllocationStrategy {
    /// Append to the top layer's segment. Anonymous classes set
    /// `segment_exclusive`: the final size stays over-reported so no later
    /// allocation shares their tail.
    Segment { segment_exclusive: bool },
    /// Three fixed caller buffers; succeeds iff every region fits.
    SuppliedBuffers {
        main: BufferRef,
        line_number: BufferRef,
        variable_info: BufferRef,
    },
    /// One caller buffer for everything; debug stays inline.
    CallerOwned { buffer: BufferRef },
}

impl AllocationStrategy {
    /// Only the supplied-buffer strategy carries separate debug areas; the
    /// segment keeps an image's debug data inline with it.
    pub fn can_store_debug_data_out_of_line(&self) -> bool {
        matches!(self, AllocationStrategy::SuppliedBuffers { .. })
    }

    pub fn is_segment(&self) -> bool {
        matches!(self, AllocationStrategy::Segment { .. })
    }

    pub fn segment_exclusive(&self) -> bool {
        matches!(self, AllocationStrategy::Segment { segment_exclusive: true })
    }

    /// Fit the measured regions into this strategy's buffers. The segment
    /// strategy returns None here; its reservation comes from the layer.
    pub fn allocate(&self, req: &RomClassRequirements) -> Option<AllocatedBuffers> {
        match self {
            AllocationStrategy::Segment { .. } => None,
            AllocationStrategy::SuppliedBuffers {
                main,
                line_number,
                variable_info,
            } => {
                let out_of_line = align_up(req.rom_class_size_out_of_line as usize);
                if out_of_line <= main.len
                    && req.line_number_size as usize <= line_number.len
                    && req.variable_info_size as usize <= variable_info.len
                {
                    Some(AllocatedBuffers {
                        rom_class: main.ptr,
                        rom_class_len: main.len,
                        line_number: (req.line_number_size > 0).then_some(line_number.ptr),
                        variable_info: (req.variable_info_size > 0).then_some(variable_info.ptr),
                    })
                } else if align_up(req.rom_class_size as usize) <= main.len {
                    // Everything inline still fits the main buffer.
                    Some(AllocatedBuffers {
                        rom_class: main.ptr,
                        rom_class_len: main.len,
                        line_number: None,
                        variable_info: None,
                    })
                } else {
                    None
                }
            }
            AllocationStrategy::CallerOwned { buffer } => {
                if align_up(req.rom_class_size as usize) <= buffer.len {
                    Some(AllocatedBuffers {
                        rom_class: buffer.ptr,
                        rom_class_len: buffer.len,
                        line_number: None,
                        variable_info: None,
                    })
                } else {
                    None
                }
            }
        }
    }
}
