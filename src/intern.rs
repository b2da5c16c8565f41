//! UTF-8 intern manager.
//!
//! Every UTF-8 written into a layer is registered here with its cache
//! offset. A later build can then redirect its SRPs at an existing copy
//! instead of writing a duplicate, provided the copy is reachable by a
//! narrow self-relative pointer from the new image's position.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::offset::ShrOffset;

/// Reachability of a candidate address from an SRP site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SrpRange {
    InRange,
    OutOfRange,
    /// The candidate's start is reachable but its end is not (or the
    /// reverse); treat as unusable but interesting to diagnostics.
    Partial,
}

/// Whether `len` bytes at `target` are reachable by an `i32` SRP stored
/// anywhere within `len_site` bytes at `site`.
pub fn srp_reachable(site: *const u8, len_site: usize, target: *const u8, len: usize) -> SrpRange {
    let fits = |from: usize, to: usize| -> bool {
        let d = to as i128 - from as i128;
        d >= i32::MIN as i128 && d <= i32::MAX as i128
    };
    let s0 = site as usize;
    let s1 = s0 + len_site;
    let t0 = target as usize;
    let t1 = t0 + len;
    // The worst-case pair decides: farthest site byte to farthest target byte.
    let all = fits(s0, t1) && fits(s1, t0) && fits(s0, t0) && fits(s1, t1);
    let any = fits(s0, t0) || fits(s1, t1);
    if all {
        SrpRange::InRange
    } else if any {
        SrpRange::Partial
    } else {
        SrpRange::OutOfRange
    }
}

/// In-process index of interned UTF-8 strings across all attached layers.
/// Rebuilt by metadata replay; extended as builds write new strings.
#[derive(Default)]
pub struct InternManager {
    map: Mutex<HashMap<String, ShrOffset>>,
}

impl InternManager {
    pub fn new() -> InternManager {
        InternManager::default()
    }

    /// Register a string's serialized location (its 2-byte length prefix).
    /// First writer wins; duplicates across layers keep the oldest copy.
    pub fn add(&self, s: &str, at: ShrOffset) {
        self.map.lock().entry(s.to_owned()).or_insert(at);
    }

    pub fn find(&self, s: &str) -> Option<ShrOffset> {
        self.map.lock().get(s).copied()
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    pub fn reset(&self) {
        self.map.lock().clear();
    }
}
