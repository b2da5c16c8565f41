//! ROM class build driver: measure, compare against existing images, and
//! lay a blueprint down into allocated buffers.
//!
//! The same layout code runs up to three times per build: a counting pass
//! to size every region, a second counting pass (after buffer addresses
//! are fixed) that assigns SRP offsets and decides UTF-8 interning, and a
//! writing pass that emits bytes. Reuse checks read an existing image
//! field by field instead, since two equal structures rarely share raw
//! bytes once interning has redirected SRPs.

use crate::alloc_strategy::{AllocatedBuffers, RomClassRequirements};
use crate::chain::Chain;
use crate::cursor::{Cursor, lambda_names_equal};
use crate::error::{Result, ShrError};
use crate::intern::{InternManager, SrpRange, srp_reachable};
use crate::item::{align_up, utf8_size};
use crate::offset::OffsetTable;
use crate::romimage::{self, ROM_FLAG_ANONYMOUS, ROM_FLAG_MODIFIED_BYTECODES, SrpOutOfRange};
use crate::srp::{RegionTag, SrpKeyProducer, SrpOffsetTable};

/// One method of a class to be built. Line-number and variable-info bytes
/// are opaque (the debug-info codec lives outside this crate).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MethodBlueprint {
    pub name: String,
    pub signature: String,
    pub modifiers: u32,
    pub bytecodes: Vec<u8>,
    pub line_numbers: Vec<u8>,
    pub variable_info: Vec<u8>,
}

/// The transient oracle the external class-file parser produces; input to
/// every build.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RomClassBlueprint {
    pub name: String,
    pub superclass: Option<String>,
    pub interfaces: Vec<String>,
    pub modifiers: u32,
    pub is_anonymous: bool,
    pub has_modified_bytecodes: bool,
    /// Raw class-file bytes retained for retransformation agents.
    pub intermediate_data: Vec<u8>,
    pub methods: Vec<MethodBlueprint>,
}

impl RomClassBlueprint {
    pub fn optional_flags(&self) -> u32 {
        let mut f = 0;
        if self.has_modified_bytecodes {
            f |= ROM_FLAG_MODIFIED_BYTECODES;
        }
        if self.is_anonymous {
            f |= ROM_FLAG_ANONYMOUS;
        }
        f
    }
}

/// Deduplicated UTF-8 pool plus the SRP key banks for one build session.
struct Keys {
    utf8s: Vec<String>,
    producer: SrpKeyProducer,
    intermediate_key: u32,
    /// Never marked; writing it emits a null SRP.
    null_key: u32,
}

impl Keys {
    fn collect(bp: &RomClassBlueprint) -> Keys {
        let mut utf8s: Vec<String> = Vec::new();
        let add = |s: &str, utf8s: &mut Vec<String>| {
            if !utf8s.iter().any(|u| u == s) {
                utf8s.push(s.to_owned());
            }
        };
        add(&bp.name, &mut utf8s);
        if let Some(s) = &bp.superclass {
            add(s, &mut utf8s);
        }
        for i in &bp.interfaces {
            add(i, &mut utf8s);
        }
        for m in &bp.methods {
            add(&m.name, &mut utf8s);
            add(&m.signature, &mut utf8s);
        }
        let mut producer = SrpKeyProducer::new(utf8s.len() as u32, bp.methods.len() as u32);
        let intermediate_key = producer.generate_key();
        let null_key = producer.generate_key();
        Keys { utf8s, producer, intermediate_key, null_key }
    }

    fn utf8_key(&self, s: &str) -> u32 {
        let idx = self
            .utf8s
            .iter()
            .position(|u| u == s)
            .expect("utf8 collected during key scan");
        self.producer.constant_pool_key(idx as u16)
    }

    fn max_key(&mut self) -> u32 {
        self.producer.max_key()
    }
}

/// Result of a completed layout pass.
#[derive(Debug)]
pub struct BuildLayout {
    /// Final image size, interning applied.
    pub rom_size: u32,
    /// Bytes the UTF-8 region actually used.
    pub utf8_used: u32,
    /// Offset of the UTF-8 region from the image start.
    pub utf8_region_offset: u32,
    /// Non-interned strings and their offsets within the UTF-8 region,
    /// for registration with the intern manager.
    pub written_utf8s: Vec<(String, u32)>,
}

/// Interning context for the layout pass; absent for buffer-backed builds
/// that never share strings.
pub struct InternCtx<'a> {
    pub manager: &'a InternManager,
    pub chain: &'a Chain,
}

pub struct RomClassBuilder {
    keys: Keys,
    srp: SrpOffsetTable,
    measured: RomClassRequirements,
}

impl RomClassBuilder {
    pub fn new(bp: &RomClassBlueprint) -> Result<RomClassBuilder> {
        let mut keys = Keys::collect(bp);
        let srp = SrpOffsetTable::new(keys.max_key())?;
        Ok(RomClassBuilder {
            keys,
            srp,
            measured: RomClassRequirements::default(),
        })
    }

    /// Size every region. First assumes out-of-line debug; the inline
    /// total is derived for strategies that cannot honor it.
    pub fn measure(&mut self, bp: &RomClassBlueprint) -> RomClassRequirements {
        let main = {
            let mut c = Cursor::counting(RegionTag::Main, &mut self.srp);
            layout_main(&mut c, bp, &self.keys, 0);
            c.count()
        };
        let utf8s = {
            let mut c = Cursor::counting(RegionTag::Utf8, &mut self.srp);
            for s in &self.keys.utf8s {
                c.write_utf8(s.as_bytes());
            }
            c.pad_to_alignment(8);
            c.count()
        };
        let inter = {
            let mut c = Cursor::counting(RegionTag::IntermediateClassData, &mut self.srp);
            layout_intermediate(&mut c, bp, &self.keys);
            c.count()
        };
        let line = {
            let mut c = Cursor::counting(RegionTag::LineNumber, &mut self.srp);
            layout_line_numbers(&mut c, bp, &self.keys);
            c.count()
        };
        let var = {
            let mut c = Cursor::counting(RegionTag::VariableInfo, &mut self.srp);
            layout_variable_info(&mut c, bp, &self.keys);
            c.count()
        };
        self.srp.clear();

        let out_of_line = (align_up(main) + align_up(utf8s) + align_up(inter)) as u32;
        let inline = out_of_line + (align_up(line) + align_up(var)) as u32;
        self.measured = RomClassRequirements {
            rom_class_size: inline,
            rom_class_size_out_of_line: out_of_line,
            utf8s_size: utf8s as u32,
            line_number_size: line as u32,
            variable_info_size: var as u32,
            raw_class_data_size: inter as u32,
        };
        self.measured
    }

    /// Lay the blueprint down into `bufs`. Requires a prior [`measure`].
    ///
    /// # Safety
    /// The buffers must be at least as large as the measured requirements
    /// (inline sizes when the matching out-of-line buffer is None).
    pub unsafe fn layout(
        &mut self,
        bp: &RomClassBlueprint,
        bufs: &AllocatedBuffers,
        intern: Option<&InternCtx<'_>>,
    ) -> Result<BuildLayout> {
        let main_base = bufs.rom_class;
        let req = self.measured;
        if req.rom_class_size == 0 && !bp.name.is_empty() {
            return Err(ShrError::OutOfMemory("layout before measure"));
        }

        // Pass 1: assign offsets and decide interning. The main region
        // contains no marks, so only the tagged sub-regions run.
        self.srp.clear();
        let main_size = {
            let mut c = Cursor::counting(RegionTag::Main, &mut self.srp);
            layout_main(&mut c, bp, &self.keys, 0);
            c.count()
        };
        let utf8_used = {
            // Borrow discipline: collect intern decisions first, then run
            // the cursor pass with the table.
            let mut interned_at: Vec<Option<*const u8>> = vec![None; self.keys.utf8s.len()];
            if let Some(ctx) = intern {
                for (i, s) in self.keys.utf8s.iter().enumerate() {
                    let Some(off) = ctx.manager.find(s) else {
                        continue;
                    };
                    let Some(addr) = ctx.chain.resolve(off) else {
                        continue;
                    };
                    let reach = srp_reachable(
                        main_base as *const u8,
                        req.rom_class_size as usize,
                        addr,
                        utf8_size(s.len()),
                    );
                    if reach == SrpRange::InRange {
                        interned_at[i] = Some(addr);
                    }
                }
            }
            let mut c = Cursor::counting(RegionTag::Utf8, &mut self.srp);
            for (i, s) in self.keys.utf8s.iter().enumerate() {
                let key = self.keys.producer.constant_pool_key(i as u16);
                if interned_at[i].is_some() {
                    continue;
                }
                c.mark(key);
                c.write_utf8(s.as_bytes());
            }
            c.pad_to_alignment(8);
            let used = c.count();
            for (i, addr) in interned_at.iter().enumerate() {
                if let Some(addr) = addr {
                    self.srp
                        .set_interned_at(self.keys.producer.constant_pool_key(i as u16), *addr);
                }
            }
            used
        };
        {
            let mut c = Cursor::counting(RegionTag::IntermediateClassData, &mut self.srp);
            layout_intermediate(&mut c, bp, &self.keys);
        }
        {
            let mut c = Cursor::counting(RegionTag::LineNumber, &mut self.srp);
            layout_line_numbers(&mut c, bp, &self.keys);
        }
        {
            let mut c = Cursor::counting(RegionTag::VariableInfo, &mut self.srp);
            layout_variable_info(&mut c, bp, &self.keys);
        }

        // Fix region bases. Inline regions pack after the main region in a
        // fixed order; out-of-line debug lands in its own buffers.
        let utf8_base = unsafe { main_base.add(align_up(main_size)) };
        let inter_base = unsafe { utf8_base.add(align_up(utf8_used)) };
        let mut inline_end = unsafe { inter_base.add(align_up(req.raw_class_data_size as usize)) };
        let line_base = match bufs.line_number {
            Some(p) => p,
            None => {
                let p = inline_end;
                inline_end = unsafe { inline_end.add(align_up(req.line_number_size as usize)) };
                p
            }
        };
        let var_base = match bufs.variable_info {
            Some(p) => p,
            None => {
                let p = inline_end;
                inline_end = unsafe { inline_end.add(align_up(req.variable_info_size as usize)) };
                p
            }
        };
        let rom_size = (inline_end as usize - main_base as usize) as u32;

        self.srp.set_base_address_for_tag(RegionTag::Main, main_base);
        self.srp.set_base_address_for_tag(RegionTag::Utf8, utf8_base);
        self.srp
            .set_base_address_for_tag(RegionTag::IntermediateClassData, inter_base);
        self.srp.set_base_address_for_tag(RegionTag::LineNumber, line_base);
        self.srp.set_base_address_for_tag(RegionTag::VariableInfo, var_base);

        // Pass 2: write.
        {
            let mut c = unsafe { Cursor::writing(RegionTag::Main, &mut self.srp, main_base) };
            layout_main(&mut c, bp, &self.keys, rom_size);
        }
        let mut written_utf8s = Vec::new();
        {
            let interned: Vec<bool> = (0..self.keys.utf8s.len())
                .map(|i| self.srp.is_interned(self.keys.producer.constant_pool_key(i as u16)))
                .collect();
            let mut c = unsafe { Cursor::writing(RegionTag::Utf8, &mut self.srp, utf8_base) };
            for (i, s) in self.keys.utf8s.iter().enumerate() {
                if interned[i] {
                    continue;
                }
                written_utf8s.push((s.clone(), c.count() as u32));
                c.write_utf8(s.as_bytes());
            }
            c.pad_to_alignment(8);
        }
        {
            let mut c =
                unsafe { Cursor::writing(RegionTag::IntermediateClassData, &mut self.srp, inter_base) };
            layout_intermediate(&mut c, bp, &self.keys);
        }
        {
            let mut c = unsafe { Cursor::writing(RegionTag::LineNumber, &mut self.srp, line_base) };
            layout_line_numbers(&mut c, bp, &self.keys);
        }
        {
            let mut c = unsafe { Cursor::writing(RegionTag::VariableInfo, &mut self.srp, var_base) };
            layout_variable_info(&mut c, bp, &self.keys);
        }

        Ok(BuildLayout {
            rom_size,
            utf8_used: utf8_used as u32,
            utf8_region_offset: align_up(main_size) as u32,
            written_utf8s,
        })
    }
}

fn layout_main(c: &mut Cursor<'_>, bp: &RomClassBlueprint, keys: &Keys, rom_size: u32) {
    c.write_u32(rom_size);
    c.write_u32(bp.modifiers);
    c.write_u32(bp.optional_flags());
    c.write_srp(keys.utf8_key(&bp.name));
    match &bp.superclass {
        Some(s) => c.write_srp(keys.utf8_key(s)),
        None => c.write_srp(keys.null_key),
    }
    if bp.intermediate_data.is_empty() {
        c.write_srp(keys.null_key);
    } else {
        c.write_srp(keys.intermediate_key);
    }
    c.write_u32(bp.intermediate_data.len() as u32);
    c.write_u32(bp.interfaces.len() as u32);
    c.write_u32(bp.methods.len() as u32);
    c.write_u32(0);
    for i in &bp.interfaces {
        c.write_srp(keys.utf8_key(i));
    }
    c.pad_to_alignment(8);
    for (i, m) in bp.methods.iter().enumerate() {
        c.write_srp(keys.utf8_key(&m.name));
        c.write_srp(keys.utf8_key(&m.signature));
        c.write_u32(m.modifiers);
        c.write_u32(m.bytecodes.len() as u32);
        if m.line_numbers.is_empty() {
            c.write_srp(keys.null_key);
        } else {
            c.write_srp(keys.producer.debug_info_key(i as u16));
        }
        c.write_u32(m.line_numbers.len() as u32);
        if m.variable_info.is_empty() {
            c.write_srp(keys.null_key);
        } else {
            c.write_srp(keys.producer.variable_info_key(i as u16));
        }
        c.write_u32(m.variable_info.len() as u32);
        c.write_data(&m.bytecodes);
        c.pad_to_alignment(4);
    }
    c.pad_to_alignment(8);
}

fn layout_intermediate(c: &mut Cursor<'_>, bp: &RomClassBlueprint, keys: &Keys) {
    if !bp.intermediate_data.is_empty() {
        c.mark(keys.intermediate_key);
        c.write_data(&bp.intermediate_data);
    }
    c.pad_to_alignment(8);
}

fn layout_line_numbers(c: &mut Cursor<'_>, bp: &RomClassBlueprint, keys: &Keys) {
    for (i, m) in bp.methods.iter().enumerate() {
        if !m.line_numbers.is_empty() {
            c.mark(keys.producer.debug_info_key(i as u16));
            c.write_data(&m.line_numbers);
            c.pad_to_alignment(4);
        }
    }
}

fn layout_variable_info(c: &mut Cursor<'_>, bp: &RomClassBlueprint, keys: &Keys) {
    for (i, m) in bp.methods.iter().enumerate() {
        if !m.variable_info.is_empty() {
            c.mark(keys.producer.variable_info_key(i as u16));
            c.write_data(&m.variable_info);
            c.pad_to_alignment(4);
        }
    }
}

/// Structural comparison of an existing image against a blueprint. Field
/// by field, resolving SRPs, with lambda-name digit tolerance. Used by the
/// reuse check so identical stores dedup instead of writing twice. An SRP
/// escaping the published ranges is corruption and surfaces as the error.
///
/// # Safety
/// `image` must point at a committed image in a live mapping covered by
/// `table`.
pub unsafe fn image_matches_blueprint(
    image: *const u8,
    table: &OffsetTable,
    bp: &RomClassBlueprint,
) -> std::result::Result<bool, SrpOutOfRange> {
    let name_matches = match unsafe { romimage::class_name(image, table) }? {
        Some(n) => n == bp.name || lambda_names_equal(n.as_bytes(), bp.name.as_bytes()),
        None => false,
    };
    if !name_matches {
        return Ok(false);
    }
    // SAFETY: committed image per caller contract.
    unsafe {
        if romimage::optional_flags(image) != bp.optional_flags() {
            return Ok(false);
        }
        let super_in_image = romimage::utf8_via_srp(image, romimage::OFF_SUPER, table)?;
        if super_in_image != bp.superclass.as_deref() {
            return Ok(false);
        }
        let ifc_count =
            core::ptr::read_unaligned(image.add(romimage::OFF_INTERFACE_COUNT) as *const u32);
        if ifc_count as usize != bp.interfaces.len() {
            return Ok(false);
        }
        for (i, want) in bp.interfaces.iter().enumerate() {
            let at = romimage::CLASS_HEADER_SIZE + 4 * i;
            if romimage::utf8_via_srp(image, at, table)? != Some(want.as_str()) {
                return Ok(false);
            }
        }
        if romimage::method_count(image) as usize != bp.methods.len() {
            return Ok(false);
        }
        for (view, want) in romimage::methods(image).zip(bp.methods.iter()) {
            if view.name(table)? != Some(want.name.as_str())
                || view.signature(table)? != Some(want.signature.as_str())
                || view.bytecodes() != want.bytecodes.as_slice()
            {
                return Ok(false);
            }
            let line_len =
                core::ptr::read_unaligned(view.record.add(romimage::MOFF_LINE_LEN) as *const u32);
            let var_len =
                core::ptr::read_unaligned(view.record.add(romimage::MOFF_VAR_LEN) as *const u32);
            if line_len as usize != want.line_numbers.len()
                || var_len as usize != want.variable_info.len()
            {
                return Ok(false);
            }
        }
        let inter_len =
            core::ptr::read_unaligned(image.add(romimage::OFF_INTERMEDIATE_LEN) as *const u32);
        if inter_len as usize != bp.intermediate_data.len() {
            return Ok(false);
        }
    }
    Ok(true)
}
