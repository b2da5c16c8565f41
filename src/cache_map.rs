//! The cache map: attaches and composes the layer chain, drives the write
//! protocol, keeps the managers fed, and implements staleness marking and
//! the AOT management operations.
//!
//! Lock order, outermost first: the caller's class-segment mutex (modeled
//! by the public find/store entry points), the top layer's write mutex,
//! the refresh mutex, manager hash mutexes, the intern mutex. The refresh
//! mutex is re-entrant: startup replays through the same path refresh
//! checks use.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::{Mutex, ReentrantMutex};

use crate::alloc_strategy::AllocatedBuffers;
use crate::builder::{InternCtx, RomClassBlueprint, RomClassBuilder, image_matches_blueprint};
use crate::bytedata::{ByteDataManager, FoundByteData};
use crate::chain::Chain;
use crate::classpath::{
    CachedClasspath, ClasspathItem, ClasspathManager, StaleRef, UpdateOutcome, serialize_classpath,
    set_stale_from_index,
};
use crate::composite::{AllocFailure, AllocKind, CompositeCache};
use crate::config::{CacheOptions, DEFAULT_READWRITE_SIZE};
use crate::error::{CorruptionCode, Result, ShrError, StoreError, StoreResult};
use crate::intern::InternManager;
use crate::item::{
    ByteDataKind, ItemRef, ItemType, RomClassWrapper, ScopedRomClassWrapper, utf8_size,
};
use crate::offset::ShrOffset;
use crate::resource::{
    AttachedDataManager, CompiledMethodManager, FoundAttachedData, FoundCompiledMethod,
};
use crate::romclass::{LocateOutcome, RomClassManager, classpath_item_of, make_wrapper, read_wrapper};
use crate::romimage;
use crate::scope::ScopeManager;
use crate::stats::{CacheCounters, JavacoreData};
use crate::timestamp;
use crate::{aot, bytedata, item, stats};

/// A validated find/store result: the class image plus where in the
/// caller's classpath it matched.
#[derive(Clone, Copy, Debug)]
pub struct FoundRomClass {
    pub item: ItemRef,
    pub image: ShrOffset,
    pub rom_size: u32,
    pub found_at_index: i32,
}

/// Outcome of a find.
#[derive(Clone, Copy, Debug)]
pub enum FindResult {
    Hit(FoundRomClass),
    /// A loose `.class` file earlier in the classpath shadows the cached
    /// class; the caller must load from disk.
    Shadowed,
    Miss,
}

impl FindResult {
    pub fn hit(&self) -> Option<&FoundRomClass> {
        match self {
            FindResult::Hit(f) => Some(f),
            _ => None,
        }
    }
}

/// Adaptive wait for the "another JVM is mid-store" hint: a weighted
/// moving average of this process's own store latencies.
#[derive(Debug)]
struct WriteWaitEstimator {
    avg_micros: u64,
}

impl WriteWaitEstimator {
    fn new() -> WriteWaitEstimator {
        WriteWaitEstimator { avg_micros: 1000 }
    }

    fn record(&mut self, actual: Duration) {
        let micros = (actual.as_micros() as u64).max(1);
        self.avg_micros = (self.avg_micros * 3 + micros) / 4;
    }

    fn suggested_wait(&self) -> Duration {
        Duration::from_micros(self.avg_micros.clamp(500, 100_000))
    }
}

pub struct CacheMap {
    options: CacheOptions,
    chain: Chain,
    refresh_mutex: ReentrantMutex<()>,
    cpm: ClasspathManager,
    rcm: RomClassManager,
    scm: ScopeManager,
    bdm: ByteDataManager,
    cmm: CompiledMethodManager,
    adm: AttachedDataManager,
    intern: InternManager,
    counters: CacheCounters,
    write_wait: Mutex<WriteWaitEstimator>,
    corrupt_reported: AtomicBool,
    /// Top-layer update counter at the last completed replay.
    last_seen_updates: AtomicU64,
}

impl CacheMap {
    /// Attach (or create) the chain described by `options`, replay every
    /// layer's metadata bottom-up, and return the ready map.
    pub fn startup(options: CacheOptions) -> Result<CacheMap> {
        std::fs::create_dir_all(&options.cache_dir)
            .map_err(|e| ShrError::io(&options.cache_dir, e))?;

        let layers = Self::attach_chain(&options)?;
        let chain = Chain::new(layers);
        if !chain.top().is_readonly() {
            chain.top().attach_jvm()?;
        }

        let map = CacheMap {
            options,
            chain,
            refresh_mutex: ReentrantMutex::new(()),
            cpm: ClasspathManager::new(true),
            rcm: RomClassManager::new(true),
            scm: ScopeManager::new(),
            bdm: ByteDataManager::new(),
            cmm: CompiledMethodManager::new(),
            adm: AttachedDataManager::new(),
            intern: InternManager::new(),
            counters: CacheCounters::new(),
            write_wait: Mutex::new(WriteWaitEstimator::new()),
            corrupt_reported: AtomicBool::new(false),
            last_seen_updates: AtomicU64::new(0),
        };
        let map = map.with_timestamp_checks();

        // Replay every layer bottom-up. The top layer is scanned under its
        // write mutex so the scan cannot race a peer's commit.
        {
            let _g = map.refresh_mutex.lock();
            let top_layer = map.chain.top().layer();
            for cc in map.chain.layers() {
                let is_top = cc.layer() == top_layer;
                if is_top && !cc.is_readonly() {
                    cc.enter_write_mutex()?;
                    // A crash flagged here needs no rebuild: the indexes
                    // are empty and about to be filled from the committed
                    // tail anyway.
                    cc.acknowledge_crash();
                }
                let result = map.replay_layer(cc);
                cc.take_refresh_snapshot();
                if is_top && !cc.is_readonly() {
                    cc.exit_write_mutex()?;
                }
                result?;
            }
        }
        map.last_seen_updates
            .store(map.chain.top().read_update_count(), Ordering::Release);
        info!(
            "cache '{}' attached: {} layer(s), top layer {}",
            map.options.cache_name,
            map.chain.layer_count(),
            map.chain.top().layer()
        );
        Ok(map)
    }

    fn with_timestamp_checks(self) -> CacheMap {
        let ts = self.options.timestamp_checks;
        CacheMap {
            cpm: ClasspathManager::new(ts),
            rcm: RomClassManager::new(ts),
            ..self
        }
    }

    /// Open layer `options.layer` as top (creating it when asked) and
    /// every prerequisite layer below it, layer-0 first in the result.
    fn attach_chain(options: &CacheOptions) -> Result<Vec<Arc<CompositeCache>>> {
        let top_layer = options.layer as u32;
        let top_path = options.layer_path(options.layer);

        let top = if options.create_layer {
            if top_path.exists() {
                return Err(ShrError::Incompatible(format!(
                    "layer file {} already exists",
                    top_path.display()
                )));
            }
            if options.layer == 0 {
                return Err(ShrError::Incompatible("createLayer needs a layer below".into()));
            }
            None
        } else if top_path.exists() {
            match CompositeCache::open(&top_path, top_layer, options.readonly) {
                Ok(cc) => Some(Arc::new(cc)),
                Err(e @ ShrError::Incompatible(_)) => {
                    if options.soft_reset || options.autokill_diff_buildid {
                        warn!("destroying incompatible cache {}: {e}", top_path.display());
                        std::fs::remove_file(&top_path).map_err(|e| ShrError::io(&top_path, e))?;
                        None
                    } else {
                        return Err(e);
                    }
                }
                Err(e @ ShrError::Corrupt { .. }) if options.soft_reset => {
                    warn!("destroying corrupt cache {}: {e}", top_path.display());
                    std::fs::remove_file(&top_path).map_err(|e| ShrError::io(&top_path, e))?;
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        // Everything below the top is immutable and attached read-only.
        let mut lower: Vec<Arc<CompositeCache>> = Vec::new();
        for n in 0..top_layer {
            let path = options.layer_path(n as u8);
            lower.push(Arc::new(CompositeCache::open(&path, n, true)?));
        }

        // Verify the prerequisite chain among the lower layers.
        for pair in lower.windows(2) {
            Self::verify_prereq(&pair[1], &pair[0])?;
        }

        let top = match top {
            Some(cc) => {
                if let Some(below) = lower.last() {
                    Self::verify_prereq(&cc, below)?;
                }
                cc
            }
            None => {
                let cc = Arc::new(CompositeCache::create(
                    &top_path,
                    top_layer,
                    options.cache_size,
                    options.softmx,
                    DEFAULT_READWRITE_SIZE,
                    options.min_aot,
                    options.max_aot,
                    options.min_jit,
                    options.max_jit,
                    options.group_access,
                )?);
                if let Some(below) = lower.last() {
                    Self::store_prereq_record(&cc, below)?;
                }
                cc
            }
        };

        let mut layers = lower;
        layers.push(top);
        Ok(layers)
    }

    /// The first metadata item of a dependent layer names the unique id of
    /// the layer below it. A byte-for-byte mismatch rejects the chain.
    fn verify_prereq(dependent: &CompositeCache, below: &CompositeCache) -> Result<()> {
        let recorded = dependent
            .walk(None)
            .next()
            .filter(|item| {
                dependent.item_header(*item).item_type == ItemType::PrereqCache as u16
            })
            .and_then(|item| item::read_utf8(dependent.item_data(item)).map(str::to_owned))
            .ok_or_else(|| ShrError::PrereqMismatch {
                expected: format!("<missing prereq record in layer {}>", dependent.layer()),
            })?;
        let actual = below.unique_id();
        if recorded != actual {
            return Err(ShrError::PrereqMismatch { expected: recorded });
        }
        Ok(())
    }

    /// Write the `PrereqCache` record as the first item of a new layer.
    fn store_prereq_record(cc: &CompositeCache, below: &CompositeCache) -> Result<()> {
        let id = below.unique_id();
        cc.attach_jvm()?;
        cc.enter_write_mutex()?;
        let mut payload = Vec::with_capacity(utf8_size(id.len()));
        payload.extend_from_slice(&(id.len() as u16).to_ne_bytes());
        payload.extend_from_slice(id.as_bytes());
        payload.resize(utf8_size(id.len()), 0);
        let pending = cc
            .allocate(ItemType::PrereqCache, payload.len() as u32, 0, AllocKind::Block)
            .map_err(|f| ShrError::Contention {
                name: "prereq record",
                detail: format!("{f:?}"),
            })?;
        // SAFETY: pending from this allocate, write mutex held.
        unsafe { cc.pending_data(&pending) }.copy_from_slice(&payload);
        cc.commit(pending, None);
        cc.exit_write_mutex()?;
        Ok(())
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn counters(&self) -> &CacheCounters {
        &self.counters
    }

    /// Update counter of the top layer at the last completed replay.
    pub fn seen_update_count(&self) -> u64 {
        self.last_seen_updates.load(Ordering::Acquire)
    }

    /// Absolute address of a cross-layer offset, for callers that execute
    /// cached code or bytes.
    pub fn address_of(&self, off: ShrOffset) -> Option<*const u8> {
        self.chain.resolve(off)
    }

    // ---- corruption / entry checks ----

    fn entry_checks(&self) -> Result<()> {
        for cc in self.chain.layers() {
            if cc.is_corrupt() {
                let (code, context) = cc.corruption_info();
                if !self.corrupt_reported.swap(true, Ordering::AcqRel) {
                    error!(
                        "cache layer {} corrupt; refusing further access",
                        cc.layer()
                    );
                }
                return Err(ShrError::Corrupt { code, context });
            }
        }
        Ok(())
    }

    pub fn is_corrupt_reported(&self) -> bool {
        self.corrupt_reported.load(Ordering::Acquire)
    }

    // ---- replay / refresh ----

    fn dispatch(&self, cc: &CompositeCache, item_ref: ItemRef) -> Result<()> {
        let hdr = cc.item_header(item_ref);
        match ItemType::from_raw(hdr.item_type) {
            Some(ItemType::Orphan)
            | Some(ItemType::RomClass)
            | Some(ItemType::ScopedRomClass) => {
                self.rcm.store_new(&self.chain, item_ref);
            }
            Some(ItemType::Classpath) => {
                self.cpm.store_new(&self.chain, item_ref);
            }
            Some(ty @ ItemType::Scope) | Some(ty @ ItemType::PrereqCache) => {
                self.scm.store_new(&self.chain, item_ref, ty);
                if let Some(s) = item::read_utf8(cc.item_data(item_ref)) {
                    self.intern.add(s, item_ref.data_shr_offset());
                }
            }
            Some(ItemType::ByteData) | Some(ItemType::UnindexedByteData) => {
                self.bdm.store_new(&self.chain, item_ref);
            }
            Some(ItemType::CompiledMethod) | Some(ItemType::InvalidatedCompiledMethod) => {
                self.cmm.store_new(&self.chain, item_ref);
            }
            Some(ItemType::AttachedData) => {
                self.adm.store_new(&self.chain, item_ref);
            }
            Some(ItemType::Cachelet) => {
                return Err(ShrError::Unsupported("cachelet sub-mode"));
            }
            None => {
                cc.set_corrupt(CorruptionCode::BadItemType, hdr.item_type as u64);
                return Err(ShrError::Corrupt {
                    code: CorruptionCode::BadItemType,
                    context: hdr.item_type as u64,
                });
            }
        }
        Ok(())
    }

    fn replay_layer(&self, cc: &CompositeCache) -> Result<()> {
        let mut count = 0usize;
        for item_ref in cc.walk(None) {
            self.dispatch(cc, item_ref)?;
            count += 1;
        }
        if cc.is_corrupt() {
            let (code, context) = cc.corruption_info();
            return Err(ShrError::Corrupt { code, context });
        }
        debug!("replayed {count} item(s) from layer {}", cc.layer());
        Ok(())
    }

    fn reset_managers(&self) {
        self.cpm.reset();
        self.rcm.reset();
        self.scm.reset();
        self.bdm.reset();
        self.cmm.reset();
        self.adm.reset();
        self.intern.reset();
    }

    /// Tear down and rebuild every in-memory index from the committed
    /// metadata. Caller holds the top write mutex so the scan is
    /// consistent.
    fn rebuild_indexes(&self) -> Result<()> {
        let _g = self.refresh_mutex.lock();
        warn!("rebuilding in-memory indexes from committed metadata");
        self.chain.top().acknowledge_crash();
        self.reset_managers();
        for cc in self.chain.layers() {
            self.replay_layer(cc)?;
            cc.take_refresh_snapshot();
        }
        self.last_seen_updates
            .store(self.chain.top().read_update_count(), Ordering::Release);
        Ok(())
    }

    /// Replay anything peers committed to the top layer since our last
    /// snapshot. Re-entrant; safe to call with or without the write mutex.
    pub fn refresh(&self) -> Result<()> {
        let top = self.chain.top();
        if !top.updates_pending() && !top.crash_detected() {
            return Ok(());
        }
        let _g = self.refresh_mutex.lock();
        if top.crash_detected() {
            top.acknowledge_crash();
            self.reset_managers();
            for cc in self.chain.layers() {
                self.replay_layer(cc)?;
                cc.take_refresh_snapshot();
            }
        } else if top.updates_pending() {
            // Hold the shared read lock while walking; stale marking
            // drains readers by taking this lock exclusively.
            top.enter_read_lock()?;
            let replay = (|| {
                let (floor, prev) = top.take_refresh_snapshot();
                for item_ref in top.walk_between(prev, floor) {
                    self.dispatch(top, item_ref)?;
                }
                Ok(())
            })();
            top.exit_read_lock()?;
            replay?;
        }
        self.last_seen_updates
            .store(top.read_update_count(), Ordering::Release);
        Ok(())
    }

    fn enter_top_write(&self) -> Result<()> {
        let crashed = self.chain.top().enter_write_mutex()?;
        if crashed {
            self.rebuild_indexes()?;
        }
        Ok(())
    }

    /// Record an SRP that resolved outside the cache against the layer
    /// owning `image`, and build the error the caller propagates.
    fn srp_corrupt(&self, image: *const u8) -> ShrError {
        let context = image as u64;
        if let Some(off) = self.chain.to_offset(image) {
            if let Some(cc) = self.chain.cache(off.layer) {
                cc.set_corrupt(CorruptionCode::SrpOutOfRange, off.offset as u64);
            }
        }
        ShrError::Corrupt {
            code: CorruptionCode::SrpOutOfRange,
            context,
        }
    }

    // ---- find / store ROM classes ----

    /// Classpath-validated lookup. The caller holds the VM class-segment
    /// mutex for the duration (it is never taken inside the write mutex).
    pub fn find_rom_class(
        &self,
        name: &str,
        cp: &ClasspathItem,
        confirmed_entries: i32,
        partition: Option<&str>,
        mod_context: Option<&str>,
    ) -> Result<FindResult> {
        self.entry_checks()?;
        self.refresh()?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            let outcome = self.rcm.locate(
                &self.chain,
                &self.cpm,
                &self.scm,
                name,
                cp,
                -1,
                confirmed_entries,
                None,
                partition,
                mod_context,
            );
            match outcome {
                LocateOutcome::Found { item, wrapper, found_at_index, stale } => {
                    if let Some(s) = stale {
                        self.mark_stale(&s)?;
                    }
                    CacheCounters::add(&self.counters.find_hits, 1);
                    CacheCounters::add(&self.counters.bytes_read, wrapper.rom_size as u64);
                    if self.options.verbose.io {
                        info!("read {} bytes for class {name}", wrapper.rom_size);
                    }
                    return Ok(FindResult::Hit(FoundRomClass {
                        item,
                        image: wrapper.rom_class,
                        rom_size: wrapper.rom_size,
                        found_at_index,
                    }));
                }
                LocateOutcome::NotFound { try_wait } => {
                    if try_wait && attempts == 1 {
                        // A peer is likely mid-store; wait about as long as
                        // stores have been taking and look again.
                        let wait = self.write_wait.lock().suggested_wait();
                        std::thread::sleep(wait);
                        self.refresh()?;
                        continue;
                    }
                    CacheCounters::add(&self.counters.find_misses, 1);
                    return Ok(FindResult::Miss);
                }
                LocateOutcome::MarkCpeiStale { stale } => {
                    self.mark_stale(&stale)?;
                    if attempts < 2 {
                        continue;
                    }
                    CacheCounters::add(&self.counters.find_misses, 1);
                    return Ok(FindResult::Miss);
                }
                LocateOutcome::ClassTimestampChanged { item } => {
                    self.mark_item_stale(item)?;
                    CacheCounters::add(&self.counters.find_misses, 1);
                    return Ok(FindResult::Miss);
                }
                LocateOutcome::FoundShadow => {
                    return Ok(FindResult::Shadowed);
                }
            }
        }
    }

    /// Build (or dedup against) a ROM class and bind it to `cp` at
    /// `cpe_index`. The caller holds the VM class-segment mutex.
    pub fn store_rom_class(
        &self,
        bp: &RomClassBlueprint,
        cp: &ClasspathItem,
        cpe_index: i32,
        partition: Option<&str>,
        mod_context: Option<&str>,
    ) -> StoreResult<FoundRomClass> {
        self.entry_checks().map_err(store_err)?;
        let mut scratch = None;
        let bp = self.effective_blueprint(bp, &mut scratch);
        let start = Instant::now();
        self.enter_top_write().map_err(store_err)?;
        let result = (|| {
            self.refresh().map_err(store_err)?;
            self.store_rom_class_locked(bp, cp, cpe_index, partition, mod_context)
        })();
        let exit = self.chain.top().exit_write_mutex();
        self.write_wait.lock().record(start.elapsed());
        exit.map_err(store_err)?;
        result
    }

    fn store_rom_class_locked(
        &self,
        bp: &RomClassBlueprint,
        cp: &ClasspathItem,
        cpe_index: i32,
        partition: Option<&str>,
        mod_context: Option<&str>,
    ) -> StoreResult<FoundRomClass> {
        let top = self.chain.top();
        let entry = cp
            .item_at(cpe_index as usize)
            .ok_or_else(|| StoreError::Error(format!("cpe index {cpe_index} out of range")))?;
        let class_timestamp = match entry.protocol {
            crate::classpath::Protocol::Dir => {
                crate::platform::last_modified(&timestamp::class_file_path(&entry.path, &bp.name))
            }
            _ => 0,
        };

        let cached_cp = self.ensure_classpath(cp, cpe_index)?;
        let partition_off = match partition {
            Some(s) => Some(self.ensure_scope(s)?),
            None => None,
        };
        let mod_context_off = match mod_context {
            Some(s) => Some(self.ensure_scope(s)?),
            None => None,
        };
        let scoped = partition_off.is_some() || mod_context_off.is_some();

        // Reuse pass: an identical image already cached never gets written
        // twice; at most its metadata binding is added.
        let mut cursor = None;
        while let Some((existing, image)) = self.rcm.find_next_existing(&self.chain, &bp.name, cursor)
        {
            cursor = Some(existing);
            // SAFETY: image resolved from a committed wrapper; SRPs are
            // bounds-checked against the attached ranges as followed.
            match unsafe { image_matches_blueprint(image, self.chain.offsets(), bp) } {
                Ok(true) => {}
                Ok(false) => continue,
                Err(_) => return Err(store_err(self.srp_corrupt(image))),
            }
            let image_off = self
                .chain
                .to_offset(image)
                .ok_or_else(|| StoreError::Error("image outside chain".into()))?;
            // SAFETY: committed image.
            let rom_size = unsafe { romimage::rom_size(image) };
            let raw = self.chain.item_type_raw(existing);

            if raw == Some(ItemType::Orphan as u16) && !scoped && existing.layer == top.layer() {
                self.promote_orphan(existing, &cached_cp, cpe_index, class_timestamp)?;
                return Ok(FoundRomClass {
                    item: existing,
                    image: image_off,
                    rom_size,
                    found_at_index: cpe_index,
                });
            }
            if let Some(w) = read_wrapper(&self.chain, existing) {
                if raw.and_then(ItemType::from_raw).is_some_and(ItemType::is_rom_class_kind)
                    && classpath_item_of(&w) == Some(cached_cp.item)
                    && w.cpe_index == cpe_index
                {
                    // Exact binding already present.
                    return Ok(FoundRomClass {
                        item: existing,
                        image: image_off,
                        rom_size,
                        found_at_index: cpe_index,
                    });
                }
            }
            // Metadata-only wrapper referencing the shared image.
            let item_ref = self.write_rom_class_wrapper(
                image_off,
                rom_size,
                &cached_cp,
                cpe_index,
                class_timestamp,
                partition_off,
                mod_context_off,
                None,
            )?;
            return Ok(FoundRomClass {
                item: item_ref,
                image: image_off,
                rom_size,
                found_at_index: cpe_index,
            });
        }

        // Fresh build into the segment.
        let mut builder = RomClassBuilder::new(bp).map_err(store_err)?;
        let req = builder.measure(bp);
        let item_ref = self.write_rom_class_wrapper(
            ShrOffset::NULL,
            req.rom_class_size,
            &cached_cp,
            cpe_index,
            class_timestamp,
            partition_off,
            mod_context_off,
            Some((&mut builder, bp)),
        )?;
        let wrapper = read_wrapper(&self.chain, item_ref)
            .ok_or_else(|| StoreError::Error("wrapper readback failed".into()))?;
        CacheCounters::add(&self.counters.stores, 1);
        if self.options.verbose.io {
            info!("stored class {} ({} bytes)", bp.name, wrapper.rom_size);
        }
        Ok(FoundRomClass {
            item: item_ref,
            image: wrapper.rom_class,
            rom_size: wrapper.rom_size,
            found_at_index: cpe_index,
        })
    }

    /// Write one ROM class (or scoped) wrapper item. With a builder the
    /// image is laid down into freshly reserved segment bytes; without
    /// one, the wrapper references `image_off` (metadata-only commit).
    #[allow(clippy::too_many_arguments)]
    fn write_rom_class_wrapper(
        &self,
        image_off: ShrOffset,
        rom_size: u32,
        cached_cp: &CachedClasspath,
        cpe_index: i32,
        class_timestamp: i64,
        partition_off: Option<ShrOffset>,
        mod_context_off: Option<ShrOffset>,
        build: Option<(&mut RomClassBuilder, &RomClassBlueprint)>,
    ) -> StoreResult<ItemRef> {
        let top = self.chain.top();
        let scoped = partition_off.is_some() || mod_context_off.is_some();
        let (item_type, data_len) = if scoped {
            (
                ItemType::ScopedRomClass,
                core::mem::size_of::<ScopedRomClassWrapper>() as u32,
            )
        } else {
            (ItemType::RomClass, core::mem::size_of::<RomClassWrapper>() as u32)
        };
        let segment_len = if build.is_some() { rom_size } else { 0 };
        let pending = top
            .allocate(item_type, data_len, segment_len, AllocKind::Block)
            .map_err(|f| self.account_alloc_failure(f, segment_len + data_len))?;

        let (image_off, final_rom_size, anonymous) = match build {
            Some((builder, bp)) => {
                // SAFETY: pending reserved above; write mutex held.
                let seg = unsafe { top.pending_segment(&pending) };
                let bufs = AllocatedBuffers {
                    rom_class: seg.as_mut_ptr(),
                    rom_class_len: seg.len(),
                    line_number: None,
                    variable_info: None,
                };
                let ctx = InternCtx { manager: &self.intern, chain: &self.chain };
                // SAFETY: buffers sized from this builder's measure().
                let layout = unsafe { builder.layout(bp, &bufs, Some(&ctx)) }.map_err(store_err)?;
                let image_off = ShrOffset::new(top.layer(), pending.segment_offset);
                for (s, off) in &layout.written_utf8s {
                    self.intern.add(
                        s,
                        ShrOffset::new(
                            top.layer(),
                            pending.segment_offset + layout.utf8_region_offset + off,
                        ),
                    );
                }
                top.add_debug_bytes(
                    (req_line_bytes(bp)) as u32,
                    (req_var_bytes(bp)) as u32,
                );
                (image_off, layout.rom_size, bp.is_anonymous)
            }
            None => (image_off, rom_size, false),
        };

        let base = make_wrapper(
            image_off,
            final_rom_size,
            Some(cached_cp.item.data_shr_offset()),
            cpe_index,
            class_timestamp,
        );
        // SAFETY: pending from this allocate; write mutex held.
        let data = unsafe { top.pending_data(&pending) };
        if scoped {
            let wrapper = ScopedRomClassWrapper {
                base,
                partition: partition_off.unwrap_or(ShrOffset::NULL),
                mod_context: mod_context_off.unwrap_or(ShrOffset::NULL),
            };
            data.copy_from_slice(bytemuck::bytes_of(&wrapper));
        } else {
            data.copy_from_slice(bytemuck::bytes_of(&base));
        }

        let item_ref = pending.item;
        // Anonymous classes keep the over-reported reservation so nothing
        // else ever lands in their tail.
        let final_len = if anonymous { None } else { Some(final_rom_size) };
        top.commit(pending, if segment_len > 0 { final_len } else { None });
        self.rcm.store_new(&self.chain, item_ref);
        Ok(item_ref)
    }

    /// Fill an orphan's classpath binding and flip its type in place.
    fn promote_orphan(
        &self,
        orphan: ItemRef,
        cached_cp: &CachedClasspath,
        cpe_index: i32,
        class_timestamp: i64,
    ) -> StoreResult<()> {
        let top = self.chain.top();
        let cp_off = cached_cp.item.data_shr_offset();
        let base = top.base();
        let at = orphan.data_offset() as usize;
        // SAFETY: committed orphan payload has the full wrapper extent;
        // write mutex held; readers tolerate the orphan->romclass flip.
        unsafe {
            let w = base.add(at) as *mut RomClassWrapper;
            core::ptr::write_unaligned(
                core::ptr::addr_of_mut!((*w).cpe_index),
                cpe_index,
            );
            core::ptr::write_unaligned(core::ptr::addr_of_mut!((*w).classpath), cp_off);
            core::ptr::write_unaligned(
                core::ptr::addr_of_mut!((*w).timestamp),
                class_timestamp,
            );
        }
        top.set_item_type(orphan, ItemType::RomClass);
        top.bump_update_count();
        debug!("promoted orphan at {}:{}", orphan.layer, orphan.start);
        Ok(())
    }

    /// Store a ROM class image with no classpath binding (an orphan,
    /// awaiting promotion by the first bound store).
    pub fn store_orphan_rom_class(&self, bp: &RomClassBlueprint) -> StoreResult<FoundRomClass> {
        self.entry_checks().map_err(store_err)?;
        let mut scratch = None;
        let bp = self.effective_blueprint(bp, &mut scratch);
        self.enter_top_write().map_err(store_err)?;
        let result = (|| {
            self.refresh().map_err(store_err)?;
            let top = self.chain.top();
            // Identical image already cached: no second copy.
            let mut cursor = None;
            while let Some((existing, image)) =
                self.rcm.find_next_existing(&self.chain, &bp.name, cursor)
            {
                cursor = Some(existing);
                // SAFETY: image resolved from a committed wrapper; SRPs
                // are bounds-checked against the attached ranges.
                match unsafe { image_matches_blueprint(image, self.chain.offsets(), bp) } {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(_) => return Err(store_err(self.srp_corrupt(image))),
                }
                let image_off = self
                    .chain
                    .to_offset(image)
                    .ok_or_else(|| StoreError::Error("image outside chain".into()))?;
                // SAFETY: committed image.
                let rom_size = unsafe { romimage::rom_size(image) };
                return Ok(FoundRomClass {
                    item: existing,
                    image: image_off,
                    rom_size,
                    found_at_index: -1,
                });
            }
            let mut builder = RomClassBuilder::new(bp).map_err(store_err)?;
            let req = builder.measure(bp);
            let data_len = core::mem::size_of::<RomClassWrapper>() as u32;
            let pending = top
                .allocate(ItemType::Orphan, data_len, req.rom_class_size, AllocKind::Block)
                .map_err(|f| self.account_alloc_failure(f, req.rom_class_size + data_len))?;
            // SAFETY: pending reserved above; write mutex held.
            let seg = unsafe { top.pending_segment(&pending) };
            let bufs = AllocatedBuffers {
                rom_class: seg.as_mut_ptr(),
                rom_class_len: seg.len(),
                line_number: None,
                variable_info: None,
            };
            let ctx = InternCtx { manager: &self.intern, chain: &self.chain };
            // SAFETY: buffers sized from this builder's measure().
            let layout = unsafe { builder.layout(bp, &bufs, Some(&ctx)) }.map_err(store_err)?;
            let image_off = ShrOffset::new(top.layer(), pending.segment_offset);
            let wrapper = make_wrapper(image_off, layout.rom_size, None, -1, 0);
            // SAFETY: as above.
            unsafe { top.pending_data(&pending) }.copy_from_slice(bytemuck::bytes_of(&wrapper));
            let item_ref = pending.item;
            let final_len = if bp.is_anonymous { None } else { Some(layout.rom_size) };
            top.commit(pending, final_len);
            self.rcm.store_new(&self.chain, item_ref);
            Ok(FoundRomClass {
                item: item_ref,
                image: image_off,
                rom_size: layout.rom_size,
                found_at_index: -1,
            })
        })();
        self.chain.top().exit_write_mutex().map_err(store_err)?;
        result
    }

    /// Without `enableBCI` the raw class-file bytes are not worth cache
    /// space; strip them before measuring.
    fn effective_blueprint<'a>(
        &self,
        bp: &'a RomClassBlueprint,
        scratch: &'a mut Option<RomClassBlueprint>,
    ) -> &'a RomClassBlueprint {
        if self.options.enable_bci || bp.intermediate_data.is_empty() {
            return bp;
        }
        scratch.insert(RomClassBlueprint {
            intermediate_data: Vec::new(),
            ..bp.clone()
        })
    }

    fn account_alloc_failure(&self, f: AllocFailure, attempted: u32) -> StoreError {
        match f {
            AllocFailure::SoftMaxFull => {
                CacheCounters::add(&self.counters.softmx_unstored_bytes, attempted as u64);
                StoreError::Full
            }
            AllocFailure::AotFull => {
                CacheCounters::add(&self.counters.max_aot_unstored_bytes, attempted as u64);
                StoreError::Full
            }
            AllocFailure::JitFull => {
                CacheCounters::add(&self.counters.max_jit_unstored_bytes, attempted as u64);
                StoreError::Full
            }
            AllocFailure::BlockFull => StoreError::Full,
            AllocFailure::ReadOnly => StoreError::Error("cache is read-only".into()),
        }
    }

    /// Identical fresh classpath in the cache, or a newly written one.
    /// Runs under the write mutex.
    fn ensure_classpath(
        &self,
        cp: &ClasspathItem,
        cpe_index: i32,
    ) -> StoreResult<Arc<CachedClasspath>> {
        match self.cpm.update(&self.chain, cp, cpe_index) {
            UpdateOutcome::Existing(cached) => return Ok(cached),
            UpdateOutcome::StaleDetected(stale) => {
                self.mark_stale_locked(&stale).map_err(store_err)?;
            }
            UpdateOutcome::NotFound => {}
        }
        let top = self.chain.top();
        let payload = serialize_classpath(cp);
        let pending = top
            .allocate(ItemType::Classpath, payload.len() as u32, 0, AllocKind::Block)
            .map_err(|f| self.account_alloc_failure(f, payload.len() as u32))?;
        // SAFETY: pending from this allocate; write mutex held.
        unsafe { top.pending_data(&pending) }.copy_from_slice(&payload);
        let item_ref = pending.item;
        top.commit(pending, None);
        self.cpm.store_new(&self.chain, item_ref);
        self.cpm
            .get_cached(item_ref)
            .ok_or_else(|| StoreError::Error("classpath index failed".into()))
    }

    /// Interned scope string offset, writing the `Scope` item if new.
    /// Runs under the write mutex.
    fn ensure_scope(&self, s: &str) -> StoreResult<ShrOffset> {
        if let Some(off) = self.scm.find(s) {
            return Ok(off);
        }
        let top = self.chain.top();
        let mut payload = Vec::with_capacity(utf8_size(s.len()));
        payload.extend_from_slice(&(s.len() as u16).to_ne_bytes());
        payload.extend_from_slice(s.as_bytes());
        payload.resize(utf8_size(s.len()), 0);
        let pending = top
            .allocate(ItemType::Scope, payload.len() as u32, 0, AllocKind::Block)
            .map_err(|f| self.account_alloc_failure(f, payload.len() as u32))?;
        // SAFETY: pending from this allocate; write mutex held.
        unsafe { top.pending_data(&pending) }.copy_from_slice(&payload);
        let item_ref = pending.item;
        top.commit(pending, None);
        self.scm.store_new(&self.chain, item_ref, ItemType::Scope);
        self.intern.add(s, item_ref.data_shr_offset());
        Ok(item_ref.data_shr_offset())
    }

    // ---- staleness ----

    /// Mark a classpath entry stale: lower every containing classpath's
    /// stale-from index and set the stale bit of every ROM class wrapper
    /// the entry could have fed. One critical section with readers
    /// drained, then a single counter bump publishes the batch.
    pub fn mark_stale(&self, stale: &StaleRef) -> Result<()> {
        self.entry_checks()?;
        self.enter_top_write()?;
        let result = self.mark_stale_locked(stale);
        self.chain.top().exit_write_mutex()?;
        result
    }

    fn mark_stale_locked(&self, stale: &StaleRef) -> Result<()> {
        let top = self.chain.top();
        if stale.cp.layer != top.layer() {
            // Lower layers are immutable; their finds already fail the
            // timestamp comparison every time.
            warn!(
                "stale entry {} is in read-only layer {}; not marked",
                stale.path, stale.cp.layer
            );
            return Ok(());
        }
        top.lock_cache()?;
        let uses = self.cpm.uses_of(&stale.path);
        for u in &uses {
            if u.cp.layer == top.layer() {
                set_stale_from_index(&self.chain, u.cp, u.index);
            }
        }
        let mut marked = 0usize;
        for item_ref in top.walk(None) {
            let hdr = top.item_header(item_ref);
            let Some(ty) = ItemType::from_raw(hdr.item_type) else {
                continue;
            };
            if !ty.is_rom_class_kind() {
                continue;
            }
            let Some(w) = read_wrapper(&self.chain, item_ref) else {
                continue;
            };
            let Some(cp_item) = classpath_item_of(&w) else {
                continue;
            };
            for u in &uses {
                if u.cp == cp_item && w.cpe_index >= u.index as i32 {
                    top.mark_stale(item_ref);
                    marked += 1;
                    break;
                }
            }
        }
        top.bump_update_count();
        top.unlock_cache()?;
        info!("marked {} item(s) stale for entry {}", marked, stale.path);
        Ok(())
    }

    /// Mark one item stale (directory class file superseded on disk).
    pub fn mark_item_stale(&self, item_ref: ItemRef) -> Result<()> {
        let top = self.chain.top();
        if item_ref.layer != top.layer() {
            return Ok(());
        }
        self.enter_top_write()?;
        top.mark_stale(item_ref);
        top.bump_update_count();
        self.chain.top().exit_write_mutex()?;
        Ok(())
    }

    pub fn is_stale(&self, item_ref: ItemRef) -> bool {
        self.chain.is_stale(item_ref)
    }

    // ---- byte data ----

    #[allow(clippy::too_many_arguments)]
    pub fn store_byte_data(
        &self,
        key: &str,
        value: &[u8],
        kind: ByteDataKind,
        private: bool,
        single_store: bool,
    ) -> StoreResult<ShrOffset> {
        self.entry_checks().map_err(store_err)?;
        self.enter_top_write().map_err(store_err)?;
        let result = (|| {
            self.refresh().map_err(store_err)?;
            let top = self.chain.top();
            if single_store {
                if let Some(existing) = self.bdm.find_single_store(&self.chain, key, kind) {
                    let off = ShrOffset::new(
                        existing.layer,
                        existing.data_offset()
                            + core::mem::size_of::<crate::item::ByteDataWrapper>() as u32,
                    );
                    if bytedata::value_bytes(&self.chain, existing) == Some(value) {
                        return Ok(off);
                    }
                    if existing.layer == top.layer()
                        && self.bdm.update_in_place(&self.chain, existing, value)
                    {
                        return Ok(off);
                    }
                    return Err(StoreError::Exists);
                }
            }
            let key_off = self.ensure_scope(key)?;
            let wrapper = crate::item::ByteDataWrapper {
                key: key_off,
                data_len: value.len() as u32,
                private_owner: if private { top.jvm_id() as u32 } else { 0 },
                sub_kind: kind as u16,
                flags: (if private { crate::item::BDW_FLAG_PRIVATE } else { 0 })
                    | (if single_store { crate::item::BDW_FLAG_SINGLE_STORE } else { 0 }),
                reserved: 0,
            };
            let mut payload = bytemuck::bytes_of(&wrapper).to_vec();
            payload.extend_from_slice(value);
            let pending = top
                .allocate(ItemType::ByteData, payload.len() as u32, 0, AllocKind::Block)
                .map_err(|f| self.account_alloc_failure(f, payload.len() as u32))?;
            // SAFETY: pending from this allocate; write mutex held.
            unsafe { top.pending_data(&pending) }.copy_from_slice(&payload);
            let item_ref = pending.item;
            top.commit(pending, None);
            self.bdm.store_new(&self.chain, item_ref);
            Ok(ShrOffset::new(
                item_ref.layer,
                item_ref.data_offset() + core::mem::size_of::<crate::item::ByteDataWrapper>() as u32,
            ))
        })();
        self.chain.top().exit_write_mutex().map_err(store_err)?;
        result
    }

    pub fn find_byte_data(
        &self,
        key: &str,
        kind: Option<ByteDataKind>,
    ) -> Result<Vec<FoundByteData>> {
        self.entry_checks()?;
        self.refresh()?;
        Ok(self.bdm.find(
            &self.chain,
            key,
            kind,
            false,
            self.chain.top().jvm_id() as u32,
        ))
    }

    pub fn acquire_private_byte_data(&self, item_ref: ItemRef) -> Result<bool> {
        self.entry_checks()?;
        self.enter_top_write()?;
        let ok = self
            .bdm
            .acquire_private(&self.chain, item_ref, self.chain.top().jvm_id() as u32);
        self.chain.top().exit_write_mutex()?;
        Ok(ok)
    }

    pub fn release_private_byte_data(&self, item_ref: ItemRef) -> Result<bool> {
        self.entry_checks()?;
        self.enter_top_write()?;
        let ok = self
            .bdm
            .release_private(&self.chain, item_ref, self.chain.top().jvm_id() as u32);
        self.chain.top().exit_write_mutex()?;
        Ok(ok)
    }

    // ---- compiled methods ----

    pub fn store_compiled_method(
        &self,
        rom_method: ShrOffset,
        data: &[u8],
        code: &[u8],
        force_replace: bool,
    ) -> StoreResult<ShrOffset> {
        self.entry_checks().map_err(store_err)?;
        self.enter_top_write().map_err(store_err)?;
        let result = (|| {
            self.refresh().map_err(store_err)?;
            let top = self.chain.top();
            if let Some((existing, ty)) = self.cmm.find_any(&self.chain, rom_method) {
                if !force_replace {
                    return Err(match ty {
                        ItemType::InvalidatedCompiledMethod => StoreError::Invalidated,
                        _ => StoreError::Exists,
                    });
                }
                if existing.layer == top.layer() {
                    top.mark_stale(existing);
                }
            }
            let wrapper = crate::item::MethodDataWrapper {
                rom_method,
                data_len: data.len() as u32,
                code_len: code.len() as u32,
            };
            let mut payload = bytemuck::bytes_of(&wrapper).to_vec();
            payload.extend_from_slice(data);
            payload.extend_from_slice(code);
            let pending = top
                .allocate(ItemType::CompiledMethod, payload.len() as u32, 0, AllocKind::Aot)
                .map_err(|f| self.account_alloc_failure(f, payload.len() as u32))?;
            // SAFETY: pending from this allocate; write mutex held.
            unsafe { top.pending_data(&pending) }.copy_from_slice(&payload);
            let item_ref = pending.item;
            top.commit(pending, None);
            top.add_typed_bytes(AllocKind::Aot, payload.len() as u32);
            self.cmm.store_new(&self.chain, item_ref);
            if self.options.verbose.aot {
                info!("stored {} bytes of compiled code", payload.len());
            }
            Ok(ShrOffset::new(
                item_ref.layer,
                item_ref.data_offset()
                    + core::mem::size_of::<crate::item::MethodDataWrapper>() as u32
                    + data.len() as u32,
            ))
        })();
        self.chain.top().exit_write_mutex().map_err(store_err)?;
        result
    }

    pub fn find_compiled_method(&self, rom_method: ShrOffset) -> Result<Option<FoundCompiledMethod>> {
        self.entry_checks()?;
        self.refresh()?;
        Ok(self.cmm.find(&self.chain, rom_method))
    }

    /// Hot-path peek: no refresh, no locks.
    pub fn exists_cached_code_for_method(&self, rom_method: ShrOffset) -> bool {
        self.cmm.exists_for_method(&self.chain, rom_method)
    }

    /// Iterate cached images for a class name, orphans included. Pass the
    /// previous item back to continue.
    pub fn find_next_rom_class(
        &self,
        name: &str,
        after: Option<ItemRef>,
    ) -> Option<(ItemRef, ShrOffset)> {
        let (item_ref, image) = self.rcm.find_next_existing(&self.chain, name, after)?;
        Some((item_ref, self.chain.to_offset(image)?))
    }

    /// The top layer's full-flag set, re-read at refresh points by policy
    /// code deciding whether further stores are worth attempting.
    pub fn runtime_full_flags(&self) -> u32 {
        self.chain.top().full_flags()
    }

    // ---- attached data ----

    pub fn store_attached_data(
        &self,
        rom_method: ShrOffset,
        sub_type: u16,
        value: &[u8],
    ) -> StoreResult<ShrOffset> {
        self.entry_checks().map_err(store_err)?;
        self.enter_top_write().map_err(store_err)?;
        let result = (|| {
            self.refresh().map_err(store_err)?;
            let top = self.chain.top();
            if self.adm.find(&self.chain, rom_method, sub_type).is_some() {
                return Err(StoreError::Exists);
            }
            let wrapper = crate::item::AttachedDataWrapper {
                rom_method,
                data_len: value.len() as u32,
                corrupt_offset: crate::item::ATTACHED_DATA_QUIESCENT,
                sub_type,
                update_count: 0,
                reserved: 0,
            };
            let mut payload = bytemuck::bytes_of(&wrapper).to_vec();
            payload.extend_from_slice(value);
            let pending = top
                .allocate(ItemType::AttachedData, payload.len() as u32, 0, AllocKind::Jit)
                .map_err(|f| self.account_alloc_failure(f, payload.len() as u32))?;
            // SAFETY: pending from this allocate; write mutex held.
            unsafe { top.pending_data(&pending) }.copy_from_slice(&payload);
            let item_ref = pending.item;
            top.commit(pending, None);
            top.add_typed_bytes(AllocKind::Jit, payload.len() as u32);
            self.adm.store_new(&self.chain, item_ref);
            if self.options.verbose.jit_data {
                info!("stored {} bytes of jit data", payload.len());
            }
            Ok(ShrOffset::new(
                item_ref.layer,
                item_ref.data_offset() + core::mem::size_of::<crate::item::AttachedDataWrapper>() as u32,
            ))
        })();
        self.chain.top().exit_write_mutex().map_err(store_err)?;
        result
    }

    pub fn find_attached_data(
        &self,
        rom_method: ShrOffset,
        sub_type: u16,
    ) -> Result<Option<FoundAttachedData>> {
        self.entry_checks()?;
        self.refresh()?;
        Ok(self.adm.find(&self.chain, rom_method, sub_type))
    }

    pub fn update_attached_data(
        &self,
        rom_method: ShrOffset,
        sub_type: u16,
        at_offset: u32,
        bytes: &[u8],
    ) -> StoreResult<()> {
        self.entry_checks().map_err(store_err)?;
        self.enter_top_write().map_err(store_err)?;
        let result = (|| {
            self.refresh().map_err(store_err)?;
            let Some(found) = self.adm.find(&self.chain, rom_method, sub_type) else {
                return Err(StoreError::Error("no attached data record".into()));
            };
            if found.item.layer != self.chain.top().layer() {
                return Err(StoreError::Error("record is in a read-only layer".into()));
            }
            if self.adm.update_in_place(&self.chain, found.item, at_offset, bytes) {
                Ok(())
            } else {
                Err(StoreError::Error("update out of bounds".into()))
            }
        })();
        self.chain.top().exit_write_mutex().map_err(store_err)?;
        result
    }

    // ---- AOT method operations ----

    /// Apply `action` to every cached compiled method matching the
    /// comma-separated wildcard spec list. Returns how many records
    /// matched.
    pub fn aot_method_operation(&self, specs: &str, action: aot::AotAction) -> Result<usize> {
        let specs = aot::parse_method_specs(specs)
            .ok_or_else(|| ShrError::Incompatible(format!("bad method spec '{specs}'")))?;
        self.entry_checks()?;
        self.enter_top_write()?;
        let result = (|| {
            self.refresh()?;

            // Image extents across the chain, for owner lookup.
            let mut images: Vec<(usize, usize)> = Vec::new();
            for cc in self.chain.layers() {
                for item_ref in cc.walk(None) {
                    let hdr = cc.item_header(item_ref);
                    let Some(ty) = ItemType::from_raw(hdr.item_type) else {
                        continue;
                    };
                    if ty != ItemType::Orphan && !ty.is_rom_class_kind() {
                        continue;
                    }
                    let Some(w) = read_wrapper(&self.chain, item_ref) else {
                        continue;
                    };
                    if let Some(p) = self.chain.resolve(w.rom_class) {
                        images.push((p as usize, w.rom_size as usize));
                    }
                }
            }

            let top = self.chain.top();
            let mut matched = 0usize;
            let mut flipped = false;
            for cc in self.chain.layers() {
                for item_ref in cc.walk(None) {
                    let hdr = cc.item_header(item_ref);
                    let ty = ItemType::from_raw(hdr.item_type);
                    let invalidated = ty == Some(ItemType::InvalidatedCompiledMethod);
                    if ty != Some(ItemType::CompiledMethod) && !invalidated {
                        continue;
                    }
                    let Some(w) = crate::resource::read_method_wrapper(&self.chain, item_ref)
                    else {
                        continue;
                    };
                    let Some(addr) = self.chain.resolve(w.rom_method) else {
                        continue;
                    };
                    let Some((image, _)) = images
                        .iter()
                        .find(|(start, size)| {
                            (addr as usize) >= *start && (addr as usize) < start + size
                        })
                        .copied()
                    else {
                        continue;
                    };
                    // SAFETY: image extents collected from committed
                    // wrappers above; SRPs bounds-checked as followed.
                    let (class, method, sig) = unsafe {
                        let image = image as *const u8;
                        let Some(view) = romimage::method_at(image, addr) else {
                            continue;
                        };
                        let table = self.chain.offsets();
                        let class = romimage::class_name(image, table)
                            .map_err(|_| self.srp_corrupt(image))?;
                        let method = view.name(table).map_err(|_| self.srp_corrupt(image))?;
                        let sig = view.signature(table).map_err(|_| self.srp_corrupt(image))?;
                        (
                            class.unwrap_or(""),
                            method.unwrap_or(""),
                            sig.unwrap_or(""),
                        )
                    };
                    if !aot::specs_match(&specs, class, method, sig) {
                        continue;
                    }
                    match action {
                        aot::AotAction::Invalidate if !invalidated => {
                            if item_ref.layer == top.layer() {
                                top.set_item_type(item_ref, ItemType::InvalidatedCompiledMethod);
                                matched += 1;
                                flipped = true;
                            }
                        }
                        aot::AotAction::Revalidate if invalidated => {
                            if item_ref.layer == top.layer() {
                                top.set_item_type(item_ref, ItemType::CompiledMethod);
                                matched += 1;
                                flipped = true;
                            }
                        }
                        aot::AotAction::Find => {
                            info!("aot method: {class}.{method}({sig})");
                            matched += 1;
                        }
                        _ => {}
                    }
                }
            }
            if flipped {
                top.bump_update_count();
            }
            Ok(matched)
        })();
        self.chain.top().exit_write_mutex()?;
        result
    }

    // ---- stats / shutdown ----

    pub fn get_javacore_data(&self) -> JavacoreData {
        let mut data = JavacoreData::default();
        for cc in self.chain.layers() {
            stats::collect_layer(cc, &mut data);
        }
        stats::finish(&mut data, &self.counters);
        data
    }

    /// Print the stats rows the `printStats` knob asks for.
    pub fn print_cache_stats(&self) {
        let d = self.get_javacore_data();
        info!("cache '{}' statistics", self.options.cache_name);
        info!("  layers: {}  total: {}  free: {}", d.layer_count, d.total_size, d.free_bytes);
        info!("  softmx: {}  {}% full, {}% stale", d.softmx, d.percent_full, d.percent_stale);
        info!(
            "  ROM classes: {} ({} bytes), orphans: {}",
            d.rom_class_count, d.rom_class_bytes, d.orphan_count
        );
        info!("  classpaths: {}  scopes: {}", d.classpath_count, d.scope_count);
        info!("  byte data: {} ({} bytes)", d.byte_data_count, d.byte_data_bytes);
        info!(
            "  AOT: {} ({} bytes, {} invalidated)  JIT data: {} ({} bytes)",
            d.compiled_method_count,
            d.compiled_method_bytes,
            d.invalidated_method_count,
            d.attached_data_count,
            d.attached_data_bytes
        );
    }

    pub fn print_shutdown_stats(&self) {
        info!(
            "cache '{}' shutdown: {} reads ({} bytes), {} stores, {} misses",
            self.options.cache_name,
            CacheCounters::get(&self.counters.find_hits),
            CacheCounters::get(&self.counters.bytes_read),
            CacheCounters::get(&self.counters.stores),
            CacheCounters::get(&self.counters.find_misses),
        );
    }

    /// Orderly shutdown: flush, clear the monotonic full flags, detach.
    pub fn shutdown(self) -> Result<()> {
        self.print_shutdown_stats();
        let top = self.chain.top();
        if !top.is_readonly() {
            top.enter_write_mutex()?;
            top.reset_full_flags();
            top.exit_write_mutex()?;
            top.sync()?;
        }
        top.detach_jvm();
        Ok(())
    }

    /// Destroy the whole chain: delete every layer file.
    pub fn destroy(self) -> Result<()> {
        warn!("destroying cache '{}'", self.options.cache_name);
        for cc in self.chain.layers() {
            cc.delete()?;
        }
        Ok(())
    }
}

fn store_err(e: ShrError) -> StoreError {
    StoreError::Error(e.to_string())
}

fn req_line_bytes(bp: &RomClassBlueprint) -> usize {
    bp.methods.iter().map(|m| m.line_numbers.len()).sum()
}

fn req_var_bytes(bp: &RomClassBlueprint) -> usize {
    bp.methods.iter().map(|m| m.variable_info.len()).sum()
}
