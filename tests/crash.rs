//! Interrupted-writer recovery and the concurrent store race.

use std::sync::Arc;

use shrcache::builder::{MethodBlueprint, RomClassBlueprint};
use shrcache::cache_map::CacheMap;
use shrcache::classpath::{ClasspathEntry, ClasspathItem};
use shrcache::composite::{AllocKind, CompositeCache};
use shrcache::config::CacheOptions;
use shrcache::item::ItemType;
use shrcache::platform;

fn blueprint(name: &str) -> RomClassBlueprint {
    RomClassBlueprint {
        name: name.into(),
        superclass: Some("java/lang/Object".into()),
        modifiers: 0x21,
        methods: vec![MethodBlueprint {
            name: "run".into(),
            signature: "()V".into(),
            modifiers: 0x1,
            bytecodes: vec![0xB1, 0x00, 0x00],
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn options(dir: &std::path::Path) -> CacheOptions {
    let _ = env_logger::builder().is_test(true).try_init();
    CacheOptions::new(dir.join("cache"), "test")
}

fn jar_classpath(dir: &std::path::Path) -> ClasspathItem {
    let jar = dir.join("a.jar");
    if !jar.exists() {
        std::fs::write(&jar, b"PK").unwrap();
    }
    ClasspathItem::classpath(
        1,
        vec![ClasspathEntry::jar(jar.to_str().unwrap(), platform::last_modified(&jar))],
    )
}

#[test]
fn interrupted_writer_leaves_committed_tail_usable() {
    let dir = tempfile::tempdir().unwrap();
    let cp = jar_classpath(dir.path());
    let layer_path = options(dir.path()).layer_path(0);

    {
        let cache = CacheMap::startup(options(dir.path())).unwrap();
        cache
            .store_rom_class(&blueprint("pkg/Foo"), &cp, 0, None, None)
            .unwrap();
    }

    // Writer that dies after allocating but before committing.
    let seg_before;
    {
        let cc = CompositeCache::open(&layer_path, 0, false).unwrap();
        cc.attach_jvm().unwrap();
        cc.enter_write_mutex().unwrap();
        seg_before = cc.seg_ptr();
        let pending = cc
            .allocate(ItemType::Scope, 64, 512, AllocKind::Block)
            .unwrap();
        unsafe { cc.pending_data(&pending) }.fill(0xDD);
        unsafe { cc.pending_segment(&pending) }.fill(0xEE);
        // No commit, no orderly exit: dropping models process death (the
        // OS releases the record lock; the header still names the writer).
        drop(cc);
    }

    // The next attacher notices the crash and rebuilds from the tail.
    let cache = CacheMap::startup(options(dir.path())).unwrap();
    assert!(cache.chain().top().crash_count() >= 1);
    // The partial allocation never became reachable.
    assert_eq!(cache.chain().top().seg_ptr(), seg_before);
    assert!(cache.find_rom_class("pkg/Foo", &cp, -1, None, None).unwrap().hit().is_some());

    // The next store overwrites the abandoned bytes.
    let stored = cache
        .store_rom_class(&blueprint("pkg/Bar"), &cp, 0, None, None)
        .unwrap();
    assert_eq!(stored.image.offset, seg_before);
}

#[test]
fn concurrent_identical_stores_dedup_to_one_wrapper() {
    let dir = tempfile::tempdir().unwrap();
    let cp_template = jar_classpath(dir.path());
    let jar_path = cp_template.entries[0].path.clone();
    let mtime = cp_template.entries[0].timestamp;

    let a = Arc::new(CacheMap::startup(options(dir.path())).unwrap());
    let b = Arc::new(CacheMap::startup(options(dir.path())).unwrap());

    let spawn_store = |cache: Arc<CacheMap>, jar: String, mtime: i64| {
        std::thread::spawn(move || {
            let cp = ClasspathItem::classpath(1, vec![ClasspathEntry::jar(jar, mtime)]);
            cache
                .store_rom_class(&blueprint("pkg/Race"), &cp, 0, None, None)
                .unwrap()
        })
    };
    let ta = spawn_store(a.clone(), jar_path.clone(), mtime);
    let tb = spawn_store(b.clone(), jar_path.clone(), mtime);
    let ra = ta.join().unwrap();
    let rb = tb.join().unwrap();

    // Both callers got the same image.
    assert_eq!(ra.image, rb.image);

    // Exactly one ROM class wrapper exists for the class.
    let fresh = CacheMap::startup(options(dir.path())).unwrap();
    let mut wrappers = 0;
    for item in fresh.chain().top().walk(None) {
        let hdr = fresh.chain().top().item_header(item);
        if hdr.item_type == ItemType::RomClass as u16
            || hdr.item_type == ItemType::ScopedRomClass as u16
        {
            wrappers += 1;
        }
    }
    assert_eq!(wrappers, 1);
}

#[test]
fn crash_during_other_process_write_rebuilds_indexes() {
    let dir = tempfile::tempdir().unwrap();
    let cp = jar_classpath(dir.path());
    let layer_path = options(dir.path()).layer_path(0);

    let cache = CacheMap::startup(options(dir.path())).unwrap();
    cache
        .store_rom_class(&blueprint("pkg/Foo"), &cp, 0, None, None)
        .unwrap();

    // A peer stores a class and commits, then dies holding the mutex.
    {
        let peer = CacheMap::startup(options(dir.path())).unwrap();
        peer.store_rom_class(&blueprint("pkg/Peer"), &cp, 0, None, None)
            .unwrap();
        let cc = CompositeCache::open(&layer_path, 0, false).unwrap();
        cc.attach_jvm().unwrap();
        cc.enter_write_mutex().unwrap();
        // Dies holding the write mutex; the lock dies with the process.
        drop(cc);
    }

    // Our next store detects the dead writer, bumps the crash counter,
    // rebuilds, and still sees both classes.
    cache
        .store_rom_class(&blueprint("pkg/Bar"), &cp, 0, None, None)
        .unwrap();
    assert!(cache.chain().top().crash_count() >= 1);
    for name in ["pkg/Foo", "pkg/Peer", "pkg/Bar"] {
        assert!(
            cache.find_rom_class(name, &cp, -1, None, None).unwrap().hit().is_some(),
            "lost {name} after crash recovery"
        );
    }
}
