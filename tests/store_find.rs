//! Store-then-find across re-attach, store idempotence, and the soft-max
//! full path.

use shrcache::builder::{MethodBlueprint, RomClassBlueprint};
use shrcache::cache_map::{CacheMap, FindResult};
use shrcache::classpath::{ClasspathEntry, ClasspathItem};
use shrcache::config::CacheOptions;
use shrcache::error::StoreError;
use shrcache::item::ByteDataKind;
use shrcache::platform;
use shrcache::stats::CacheCounters;

fn blueprint(name: &str) -> RomClassBlueprint {
    RomClassBlueprint {
        name: name.into(),
        superclass: Some("java/lang/Object".into()),
        interfaces: vec![],
        modifiers: 0x21,
        is_anonymous: false,
        has_modified_bytecodes: false,
        intermediate_data: vec![],
        methods: vec![MethodBlueprint {
            name: "<init>".into(),
            signature: "()V".into(),
            modifiers: 0x1,
            bytecodes: vec![0x2A, 0xB7, 0x00, 0x01, 0xB1],
            line_numbers: vec![1, 2],
            variable_info: vec![],
        }],
    }
}

/// A classpath of one jar on disk, stamped with its real mtime.
fn jar_classpath(dir: &std::path::Path) -> ClasspathItem {
    let jar = dir.join("a.jar");
    if !jar.exists() {
        std::fs::write(&jar, b"PK\x03\x04").unwrap();
    }
    let mtime = platform::last_modified(&jar);
    assert!(mtime > 0);
    ClasspathItem::classpath(1, vec![ClasspathEntry::jar(jar.to_str().unwrap(), mtime)])
}

fn options(dir: &std::path::Path) -> CacheOptions {
    let _ = env_logger::builder().is_test(true).try_init();
    CacheOptions::new(dir.join("cache"), "test")
}

#[test]
fn store_then_find_same_attach() {
    let dir = tempfile::tempdir().unwrap();
    let cache = CacheMap::startup(options(dir.path())).unwrap();
    let cp = jar_classpath(dir.path());

    let stored = cache
        .store_rom_class(&blueprint("pkg/Foo"), &cp, 0, None, None)
        .unwrap();
    assert!(stored.rom_size > 0);

    match cache.find_rom_class("pkg/Foo", &cp, -1, None, None).unwrap() {
        FindResult::Hit(found) => {
            assert_eq!(found.image, stored.image);
            assert_eq!(found.found_at_index, 0);
        }
        other => panic!("expected hit, got {other:?}"),
    }
    assert!(matches!(
        cache.find_rom_class("pkg/Missing", &cp, -1, None, None).unwrap(),
        FindResult::Miss
    ));
}

#[test]
fn find_after_reattach_counts_bytes_read() {
    let dir = tempfile::tempdir().unwrap();
    let cp = jar_classpath(dir.path());
    let stored = {
        let cache = CacheMap::startup(options(dir.path())).unwrap();
        cache
            .store_rom_class(&blueprint("pkg/Foo"), &cp, 0, None, None)
            .unwrap()
    };

    // Second attach models the second process of the scenario.
    let cache = CacheMap::startup(options(dir.path())).unwrap();
    match cache.find_rom_class("pkg/Foo", &cp, -1, None, None).unwrap() {
        FindResult::Hit(found) => {
            assert_eq!(found.found_at_index, 0);
            assert_eq!(found.rom_size, stored.rom_size);
            assert_eq!(found.image, stored.image);
            // The image resolves in this process's mapping too.
            let p = cache.address_of(found.image).unwrap();
            unsafe {
                assert_eq!(
                    shrcache::romimage::class_name(p, cache.chain().offsets()),
                    Ok(Some("pkg/Foo"))
                );
            }
        }
        other => panic!("expected hit, got {other:?}"),
    }
    assert_eq!(
        CacheCounters::get(&cache.counters().bytes_read),
        stored.rom_size as u64
    );
}

#[test]
fn store_twice_returns_same_image() {
    let dir = tempfile::tempdir().unwrap();
    let cache = CacheMap::startup(options(dir.path())).unwrap();
    let cp = jar_classpath(dir.path());

    let first = cache
        .store_rom_class(&blueprint("pkg/Foo"), &cp, 0, None, None)
        .unwrap();
    let second = cache
        .store_rom_class(&blueprint("pkg/Foo"), &cp, 0, None, None)
        .unwrap();
    assert_eq!(first.image, second.image);
    assert_eq!(first.item, second.item);

    // Exactly one ROM class in the metadata.
    assert_eq!(cache.get_javacore_data().rom_class_count, 1);
}

#[test]
fn confirmed_entries_limit_is_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let cache = CacheMap::startup(options(dir.path())).unwrap();
    let jar_a = dir.path().join("a.jar");
    let jar_b = dir.path().join("b.jar");
    std::fs::write(&jar_a, b"a").unwrap();
    std::fs::write(&jar_b, b"b").unwrap();
    let cp = ClasspathItem::classpath(
        1,
        vec![
            ClasspathEntry::jar(jar_a.to_str().unwrap(), platform::last_modified(&jar_a)),
            ClasspathEntry::jar(jar_b.to_str().unwrap(), platform::last_modified(&jar_b)),
        ],
    );
    cache
        .store_rom_class(&blueprint("pkg/Foo"), &cp, 1, None, None)
        .unwrap();

    // Stored at index 1; with only 1 entry confirmed it must not match.
    assert!(matches!(
        cache.find_rom_class("pkg/Foo", &cp, 1, None, None).unwrap(),
        FindResult::Miss
    ));
    match cache.find_rom_class("pkg/Foo", &cp, 2, None, None).unwrap() {
        FindResult::Hit(found) => assert_eq!(found.found_at_index, 1),
        other => panic!("expected hit, got {other:?}"),
    }
}

#[test]
fn softmx_reached_reports_store_full() {
    let dir = tempfile::tempdir().unwrap();
    let cache = CacheMap::startup(options(dir.path())).unwrap();
    let cp = jar_classpath(dir.path());

    cache
        .store_rom_class(&blueprint("pkg/Foo"), &cp, 0, None, None)
        .unwrap();

    let top = cache.chain().top();
    top.set_softmx(top.used_bytes() + 64);

    let mut big = blueprint("pkg/Big");
    big.methods[0].bytecodes = vec![0; 1024];
    let err = cache
        .store_rom_class(&big, &cp, 0, None, None)
        .unwrap_err();
    assert_eq!(err, StoreError::Full);
    assert!(CacheCounters::get(&cache.counters().softmx_unstored_bytes) > 0);

    // Existing classes still find.
    assert!(
        cache
            .find_rom_class("pkg/Foo", &cp, -1, None, None)
            .unwrap()
            .hit()
            .is_some()
    );
}

#[test]
fn byte_data_single_store_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let cache = CacheMap::startup(options(dir.path())).unwrap();

    let first = cache
        .store_byte_data("hints", b"payload!", ByteDataKind::StartupHints, false, true)
        .unwrap();
    let second = cache
        .store_byte_data("hints", b"payload!", ByteDataKind::StartupHints, false, true)
        .unwrap();
    assert_eq!(first, second);

    // Same-length replacement overwrites in place.
    let third = cache
        .store_byte_data("hints", b"PAYLOAD?", ByteDataKind::StartupHints, false, true)
        .unwrap();
    assert_eq!(first, third);
    let found = cache
        .find_byte_data("hints", Some(ByteDataKind::StartupHints))
        .unwrap();
    assert_eq!(found.len(), 1);
    let p = cache.address_of(found[0].data).unwrap();
    let bytes = unsafe { core::slice::from_raw_parts(p, found[0].data_len as usize) };
    assert_eq!(bytes, b"PAYLOAD?");

    // A different length cannot replace a single-store record.
    let err = cache
        .store_byte_data("hints", b"longer-payload", ByteDataKind::StartupHints, false, true)
        .unwrap_err();
    assert_eq!(err, StoreError::Exists);
}

#[test]
fn compiled_method_store_find_and_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let cache = CacheMap::startup(options(dir.path())).unwrap();
    let cp = jar_classpath(dir.path());
    let stored = cache
        .store_rom_class(&blueprint("pkg/Foo"), &cp, 0, None, None)
        .unwrap();

    // Key the compiled body by the first method record of the image.
    let image = cache.address_of(stored.image).unwrap();
    let method = unsafe { shrcache::romimage::methods(image).next().unwrap() };
    let rom_method = cache.chain().to_offset(method.record).unwrap();

    assert!(!cache.exists_cached_code_for_method(rom_method));
    cache
        .store_compiled_method(rom_method, b"relocs", b"machine-code", false)
        .unwrap();
    assert!(cache.exists_cached_code_for_method(rom_method));

    let found = cache.find_compiled_method(rom_method).unwrap().unwrap();
    assert_eq!(found.data_len, 6);
    assert_eq!(found.code_len, 12);

    let err = cache
        .store_compiled_method(rom_method, b"relocs", b"machine-code", false)
        .unwrap_err();
    assert_eq!(err, StoreError::Exists);
    // Force-replace stales the old record and stores a new one.
    cache
        .store_compiled_method(rom_method, b"relocs2", b"machine-code2", true)
        .unwrap();
    let found = cache.find_compiled_method(rom_method).unwrap().unwrap();
    assert_eq!(found.data_len, 7);
}

#[test]
fn attached_data_update_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let cache = CacheMap::startup(options(dir.path())).unwrap();
    let cp = jar_classpath(dir.path());
    let stored = cache
        .store_rom_class(&blueprint("pkg/Foo"), &cp, 0, None, None)
        .unwrap();
    let image = cache.address_of(stored.image).unwrap();
    let method = unsafe { shrcache::romimage::methods(image).next().unwrap() };
    let rom_method = cache.chain().to_offset(method.record).unwrap();

    cache
        .store_attached_data(rom_method, 1, b"profile0")
        .unwrap();
    assert_eq!(
        cache.store_attached_data(rom_method, 1, b"again").unwrap_err(),
        StoreError::Exists
    );
    cache
        .update_attached_data(rom_method, 1, 7, b"9")
        .unwrap();
    let found = cache.find_attached_data(rom_method, 1).unwrap().unwrap();
    assert_eq!(found.update_count, 1);
    let p = cache.address_of(found.data).unwrap();
    let bytes = unsafe { core::slice::from_raw_parts(p, found.data_len as usize) };
    assert_eq!(bytes, b"profile9");
}
