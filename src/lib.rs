//! shrcache: a cross-process shared class cache.
//!
//! A memory-mapped region (one file per layer) holds serialized class
//! representations (ROM classes), ancillary metadata (classpaths, scopes,
//! compiled-method bodies, JIT hints, generic byte-data records), and a
//! cross-process lock protocol giving many processes single-writer,
//! multi-reader access to the same file. A layered composition lets a top
//! (writable) cache reference immutable prior layers by unique id.
//!
//! The crate implements the cache map layer: attach and compose a layer
//! chain, drive the append-only write protocol, rebuild in-memory indexes
//! by replaying metadata, and serve classpath-validated lookups with
//! staleness marking.
//!
//! # Usage
//!
//! ```ignore
//! let opts = shrcache::CacheOptions::new("/tmp/shr", "main");
//! let cache = shrcache::CacheMap::startup(opts)?;
//! let cp = shrcache::ClasspathItem::classpath(0, vec![
//!     shrcache::ClasspathEntry::jar("/app/a.jar", mtime),
//! ]);
//! match cache.find_rom_class("pkg/Foo", &cp, -1, None, None)? {
//!     shrcache::FindResult::Hit(found) => { /* use found.image */ }
//!     _ => { /* parse and store_rom_class */ }
//! }
//! ```

pub mod alloc_strategy;
pub mod aot;
pub mod builder;
pub mod bytedata;
pub mod cache_map;
pub mod chain;
pub mod classpath;
pub mod composite;
pub mod config;
pub mod cursor;
pub mod error;
pub mod intern;
pub mod item;
pub mod offset;
pub mod platform;
pub mod resource;
pub mod romclass;
pub mod romimage;
pub mod scope;
pub mod srp;
pub mod stats;
pub mod timestamp;

pub use aot::AotAction;
pub use builder::{MethodBlueprint, RomClassBlueprint};
pub use cache_map::{CacheMap, FindResult, FoundRomClass};
pub use classpath::{ClasspathEntry, ClasspathItem, ClasspathKind, Protocol};
pub use config::{CacheOptions, VerboseFlags};
pub use error::{BuildResult, Result, ShrError, StoreError, StoreResult};
pub use item::ByteDataKind;
pub use offset::ShrOffset;
pub use stats::JavacoreData;
