//! Interception of `OatHeader` key-value store accesses inside dex2oat.
//!
//! Depending on the ART version, the compiler either reads the store through
//! `OatHeader::GetKeyValueStore` (and its size through `GetKeyValueStoreSize`), or only touches it
//! again when `OatHeader::ComputeChecksum` runs. The accessor pair is hooked when the compiler
//! imports it, the checksum routine otherwise. Either way the store is spoofed before anything
//! derived from it is written out.
//!
//! # Concurrency
//!
//! The host finalizes each header from a single thread. Sizes changed by a rewrite are kept per
//! header behind a mutex, so concurrent calls on different headers stay consistent as well. A kept
//! size is only reported while the header still holds the size it replaced or the new one, and is
//! dropped as soon as another header shows up at the same address.

use std::collections::BTreeMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use tracing::{debug, error, info, info_span, warn};

use crate::key_value_store::{self, SizeHint};
use crate::oat_header::{OatHeader, OatHeaderLayout};
use crate::plt_hook::{self, MapInfo, PltHooker};
use crate::Result;

/// Path fragment identifying the compiler's mapping.
pub const TARGET_FRAGMENT: &str = "bin/dex2oat";

/// Environment variable overriding the compiler path written into the command line.
pub const CMD_OVERRIDE_ENV: &str = "DEX2OAT_CMD";

/// Declared store sizes at or above this are not trusted.
pub const MAX_STORE_SIZE: u32 = 64 * 1024;

/// How far past the store start a store of unknown size is searched.
pub const DISCOVERY_WINDOW: usize = 8 * 1024;

type SizeAccessorFn = unsafe extern "C" fn(header: *const c_void) -> u32;
type DataAccessorFn = unsafe extern "C" fn(header: *const c_void) -> *mut u8;
type ChecksumFinalizerFn = unsafe extern "C" fn(header: *const c_void, checksum: *mut u32);

/// Entry points of `art::OatHeader` that can be intercepted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HookKind {
    /// `OatHeader::GetKeyValueStoreSize() const`
    SizeAccessor,
    /// `OatHeader::GetKeyValueStore() const`, used by ART before Android 16.
    DataAccessor,
    /// `OatHeader::ComputeChecksum(uint32_t*) const`
    ChecksumFinalizer,
}

impl HookKind {
    pub const ALL: [HookKind; 3] = [
        HookKind::SizeAccessor,
        HookKind::DataAccessor,
        HookKind::ChecksumFinalizer,
    ];

    pub fn symbol(self) -> &'static str {
        match self {
            HookKind::SizeAccessor => "_ZNK3art9OatHeader20GetKeyValueStoreSizeEv",
            HookKind::DataAccessor => "_ZNK3art9OatHeader16GetKeyValueStoreEv",
            HookKind::ChecksumFinalizer => "_ZNK3art9OatHeader15ComputeChecksumEPj",
        }
    }

    fn replacement(self) -> usize {
        match self {
            HookKind::SizeAccessor => key_value_store_size_hook as SizeAccessorFn as usize,
            HookKind::DataAccessor => key_value_store_hook as DataAccessorFn as usize,
            HookKind::ChecksumFinalizer => compute_checksum_hook as ChecksumFinalizerFn as usize,
        }
    }

    /// Slot holding the address of the intercepted function once the hook is applied.
    fn original(self) -> &'static AtomicUsize {
        &ORIGINALS[self as usize]
    }
}

/// Which set of hooks ended up installed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HookStage {
    Accessors,
    ChecksumFinalizer,
}

struct Engine {
    original_path: String,
    layout: OatHeaderLayout,
}

/// Store size before and after a rewrite that changed it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct SizeAdjustment {
    previous: u32,
    adjusted: u32,
}

impl SizeAdjustment {
    fn covers(&self, current: u32) -> bool {
        current == self.previous || current == self.adjusted
    }
}

static ORIGINALS: [AtomicUsize; 3] = [
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
];
static ENGINE: OnceLock<Engine> = OnceLock::new();
static INSTALLED: OnceLock<Option<HookStage>> = OnceLock::new();
static ADJUSTED_SIZES: Mutex<BTreeMap<usize, SizeAdjustment>> = Mutex::new(BTreeMap::new());

/// Locates the compiler in memory and installs the hooks. Runs at most once per process; later
/// calls return the first result.
///
/// Returns `None` if nothing could be installed, in which case the compiler runs unmodified.
pub fn initialize() -> Option<HookStage> {
    *INSTALLED.get_or_init(|| match install() {
        Ok(stage) => {
            info!(?stage, "hooks installed");
            Some(stage)
        }
        Err(err) => {
            error!(%err, "hooks not installed, key-value store will not be spoofed");
            None
        }
    })
}

fn install() -> Result<HookStage> {
    let _log_guard = info_span!("install_hooks").entered();

    let override_path = std::env::var(CMD_OVERRIDE_ENV)
        .ok()
        .filter(|path| !path.is_empty());
    let target = plt_hook::find_mapping(TARGET_FRAGMENT)?;
    info!(path = ?target.path, dev = ?target.dev, inode = target.inode, "found compiler mapping");

    let original_path = override_path.unwrap_or_else(|| {
        target
            .path
            .as_ref()
            .map(|path| path.to_string_lossy().into_owned())
            .unwrap_or_default()
    });
    ENGINE.get_or_init(|| Engine {
        original_path,
        layout: OatHeaderLayout::CURRENT,
    });

    install_hooks(&target)
}

/// Hooks the accessor pair in the image of `target`, or the checksum routine if the accessors are
/// not imported by it.
pub fn install_hooks(target: &MapInfo) -> Result<HookStage> {
    let mut hooker = PltHooker::new();
    let register = |hooker: &mut PltHooker, kind: HookKind| {
        hooker.register(
            target.dev,
            target.inode,
            kind.symbol(),
            kind.replacement(),
            kind.original(),
        )
    };
    register(&mut hooker, HookKind::SizeAccessor);
    register(&mut hooker, HookKind::DataAccessor);
    if let Err(err) = hooker.commit() {
        warn!(%err, "accessor hooks incomplete, hooking checksum computation");
        register(&mut hooker, HookKind::ChecksumFinalizer);
        hooker.commit()?;
        return Ok(HookStage::ChecksumFinalizer);
    }
    Ok(HookStage::Accessors)
}

fn original_size_accessor() -> Option<SizeAccessorFn> {
    match HookKind::SizeAccessor.original().load(Ordering::Acquire) {
        0 => None,
        // SAFETY: Non-zero values are the addresses of the functions the hooks replaced.
        address => Some(unsafe { std::mem::transmute::<usize, SizeAccessorFn>(address) }),
    }
}

fn original_data_accessor() -> Option<DataAccessorFn> {
    match HookKind::DataAccessor.original().load(Ordering::Acquire) {
        0 => None,
        // SAFETY: See `original_size_accessor`.
        address => Some(unsafe { std::mem::transmute::<usize, DataAccessorFn>(address) }),
    }
}

fn original_checksum_finalizer() -> Option<ChecksumFinalizerFn> {
    match HookKind::ChecksumFinalizer.original().load(Ordering::Acquire) {
        0 => None,
        // SAFETY: See `original_size_accessor`.
        address => Some(unsafe { std::mem::transmute::<usize, ChecksumFinalizerFn>(address) }),
    }
}

/// Size to report for `header`, given the size the host currently holds for it.
///
/// A recorded adjustment that matches neither the pre-rewrite nor the rewritten size belongs to a
/// header that no longer exists, and is dropped.
fn adjusted_size(header: usize, current: u32) -> u32 {
    let mut sizes = ADJUSTED_SIZES
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    match sizes.get(&header).copied() {
        None => current,
        Some(size) if size.covers(current) => size.adjusted,
        Some(stale) => {
            debug!(header, ?stale, current, "dropping stale size adjustment");
            sizes.remove(&header);
            current
        }
    }
}

fn record_adjustment(header: usize, previous: u32, adjusted: u32) {
    ADJUSTED_SIZES
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .insert(header, SizeAdjustment { previous, adjusted });
}

unsafe extern "C" fn key_value_store_size_hook(header: *const c_void) -> u32 {
    let Some(get_size) = original_size_accessor() else {
        error!("size hook called without original");
        return 0;
    };
    let size = get_size(header);
    let adjusted = adjusted_size(header as usize, size);
    if adjusted != size {
        debug!(?header, size, adjusted, "reporting adjusted key-value store size");
    }
    adjusted
}

unsafe extern "C" fn key_value_store_hook(header: *const c_void) -> *mut u8 {
    let Some(get_store) = original_data_accessor() else {
        return std::ptr::null_mut();
    };
    let store = get_store(header);
    let Some(get_size) = original_size_accessor() else {
        return store;
    };
    let size = adjusted_size(header as usize, get_size(header));
    info!(?store, size, "key-value store via accessor");

    if size > 0 && size < MAX_STORE_SIZE {
        spoof_store(header, store, size);
    }
    store
}

unsafe extern "C" fn compute_checksum_hook(header: *const c_void, checksum: *mut u32) {
    if let Some(engine) = ENGINE.get() {
        if let Some(view) = OatHeader::from_raw(header, engine.layout) {
            let store = view.key_value_store();
            let size = adjusted_size(header as usize, view.key_value_store_size());
            info!(?store, size, "key-value store via header layout");
            spoof_store(header, store, size);
        }
    }

    match original_checksum_finalizer() {
        Some(compute_checksum) => {
            compute_checksum(header, checksum);
            if !checksum.is_null() {
                debug!(checksum = *checksum, "checksum computed");
            }
        }
        None => error!("checksum hook called without original"),
    }
}

/// Spoofs the store of `header`, and propagates a changed size to the header and to later calls.
///
/// # Safety
///
/// `store` must point to the key-value store of `header`, holding `declared` bytes if `declared`
/// is plausible.
unsafe fn spoof_store(header: *const c_void, store: *mut u8, declared: u32) {
    let Some(engine) = ENGINE.get() else {
        return;
    };
    if store.is_null() {
        return;
    }

    let (len, hint) = if declared > 0 && declared < MAX_STORE_SIZE {
        (declared as usize, SizeHint::Declared)
    } else {
        (readable_len(store as usize), SizeHint::Unknown)
    };
    if len == 0 {
        return;
    }

    let bytes = std::slice::from_raw_parts_mut(store, len);
    let outcome = match key_value_store::spoof(bytes, hint, &engine.original_path) {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(%err, "leaving key-value store untouched");
            return;
        }
    };
    debug!(?outcome, "key-value store processed");

    let Some(new_size) = outcome.new_size() else {
        return;
    };
    let new_size = new_size as u32;
    record_adjustment(header as usize, declared, new_size);

    // An implausible size field is not a size field, leave it alone.
    if hint == SizeHint::Unknown {
        warn!(declared, new_size, "store size discovered, size field left as is");
        return;
    }

    // Only write through the layout if it agrees with what the host reported.
    if let Some(mut view) = OatHeader::from_raw(header, engine.layout) {
        if view.key_value_store() == store && view.key_value_store_size() == declared {
            view.set_key_value_store_size(new_size);
            info!(old_size = declared, new_size, "key-value store size updated");
        } else {
            warn!("header layout mismatch, size field left as is");
        }
    }
}

/// Bytes readable from `address` up to [`DISCOVERY_WINDOW`], within its mapping.
fn readable_len(address: usize) -> usize {
    let maps = match plt_hook::scan_maps() {
        Ok(maps) => maps,
        Err(err) => {
            warn!(%err, "cannot bound key-value store");
            return 0;
        }
    };
    maps.iter()
        .find(|map| map.contains(address as u64))
        .filter(|map| map.perms.contains(procfs::process::MMPermissions::READ))
        .map_or(0, |map| ((map.end - address as u64) as usize).min(DISCOVERY_WINDOW))
}
