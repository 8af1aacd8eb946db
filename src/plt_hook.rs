//! PLT/GOT interception for images mapped into the current process.
//!
//! Hooks are registered against an image identified by the device and inode of its mapping, then
//! applied together by [`PltHooker::commit`]. Applying a hook replaces the image's GOT slots for
//! the symbol, so every call the image makes through its PLT reaches the replacement, while other
//! images keep calling the original.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use elf::abi::{PT_LOAD, SHT_REL, SHT_RELA};
use elf::endian::NativeEndian;
use elf::ElfBytes;
use procfs::process::{MMPermissions, MMapPath};
use scopeguard::guard;
use tracing::{debug, info, warn};

use crate::{Error, Result};

#[cfg(target_arch = "aarch64")]
const HOOKABLE_RELOCATIONS: &[u32] = &[1026 /* JUMP_SLOT */, 1025 /* GLOB_DAT */];
#[cfg(target_arch = "arm")]
const HOOKABLE_RELOCATIONS: &[u32] = &[22 /* JUMP_SLOT */, 21 /* GLOB_DAT */];
#[cfg(target_arch = "x86_64")]
const HOOKABLE_RELOCATIONS: &[u32] = &[7 /* JUMP_SLOT */, 6 /* GLOB_DAT */];
#[cfg(target_arch = "x86")]
const HOOKABLE_RELOCATIONS: &[u32] = &[7 /* JMP_SLOT */, 6 /* GLOB_DAT */];
#[cfg(target_arch = "riscv64")]
const HOOKABLE_RELOCATIONS: &[u32] = &[5 /* JUMP_SLOT */, 2 /* 64 */];

const RELOCATION_SECTIONS: [&str; 4] = [".rela.plt", ".rela.dyn", ".rel.plt", ".rel.dyn"];

/// One line of `/proc/self/maps`.
#[derive(Clone, Debug)]
pub struct MapInfo {
    pub start: u64,
    pub end: u64,
    pub perms: MMPermissions,
    pub offset: u64,
    pub dev: (i32, i32),
    pub inode: u64,
    pub path: Option<PathBuf>,
}

impl MapInfo {
    pub fn contains(&self, address: u64) -> bool {
        self.start <= address && address < self.end
    }

    fn prot(&self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.perms.contains(MMPermissions::READ) {
            prot |= libc::PROT_READ;
        }
        if self.perms.contains(MMPermissions::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.perms.contains(MMPermissions::EXECUTE) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

/// Reads the memory mappings of the current process.
pub fn scan_maps() -> Result<Vec<MapInfo>> {
    let process = procfs::process::Process::myself().map_err(Error::ProcfsParse)?;
    let maps = process.maps().map_err(Error::ProcfsParse)?;
    Ok(maps
        .into_iter()
        .map(|map| MapInfo {
            start: map.address.0,
            end: map.address.1,
            perms: map.perms,
            offset: map.offset,
            dev: map.dev,
            inode: map.inode,
            path: match map.pathname {
                MMapPath::Path(path) => Some(path),
                _ => None,
            },
        })
        .collect())
}

/// Finds the first file-backed mapping whose path contains `fragment`.
pub fn find_mapping(fragment: &str) -> Result<MapInfo> {
    scan_maps()?
        .into_iter()
        .find(|map| {
            map.inode != 0
                && map
                    .path
                    .as_ref()
                    .is_some_and(|path| path.to_string_lossy().contains(fragment))
        })
        .ok_or_else(|| Error::MappingNotFound(fragment.to_owned()))
}

struct Registration {
    dev: (i32, i32),
    inode: u64,
    symbol: String,
    replacement: usize,
    backup: &'static AtomicUsize,
}

/// Batches hook registrations and applies them on [`PltHooker::commit`].
#[derive(Default)]
pub struct PltHooker {
    pending: Vec<Registration>,
}

impl PltHooker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a hook on calls made by the image with given device and inode to `symbol`.
    /// When applied, the previous target is stored to `backup`.
    pub fn register(
        &mut self,
        dev: (i32, i32),
        inode: u64,
        symbol: &str,
        replacement: usize,
        backup: &'static AtomicUsize,
    ) {
        self.pending.push(Registration {
            dev,
            inode,
            symbol: symbol.to_owned(),
            replacement,
            backup,
        });
    }

    /// Applies all pending registrations.
    ///
    /// Registrations that can be resolved are applied even if others cannot. The error lists the
    /// symbols that had no GOT slot in their image.
    pub fn commit(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        if pending.is_empty() {
            return Ok(());
        }

        let maps = scan_maps()?;
        let mut images: HashMap<((i32, i32), u64), Option<ImageRelocations>> = HashMap::new();
        let mut unresolved = Vec::new();

        for registration in pending {
            let image = images
                .entry((registration.dev, registration.inode))
                .or_insert_with(|| {
                    ImageRelocations::for_mapping(&maps, registration.dev, registration.inode)
                        .map_err(|err| warn!(%err, inode = registration.inode, "cannot load image"))
                        .ok()
                });
            let slots = image
                .as_ref()
                .map(|image| image.slots(&registration.symbol))
                .unwrap_or_default();

            let mut applied = false;
            for slot in slots {
                match apply(&maps, slot, &registration) {
                    Ok(()) => applied = true,
                    Err(err) => warn!(%err, symbol = %registration.symbol, "cannot patch slot"),
                }
            }

            if applied {
                info!(symbol = %registration.symbol, "hook applied");
            } else {
                unresolved.push(registration.symbol);
            }
        }

        if unresolved.is_empty() {
            Ok(())
        } else {
            Err(Error::UnresolvedSymbols(unresolved))
        }
    }
}

/// GOT slots of the imported symbols of one mapped image.
struct ImageRelocations {
    bias: u64,
    offsets: HashMap<String, Vec<u64>>,
}

impl ImageRelocations {
    fn for_mapping(maps: &[MapInfo], dev: (i32, i32), inode: u64) -> Result<Self> {
        let base = maps
            .iter()
            .find(|map| map.dev == dev && map.inode == inode && map.offset == 0)
            .ok_or_else(|| Error::MappingNotFound(format!("{dev:?}:{inode}")))?;
        let path = base
            .path
            .as_deref()
            .ok_or_else(|| Error::MappingNotFound(format!("{dev:?}:{inode}")))?;
        Self::load(path, base.start)
    }

    fn load(path: &Path, base: u64) -> Result<Self> {
        let data = std::fs::read(path).map_err(|err| Error::Filesystem(err, path.into()))?;
        let elf = ElfBytes::<NativeEndian>::minimal_parse(&data)
            .map_err(|err| Error::ElfParse(err, path.into()))?;

        let first_load_vaddr = elf
            .segments()
            .and_then(|segments| {
                segments
                    .iter()
                    .find(|phdr| phdr.p_type == PT_LOAD && phdr.p_offset == 0)
                    .map(|phdr| phdr.p_vaddr)
            })
            .ok_or_else(|| Error::ElfNoLoadBias(path.into()))?;
        let bias = base.wrapping_sub(first_load_vaddr & !(page_size() as u64 - 1));

        let mut offsets: HashMap<String, Vec<u64>> = HashMap::new();
        let Some((dynsym, dynstr)) = elf
            .dynamic_symbol_table()
            .map_err(|err| Error::ElfParse(err, path.into()))?
        else {
            return Ok(ImageRelocations { bias, offsets });
        };

        let mut relocations: Vec<(u32, u32, u64)> = Vec::new();
        for name in RELOCATION_SECTIONS {
            let Some(shdr) = elf
                .section_header_by_name(name)
                .map_err(|err| Error::ElfParse(err, path.into()))?
            else {
                continue;
            };
            match shdr.sh_type {
                SHT_RELA => relocations.extend(
                    elf.section_data_as_relas(&shdr)
                        .map_err(|err| Error::ElfParse(err, path.into()))?
                        .map(|rela| (rela.r_sym, rela.r_type, rela.r_offset)),
                ),
                SHT_REL => relocations.extend(
                    elf.section_data_as_rels(&shdr)
                        .map_err(|err| Error::ElfParse(err, path.into()))?
                        .map(|rel| (rel.r_sym, rel.r_type, rel.r_offset)),
                ),
                // Android packed relocations never carry PLT entries.
                _ => continue,
            }
        }

        for (sym, kind, offset) in relocations {
            if sym == 0 || !HOOKABLE_RELOCATIONS.contains(&kind) {
                continue;
            }
            let symbol = dynsym
                .get(sym as usize)
                .map_err(|err| Error::ElfParse(err, path.into()))?;
            let name = dynstr
                .get(symbol.st_name as usize)
                .map_err(|err| Error::ElfParse(err, path.into()))?;
            offsets.entry(name.to_owned()).or_default().push(offset);
        }
        debug!(?path, bias, symbols = offsets.len(), "loaded image relocations");

        Ok(ImageRelocations { bias, offsets })
    }

    fn slots(&self, symbol: &str) -> Vec<u64> {
        self.offsets
            .get(symbol)
            .map(|offsets| {
                offsets
                    .iter()
                    .map(|offset| self.bias.wrapping_add(*offset))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Points the GOT slot at `slot` to the registration's replacement.
fn apply(maps: &[MapInfo], slot: u64, registration: &Registration) -> Result<()> {
    let map = maps
        .iter()
        .find(|map| map.contains(slot))
        .ok_or_else(|| Error::MappingNotFound(format!("{slot:#x}")))?;
    let slot = slot as usize;
    let slot_ptr = slot as *mut usize;

    // SAFETY: `slot` lies in a mapping of the image, at the address its relocation targets.
    let current = unsafe { slot_ptr.read_volatile() };
    if current == registration.replacement {
        return Ok(());
    }
    registration.backup.store(current, Ordering::Release);

    let page_size = page_size();
    let page = slot & !(page_size - 1);
    protect(page, page_size, libc::PROT_READ | libc::PROT_WRITE)?;
    let original_prot = map.prot();
    let _restore_guard = guard((), |_| {
        if let Err(err) = protect(page, page_size, original_prot) {
            warn!(%err, "cannot restore page protection");
        }
    });

    // SAFETY: The page holding `slot` was just made writable.
    unsafe { slot_ptr.write_volatile(registration.replacement) };
    debug!(slot, previous = current, "patched GOT slot");
    Ok(())
}

/// Wrapper for `mprotect` that converts errors.
fn protect(page: usize, len: usize, prot: libc::c_int) -> Result<()> {
    // SAFETY: Only changes protection of a page belonging to a mapped image.
    let res = unsafe { libc::mprotect(page as *mut libc::c_void, len, prot) };
    if res == -1 {
        return Err(Error::Protect(std::io::Error::last_os_error(), page));
    }
    Ok(())
}

fn page_size() -> usize {
    // SAFETY: There are no preconditions for the safety of this call.
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as usize,
        _ => 4096,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_executable_is_mapped() {
        let exe = std::fs::canonicalize("/proc/self/exe").unwrap();
        let map = find_mapping(exe.to_str().unwrap()).unwrap();
        assert_ne!(map.inode, 0);
        assert_eq!(map.path.as_deref(), Some(exe.as_path()));
    }

    #[test]
    fn missing_mapping_is_reported() {
        match find_mapping("no/such/image/anywhere") {
            Err(Error::MappingNotFound(fragment)) => {
                assert_eq!(fragment, "no/such/image/anywhere")
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn unknown_symbol_is_unresolved() {
        static BACKUP: AtomicUsize = AtomicUsize::new(0);
        let exe = std::fs::canonicalize("/proc/self/exe").unwrap();
        let map = find_mapping(exe.to_str().unwrap()).unwrap();

        let mut hooker = PltHooker::new();
        hooker.register(map.dev, map.inode, "_ZNK3art9OatHeader16GetKeyValueStoreEv", 1, &BACKUP);
        match hooker.commit() {
            Err(Error::UnresolvedSymbols(symbols)) => {
                assert_eq!(symbols, ["_ZNK3art9OatHeader16GetKeyValueStoreEv"])
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(BACKUP.load(Ordering::Acquire), 0);
    }
}
