//! ELF32 image loading and the MIPS flavor of dynamic linking.
//!
//! The loader consumes a staged, contiguous byte image. Segment bytes are
//! copied into the currently active address space, so the caller is expected
//! to have switched the MMU to the target environment first; every missing
//! page is installed by the store-fault path on the way through.
//!
//! Dynamic images carry the MIPS GOT layout: entries below `local_gotno` are
//! pre-filled by the linker, the rest correspond one-to-one to the dynamic
//! symbols from `gotsym` upward.

use alloc::string::String;
use alloc::vec::Vec;

use log::{debug, warn};

use crate::error::KernelError;
use crate::pmap::{copy_to_user, memset_user, PhysMem, VirtAddr};
use crate::tlb::Mmu;

/// Load offset handed to a position-independent library whose first LOAD
/// segment has a zero preferred address.
pub(crate) const DYNLIB_BASE: u32 = 0x2000_0000;

const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;
const SYM_SIZE: u32 = 16;

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;

const DT_NULL: u32 = 0;
const DT_NEEDED: u32 = 1;
const DT_PLTGOT: u32 = 3;
const DT_STRTAB: u32 = 5;
const DT_SYMTAB: u32 = 6;
const DT_MIPS_LOCAL_GOTNO: u32 = 0x7000_000a;
const DT_MIPS_SYMTABNO: u32 = 0x7000_0011;
const DT_MIPS_GOTSYM: u32 = 0x7000_0013;

const SHN_UNDEF: u16 = 0;

fn read_u16(image: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([image[off], image[off + 1]])
}

fn read_u32(image: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([image[off], image[off + 1], image[off + 2], image[off + 3]])
}

/// The header fields the loader acts on.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ehdr {
    pub(crate) e_entry: u32,
    e_phoff: u32,
    e_phentsize: u16,
    e_phnum: u16,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Phdr {
    p_type: u32,
    p_offset: u32,
    p_vaddr: u32,
    p_filesz: u32,
    p_memsz: u32,
}

/// Validate the identification bytes and the program-header table bounds.
pub(crate) fn parse_ehdr(image: &[u8]) -> Result<Ehdr, KernelError> {
    if image.len() < EHDR_SIZE {
        return Err(KernelError::ElfInvalid);
    }
    if image[0] != 0x7f || image[1] != b'E' || image[2] != b'L' || image[3] != b'F' {
        return Err(KernelError::ElfInvalid);
    }
    // 32-bit class only.
    if image[4] != 1 {
        return Err(KernelError::ElfInvalid);
    }
    let ehdr = Ehdr {
        e_entry: read_u32(image, 24),
        e_phoff: read_u32(image, 28),
        e_phentsize: read_u16(image, 42),
        e_phnum: read_u16(image, 44),
    };
    let table_end = ehdr.e_phoff as u64 + ehdr.e_phnum as u64 * ehdr.e_phentsize as u64;
    if (ehdr.e_phentsize as usize) < PHDR_SIZE || table_end > image.len() as u64 {
        return Err(KernelError::ElfInvalid);
    }
    Ok(ehdr)
}

fn phdr(image: &[u8], ehdr: Ehdr, i: usize) -> Phdr {
    let off = ehdr.e_phoff as usize + i * ehdr.e_phentsize as usize;
    Phdr {
        p_type: read_u32(image, off),
        p_offset: read_u32(image, off + 4),
        p_vaddr: read_u32(image, off + 8),
        p_filesz: read_u32(image, off + 16),
        p_memsz: read_u32(image, off + 20),
    }
}

fn phdrs(image: &[u8], ehdr: Ehdr) -> impl Iterator<Item = Phdr> + '_ {
    (0..ehdr.e_phnum as usize).map(move |i| phdr(image, ehdr, i))
}

/// Result of installing an image.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoadedImage {
    /// Entry point with the load offset applied.
    pub(crate) entry: VirtAddr,
    /// Whether a DYNAMIC or INTERP header was present.
    pub(crate) needs_link: bool,
}

/// Install every LOAD segment of `image` at `base + p_vaddr` in the active
/// address space and zero-fill the BSS tail. Rejects segments that reference
/// bytes past the image length.
pub(crate) fn load_image(
    mem: &mut PhysMem,
    mmu: &mut Mmu,
    image: &[u8],
    base: u32,
) -> Result<LoadedImage, KernelError> {
    let ehdr = parse_ehdr(image)?;
    let mut needs_link = false;
    for ph in phdrs(image, ehdr) {
        match ph.p_type {
            PT_DYNAMIC | PT_INTERP => needs_link = true,
            PT_LOAD if ph.p_memsz != 0 => {
                let file_end = ph.p_offset as u64 + ph.p_filesz as u64;
                if file_end > image.len() as u64 {
                    return Err(KernelError::ElfSegmentOverrun);
                }
                let dst = VirtAddr(base + ph.p_vaddr);
                debug!(
                    "load segment: va={:#010x} filesz={:#x} memsz={:#x}",
                    dst.0, ph.p_filesz, ph.p_memsz
                );
                if ph.p_filesz != 0 {
                    let off = ph.p_offset as usize;
                    copy_to_user(mem, mmu, dst, &image[off..off + ph.p_filesz as usize])?;
                }
                if ph.p_memsz > ph.p_filesz {
                    memset_user(mem, mmu, dst + ph.p_filesz, ph.p_memsz - ph.p_filesz)?;
                }
            }
            _ => {}
        }
    }
    Ok(LoadedImage {
        entry: VirtAddr(base + ehdr.e_entry),
        needs_link,
    })
}

/// Translate an image virtual address to a file offset through the LOAD
/// headers.
fn vaddr_to_offset(image: &[u8], ehdr: Ehdr, vaddr: u32) -> Option<usize> {
    for ph in phdrs(image, ehdr) {
        if ph.p_type == PT_LOAD && vaddr >= ph.p_vaddr && vaddr < ph.p_vaddr + ph.p_filesz {
            return Some((vaddr - ph.p_vaddr + ph.p_offset) as usize);
        }
    }
    None
}

fn read_cstr(image: &[u8], off: usize) -> Option<String> {
    let end = image[off..].iter().position(|&b| b == 0)? + off;
    core::str::from_utf8(&image[off..end])
        .ok()
        .map(String::from)
}

#[derive(Debug, Clone, Copy)]
struct Sym {
    st_name: u32,
    st_value: u32,
    st_shndx: u16,
}

/// Contents of PT_DYNAMIC the linker acts on.
#[derive(Debug, Default, Clone)]
struct DynSection {
    needed: Vec<u32>,
    pltgot: u32,
    strtab: u32,
    symtab: u32,
    symtabno: u32,
    local_gotno: u32,
    gotsym: u32,
}

fn parse_dynamic(image: &[u8], ehdr: Ehdr) -> Result<DynSection, KernelError> {
    let dynamic = phdrs(image, ehdr)
        .find(|ph| ph.p_type == PT_DYNAMIC)
        .ok_or(KernelError::ElfInvalid)?;
    let start = dynamic.p_offset as usize;
    let end = start + dynamic.p_filesz as usize;
    if end > image.len() {
        return Err(KernelError::ElfSegmentOverrun);
    }
    let mut dy = DynSection::default();
    let mut off = start;
    while off + 8 <= end {
        let tag = read_u32(image, off);
        let val = read_u32(image, off + 4);
        off += 8;
        match tag {
            DT_NULL => break,
            DT_NEEDED => dy.needed.push(val),
            DT_PLTGOT => dy.pltgot = val,
            DT_STRTAB => dy.strtab = val,
            DT_SYMTAB => dy.symtab = val,
            DT_MIPS_SYMTABNO => dy.symtabno = val,
            DT_MIPS_LOCAL_GOTNO => dy.local_gotno = val,
            DT_MIPS_GOTSYM => dy.gotsym = val,
            _ => {} // all other tags ignored
        }
    }
    Ok(dy)
}

fn read_sym(image: &[u8], ehdr: Ehdr, symtab_vaddr: u32, index: u32) -> Option<Sym> {
    let off = vaddr_to_offset(image, ehdr, symtab_vaddr + index * SYM_SIZE)?;
    Some(Sym {
        st_name: read_u32(image, off),
        st_value: read_u32(image, off + 4),
        st_shndx: read_u16(image, off + 14),
    })
}

fn sym_name(image: &[u8], ehdr: Ehdr, strtab_vaddr: u32, st_name: u32) -> Option<String> {
    let off = vaddr_to_offset(image, ehdr, strtab_vaddr + st_name)?;
    read_cstr(image, off)
}

/// A loaded dependent library: its load offset and the defined symbols of
/// its dynamic symbol table.
pub(crate) struct DynLib {
    pub(crate) base: u32,
    symbols: Vec<(String, u32)>,
}

impl DynLib {
    pub(crate) fn lookup(&self, name: &str) -> Option<u32> {
        self.symbols
            .iter()
            .find(|(n, _)| n == name)
            .map(|&(_, addr)| addr)
    }
}

/// Install a dependent library into the active address space. A library
/// whose first LOAD segment prefers address zero is position independent and
/// goes to the fixed relocation base; anything else stays where it asked to
/// be.
pub(crate) fn load_library(
    mem: &mut PhysMem,
    mmu: &mut Mmu,
    image: &[u8],
) -> Result<DynLib, KernelError> {
    let ehdr = parse_ehdr(image)?;
    let first_load = phdrs(image, ehdr)
        .find(|ph| ph.p_type == PT_LOAD && ph.p_memsz != 0)
        .ok_or(KernelError::ElfInvalid)?;
    let base = if first_load.p_vaddr == 0 { DYNLIB_BASE } else { 0 };
    load_image(mem, mmu, image, base)?;

    // Collect the library's defined dynamic symbols, addresses already
    // shifted by the load offset.
    let mut symbols = Vec::new();
    if let Ok(dy) = parse_dynamic(image, ehdr) {
        for i in 0..dy.symtabno {
            let sym = match read_sym(image, ehdr, dy.symtab, i) {
                Some(sym) => sym,
                None => continue,
            };
            if sym.st_shndx == SHN_UNDEF {
                continue;
            }
            if let Some(name) = sym_name(image, ehdr, dy.strtab, sym.st_name) {
                symbols.push((name, base + sym.st_value));
            }
        }
    }
    debug!(
        "library loaded at {:#010x} with {} symbols",
        base,
        symbols.len()
    );
    Ok(DynLib { base, symbols })
}

/// Resolve `DT_NEEDED` and fill the main image's global GOT entries. The
/// resolver maps a library name to a loaded `DynLib`; exactly one dependent
/// library is supported.
pub(crate) fn link_dynamic(
    mem: &mut PhysMem,
    mmu: &mut Mmu,
    image: &[u8],
    resolve: &mut dyn FnMut(&mut PhysMem, &mut Mmu, &str) -> Result<DynLib, KernelError>,
) -> Result<(), KernelError> {
    let ehdr = parse_ehdr(image)?;
    let dy = parse_dynamic(image, ehdr)?;

    let mut lib: Option<DynLib> = None;
    for &name_off in &dy.needed {
        let name = sym_name(image, ehdr, dy.strtab, name_off).ok_or(KernelError::ElfInvalid)?;
        if lib.is_some() {
            warn!("multiple NEEDED libraries, ignoring {}", name);
            continue;
        }
        debug!("resolving needed library {}", name);
        lib = Some(resolve(mem, mmu, &name)?);
    }

    if dy.symtabno < dy.gotsym {
        return Err(KernelError::ElfInvalid);
    }
    // Entries below local_gotno were pre-filled by the linker.
    for i in 0..(dy.symtabno - dy.gotsym) {
        let sym = read_sym(image, ehdr, dy.symtab, dy.gotsym + i).ok_or(KernelError::ElfInvalid)?;
        let got_entry = VirtAddr(dy.pltgot + (dy.local_gotno + i) * 4);
        let value = if sym.st_shndx != SHN_UNDEF {
            Some(sym.st_value)
        } else {
            let name = sym_name(image, ehdr, dy.strtab, sym.st_name);
            match (&lib, name) {
                (Some(lib), Some(name)) => {
                    let addr = lib.lookup(&name);
                    if addr.is_none() {
                        warn!("unresolved symbol {}", name);
                    }
                    addr
                }
                _ => None,
            }
        };
        if let Some(value) = value {
            copy_to_user(mem, mmu, got_entry, &value.to_le_bytes())?;
        }
    }
    Ok(())
}
