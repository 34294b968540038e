//! Shared fixtures: a booted kernel and a small ELF32 image builder.

#![allow(dead_code)]

use aurora_os::Kernel;

/// 32 MiB of physical memory: enough for the staging window at the top and
/// a few thousand free frames above the kernel image.
pub const TEST_MEM: u32 = 0x0200_0000;

pub const PGSIZE: u32 = 4096;
pub const USTACKTOP: u32 = aurora_os::constants::USTACKTOP;
pub const UTOP: u32 = aurora_os::constants::UTOP;

pub fn boot() -> Kernel {
    Kernel::boot(TEST_MEM)
}

pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;

const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;

/// One program segment: virtual address, file bytes, and total memory size
/// (the tail past the file bytes is BSS).
pub struct Segment {
    pub vaddr: u32,
    pub data: Vec<u8>,
    pub memsz: u32,
}

/// Assemble a little-endian ELF32 image. `dynamic` names a `(vaddr, len)`
/// range inside one of the segments that doubles as the PT_DYNAMIC
/// contents.
pub fn build_elf(entry: u32, segments: &[Segment], dynamic: Option<(u32, u32)>) -> Vec<u8> {
    let phnum = segments.len() + dynamic.map_or(0, |_| 1);
    let headers_len = EHDR_SIZE + phnum * PHDR_SIZE;

    // Place segment bytes after the headers and remember their offsets.
    let mut offsets = Vec::new();
    let mut body: Vec<u8> = Vec::new();
    for seg in segments {
        offsets.push(headers_len + body.len());
        body.extend_from_slice(&seg.data);
    }

    let mut image = vec![0u8; headers_len];
    image[0] = 0x7f;
    image[1] = b'E';
    image[2] = b'L';
    image[3] = b'F';
    image[4] = 1; // ELFCLASS32
    image[5] = 1; // little-endian data
    image[24..28].copy_from_slice(&entry.to_le_bytes());
    image[28..32].copy_from_slice(&(EHDR_SIZE as u32).to_le_bytes());
    image[42..44].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
    image[44..46].copy_from_slice(&(phnum as u16).to_le_bytes());

    let mut ph = EHDR_SIZE;
    let mut write_phdr = |image: &mut Vec<u8>,
                          p_type: u32,
                          p_offset: u32,
                          p_vaddr: u32,
                          p_filesz: u32,
                          p_memsz: u32| {
        image[ph..ph + 4].copy_from_slice(&p_type.to_le_bytes());
        image[ph + 4..ph + 8].copy_from_slice(&p_offset.to_le_bytes());
        image[ph + 8..ph + 12].copy_from_slice(&p_vaddr.to_le_bytes());
        image[ph + 16..ph + 20].copy_from_slice(&p_filesz.to_le_bytes());
        image[ph + 20..ph + 24].copy_from_slice(&p_memsz.to_le_bytes());
        ph += PHDR_SIZE;
    };

    for (seg, &off) in segments.iter().zip(&offsets) {
        write_phdr(
            &mut image,
            PT_LOAD,
            off as u32,
            seg.vaddr,
            seg.data.len() as u32,
            seg.memsz.max(seg.data.len() as u32),
        );
    }
    if let Some((dyn_vaddr, dyn_len)) = dynamic {
        let (seg, &off) = segments
            .iter()
            .zip(&offsets)
            .find(|(seg, _)| {
                dyn_vaddr >= seg.vaddr && dyn_vaddr + dyn_len <= seg.vaddr + seg.data.len() as u32
            })
            .expect("dynamic range must sit inside a segment");
        let dyn_off = off as u32 + (dyn_vaddr - seg.vaddr);
        write_phdr(&mut image, PT_DYNAMIC, dyn_off, dyn_vaddr, dyn_len, dyn_len);
    }

    image.extend_from_slice(&body);
    image
}

/// A program with one small text segment; enough for environments that only
/// exist to be scheduled.
pub fn trivial_program() -> Vec<u8> {
    build_elf(
        0x0040_0000,
        &[Segment {
            vaddr: 0x0040_0000,
            data: vec![0u8; 64],
            memsz: 64,
        }],
        None,
    )
}

/// A program with no loadable bytes at all: after creation only the initial
/// stack page is mapped in its address space.
pub fn empty_program() -> Vec<u8> {
    build_elf(0x0040_0000, &[], None)
}

/// Drive the current environment through a puts syscall: the text is staged
/// on its stack, then printed from there.
pub fn print_from_current(kernel: &mut Kernel, text: &str) {
    let bytes = text.as_bytes();
    let base = USTACKTOP - 256;
    for (i, chunk) in bytes.chunks(4).enumerate() {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        kernel
            .user_store_u32(base + (i as u32) * 4, u32::from_le_bytes(word))
            .expect("staging print text");
    }
    let outcome = kernel.syscall(aurora_os::sysno::SYS_PUTS, [base, bytes.len() as u32, 0, 0]);
    assert_eq!(outcome, aurora_os::SyscallOutcome::Ret(0));
}
