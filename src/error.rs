//! Kernel error kinds shared across subsystems.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Environment table exhausted.
    NoFreeEnv,
    /// Frame allocator empty.
    OutOfMemory,
    /// Envid lookup failed or the permission check failed.
    BadEnv,
    /// Argument outside the user address range, or unmapped.
    InvalidEnv,
    /// ELF magic/class mismatch or internally inconsistent offsets.
    ElfInvalid,
    /// ELF segment references bytes past the image length.
    ElfSegmentOverrun,
    /// The arbiter rejected the request (invalid, over-max, or unsafe).
    ResourceDenied,
    /// Operation on a device without a driver table entry.
    DeviceUnregistered,
    /// Named program not present in the filesystem.
    FileNotFound,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::NoFreeEnv => "no free environment slot",
            KernelError::OutOfMemory => "out of physical memory",
            KernelError::BadEnv => "bad environment id",
            KernelError::InvalidEnv => "invalid user address",
            KernelError::ElfInvalid => "invalid elf image",
            KernelError::ElfSegmentOverrun => "truncated elf segment",
            KernelError::ResourceDenied => "resource request denied",
            KernelError::DeviceUnregistered => "device not registered",
            KernelError::FileNotFound => "file not found",
        };
        f.write_str(msg)
    }
}
