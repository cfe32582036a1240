//! PCI function addressing and MSI descriptors handed over by the device layer.

use core::fmt;

/// Largest block a multi-message MSI capability can request.
pub const MAX_MSI_VECTORS: u32 = 32;

/// `(segment, bus, device, function)` of a PCI function.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sbdf {
    pub seg: u16,
    pub bus: u8,
    pub devfn: u8,
}

impl Sbdf {
    pub const fn new(seg: u16, bus: u8, dev: u8, func: u8) -> Self {
        Self {
            seg,
            bus,
            devfn: (dev & 0x1f) << 3 | (func & 0x7),
        }
    }

    pub const fn dev(&self) -> u8 {
        self.devfn >> 3
    }

    pub const fn func(&self) -> u8 {
        self.devfn & 0x7
    }
}

impl fmt::Display for Sbdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{}",
            self.seg,
            self.bus,
            self.dev(),
            self.func()
        )
    }
}

impl fmt::Debug for Sbdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsiCap {
    /// Plain MSI; `nvec > 1` asks for a multi-message block.
    Msi { nvec: u32 },
    /// One MSI-X table entry.
    MsiX { entry: u32 },
}

/// A request to wire up MSI on a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsiInfo {
    pub sbdf: Sbdf,
    pub cap: MsiCap,
    /// Per-vector masking supported by the capability.
    pub maskable: bool,
}

impl MsiInfo {
    pub const fn msi(sbdf: Sbdf, nvec: u32, maskable: bool) -> Self {
        Self {
            sbdf,
            cap: MsiCap::Msi { nvec },
            maskable,
        }
    }

    pub const fn msix(sbdf: Sbdf, entry: u32) -> Self {
        Self {
            sbdf,
            cap: MsiCap::MsiX { entry },
            maskable: true,
        }
    }

    pub const fn nr_vectors(&self) -> u32 {
        match self.cap {
            MsiCap::Msi { nvec } => nvec,
            MsiCap::MsiX { .. } => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsiKind {
    Msi,
    MsiX,
}

/// Per-IRQ MSI state hanging off a descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsiDesc {
    pub sbdf: Sbdf,
    pub kind: MsiKind,
    /// Index within a multi-message block, or the MSI-X table entry.
    pub entry: u32,
    /// Block size; only meaningful on the first entry of a block.
    pub nvec: u32,
    pub maskable: bool,
}

impl MsiDesc {
    pub fn from_info(info: &MsiInfo, index: u32) -> Self {
        match info.cap {
            MsiCap::Msi { nvec } => Self {
                sbdf: info.sbdf,
                kind: MsiKind::Msi,
                entry: index,
                nvec,
                maskable: info.maskable,
            },
            MsiCap::MsiX { entry } => Self {
                sbdf: info.sbdf,
                kind: MsiKind::MsiX,
                entry,
                nvec: 1,
                maskable: info.maskable,
            },
        }
    }

    /// Only the first IRQ of a multi-message block may be unmapped directly.
    pub fn is_block_head(&self) -> bool {
        self.kind == MsiKind::MsiX || self.entry == 0
    }
}
