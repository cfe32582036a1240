//! Fixed-size CPU set.
//!
//! `CpuMask` is a plain `Copy` bitmap covering [`MAX_CPUS`] logical CPUs, so
//! descriptors can hold several of them without heap traffic in interrupt
//! context.

use core::fmt;

use hvirq_abi::CpuId;

pub const MAX_CPUS: usize = 256;

const WORD_BITS: usize = u64::BITS as usize;
const WORDS: usize = MAX_CPUS / WORD_BITS;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CpuMask {
    bits: [u64; WORDS],
}

impl CpuMask {
    pub const fn new() -> Self {
        Self { bits: [0; WORDS] }
    }

    /// Mask with CPUs `0..nr_cpus` set.
    pub fn first_n(nr_cpus: usize) -> Self {
        let mut mask = Self::new();
        for cpu in 0..nr_cpus.min(MAX_CPUS) {
            mask.set(cpu);
        }
        mask
    }

    pub fn of(cpu: CpuId) -> Self {
        let mut mask = Self::new();
        mask.set(cpu);
        mask
    }

    pub fn from_cpus(cpus: &[CpuId]) -> Self {
        let mut mask = Self::new();
        for &cpu in cpus {
            mask.set(cpu);
        }
        mask
    }

    #[inline]
    pub fn set(&mut self, cpu: CpuId) {
        if cpu < MAX_CPUS {
            self.bits[cpu / WORD_BITS] |= 1 << (cpu % WORD_BITS);
        }
    }

    #[inline]
    pub fn clear(&mut self, cpu: CpuId) {
        if cpu < MAX_CPUS {
            self.bits[cpu / WORD_BITS] &= !(1 << (cpu % WORD_BITS));
        }
    }

    #[inline]
    pub fn test(&self, cpu: CpuId) -> bool {
        cpu < MAX_CPUS && self.bits[cpu / WORD_BITS] & (1 << (cpu % WORD_BITS)) != 0
    }

    /// Clear `cpu`, returning whether it was set.
    pub fn test_and_clear(&mut self, cpu: CpuId) -> bool {
        let was = self.test(cpu);
        self.clear(cpu);
        was
    }

    pub fn clear_all(&mut self) {
        self.bits = [0; WORDS];
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|w| *w == 0)
    }

    pub fn weight(&self) -> u32 {
        self.bits.iter().map(|w| w.count_ones()).sum()
    }

    pub fn first(&self) -> Option<CpuId> {
        self.iter().next()
    }

    pub fn and(&self, other: &CpuMask) -> CpuMask {
        self.zip(other, |a, b| a & b)
    }

    pub fn or(&self, other: &CpuMask) -> CpuMask {
        self.zip(other, |a, b| a | b)
    }

    pub fn andnot(&self, other: &CpuMask) -> CpuMask {
        self.zip(other, |a, b| a & !b)
    }

    pub fn intersects(&self, other: &CpuMask) -> bool {
        !self.and(other).is_empty()
    }

    pub fn is_subset(&self, other: &CpuMask) -> bool {
        self.andnot(other).is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = CpuId> + '_ {
        (0..MAX_CPUS).filter(move |&cpu| self.test(cpu))
    }

    fn zip(&self, other: &CpuMask, op: impl Fn(u64, u64) -> u64) -> CpuMask {
        let mut out = CpuMask::new();
        for (i, word) in out.bits.iter_mut().enumerate() {
            *word = op(self.bits[i], other.bits[i]);
        }
        out
    }
}

impl FromIterator<CpuId> for CpuMask {
    fn from_iter<I: IntoIterator<Item = CpuId>>(iter: I) -> Self {
        let mut mask = CpuMask::new();
        for cpu in iter {
            mask.set(cpu);
        }
        mask
    }
}

/// Prints as a range list, e.g. `{0-3,8}`.
impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        let mut first = true;
        let mut cpus = self.iter().peekable();
        while let Some(start) = cpus.next() {
            let mut end = start;
            while cpus.peek() == Some(&(end + 1)) {
                end += 1;
                cpus.next();
            }
            if !first {
                f.write_str(",")?;
            }
            first = false;
            if start == end {
                write!(f, "{}", start)?;
            } else {
                write!(f, "{}-{}", start, end)?;
            }
        }
        f.write_str("}")
    }
}

impl fmt::Display for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
