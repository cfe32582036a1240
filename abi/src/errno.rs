//! Error codes returned by the interrupt control plane.
//!
//! Values follow the POSIX numbering used by the hypercall ABI. Callers that
//! need the signed wire form use [`Errno::as_neg`].

use core::fmt;

#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Errno {
    /// Rejected by the security gate.
    EPERM = 1,
    ENOENT = 2,
    /// Migration in flight or action being torn down; retry later.
    EAGAIN = 11,
    ENOMEM = 12,
    /// Line already owned, not shareable, or too many guests.
    EBUSY = 16,
    EEXIST = 17,
    ENODEV = 19,
    EINVAL = 22,
    ENFILE = 23,
    /// No free vector, IRQ or pirq.
    ENOSPC = 28,
    EDOM = 33,
    EOPNOTSUPP = 95,
}

pub type IrqResult<T> = Result<T, Errno>;

impl Errno {
    const ALL: [Errno; 12] = [
        Errno::EPERM,
        Errno::ENOENT,
        Errno::EAGAIN,
        Errno::ENOMEM,
        Errno::EBUSY,
        Errno::EEXIST,
        Errno::ENODEV,
        Errno::EINVAL,
        Errno::ENFILE,
        Errno::ENOSPC,
        Errno::EDOM,
        Errno::EOPNOTSUPP,
    ];

    /// Signed return code (`-EBUSY` etc.).
    #[inline]
    pub const fn as_neg(self) -> i32 {
        -(self as i32)
    }

    /// Reverse of [`Errno::as_neg`]. Non-negative or unknown codes yield `None`.
    pub fn from_neg(code: i32) -> Option<Self> {
        if code >= 0 {
            return None;
        }
        Self::ALL.iter().copied().find(|e| e.as_neg() == code)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Errno::EPERM => "EPERM",
            Errno::ENOENT => "ENOENT",
            Errno::EAGAIN => "EAGAIN",
            Errno::ENOMEM => "ENOMEM",
            Errno::EBUSY => "EBUSY",
            Errno::EEXIST => "EEXIST",
            Errno::ENODEV => "ENODEV",
            Errno::EINVAL => "EINVAL",
            Errno::ENFILE => "ENFILE",
            Errno::ENOSPC => "ENOSPC",
            Errno::EDOM => "EDOM",
            Errno::EOPNOTSUPP => "EOPNOTSUPP",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_neg())
    }
}

/// Collapse a result into the signed code used at the administrative boundary.
#[inline]
pub fn to_retcode<T>(result: IrqResult<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.as_neg(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_codes_round_trip() {
        for e in Errno::ALL {
            assert!(e.as_neg() < 0);
            assert_eq!(Errno::from_neg(e.as_neg()), Some(e));
        }
    }

    #[test]
    fn test_from_neg_rejects_success_and_unknown() {
        assert_eq!(Errno::from_neg(0), None);
        assert_eq!(Errno::from_neg(22), None);
        assert_eq!(Errno::from_neg(-9999), None);
    }

    #[test]
    fn test_retcode() {
        assert_eq!(to_retcode::<()>(Ok(())), 0);
        assert_eq!(to_retcode::<u32>(Err(Errno::ENOSPC)), -28);
        assert_eq!(to_retcode::<u32>(Err(Errno::EAGAIN)), -11);
    }
}
