use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub};

/// Address arithmetic for the two address spaces we juggle.
///
/// Logical addresses live in the filesystem-wide virtual space that chunk
/// mappings carve up; physical addresses are byte offsets into one specific
/// device. They must never be mixed silently, which is why both are
/// newtypes rather than the bare LE64s the on-disk structures carry.

#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct LogicalAddr(pub u64);

#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct PhysicalAddr(pub u64);

/// signed difference of two same-kind addresses
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Debug)]
pub struct AddrDelta(pub i64);

macro_rules! addr_ops {
    ($t:ty) => {
        impl $t {
            pub fn checked_add(self, n: u64) -> Option<$t> {
                self.0.checked_add(n).map(Self)
            }

            pub fn checked_sub(self, n: u64) -> Option<$t> {
                self.0.checked_sub(n).map(Self)
            }
        }

        impl Add<u64> for $t {
            type Output = $t;
            fn add(self, n: u64) -> $t {
                Self(self.0 + n)
            }
        }

        impl AddAssign<u64> for $t {
            fn add_assign(&mut self, n: u64) {
                self.0 += n;
            }
        }

        impl Add<AddrDelta> for $t {
            type Output = $t;
            fn add(self, d: AddrDelta) -> $t {
                Self(self.0.wrapping_add_signed(d.0))
            }
        }

        impl Sub<$t> for $t {
            type Output = AddrDelta;
            fn sub(self, rhs: $t) -> AddrDelta {
                AddrDelta(self.0 as i64 - rhs.0 as i64)
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl fmt::Debug for $t {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }
    };
}

addr_ops!(LogicalAddr);
addr_ops!(PhysicalAddr);

/// `(device id, physical offset)` pair. The derived order compares the
/// device id first, then the offset, which is the canonical total order
/// the dev-extent map is keyed by.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct QualifiedPaddr {
    pub devid: u64,
    pub paddr: PhysicalAddr,
}

impl QualifiedPaddr {
    pub fn new(devid: u64, paddr: u64) -> QualifiedPaddr {
        QualifiedPaddr {
            devid,
            paddr: PhysicalAddr(paddr),
        }
    }

    /// same device, offset shifted by `d`
    pub fn offset_by(self, d: AddrDelta) -> QualifiedPaddr {
        QualifiedPaddr {
            devid: self.devid,
            paddr: self.paddr + d,
        }
    }

    pub fn checked_offset_by(self, d: AddrDelta) -> Option<QualifiedPaddr> {
        let p = self.paddr.0.checked_add_signed(d.0)?;
        Some(QualifiedPaddr::new(self.devid, p))
    }
}

impl fmt::Display for QualifiedPaddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "dev {} offset {}", self.devid, self.paddr)
    }
}

impl fmt::Debug for QualifiedPaddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({},{:?})", self.devid, self.paddr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_roundtrip() {
        let a = LogicalAddr(0x4000);
        let b = LogicalAddr(0x1000);
        let d = a - b;
        assert_eq!(d, AddrDelta(0x3000));
        assert_eq!(b + d, a);
        assert_eq!(a + AddrDelta(-0x3000), b);
    }

    #[test]
    fn qualified_order() {
        let a = QualifiedPaddr::new(1, 0x100000);
        let b = QualifiedPaddr::new(2, 0x1000);
        let c = QualifiedPaddr::new(2, 0x2000);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn checked_translation() {
        let s = QualifiedPaddr::new(1, 0x1000);
        assert_eq!(
            s.checked_offset_by(AddrDelta(-0x1000)),
            Some(QualifiedPaddr::new(1, 0))
        );
        assert_eq!(s.checked_offset_by(AddrDelta(-0x1001)), None);
    }
}
