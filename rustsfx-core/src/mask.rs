//! Per-pixel status flags.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::ops::{BitOr, BitOrAssign};

/// Bit set describing why a pixel should (or should not) be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PixelFlags(u16);

impl PixelFlags {
    pub const NONE: Self = Self(0);
    pub const INVALID: Self = Self(1);
    pub const SATURATED: Self = Self(1 << 1);
    pub const HOT: Self = Self(1 << 2);
    pub const BAD: Self = Self(1 << 3);
    pub const IN_PEAKMASK: Self = Self(1 << 4);
    pub const OUT_OF_RESOLUTION: Self = Self(1 << 5);
    pub const MISSING: Self = Self(1 << 6);
    pub const IN_HALO: Self = Self(1 << 7);

    /// Creates flags from raw bits.
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Raw bit representation.
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Union of two flag sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns true if every bit in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if any bit in `other` is set.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns true if none of the bits in `other` are set.
    #[must_use]
    pub const fn is_clear_of(self, other: Self) -> bool {
        !self.intersects(other)
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for PixelFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for PixelFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.insert(rhs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_operations() {
        let mut flags = PixelFlags::HOT | PixelFlags::IN_HALO;
        assert!(flags.contains(PixelFlags::HOT));
        assert!(flags.intersects(PixelFlags::HOT | PixelFlags::BAD));
        assert!(flags.is_clear_of(PixelFlags::BAD | PixelFlags::SATURATED));

        flags.remove(PixelFlags::HOT);
        assert!(!flags.contains(PixelFlags::HOT));
        assert_eq!(flags, PixelFlags::IN_HALO);

        flags |= PixelFlags::MISSING;
        assert_eq!(flags.bits(), (1 << 7) | (1 << 6));
        assert!(PixelFlags::default().is_empty());
    }
}
