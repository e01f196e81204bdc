// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Newtype wrappers and small enums shared by every layer of the stack.
//!
//! Interrupt lines are validated at construction so a registry lookup can
//! never index past the fixed line table.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::IntrBitError;

/// Number of interrupt lines in each direction.
pub const NUM_INTR_BITS: usize = 16;

/// Number of remote cores with their own from-host lines.
pub const NUM_TARGETS: usize = 2;

/// A single cross-processor interrupt line, always in `[0, NUM_INTR_BITS)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(into = "u8")]
pub struct IntrBit(u8);

impl IntrBit {
    /// Line 0 towards each target is held back for forcing a firmware panic.
    pub const RESERVED_PANIC: IntrBit = IntrBit(0);

    /// Create a line index with range validation.
    pub fn new(bit: usize) -> Result<Self, IntrBitError> {
        if bit >= NUM_INTR_BITS {
            return Err(IntrBitError::OutOfRange { bit });
        }
        Ok(Self(bit as u8))
    }

    /// Index into per-line tables.
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Raw value as it appears in wire descriptors.
    pub const fn value(self) -> u8 {
        self.0
    }

    /// Single-bit mask for this line in a 16-bit bitmap.
    pub const fn mask(self) -> u16 {
        1 << self.0
    }
}

impl From<IntrBit> for u8 {
    fn from(bit: IntrBit) -> Self {
        bit.0
    }
}

impl TryFrom<u8> for IntrBit {
    type Error = IntrBitError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value as usize)
    }
}

impl fmt::Display for IntrBit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Remote processor core a stream talks to.
///
/// Each target has its own from-host line bitmap; the to-host bitmap is
/// shared by every target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    /// Main firmware core.
    R4,
    /// Auxiliary core.
    M4,
}

impl Target {
    /// All targets, in bitmap order.
    pub const ALL: [Target; NUM_TARGETS] = [Target::R4, Target::M4];

    pub const fn name(&self) -> &'static str {
        match self {
            Self::R4 => "R4",
            Self::M4 => "M4",
        }
    }

    /// Position in per-target tables.
    pub const fn index(&self) -> usize {
        match self {
            Self::R4 => 0,
            Self::M4 => 1,
        }
    }

    /// Pre-agreed line used by reserved-type streams towards this target.
    pub const fn reserved_panic_bit(&self) -> IntrBit {
        IntrBit::RESERVED_PANIC
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Direction of traffic through a stream, seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Co-processor writes, host reads.
    In,
    /// Host writes, co-processor reads.
    Out,
}

impl Direction {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intr_bit_range() {
        assert!(IntrBit::new(0).is_ok());
        assert!(IntrBit::new(NUM_INTR_BITS - 1).is_ok());
        assert!(IntrBit::new(NUM_INTR_BITS).is_err());
        assert!(IntrBit::try_from(200u8).is_err());
    }

    #[test]
    fn test_intr_bit_mask() {
        let bit = IntrBit::new(5).unwrap();
        assert_eq!(bit.mask(), 0b10_0000);
        assert_eq!(bit.index(), 5);
        assert_eq!(u8::from(bit), 5);
    }

    #[test]
    fn test_target_names() {
        assert_eq!(Target::R4.to_string(), "R4");
        assert_eq!(Target::M4.reserved_panic_bit(), IntrBit::RESERVED_PANIC);
    }
}
