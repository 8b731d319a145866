// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Utilities to make decoding packed register data less terrible.

use crate::Error;

/// Extract a bit from a byte.
pub const fn extract_bit(word: u8, bit: u8) -> Result<bool, Error> {
    if bit > 7 {
        return Err(Error::BitOutOfRange);
    }
    Ok((word & (1 << bit)) != 0)
}

/// Return `word` with `bit` set to `value`.
pub const fn with_bit(word: u8, bit: u8, value: bool) -> Result<u8, Error> {
    if bit > 7 {
        return Err(Error::BitOutOfRange);
    }
    if value {
        Ok(word | (1 << bit))
    } else {
        Ok(word & !(1 << bit))
    }
}

/// Interpret the low `bits` bits of `field` as a two's complement integer.
///
/// When the sign bit of the field is set, the value is
/// `-(((!field) & mask) + 1)`, otherwise it is the field itself.
pub const fn twos_complement(field: u16, bits: u8) -> Result<i32, Error> {
    if bits == 0 || bits > 16 {
        return Err(Error::InvalidFieldWidth(bits));
    }
    let mask = ((1u32 << bits) - 1) as u16;
    let valid = field & mask;
    let negative = (valid >> (bits - 1)) & 1 == 1;
    if negative {
        Ok(-((((!valid) & mask) as i32) + 1))
    } else {
        Ok(valid as i32)
    }
}

/// A helper macro to generate an enum from a bitfield.
///
/// Device registers often pack a few distinct values into a small number of
/// bits, making it attractive to represent them in Rust with an enum. This
/// macro generates such an enum along with its mask, a `TryFrom<u8>` which
/// extracts and decodes the field from a full register value, and a
/// `Display` implementation.
///
/// # Example
/// ```ignore
/// /// Suppose bit 0 of a register indicates airflow direction.
/// switch_platform_decode::bitfield_enum! {
///     name = Airflow,
///     description = "The direction of airflow",
///     bits = 0:0,
///     variants = {
///         0b0, Forward, "front-to-back",
///         0b1, Reverse, "back-to-front",
///     },
/// }
/// ```
#[macro_export]
macro_rules! bitfield_enum {
    (
        name = $name:ident,
        description = $docstring:literal,
        bits = $high_bit:literal : $low_bit:literal,
        variants = { $( $bits:literal, $variant:ident, $display:literal $(,)? ),+ }
        $(,)?
    ) => {
        // Sanity checks on the bit ranges.
        static_assertions::const_assert!($high_bit < 8);
        static_assertions::const_assert!($low_bit < 8);
        static_assertions::const_assert!($low_bit <= $high_bit);

        // Every pattern must fit in the field once shifted into place.
        $( static_assertions::const_assert_eq!(
            $name::MASK | ($bits << $low_bit),
            $name::MASK
        ); )+

        impl $name {
            #[allow(dead_code)]
            pub const HIGH_BIT: u8 = $high_bit;
            #[allow(dead_code)]
            pub const LOW_BIT: u8 = $low_bit;
            pub const MASK: u8 = (0xff << $low_bit) & (0xff >> (7 - $high_bit));
        }

        #[doc = $docstring]
        #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
        #[cfg_attr(
            any(feature = "api-traits", test),
            derive(schemars::JsonSchema, serde::Deserialize, serde::Serialize)
        )]
        #[cfg_attr(
            any(feature = "api-traits", test),
            serde(rename_all = "snake_case"),
        )]
        #[cfg_attr(test, derive(strum::EnumIter))]
        pub enum $name {
            $($variant),+
        }

        impl ::core::fmt::Display for $name {
            fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
                use $name::*;
                match self {
                    $( $variant => write!(f, "{}", $display), )+
                }
            }
        }

        impl ::core::convert::TryFrom<u8> for $name {
            type Error = Error;

            fn try_from(x: u8) -> Result<Self, Self::Error> {
                use $name::*;
                #[deny(overlapping_range_endpoints)]
                match (x & Self::MASK) >> $low_bit {
                    $( $bits => Ok($variant), )+
                    _ => Err(Error::InvalidBitField),
                }
            }
        }

        impl ::core::convert::From<$name> for u8 {
            fn from(x: $name) -> u8 {
                use $name::*;
                match x {
                    $( $variant => $bits << $low_bit, )+
                }
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::extract_bit;
    use super::twos_complement;
    use super::with_bit;
    use crate::Error;

    #[test]
    fn test_extract_bit() {
        for shift in 0..8 {
            let expected = 1 << shift;
            assert!(extract_bit(expected, shift).unwrap());
            for other_shift in 0..8 {
                if shift == other_shift {
                    continue;
                }
                assert!(!extract_bit(expected, other_shift).unwrap());
            }
        }

        for shift in 8..=255 {
            assert!(extract_bit(0, shift).is_err());
        }
    }

    #[test]
    fn test_with_bit() {
        assert_eq!(with_bit(0x00, 3, true).unwrap(), 0x08);
        assert_eq!(with_bit(0xff, 3, false).unwrap(), 0xf7);
        assert_eq!(with_bit(0x08, 3, true).unwrap(), 0x08);
        assert_eq!(with_bit(0, 8, true), Err(Error::BitOutOfRange));
    }

    #[test]
    fn test_twos_complement_5_bit() {
        assert_eq!(twos_complement(0b01111, 5).unwrap(), 15);
        assert_eq!(twos_complement(0b10000, 5).unwrap(), -16);
        assert_eq!(twos_complement(0b11111, 5).unwrap(), -1);
        assert_eq!(twos_complement(0b11101, 5).unwrap(), -3);
        assert_eq!(twos_complement(0, 5).unwrap(), 0);

        // Bits above the field are ignored.
        assert_eq!(twos_complement(0xffe0 | 0b00011, 5).unwrap(), 3);
    }

    #[test]
    fn test_twos_complement_11_bit() {
        assert_eq!(twos_complement(0x3ff, 11).unwrap(), 1023);
        assert_eq!(twos_complement(0x400, 11).unwrap(), -1024);
        assert_eq!(twos_complement(0x7ff, 11).unwrap(), -1);
    }

    #[test]
    fn test_twos_complement_matches_sign_extension() {
        for bits in 1..=16u8 {
            for field in [0u16, 1, 0x5555, 0xaaaa, 0x7fff, 0x8000, 0xffff] {
                let shift = 32 - u32::from(bits);
                let expected = ((u32::from(field) << shift) as i32) >> shift;
                assert_eq!(twos_complement(field, bits).unwrap(), expected);
            }
        }
    }

    #[test]
    fn test_twos_complement_invalid_width() {
        assert_eq!(twos_complement(0, 0), Err(Error::InvalidFieldWidth(0)));
        assert_eq!(twos_complement(0, 17), Err(Error::InvalidFieldWidth(17)));
    }
}
