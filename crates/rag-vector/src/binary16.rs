//! IEEE 754 binary16 ("half precision") conversion.
//!
//! Knowledge-base vectors are shipped as little-endian binary16 values to
//! halve their on-device footprint. Only [`decode`] is on the query path and
//! it is written out bit by bit; [`encode`] exists for package tooling and
//! test fixtures and goes through the `half` crate.

use half::f16;

const SIGN_MASK: u32 = 0x8000;
const EXP_MASK: u32 = 0x1F;
const MANT_MASK: u32 = 0x3FF;
/// Implicit leading bit of a normalized binary16 mantissa.
const HIDDEN_BIT: u32 = 0x400;
/// `127 - 15`: difference between the binary32 and binary16 exponent biases.
const REBIAS: i32 = 112;

/// Decode a binary16 bit pattern into an `f32`.
///
/// Every binary16 value is exactly representable in binary32, so this is
/// lossless for all finite inputs. NaN payloads are not preserved.
pub fn decode(bits: u16) -> f32 {
    let h = u32::from(bits);
    let sign = (h & SIGN_MASK) >> 15;
    let mut exp = ((h >> 10) & EXP_MASK) as i32;
    let mut mant = h & MANT_MASK;

    if exp == 0 {
        if mant == 0 {
            return f32::from_bits(sign << 31);
        }
        // Subnormal: renormalize so the hidden bit is set.
        while mant & HIDDEN_BIT == 0 {
            mant <<= 1;
            exp -= 1;
        }
        exp += 1;
        mant &= MANT_MASK;
    } else if exp == EXP_MASK as i32 {
        return if mant != 0 {
            f32::NAN
        } else if sign == 0 {
            f32::INFINITY
        } else {
            f32::NEG_INFINITY
        };
    }

    let exp = (exp + REBIAS) as u32;
    f32::from_bits((sign << 31) | (exp << 23) | (mant << 13))
}

/// Encode an `f32` as binary16, rounding to nearest with ties to even.
///
/// Magnitudes above the binary16 range become infinity; magnitudes below half
/// the smallest subnormal become signed zero.
pub fn encode(value: f32) -> u16 {
    f16::from_f32(value).to_bits()
}
