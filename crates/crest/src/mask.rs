//! XOR payload masking per RFC 6455 §5.3.

/// Masks or unmasks a buffer in place with the 4-byte key.
///
/// Octet `i` of the payload is XORed with octet `i mod 4` of the key. XOR
/// is an involution, so the same routine serves both directions. Inbound
/// frames are capped at a few KiB, so the plain loop is not worth
/// vectorising.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    for (byte, key) in buf.iter_mut().zip(mask.iter().cycle()) {
        *byte ^= key;
    }
}
