//! One's-complement byte-sum checksum shared by the encode and decode paths.
//!
//! Every byte is added into a 16-bit accumulator with wraparound and the
//! result is bitwise complemented. This is a link-integrity check, not a CRC:
//! reordering bytes does not change the sum.

/// Checksum over every byte of `bytes`.
#[must_use]
pub fn checksum(bytes: &[u8]) -> u16 {
    !bytes
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)))
}

/// Checks a complete frame whose last two bytes carry the little-endian
/// checksum of everything before them.
///
/// Returns `(computed, embedded)` on mismatch.
pub fn verify_trailing(frame: &[u8]) -> Result<(), (u16, u16)> {
    let Some(split) = frame.len().checked_sub(2) else {
        return Err((checksum(frame), 0));
    };
    let (covered, tail) = frame.split_at(split);
    let embedded = u16::from_le_bytes([tail[0], tail[1]]);
    let computed = checksum(covered);
    if computed == embedded {
        Ok(())
    } else {
        Err((computed, embedded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input_is_all_ones() {
        assert_eq!(checksum(&[]), 0xFFFF);
    }

    #[test]
    fn test_simple_sum_complemented() {
        // 0xAA + 0x56 + 0x01 = 0x0101
        assert_eq!(checksum(&[0xAA, 0x56, 0x01]), !0x0101);
    }

    #[test]
    fn test_accumulator_wraps() {
        // 258 bytes of 0xFF sum to 0xFF * 258 = 0x100FE, truncated to 0x00FE
        let bytes = [0xFFu8; 258];
        assert_eq!(checksum(&bytes), !0x00FE);
    }

    #[test]
    fn test_byte_order_within_pairs_collides() {
        assert_eq!(checksum(&[0x12, 0x34]), checksum(&[0x34, 0x12]));
    }

    #[test]
    fn test_verify_trailing() {
        let mut frame = [0x10u8, 0x20, 0x30, 0, 0];
        let sum = checksum(&frame[..3]).to_le_bytes();
        frame[3] = sum[0];
        frame[4] = sum[1];
        assert!(verify_trailing(&frame).is_ok());

        frame[1] ^= 0x01;
        assert!(verify_trailing(&frame).is_err());
    }

    #[test]
    fn test_verify_trailing_short_frame() {
        assert!(verify_trailing(&[0xAA]).is_err());
    }
}
