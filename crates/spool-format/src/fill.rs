/// Replacement for bytes that never arrived or are otherwise unknown.
/// Correlators recognise this value and flag the samples invalid.
pub const FILL_PATTERN: u64 = 0x1122_3344_1122_3344;

/// Overwrite `buf` with repetitions of the 64-bit `fill` word
/// (little-endian). A trailing fragment shorter than 8 bytes gets the
/// leading bytes of the word.
pub fn write_fill(buf: &mut [u8], fill: u64) {
    let word = fill.to_le_bytes();
    for chunk in buf.chunks_mut(8) {
        chunk.copy_from_slice(&word[..chunk.len()]);
    }
}

/// Does this region start with the fill-pattern marker? The decompressor
/// uses this to recognise chunks that were synthesised for a lost datagram
/// and must not be fed through the bit-mover.
#[inline]
pub fn is_fill_marked(buf: &[u8]) -> bool {
    buf.len() >= 8 && u64::from_le_bytes(buf[..8].try_into().unwrap()) == FILL_PATTERN
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fill_repeats_the_word() {
        let mut buf = [0u8; 24];
        write_fill(&mut buf, FILL_PATTERN);
        for chunk in buf.chunks(8) {
            assert_eq!(u64::from_le_bytes(chunk.try_into().unwrap()), FILL_PATTERN);
        }
        assert!(is_fill_marked(&buf));
    }

    #[test]
    fn short_tail_gets_word_prefix() {
        let mut buf = [0u8; 11];
        write_fill(&mut buf, 0x0807_0605_0403_0201);
        assert_eq!(&buf[8..], &[0x01, 0x02, 0x03]);
    }
}
