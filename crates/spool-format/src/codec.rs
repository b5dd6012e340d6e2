use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("trackmask keeps no tracks at all")]
    EmptyMask,
    #[error("region of {0} bytes is not a whole number of 64-bit words")]
    RaggedRegion(usize),
}

/// Bit-moving track compressor.
///
/// A 64-bit sample word carries one bit per track; a trackmask selects the
/// tracks worth transporting. Compression packs the selected bits of every
/// word, LSB first, into a contiguous bitstream at the front of the region.
/// Decompression scatters them back to their track positions and leaves the
/// dropped tracks zero - the mover only ever ORs bits into place, which is
/// why the destination must start out zeroed (the udps top half guarantees
/// that for network transfers).
#[derive(Clone, Copy, Debug)]
pub struct Codec {
    mask: u64,
    kept: u32,
}

impl Codec {
    /// Build the move schedule for a trackmask. This is the "solve" step
    /// the supervisor runs off-thread; the result is cheap to copy into
    /// every stage that needs it.
    pub fn solve(mask: u64) -> Result<Self, CodecError> {
        let kept = mask.count_ones();
        if kept == 0 {
            return Err(CodecError::EmptyMask);
        }
        Ok(Codec { mask, kept })
    }

    pub fn mask(&self) -> u64 {
        self.mask
    }

    /// Tracks kept out of 64.
    pub fn kept(&self) -> u32 {
        self.kept
    }

    /// Compressed size of an `n_bytes` input region (whole output words,
    /// zero-padded bitstream tail).
    pub fn compressed_size(&self, n_bytes: usize) -> usize {
        let n_words = n_bytes / 8;
        let kept_bits = n_words * self.kept as usize;
        kept_bits.div_ceil(64) * 8
    }

    /// Pack the selected track bits of `region` in place; returns the
    /// number of meaningful leading bytes ([`compressed_size`]). Bytes past
    /// that are left as they were.
    pub fn compress(&self, region: &mut [u8]) -> Result<usize, CodecError> {
        if region.len() % 8 != 0 {
            return Err(CodecError::RaggedRegion(region.len()));
        }
        if self.kept == 64 {
            return Ok(region.len());
        }
        let n_words = region.len() / 8;
        let mut out = vec![0u64; (n_words * self.kept as usize).div_ceil(64)];
        let mut bitpos = 0usize;
        for w in 0..n_words {
            let word = u64::from_le_bytes(region[w * 8..w * 8 + 8].try_into().unwrap());
            let mut m = self.mask;
            while m != 0 {
                let track = m.trailing_zeros();
                m &= m - 1;
                if (word >> track) & 1 == 1 {
                    out[bitpos / 64] |= 1u64 << (bitpos % 64);
                }
                bitpos += 1;
            }
        }
        for (i, word) in out.iter().enumerate() {
            region[i * 8..i * 8 + 8].copy_from_slice(&word.to_le_bytes());
        }
        Ok(out.len() * 8)
    }

    /// Inverse of [`compress`]: the first `compressed_size(region.len())`
    /// bytes of `region` hold the packed bitstream; rebuild the full-width
    /// words in place, dropped tracks zero.
    pub fn decompress(&self, region: &mut [u8]) -> Result<(), CodecError> {
        if region.len() % 8 != 0 {
            return Err(CodecError::RaggedRegion(region.len()));
        }
        if self.kept == 64 {
            return Ok(());
        }
        let n_words = region.len() / 8;
        let packed_words = (n_words * self.kept as usize).div_ceil(64);
        let packed: Vec<u64> = (0..packed_words)
            .map(|i| u64::from_le_bytes(region[i * 8..i * 8 + 8].try_into().unwrap()))
            .collect();

        let mut bitpos = 0usize;
        for w in 0..n_words {
            let mut word = 0u64;
            let mut m = self.mask;
            while m != 0 {
                let track = m.trailing_zeros();
                m &= m - 1;
                if (packed[bitpos / 64] >> (bitpos % 64)) & 1 == 1 {
                    word |= 1u64 << track;
                }
                bitpos += 1;
            }
            region[w * 8..w * 8 + 8].copy_from_slice(&word.to_le_bytes());
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn patterned(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i as u8).wrapping_mul(37).wrapping_add(11)).collect()
    }

    #[test]
    fn full_mask_is_identity() {
        let codec = Codec::solve(u64::MAX).unwrap();
        let mut region = patterned(256);
        let orig = region.clone();
        let n = codec.compress(&mut region).unwrap();
        assert_eq!(n, 256);
        codec.decompress(&mut region).unwrap();
        assert_eq!(region, orig);
    }

    #[test]
    fn half_mask_roundtrips_kept_tracks() {
        let mask = 0xf0f0_f0f0_f0f0_f0f0u64;
        let codec = Codec::solve(mask).unwrap();
        assert_eq!(codec.kept(), 32);

        let mut region = patterned(512);
        let orig = region.clone();
        let n = codec.compress(&mut region).unwrap();
        assert_eq!(n, codec.compressed_size(512));
        assert_eq!(n, 256);

        codec.decompress(&mut region).unwrap();
        for w in 0..64 {
            let got = u64::from_le_bytes(region[w * 8..w * 8 + 8].try_into().unwrap());
            let want = u64::from_le_bytes(orig[w * 8..w * 8 + 8].try_into().unwrap()) & mask;
            assert_eq!(got, want, "word {w}");
        }
    }

    #[test]
    fn odd_popcount_packs_across_word_boundaries() {
        let mask = 0x0000_0000_0007_ffffu64; // 19 tracks
        let codec = Codec::solve(mask).unwrap();
        let mut region = patterned(64 * 8);
        let orig = region.clone();
        let n = codec.compress(&mut region).unwrap();
        assert_eq!(n, codec.compressed_size(64 * 8));
        assert_eq!(n, (64usize * 19).div_ceil(64) * 8);

        codec.decompress(&mut region).unwrap();
        for w in 0..64 {
            let got = u64::from_le_bytes(region[w * 8..w * 8 + 8].try_into().unwrap());
            let want = u64::from_le_bytes(orig[w * 8..w * 8 + 8].try_into().unwrap()) & mask;
            assert_eq!(got, want);
        }
    }

    #[test]
    fn empty_mask_refused() {
        assert!(Codec::solve(0).is_err());
    }

    #[test]
    fn ragged_region_refused() {
        let codec = Codec::solve(1).unwrap();
        assert!(codec.compress(&mut [0u8; 13]).is_err());
    }
}
